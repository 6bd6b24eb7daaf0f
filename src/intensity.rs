//! Per-modality intensity normalization into `[0, 1]`.

use crate::enums::Modality;

use ndarray::Array2;

/// Value assigned to every pixel of a slice with no usable dynamic range.
pub const DEGENERATE_VALUE: f32 = 0.5;

/// Windowing rule applied before rescaling to `[0, 1]`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Normalization {
    /// Fixed Hounsfield window centred on `level`.
    Ct { level: f32, width: f32 },
    /// Data-driven clip between two percentiles (0..=100) of the slice.
    Pet {
        lower_percentile: f32,
        upper_percentile: f32,
    },
}

impl Normalization {
    /// Lung window, level -600 HU and width 1500 HU.
    pub const CT_LUNG: Normalization = Normalization::Ct {
        level: -600.0,
        width: 1500.0,
    };

    pub const PET_DEFAULT: Normalization = Normalization::Pet {
        lower_percentile: 0.5,
        upper_percentile: 99.5,
    };

    pub fn default_for(modality: Modality) -> Self {
        match modality {
            Modality::Ct => Self::CT_LUNG,
            Modality::Pet => Self::PET_DEFAULT,
        }
    }

    /// Clip bounds for `slice`, or `None` when the slice has no finite values.
    fn bounds(&self, slice: &Array2<f32>) -> Option<(f32, f32)> {
        match *self {
            Normalization::Ct { level, width } => {
                Some((level - width / 2.0, level + width / 2.0))
            }
            Normalization::Pet {
                lower_percentile,
                upper_percentile,
            } => {
                let mut finite: Vec<f32> = slice.iter().copied().filter(|v| v.is_finite()).collect();
                if finite.is_empty() {
                    return None;
                }
                finite.sort_unstable_by(f32::total_cmp);
                Some((
                    percentile(&finite, lower_percentile),
                    percentile(&finite, upper_percentile),
                ))
            }
        }
    }
}

/// Linear-interpolated percentile of sorted, non-empty `values`.
fn percentile(values: &[f32], pct: f32) -> f32 {
    let rank = (pct.clamp(0.0, 100.0) / 100.0) * (values.len() - 1) as f32;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    let t = rank - lo as f32;
    values[lo] + (values[hi] - values[lo]) * t
}

/// Clip `slice` according to `rule` and rescale into `[0, 1]`.
///
/// Non-finite samples become 0. A slice whose clip range collapses (for
/// example a constant slice under the PET rule) maps to [`DEGENERATE_VALUE`].
pub fn normalize(slice: &Array2<f32>, rule: &Normalization) -> Array2<f32> {
    let Some((lower, upper)) = rule.bounds(slice) else {
        return Array2::from_elem(slice.dim(), DEGENERATE_VALUE);
    };
    let range = upper - lower;
    if !(range.is_finite() && range > 0.0) {
        return Array2::from_elem(slice.dim(), DEGENERATE_VALUE);
    }

    slice.mapv(|v| {
        if v.is_finite() {
            (v.clamp(lower, upper) - lower) / range
        } else {
            0.0
        }
    })
}
