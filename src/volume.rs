use crate::enums::DepthInterpolation;
use crate::interpolator::Interpolator;

use ndarray::{Array3, ArrayView2, Axis};
use thiserror::Error;

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ShapeError {
    #[error("No slices to stack")]
    Empty,

    #[error("Slice {index} has shape {found:?}, expected {expected:?}")]
    Inconsistent {
        expected: (usize, usize),
        found: (usize, usize),
        index: usize,
    },

    #[error("Depth must be at least 1")]
    ZeroDepth,
}

/// Resize `volume` along its depth axis to exactly `target_depth` slices.
///
/// Height and width are left untouched. A volume already at the target depth
/// is returned unchanged.
///
/// # Errors
///
/// Returns [`ShapeError::ZeroDepth`] if the volume or the target has depth 0.
pub fn resize_depth(
    volume: &Array3<f32>,
    target_depth: usize,
    interpolation: DepthInterpolation,
) -> Result<Array3<f32>, ShapeError> {
    let (depth, height, width) = volume.dim();
    if depth == 0 || target_depth == 0 {
        return Err(ShapeError::ZeroDepth);
    }
    if depth == target_depth {
        return Ok(volume.clone());
    }

    let slices: Vec<ArrayView2<'_, f32>> = volume.axis_iter(Axis(0)).collect();
    let mut resized = Array3::<f32>::zeros((target_depth, height, width));
    for (i, mut out) in resized.axis_iter_mut(Axis(0)).enumerate() {
        let position = Interpolator::source_position(i, depth, target_depth);
        out.assign(&Interpolator::sample(&slices, position, interpolation));
    }

    log::trace!("Resized depth {depth} -> {target_depth} ({interpolation:?})");
    Ok(resized)
}
