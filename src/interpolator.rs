use ndarray::{Array2, ArrayView2, Zip};

use crate::enums::DepthInterpolation;

pub(crate) struct Interpolator;

impl Interpolator {
    /// Position in the source stack sampled by output slice `index`.
    ///
    /// Endpoints map onto endpoints; a single output slice samples the centre.
    pub(crate) fn source_position(index: usize, depth: usize, target: usize) -> f64 {
        let last = (depth - 1) as f64;
        if target == 1 {
            return last / 2.0;
        }
        (index as f64 * last / (target - 1) as f64).clamp(0.0, last)
    }

    pub(crate) fn sample(
        slices: &[ArrayView2<'_, f32>],
        position: f64,
        interpolation: DepthInterpolation,
    ) -> Array2<f32> {
        let last = slices.len() - 1;
        match interpolation {
            DepthInterpolation::Nearest => slices[(position.round() as usize).min(last)].to_owned(),
            DepthInterpolation::Linear => {
                let z0 = (position.floor() as usize).min(last);
                let z1 = (z0 + 1).min(last);
                let dz = (position - z0 as f64) as f32;
                if z0 == z1 || dz == 0.0 {
                    return slices[z0].to_owned();
                }
                Self::linear_interpolate(&slices[z0], &slices[z1], dz)
            }
        }
    }

    #[inline]
    pub(crate) fn linear_interpolate(
        a: &ArrayView2<'_, f32>,
        b: &ArrayView2<'_, f32>,
        t: f32,
    ) -> Array2<f32> {
        let one_minus_t = 1.0 - t;
        Zip::from(a)
            .and(b)
            .map_collect(|&v0, &v1| v0.mul_add(one_minus_t, v1 * t))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn endpoints_are_preserved() {
        assert_eq!(Interpolator::source_position(0, 100, 32), 0.0);
        assert_eq!(Interpolator::source_position(31, 100, 32), 99.0);
        assert_eq!(Interpolator::source_position(0, 1, 32), 0.0);
        assert_eq!(Interpolator::source_position(31, 1, 32), 0.0);
        assert_eq!(Interpolator::source_position(0, 9, 1), 4.0);
    }

    #[test]
    fn linear_blends_neighbours() {
        let a = array![[0.0f32, 10.0]];
        let b = array![[1.0f32, 20.0]];
        let slices = [a.view(), b.view()];
        let mid = Interpolator::sample(&slices, 0.5, DepthInterpolation::Linear);
        assert_eq!(mid, array![[0.5f32, 15.0]]);
        let near = Interpolator::sample(&slices, 0.6, DepthInterpolation::Nearest);
        assert_eq!(near, b);
    }
}
