use crate::{
    enums::{DepthInterpolation, FilterMode, Modality, SliceFormat, SortBy, SourceSelection},
    intensity::Normalization,
    slice_reader::{DicomSliceReader, NpySliceReader, SliceReader},
};

use thiserror::Error;

/// Depth every persisted volume is resized to.
pub const DEFAULT_TARGET_DEPTH: usize = 32;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("Target depth must be at least 1")]
    ZeroTargetDepth,

    #[error("Number of jobs must be at least 1")]
    ZeroJobs,

    #[error("Invalid CT window: width {0} must be positive and finite")]
    CtWindow(f32),

    #[error("Invalid PET percentiles {0}..{1}: expected 0 <= lower < upper <= 100")]
    PetPercentiles(f32, f32),

    #[error("Intensity jitter {0} must lie in [0, 1)")]
    Jitter(f32),

    #[error("Noise sigma {0} must be non-negative and finite")]
    NoiseSigma(f32),

    #[error("Flip probability {0} must lie in [0, 1]")]
    FlipProbability(f64),
}

/// Settings of the per-patient preprocessing stages.
#[derive(Clone, Debug, PartialEq)]
pub struct PreprocessConfig {
    pub target_depth: usize,
    pub slice_format: SliceFormat,
    pub sort_by: SortBy,
    pub filter_mode: FilterMode,
    pub interpolation: DepthInterpolation,
    pub ct_normalization: Normalization,
    pub pet_normalization: Normalization,
    /// Number of leading patient-number characters forming the class label.
    pub label_prefix_len: usize,
    /// Patients processed concurrently; 1 keeps the run sequential.
    pub jobs: usize,
    /// Stop at the first failed patient instead of continuing.
    pub fail_fast: bool,
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            target_depth: DEFAULT_TARGET_DEPTH,
            slice_format: SliceFormat::default(),
            sort_by: SortBy::default(),
            filter_mode: FilterMode::default(),
            interpolation: DepthInterpolation::default(),
            ct_normalization: Normalization::default_for(Modality::Ct),
            pet_normalization: Normalization::default_for(Modality::Pet),
            label_prefix_len: 1,
            jobs: 1,
            fail_fast: false,
        }
    }
}

impl PreprocessConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.target_depth == 0 {
            return Err(ConfigError::ZeroTargetDepth);
        }
        if self.jobs == 0 {
            return Err(ConfigError::ZeroJobs);
        }
        for rule in [self.ct_normalization, self.pet_normalization] {
            match rule {
                Normalization::Ct { width, .. } if !(width.is_finite() && width > 0.0) => {
                    return Err(ConfigError::CtWindow(width));
                }
                Normalization::Pet {
                    lower_percentile: lo,
                    upper_percentile: hi,
                } if !(0.0 <= lo && lo < hi && hi <= 100.0) => {
                    return Err(ConfigError::PetPercentiles(lo, hi));
                }
                _ => {}
            }
        }
        Ok(())
    }

    pub fn normalization(&self, modality: Modality) -> &Normalization {
        match modality {
            Modality::Ct => &self.ct_normalization,
            Modality::Pet => &self.pet_normalization,
        }
    }

    pub fn slice_reader(&self) -> Box<dyn SliceReader> {
        match self.slice_format {
            SliceFormat::Dicom => Box::new(DicomSliceReader::new(self.sort_by)),
            SliceFormat::Npy => Box::new(NpySliceReader),
        }
    }
}

/// Settings of the class-balancing stage.
#[derive(Clone, Debug, PartialEq)]
pub struct AugmentConfig {
    pub seed: u64,
    pub selection: SourceSelection,
    pub flip_probability: f64,
    /// Also rotate by multiples of 90 degrees when slices are square.
    pub rotate: bool,
    /// Half-width of the multiplicative and additive intensity jitter.
    pub intensity_jitter: f32,
    /// Standard deviation of the additive Gaussian noise.
    pub noise_sigma: f32,
}

impl Default for AugmentConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            selection: SourceSelection::default(),
            flip_probability: 0.5,
            rotate: true,
            intensity_jitter: 0.05,
            noise_sigma: 0.01,
        }
    }
}

impl AugmentConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..1.0).contains(&self.intensity_jitter) {
            return Err(ConfigError::Jitter(self.intensity_jitter));
        }
        if !(self.noise_sigma.is_finite() && self.noise_sigma >= 0.0) {
            return Err(ConfigError::NoiseSigma(self.noise_sigma));
        }
        if !(0.0..=1.0).contains(&self.flip_probability) {
            return Err(ConfigError::FlipProbability(self.flip_probability));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert_eq!(PreprocessConfig::default().validate(), Ok(()));
        assert_eq!(AugmentConfig::default().validate(), Ok(()));
        assert_eq!(PreprocessConfig::default().target_depth, 32);
    }

    #[test]
    fn invalid_settings_are_rejected() {
        let config = PreprocessConfig {
            target_depth: 0,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::ZeroTargetDepth));

        let config = PreprocessConfig {
            pet_normalization: Normalization::Pet {
                lower_percentile: 90.0,
                upper_percentile: 10.0,
            },
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::PetPercentiles(90.0, 10.0)));

        let config = AugmentConfig {
            noise_sigma: -1.0,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::NoiseSigma(-1.0)));
    }
}
