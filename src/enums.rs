use std::fmt;

use clap::ValueEnum;

/// Imaging modality of a slice directory.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Modality {
    Ct,
    Pet,
}

impl Modality {
    pub const ALL: [Modality; 2] = [Modality::Ct, Modality::Pet];

    /// Name of the modality subdirectory inside a patient directory.
    pub fn dir_name(self) -> &'static str {
        match self {
            Modality::Ct => "CT",
            Modality::Pet => "PET",
        }
    }
}

impl fmt::Display for Modality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// Attribute a DICOM slice is ordered by.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum SortBy {
    #[default]
    InstanceNumber,
    ImagePositionPatient,
    SliceLocation,
}

/// On-disk format of the slice files.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum SliceFormat {
    #[default]
    Dicom,
    Npy,
}

/// How the ROI filter disposes of slices outside the region of interest.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum FilterMode {
    #[default]
    Delete,
    /// Move excluded slices into a `.excluded` subdirectory.
    Quarantine,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum DepthInterpolation {
    #[default]
    Linear,
    Nearest,
}

/// How the augmentor picks the real sample a synthetic one is derived from.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum SourceSelection {
    #[default]
    Cyclic,
    Random,
}
