use crate::enums::SortBy;

use dicom::{
    object::{DefaultDicomObject, open_file},
    pixeldata::{ConvertOptions, PixelDecoder, VoiLutOption},
};
use dicom_dictionary_std::tags;
use ndarray::{Array2, s};
use std::fmt::Display;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SliceReadError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Could not open DICOM file {}: {message}", path.display())]
    Dicom { path: PathBuf, message: String },

    #[error("Could not decode pixel data of {}: {message}", path.display())]
    PixelData { path: PathBuf, message: String },

    #[error("{} has no usable {attribute}", path.display())]
    MissingAttribute {
        path: PathBuf,
        attribute: &'static str,
    },

    #[error("NPY error in {}: {source}", path.display())]
    Npy {
        path: PathBuf,
        source: ndarray_npy::ReadNpyError,
    },

    #[error("No slice ordinal in file name {}", .0.display())]
    UnparsableOrdinal(PathBuf),
}

/// Ordering and identity of a slice, read without decoding its pixels.
#[derive(Clone, Debug, PartialEq)]
pub struct SliceHeader {
    pub ordinal: f64,
    /// Identifier annotations refer to (SOP Instance UID for DICOM).
    pub key: String,
}

/// Decodes single-slice image files.
pub trait SliceReader: Sync {
    /// Whether `path` is a file this reader handles.
    fn recognizes(&self, path: &Path) -> bool;

    fn read_header(&self, path: &Path) -> Result<SliceHeader, SliceReadError>;

    fn read_pixels(&self, path: &Path) -> Result<Array2<f32>, SliceReadError>;
}

fn has_extension(path: &Path, wanted: &str) -> bool {
    path.extension()
        .and_then(|s| s.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case(wanted))
}

fn pixel_error<E: Display>(path: &Path) -> impl FnOnce(E) -> SliceReadError + '_ {
    move |e| SliceReadError::PixelData {
        path: path.to_owned(),
        message: e.to_string(),
    }
}

/// Reads `.dcm` files with the dicom-rs stack.
#[derive(Clone, Copy, Debug, Default)]
pub struct DicomSliceReader {
    pub sort_by: SortBy,
}

impl DicomSliceReader {
    pub fn new(sort_by: SortBy) -> Self {
        Self { sort_by }
    }

    fn open(path: &Path) -> Result<DefaultDicomObject, SliceReadError> {
        open_file(path).map_err(|e| SliceReadError::Dicom {
            path: path.to_owned(),
            message: e.to_string(),
        })
    }

    fn ordinal(&self, dicom_object: &DefaultDicomObject) -> Option<f64> {
        match self.sort_by {
            SortBy::InstanceNumber => dicom_object
                .element(tags::INSTANCE_NUMBER)
                .ok()?
                .to_int::<i32>()
                .ok()
                .map(f64::from),
            SortBy::ImagePositionPatient => {
                let pos = dicom_object
                    .element(tags::IMAGE_POSITION_PATIENT)
                    .ok()?
                    .to_multi_float64()
                    .ok()?;
                pos.get(2).copied()
            }
            SortBy::SliceLocation => dicom_object
                .element(tags::SLICE_LOCATION)
                .ok()?
                .to_float64()
                .ok(),
        }
    }

    fn attribute_name(&self) -> &'static str {
        match self.sort_by {
            SortBy::InstanceNumber => "InstanceNumber",
            SortBy::ImagePositionPatient => "ImagePositionPatient",
            SortBy::SliceLocation => "SliceLocation",
        }
    }
}

impl SliceReader for DicomSliceReader {
    fn recognizes(&self, path: &Path) -> bool {
        has_extension(path, "dcm")
    }

    fn read_header(&self, path: &Path) -> Result<SliceHeader, SliceReadError> {
        let dicom_object = Self::open(path)?;
        let ordinal = self
            .ordinal(&dicom_object)
            .ok_or_else(|| SliceReadError::MissingAttribute {
                path: path.to_owned(),
                attribute: self.attribute_name(),
            })?;
        let key = dicom_object
            .element(tags::SOP_INSTANCE_UID)
            .ok()
            .and_then(|element| element.to_str().ok())
            .map(|uid| uid.trim_end_matches(['\0', ' ']).to_owned())
            .ok_or_else(|| SliceReadError::MissingAttribute {
                path: path.to_owned(),
                attribute: "SOPInstanceUID",
            })?;
        Ok(SliceHeader { ordinal, key })
    }

    /// Decodes the first frame with the modality LUT applied, so CT samples
    /// come out in Hounsfield units.
    fn read_pixels(&self, path: &Path) -> Result<Array2<f32>, SliceReadError> {
        let dicom_object = Self::open(path)?;
        let pixel_data = dicom_object
            .decode_pixel_data()
            .map_err(pixel_error(path))?;
        let options = ConvertOptions::new().with_voi_lut(VoiLutOption::Identity);
        let frames = pixel_data
            .to_ndarray_with_options::<f32>(&options)
            .map_err(pixel_error(path))?;
        Ok(frames.slice_move(s![0, .., .., 0]))
    }
}

/// Reads pre-extracted 2D `f32` slices stored as `.npy` files.
///
/// The ordinal is the trailing integer of the file stem, so `slice-012.npy`
/// sorts as 12. The stem doubles as the annotation key.
#[derive(Clone, Copy, Debug, Default)]
pub struct NpySliceReader;

impl NpySliceReader {
    fn trailing_number(stem: &str) -> Option<f64> {
        let digits_start = stem
            .char_indices()
            .rev()
            .take_while(|(_, c)| c.is_ascii_digit())
            .last()
            .map(|(i, _)| i)?;
        stem[digits_start..].parse::<u64>().ok().map(|n| n as f64)
    }
}

impl SliceReader for NpySliceReader {
    fn recognizes(&self, path: &Path) -> bool {
        has_extension(path, "npy")
    }

    fn read_header(&self, path: &Path) -> Result<SliceHeader, SliceReadError> {
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| SliceReadError::UnparsableOrdinal(path.to_owned()))?;
        let ordinal = Self::trailing_number(stem)
            .ok_or_else(|| SliceReadError::UnparsableOrdinal(path.to_owned()))?;
        Ok(SliceHeader {
            ordinal,
            key: stem.to_owned(),
        })
    }

    fn read_pixels(&self, path: &Path) -> Result<Array2<f32>, SliceReadError> {
        ndarray_npy::read_npy(path).map_err(|source| SliceReadError::Npy {
            path: path.to_owned(),
            source,
        })
    }
}
