use crate::{
    slice_reader::{SliceHeader, SliceReadError, SliceReader},
    volume::ShapeError,
};

use ndarray::{Array2, Array3, s};
use std::{
    fs,
    path::{Path, PathBuf},
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Read(#[from] SliceReadError),

    #[error("Slices {} and {} share ordinal {ordinal}", first.display(), second.display())]
    DuplicateOrdinal {
        ordinal: f64,
        first: PathBuf,
        second: PathBuf,
    },
}

/// A recognized slice file together with its header.
#[derive(Clone, Debug)]
pub struct SliceEntry {
    pub path: PathBuf,
    pub header: SliceHeader,
}

/// Turns a directory of single-slice files into arrays.
pub struct Converter<'r> {
    reader: &'r dyn SliceReader,
}

impl<'r> Converter<'r> {
    pub fn new(reader: &'r dyn SliceReader) -> Self {
        Self { reader }
    }

    /// Paths of the files in `dir` the reader recognizes, in no particular order.
    pub fn slice_paths(&self, dir: impl AsRef<Path>) -> Result<Vec<PathBuf>, ConvertError> {
        let paths = fs::read_dir(dir.as_ref())?
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| path.is_file() && self.reader.recognizes(path))
            .collect();
        Ok(paths)
    }

    /// List the slices of `dir` sorted by ordinal.
    ///
    /// The order depends only on the slice headers, never on the order the
    /// filesystem returns entries in.
    ///
    /// # Errors
    ///
    /// Returns an error if a header cannot be read or two slices share an
    /// ordinal.
    pub fn list_slices(&self, dir: impl AsRef<Path>) -> Result<Vec<SliceEntry>, ConvertError> {
        let mut entries = self
            .slice_paths(dir)?
            .into_iter()
            .map(|path| {
                let header = self.reader.read_header(&path)?;
                Ok(SliceEntry { path, header })
            })
            .collect::<Result<Vec<_>, ConvertError>>()?;

        entries.sort_by(|a, b| {
            a.header
                .ordinal
                .total_cmp(&b.header.ordinal)
                .then_with(|| a.path.cmp(&b.path))
        });
        Self::validate_ordinals(&entries)?;

        Ok(entries)
    }

    /// Read every recognized slice of `dir` as a 2D array, ordered by ordinal.
    pub fn slices_to_arrays(&self, dir: impl AsRef<Path>) -> Result<Vec<Array2<f32>>, ConvertError> {
        self.list_slices(dir)?
            .iter()
            .map(|entry| Ok(self.reader.read_pixels(&entry.path)?))
            .collect()
    }

    fn validate_ordinals(entries: &[SliceEntry]) -> Result<(), ConvertError> {
        match entries
            .windows(2)
            .find(|pair| pair[0].header.ordinal == pair[1].header.ordinal)
        {
            Some(pair) => Err(ConvertError::DuplicateOrdinal {
                ordinal: pair[0].header.ordinal,
                first: pair[0].path.clone(),
                second: pair[1].path.clone(),
            }),
            None => Ok(()),
        }
    }

    fn validate_dimensions(images: &[Array2<f32>]) -> Result<(usize, usize), ShapeError> {
        let first_dim = images.first().ok_or(ShapeError::Empty)?.dim();
        match images.iter().position(|img| img.dim() != first_dim) {
            Some(index) => Err(ShapeError::Inconsistent {
                expected: first_dim,
                found: images[index].dim(),
                index,
            }),
            None => Ok(first_dim),
        }
    }

    /// Stack ordered slices along a new leading depth axis.
    ///
    /// # Errors
    ///
    /// Returns [`ShapeError`] for an empty input or slices of differing
    /// height/width.
    pub fn stack_to_3d(images: &[Array2<f32>]) -> Result<Array3<f32>, ShapeError> {
        let (height, width) = Self::validate_dimensions(images)?;
        let depth = images.len();
        let mut volume = Array3::<f32>::zeros((depth, height, width));

        for (i, image) in images.iter().enumerate() {
            volume.slice_mut(s![i, .., ..]).assign(image);
        }

        Ok(volume)
    }
}
