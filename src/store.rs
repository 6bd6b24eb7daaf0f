use crate::sample::{Label, Sample};

use ndarray::{Array1, Array3, Ix1, Ix3, OwnedRepr};
use ndarray_npy::{NpzReader, NpzWriter, ReadNpzError, WriteNpzError};
use std::{
    fs::{self, File},
    path::{Path, PathBuf},
};
use thiserror::Error;

const CT: &str = "ct";
const PET: &str = "pet";
const LABEL: &str = "label";
const SYNTHETIC: &str = "synthetic";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Could not read sample {id}: {source}")]
    Read { id: String, source: ReadNpzError },

    #[error("Could not write sample {id}: {source}")]
    Write { id: String, source: WriteNpzError },

    #[error("Sample {id} is malformed: {reason}")]
    Malformed { id: String, reason: String },

    #[error("Sample {0} already exists")]
    Exists(String),
}

/// Directory of `<id>.npz` samples.
///
/// Every archive holds `ct` and `pet` (3D `f32`), `label` (UTF-8 bytes) and
/// `synthetic` (a single `u8` flag).
#[derive(Clone, Debug)]
pub struct SampleStore {
    root: PathBuf,
}

impl SampleStore {
    /// Open the store at `root`, creating the directory if needed.
    pub fn open(root: impl AsRef<Path>) -> Result<Self, StoreError> {
        let root = root.as_ref().to_owned();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_of(&self, id: &str) -> PathBuf {
        self.root.join(format!("{id}.npz"))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.path_of(id).is_file()
    }

    /// Ids of all stored samples, sorted.
    pub fn ids(&self) -> Result<Vec<String>, StoreError> {
        let mut ids: Vec<String> = fs::read_dir(&self.root)?
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| {
                path.is_file()
                    && path
                        .extension()
                        .and_then(|s| s.to_str())
                        .is_some_and(|ext| ext.eq_ignore_ascii_case("npz"))
            })
            .filter_map(|path| path.file_stem()?.to_str().map(str::to_owned))
            .collect();
        ids.sort();
        Ok(ids)
    }

    /// Write `sample`, replacing any sample with the same id.
    ///
    /// The archive is written under a temporary name and renamed into place,
    /// so readers never observe a partially written sample.
    pub fn save(&self, sample: &Sample) -> Result<PathBuf, StoreError> {
        let path = self.path_of(&sample.id);
        let tmp = self.root.join(format!(".{}.npz.partial", sample.id));
        if let Err(e) = self.write_archive(&tmp, sample) {
            let _ = fs::remove_file(&tmp);
            return Err(e);
        }
        fs::rename(&tmp, &path)?;
        log::debug!("Saved sample {} to {}", sample.id, path.display());
        Ok(path)
    }

    /// Like [`SampleStore::save`] but refuses to replace an existing sample.
    pub fn insert_new(&self, sample: &Sample) -> Result<PathBuf, StoreError> {
        if self.contains(&sample.id) {
            return Err(StoreError::Exists(sample.id.clone()));
        }
        self.save(sample)
    }

    fn write_archive(&self, path: &Path, sample: &Sample) -> Result<(), StoreError> {
        let write_error = |source| StoreError::Write {
            id: sample.id.clone(),
            source,
        };
        let label = Array1::from(sample.label.as_str().as_bytes().to_vec());
        let synthetic = Array1::from(vec![u8::from(sample.synthetic)]);

        let mut npz = NpzWriter::new(File::create(path)?);
        npz.add_array(CT, &sample.ct).map_err(write_error)?;
        npz.add_array(PET, &sample.pet).map_err(write_error)?;
        npz.add_array(LABEL, &label).map_err(write_error)?;
        npz.add_array(SYNTHETIC, &synthetic).map_err(write_error)?;
        npz.finish().map_err(write_error)?;
        Ok(())
    }

    fn reader(&self, id: &str) -> Result<NpzReader<File>, StoreError> {
        NpzReader::new(File::open(self.path_of(id))?).map_err(|source| StoreError::Read {
            id: id.to_owned(),
            source,
        })
    }

    /// Label and synthetic flag of a sample, without reading its volumes.
    pub fn load_meta(&self, id: &str) -> Result<(Label, bool), StoreError> {
        let mut npz = self.reader(id)?;
        Self::read_meta(id, &mut npz)
    }

    pub fn load(&self, id: &str) -> Result<Sample, StoreError> {
        let mut npz = self.reader(id)?;
        let (label, synthetic) = Self::read_meta(id, &mut npz)?;
        let read_error = |source| StoreError::Read {
            id: id.to_owned(),
            source,
        };
        let ct: Array3<f32> = npz
            .by_name::<OwnedRepr<f32>, Ix3>(CT)
            .map_err(read_error)?;
        let pet: Array3<f32> = npz
            .by_name::<OwnedRepr<f32>, Ix3>(PET)
            .map_err(read_error)?;

        Ok(Sample {
            id: id.to_owned(),
            ct,
            pet,
            label,
            synthetic,
        })
    }

    fn read_meta(id: &str, npz: &mut NpzReader<File>) -> Result<(Label, bool), StoreError> {
        let read_error = |source| StoreError::Read {
            id: id.to_owned(),
            source,
        };
        let label_bytes = npz
            .by_name::<OwnedRepr<u8>, Ix1>(LABEL)
            .map_err(read_error)?;
        let label = String::from_utf8(label_bytes.to_vec()).map_err(|e| StoreError::Malformed {
            id: id.to_owned(),
            reason: format!("label is not UTF-8: {e}"),
        })?;
        if label.is_empty() {
            return Err(StoreError::Malformed {
                id: id.to_owned(),
                reason: "empty label".to_owned(),
            });
        }
        let synthetic = npz
            .by_name::<OwnedRepr<u8>, Ix1>(SYNTHETIC)
            .map_err(read_error)?;
        Ok((Label::new(label), synthetic.iter().any(|&flag| flag != 0)))
    }
}
