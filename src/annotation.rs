use std::{
    collections::BTreeSet,
    fs, io,
    path::{Path, PathBuf},
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AnnotationError {
    #[error("IO error reading annotations of patient {patient}: {source}")]
    Io { patient: String, source: io::Error },

    #[error("No annotated slice of patient {patient} matches its CT series")]
    Unresolved { patient: String },
}

/// Slices annotated as inside the region of interest, by slice key.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Annotation {
    pub slice_keys: BTreeSet<String>,
}

impl Annotation {
    pub fn new<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            slice_keys: keys.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.slice_keys.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.slice_keys.contains(key)
    }
}

/// Source of per-patient annotations.
pub trait AnnotationStore: Sync {
    /// `Ok(None)` when the patient has no annotation record at all.
    fn annotation(&self, patient: &str) -> Result<Option<Annotation>, AnnotationError>;
}

/// Annotations laid out as `<root>/<patient>/<slice key>.<ext>`, one file per
/// annotated slice (bounding-box XML files named by SOP Instance UID, for
/// example). Only file stems are used.
#[derive(Clone, Debug)]
pub struct DirectoryAnnotations {
    root: PathBuf,
}

impl DirectoryAnnotations {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_owned(),
        }
    }
}

impl AnnotationStore for DirectoryAnnotations {
    fn annotation(&self, patient: &str) -> Result<Option<Annotation>, AnnotationError> {
        let dir = self.root.join(patient);
        if !dir.is_dir() {
            return Ok(None);
        }
        let io_error = |source| AnnotationError::Io {
            patient: patient.to_owned(),
            source,
        };
        let keys = fs::read_dir(&dir)
            .map_err(io_error)?
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| path.is_file())
            .filter_map(|path| path.file_stem()?.to_str().map(str::to_owned));
        Ok(Some(Annotation::new(keys)))
    }
}
