//! Removes slices outside the annotated region of interest.
//!
//! Filtering works on slice files in place and must run before conversion.

use crate::{
    annotation::{Annotation, AnnotationError, AnnotationStore},
    converter::{ConvertError, Converter, SliceEntry},
    enums::{FilterMode, Modality},
    slice_reader::SliceReader,
};

use std::{
    fs, io,
    path::{Path, PathBuf},
};
use thiserror::Error;

/// Name of the subdirectory quarantined slices are moved into.
pub const EXCLUDED_DIR: &str = ".excluded";

#[derive(Debug, Error)]
pub enum FilterError {
    #[error("Could not list {modality} slices: {source}")]
    List {
        modality: Modality,
        source: ConvertError,
    },

    #[error("Could not exclude {}: {source}", path.display())]
    Exclude { path: PathBuf, source: io::Error },
}

/// Inclusive range of slice positions inside the region of interest.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RoiBounds {
    pub first: usize,
    pub last: usize,
}

impl RoiBounds {
    pub fn contains(&self, position: usize) -> bool {
        (self.first..=self.last).contains(&position)
    }
}

/// Why filtering did or did not narrow the slice set.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RoiDecision {
    NoAnnotation,
    EmptyAnnotation,
    /// Annotation present but unusable; filtering fell back to a no-op.
    Unresolved(String),
    Bounds(RoiBounds),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SliceCounts {
    pub kept: usize,
    pub removed: usize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FilterOutcome {
    pub decision: RoiDecision,
    pub ct: SliceCounts,
    pub pet: SliceCounts,
}

impl FilterOutcome {
    pub fn counts(&self, modality: Modality) -> SliceCounts {
        match modality {
            Modality::Ct => self.ct,
            Modality::Pet => self.pet,
        }
    }
}

pub struct RoiFilter<'r> {
    converter: Converter<'r>,
    mode: FilterMode,
}

impl<'r> RoiFilter<'r> {
    pub fn new(reader: &'r dyn SliceReader, mode: FilterMode) -> Self {
        Self {
            converter: Converter::new(reader),
            mode,
        }
    }

    /// Positions in the ordered CT listing spanned by the annotated slices.
    pub fn resolve_bounds(annotation: &Annotation, ct_slices: &[SliceEntry]) -> Option<RoiBounds> {
        let mut positions = ct_slices
            .iter()
            .enumerate()
            .filter(|(_, entry)| annotation.contains(&entry.header.key))
            .map(|(position, _)| position);
        let first = positions.next()?;
        let last = positions.last().unwrap_or(first);
        Some(RoiBounds { first, last })
    }

    fn list(&self, dir: &Path, modality: Modality) -> Result<Vec<SliceEntry>, FilterError> {
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        self.converter
            .list_slices(dir)
            .map_err(|source| FilterError::List { modality, source })
    }

    /// Filter the `CT` and `PET` directories of `patient_dir`.
    ///
    /// The same positional bounds, derived from the CT listing, are applied to
    /// both modalities. A missing, empty or unresolvable annotation leaves
    /// every slice in place. A missing modality directory counts as empty.
    pub fn filter_patient(
        &self,
        patient: &str,
        patient_dir: &Path,
        annotations: &dyn AnnotationStore,
    ) -> Result<FilterOutcome, FilterError> {
        let ct_dir = patient_dir.join(Modality::Ct.dir_name());
        let pet_dir = patient_dir.join(Modality::Pet.dir_name());
        let ct_slices = self.list(&ct_dir, Modality::Ct)?;
        let pet_slices = self.list(&pet_dir, Modality::Pet)?;

        let decision = match annotations.annotation(patient) {
            Ok(None) => RoiDecision::NoAnnotation,
            Ok(Some(annotation)) if annotation.is_empty() => RoiDecision::EmptyAnnotation,
            Ok(Some(annotation)) => match Self::resolve_bounds(&annotation, &ct_slices) {
                Some(bounds) => RoiDecision::Bounds(bounds),
                None => RoiDecision::Unresolved(
                    AnnotationError::Unresolved {
                        patient: patient.to_owned(),
                    }
                    .to_string(),
                ),
            },
            Err(e) => RoiDecision::Unresolved(e.to_string()),
        };

        let bounds = match &decision {
            RoiDecision::Bounds(bounds) => *bounds,
            RoiDecision::NoAnnotation | RoiDecision::EmptyAnnotation => {
                log::info!("Patient {patient}: no annotation, keeping all slices");
                return Ok(Self::unfiltered(decision, &ct_slices, &pet_slices));
            }
            RoiDecision::Unresolved(reason) => {
                log::warn!("Patient {patient}: {reason}; keeping all slices");
                return Ok(Self::unfiltered(decision, &ct_slices, &pet_slices));
            }
        };

        let ct = self.exclude_outside(&ct_slices, bounds)?;
        let pet = self.exclude_outside(&pet_slices, bounds)?;
        log::info!(
            "Patient {patient}: ROI slices {}..={}, CT kept {} removed {}, PET kept {} removed {}",
            bounds.first,
            bounds.last,
            ct.kept,
            ct.removed,
            pet.kept,
            pet.removed
        );

        Ok(FilterOutcome { decision, ct, pet })
    }

    fn unfiltered(decision: RoiDecision, ct: &[SliceEntry], pet: &[SliceEntry]) -> FilterOutcome {
        FilterOutcome {
            decision,
            ct: SliceCounts {
                kept: ct.len(),
                removed: 0,
            },
            pet: SliceCounts {
                kept: pet.len(),
                removed: 0,
            },
        }
    }

    fn exclude_outside(
        &self,
        slices: &[SliceEntry],
        bounds: RoiBounds,
    ) -> Result<SliceCounts, FilterError> {
        let mut counts = SliceCounts::default();
        for (position, entry) in slices.iter().enumerate() {
            if bounds.contains(position) {
                counts.kept += 1;
            } else {
                self.exclude(&entry.path)
                    .map_err(|source| FilterError::Exclude {
                        path: entry.path.clone(),
                        source,
                    })?;
                counts.removed += 1;
            }
        }
        Ok(counts)
    }

    fn exclude(&self, path: &Path) -> io::Result<()> {
        match self.mode {
            FilterMode::Delete => fs::remove_file(path),
            FilterMode::Quarantine => {
                let (Some(parent), Some(name)) = (path.parent(), path.file_name()) else {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        "slice path has no parent directory",
                    ));
                };
                let excluded = parent.join(EXCLUDED_DIR);
                fs::create_dir_all(&excluded)?;
                fs::rename(path, excluded.join(name))
            }
        }
    }
}
