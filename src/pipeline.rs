//! Per-patient driver: filter, convert, normalize, resize and persist.
//!
//! Every patient yields a `Result<Sample, ProcessingError>`; one patient's
//! failure never stops the others unless `fail_fast` is set.

use crate::{
    annotation::AnnotationStore,
    config::PreprocessConfig,
    converter::{ConvertError, Converter},
    enums::Modality,
    intensity,
    roi_filter::{FilterError, RoiFilter},
    sample::{Label, Sample},
    slice_reader::SliceReader,
    store::{SampleStore, StoreError},
    volume::{self, ShapeError},
};

use ndarray::{Array2, Array3};
use rayon::prelude::*;
use std::{
    collections::{HashMap, hash_map::Entry},
    fs, io,
    panic::{self, AssertUnwindSafe},
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProcessingError {
    #[error("Patient {patient}: no {modality} slices left after filtering")]
    MissingData { patient: String, modality: Modality },

    #[error("Patient {patient}: ROI filtering failed: {source}")]
    Filter {
        patient: String,
        source: FilterError,
    },

    #[error("Patient {patient}: could not convert {modality} slices: {source}")]
    Convert {
        patient: String,
        modality: Modality,
        source: ConvertError,
    },

    #[error("Patient {patient}: bad {modality} volume shape: {source}")]
    Shape {
        patient: String,
        modality: Modality,
        source: ShapeError,
    },

    #[error("Patient {patient}: cannot derive a class label")]
    Label { patient: String },

    #[error("Patient {patient}: could not save sample: {source}")]
    Store {
        patient: String,
        source: StoreError,
    },

    #[error(
        "Patient {patient}: {} shares its patient number with {}",
        path.display(),
        first.display()
    )]
    DuplicatePatient {
        patient: String,
        path: PathBuf,
        first: PathBuf,
    },

    #[error("Patient {patient}: processing panicked: {message}")]
    Panicked { patient: String, message: String },
}

impl ProcessingError {
    /// Missing data skips a patient; everything else is a failure.
    pub fn is_skip(&self) -> bool {
        matches!(self, ProcessingError::MissingData { .. })
    }
}

/// A patient directory of the input root.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PatientDir {
    pub patient: String,
    pub path: PathBuf,
}

impl PatientDir {
    /// The patient number is the last `-` separated part of the directory
    /// name, so `Lung_Dx-A0001` becomes `A0001`.
    pub fn from_path(path: impl AsRef<Path>) -> Option<Self> {
        let path = path.as_ref();
        let name = path.file_name()?.to_str()?;
        let patient = name.rsplit('-').next().filter(|p| !p.is_empty())?;
        Some(Self {
            patient: patient.to_owned(),
            path: path.to_owned(),
        })
    }
}

/// Patient subdirectories of `input_root`, sorted by path.
pub fn discover_patients(input_root: impl AsRef<Path>) -> io::Result<Vec<PatientDir>> {
    let mut patients: Vec<PatientDir> = fs::read_dir(input_root.as_ref())?
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .filter_map(PatientDir::from_path)
        .collect();
    patients.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(patients)
}

/// Outcome of a preprocessing run.
#[derive(Debug, Default)]
pub struct RunReport {
    pub processed: Vec<String>,
    pub skipped: Vec<ProcessingError>,
    pub failed: Vec<ProcessingError>,
    /// Patients never started because the run was cancelled.
    pub cancelled: Vec<String>,
}

impl RunReport {
    fn record(&mut self, patient: &str, result: Option<Result<Sample, ProcessingError>>) {
        match result {
            Some(Ok(_)) => self.processed.push(patient.to_owned()),
            Some(Err(e)) if e.is_skip() => self.skipped.push(e),
            Some(Err(e)) => self.failed.push(e),
            None => self.cancelled.push(patient.to_owned()),
        }
    }
}

pub struct Pipeline<'a> {
    config: &'a PreprocessConfig,
    reader: Box<dyn SliceReader>,
    annotations: &'a dyn AnnotationStore,
    store: SampleStore,
    cancel: Arc<AtomicBool>,
}

impl<'a> Pipeline<'a> {
    pub fn new(
        config: &'a PreprocessConfig,
        annotations: &'a dyn AnnotationStore,
        store: SampleStore,
    ) -> Self {
        Self {
            config,
            reader: config.slice_reader(),
            annotations,
            store,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag that stops the run before the next patient starts.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub fn store(&self) -> &SampleStore {
        &self.store
    }

    /// Run every patient through the pipeline.
    ///
    /// The patient number is the sample id, so a directory whose number was
    /// already claimed by an earlier directory fails without being processed.
    pub fn run(&self, patients: &[PatientDir]) -> RunReport {
        let claimed_by = Self::claimed_patient_numbers(patients);
        let results = if self.config.jobs > 1 {
            match rayon::ThreadPoolBuilder::new()
                .num_threads(self.config.jobs)
                .build()
            {
                Ok(pool) => pool.install(|| {
                    patients
                        .par_iter()
                        .zip(claimed_by.par_iter())
                        .map(|(patient, first)| self.guarded(patient, *first))
                        .collect()
                }),
                Err(e) => {
                    log::warn!("Could not start {} workers ({e}), running sequentially", self.config.jobs);
                    self.run_sequential(patients, &claimed_by)
                }
            }
        } else {
            self.run_sequential(patients, &claimed_by)
        };

        let mut report = RunReport::default();
        for (patient, result) in patients.iter().zip(results) {
            report.record(&patient.patient, result);
        }
        log::info!(
            "Preprocessing finished: {} processed, {} skipped, {} failed, {} cancelled",
            report.processed.len(),
            report.skipped.len(),
            report.failed.len(),
            report.cancelled.len()
        );
        report
    }

    fn run_sequential(
        &self,
        patients: &[PatientDir],
        claimed_by: &[Option<&Path>],
    ) -> Vec<Option<Result<Sample, ProcessingError>>> {
        patients
            .iter()
            .zip(claimed_by)
            .map(|(patient, first)| self.guarded(patient, *first))
            .collect()
    }

    /// For every patient, the earlier directory with the same patient number,
    /// if any.
    fn claimed_patient_numbers(patients: &[PatientDir]) -> Vec<Option<&Path>> {
        let mut first_seen: HashMap<&str, &Path> = HashMap::new();
        patients
            .iter()
            .map(|patient| match first_seen.entry(patient.patient.as_str()) {
                Entry::Occupied(entry) => Some(*entry.get()),
                Entry::Vacant(entry) => {
                    entry.insert(patient.path.as_path());
                    None
                }
            })
            .collect()
    }

    /// Process one patient unless cancelled, containing panics at the
    /// patient boundary.
    fn guarded(
        &self,
        patient: &PatientDir,
        claimed_by: Option<&Path>,
    ) -> Option<Result<Sample, ProcessingError>> {
        if self.cancel.load(Ordering::Relaxed) {
            return None;
        }
        let result = match claimed_by {
            Some(first) => Err(ProcessingError::DuplicatePatient {
                patient: patient.patient.clone(),
                path: patient.path.clone(),
                first: first.to_owned(),
            }),
            None => self.contained(patient),
        };

        match &result {
            Ok(_) => {}
            Err(e) if e.is_skip() => log::info!("Skipping: {e}"),
            Err(e) => {
                log::error!("{e}");
                if self.config.fail_fast {
                    self.cancel.store(true, Ordering::Relaxed);
                }
            }
        }
        Some(result)
    }

    fn contained(&self, patient: &PatientDir) -> Result<Sample, ProcessingError> {
        panic::catch_unwind(AssertUnwindSafe(|| self.process_patient(patient)))
            .unwrap_or_else(|payload| {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_owned())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_owned());
                Err(ProcessingError::Panicked {
                    patient: patient.patient.clone(),
                    message,
                })
            })
    }

    /// Filter, convert, normalize, resize and persist one patient.
    pub fn process_patient(&self, patient: &PatientDir) -> Result<Sample, ProcessingError> {
        let id = patient.patient.as_str();
        log::info!("=====< Preprocessing patient {id} >=====");

        let outcome = RoiFilter::new(self.reader.as_ref(), self.config.filter_mode)
            .filter_patient(id, &patient.path, self.annotations)
            .map_err(|source| ProcessingError::Filter {
                patient: id.to_owned(),
                source,
            })?;

        for modality in Modality::ALL {
            if outcome.counts(modality).kept == 0 {
                return Err(ProcessingError::MissingData {
                    patient: id.to_owned(),
                    modality,
                });
            }
        }

        let label = Label::from_patient(id, self.config.label_prefix_len).ok_or_else(|| {
            ProcessingError::Label {
                patient: id.to_owned(),
            }
        })?;
        let ct = self.build_volume(patient, Modality::Ct)?;
        let pet = self.build_volume(patient, Modality::Pet)?;

        let sample = Sample {
            id: id.to_owned(),
            ct,
            pet,
            label,
            synthetic: false,
        };
        self.store
            .save(&sample)
            .map_err(|source| ProcessingError::Store {
                patient: id.to_owned(),
                source,
            })?;
        log::info!(
            "Processed patient {id}: label {}, CT {:?}, PET {:?}",
            sample.label,
            sample.ct.dim(),
            sample.pet.dim()
        );
        Ok(sample)
    }

    fn build_volume(
        &self,
        patient: &PatientDir,
        modality: Modality,
    ) -> Result<Array3<f32>, ProcessingError> {
        let id = &patient.patient;
        let shape_error = |source| ProcessingError::Shape {
            patient: id.clone(),
            modality,
            source,
        };

        let dir = patient.path.join(modality.dir_name());
        let slices = Converter::new(self.reader.as_ref())
            .slices_to_arrays(&dir)
            .map_err(|source| ProcessingError::Convert {
                patient: id.clone(),
                modality,
                source,
            })?;
        if slices.is_empty() {
            return Err(ProcessingError::MissingData {
                patient: id.clone(),
                modality,
            });
        }

        let rule = self.config.normalization(modality);
        let normalized: Vec<Array2<f32>> = slices
            .iter()
            .map(|slice| intensity::normalize(slice, rule))
            .collect();
        let stacked = Converter::stack_to_3d(&normalized).map_err(shape_error)?;
        log::debug!("Patient {id}: {modality} volume {:?}", stacked.dim());

        volume::resize_depth(&stacked, self.config.target_depth, self.config.interpolation)
            .map_err(shape_error)
    }
}
