use std::{
    fs,
    path::{Path, PathBuf},
    sync::atomic::Ordering,
};

use ndarray::Array2;
use petct_prep::{
    annotation::DirectoryAnnotations,
    augment::{Augmentor, ClassTally},
    config::{AugmentConfig, PreprocessConfig},
    enums::{Modality, SliceFormat},
    pipeline::{Pipeline, ProcessingError, discover_patients},
    sample::Label,
    store::SampleStore,
};
use tempfile::TempDir;

struct Dataset {
    input: TempDir,
    annotations: TempDir,
    output: TempDir,
}

impl Dataset {
    fn new() -> Self {
        Self {
            input: tempfile::tempdir().unwrap(),
            annotations: tempfile::tempdir().unwrap(),
            output: tempfile::tempdir().unwrap(),
        }
    }

    /// Patient `Lung_Dx-<patient>` with `ct` and `pet` slice shapes, one entry
    /// per slice.
    fn patient(&self, patient: &str, ct: &[(usize, usize)], pet: &[(usize, usize)]) -> PathBuf {
        self.patient_dir(&format!("Lung_Dx-{patient}"), ct, pet)
    }

    fn patient_dir(&self, name: &str, ct: &[(usize, usize)], pet: &[(usize, usize)]) -> PathBuf {
        let dir = self.input.path().join(name);
        for (modality, shapes) in [(Modality::Ct, ct), (Modality::Pet, pet)] {
            let modality_dir = dir.join(modality.dir_name());
            fs::create_dir_all(&modality_dir).unwrap();
            for (i, &shape) in shapes.iter().enumerate() {
                let slice = Array2::from_shape_fn(shape, |(y, x)| (i * 7 + y + x) as f32 * 10.0);
                let name = format!("{modality}-{:03}.npy", i + 1);
                ndarray_npy::write_npy(modality_dir.join(name), &slice).unwrap();
            }
        }
        dir
    }

    fn annotate(&self, patient: &str, keys: &[&str]) {
        let dir = self.annotations.path().join(patient);
        fs::create_dir_all(&dir).unwrap();
        for key in keys {
            fs::write(dir.join(format!("{key}.xml")), "<annotation/>").unwrap();
        }
    }

    fn store(&self) -> SampleStore {
        SampleStore::open(self.output.path()).unwrap()
    }
}

fn npy_config() -> PreprocessConfig {
    PreprocessConfig {
        slice_format: SliceFormat::Npy,
        ..Default::default()
    }
}

fn count_files(dir: &Path) -> usize {
    fs::read_dir(dir)
        .unwrap()
        .filter_map(Result::ok)
        .filter(|e| e.path().is_file())
        .count()
}

#[test]
fn volumes_share_target_depth_and_keep_slice_shape() {
    let data = Dataset::new();
    data.patient("A0001", &[(8, 6); 45], &[(4, 4); 12]);
    data.patient("B0001", &[(8, 6); 3], &[(4, 4); 70]);

    let config = npy_config();
    let annotations = DirectoryAnnotations::new(data.annotations.path());
    let patients = discover_patients(data.input.path()).unwrap();
    let report = Pipeline::new(&config, &annotations, data.store()).run(&patients);

    assert_eq!(report.processed, vec!["A0001".to_owned(), "B0001".to_owned()]);
    assert!(report.failed.is_empty() && report.skipped.is_empty());

    let store = data.store();
    for id in ["A0001", "B0001"] {
        let sample = store.load(id).unwrap();
        assert_eq!(sample.ct.dim(), (32, 8, 6));
        assert_eq!(sample.pet.dim(), (32, 4, 4));
        assert!(!sample.synthetic);
        assert!(sample.ct.iter().all(|v| (0.0..=1.0).contains(v)));
    }
    assert_eq!(store.load_meta("B0001").unwrap().0, Label::new("B"));
}

#[test]
fn empty_pet_directory_skips_the_patient() {
    let data = Dataset::new();
    data.patient("A0001", &[(4, 4); 5], &[]);
    data.patient("A0002", &[(4, 4); 5], &[(4, 4); 5]);

    let config = npy_config();
    let annotations = DirectoryAnnotations::new(data.annotations.path());
    let patients = discover_patients(data.input.path()).unwrap();
    let report = Pipeline::new(&config, &annotations, data.store()).run(&patients);

    assert_eq!(report.processed, vec!["A0002".to_owned()]);
    assert!(matches!(
        report.skipped.as_slice(),
        [ProcessingError::MissingData { patient, modality: Modality::Pet }] if patient == "A0001"
    ));
    assert!(!data.store().contains("A0001"));
}

#[test]
fn mismatched_slices_fail_only_that_patient() {
    let data = Dataset::new();
    let mut shapes = vec![(4, 4); 5];
    shapes[3] = (4, 5);
    data.patient("C0001", &shapes, &[(4, 4); 5]);
    data.patient("C0002", &[(4, 4); 5], &[(4, 4); 5]);

    let config = npy_config();
    let annotations = DirectoryAnnotations::new(data.annotations.path());
    let patients = discover_patients(data.input.path()).unwrap();
    let report = Pipeline::new(&config, &annotations, data.store()).run(&patients);

    assert_eq!(report.processed, vec!["C0002".to_owned()]);
    assert!(matches!(
        report.failed.as_slice(),
        [ProcessingError::Shape { patient, modality: Modality::Ct, .. }] if patient == "C0001"
    ));
    assert_eq!(data.store().ids().unwrap(), vec!["C0002".to_owned()]);
}

#[test]
fn shared_patient_number_keeps_the_first_directory() {
    let data = Dataset::new();
    let first = data.patient_dir("Lung_Dx-A0001", &[(4, 4); 5], &[(4, 4); 5]);
    data.patient_dir("Other-A0001", &[(6, 6); 5], &[(6, 6); 5]);

    for jobs in [1, 2] {
        let config = PreprocessConfig {
            jobs,
            ..npy_config()
        };
        let annotations = DirectoryAnnotations::new(data.annotations.path());
        let patients = discover_patients(data.input.path()).unwrap();
        let report = Pipeline::new(&config, &annotations, data.store()).run(&patients);

        assert_eq!(report.processed, vec!["A0001".to_owned()]);
        assert!(matches!(
            report.failed.as_slice(),
            [ProcessingError::DuplicatePatient { patient, first: claimed, .. }]
                if patient == "A0001" && *claimed == first
        ));
        let ids = data.store().ids().unwrap();
        assert_eq!(ids.len(), report.processed.len());
        assert_eq!(data.store().load("A0001").unwrap().ct.dim(), (32, 4, 4));
    }
}

#[test]
fn annotation_narrows_both_modalities_before_conversion() {
    let data = Dataset::new();
    let patient_dir = data.patient("E0001", &[(4, 4); 20], &[(4, 4); 20]);
    data.annotate("E0001", &["CT-006", "CT-010"]);

    let config = npy_config();
    let annotations = DirectoryAnnotations::new(data.annotations.path());
    let patients = discover_patients(data.input.path()).unwrap();
    let report = Pipeline::new(&config, &annotations, data.store()).run(&patients);

    assert_eq!(report.processed.len(), 1);
    assert_eq!(count_files(&patient_dir.join("CT")), 5);
    assert_eq!(count_files(&patient_dir.join("PET")), 5);
    assert_eq!(data.store().load("E0001").unwrap().ct.dim().0, 32);
}

#[test]
fn filtering_everything_away_is_missing_data() {
    let data = Dataset::new();
    // Annotation bounds lie past the end of the short PET series.
    data.patient("G0001", &[(4, 4); 10], &[(4, 4); 3]);
    data.annotate("G0001", &["CT-008", "CT-009"]);

    let config = npy_config();
    let annotations = DirectoryAnnotations::new(data.annotations.path());
    let patients = discover_patients(data.input.path()).unwrap();
    let report = Pipeline::new(&config, &annotations, data.store()).run(&patients);

    assert!(report.processed.is_empty());
    assert!(matches!(
        report.skipped.as_slice(),
        [ProcessingError::MissingData { modality: Modality::Pet, .. }]
    ));
}

#[test]
fn parallel_run_matches_sequential_run() {
    let data = Dataset::new();
    for i in 0..6 {
        data.patient(&format!("A{i:04}"), &vec![(4, 4); 10 + i], &vec![(3, 3); 5 + i]);
    }

    let config = PreprocessConfig {
        jobs: 3,
        ..npy_config()
    };
    let annotations = DirectoryAnnotations::new(data.annotations.path());
    let patients = discover_patients(data.input.path()).unwrap();
    let report = Pipeline::new(&config, &annotations, data.store()).run(&patients);

    assert_eq!(report.processed.len(), 6);
    assert_eq!(data.store().ids().unwrap().len(), 6);
}

#[test]
fn cancelled_run_starts_no_patient() {
    let data = Dataset::new();
    data.patient("A0001", &[(4, 4); 5], &[(4, 4); 5]);

    let config = npy_config();
    let annotations = DirectoryAnnotations::new(data.annotations.path());
    let patients = discover_patients(data.input.path()).unwrap();
    let pipeline = Pipeline::new(&config, &annotations, data.store());
    pipeline.cancel_handle().store(true, Ordering::Relaxed);
    let report = pipeline.run(&patients);

    assert_eq!(report.cancelled, vec!["A0001".to_owned()]);
    assert!(data.store().ids().unwrap().is_empty());
}

#[test]
fn preprocess_then_balance() {
    let data = Dataset::new();
    for i in 0..3 {
        data.patient(&format!("A{i:04}"), &[(4, 4); 6], &[(4, 4); 6]);
    }
    data.patient("B0000", &[(4, 4); 6], &[(4, 4); 6]);

    let config = npy_config();
    let annotations = DirectoryAnnotations::new(data.annotations.path());
    let patients = discover_patients(data.input.path()).unwrap();
    let store = data.store();
    Pipeline::new(&config, &annotations, store.clone()).run(&patients);

    let report = Augmentor::new(&store, &store, AugmentConfig::default())
        .run()
        .unwrap();
    assert_eq!(report.created_count(&Label::new("B")), 2);

    let tally = ClassTally::scan(&store).unwrap();
    assert_eq!(tally.counts[&Label::new("A")].total(), 3);
    assert_eq!(tally.counts[&Label::new("B")].total(), 3);
    assert_eq!(tally.counts[&Label::new("B")].synthetic, 2);
}
