//! Class balancing by synthesizing samples for minority labels.
//!
//! Runs in two phases over a [`SampleStore`]: the tally is taken over the
//! whole store first, then synthesis writes new samples. Synthetic samples
//! count towards a label's total but are never used as sources, so a second
//! run over an already balanced store creates nothing.

use crate::{
    config::{AugmentConfig, ConfigError},
    enums::SourceSelection,
    sample::{Label, Sample},
    store::{SampleStore, StoreError},
};

use ndarray::{Array3, Axis};
use rand::{Rng, SeedableRng, rngs::StdRng};
use rand_distr::{Distribution, Normal};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AugmentError {
    #[error("Invalid augmentation settings: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Label {0} has no readable real sample to augment from")]
    NoRealSamples(Label),

    #[error("No free id for a synthetic sample derived from {0}")]
    IdsExhausted(String),

    #[error("Invalid noise distribution: {0}")]
    Noise(String),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ClassCount {
    pub real: usize,
    pub synthetic: usize,
}

impl ClassCount {
    pub fn total(&self) -> usize {
        self.real + self.synthetic
    }
}

/// Per-label sample counts of a store.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ClassTally {
    pub counts: BTreeMap<Label, ClassCount>,
    /// Ids of the real samples of every label, sorted.
    pub sources: BTreeMap<Label, Vec<String>>,
    /// Samples that could not be read, with the reason.
    pub unreadable: Vec<(String, String)>,
}

impl ClassTally {
    /// Scan every sample of `store`. Unreadable samples are logged and left
    /// out of the counts.
    pub fn scan(store: &SampleStore) -> Result<Self, StoreError> {
        let mut tally = Self::default();
        for id in store.ids()? {
            match store.load_meta(&id) {
                Ok((label, synthetic)) => tally.add(id, label, synthetic),
                Err(e) => {
                    log::warn!("Leaving unreadable sample {id} out of the tally: {e}");
                    tally.unreadable.push((id, e.to_string()));
                }
            }
        }
        Ok(tally)
    }

    pub fn add(&mut self, id: String, label: Label, synthetic: bool) {
        let count = self.counts.entry(label.clone()).or_default();
        if synthetic {
            count.synthetic += 1;
        } else {
            count.real += 1;
            self.sources.entry(label).or_default().push(id);
        }
    }

    /// The largest per-label total, which every label is topped up to.
    pub fn target(&self) -> usize {
        self.counts.values().map(ClassCount::total).max().unwrap_or(0)
    }

    /// Number of samples each label below the target is missing.
    pub fn deficits(&self) -> BTreeMap<Label, usize> {
        let target = self.target();
        self.counts
            .iter()
            .filter(|(_, count)| count.total() < target)
            .map(|(label, count)| (label.clone(), target - count.total()))
            .collect()
    }
}

/// Intensity perturbation applied to one modality.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct IntensityJitter {
    pub scale: f32,
    pub shift: f32,
}

/// One randomized transform. Geometric parts are shared by CT and PET so the
/// modalities stay aligned; intensity parts are drawn per modality.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Augmentation {
    pub flip_horizontal: bool,
    pub flip_vertical: bool,
    pub quarter_turns: u8,
    pub ct: IntensityJitter,
    pub pet: IntensityJitter,
}

impl Augmentation {
    pub fn random(rng: &mut impl Rng, config: &AugmentConfig, allow_rotation: bool) -> Self {
        let j = config.intensity_jitter;
        let mut jitter = || IntensityJitter {
            scale: rng.random_range(1.0 - j..=1.0 + j),
            shift: rng.random_range(-j..=j),
        };
        let ct = jitter();
        let pet = jitter();
        Self {
            flip_horizontal: rng.random_bool(config.flip_probability),
            flip_vertical: rng.random_bool(config.flip_probability),
            quarter_turns: if allow_rotation && config.rotate {
                rng.random_range(0..4)
            } else {
                0
            },
            ct,
            pet,
        }
    }

    fn geometric(&self, volume: &Array3<f32>) -> Array3<f32> {
        let mut view = volume.view();
        for _ in 0..self.quarter_turns % 4 {
            view = view.permuted_axes([0, 2, 1]);
            view.invert_axis(Axis(2));
        }
        if self.flip_horizontal {
            view.invert_axis(Axis(2));
        }
        if self.flip_vertical {
            view.invert_axis(Axis(1));
        }
        view.as_standard_layout().into_owned()
    }

    fn intensity(
        volume: Array3<f32>,
        jitter: IntensityJitter,
        noise: &Normal<f32>,
        rng: &mut impl Rng,
    ) -> Array3<f32> {
        volume.mapv_into(|v| {
            let n = noise.sample(&mut *rng);
            v.mul_add(jitter.scale, jitter.shift + n).clamp(0.0, 1.0)
        })
    }

    /// Apply to the volumes of `source`, producing `(ct, pet)`.
    pub fn apply(
        &self,
        source: &Sample,
        noise: &Normal<f32>,
        rng: &mut impl Rng,
    ) -> (Array3<f32>, Array3<f32>) {
        let ct = Self::intensity(self.geometric(&source.ct), self.ct, noise, rng);
        let pet = Self::intensity(self.geometric(&source.pet), self.pet, noise, rng);
        (ct, pet)
    }
}

fn is_square(volume: &Array3<f32>) -> bool {
    let (_, height, width) = volume.dim();
    height == width
}

/// Result of an augmentation run.
#[derive(Debug, Default)]
pub struct AugmentReport {
    pub tally: ClassTally,
    pub target: usize,
    /// Ids of the synthetic samples written, per label.
    pub created: BTreeMap<Label, Vec<String>>,
    pub failed: Vec<(Label, AugmentError)>,
}

impl AugmentReport {
    pub fn created_count(&self, label: &Label) -> usize {
        self.created.get(label).map_or(0, Vec::len)
    }
}

/// Tops up minority labels of `source` by writing synthetic samples to
/// `output`, which may be the same store.
pub struct Augmentor<'s> {
    source: &'s SampleStore,
    output: &'s SampleStore,
    config: AugmentConfig,
}

impl<'s> Augmentor<'s> {
    pub fn new(source: &'s SampleStore, output: &'s SampleStore, config: AugmentConfig) -> Self {
        Self {
            source,
            output,
            config,
        }
    }

    /// Tally the source store, then synthesize every label's deficit.
    ///
    /// # Errors
    ///
    /// Invalid settings and a failure to list the source store are
    /// returned; failures of a single label are collected in
    /// [`AugmentReport::failed`].
    pub fn run(&self) -> Result<AugmentReport, AugmentError> {
        self.config.validate()?;
        let tally = ClassTally::scan(self.source)?;
        let target = tally.target();
        let deficits = tally.deficits();
        log::info!(
            "Class tally: {}; target {target}",
            tally
                .counts
                .iter()
                .map(|(label, count)| format!("{label}={}", count.total()))
                .collect::<Vec<_>>()
                .join(", ")
        );

        let mut report = AugmentReport {
            target,
            ..Default::default()
        };
        for (label, deficit) in deficits {
            let sources = tally.sources.get(&label).map(Vec::as_slice).unwrap_or(&[]);
            let mut created = Vec::with_capacity(deficit);
            let result = self.augment_label(&label, deficit, sources, &mut created);
            log::info!("Augmented {} samples for class {label}", created.len());
            if let Err(e) = result {
                log::error!("Augmenting class {label} stopped early: {e}");
                report.failed.push((label.clone(), e));
            }
            if !created.is_empty() {
                report.created.insert(label, created);
            }
        }
        report.tally = tally;
        log::info!("Data augmentation completed");
        Ok(report)
    }

    fn label_rng(&self, label: &Label) -> StdRng {
        let seed = label
            .as_str()
            .bytes()
            .fold(self.config.seed, |h, b| (h ^ u64::from(b)).wrapping_mul(0x0100_0000_01b3));
        StdRng::seed_from_u64(seed)
    }

    /// Write `count` synthetic samples of `label`, derived from `sources`.
    ///
    /// Ids of the written samples are pushed to `created` as they are saved,
    /// so a failure part way keeps an accurate record. Sources that fail to
    /// load are dropped from the rotation.
    pub fn augment_label(
        &self,
        label: &Label,
        count: usize,
        sources: &[String],
        created: &mut Vec<String>,
    ) -> Result<(), AugmentError> {
        let mut rng = self.label_rng(label);
        let noise = Normal::new(0.0, self.config.noise_sigma)
            .map_err(|e| AugmentError::Noise(e.to_string()))?;
        let mut pool: Vec<&String> = sources.iter().collect();
        let mut cursor = 0usize;

        while created.len() < count {
            if pool.is_empty() {
                return Err(AugmentError::NoRealSamples(label.clone()));
            }
            let index = match self.config.selection {
                SourceSelection::Cyclic => cursor % pool.len(),
                SourceSelection::Random => rng.random_range(0..pool.len()),
            };
            let source = match self.source.load(pool[index]) {
                Ok(sample) => sample,
                Err(e) => {
                    log::warn!("Dropping unreadable source {} of class {label}: {e}", pool[index]);
                    pool.remove(index);
                    continue;
                }
            };
            cursor += 1;

            let augmentation = Augmentation::random(
                &mut rng,
                &self.config,
                is_square(&source.ct) && is_square(&source.pet),
            );
            let (ct, pet) = augmentation.apply(&source, &noise, &mut rng);
            let sample = Sample {
                id: self.next_id(&source.id)?,
                ct,
                pet,
                label: label.clone(),
                synthetic: true,
            };
            self.output.insert_new(&sample)?;
            log::debug!("Wrote {} from {} ({augmentation:?})", sample.id, source.id);
            created.push(sample.id);
        }
        Ok(())
    }

    fn next_id(&self, source_id: &str) -> Result<String, AugmentError> {
        (0..10_000)
            .map(|n| format!("{source_id}_aug{n:04}"))
            .find(|id| !self.output.contains(id) && !self.source.contains(id))
            .ok_or_else(|| AugmentError::IdsExhausted(source_id.to_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn real(id: &str, label: &str) -> Sample {
        Sample {
            id: id.to_owned(),
            ct: Array3::from_shape_fn((2, 3, 3), |(z, y, x)| (z + y + x) as f32 / 6.0),
            pet: Array3::from_elem((2, 3, 3), 0.5),
            label: Label::new(label),
            synthetic: false,
        }
    }

    fn fill(store: &SampleStore, label: &str, n: usize) {
        for i in 0..n {
            store.save(&real(&format!("{label}{i:04}"), label)).unwrap();
        }
    }

    #[test]
    fn deficits_against_majority() {
        let mut tally = ClassTally::default();
        for (label, n) in [("A", 10), ("B", 4), ("C", 10)] {
            for i in 0..n {
                tally.add(format!("{label}{i}"), Label::new(label), false);
            }
        }
        assert_eq!(tally.target(), 10);
        let deficits = tally.deficits();
        assert_eq!(deficits.len(), 1);
        assert_eq!(deficits[&Label::new("B")], 6);
    }

    #[test]
    fn synthetic_samples_count_but_are_not_sources() {
        let mut tally = ClassTally::default();
        tally.add("B1".into(), Label::new("B"), false);
        tally.add("B1_aug0000".into(), Label::new("B"), true);
        assert_eq!(tally.counts[&Label::new("B")].total(), 2);
        assert_eq!(tally.sources[&Label::new("B")], vec!["B1".to_owned()]);
    }

    #[test]
    fn invalid_settings_are_rejected_before_writing() {
        let dir = tempfile::tempdir().unwrap();
        let store = SampleStore::open(dir.path()).unwrap();
        fill(&store, "A", 3);
        fill(&store, "B", 1);

        for config in [
            AugmentConfig {
                flip_probability: 1.5,
                ..Default::default()
            },
            AugmentConfig {
                intensity_jitter: f32::NAN,
                ..Default::default()
            },
            AugmentConfig {
                noise_sigma: f32::NAN,
                ..Default::default()
            },
        ] {
            let result = Augmentor::new(&store, &store, config).run();
            assert!(matches!(result, Err(AugmentError::Config(_))));
        }
        assert_eq!(store.ids().unwrap().len(), 4);
    }

    #[test]
    fn balances_minority_classes() {
        let dir = tempfile::tempdir().unwrap();
        let store = SampleStore::open(dir.path()).unwrap();
        fill(&store, "A", 10);
        fill(&store, "B", 4);
        fill(&store, "C", 10);

        let report = Augmentor::new(&store, &store, AugmentConfig::default())
            .run()
            .unwrap();
        assert!(report.failed.is_empty());
        assert_eq!(report.target, 10);
        assert_eq!(report.created_count(&Label::new("A")), 0);
        assert_eq!(report.created_count(&Label::new("B")), 6);
        assert_eq!(report.created_count(&Label::new("C")), 0);

        let after = ClassTally::scan(&store).unwrap();
        for label in ["A", "B", "C"] {
            assert_eq!(after.counts[&Label::new(label)].total(), 10);
        }
        assert_eq!(after.counts[&Label::new("B")].synthetic, 6);

        // Cyclic selection spreads the work over all four sources.
        let ids = &report.created[&Label::new("B")];
        assert!(ids.contains(&"B0000_aug0000".to_owned()));
        assert!(ids.contains(&"B0000_aug0001".to_owned()));
        assert!(ids.contains(&"B0003_aug0000".to_owned()));

        let rerun = Augmentor::new(&store, &store, AugmentConfig::default())
            .run()
            .unwrap();
        assert!(rerun.created.is_empty());
    }

    #[test]
    fn synthetic_samples_keep_shape_and_range() {
        let dir = tempfile::tempdir().unwrap();
        let store = SampleStore::open(dir.path()).unwrap();
        fill(&store, "A", 3);
        fill(&store, "G", 1);

        let config = AugmentConfig {
            selection: SourceSelection::Random,
            ..Default::default()
        };
        let report = Augmentor::new(&store, &store, config).run().unwrap();
        for id in &report.created[&Label::new("G")] {
            let sample = store.load(id).unwrap();
            assert!(sample.synthetic);
            assert_eq!(sample.label, Label::new("G"));
            assert_eq!(sample.ct.dim(), (2, 3, 3));
            assert_eq!(sample.pet.dim(), (2, 3, 3));
            assert!(sample.ct.iter().chain(sample.pet.iter()).all(|v| (0.0..=1.0).contains(v)));
        }
    }

    #[test]
    fn unreadable_sources_fail_only_their_label() {
        let dir = tempfile::tempdir().unwrap();
        let store = SampleStore::open(dir.path()).unwrap();
        fill(&store, "A", 2);
        let augmentor = Augmentor::new(&store, &store, AugmentConfig::default());

        let mut created = Vec::new();
        let result = augmentor.augment_label(
            &Label::new("E"),
            2,
            &["E-missing".to_owned()],
            &mut created,
        );
        assert!(matches!(result, Err(AugmentError::NoRealSamples(_))));
        assert!(created.is_empty());

        let mut created = Vec::new();
        augmentor
            .augment_label(&Label::new("A"), 1, &["A0000".to_owned()], &mut created)
            .unwrap();
        assert_eq!(created.len(), 1);
    }

    #[test]
    fn separate_output_store() {
        let input = tempfile::tempdir().unwrap();
        let output = tempfile::tempdir().unwrap();
        let source = SampleStore::open(input.path()).unwrap();
        let target = SampleStore::open(output.path()).unwrap();
        fill(&source, "A", 3);
        fill(&source, "B", 1);

        let report = Augmentor::new(&source, &target, AugmentConfig::default())
            .run()
            .unwrap();
        assert_eq!(report.created_count(&Label::new("B")), 2);
        assert_eq!(source.ids().unwrap().len(), 4);
        assert_eq!(target.ids().unwrap().len(), 2);
    }

    #[test]
    fn geometry_is_shared_between_modalities() {
        let augmentation = Augmentation {
            flip_horizontal: true,
            flip_vertical: false,
            quarter_turns: 1,
            ct: IntensityJitter {
                scale: 1.0,
                shift: 0.0,
            },
            pet: IntensityJitter {
                scale: 1.0,
                shift: 0.0,
            },
        };
        let volume = array![[[0.1f32, 0.2], [0.3, 0.4]]];
        let sample = Sample {
            id: "X1".into(),
            ct: volume.clone(),
            pet: volume,
            label: Label::new("X"),
            synthetic: false,
        };
        let mut rng = StdRng::seed_from_u64(7);
        let noise = Normal::new(0.0, 0.0).unwrap();
        let (ct, pet) = augmentation.apply(&sample, &noise, &mut rng);
        assert_eq!(ct, pet);
        // Transpose then mirror twice: a plain transpose.
        assert_eq!(ct, array![[[0.1f32, 0.3], [0.2, 0.4]]]);
    }
}
