use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use petct_prep::{
    annotation::DirectoryAnnotations,
    augment::{AugmentReport, Augmentor},
    config::{AugmentConfig, DEFAULT_TARGET_DEPTH, PreprocessConfig},
    enums::{DepthInterpolation, FilterMode, SliceFormat, SortBy, SourceSelection},
    intensity::Normalization,
    logging::setup_logging,
    pipeline::{Pipeline, RunReport, discover_patients},
    store::SampleStore,
};

#[derive(Parser)]
#[command(name = "petct-prep")]
#[command(about = "Preprocess paired CT/PET studies into a class-balanced volume dataset")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Log specification, e.g. `info` or `petct_prep=debug`
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Directory for log files (stderr only when omitted)
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Preprocess every patient, then balance the classes
    Run {
        #[command(flatten)]
        paths: PreprocessPaths,
        #[command(flatten)]
        preprocess: PreprocessArgs,
        #[command(flatten)]
        augment: AugmentArgs,
        /// Where synthetic samples go (defaults to the output store)
        #[arg(long)]
        aug_output: Option<PathBuf>,
    },
    /// Preprocess every patient without augmentation
    Preprocess {
        #[command(flatten)]
        paths: PreprocessPaths,
        #[command(flatten)]
        preprocess: PreprocessArgs,
    },
    /// Balance the classes of an existing sample store
    Augment {
        /// Sample store to tally and augment
        #[arg(long)]
        store: PathBuf,
        /// Where synthetic samples go (defaults to the store itself)
        #[arg(long)]
        output: Option<PathBuf>,
        #[command(flatten)]
        augment: AugmentArgs,
    },
}

#[derive(Args)]
struct PreprocessPaths {
    /// Root directory with one subdirectory per patient
    #[arg(long)]
    input: PathBuf,
    /// Root directory of the per-patient annotations
    #[arg(long)]
    annotations: PathBuf,
    /// Sample store the volumes are written to
    #[arg(long)]
    output: PathBuf,
}

#[derive(Args)]
struct PreprocessArgs {
    /// Depth every volume is resized to
    #[arg(long, default_value_t = DEFAULT_TARGET_DEPTH)]
    depth: usize,
    #[arg(long, value_enum, default_value_t = SliceFormat::Dicom)]
    format: SliceFormat,
    /// DICOM attribute slices are ordered by
    #[arg(long, value_enum, default_value_t = SortBy::InstanceNumber)]
    sort_by: SortBy,
    #[arg(long, value_enum, default_value_t = FilterMode::Delete)]
    filter_mode: FilterMode,
    #[arg(long, value_enum, default_value_t = DepthInterpolation::Linear)]
    interpolation: DepthInterpolation,
    /// CT window level in HU
    #[arg(long, default_value_t = -600.0, allow_negative_numbers = true)]
    ct_level: f32,
    /// CT window width in HU
    #[arg(long, default_value_t = 1500.0)]
    ct_width: f32,
    /// Lower PET clip percentile
    #[arg(long, default_value_t = 0.5)]
    pet_lower: f32,
    /// Upper PET clip percentile
    #[arg(long, default_value_t = 99.5)]
    pet_upper: f32,
    /// Leading patient-number characters forming the class label
    #[arg(long, default_value_t = 1)]
    label_prefix: usize,
    /// Patients processed in parallel
    #[arg(short, long, default_value_t = 1)]
    jobs: usize,
    /// Abort the run at the first failed patient
    #[arg(long)]
    fail_fast: bool,
}

impl PreprocessArgs {
    fn to_config(&self) -> PreprocessConfig {
        PreprocessConfig {
            target_depth: self.depth,
            slice_format: self.format,
            sort_by: self.sort_by,
            filter_mode: self.filter_mode,
            interpolation: self.interpolation,
            ct_normalization: Normalization::Ct {
                level: self.ct_level,
                width: self.ct_width,
            },
            pet_normalization: Normalization::Pet {
                lower_percentile: self.pet_lower,
                upper_percentile: self.pet_upper,
            },
            label_prefix_len: self.label_prefix,
            jobs: self.jobs,
            fail_fast: self.fail_fast,
        }
    }
}

#[derive(Args)]
struct AugmentArgs {
    /// Seed of the augmentation random generator
    #[arg(long, default_value_t = 42)]
    seed: u64,
    #[arg(long, value_enum, default_value_t = SourceSelection::Cyclic)]
    selection: SourceSelection,
    /// Probability of each horizontal and vertical flip
    #[arg(long, default_value_t = 0.5)]
    flip_probability: f64,
    /// Disable 90 degree rotations
    #[arg(long)]
    no_rotate: bool,
    #[arg(long, default_value_t = 0.05)]
    jitter: f32,
    #[arg(long, default_value_t = 0.01)]
    noise_sigma: f32,
}

impl AugmentArgs {
    fn to_config(&self) -> AugmentConfig {
        AugmentConfig {
            seed: self.seed,
            selection: self.selection,
            flip_probability: self.flip_probability,
            rotate: !self.no_rotate,
            intensity_jitter: self.jitter,
            noise_sigma: self.noise_sigma,
        }
    }
}

fn preprocess(paths: &PreprocessPaths, config: &PreprocessConfig) -> Result<RunReport> {
    config.validate().context("Invalid preprocessing settings")?;
    let patients = discover_patients(&paths.input)
        .with_context(|| format!("Failed to list patients in {}", paths.input.display()))?;
    if patients.is_empty() {
        bail!("No patient directories found in {}", paths.input.display());
    }
    log::info!("Found {} patient directories", patients.len());

    let store = SampleStore::open(&paths.output)
        .with_context(|| format!("Failed to open output store {}", paths.output.display()))?;
    let annotations = DirectoryAnnotations::new(&paths.annotations);
    let report = Pipeline::new(config, &annotations, store).run(&patients);

    for skip in &report.skipped {
        log::info!("Skipped: {skip}");
    }
    for failure in &report.failed {
        log::error!("Failed: {failure}");
    }
    if config.fail_fast && !report.failed.is_empty() {
        bail!("Stopped after {} failed patient(s)", report.failed.len());
    }
    Ok(report)
}

fn augment(store: &Path, output: Option<&Path>, config: AugmentConfig) -> Result<AugmentReport> {
    config.validate().context("Invalid augmentation settings")?;
    log::info!("=====< DATA AUGMENTATION >=====");
    let source = SampleStore::open(store)
        .with_context(|| format!("Failed to open sample store {}", store.display()))?;
    let target = match output {
        Some(path) => SampleStore::open(path)
            .with_context(|| format!("Failed to open augmentation output {}", path.display()))?,
        None => source.clone(),
    };
    let report = Augmentor::new(&source, &target, config)
        .run()
        .context("Failed to augment the sample store")?;
    for (label, error) in &report.failed {
        log::error!("Class {label}: {error}");
    }
    Ok(report)
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let _logger = setup_logging(&cli.log_level, cli.log_dir.as_deref())
        .context("Failed to initialize logging")?;

    match &cli.command {
        Command::Run {
            paths,
            preprocess: args,
            augment: aug_args,
            aug_output,
        } => {
            preprocess(paths, &args.to_config())?;
            augment(&paths.output, aug_output.as_deref(), aug_args.to_config())?;
        }
        Command::Preprocess {
            paths,
            preprocess: args,
        } => {
            preprocess(paths, &args.to_config())?;
        }
        Command::Augment {
            store,
            output,
            augment: args,
        } => {
            augment(store, output.as_deref(), args.to_config())?;
        }
    }
    Ok(())
}
