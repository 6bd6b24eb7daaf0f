//! # PET/CT preprocessing library
//!
//! This crate turns per-patient CT and PET DICOM studies into a class-balanced
//! dataset of fixed-depth volumes for model training.
//!
//! Every patient directory holds a `CT` and a `PET` directory of single-slice
//! files. A patient runs through these stages, each in its own module:
//!  - [`roi_filter`]: drop slices outside the annotated region of interest
//!  - [`converter`]: read the remaining slices in ordinal order and stack them
//!  - [`intensity`]: window and rescale every slice into `[0, 1]`
//!  - [`volume`]: resize the stack to the target depth
//!  - [`store`]: persist CT, PET and the class label as one `.npz` sample
//!
//! After all patients are stored, [`augment`] tops up every minority class to
//! the size of the largest one with randomly transformed copies.
//!
//! Slices are always ordered by an explicit ordinal read from each file
//! (`InstanceNumber` by default), never by directory listing order, so CT and
//! PET stay aligned slice for slice.
//!
//! # Examples
//!
//! ## Preprocessing a dataset and balancing it
//!
//! ```no_run
//! # use petct_prep::{
//! #     annotation::DirectoryAnnotations,
//! #     augment::Augmentor,
//! #     config::{AugmentConfig, PreprocessConfig},
//! #     pipeline::{Pipeline, discover_patients},
//! #     store::SampleStore,
//! # };
//! let config = PreprocessConfig::default();
//! let annotations = DirectoryAnnotations::new("Annotation");
//! let store = SampleStore::open("data/npz").expect("should have opened output store");
//! let patients = discover_patients("Dataset").expect("should have listed patients");
//!
//! let pipeline = Pipeline::new(&config, &annotations, store.clone());
//! let report = pipeline.run(&patients);
//! println!("{} patients processed", report.processed.len());
//!
//! Augmentor::new(&store, &store, AugmentConfig::default())
//!     .run()
//!     .expect("should have balanced the store");
//! ```

pub mod annotation;
pub mod augment;
pub mod config;
pub mod converter;
pub mod enums;
pub mod intensity;
mod interpolator;
pub mod logging;
pub mod pipeline;
pub mod roi_filter;
pub mod sample;
pub mod slice_reader;
pub mod store;
pub mod volume;
