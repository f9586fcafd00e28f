#![recursion_limit = "256"]

pub mod config;
pub mod data;
pub mod dataset;
pub mod demo;
pub mod error;
pub mod evaluation;
pub mod inference;
pub mod logging;
pub mod model;
pub mod pickle;
pub mod report;
pub mod session;
pub mod training;

pub use config::{OptimizerKind, TrainingConfig};
pub use dataset::CLASSES;
pub use error::{Error, Result};
pub use session::TrainingSession;

#[cfg(test)]
pub type TestBackend = burn::backend::NdArray<f32>;

#[cfg(test)]
pub type TestAutodiffBackend = burn::backend::Autodiff<TestBackend>;
