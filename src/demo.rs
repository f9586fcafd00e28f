use std::path::{Path, PathBuf};
use std::sync::Arc;

use burn::tensor::backend::AutodiffBackend;

use crate::config::TrainingConfig;
use crate::dataset::{load_cifar10, Cifar10Partition};
use crate::error::Result;
use crate::inference::load_image;
use crate::report::{plot_metrics, save_metrics_json};
use crate::session::TrainingSession;

pub const CURVES_FILE: &str = "training_curves.png";
pub const METRICS_FILE: &str = "metrics.json";

/// An uploaded image plus the number of epochs to retrain for.
#[derive(Debug, Clone)]
pub struct DemoRequest {
    pub image_path: PathBuf,
    pub num_epochs: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DemoOutcome {
    pub curves_path: PathBuf,
    pub predicted_class: &'static str,
    pub test_accuracy: f64,
}

/// Retrains a fresh model on the dataset in `data_dir`, then classifies the uploaded image.
pub fn classify_upload<B: AutodiffBackend>(
    request: &DemoRequest,
    config: TrainingConfig,
    data_dir: &Path,
    artifact_dir: &Path,
    device: B::Device,
) -> Result<DemoOutcome> {
    let (train, test) = load_cifar10(data_dir)?;
    run_demo::<B>(request, config, Arc::new(train), Arc::new(test), artifact_dir, device)
}

/// Same as [`classify_upload`] on partitions already in memory.
pub fn run_demo<B: AutodiffBackend>(
    request: &DemoRequest,
    config: TrainingConfig,
    train: Arc<Cifar10Partition>,
    test: Arc<Cifar10Partition>,
    artifact_dir: &Path,
    device: B::Device,
) -> Result<DemoOutcome> {
    // Decode first so a bad upload does not cost a training run.
    let image = load_image(&request.image_path)?;

    let config = config.with_num_epochs(request.num_epochs);
    let mut session = TrainingSession::<B>::new(config, device)?;
    let mut train_source = session.train_source(train)?;
    let records = session.train(&mut train_source)?;

    let losses = records.iter().map(|m| m.loss).collect::<Vec<_>>();
    let accuracies = records.iter().map(|m| m.accuracy).collect::<Vec<_>>();
    let curves_path = artifact_dir.join(CURVES_FILE);
    plot_metrics(&losses, &accuracies, &curves_path)?;
    save_metrics_json(&records, artifact_dir.join(METRICS_FILE))?;

    let report = session.evaluate(&session.test_source(test)?)?;
    let prediction = session.predict(&image)?;

    Ok(DemoOutcome {
        curves_path,
        predicted_class: prediction.class_name,
        test_accuracy: report.accuracy,
    })
}
