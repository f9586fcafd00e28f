#![recursion_limit = "256"]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use burn::backend::{ndarray::NdArrayDevice, Autodiff, NdArray};
use clap::{Parser, Subcommand};

use cifar_cnn::{
    config::load_config,
    dataset::load_cifar10,
    demo::{classify_upload, DemoRequest, CURVES_FILE, METRICS_FILE},
    inference::infer,
    logging::{install_file_logger, install_stderr_logger},
    report::{plot_metrics, save_metrics_json},
    OptimizerKind, Result, TrainingConfig, TrainingSession,
};

type Backend = Autodiff<NdArray<f32>>;

const DEVICE: NdArrayDevice = NdArrayDevice::Cpu;
const LOG_FILE: &str = "experiment.log";

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train a new model, then evaluate it on the test partition
    Train {
        /// Directory holding the pickled data_batch_{1..5} and test_batch shards
        #[arg(long, default_value = "data/cifar-10-batches-py")]
        data_dir: PathBuf,
        #[arg(long, default_value = "artifacts")]
        artifact_dir: PathBuf,
        /// JSON training config; flags below override its values
        #[arg(long)]
        config: Option<PathBuf>,
        #[command(flatten)]
        overrides: Overrides,
    },
    /// Classify an image with a trained model
    Predict {
        #[arg(long, default_value = "artifacts")]
        artifact_dir: PathBuf,
        #[arg(long)]
        image: PathBuf,
    },
    /// Retrain from scratch, plot the curves and classify an uploaded image
    Demo {
        #[arg(long, default_value = "data/cifar-10-batches-py")]
        data_dir: PathBuf,
        #[arg(long, default_value = "artifacts/demo")]
        artifact_dir: PathBuf,
        #[arg(long)]
        image: PathBuf,
        #[arg(long, default_value_t = 5)]
        num_epochs: usize,
        #[arg(long, default_value_t = 128)]
        batch_size: usize,
    },
}

#[derive(clap::Args)]
struct Overrides {
    #[arg(long)]
    num_epochs: Option<usize>,
    #[arg(long)]
    batch_size: Option<usize>,
    #[arg(long)]
    learning_rate: Option<f64>,
    /// adam or sgd
    #[arg(long)]
    optimizer: Option<String>,
    #[arg(long)]
    seed: Option<u64>,
}

impl Overrides {
    fn apply(self, mut config: TrainingConfig) -> Result<TrainingConfig> {
        if let Some(num_epochs) = self.num_epochs {
            config.num_epochs = num_epochs;
        }
        if let Some(batch_size) = self.batch_size {
            config.batch_size = batch_size;
        }
        if let Some(learning_rate) = self.learning_rate {
            config.learning_rate = learning_rate;
        }
        if let Some(optimizer) = self.optimizer {
            config.optimizer = optimizer.parse::<OptimizerKind>()?;
        }
        if let Some(seed) = self.seed {
            config.seed = seed;
        }
        Ok(config)
    }
}

fn train(
    data_dir: &Path,
    artifact_dir: &Path,
    config_path: Option<PathBuf>,
    overrides: Overrides,
) -> Result<()> {
    install_file_logger(&artifact_dir.join(LOG_FILE));

    let config = match config_path {
        Some(path) => load_config(path)?,
        None => TrainingConfig::default(),
    };
    let config = overrides.apply(config)?;
    config.validate()?;

    let (train, test) = load_cifar10(data_dir)?;
    let mut session = TrainingSession::<Backend>::new(config, DEVICE)?;

    let mut train_source = session.train_source(Arc::new(train))?;
    let records = session.train(&mut train_source)?;

    let losses = records.iter().map(|m| m.loss).collect::<Vec<_>>();
    let accuracies = records.iter().map(|m| m.accuracy).collect::<Vec<_>>();
    plot_metrics(&losses, &accuracies, artifact_dir.join(CURVES_FILE))?;
    save_metrics_json(&records, artifact_dir.join(METRICS_FILE))?;

    let report = session.evaluate(&session.test_source(Arc::new(test))?)?;
    session.save(artifact_dir)?;

    println!("Accuracy on test set: {:.2}%", report.accuracy);
    Ok(())
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Train {
            data_dir,
            artifact_dir,
            config,
            overrides,
        } => train(&data_dir, &artifact_dir, config, overrides),
        Commands::Predict {
            artifact_dir,
            image,
        } => {
            install_stderr_logger();
            let prediction = infer::<Backend, _, _>(&artifact_dir, &image, DEVICE)?;
            println!("Prediction: {}", prediction.class_name);
            Ok(())
        }
        Commands::Demo {
            data_dir,
            artifact_dir,
            image,
            num_epochs,
            batch_size,
        } => {
            install_file_logger(&artifact_dir.join(LOG_FILE));
            let request = DemoRequest {
                image_path: image,
                num_epochs,
            };
            let config = TrainingConfig::default().with_batch_size(batch_size);
            let outcome =
                classify_upload::<Backend>(&request, config, &data_dir, &artifact_dir, DEVICE)?;

            println!("Training curves: {}", outcome.curves_path.display());
            println!("Predicted category: {}", outcome.predicted_class);
            println!("Accuracy on test set: {:.2}%", outcome.test_accuracy);
            Ok(())
        }
    }
}

fn main() {
    let cli = Cli::parse();

    if let Err(err) = run(cli) {
        log::error!("{err}");
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
}
