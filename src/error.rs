use std::path::PathBuf;

use thiserror::Error;

/// Failure while reading the on-disk dataset shards.
#[derive(Error, Debug)]
pub enum DatasetLoadError {
    /// A shard file expected by the directory layout does not exist.
    #[error("dataset shard not found: {path}")]
    MissingShard { path: PathBuf },

    /// A shard exists but could not be read.
    #[error("failed to read dataset shard {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A shard is not a readable pickle stream.
    #[error("failed to unpickle dataset shard {path}: {source}")]
    Pickle {
        path: PathBuf,
        #[source]
        source: PickleError,
    },

    /// A shard was unpickled but does not hold a `data`/`labels` mapping of the expected shape.
    #[error("malformed dataset shard {path}: {reason}")]
    Malformed { path: PathBuf, reason: String },

    /// In-memory records with mismatched image and label counts.
    #[error("image count ({images}) does not match label count ({labels})")]
    CountMismatch { images: usize, labels: usize },

    /// In-memory record carrying a label outside the 10 known classes.
    #[error("record {index} has label {label}, expected 0..=9")]
    InvalidLabel { index: usize, label: u8 },
}

#[derive(Error, Debug)]
pub enum PickleError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("invalid opcode {0:#04x}")]
    InvalidOpCode(u8),
    #[error("unsupported pickle protocol {0}")]
    InvalidProtocol(u8),
    #[error("pickle stack underflow")]
    StackUnderflow,
    #[error("memo entry {0} not found")]
    MemoNotFound(u32),
    #[error("invalid pickle data: {0}")]
    InvalidData(String),
}

/// Raised when an optimizer name is neither `adam` nor `sgd`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unsupported optimizer '{0}', expected one of: adam, sgd")]
pub struct UnsupportedOptimizerError(pub String);

/// Invalid training configuration values.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("batch size must be greater than zero")]
    ZeroBatchSize,
    #[error("number of epochs must be greater than zero")]
    ZeroEpochs,
    #[error("learning rate must be a positive finite number, got {0}")]
    InvalidLearningRate(f64),
    #[error("momentum must be in [0, 1), got {0}")]
    InvalidMomentum(f64),
    #[error("dropout probability must be in [0, 1), got {0}")]
    InvalidDropout(f64),
    #[error("log interval must be greater than zero")]
    ZeroLogInterval,
    #[error(transparent)]
    UnsupportedOptimizer(#[from] UnsupportedOptimizerError),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EvaluationError {
    #[error("cannot evaluate on an empty test partition")]
    EmptyPartition,
    #[error("failed to read predictions back from the device: {0}")]
    TensorData(String),
}

/// The loss became NaN or infinite during training.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("training diverged at epoch {epoch}, batch {batch}: loss = {loss}")]
pub struct TrainingDivergedError {
    pub epoch: usize,
    pub batch: usize,
    pub loss: f64,
}

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("loss and accuracy series differ in length ({losses} vs {accuracies})")]
    LengthMismatch { losses: usize, accuracies: usize },
    #[error("failed to draw chart: {0}")]
    Draw(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum InferenceError {
    #[error("failed to decode image {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("failed to read model output: {0}")]
    Data(String),
    #[error("failed to load or save model record: {0}")]
    Record(#[from] burn::record::RecorderError),
    #[error("failed to load training config: {0}")]
    Config(#[from] burn::config::ConfigError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Top level error returned by the session, the demo and the CLI.
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    DatasetLoad(#[from] DatasetLoadError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to load training config: {0}")]
    ConfigFile(#[from] burn::config::ConfigError),
    #[error(transparent)]
    Evaluation(#[from] EvaluationError),
    #[error(transparent)]
    TrainingDiverged(#[from] TrainingDivergedError),
    #[error(transparent)]
    Report(#[from] ReportError),
    #[error(transparent)]
    Inference(#[from] InferenceError),
}

impl From<UnsupportedOptimizerError> for Error {
    fn from(err: UnsupportedOptimizerError) -> Self {
        Self::Config(ConfigError::UnsupportedOptimizer(err))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
