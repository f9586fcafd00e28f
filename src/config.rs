use std::fmt;
use std::path::Path;
use std::str::FromStr;

use burn::config::Config;
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Error, UnsupportedOptimizerError};
use crate::model::ModelConfig;

/// Parameter update rule used by the training loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum OptimizerKind {
    Adam,
    /// Stochastic gradient descent with momentum.
    Sgd,
}

impl OptimizerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Adam => "adam",
            Self::Sgd => "sgd",
        }
    }
}

impl FromStr for OptimizerKind {
    type Err = UnsupportedOptimizerError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        match name.trim().to_ascii_lowercase().as_str() {
            "adam" => Ok(Self::Adam),
            "sgd" => Ok(Self::Sgd),
            _ => Err(UnsupportedOptimizerError(name.to_string())),
        }
    }
}

impl TryFrom<String> for OptimizerKind {
    type Error = UnsupportedOptimizerError;

    fn try_from(name: String) -> Result<Self, Self::Error> {
        name.parse()
    }
}

impl From<OptimizerKind> for String {
    fn from(kind: OptimizerKind) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for OptimizerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Config, Debug)]
pub struct TrainingConfig {
    pub model: ModelConfig,
    #[config(default = 10)]
    pub num_epochs: usize,
    #[config(default = 64)]
    pub batch_size: usize,
    #[config(default = 1.0e-3)]
    pub learning_rate: f64,
    #[config(default = "OptimizerKind::Adam")]
    pub optimizer: OptimizerKind,
    /// Only read by the SGD optimizer.
    #[config(default = 0.9)]
    pub momentum: f64,
    #[config(default = 42)]
    pub seed: u64,
    /// Abort with an error as soon as a batch loss is NaN or infinite.
    #[config(default = true)]
    pub halt_on_divergence: bool,
    /// Number of mini-batches between two progress log lines.
    #[config(default = 100)]
    pub log_interval: usize,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self::new(ModelConfig::new())
    }
}

impl TrainingConfig {
    /// Checks every value before any data is loaded or any parameter is allocated.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::ZeroBatchSize);
        }
        if self.num_epochs == 0 {
            return Err(ConfigError::ZeroEpochs);
        }
        if !self.learning_rate.is_finite() || self.learning_rate <= 0.0 {
            return Err(ConfigError::InvalidLearningRate(self.learning_rate));
        }
        if !(0.0..1.0).contains(&self.momentum) {
            return Err(ConfigError::InvalidMomentum(self.momentum));
        }
        if !(0.0..1.0).contains(&self.model.dropout) {
            return Err(ConfigError::InvalidDropout(self.model.dropout));
        }
        if self.log_interval == 0 {
            return Err(ConfigError::ZeroLogInterval);
        }
        Ok(())
    }
}

/// Reads a JSON training config written by [`Config::save`].
pub fn load_config<P: AsRef<Path>>(path: P) -> crate::Result<TrainingConfig> {
    let path = path.as_ref();
    let config = TrainingConfig::load(path).map_err(Error::ConfigFile)?;
    log::info!("Loaded training config from {}", path.display());

    Ok(config)
}
