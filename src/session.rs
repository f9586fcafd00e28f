use std::path::Path;
use std::sync::Arc;

use burn::{
    module::AutodiffModule,
    prelude::*,
    record::{FullPrecisionSettings, NamedMpkFileRecorder},
    tensor::{activation::softmax, backend::AutodiffBackend},
};

use crate::config::TrainingConfig;
use crate::data::SampleSource;
use crate::dataset::{Cifar10Partition, CHANNELS, CLASSES, HEIGHT, IMAGE_SIZE, WIDTH};
use crate::error::{InferenceError, Result};
use crate::evaluation::{evaluate, EvaluationReport};
use crate::model::{Cifar10Cnn, ForwardMode};
use crate::training::{train, EpochMetrics};

pub const CONFIG_FILE: &str = "config.json";
pub const MODEL_FILE: &str = "model";

type ModelRecorder = NamedMpkFileRecorder<FullPrecisionSettings>;

/// Outcome of classifying a single image.
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub class_index: usize,
    pub class_name: &'static str,
    /// Softmax over the logits, indexed like [`CLASSES`].
    pub probabilities: Vec<f32>,
}

/// Owns everything a train/evaluate/predict sequence mutates.
///
/// Nothing lives in globals: two sessions never observe each other's parameters.
#[derive(Debug)]
pub struct TrainingSession<B: AutodiffBackend> {
    config: TrainingConfig,
    device: B::Device,
    model: Cifar10Cnn<B>,
    history: Vec<EpochMetrics>,
    generation: u64,
}

impl<B: AutodiffBackend> TrainingSession<B> {
    pub fn new(config: TrainingConfig, device: B::Device) -> Result<Self> {
        config.validate()?;

        B::seed(config.seed);
        let model = config.model.init::<B>(&device);
        log::info!(
            "Initialized model with {} parameters\n{}",
            model.num_params(),
            model.summary()
        );

        Ok(Self {
            config,
            device,
            model,
            history: Vec::new(),
            generation: 0,
        })
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    pub fn device(&self) -> &B::Device {
        &self.device
    }

    pub fn model(&self) -> &Cifar10Cnn<B> {
        &self.model
    }

    /// Every epoch record since construction or the last [`reinitialize`](Self::reinitialize).
    pub fn history(&self) -> &[EpochMetrics] {
        &self.history
    }

    /// Shuffled source over `partition` with the configured batch size and seed.
    pub fn train_source(&self, partition: Arc<Cifar10Partition>) -> Result<SampleSource> {
        Ok(SampleSource::train(
            partition,
            self.config.batch_size,
            self.config.seed,
        )?)
    }

    /// Fixed-order source over `partition` with the configured batch size.
    pub fn test_source(&self, partition: Arc<Cifar10Partition>) -> Result<SampleSource> {
        Ok(SampleSource::test(partition, self.config.batch_size)?)
    }

    /// Runs `config.num_epochs` epochs over `source` and returns this call's records.
    pub fn train(&mut self, source: &mut SampleSource) -> Result<Vec<EpochMetrics>> {
        log::info!(
            "Training for {} epochs with {} (lr = {}, batch size = {})",
            self.config.num_epochs,
            self.config.optimizer,
            self.config.learning_rate,
            source.batch_size()
        );

        let model = self.model.clone();
        let (model, records) = train(model, source, &self.config, &self.device)?;

        self.model = model;
        self.history.extend(records.iter().cloned());
        Ok(records)
    }

    /// Accuracy of the current parameters on `source`, without gradient tracking.
    pub fn evaluate(&self, source: &SampleSource) -> Result<EvaluationReport> {
        let model = self.model.valid();
        Ok(evaluate(&model, source, &self.device)?)
    }

    /// Classifies one normalized channel-first image (see [`Cifar10Item::from_pixels`]).
    pub fn predict(&self, image: &[f32]) -> Result<Prediction> {
        if image.len() != IMAGE_SIZE {
            return Err(InferenceError::Data(format!(
                "expected {IMAGE_SIZE} values, got {}",
                image.len()
            ))
            .into());
        }

        let model = self.model.valid();
        let data = TensorData::new(image.to_vec(), [1, CHANNELS, HEIGHT, WIDTH]);
        let images = Tensor::<B::InnerBackend, 4>::from_data(
            data.convert::<B::FloatElem>(),
            &self.device,
        );

        let logits = model.forward(images, ForwardMode::Eval);
        let probabilities = softmax(logits, 1)
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .map_err(|err| InferenceError::Data(format!("{err:?}")))?;

        let class_index = probabilities
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(index, _)| index)
            .ok_or_else(|| InferenceError::Data("model produced no scores".to_string()))?;

        Ok(Prediction {
            class_index,
            class_name: CLASSES[class_index],
            probabilities,
        })
    }

    /// Discards the learned parameters and the metrics history.
    pub fn reinitialize(&mut self) {
        self.generation += 1;
        B::seed(self.config.seed.wrapping_add(self.generation));
        self.model = self.config.model.init::<B>(&self.device);
        self.history.clear();
        log::info!("Model parameters reinitialized");
    }

    /// Saves `config.json` and the model record into `artifact_dir`.
    pub fn save<P: AsRef<Path>>(&self, artifact_dir: P) -> Result<()> {
        let artifact_dir = artifact_dir.as_ref();
        std::fs::create_dir_all(artifact_dir).map_err(InferenceError::from)?;

        self.config
            .save(artifact_dir.join(CONFIG_FILE))
            .map_err(InferenceError::from)?;
        self.model
            .clone()
            .save_file(artifact_dir.join(MODEL_FILE), &ModelRecorder::new())
            .map_err(InferenceError::from)?;

        log::info!("Saved model artifacts to {}", artifact_dir.display());
        Ok(())
    }

    /// Restores a session written by [`save`](Self::save). The history starts empty.
    pub fn load<P: AsRef<Path>>(artifact_dir: P, device: B::Device) -> Result<Self> {
        let artifact_dir = artifact_dir.as_ref();
        let config = TrainingConfig::load(artifact_dir.join(CONFIG_FILE))
            .map_err(InferenceError::from)?;
        config.validate()?;

        let model = config
            .model
            .init::<B>(&device)
            .load_file(artifact_dir.join(MODEL_FILE), &ModelRecorder::new(), &device)
            .map_err(InferenceError::from)?;

        Ok(Self {
            config,
            device,
            model,
            history: Vec::new(),
            generation: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Cifar10Item;
    use crate::error::{ConfigError, Error};
    use crate::model::ModelConfig;
    use crate::TestAutodiffBackend;

    fn partition(num_samples: usize) -> Arc<Cifar10Partition> {
        let images = (0..num_samples * IMAGE_SIZE)
            .map(|i| (i % 253) as u8)
            .collect();
        let labels = (0..num_samples).map(|i| (i % 10) as u8).collect();
        Arc::new(Cifar10Partition::from_records(images, labels).unwrap())
    }

    fn config() -> TrainingConfig {
        TrainingConfig::new(ModelConfig::new())
            .with_num_epochs(1)
            .with_batch_size(5)
    }

    #[test]
    fn invalid_config_is_rejected_before_building_the_model() {
        let result = TrainingSession::<TestAutodiffBackend>::new(
            config().with_batch_size(0),
            Default::default(),
        );

        assert!(matches!(
            result,
            Err(Error::Config(ConfigError::ZeroBatchSize))
        ));
    }

    #[test]
    fn history_accumulates_across_train_calls() {
        let mut session =
            TrainingSession::<TestAutodiffBackend>::new(config(), Default::default()).unwrap();
        let mut source = session.train_source(partition(10)).unwrap();

        session.train(&mut source).unwrap();
        session.train(&mut source).unwrap();

        assert_eq!(session.history().len(), 2);

        session.reinitialize();
        assert!(session.history().is_empty());
    }

    #[test]
    fn evaluation_does_not_touch_parameters() {
        let session =
            TrainingSession::<TestAutodiffBackend>::new(config(), Default::default()).unwrap();
        let source = session.test_source(partition(6)).unwrap();
        let sample = Cifar10Item::from_pixels(&[90; IMAGE_SIZE], 1);
        let before = session.predict(&sample.image).unwrap();

        let first = session.evaluate(&source).unwrap();
        let second = session.evaluate(&source).unwrap();

        assert_eq!(first, second);
        assert_eq!(session.predict(&sample.image).unwrap(), before);
    }

    #[test]
    fn prediction_is_a_probability_distribution() {
        let session =
            TrainingSession::<TestAutodiffBackend>::new(config(), Default::default()).unwrap();
        let item = Cifar10Item::from_pixels(&[128; IMAGE_SIZE], 0);

        let prediction = session.predict(&item.image).unwrap();

        assert_eq!(prediction.probabilities.len(), CLASSES.len());
        let total: f32 = prediction.probabilities.iter().sum();
        assert!((total - 1.0).abs() < 1e-4);
        assert_eq!(prediction.class_name, CLASSES[prediction.class_index]);
    }

    #[test]
    fn saved_session_reloads_with_the_same_predictions() {
        let dir = tempfile::tempdir().unwrap();
        let session =
            TrainingSession::<TestAutodiffBackend>::new(config(), Default::default()).unwrap();
        let item = Cifar10Item::from_pixels(&[17; IMAGE_SIZE], 3);

        session.save(dir.path()).unwrap();
        let loaded =
            TrainingSession::<TestAutodiffBackend>::load(dir.path(), Default::default()).unwrap();

        assert_eq!(loaded.config().batch_size, 5);
        let expected = session.predict(&item.image).unwrap();
        let actual = loaded.predict(&item.image).unwrap();
        assert_eq!(expected.class_index, actual.class_index);
        for (e, a) in expected.probabilities.iter().zip(&actual.probabilities) {
            assert!((e - a).abs() < 1e-6);
        }
    }
}
