use burn::{
    module::AutodiffModule,
    nn::loss::CrossEntropyLossConfig,
    optim::{momentum::MomentumConfig, AdamConfig, GradientsParams, Optimizer, SgdConfig},
    prelude::*,
    tensor::backend::AutodiffBackend,
};
use serde::{Deserialize, Serialize};

use crate::config::{OptimizerKind, TrainingConfig};
use crate::data::SampleSource;
use crate::error::TrainingDivergedError;
use crate::evaluation::count_correct;
use crate::model::{Cifar10Cnn, ForwardMode};

/// Summary of one completed training epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochMetrics {
    /// 1-based.
    pub epoch: usize,
    /// Mean of the batch losses over the whole epoch.
    pub loss: f64,
    /// Percentage of correctly classified training samples, in `[0, 100]`.
    pub accuracy: f64,
    /// Optimizer steps taken during the epoch.
    pub num_batches: usize,
    pub num_samples: usize,
    /// Mean loss of each `log_interval` window, in the order they were logged.
    #[serde(default)]
    pub window_losses: Vec<f64>,
}

/// Running counters for the current epoch and for the progress log window.
#[derive(Default)]
struct EpochTracker {
    loss_sum: f64,
    correct: usize,
    samples: usize,
    batches: usize,
    window_loss_sum: f64,
    window_batches: usize,
    window_losses: Vec<f64>,
}

impl EpochTracker {
    fn record(&mut self, loss: f64, correct: usize, samples: usize) {
        self.loss_sum += loss;
        self.correct += correct;
        self.samples += samples;
        self.batches += 1;
        self.window_loss_sum += loss;
        self.window_batches += 1;
    }

    fn take_window_mean(&mut self) -> f64 {
        let mean = self.window_loss_sum / self.window_batches.max(1) as f64;
        self.window_loss_sum = 0.0;
        self.window_batches = 0;
        self.window_losses.push(mean);
        mean
    }

    fn finish(self, epoch: usize) -> EpochMetrics {
        let (loss, accuracy) = match self.batches {
            0 => (0.0, 0.0),
            _ => (
                self.loss_sum / self.batches as f64,
                100.0 * self.correct as f64 / self.samples as f64,
            ),
        };

        EpochMetrics {
            epoch,
            loss,
            accuracy,
            num_batches: self.batches,
            num_samples: self.samples,
            window_losses: self.window_losses,
        }
    }
}

/// Trains `model` for `config.num_epochs` epochs and returns it along with one record per epoch.
///
/// The optimizer is built from `config.optimizer` and lives for the duration of the call.
pub fn train<B: AutodiffBackend>(
    model: Cifar10Cnn<B>,
    source: &mut SampleSource,
    config: &TrainingConfig,
    device: &B::Device,
) -> Result<(Cifar10Cnn<B>, Vec<EpochMetrics>), TrainingDivergedError> {
    match config.optimizer {
        OptimizerKind::Adam => {
            let optim = AdamConfig::new().init::<B, Cifar10Cnn<B>>();
            run_epochs(model, optim, source, config, device)
        }
        OptimizerKind::Sgd => {
            let momentum = MomentumConfig::new()
                .with_momentum(config.momentum)
                .with_dampening(0.0);
            let optim = SgdConfig::new()
                .with_momentum(Some(momentum))
                .init::<B, Cifar10Cnn<B>>();
            run_epochs(model, optim, source, config, device)
        }
    }
}

fn run_epochs<B, O>(
    mut model: Cifar10Cnn<B>,
    mut optim: O,
    source: &mut SampleSource,
    config: &TrainingConfig,
    device: &B::Device,
) -> Result<(Cifar10Cnn<B>, Vec<EpochMetrics>), TrainingDivergedError>
where
    B: AutodiffBackend,
    O: Optimizer<Cifar10Cnn<B>, B>,
    Cifar10Cnn<B>: AutodiffModule<B>,
{
    let loss_fn = CrossEntropyLossConfig::new().init(device);
    let mut history = Vec::with_capacity(config.num_epochs);

    for epoch in 1..=config.num_epochs {
        let mut tracker = EpochTracker::default();

        for (batch_index, indices) in source.epoch_batches().iter().enumerate() {
            let batch = source.batch::<B>(indices, device);

            let logits = model.forward(batch.images, ForwardMode::Train);
            let loss = loss_fn.forward(logits.clone(), batch.targets.clone());
            let loss_value = loss.clone().into_scalar().elem::<f64>();

            if !loss_value.is_finite() && config.halt_on_divergence {
                return Err(TrainingDivergedError {
                    epoch,
                    batch: batch_index + 1,
                    loss: loss_value,
                });
            }

            let correct = count_correct(logits.detach(), batch.targets);

            // Gradients are produced fresh by each backward pass, nothing carries over.
            let grads = GradientsParams::from_grads(loss.backward(), &model);
            model = optim.step(config.learning_rate, model, grads);

            tracker.record(loss_value, correct, indices.len());

            if (batch_index + 1) % config.log_interval == 0 {
                log::info!(
                    "Epoch {epoch}, Batch {}, Loss: {:.4}",
                    batch_index + 1,
                    tracker.take_window_mean()
                );
            }
        }

        let metrics = tracker.finish(epoch);
        log::info!(
            "Epoch {}/{} finished: loss {:.4}, accuracy {:.2}% over {} batches",
            epoch,
            config.num_epochs,
            metrics.loss,
            metrics.accuracy,
            metrics.num_batches
        );
        history.push(metrics);
    }

    log::info!("Finished Training");
    Ok((model, history))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::dataset::{Cifar10Partition, IMAGE_SIZE};
    use crate::model::ModelConfig;
    use crate::TestAutodiffBackend;

    fn source(num_samples: usize, batch_size: usize) -> SampleSource {
        let images = (0..num_samples * IMAGE_SIZE)
            .map(|i| ((i / IMAGE_SIZE) * 25 % 256) as u8)
            .collect();
        let labels = (0..num_samples).map(|i| (i % 10) as u8).collect();
        let partition = Cifar10Partition::from_records(images, labels).unwrap();
        SampleSource::train(Arc::new(partition), batch_size, 1).unwrap()
    }

    fn run(
        config: &TrainingConfig,
        source: &mut SampleSource,
    ) -> Result<Vec<EpochMetrics>, TrainingDivergedError> {
        let device = Default::default();
        let model = config.model.init::<TestAutodiffBackend>(&device);
        train(model, source, config, &device).map(|(_, history)| history)
    }

    #[test]
    fn one_record_per_epoch() {
        let config = TrainingConfig::new(ModelConfig::new())
            .with_num_epochs(2)
            .with_batch_size(8);
        let mut source = source(20, 8);

        let history = run(&config, &mut source).unwrap();

        assert_eq!(history.len(), 2);
        for (i, metrics) in history.iter().enumerate() {
            assert_eq!(metrics.epoch, i + 1);
            assert_eq!(metrics.num_batches, 3);
            assert_eq!(metrics.num_samples, 20);
            assert!(metrics.loss.is_finite());
            assert!((0.0..=100.0).contains(&metrics.accuracy));
        }
    }

    #[test]
    fn sgd_with_momentum_trains() {
        let config = TrainingConfig::new(ModelConfig::new())
            .with_num_epochs(1)
            .with_batch_size(5)
            .with_learning_rate(0.01)
            .with_optimizer(OptimizerKind::Sgd);
        let mut source = source(10, 5);

        let history = run(&config, &mut source).unwrap();

        assert_eq!(history.len(), 1);
        assert_eq!(history[0].num_batches, 2);
    }

    #[test]
    fn non_finite_loss_stops_training() {
        let config = TrainingConfig::new(ModelConfig::new())
            .with_num_epochs(1)
            .with_batch_size(4)
            .with_learning_rate(f64::INFINITY);
        let mut source = source(12, 4);

        let err = run(&config, &mut source).unwrap_err();

        assert_eq!(err.epoch, 1);
        assert!(err.batch > 1);
        assert!(!err.loss.is_finite());
    }

    #[test]
    fn non_finite_loss_propagates_when_not_halting() {
        let config = TrainingConfig::new(ModelConfig::new())
            .with_num_epochs(1)
            .with_batch_size(4)
            .with_learning_rate(f64::INFINITY)
            .with_halt_on_divergence(false);
        let mut source = source(12, 4);

        let history = run(&config, &mut source).unwrap();

        assert_eq!(history[0].num_batches, 3);
        assert!(!history[0].loss.is_finite());
    }

    #[test]
    fn epoch_mean_covers_every_batch() {
        let mut tracker = EpochTracker::default();
        tracker.record(1.0, 2, 4);
        tracker.record(3.0, 1, 4);
        assert_eq!(tracker.take_window_mean(), 2.0);
        tracker.record(5.0, 4, 4);

        let metrics = tracker.finish(1);

        assert_eq!(metrics.loss, 3.0);
        assert_eq!(metrics.accuracy, 100.0 * 7.0 / 12.0);
        assert_eq!(metrics.num_batches, 3);
        assert_eq!(metrics.window_losses, vec![2.0]);
    }

    #[test]
    fn progress_windows_reset_every_log_interval() {
        let config = TrainingConfig::new(ModelConfig::new())
            .with_num_epochs(1)
            .with_batch_size(4)
            .with_log_interval(2);
        let mut source = source(16, 4);

        let history = run(&config, &mut source).unwrap();

        let metrics = &history[0];
        assert_eq!(metrics.num_batches, 4);
        assert_eq!(metrics.window_losses.len(), 2);
        assert!(metrics.window_losses.iter().all(|loss| loss.is_finite()));
        // Two windows of two batches each: their mean is the epoch mean.
        let windows_mean = metrics.window_losses.iter().sum::<f64>() / 2.0;
        assert!((windows_mean - metrics.loss).abs() < 1e-9);
    }
}
