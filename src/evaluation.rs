use burn::{nn::loss::CrossEntropyLossConfig, prelude::*};
use serde::{Deserialize, Serialize};

use crate::data::SampleSource;
use crate::dataset::NUM_CLASSES;
use crate::error::EvaluationError;
use crate::model::{Cifar10Cnn, ForwardMode};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassTally {
    pub correct: usize,
    pub total: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationReport {
    /// Percentage of correctly classified samples, in `[0, 100]`.
    pub accuracy: f64,
    pub correct: usize,
    pub total: usize,
    pub mean_loss: f64,
    pub per_class: [ClassTally; NUM_CLASSES],
}

/// Runs the model once over every test batch, in partition order.
///
/// Pass a model without gradient tracking (see `AutodiffModule::valid`); dropout is disabled
/// through [`ForwardMode::Eval`] whatever the backend.
pub fn evaluate<B: Backend>(
    model: &Cifar10Cnn<B>,
    source: &SampleSource,
    device: &B::Device,
) -> Result<EvaluationReport, EvaluationError> {
    let batches = source.sequential_batches();
    if batches.is_empty() {
        return Err(EvaluationError::EmptyPartition);
    }

    let loss_fn = CrossEntropyLossConfig::new().init(device);
    let mut per_class = [ClassTally::default(); NUM_CLASSES];
    let mut loss_sum = 0.0;

    for indices in &batches {
        let batch = source.batch::<B>(indices, device);
        let logits = model.forward(batch.images, ForwardMode::Eval);
        let loss = loss_fn.forward(logits.clone(), batch.targets.clone());
        loss_sum += loss.into_scalar().elem::<f64>();

        let predictions = to_labels(predict_labels(logits))?;
        let targets = to_labels(batch.targets)?;
        for (predicted, target) in predictions.into_iter().zip(targets) {
            let tally = &mut per_class[target];
            tally.total += 1;
            if predicted == target {
                tally.correct += 1;
            }
        }
    }

    let report = summarize(per_class, loss_sum / batches.len() as f64)?;
    log::info!(
        "Accuracy on test set: {:.2}% ({}/{})",
        report.accuracy,
        report.correct,
        report.total
    );

    Ok(report)
}

fn summarize(
    per_class: [ClassTally; NUM_CLASSES],
    mean_loss: f64,
) -> Result<EvaluationReport, EvaluationError> {
    let total: usize = per_class.iter().map(|tally| tally.total).sum();
    let correct: usize = per_class.iter().map(|tally| tally.correct).sum();
    if total == 0 {
        return Err(EvaluationError::EmptyPartition);
    }

    Ok(EvaluationReport {
        accuracy: 100.0 * correct as f64 / total as f64,
        correct,
        total,
        mean_loss,
        per_class,
    })
}

/// Index of the highest scoring class for each row of `logits`.
pub fn predict_labels<B: Backend>(logits: Tensor<B, 2>) -> Tensor<B, 1, Int> {
    logits.argmax(1).squeeze::<1>(1)
}

/// Number of rows whose highest scoring class equals the target.
pub fn count_correct<B: Backend>(logits: Tensor<B, 2>, targets: Tensor<B, 1, Int>) -> usize {
    predict_labels(logits)
        .equal(targets)
        .int()
        .sum()
        .into_scalar()
        .elem::<i64>() as usize
}

fn to_labels<B: Backend>(tensor: Tensor<B, 1, Int>) -> Result<Vec<usize>, EvaluationError> {
    let labels = tensor
        .into_data()
        .convert::<i64>()
        .to_vec::<i64>()
        .map_err(|err| EvaluationError::TensorData(format!("{err:?}")))?;

    labels
        .into_iter()
        .map(|label| {
            usize::try_from(label)
                .ok()
                .filter(|&label| label < NUM_CLASSES)
                .ok_or_else(|| EvaluationError::TensorData(format!("label {label} out of range")))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::dataset::{Cifar10Partition, IMAGE_SIZE};
    use crate::model::ModelConfig;
    use crate::TestBackend;

    fn source(num_samples: usize) -> SampleSource {
        let images = (0..num_samples * IMAGE_SIZE).map(|i| (i * 7 % 256) as u8).collect();
        let labels = (0..num_samples).map(|i| (i % 10) as u8).collect();
        let partition = Cifar10Partition::from_records(images, labels).unwrap();
        SampleSource::test(Arc::new(partition), 4).unwrap()
    }

    #[test]
    fn empty_partition_is_an_error() {
        let device = Default::default();
        let model = ModelConfig::new().init::<TestBackend>(&device);

        let result = evaluate(&model, &source(0), &device);

        assert_eq!(result.unwrap_err(), EvaluationError::EmptyPartition);
    }

    #[test]
    fn evaluation_is_deterministic_and_bounded() {
        let device = Default::default();
        let model = ModelConfig::new().init::<TestBackend>(&device);
        let source = source(10);

        let first = evaluate(&model, &source, &device).unwrap();
        let second = evaluate(&model, &source, &device).unwrap();

        assert_eq!(first, second);
        assert_eq!(first.total, 10);
        assert!((0.0..=100.0).contains(&first.accuracy));
        assert_eq!(first.per_class.iter().map(|t| t.total).sum::<usize>(), 10);
    }

    #[test]
    fn no_tallied_samples_is_an_error_not_nan() {
        let result = summarize([ClassTally::default(); NUM_CLASSES], 0.0);

        assert_eq!(result.unwrap_err(), EvaluationError::EmptyPartition);
    }

    #[test]
    fn accuracy_is_a_percentage_of_tallied_samples() {
        let mut per_class = [ClassTally::default(); NUM_CLASSES];
        per_class[0] = ClassTally { correct: 1, total: 2 };
        per_class[4] = ClassTally { correct: 2, total: 2 };

        let report = summarize(per_class, 1.5).unwrap();

        assert_eq!(report.total, 4);
        assert_eq!(report.correct, 3);
        assert_eq!(report.accuracy, 75.0);
    }

    #[test]
    fn labels_are_read_back_from_the_device() {
        let device = Default::default();
        let tensor = Tensor::<TestBackend, 1, Int>::from_ints([3, 0, 9], &device);

        assert_eq!(to_labels(tensor).unwrap(), vec![3, 0, 9]);
    }

    #[test]
    fn negative_label_is_reported() {
        let device = Default::default();
        let tensor = Tensor::<TestBackend, 1, Int>::from_ints([1, -1], &device);

        assert!(matches!(
            to_labels(tensor),
            Err(EvaluationError::TensorData(_))
        ));
    }

    #[test]
    fn counts_matching_predictions() {
        let device = Default::default();
        let logits = Tensor::<TestBackend, 2>::from_floats(
            [[0.1, 0.9, 0.0], [0.8, 0.1, 0.1], [0.0, 0.2, 0.7]],
            &device,
        );
        let targets = Tensor::<TestBackend, 1, Int>::from_ints([1, 2, 2], &device);

        assert_eq!(count_correct(logits, targets), 2);
    }
}
