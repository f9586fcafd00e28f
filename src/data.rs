use std::sync::Arc;

use burn::{
    data::{dataloader::batcher::Batcher, dataset::Dataset},
    prelude::*,
};
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

use crate::dataset::{Cifar10Partition, CHANNELS, HEIGHT, IMAGE_SIZE, WIDTH};
use crate::error::ConfigError;

/// A single image rescaled to `[0, 1]`, channel-first `[3, 32, 32]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Cifar10Item {
    pub image: Vec<f32>,
    pub label: u8,
}

impl Cifar10Item {
    /// Normalizes raw channel-first pixel bytes.
    pub fn from_pixels(pixels: &[u8], label: u8) -> Self {
        debug_assert_eq!(pixels.len(), IMAGE_SIZE);

        Self {
            image: pixels.iter().map(|&p| p as f32 / 255.0).collect(),
            label,
        }
    }
}

/// Order in which a [`SampleSource`] hands out indices over an epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOrder {
    /// Fresh random permutation every epoch.
    Shuffled,
    /// Partition order, identical across epochs.
    Sequential,
}

/// Serves normalized samples and mini-batch index groups from a partition.
pub struct SampleSource {
    partition: Arc<Cifar10Partition>,
    batch_size: usize,
    order: BatchOrder,
    rng: StdRng,
}

impl SampleSource {
    pub fn new(
        partition: Arc<Cifar10Partition>,
        batch_size: usize,
        order: BatchOrder,
        seed: u64,
    ) -> Result<Self, ConfigError> {
        if batch_size == 0 {
            return Err(ConfigError::ZeroBatchSize);
        }

        Ok(Self {
            partition,
            batch_size,
            order,
            rng: StdRng::seed_from_u64(seed),
        })
    }

    /// Source for training: shuffled every epoch.
    pub fn train(
        partition: Arc<Cifar10Partition>,
        batch_size: usize,
        seed: u64,
    ) -> Result<Self, ConfigError> {
        Self::new(partition, batch_size, BatchOrder::Shuffled, seed)
    }

    /// Source for evaluation: fixed order.
    pub fn test(partition: Arc<Cifar10Partition>, batch_size: usize) -> Result<Self, ConfigError> {
        Self::new(partition, batch_size, BatchOrder::Sequential, 0)
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn order(&self) -> BatchOrder {
        self.order
    }

    /// Number of mini-batches per epoch, counting a trailing partial batch.
    pub fn num_batches(&self) -> usize {
        self.partition.len().div_ceil(self.batch_size)
    }

    /// Index groups covering the partition once, in partition order.
    pub fn sequential_batches(&self) -> Vec<Vec<usize>> {
        let indices: Vec<usize> = (0..self.partition.len()).collect();
        self.chunk(&indices)
    }

    /// Index groups for the next epoch, following the configured [`BatchOrder`].
    pub fn epoch_batches(&mut self) -> Vec<Vec<usize>> {
        match self.order {
            BatchOrder::Sequential => self.sequential_batches(),
            BatchOrder::Shuffled => {
                let mut indices: Vec<usize> = (0..self.partition.len()).collect();
                indices.shuffle(&mut self.rng);
                self.chunk(&indices)
            }
        }
    }

    /// Stacks the samples at `indices` into backend tensors.
    ///
    /// # Panics
    ///
    /// If an index is outside the partition. Indices come from [`epoch_batches`](Self::epoch_batches)
    /// or [`sequential_batches`](Self::sequential_batches), which never produce one.
    pub fn batch<B: Backend>(&self, indices: &[usize], device: &B::Device) -> Cifar10Batch<B> {
        let items = indices
            .iter()
            .map(|&index| {
                self.get(index).unwrap_or_else(|| {
                    panic!(
                        "sample index {index} out of range for a partition of {} samples",
                        self.partition.len()
                    )
                })
            })
            .collect::<Vec<_>>();

        Batcher::<B, Cifar10Item, Cifar10Batch<B>>::batch(&Cifar10Batcher, items, device)
    }

    fn chunk(&self, indices: &[usize]) -> Vec<Vec<usize>> {
        indices
            .chunks(self.batch_size)
            .map(|chunk| chunk.to_vec())
            .collect()
    }
}

impl Dataset<Cifar10Item> for SampleSource {
    fn get(&self, index: usize) -> Option<Cifar10Item> {
        let pixels = self.partition.image(index)?;
        let label = self.partition.label(index)?;

        Some(Cifar10Item::from_pixels(pixels, label))
    }

    fn len(&self) -> usize {
        self.partition.len()
    }
}

#[derive(Clone, Debug)]
pub struct Cifar10Batch<B: Backend> {
    /// `[batch_size, 3, 32, 32]`
    pub images: Tensor<B, 4>,
    /// `[batch_size]`
    pub targets: Tensor<B, 1, Int>,
}

#[derive(Clone, Debug, Default)]
pub struct Cifar10Batcher;

impl<B: Backend> Batcher<B, Cifar10Item, Cifar10Batch<B>> for Cifar10Batcher {
    fn batch(&self, items: Vec<Cifar10Item>, device: &B::Device) -> Cifar10Batch<B> {
        let batch_size = items.len();

        let targets = items
            .iter()
            .map(|item| item.label as i64)
            .collect::<Vec<_>>();
        let pixels = items
            .into_iter()
            .flat_map(|item| item.image)
            .collect::<Vec<_>>();

        let images = TensorData::new(pixels, Shape::new([batch_size, CHANNELS, HEIGHT, WIDTH]));
        let images = Tensor::<B, 4>::from_data(images.convert::<B::FloatElem>(), device);

        let targets = TensorData::new(targets, Shape::new([batch_size]));
        let targets = Tensor::<B, 1, Int>::from_data(targets.convert::<B::IntElem>(), device);

        Cifar10Batch { images, targets }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TestBackend;

    fn partition(num_samples: usize) -> Arc<Cifar10Partition> {
        let images = (0..num_samples * IMAGE_SIZE)
            .map(|i| (i % 256) as u8)
            .collect();
        let labels = (0..num_samples).map(|i| (i % 10) as u8).collect();
        Arc::new(Cifar10Partition::from_records(images, labels).unwrap())
    }

    fn sorted(batches: &[Vec<usize>]) -> Vec<usize> {
        let mut visited = batches.concat();
        visited.sort_unstable();
        visited
    }

    #[test]
    fn shuffled_epoch_visits_every_sample_once() {
        let mut source = SampleSource::train(partition(103), 10, 7).unwrap();

        for _ in 0..3 {
            let batches = source.epoch_batches();
            assert_eq!(sorted(&batches), (0..103).collect::<Vec<_>>());
        }
    }

    #[test]
    fn last_partial_batch_is_kept() {
        let mut source = SampleSource::train(partition(103), 10, 7).unwrap();

        let batches = source.epoch_batches();

        assert_eq!(batches.len(), 11);
        assert_eq!(source.num_batches(), 11);
        assert_eq!(batches.last().unwrap().len(), 3);
    }

    #[test]
    fn shuffled_order_changes_between_epochs() {
        let mut source = SampleSource::train(partition(64), 64, 3).unwrap();

        let first = source.epoch_batches();
        let second = source.epoch_batches();

        assert_ne!(first, second);
    }

    #[test]
    fn sequential_order_is_stable() {
        let mut source = SampleSource::test(partition(25), 8).unwrap();

        let first = source.epoch_batches();
        let second = source.epoch_batches();

        assert_eq!(first, second);
        assert_eq!(first[0], (0..8).collect::<Vec<_>>());
        assert_eq!(first[3], vec![24]);
    }

    #[test]
    fn normalization_is_stable_under_reaccess() {
        let source = SampleSource::test(partition(4), 2).unwrap();

        let first = source.get(2).unwrap();
        let second = source.get(2).unwrap();

        assert_eq!(first, second);
        assert_eq!(first.image.len(), IMAGE_SIZE);
        assert!(first.image.iter().all(|&p| (0.0..=1.0).contains(&p)));
        assert_eq!(first.image[0], (2 * IMAGE_SIZE % 256) as f32 / 255.0);
        assert_eq!(first.label, 2);
    }

    #[test]
    fn out_of_range_index_yields_none() {
        let source = SampleSource::test(partition(4), 2).unwrap();

        assert!(source.get(4).is_none());
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let result = SampleSource::train(partition(4), 0, 1);

        assert!(matches!(result, Err(ConfigError::ZeroBatchSize)));
    }

    #[test]
    #[should_panic(expected = "sample index 7 out of range")]
    fn batching_an_unknown_index_panics() {
        let source = SampleSource::test(partition(4), 2).unwrap();
        let device = Default::default();

        source.batch::<TestBackend>(&[1, 7], &device);
    }

    #[test]
    fn batcher_builds_channel_first_tensors() {
        let source = SampleSource::test(partition(5), 4).unwrap();
        let device = Default::default();

        let batch = source.batch::<TestBackend>(&[0, 3, 4], &device);

        assert_eq!(batch.images.dims(), [3, CHANNELS, HEIGHT, WIDTH]);
        assert_eq!(batch.targets.dims(), [3]);
        let targets = batch.targets.into_data().convert::<i64>().to_vec::<i64>().unwrap();
        assert_eq!(targets, vec![0, 3, 4]);
    }
}
