use burn::{
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{MaxPool2d, MaxPool2dConfig},
        Dropout, DropoutConfig, Linear, LinearConfig, PaddingConfig2d, Relu,
    },
    prelude::*,
};

use crate::dataset::{CHANNELS, NUM_CLASSES};

/// Channel depth after each convolution stage.
const STAGE_CHANNELS: [usize; 3] = [32, 64, 128];
/// Spatial size after the third pooling layer (32 -> 16 -> 8 -> 4).
const FEATURE_MAP_SIZE: usize = 4;
const FLATTENED_FEATURES: usize = 128 * FEATURE_MAP_SIZE * FEATURE_MAP_SIZE;

/// Whether the forward pass is part of a training step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardMode {
    /// Dropout active.
    ///
    /// Burn's dropout only samples masks on an autodiff backend; on a plain inference backend
    /// this behaves like [`Eval`](Self::Eval). The training loop always runs on an autodiff
    /// backend.
    Train,
    /// Dropout is the identity.
    Eval,
}

#[derive(Config, Debug)]
pub struct ModelConfig {
    #[config(default = 10)]
    pub num_classes: usize,
    #[config(default = 256)]
    pub hidden_size: usize,
    #[config(default = 0.5)]
    pub dropout: f64,
}

/// Three conv/ReLU/max-pool stages followed by two fully connected layers.
#[derive(Module, Debug)]
pub struct Cifar10Cnn<B: Backend> {
    conv1: Conv2d<B>,
    conv2: Conv2d<B>,
    conv3: Conv2d<B>,
    pool: MaxPool2d,
    fc1: Linear<B>,
    fc2: Linear<B>,
    dropout: Dropout,
    activation: Relu,
}

impl ModelConfig {
    /// Returns the initialized model with random parameters.
    pub fn init<B: Backend>(&self, device: &B::Device) -> Cifar10Cnn<B> {
        let conv = |channels_in: usize, channels_out: usize| {
            Conv2dConfig::new([channels_in, channels_out], [3, 3])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .init(device)
        };

        Cifar10Cnn {
            conv1: conv(CHANNELS, STAGE_CHANNELS[0]),
            conv2: conv(STAGE_CHANNELS[0], STAGE_CHANNELS[1]),
            conv3: conv(STAGE_CHANNELS[1], STAGE_CHANNELS[2]),
            pool: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
            fc1: LinearConfig::new(FLATTENED_FEATURES, self.hidden_size).init(device),
            fc2: LinearConfig::new(self.hidden_size, self.num_classes).init(device),
            dropout: DropoutConfig::new(self.dropout).init(),
            activation: Relu::new(),
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: Backend> Cifar10Cnn<B> {
    /// # Shapes
    ///   - Images `[batch_size, 3, 32, 32]`
    ///   - Output `[batch_size, num_classes]`, raw logits
    pub fn forward(&self, images: Tensor<B, 4>, mode: ForwardMode) -> Tensor<B, 2> {
        let [batch_size, _, _, _] = images.dims();

        let x = self.stage(&self.conv1, images); // [batch_size, 32, 16, 16]
        let x = self.stage(&self.conv2, x); // [batch_size, 64, 8, 8]
        let x = self.stage(&self.conv3, x); // [batch_size, 128, 4, 4]

        let x = x.reshape([batch_size, FLATTENED_FEATURES]);
        let x = self.activation.forward(self.fc1.forward(x));
        let x = match mode {
            ForwardMode::Train => self.dropout.forward(x),
            ForwardMode::Eval => x,
        };

        self.fc2.forward(x)
    }

    fn stage(&self, conv: &Conv2d<B>, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.pool.forward(self.activation.forward(conv.forward(x)))
    }

    /// One line per layer with its output shape and parameter count.
    pub fn summary(&self) -> String {
        let conv_params = |c_in: usize, c_out: usize| c_in * c_out * 9 + c_out;
        // Linear weights are stored as [d_input, d_output].
        let [hidden, classes] = self.fc2.weight.dims();
        let rows = [
            ("conv1 + relu + pool", "[32, 16, 16]".to_string(), conv_params(CHANNELS, 32)),
            ("conv2 + relu + pool", "[64, 8, 8]".to_string(), conv_params(32, 64)),
            ("conv3 + relu + pool", "[128, 4, 4]".to_string(), conv_params(64, 128)),
            ("fc1 + relu + dropout", format!("[{hidden}]"), FLATTENED_FEATURES * hidden + hidden),
            ("fc2", format!("[{classes}]"), hidden * classes + classes),
        ];

        let mut summary = String::new();
        for (layer, shape, params) in rows {
            summary.push_str(&format!("{layer:<22} {shape:<14} {params:>10}\n"));
        }
        summary.push_str(&format!("{:<22} {:<14} {:>10}", "total", "", self.num_params()));
        summary
    }
}
