//! Segmentation network capability and the default fully convolutional model.

use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        BatchNorm, BatchNormConfig, PaddingConfig2d, Relu,
    },
    tensor::{backend::Backend, Tensor},
};

/// A network that maps images to per-pixel class logits.
///
/// Any Burn module implementing this can be trained and validated.
pub trait SegmentationModel<B: Backend>: Module<B> {
    /// `[N, 3, H, W]` images to `[N, num_classes, H, W]` logits
    fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 4>;

    fn num_classes(&self) -> usize;
}

/// Configuration for [`TinySegNet`]
#[derive(Config, Debug)]
pub struct TinySegNetConfig {
    /// Number of output classes
    pub num_classes: usize,

    /// Width of the first block; the middle block is twice as wide
    #[config(default = "16")]
    pub base_channels: usize,

    /// Number of input channels (3 for RGB)
    #[config(default = "3")]
    pub in_channels: usize,
}

impl TinySegNetConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> TinySegNet<B> {
        let base = self.base_channels;

        let head = Conv2dConfig::new([base, self.num_classes], [1, 1]).init(device);

        TinySegNet {
            block1: ConvBlock::new(self.in_channels, base, device),
            block2: ConvBlock::new(base, base * 2, device),
            block3: ConvBlock::new(base * 2, base, device),
            head,
            num_classes: self.num_classes,
        }
    }
}

/// Conv 3x3 + BatchNorm + ReLU, resolution preserving
#[derive(Module, Debug)]
pub struct ConvBlock<B: Backend> {
    conv: Conv2d<B>,
    bn: BatchNorm<B, 2>,
    relu: Relu,
}

impl<B: Backend> ConvBlock<B> {
    fn new(in_channels: usize, out_channels: usize, device: &B::Device) -> Self {
        let conv = Conv2dConfig::new([in_channels, out_channels], [3, 3])
            .with_padding(PaddingConfig2d::Same)
            .init(device);

        Self {
            conv,
            bn: BatchNormConfig::new(out_channels).init(device),
            relu: Relu::new(),
        }
    }

    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv.forward(x);
        let x = self.bn.forward(x);
        self.relu.forward(x)
    }
}

/// Small fully convolutional segmentation network.
///
/// Three conv blocks followed by a 1x1 classifier; output keeps the input
/// resolution so any chip size works.
#[derive(Module, Debug)]
pub struct TinySegNet<B: Backend> {
    block1: ConvBlock<B>,
    block2: ConvBlock<B>,
    block3: ConvBlock<B>,
    head: Conv2d<B>,
    num_classes: usize,
}

impl<B: Backend> SegmentationModel<B> for TinySegNet<B> {
    fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.block1.forward(images);
        let x = self.block2.forward(x);
        let x = self.block3.forward(x);
        self.head.forward(x)
    }

    fn num_classes(&self) -> usize {
        self.num_classes
    }
}
