//! ResNet feature extractor for the Mask R-CNN feature pyramid.
//!
//! The network follows the Caffe/Keras ResNet layout used by the COCO
//! Mask R-CNN checkpoints: the stride of a downsampling bottleneck sits on
//! its first 1x1 convolution. Stages are named `res2`..`res5` after the
//! feature maps `C2`..`C5` they produce.

use burn::nn::{
    conv::{Conv2d, Conv2dConfig},
    pool::{MaxPool2d, MaxPool2dConfig},
    BatchNorm, BatchNormConfig, Initializer, PaddingConfig2d, Relu,
};
use burn::prelude::*;
use core::f64::consts::SQRT_2;

mod blocks;
pub use blocks::*;

/// Supported backbone depths.
#[derive(Config, Debug, Copy, PartialEq, Eq)]
pub enum ResNetDepth {
    Resnet18,
    Resnet34,
    Resnet50,
    Resnet101,
}

impl ResNetDepth {
    /// Residual blocks in `res2`..`res5`.
    pub const fn blocks(&self) -> [usize; 4] {
        match self {
            Self::Resnet18 => [2, 2, 2, 2],
            Self::Resnet34 | Self::Resnet50 => [3, 4, 6, 3],
            Self::Resnet101 => [3, 4, 23, 3],
        }
    }

    /// Whether the stages are built from bottleneck blocks.
    pub const fn bottleneck(&self) -> bool {
        matches!(self, Self::Resnet50 | Self::Resnet101)
    }

    /// Channel count of `C2`..`C5`.
    pub const fn out_channels(&self) -> [usize; 4] {
        if self.bottleneck() {
            [256, 512, 1024, 2048]
        } else {
            [64, 128, 256, 512]
        }
    }
}

/// Stage of the backbone, used to decide which layers are trained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ResNetStage {
    Stem,
    Res2,
    Res3,
    Res4,
    Res5,
}

impl ResNetStage {
    pub const ALL: [Self; 5] = [Self::Stem, Self::Res2, Self::Res3, Self::Res4, Self::Res5];
}

/// Feature maps of one forward pass, from the finest to the coarsest.
#[derive(Debug, Clone)]
pub struct ResNetFeatures<B: Backend> {
    /// Stride 4.
    pub c2: Tensor<B, 4>,
    /// Stride 8.
    pub c3: Tensor<B, 4>,
    /// Stride 16.
    pub c4: Tensor<B, 4>,
    /// Stride 32.
    pub c5: Tensor<B, 4>,
}

#[derive(Module, Debug)]
pub struct ResNetBackbone<B: Backend> {
    pub stem: Stem<B>,
    pub res2: Stage<B>,
    pub res3: Stage<B>,
    pub res4: Stage<B>,
    pub res5: Stage<B>,
}

impl<B: Backend> ResNetBackbone<B> {
    pub fn forward(&self, input: Tensor<B, 4>) -> ResNetFeatures<B> {
        let x = self.stem.forward(input);
        let c2 = self.res2.forward(x);
        let c3 = self.res3.forward(c2.clone());
        let c4 = self.res4.forward(c3.clone());
        let c5 = self.res5.forward(c4.clone());

        ResNetFeatures { c2, c3, c4, c5 }
    }

    pub fn new(depth: ResNetDepth, device: &Device<B>) -> Self {
        let blocks = depth.blocks();
        let channels = depth.out_channels();
        let bottleneck = depth.bottleneck();

        Self {
            stem: Stem::new(3, 64, device),
            // res2 keeps the stem resolution, every later stage halves it
            res2: Stage::new(blocks[0], 64, channels[0], 1, bottleneck, device),
            res3: Stage::new(blocks[1], channels[0], channels[1], 2, bottleneck, device),
            res4: Stage::new(blocks[2], channels[1], channels[2], 2, bottleneck, device),
            res5: Stage::new(blocks[3], channels[2], channels[3], 2, bottleneck, device),
        }
    }
}

/// conv1 + bn_conv1 + relu + 3x3 max pool, stride 4 overall.
#[derive(Module, Debug)]
pub struct Stem<B: Backend> {
    conv1: Conv2d<B>,
    bn_conv1: BatchNorm<B, 2>,
    relu: Relu,
    pool: MaxPool2d,
}

impl<B: Backend> Stem<B> {
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv1.forward(input);
        let x = self.bn_conv1.forward(x);
        let x = self.relu.forward(x);
        self.pool.forward(x)
    }

    pub fn new(in_channels: usize, out_channels: usize, device: &Device<B>) -> Self {
        let conv1 = Conv2dConfig::new([in_channels, out_channels], [7, 7])
            .with_stride([2, 2])
            .with_padding(PaddingConfig2d::Explicit(3, 3))
            .with_initializer(Initializer::KaimingNormal {
                gain: SQRT_2,
                fan_out_only: true,
            })
            .init(device);

        let pool = MaxPool2dConfig::new([3, 3])
            .with_strides([2, 2])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .init();

        Self {
            conv1,
            bn_conv1: BatchNormConfig::new(out_channels).init(device),
            relu: Relu::new(),
            pool,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn depth_tables_match_the_published_networks() {
        assert_eq!(ResNetDepth::Resnet101.blocks(), [3, 4, 23, 3]);
        assert_eq!(ResNetDepth::Resnet50.out_channels(), [256, 512, 1024, 2048]);
        assert_eq!(ResNetDepth::Resnet18.out_channels(), [64, 128, 256, 512]);
        assert!(!ResNetDepth::Resnet34.bottleneck());
    }

    #[test]
    fn resnet18_features_have_pyramid_strides() {
        let device = Default::default();
        let model = ResNetBackbone::<TestBackend>::new(ResNetDepth::Resnet18, &device);

        let input = Tensor::<TestBackend, 4>::random(
            [1, 3, 64, 64],
            burn::tensor::Distribution::Normal(0.0, 1.0),
            &device,
        );
        let features = model.forward(input);

        assert_eq!(features.c2.dims(), [1, 64, 16, 16]);
        assert_eq!(features.c3.dims(), [1, 128, 8, 8]);
        assert_eq!(features.c4.dims(), [1, 256, 4, 4]);
        assert_eq!(features.c5.dims(), [1, 512, 2, 2]);
    }

    #[test]
    fn resnet50_widens_every_stage() {
        let device = Default::default();
        let model = ResNetBackbone::<TestBackend>::new(ResNetDepth::Resnet50, &device);

        let input = Tensor::<TestBackend, 4>::zeros([1, 3, 64, 64], &device);
        let features = model.forward(input);

        assert_eq!(features.c2.dims(), [1, 256, 16, 16]);
        assert_eq!(features.c5.dims(), [1, 2048, 2, 2]);
    }
}
