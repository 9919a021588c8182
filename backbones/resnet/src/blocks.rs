//! Residual blocks and stages.

use core::f64::consts::SQRT_2;

use burn::{
    nn::{
        conv::{Conv2d, Conv2dConfig},
        BatchNorm, BatchNormConfig, Initializer, PaddingConfig2d, Relu,
    },
    prelude::*,
};

fn conv<B: Backend>(
    channels: [usize; 2],
    kernel: usize,
    stride: usize,
    device: &Device<B>,
) -> Conv2d<B> {
    let padding = kernel / 2;
    Conv2dConfig::new(channels, [kernel, kernel])
        .with_stride([stride, stride])
        .with_padding(PaddingConfig2d::Explicit(padding, padding))
        .with_initializer(Initializer::KaimingNormal {
            gain: SQRT_2,
            fan_out_only: true,
        })
        .init(device)
}

#[derive(Module, Debug)]
pub enum ResidualBlock<B: Backend> {
    Bottleneck(Bottleneck<B>),
    Basic(BasicBlock<B>),
}

impl<B: Backend> ResidualBlock<B> {
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        match self {
            Self::Basic(block) => block.forward(input),
            Self::Bottleneck(block) => block.forward(input),
        }
    }
}

/// Two 3x3 convolutions with an identity or projection shortcut.
#[derive(Module, Debug)]
pub struct BasicBlock<B: Backend> {
    conv_a: Conv2d<B>,
    bn_a: BatchNorm<B, 2>,
    conv_b: Conv2d<B>,
    bn_b: BatchNorm<B, 2>,
    shortcut: Option<Shortcut<B>>,
    relu: Relu,
}

impl<B: Backend> BasicBlock<B> {
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let residual = match &self.shortcut {
            Some(shortcut) => shortcut.forward(input.clone()),
            None => input.clone(),
        };

        let x = self.relu.forward(self.bn_a.forward(self.conv_a.forward(input)));
        let x = self.bn_b.forward(self.conv_b.forward(x));

        self.relu.forward(x + residual)
    }

    pub fn new(in_channels: usize, out_channels: usize, stride: usize, device: &Device<B>) -> Self {
        let shortcut = (stride != 1 || in_channels != out_channels)
            .then(|| Shortcut::new(in_channels, out_channels, stride, device));

        Self {
            conv_a: conv([in_channels, out_channels], 3, stride, device),
            bn_a: BatchNormConfig::new(out_channels).init(device),
            conv_b: conv([out_channels, out_channels], 3, 1, device),
            bn_b: BatchNormConfig::new(out_channels).init(device),
            shortcut,
            relu: Relu::new(),
        }
    }
}

/// 1x1 reduce, 3x3, 1x1 expand (expansion 4).
///
/// The stride is applied by the first 1x1 convolution, as in the original
/// ResNet and the Keras Mask R-CNN backbone.
#[derive(Module, Debug)]
pub struct Bottleneck<B: Backend> {
    conv_a: Conv2d<B>,
    bn_a: BatchNorm<B, 2>,
    conv_b: Conv2d<B>,
    bn_b: BatchNorm<B, 2>,
    conv_c: Conv2d<B>,
    bn_c: BatchNorm<B, 2>,
    shortcut: Option<Shortcut<B>>,
    relu: Relu,
}

impl<B: Backend> Bottleneck<B> {
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let residual = match &self.shortcut {
            Some(shortcut) => shortcut.forward(input.clone()),
            None => input.clone(),
        };

        let x = self.relu.forward(self.bn_a.forward(self.conv_a.forward(input)));
        let x = self.relu.forward(self.bn_b.forward(self.conv_b.forward(x)));
        let x = self.bn_c.forward(self.conv_c.forward(x));

        self.relu.forward(x + residual)
    }

    pub fn new(in_channels: usize, out_channels: usize, stride: usize, device: &Device<B>) -> Self {
        let inner = out_channels / 4;
        let shortcut = (stride != 1 || in_channels != out_channels)
            .then(|| Shortcut::new(in_channels, out_channels, stride, device));

        Self {
            conv_a: conv([in_channels, inner], 1, stride, device),
            bn_a: BatchNormConfig::new(inner).init(device),
            conv_b: conv([inner, inner], 3, 1, device),
            bn_b: BatchNormConfig::new(inner).init(device),
            conv_c: conv([inner, out_channels], 1, 1, device),
            bn_c: BatchNormConfig::new(out_channels).init(device),
            shortcut,
            relu: Relu::new(),
        }
    }
}

/// Projection shortcut (`branch1` in the Caffe naming).
#[derive(Module, Debug)]
pub struct Shortcut<B: Backend> {
    conv: Conv2d<B>,
    bn: BatchNorm<B, 2>,
}

impl<B: Backend> Shortcut<B> {
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        self.bn.forward(self.conv.forward(input))
    }

    pub fn new(in_channels: usize, out_channels: usize, stride: usize, device: &Device<B>) -> Self {
        Self {
            conv: conv([in_channels, out_channels], 1, stride, device),
            bn: BatchNormConfig::new(out_channels).init(device),
        }
    }
}

/// One backbone stage: a downsampling block followed by identity blocks.
#[derive(Module, Debug)]
pub struct Stage<B: Backend> {
    blocks: Vec<ResidualBlock<B>>,
}

impl<B: Backend> Stage<B> {
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        self.blocks
            .iter()
            .fold(input, |x, block| block.forward(x))
    }

    pub fn new(
        num_blocks: usize,
        in_channels: usize,
        out_channels: usize,
        stride: usize,
        bottleneck: bool,
        device: &Device<B>,
    ) -> Self {
        let blocks = (0..num_blocks)
            .map(|index| {
                let (input, stride) = if index == 0 {
                    (in_channels, stride)
                } else {
                    (out_channels, 1)
                };
                if bottleneck {
                    ResidualBlock::Bottleneck(Bottleneck::new(input, out_channels, stride, device))
                } else {
                    ResidualBlock::Basic(BasicBlock::new(input, out_channels, stride, device))
                }
            })
            .collect();

        Self { blocks }
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}
