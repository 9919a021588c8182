//! Classifier and mask heads applied to pooled ROIs.

use burn::{
    nn::{
        conv::{Conv2d, Conv2dConfig, ConvTranspose2d, ConvTranspose2dConfig},
        BatchNorm, BatchNormConfig, Linear, LinearConfig, PaddingConfig2d, Relu,
    },
    prelude::*,
};

#[derive(Debug, Clone)]
pub struct ClassifierOutput<B: Backend> {
    /// `[rois, num_classes]`
    pub class_logits: Tensor<B, 2>,
    /// `[rois, num_classes, 4]`
    pub deltas: Tensor<B, 3>,
}

#[derive(Config, Debug)]
pub struct ClassifierHeadConfig {
    pub in_channels: usize,
    pub num_classes: usize,
    #[config(default = "7")]
    pub pool_size: usize,
    #[config(default = "1024")]
    pub fc_layers_size: usize,
}

impl ClassifierHeadConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> ClassifierHead<B> {
        let fc = self.fc_layers_size;
        ClassifierHead {
            // a "valid" convolution over the whole pooled window acts as the
            // first fully-connected layer
            mrcnn_class_conv1: Conv2dConfig::new(
                [self.in_channels, fc],
                [self.pool_size, self.pool_size],
            )
            .init(device),
            mrcnn_class_bn1: BatchNormConfig::new(fc).init(device),
            mrcnn_class_conv2: Conv2dConfig::new([fc, fc], [1, 1]).init(device),
            mrcnn_class_bn2: BatchNormConfig::new(fc).init(device),
            mrcnn_class_logits: LinearConfig::new(fc, self.num_classes).init(device),
            mrcnn_bbox_fc: LinearConfig::new(fc, self.num_classes * 4).init(device),
            relu: Relu::new(),
        }
    }
}

#[derive(Module, Debug)]
pub struct ClassifierHead<B: Backend> {
    pub mrcnn_class_conv1: Conv2d<B>,
    pub mrcnn_class_bn1: BatchNorm<B, 2>,
    pub mrcnn_class_conv2: Conv2d<B>,
    pub mrcnn_class_bn2: BatchNorm<B, 2>,
    pub mrcnn_class_logits: Linear<B>,
    pub mrcnn_bbox_fc: Linear<B>,
    relu: Relu,
}

impl<B: Backend> ClassifierHead<B> {
    /// `pooled` is `[rois, channels, pool_size, pool_size]`.
    pub fn forward(&self, pooled: Tensor<B, 4>) -> ClassifierOutput<B> {
        let x = self.mrcnn_class_conv1.forward(pooled);
        let x = self.relu.forward(self.mrcnn_class_bn1.forward(x));
        let x = self.mrcnn_class_conv2.forward(x);
        let x = self.relu.forward(self.mrcnn_class_bn2.forward(x));

        let [rois, channels, _, _] = x.dims();
        let shared = x.reshape([rois, channels]);

        let class_logits = self.mrcnn_class_logits.forward(shared.clone());
        let [_, num_classes] = class_logits.dims();
        let deltas = self
            .mrcnn_bbox_fc
            .forward(shared)
            .reshape([rois, num_classes, 4]);

        ClassifierOutput {
            class_logits,
            deltas,
        }
    }
}

#[derive(Config, Debug)]
pub struct MaskHeadConfig {
    pub in_channels: usize,
    pub num_classes: usize,
    #[config(default = "256")]
    pub hidden_channels: usize,
}

impl MaskHeadConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> MaskHead<B> {
        let hidden = self.hidden_channels;
        let conv = |input: usize| {
            Conv2dConfig::new([input, hidden], [3, 3])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .init(device)
        };

        MaskHead {
            mrcnn_mask_conv1: conv(self.in_channels),
            mrcnn_mask_bn1: BatchNormConfig::new(hidden).init(device),
            mrcnn_mask_conv2: conv(hidden),
            mrcnn_mask_bn2: BatchNormConfig::new(hidden).init(device),
            mrcnn_mask_conv3: conv(hidden),
            mrcnn_mask_bn3: BatchNormConfig::new(hidden).init(device),
            mrcnn_mask_conv4: conv(hidden),
            mrcnn_mask_bn4: BatchNormConfig::new(hidden).init(device),
            mrcnn_mask_deconv: ConvTranspose2dConfig::new([hidden, hidden], [2, 2])
                .with_stride([2, 2])
                .init(device),
            mrcnn_mask: Conv2dConfig::new([hidden, self.num_classes], [1, 1]).init(device),
            relu: Relu::new(),
        }
    }
}

#[derive(Module, Debug)]
pub struct MaskHead<B: Backend> {
    pub mrcnn_mask_conv1: Conv2d<B>,
    pub mrcnn_mask_bn1: BatchNorm<B, 2>,
    pub mrcnn_mask_conv2: Conv2d<B>,
    pub mrcnn_mask_bn2: BatchNorm<B, 2>,
    pub mrcnn_mask_conv3: Conv2d<B>,
    pub mrcnn_mask_bn3: BatchNorm<B, 2>,
    pub mrcnn_mask_conv4: Conv2d<B>,
    pub mrcnn_mask_bn4: BatchNorm<B, 2>,
    pub mrcnn_mask_deconv: ConvTranspose2d<B>,
    pub mrcnn_mask: Conv2d<B>,
    relu: Relu,
}

impl<B: Backend> MaskHead<B> {
    /// Per-class mask logits `[rois, num_classes, 2 * pool, 2 * pool]` from
    /// `[rois, channels, pool, pool]`.
    pub fn forward(&self, pooled: Tensor<B, 4>) -> Tensor<B, 4> {
        let stages = [
            (&self.mrcnn_mask_conv1, &self.mrcnn_mask_bn1),
            (&self.mrcnn_mask_conv2, &self.mrcnn_mask_bn2),
            (&self.mrcnn_mask_conv3, &self.mrcnn_mask_bn3),
            (&self.mrcnn_mask_conv4, &self.mrcnn_mask_bn4),
        ];
        let x = stages.iter().fold(pooled, |x, (conv, bn)| {
            self.relu.forward(bn.forward(conv.forward(x)))
        });

        let x = self.relu.forward(self.mrcnn_mask_deconv.forward(x));
        self.mrcnn_mask.forward(x)
    }
}
