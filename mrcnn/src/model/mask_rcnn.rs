use burn::prelude::*;
use mrcnn_ops::{pyramid_roi_pool, Roi};
use resnet::ResNetBackbone;

use super::{
    fpn::{FeaturePyramid, FeaturePyramidConfig, PyramidFeatures},
    heads::{ClassifierHead, ClassifierHeadConfig, ClassifierOutput, MaskHead, MaskHeadConfig},
    rpn::{RegionProposalNetwork, RegionProposalNetworkConfig, RpnOutput},
};
use crate::config::MaskRcnnConfig;

/// ResNet + FPN backbone with the region proposal network and the
/// classifier and mask heads.
#[derive(Module, Debug)]
pub struct MaskRcnn<B: Backend> {
    pub backbone: ResNetBackbone<B>,
    pub fpn: FeaturePyramid<B>,
    pub rpn: RegionProposalNetwork<B>,
    pub classifier: ClassifierHead<B>,
    pub mask: MaskHead<B>,
}

impl MaskRcnnConfig {
    /// Builds a freshly initialised model sized from this configuration.
    pub fn init_model<B: Backend>(&self, device: &B::Device) -> MaskRcnn<B> {
        let pyramid = self.top_down_pyramid_size;

        MaskRcnn {
            backbone: ResNetBackbone::new(self.backbone, device),
            fpn: FeaturePyramidConfig::new(self.backbone.out_channels())
                .with_out_channels(pyramid)
                .init(device),
            rpn: RegionProposalNetworkConfig::new(pyramid, self.anchors_per_location())
                .with_anchor_stride(self.rpn_anchor_stride)
                .init(device),
            classifier: ClassifierHeadConfig::new(pyramid, self.num_classes)
                .with_pool_size(self.pool_size)
                .with_fc_layers_size(self.fpn_classif_fc_layers_size)
                .init(device),
            mask: MaskHeadConfig::new(pyramid, self.num_classes)
                .with_hidden_channels(pyramid)
                .init(device),
        }
    }
}

impl<B: Backend> MaskRcnn<B> {
    /// `images` is `[N, 3, H, W]`, mean-subtracted.
    pub fn forward_features(&self, images: Tensor<B, 4>) -> PyramidFeatures<B> {
        self.fpn.forward(self.backbone.forward(images))
    }

    pub fn forward_rpn(&self, features: &PyramidFeatures<B>) -> RpnOutput<B> {
        self.rpn.forward_pyramid(&features.rpn_levels())
    }

    /// Class logits and box deltas for `rois`; `None` without ROIs.
    pub fn forward_classifier(
        &self,
        features: &PyramidFeatures<B>,
        rois: &[Roi],
        strides: &[usize],
        pool_size: usize,
    ) -> Option<ClassifierOutput<B>> {
        pyramid_roi_pool(&features.roi_levels(), strides, rois, pool_size)
            .map(|pooled| self.classifier.forward(pooled))
    }

    /// Per-class mask logits for `rois`; `None` without ROIs.
    pub fn forward_mask(
        &self,
        features: &PyramidFeatures<B>,
        rois: &[Roi],
        strides: &[usize],
        mask_pool_size: usize,
    ) -> Option<Tensor<B, 4>> {
        pyramid_roi_pool(&features.roi_levels(), strides, rois, mask_pool_size)
            .map(|pooled| self.mask.forward(pooled))
    }
}
