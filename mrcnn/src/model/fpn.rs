//! Feature pyramid network on top of the ResNet stages.

use burn::{
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{MaxPool2d, MaxPool2dConfig},
        PaddingConfig2d,
    },
    prelude::*,
    tensor::{
        module::interpolate,
        ops::{InterpolateMode, InterpolateOptions},
    },
};
use resnet::ResNetFeatures;

/// `P2`..`P6`, all with `top_down_pyramid_size` channels.
#[derive(Debug, Clone)]
pub struct PyramidFeatures<B: Backend> {
    pub p2: Tensor<B, 4>,
    pub p3: Tensor<B, 4>,
    pub p4: Tensor<B, 4>,
    pub p5: Tensor<B, 4>,
    pub p6: Tensor<B, 4>,
}

impl<B: Backend> PyramidFeatures<B> {
    /// Levels used by the RPN, finest first.
    pub fn rpn_levels(&self) -> [Tensor<B, 4>; 5] {
        [
            self.p2.clone(),
            self.p3.clone(),
            self.p4.clone(),
            self.p5.clone(),
            self.p6.clone(),
        ]
    }

    /// Levels ROI pooling reads from. `P6` is only used for proposals.
    pub fn roi_levels(&self) -> [Tensor<B, 4>; 4] {
        [
            self.p2.clone(),
            self.p3.clone(),
            self.p4.clone(),
            self.p5.clone(),
        ]
    }
}

#[derive(Config, Debug)]
pub struct FeaturePyramidConfig {
    /// Channels of `C2`..`C5`.
    pub in_channels: [usize; 4],
    #[config(default = "256")]
    pub out_channels: usize,
}

impl FeaturePyramidConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> FeaturePyramid<B> {
        let lateral = |channels: usize| {
            Conv2dConfig::new([channels, self.out_channels], [1, 1]).init(device)
        };
        let output = || {
            Conv2dConfig::new([self.out_channels, self.out_channels], [3, 3])
                .with_padding(PaddingConfig2d::Same)
                .init(device)
        };

        FeaturePyramid {
            fpn_c2p2: lateral(self.in_channels[0]),
            fpn_c3p3: lateral(self.in_channels[1]),
            fpn_c4p4: lateral(self.in_channels[2]),
            fpn_c5p5: lateral(self.in_channels[3]),
            fpn_p2: output(),
            fpn_p3: output(),
            fpn_p4: output(),
            fpn_p5: output(),
            fpn_p6: MaxPool2dConfig::new([1, 1]).with_strides([2, 2]).init(),
        }
    }
}

#[derive(Module, Debug)]
pub struct FeaturePyramid<B: Backend> {
    pub fpn_c2p2: Conv2d<B>,
    pub fpn_c3p3: Conv2d<B>,
    pub fpn_c4p4: Conv2d<B>,
    pub fpn_c5p5: Conv2d<B>,
    pub fpn_p2: Conv2d<B>,
    pub fpn_p3: Conv2d<B>,
    pub fpn_p4: Conv2d<B>,
    pub fpn_p5: Conv2d<B>,
    fpn_p6: MaxPool2d,
}

impl<B: Backend> FeaturePyramid<B> {
    pub fn forward(&self, features: ResNetFeatures<B>) -> PyramidFeatures<B> {
        let p5 = self.fpn_c5p5.forward(features.c5);
        let p4 = upsample_like(p5.clone(), &features.c4) + self.fpn_c4p4.forward(features.c4);
        let p3 = upsample_like(p4.clone(), &features.c3) + self.fpn_c3p3.forward(features.c3);
        let p2 = upsample_like(p3.clone(), &features.c2) + self.fpn_c2p2.forward(features.c2);

        let p5 = self.fpn_p5.forward(p5);
        let p6 = self.fpn_p6.forward(p5.clone());

        PyramidFeatures {
            p2: self.fpn_p2.forward(p2),
            p3: self.fpn_p3.forward(p3),
            p4: self.fpn_p4.forward(p4),
            p5,
            p6,
        }
    }
}

/// Nearest-neighbour upsampling to the spatial size of `reference`.
fn upsample_like<B: Backend>(x: Tensor<B, 4>, reference: &Tensor<B, 4>) -> Tensor<B, 4> {
    let [_, _, height, width] = reference.dims();
    interpolate(
        x,
        [height, width],
        InterpolateOptions::new(InterpolateMode::Nearest),
    )
}

#[cfg(test)]
mod tests {
    use burn::backend::NdArray;
    use resnet::{ResNetBackbone, ResNetDepth};

    use super::*;

    type TestBackend = NdArray<f32>;

    #[test]
    fn pyramid_levels_halve_from_p2_to_p6() {
        let device = Default::default();
        let backbone = ResNetBackbone::<TestBackend>::new(ResNetDepth::Resnet18, &device);
        let fpn = FeaturePyramidConfig::new(ResNetDepth::Resnet18.out_channels())
            .with_out_channels(8)
            .init::<TestBackend>(&device);

        let input = Tensor::<TestBackend, 4>::zeros([1, 3, 64, 64], &device);
        let pyramid = fpn.forward(backbone.forward(input));

        assert_eq!(pyramid.p2.dims(), [1, 8, 16, 16]);
        assert_eq!(pyramid.p3.dims(), [1, 8, 8, 8]);
        assert_eq!(pyramid.p4.dims(), [1, 8, 4, 4]);
        assert_eq!(pyramid.p5.dims(), [1, 8, 2, 2]);
        assert_eq!(pyramid.p6.dims(), [1, 8, 1, 1]);
    }
}
