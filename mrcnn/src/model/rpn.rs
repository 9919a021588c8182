use burn::{
    nn::{
        conv::{Conv2d, Conv2dConfig},
        PaddingConfig2d, Relu,
    },
    prelude::*,
};

use crate::error::{MrcnnError, MrcnnResult};

/// Objectness logits `[N, anchors, 2]` and box deltas `[N, anchors, 4]`,
/// in anchor order.
#[derive(Debug, Clone)]
pub struct RpnOutput<B: Backend> {
    pub class_logits: Tensor<B, 3>,
    pub deltas: Tensor<B, 3>,
}

impl<B: Backend> RpnOutput<B> {
    /// Foreground probability and deltas of every anchor of image `index`,
    /// copied to the host.
    pub fn image_values(&self, index: usize) -> MrcnnResult<(Vec<f32>, Vec<[f32; 4]>)> {
        let [_, anchors, _] = self.class_logits.dims();
        let read = |tensor: Tensor<B, 3>, k: usize| {
            tensor
                .slice([index..index + 1, 0..anchors, 0..k])
                .detach()
                .into_data()
                .to_vec::<f32>()
                .map_err(|e| MrcnnError::TensorOperationFailed {
                    operation: format!("reading RPN output: {e:?}"),
                })
        };

        let logits = read(self.class_logits.clone(), 2)?;
        let deltas = read(self.deltas.clone(), 4)?;

        // softmax over (background, foreground)
        let scores = logits
            .chunks_exact(2)
            .map(|pair| 1.0 / (1.0 + (pair[0] - pair[1]).exp()))
            .collect();
        let deltas = deltas
            .chunks_exact(4)
            .map(|d| [d[0], d[1], d[2], d[3]])
            .collect();
        Ok((scores, deltas))
    }
}

#[derive(Config, Debug)]
pub struct RegionProposalNetworkConfig {
    pub in_channels: usize,
    pub anchors_per_location: usize,
    #[config(default = "512")]
    pub hidden_channels: usize,
    #[config(default = "1")]
    pub anchor_stride: usize,
}

impl RegionProposalNetworkConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> RegionProposalNetwork<B> {
        let anchors = self.anchors_per_location;
        RegionProposalNetwork {
            rpn_conv_shared: Conv2dConfig::new([self.in_channels, self.hidden_channels], [3, 3])
                .with_stride([self.anchor_stride, self.anchor_stride])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .init(device),
            rpn_class_raw: Conv2dConfig::new([self.hidden_channels, 2 * anchors], [1, 1])
                .init(device),
            rpn_bbox_pred: Conv2dConfig::new([self.hidden_channels, 4 * anchors], [1, 1])
                .init(device),
            relu: Relu::new(),
        }
    }
}

/// One head shared by every pyramid level.
#[derive(Module, Debug)]
pub struct RegionProposalNetwork<B: Backend> {
    pub rpn_conv_shared: Conv2d<B>,
    pub rpn_class_raw: Conv2d<B>,
    pub rpn_bbox_pred: Conv2d<B>,
    relu: Relu,
}

impl<B: Backend> RegionProposalNetwork<B> {
    /// Runs the head on a single level.
    pub fn forward(&self, feature: Tensor<B, 4>) -> RpnOutput<B> {
        let shared = self.relu.forward(self.rpn_conv_shared.forward(feature));

        RpnOutput {
            class_logits: per_anchor(self.rpn_class_raw.forward(shared.clone()), 2),
            deltas: per_anchor(self.rpn_bbox_pred.forward(shared), 4),
        }
    }

    /// Runs the head on every level and concatenates along the anchor axis.
    pub fn forward_pyramid(&self, levels: &[Tensor<B, 4>]) -> RpnOutput<B> {
        let (logits, deltas): (Vec<_>, Vec<_>) = levels
            .iter()
            .map(|level| {
                let output = self.forward(level.clone());
                (output.class_logits, output.deltas)
            })
            .unzip();

        RpnOutput {
            class_logits: Tensor::cat(logits, 1),
            deltas: Tensor::cat(deltas, 1),
        }
    }
}

/// `[N, A * k, H, W]` to `[N, H * W * A, k]`, row-major over the map.
fn per_anchor<B: Backend>(x: Tensor<B, 4>, k: usize) -> Tensor<B, 3> {
    let [batch, channels, height, width] = x.dims();
    let anchors = channels / k;
    x.permute([0, 2, 3, 1])
        .reshape([batch, height * width * anchors, k])
}

#[cfg(test)]
mod tests {
    use burn::backend::NdArray;

    use super::*;

    type TestBackend = NdArray<f32>;

    #[test]
    fn outputs_follow_anchor_count() {
        let device = Default::default();
        let rpn = RegionProposalNetworkConfig::new(8, 3)
            .with_hidden_channels(16)
            .init::<TestBackend>(&device);

        let levels = [
            Tensor::<TestBackend, 4>::zeros([2, 8, 4, 4], &device),
            Tensor::<TestBackend, 4>::zeros([2, 8, 2, 2], &device),
        ];
        let output = rpn.forward_pyramid(&levels);

        assert_eq!(output.class_logits.dims(), [2, (16 + 4) * 3, 2]);
        assert_eq!(output.deltas.dims(), [2, (16 + 4) * 3, 4]);
    }

    #[test]
    fn per_anchor_keeps_location_major_order() {
        let device = Default::default();
        // two anchors, k = 1, on a 1x2 map: channel c at column x is 10 * x + c
        let x = Tensor::<TestBackend, 4>::from_data(
            TensorData::new(vec![0.0f32, 10.0, 1.0, 11.0], [1, 2, 1, 2]),
            &device,
        );
        let flat = per_anchor(x, 1).into_data().to_vec::<f32>().unwrap();
        assert_eq!(flat, vec![0.0, 1.0, 10.0, 11.0]);
    }

    #[test]
    fn image_values_are_foreground_probabilities() {
        let device = Default::default();
        let output = RpnOutput::<TestBackend> {
            class_logits: Tensor::from_data(
                TensorData::new(vec![0.0f32, 0.0, 0.0, 20.0, 5.0, 0.0, 0.0, 0.0], [2, 2, 2]),
                &device,
            ),
            deltas: Tensor::zeros([2, 2, 4], &device),
        };

        let (scores, deltas) = output.image_values(0).unwrap();
        assert!((scores[0] - 0.5).abs() < 1e-6);
        assert!(scores[1] > 0.99);
        assert_eq!(deltas, vec![[0.0; 4]; 2]);

        let (scores, _) = output.image_values(1).unwrap();
        assert!(scores[0] < 0.01);
    }
}
