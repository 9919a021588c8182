//! The five Mask R-CNN loss terms.

use std::ops::AddAssign;

use burn::{nn::loss::CrossEntropyLossConfig, prelude::*, tensor::ElementConversion};

use crate::config::LossWeights;

/// Softmax cross-entropy over `[rows, classes]` logits.
pub fn classification_loss<B: Backend>(
    logits: Tensor<B, 2>,
    targets: Tensor<B, 1, Int>,
) -> Tensor<B, 1> {
    CrossEntropyLossConfig::new()
        .init(&logits.device())
        .forward(logits, targets)
}

/// Element-wise smooth-L1 (Huber with delta 1), averaged.
pub fn smooth_l1_loss<B: Backend>(pred: Tensor<B, 2>, target: Tensor<B, 2>) -> Tensor<B, 1> {
    let diff = (pred - target).abs();
    let quadratic = diff.clone().powf_scalar(2.0) * 0.5;
    let linear = diff.clone() - 0.5;
    linear.mask_where(diff.lower_elem(1.0), quadratic).mean()
}

/// Binary cross-entropy on mask logits against `{0, 1}` targets, averaged
/// over every pixel.
pub fn mask_loss<B: Backend>(logits: Tensor<B, 2>, targets: Tensor<B, 2>) -> Tensor<B, 1> {
    // max(x, 0) - x * t + log(1 + exp(-|x|))
    let positive = logits.clone().clamp_min(0.0);
    let soft = logits.clone().abs().neg().exp().log1p();
    (positive - logits * targets + soft).mean()
}

/// Loss terms of one batch, each a scalar tensor.
#[derive(Debug, Clone)]
pub struct MrcnnLosses<B: Backend> {
    pub rpn_class: Tensor<B, 1>,
    pub rpn_bbox: Tensor<B, 1>,
    pub mrcnn_class: Tensor<B, 1>,
    pub mrcnn_bbox: Tensor<B, 1>,
    pub mrcnn_mask: Tensor<B, 1>,
}

impl<B: Backend> MrcnnLosses<B> {
    pub fn total(&self, weights: &LossWeights) -> Tensor<B, 1> {
        self.rpn_class.clone() * weights.rpn_class
            + self.rpn_bbox.clone() * weights.rpn_bbox
            + self.mrcnn_class.clone() * weights.mrcnn_class
            + self.mrcnn_bbox.clone() * weights.mrcnn_bbox
            + self.mrcnn_mask.clone() * weights.mrcnn_mask
    }

    /// Reads every term back to the host.
    pub fn values(&self, weights: &LossWeights) -> LossValues {
        let scalar = |t: &Tensor<B, 1>| t.clone().into_scalar().elem::<f32>();
        LossValues {
            loss: scalar(&self.total(weights)),
            rpn_class: scalar(&self.rpn_class),
            rpn_bbox: scalar(&self.rpn_bbox),
            mrcnn_class: scalar(&self.mrcnn_class),
            mrcnn_bbox: scalar(&self.mrcnn_bbox),
            mrcnn_mask: scalar(&self.mrcnn_mask),
        }
    }
}

/// Host copy of the loss terms, summed over steps and averaged for logging.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LossValues {
    pub loss: f32,
    pub rpn_class: f32,
    pub rpn_bbox: f32,
    pub mrcnn_class: f32,
    pub mrcnn_bbox: f32,
    pub mrcnn_mask: f32,
}

impl LossValues {
    pub fn mean(self, steps: usize) -> Self {
        if steps == 0 {
            return self;
        }
        let n = steps as f32;
        Self {
            loss: self.loss / n,
            rpn_class: self.rpn_class / n,
            rpn_bbox: self.rpn_bbox / n,
            mrcnn_class: self.mrcnn_class / n,
            mrcnn_bbox: self.mrcnn_bbox / n,
            mrcnn_mask: self.mrcnn_mask / n,
        }
    }
}

impl AddAssign for LossValues {
    fn add_assign(&mut self, rhs: Self) {
        self.loss += rhs.loss;
        self.rpn_class += rhs.rpn_class;
        self.rpn_bbox += rhs.rpn_bbox;
        self.mrcnn_class += rhs.mrcnn_class;
        self.mrcnn_bbox += rhs.mrcnn_bbox;
        self.mrcnn_mask += rhs.mrcnn_mask;
    }
}

#[cfg(test)]
mod tests {
    use burn::backend::NdArray;

    use super::*;

    type TestBackend = NdArray<f32>;

    fn tensor2(values: Vec<f32>, shape: [usize; 2]) -> Tensor<TestBackend, 2> {
        Tensor::from_data(TensorData::new(values, shape), &Default::default())
    }

    fn scalar(t: Tensor<TestBackend, 1>) -> f32 {
        t.into_scalar().elem::<f32>()
    }

    #[test]
    fn smooth_l1_switches_to_linear_past_one() {
        let pred = tensor2(vec![0.5, 3.0], [1, 2]);
        let target = tensor2(vec![0.0, 0.0], [1, 2]);
        // (0.125 + 2.5) / 2
        assert!((scalar(smooth_l1_loss(pred, target)) - 1.3125).abs() < 1e-6);
    }

    #[test]
    fn mask_loss_matches_the_sigmoid_form() {
        let logits = tensor2(vec![0.0, 2.0, -1.0], [1, 3]);
        let targets = tensor2(vec![1.0, 0.0, 0.0], [1, 3]);

        let sigmoid = |x: f32| 1.0 / (1.0 + (-x).exp());
        let expected = (-(sigmoid(0.0).ln()) - (1.0 - sigmoid(2.0)).ln() - (1.0 - sigmoid(-1.0)).ln()) / 3.0;
        assert!((scalar(mask_loss(logits, targets)) - expected).abs() < 1e-5);
    }

    #[test]
    fn classification_loss_is_low_for_confident_correct_logits() {
        let device = Default::default();
        let logits = tensor2(vec![8.0, -8.0, -8.0, 8.0], [2, 2]);
        let targets = Tensor::<TestBackend, 1, Int>::from_data(TensorData::new(vec![0i64, 1], [2]), &device);
        assert!(scalar(classification_loss(logits, targets)) < 1e-3);
    }

    #[test]
    fn weighted_total_and_running_mean() {
        let device = Default::default();
        let one = || Tensor::<TestBackend, 1>::ones([1], &device);
        let losses = MrcnnLosses {
            rpn_class: one(),
            rpn_bbox: one(),
            mrcnn_class: one(),
            mrcnn_bbox: one(),
            mrcnn_mask: one() * 2.0,
        };
        let weights = LossWeights::new().with_mrcnn_mask(0.5);

        let values = losses.values(&weights);
        assert!((values.loss - 5.0).abs() < 1e-6);

        let mut sum = LossValues::default();
        sum += values;
        sum += values;
        assert_eq!(sum.mean(2), values);
    }
}
