//! One forward pass from a batch to the five loss terms.

use burn::prelude::*;
use mrcnn_ops::{backbone_shapes, generate_pyramid_anchors, BBox, Roi};
use rand::Rng;

use crate::{
    config::MaskRcnnConfig,
    error::{MrcnnError, MrcnnResult},
    loader::MrcnnBatch,
    losses::{classification_loss, mask_loss, smooth_l1_loss, MrcnnLosses},
    model::MaskRcnn,
    targets::{build_detection_targets, build_rpn_targets, generate_proposals},
};

/// Anchors of the last input size seen.
#[derive(Debug, Default)]
pub struct AnchorCache {
    shape: Option<[usize; 2]>,
    anchors: Vec<BBox>,
}

impl AnchorCache {
    pub fn get(&mut self, height: usize, width: usize, config: &MaskRcnnConfig) -> &[BBox] {
        if self.shape != Some([height, width]) {
            let shapes = backbone_shapes([height, width], &config.backbone_strides);
            self.anchors = generate_pyramid_anchors(
                &config.rpn_anchor_scales,
                &config.rpn_anchor_ratios,
                &shapes,
                &config.backbone_strides,
                config.rpn_anchor_stride,
            );
            self.shape = Some([height, width]);
        }
        &self.anchors
    }
}

/// Host-side targets gathered over the batch, as row indices into the
/// flattened network outputs.
#[derive(Default)]
struct BatchTargets {
    rpn_class_rows: Vec<i64>,
    rpn_class_ids: Vec<i64>,
    rpn_bbox_rows: Vec<i64>,
    rpn_bbox_deltas: Vec<f32>,
    rois: Vec<Roi>,
    roi_class_ids: Vec<i64>,
    /// Index into `rois` and class of every positive ROI.
    positive: Vec<(usize, usize)>,
    positive_rois: Vec<Roi>,
    bbox_deltas: Vec<f32>,
    mask_pixels: Vec<f32>,
}

/// Runs the model on `batch` and computes every loss term.
///
/// Returns `Ok(None)` for a batch without a single loaded image. Terms
/// without any sampled target (no positive anchor, no ROI) are zero.
pub fn compute_losses<B: Backend, R: Rng + ?Sized>(
    model: &MaskRcnn<B>,
    batch: &MrcnnBatch<B>,
    anchors: &mut AnchorCache,
    config: &MaskRcnnConfig,
    rng: &mut R,
) -> MrcnnResult<Option<MrcnnLosses<B>>> {
    let Some(images) = batch.images.clone() else {
        return Ok(None);
    };
    let device = images.device();
    let [batch_size, _, height, width] = images.dims();
    let anchors = anchors.get(height, width, config);
    let num_anchors = anchors.len();

    let features = model.forward_features(images);
    let rpn = model.forward_rpn(&features);
    if rpn.class_logits.dims()[1] != num_anchors {
        return Err(MrcnnError::TensorOperationFailed {
            operation: format!(
                "RPN produced {} anchors for a {height}x{width} input, expected {num_anchors}",
                rpn.class_logits.dims()[1]
            ),
        });
    }

    let image_bounds = BBox::new(0.0, 0.0, height as f32, width as f32);
    let mut targets = BatchTargets::default();

    for (index, gt) in batch.ground_truth.iter().enumerate() {
        let offset = (index * num_anchors) as i64;
        let rpn_targets = build_rpn_targets(anchors, &gt.boxes, config, rng);
        for &anchor in &rpn_targets.positive {
            targets.rpn_class_rows.push(offset + anchor as i64);
            targets.rpn_class_ids.push(1);
        }
        for &anchor in &rpn_targets.negative {
            targets.rpn_class_rows.push(offset + anchor as i64);
            targets.rpn_class_ids.push(0);
        }
        for (&anchor, deltas) in rpn_targets.positive.iter().zip(&rpn_targets.deltas) {
            targets.rpn_bbox_rows.push(offset + anchor as i64);
            targets.rpn_bbox_deltas.extend_from_slice(deltas);
        }

        let (scores, deltas) = rpn.image_values(index)?;
        let mut proposals = generate_proposals(
            anchors,
            &scores,
            &deltas,
            config.post_nms_rois_training,
            &image_bounds,
            config,
        );
        // ground-truth boxes join the proposals so the heads see positives
        // before the RPN has learned anything
        proposals.extend_from_slice(&gt.boxes);

        let detection = build_detection_targets(&proposals, gt, config, rng);
        for (position, (roi, &class_id)) in detection
            .rois
            .iter()
            .zip(&detection.class_ids)
            .enumerate()
        {
            let roi = Roi {
                batch_index: index,
                bbox: *roi,
            };
            if position < detection.positive_count() {
                targets.positive.push((targets.rois.len(), class_id));
                targets.positive_rois.push(roi);
                targets.bbox_deltas.extend_from_slice(&detection.deltas[position]);
                targets.mask_pixels.extend_from_slice(&detection.masks[position]);
            }
            targets.rois.push(roi);
            targets.roi_class_ids.push(class_id as i64);
        }
    }

    let zero = || Tensor::<B, 1>::zeros([1], &device);
    let rows = |values: Vec<i64>| {
        let len = values.len();
        Tensor::<B, 1, Int>::from_data(TensorData::new(values, [len]), &device)
    };
    let deltas = |values: Vec<f32>| {
        let len = values.len() / 4;
        Tensor::<B, 2>::from_data(TensorData::new(values, [len, 4]), &device)
    };

    let rpn_class = if targets.rpn_class_rows.is_empty() {
        zero()
    } else {
        let logits = rpn
            .class_logits
            .reshape([batch_size * num_anchors, 2])
            .select(0, rows(targets.rpn_class_rows));
        classification_loss(logits, rows(targets.rpn_class_ids))
    };

    let rpn_bbox = if targets.rpn_bbox_rows.is_empty() {
        zero()
    } else {
        let predicted = rpn
            .deltas
            .reshape([batch_size * num_anchors, 4])
            .select(0, rows(targets.rpn_bbox_rows));
        smooth_l1_loss(predicted, deltas(targets.rpn_bbox_deltas))
    };

    let strides = &config.backbone_strides[..4];
    let num_classes = config.num_classes;
    let (mrcnn_class, mrcnn_bbox) =
        match model.forward_classifier(&features, &targets.rois, strides, config.pool_size) {
            None => (zero(), zero()),
            Some(output) => {
                let class_loss = classification_loss(output.class_logits, rows(targets.roi_class_ids));
                let bbox_loss = if targets.positive.is_empty() {
                    zero()
                } else {
                    let [roi_count, _, _] = output.deltas.dims();
                    let class_rows = targets
                        .positive
                        .iter()
                        .map(|&(roi, class_id)| (roi * num_classes + class_id) as i64)
                        .collect();
                    let predicted = output
                        .deltas
                        .reshape([roi_count * num_classes, 4])
                        .select(0, rows(class_rows));
                    smooth_l1_loss(predicted, deltas(targets.bbox_deltas))
                };
                (class_loss, bbox_loss)
            }
        };

    let mrcnn_mask = match model.forward_mask(
        &features,
        &targets.positive_rois,
        strides,
        config.mask_pool_size,
    ) {
        None => zero(),
        Some(logits) => {
            let [count, classes, mask_h, mask_w] = logits.dims();
            let class_rows = targets
                .positive
                .iter()
                .enumerate()
                .map(|(position, &(_, class_id))| (position * classes + class_id) as i64)
                .collect();
            let predicted = logits
                .reshape([count * classes, mask_h * mask_w])
                .select(0, rows(class_rows));
            let expected = Tensor::<B, 2>::from_data(
                TensorData::new(targets.mask_pixels, [count, mask_h * mask_w]),
                &device,
            );
            mask_loss(predicted, expected)
        }
    };

    Ok(Some(MrcnnLosses {
        rpn_class,
        rpn_bbox,
        mrcnn_class,
        mrcnn_bbox,
        mrcnn_mask,
    }))
}

#[cfg(test)]
mod tests {
    use burn::backend::NdArray;
    use rand::{rngs::StdRng, SeedableRng};

    use super::*;
    use crate::{
        image_ops::MaskGrid,
        loader::{MrcnnBatcher, MrcnnItem},
        targets::GroundTruth,
        tests::tiny_config,
    };
    use burn::data::dataloader::batcher::Batcher;

    type TestBackend = NdArray<f32>;

    fn item(with_instance: bool) -> MrcnnItem {
        let gt = if with_instance {
            GroundTruth {
                class_ids: vec![1],
                boxes: vec![BBox::new(8.0, 8.0, 40.0, 32.0)],
                masks: vec![MaskGrid {
                    height: 8,
                    width: 8,
                    data: vec![1.0; 64],
                }],
                mini_masks: true,
            }
        } else {
            GroundTruth {
                mini_masks: true,
                ..GroundTruth::default()
            }
        };
        MrcnnItem {
            image_id: "a.png".into(),
            image: vec![0.0; 64 * 64 * 3],
            height: 64,
            width: 64,
            window: BBox::new(0.0, 0.0, 64.0, 64.0),
            gt,
        }
    }

    #[test]
    fn anchors_are_cached_per_shape() {
        let config = tiny_config();
        let mut cache = AnchorCache::default();
        // 16x16, 8x8, 4x4, 2x2 and 1x1 maps with three ratios each
        assert_eq!(cache.get(64, 64, &config).len(), (256 + 64 + 16 + 4 + 1) * 3);
        assert_eq!(cache.get(64, 64, &config).len(), 1023);
    }

    #[test]
    fn every_term_is_finite_with_an_instance() {
        let device = Default::default();
        let config = tiny_config();
        let model = config.init_model::<TestBackend>(&device);
        let batch = MrcnnBatcher::<TestBackend>::new().batch(vec![Ok(item(true))], &device);

        let losses = compute_losses(
            &model,
            &batch,
            &mut AnchorCache::default(),
            &config,
            &mut StdRng::seed_from_u64(0),
        )
        .unwrap()
        .unwrap();
        let values = losses.values(&config.loss_weights);

        for value in [
            values.rpn_class,
            values.rpn_bbox,
            values.mrcnn_class,
            values.mrcnn_bbox,
            values.mrcnn_mask,
        ] {
            assert!(value.is_finite());
        }
        // the ground-truth box is always a positive ROI
        assert!(values.mrcnn_mask > 0.0);
        assert!(values.rpn_class > 0.0);
    }

    #[test]
    fn empty_images_only_train_background() {
        let device = Default::default();
        let config = tiny_config();
        let model = config.init_model::<TestBackend>(&device);
        let batch = MrcnnBatcher::<TestBackend>::new().batch(vec![Ok(item(false))], &device);

        let values = compute_losses(
            &model,
            &batch,
            &mut AnchorCache::default(),
            &config,
            &mut StdRng::seed_from_u64(0),
        )
        .unwrap()
        .unwrap()
        .values(&config.loss_weights);

        assert_eq!(values.rpn_bbox, 0.0);
        assert_eq!(values.mrcnn_bbox, 0.0);
        assert_eq!(values.mrcnn_mask, 0.0);
        assert!(values.rpn_class > 0.0);
    }

    #[test]
    fn failed_batches_produce_no_losses() {
        let device = Default::default();
        let config = tiny_config();
        let model = config.init_model::<TestBackend>(&device);
        let batch = MrcnnBatcher::<TestBackend>::new().batch(Vec::new(), &device);

        let losses = compute_losses(
            &model,
            &batch,
            &mut AnchorCache::default(),
            &config,
            &mut StdRng::seed_from_u64(0),
        )
        .unwrap();
        assert!(losses.is_none());
    }
}
