//! Host-side target assignment for the region proposal network and the
//! detection heads.

use mrcnn_ops::{crop_and_resize, denormalize_deltas, non_max_suppression, normalize_deltas, top_k, BBox};
use rand::{seq::SliceRandom, Rng};

use crate::{config::MaskRcnnConfig, image_ops::MaskGrid};

const RPN_POSITIVE_IOU: f32 = 0.7;
const RPN_NEGATIVE_IOU: f32 = 0.3;
const ROI_POSITIVE_IOU: f32 = 0.5;

/// Ground-truth instances of one image in network input coordinates.
#[derive(Debug, Clone, Default)]
pub struct GroundTruth {
    pub class_ids: Vec<usize>,
    pub boxes: Vec<BBox>,
    /// Mini masks (relative to `boxes`) when `mini_masks` is set, full
    /// image masks otherwise.
    pub masks: Vec<MaskGrid>,
    pub mini_masks: bool,
}

impl GroundTruth {
    pub fn len(&self) -> usize {
        self.boxes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.boxes.is_empty()
    }
}

/// Sampled anchors of one image for the RPN losses.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RpnTargets {
    pub positive: Vec<usize>,
    pub negative: Vec<usize>,
    /// Normalized refinement of each positive anchor, same order.
    pub deltas: Vec<[f32; 4]>,
}

/// Labels anchors by IoU with the ground truth and samples at most
/// `rpn_train_anchors_per_image` of them, no more than half positive.
///
/// An anchor is positive at IoU >= 0.7 or when it is the best anchor of a
/// ground-truth box, negative below 0.3 and ignored otherwise.
pub fn build_rpn_targets<R: Rng + ?Sized>(
    anchors: &[BBox],
    gt_boxes: &[BBox],
    config: &MaskRcnnConfig,
    rng: &mut R,
) -> RpnTargets {
    let mut labels = vec![0i8; anchors.len()];
    let mut matched = vec![0usize; anchors.len()];
    let mut best_for_gt = vec![(0.0f32, usize::MAX); gt_boxes.len()];

    for (index, anchor) in anchors.iter().enumerate() {
        let mut max_iou = 0.0;
        for (gt_index, gt) in gt_boxes.iter().enumerate() {
            let iou = anchor.iou(gt);
            if iou > max_iou {
                max_iou = iou;
                matched[index] = gt_index;
            }
            if iou > best_for_gt[gt_index].0 {
                best_for_gt[gt_index] = (iou, index);
            }
        }
        labels[index] = if max_iou >= RPN_POSITIVE_IOU {
            1
        } else if max_iou < RPN_NEGATIVE_IOU {
            -1
        } else {
            0
        };
    }
    for &(iou, index) in &best_for_gt {
        if iou > 0.0 {
            labels[index] = 1;
        }
    }

    let budget = config.rpn_train_anchors_per_image;
    let mut positive: Vec<usize> = (0..anchors.len()).filter(|&i| labels[i] == 1).collect();
    positive.shuffle(rng);
    positive.truncate(budget / 2);
    positive.sort_unstable();

    let mut negative: Vec<usize> = (0..anchors.len()).filter(|&i| labels[i] == -1).collect();
    negative.shuffle(rng);
    negative.truncate(budget - positive.len());
    negative.sort_unstable();

    let deltas = positive
        .iter()
        .map(|&index| {
            let gt = &gt_boxes[matched[index]];
            normalize_deltas(anchors[index].refinement_to(gt), config.rpn_bbox_std_dev)
        })
        .collect();

    RpnTargets {
        positive,
        negative,
        deltas,
    }
}

/// Turns RPN scores and deltas into at most `proposal_count` proposals
/// inside `window`.
pub fn generate_proposals(
    anchors: &[BBox],
    scores: &[f32],
    deltas: &[[f32; 4]],
    proposal_count: usize,
    window: &BBox,
    config: &MaskRcnnConfig,
) -> Vec<BBox> {
    let candidates = top_k(scores, config.pre_nms_limit.min(anchors.len()));

    let boxes: Vec<BBox> = candidates
        .iter()
        .map(|&index| {
            anchors[index]
                .apply_deltas(denormalize_deltas(deltas[index], config.rpn_bbox_std_dev))
                .clip(window)
        })
        .collect();
    let candidate_scores: Vec<f32> = candidates.iter().map(|&index| scores[index]).collect();

    non_max_suppression(&boxes, &candidate_scores, config.rpn_nms_threshold, proposal_count)
        .into_iter()
        .map(|keep| boxes[keep])
        .filter(|bbox| !bbox.is_empty())
        .collect()
}

/// Sampled ROIs of one image for the classifier and mask heads. Positive
/// ROIs come first; `deltas` and `masks` cover only those.
#[derive(Debug, Clone, Default)]
pub struct DetectionTargets {
    pub rois: Vec<BBox>,
    pub class_ids: Vec<usize>,
    pub deltas: Vec<[f32; 4]>,
    /// `mask_shape` grids in `{0, 1}`.
    pub masks: Vec<Vec<f32>>,
}

impl DetectionTargets {
    pub fn positive_count(&self) -> usize {
        self.deltas.len()
    }
}

/// Samples proposals into positive (IoU >= 0.5) and negative ROIs at
/// `roi_positive_ratio` and computes their class, box and mask targets.
///
/// Without any positive ROI the image still contributes up to
/// `train_rois_per_image` background ROIs to the classifier.
pub fn build_detection_targets<R: Rng + ?Sized>(
    proposals: &[BBox],
    gt: &GroundTruth,
    config: &MaskRcnnConfig,
    rng: &mut R,
) -> DetectionTargets {
    let proposals: Vec<BBox> = proposals.iter().copied().filter(|b| !b.is_empty()).collect();

    let mut positive = Vec::new();
    let mut negative = Vec::new();
    for (index, proposal) in proposals.iter().enumerate() {
        let best = gt
            .boxes
            .iter()
            .enumerate()
            .map(|(gt_index, gt_box)| (proposal.iou(gt_box), gt_index))
            .max_by(|a, b| a.0.total_cmp(&b.0));
        match best {
            Some((iou, gt_index)) if iou >= ROI_POSITIVE_IOU => positive.push((index, gt_index)),
            _ => negative.push(index),
        }
    }

    let positive_budget = (config.train_rois_per_image as f32 * config.roi_positive_ratio) as usize;
    positive.shuffle(rng);
    positive.truncate(positive_budget);

    let negative_budget = if positive.is_empty() {
        config.train_rois_per_image
    } else {
        let total = (positive.len() as f32 / config.roi_positive_ratio) as usize;
        total.saturating_sub(positive.len())
    };
    negative.shuffle(rng);
    negative.truncate(negative_budget);

    let mut targets = DetectionTargets::default();
    for &(index, gt_index) in &positive {
        let roi = proposals[index];
        let gt_box = gt.boxes[gt_index];
        targets.rois.push(roi);
        targets.class_ids.push(gt.class_ids[gt_index]);
        targets
            .deltas
            .push(normalize_deltas(roi.refinement_to(&gt_box), config.bbox_std_dev));
        targets.masks.push(mask_target(
            &gt.masks[gt_index],
            &gt_box,
            &roi,
            gt.mini_masks,
            config.mask_shape,
        ));
    }
    for &index in &negative {
        targets.rois.push(proposals[index]);
        targets.class_ids.push(0);
    }
    targets
}

/// Samples the instance mask inside `roi` at `shape`, rounded to `{0, 1}`.
pub fn mask_target(
    mask: &MaskGrid,
    gt_box: &BBox,
    roi: &BBox,
    mini_mask: bool,
    shape: [usize; 2],
) -> Vec<f32> {
    let region = if mini_mask {
        let sy = mask.height as f32 / gt_box.height().max(1e-6);
        let sx = mask.width as f32 / gt_box.width().max(1e-6);
        BBox::new(
            (roi.y1 - gt_box.y1) * sy,
            (roi.x1 - gt_box.x1) * sx,
            (roi.y2 - gt_box.y1) * sy,
            (roi.x2 - gt_box.x1) * sx,
        )
    } else {
        *roi
    };

    crop_and_resize(&mask.data, mask.height, mask.width, &region, shape[0], shape[1])
        .into_iter()
        .map(|value| if value >= 0.5 { 1.0 } else { 0.0 })
        .collect()
}
