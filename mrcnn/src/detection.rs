//! Inference from raw images to scored, masked instances.

use burn::{
    data::dataloader::batcher::Batcher,
    prelude::*,
    tensor::activation::{sigmoid, softmax},
};
use image::{GrayImage, RgbImage};
use mrcnn_ops::{denormalize_deltas, non_max_suppression, BBox, Roi};

use crate::{
    config::MaskRcnnConfig,
    error::{MrcnnError, MrcnnResult},
    image_ops::{mold_image, resize_image, unmold_mask, MaskGrid},
    loader::{MrcnnBatcher, MrcnnItem},
    model::MaskRcnn,
    targets::{generate_proposals, GroundTruth},
    training::AnchorCache,
};

/// One detected instance in the coordinates of the input image.
#[derive(Debug, Clone)]
pub struct Detection {
    pub bbox: BBox,
    pub class_id: usize,
    pub score: f32,
    /// Binary mask the size of the input image.
    pub mask: GrayImage,
}

/// A classified and refined ROI in network input coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RefinedDetection {
    pub bbox: BBox,
    pub class_id: usize,
    pub score: f32,
}

/// Picks the best class of every ROI, applies its box refinement and
/// keeps confident foreground detections after per-class NMS, best first.
///
/// `probabilities` is `[rois, num_classes]` and `deltas` is
/// `[rois, num_classes, 4]`, both row-major.
pub fn refine_detections(
    rois: &[BBox],
    probabilities: &[f32],
    deltas: &[f32],
    num_classes: usize,
    window: &BBox,
    config: &MaskRcnnConfig,
) -> Vec<RefinedDetection> {
    let candidates: Vec<RefinedDetection> = rois
        .iter()
        .enumerate()
        .filter_map(|(index, roi)| {
            let scores = &probabilities[index * num_classes..(index + 1) * num_classes];
            let (class_id, &score) = scores
                .iter()
                .enumerate()
                .max_by(|a, b| a.1.total_cmp(b.1))?;
            if class_id == 0 || score < config.detection_min_confidence {
                return None;
            }
            let offset = (index * num_classes + class_id) * 4;
            let delta = [
                deltas[offset],
                deltas[offset + 1],
                deltas[offset + 2],
                deltas[offset + 3],
            ];
            let bbox = roi
                .apply_deltas(denormalize_deltas(delta, config.bbox_std_dev))
                .clip(window);
            (!bbox.is_empty()).then_some(RefinedDetection {
                bbox,
                class_id,
                score,
            })
        })
        .collect();

    let mut kept = Vec::new();
    for class_id in 1..num_classes {
        let of_class: Vec<&RefinedDetection> = candidates
            .iter()
            .filter(|d| d.class_id == class_id)
            .collect();
        let boxes: Vec<BBox> = of_class.iter().map(|d| d.bbox).collect();
        let scores: Vec<f32> = of_class.iter().map(|d| d.score).collect();
        kept.extend(
            non_max_suppression(
                &boxes,
                &scores,
                config.detection_nms_threshold,
                config.detection_max_instances,
            )
            .into_iter()
            .map(|keep| *of_class[keep]),
        );
    }

    kept.sort_by(|a, b| b.score.total_cmp(&a.score));
    kept.truncate(config.detection_max_instances);
    kept
}

/// Detects instances in every image, one forward pass per image.
pub fn detect<B: Backend>(
    model: &MaskRcnn<B>,
    images: &[RgbImage],
    config: &MaskRcnnConfig,
    device: &B::Device,
) -> MrcnnResult<Vec<Vec<Detection>>> {
    let mut anchors = AnchorCache::default();
    images
        .iter()
        .map(|image| detect_image(model, image, config, &mut anchors, device))
        .collect()
}

fn detect_image<B: Backend>(
    model: &MaskRcnn<B>,
    image: &RgbImage,
    config: &MaskRcnnConfig,
    anchors: &mut AnchorCache,
    device: &B::Device,
) -> MrcnnResult<Vec<Detection>> {
    let resized = resize_image(
        image,
        config.image_min_dim,
        config.image_max_dim,
        config.image_min_scale,
        config.image_resize_mode,
    );
    let (height, width) = (resized.image.height() as usize, resized.image.width() as usize);
    let item = MrcnnItem {
        image_id: String::new(),
        image: mold_image(&resized.image, config.mean_pixel),
        height,
        width,
        window: resized.window,
        gt: GroundTruth::default(),
    };
    let Some(input) = MrcnnBatcher::<B>::new().batch(vec![Ok(item)], device).images else {
        return Ok(Vec::new());
    };

    let anchors = anchors.get(height, width, config);
    let features = model.forward_features(input);
    let (scores, deltas) = model.forward_rpn(&features).image_values(0)?;
    let proposals = generate_proposals(
        anchors,
        &scores,
        &deltas,
        config.post_nms_rois_inference,
        &BBox::new(0.0, 0.0, height as f32, width as f32),
        config,
    );

    let strides = &config.backbone_strides[..4];
    let rois: Vec<Roi> = proposals
        .iter()
        .map(|&bbox| Roi {
            batch_index: 0,
            bbox,
        })
        .collect();
    let Some(classified) = model.forward_classifier(&features, &rois, strides, config.pool_size)
    else {
        return Ok(Vec::new());
    };

    let probabilities = host(softmax(classified.class_logits, 1), "class probabilities")?;
    let refinements = host(classified.deltas, "box refinements")?;
    let refined = refine_detections(
        &proposals,
        &probabilities,
        &refinements,
        config.num_classes,
        &resized.window,
        config,
    );

    let detected: Vec<Roi> = refined
        .iter()
        .map(|d| Roi {
            batch_index: 0,
            bbox: d.bbox,
        })
        .collect();
    let Some(mask_logits) =
        model.forward_mask(&features, &detected, strides, config.mask_pool_size)
    else {
        return Ok(Vec::new());
    };
    let [_, classes, mask_h, mask_w] = mask_logits.dims();
    let masks = host(sigmoid(mask_logits), "mask probabilities")?;

    let original = [image.height(), image.width()];
    let window = resized.window;
    let to_original = |bbox: &BBox| {
        BBox::new(
            (bbox.y1 - window.y1) / resized.scale,
            (bbox.x1 - window.x1) / resized.scale,
            (bbox.y2 - window.y1) / resized.scale,
            (bbox.x2 - window.x1) / resized.scale,
        )
    };

    Ok(refined
        .iter()
        .enumerate()
        .filter_map(|(index, detection)| {
            let bbox = to_original(&detection.bbox);
            if bbox.is_empty() {
                return None;
            }
            let plane = mask_h * mask_w;
            let start = (index * classes + detection.class_id) * plane;
            let grid = MaskGrid {
                height: mask_h,
                width: mask_w,
                data: masks[start..start + plane].to_vec(),
            };
            Some(Detection {
                bbox,
                class_id: detection.class_id,
                score: detection.score,
                mask: unmold_mask(&grid, &bbox, original),
            })
        })
        .collect())
}

fn host<B: Backend, const D: usize>(tensor: Tensor<B, D>, what: &str) -> MrcnnResult<Vec<f32>> {
    tensor
        .into_data()
        .to_vec::<f32>()
        .map_err(|e| MrcnnError::TensorOperationFailed {
            operation: format!("reading {what}: {e:?}"),
        })
}

#[cfg(test)]
mod tests {
    use burn::backend::NdArray;
    use image::Rgb;

    use super::*;
    use crate::tests::tiny_config;

    type TestBackend = NdArray<f32>;

    #[test]
    fn refinement_keeps_confident_foreground_without_duplicates() {
        let config = tiny_config().with_detection_min_confidence(0.5);
        let window = BBox::new(0.0, 0.0, 64.0, 64.0);
        let rois = [
            BBox::new(10.0, 10.0, 30.0, 30.0),
            BBox::new(11.0, 11.0, 31.0, 31.0),
            BBox::new(40.0, 40.0, 60.0, 60.0),
            BBox::new(0.0, 40.0, 20.0, 60.0),
        ];
        let probabilities = [
            0.1, 0.9, // crypt
            0.2, 0.8, // duplicate of the first
            0.9, 0.1, // background
            0.6, 0.4, // background
        ];
        let deltas = vec![0.0; rois.len() * 2 * 4];

        let refined = refine_detections(&rois, &probabilities, &deltas, 2, &window, &config);
        assert_eq!(refined.len(), 1);
        assert_eq!(refined[0].class_id, 1);
        assert_eq!(refined[0].bbox, rois[0]);
        assert!((refined[0].score - 0.9).abs() < 1e-6);
    }

    #[test]
    fn refinement_clips_to_the_window_and_orders_by_score() {
        let config = tiny_config().with_detection_min_confidence(0.5);
        let window = BBox::new(0.0, 0.0, 32.0, 64.0);
        let rois = [BBox::new(20.0, 0.0, 40.0, 20.0), BBox::new(0.0, 40.0, 10.0, 50.0)];
        let probabilities = [0.3, 0.7, 0.05, 0.95];
        let deltas = vec![0.0; 2 * 2 * 4];

        let refined = refine_detections(&rois, &probabilities, &deltas, 2, &window, &config);
        assert_eq!(refined.len(), 2);
        assert!(refined[0].score > refined[1].score);
        assert_eq!(refined[1].bbox.y2, 32.0);
    }

    #[test]
    fn detections_are_in_input_coordinates() {
        let device = Default::default();
        let config = tiny_config().with_detection_min_confidence(0.0);
        let model = config.init_model::<TestBackend>(&device);
        let images = [
            RgbImage::from_pixel(32, 48, Rgb([120, 110, 100])),
            RgbImage::from_pixel(64, 64, Rgb([10, 10, 10])),
        ];

        let detections = detect(&model, &images, &config, &device).unwrap();
        assert_eq!(detections.len(), 2);
        for (image, found) in images.iter().zip(&detections) {
            assert!(found.len() <= config.detection_max_instances);
            for detection in found {
                assert_eq!(detection.mask.dimensions(), image.dimensions());
                assert!(detection.bbox.y2 <= image.height() as f32 + 1.0);
                assert!(detection.bbox.x2 <= image.width() as f32 + 1.0);
                assert!(detection.class_id >= 1);
            }
        }
    }
}
