use std::path::Path;

use image::{GrayImage, Luma, Rgb, RgbImage};
use mrcnn::{list_image_ids, CryptsDataset, MaskRcnnConfig, PreparedDataset, ResNetDepth};

pub fn tiny_config() -> MaskRcnnConfig {
    MaskRcnnConfig::new()
        .with_gpu_count(1)
        .with_images_per_gpu(1)
        .with_total_training_samples(1)
        .with_validation_steps(1)
        .with_backbone(ResNetDepth::Resnet18)
        .with_top_down_pyramid_size(8)
        .with_fpn_classif_fc_layers_size(16)
        .with_rpn_anchor_scales(vec![8.0, 16.0, 32.0, 64.0, 128.0])
        .with_rpn_train_anchors_per_image(16)
        .with_pre_nms_limit(200)
        .with_post_nms_rois_training(20)
        .with_post_nms_rois_inference(10)
        .with_image_min_dim(64)
        .with_image_max_dim(64)
        .with_mini_mask_shape([8, 8])
        .with_train_rois_per_image(8)
        .with_mask_pool_size(4)
        .with_mask_shape([8, 8])
        .with_max_gt_instances(8)
        .with_detection_max_instances(10)
}

/// `<base>/Images/<id>` with one instance mask per crypt in
/// `<base>/Masks/<stem>/`.
pub fn write_split(base: &Path, ids: &[&str]) {
    let size = 48;
    let crypts = [(4, 20), (26, 44)];
    let inside = |x: u32, y: u32, (from, to): (u32, u32)| (from..to).contains(&x) && (from..to).contains(&y);
    std::fs::create_dir_all(base.join("Images")).unwrap();

    for id in ids {
        RgbImage::from_fn(size, size, |x, y| {
            if crypts.iter().any(|&c| inside(x, y, c)) {
                Rgb([210, 170, 190])
            } else {
                Rgb([25, 25, 35])
            }
        })
        .save(base.join("Images").join(id))
        .unwrap();

        let stem = Path::new(id).file_stem().unwrap().to_string_lossy().into_owned();
        let masks = base.join("Masks").join(stem);
        std::fs::create_dir_all(&masks).unwrap();
        for (index, &crypt) in crypts.iter().enumerate() {
            GrayImage::from_fn(size, size, |x, y| Luma([if inside(x, y, crypt) { 255 } else { 0 }]))
                .save(masks.join(format!("crypt_{index}.png")))
                .unwrap();
        }
    }
}

pub fn prepare(base: &Path) -> PreparedDataset {
    let mut dataset = CryptsDataset::new();
    dataset.load(list_image_ids(base.join("Images")).unwrap(), base);
    dataset.prepare().unwrap()
}
