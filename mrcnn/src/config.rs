//! Training and model configuration.
//!
//! Every parameter carries the value used for the crypts dataset as its
//! default, so `MaskRcnnConfig::new()` is the configuration of a full
//! training run. Values can be overridden with the generated `with_*`
//! builders or loaded from JSON through [`burn::config::Config::load`].

use burn::prelude::*;
use resnet::ResNetDepth;
use serde_json::Value;

use crate::error::{MrcnnError, MrcnnResult};

/// How input images are brought to the network input size.
#[derive(Config, Debug, Copy, PartialEq, Eq)]
pub enum ImageResizeMode {
    /// No resizing or padding.
    None,
    /// Scale to `image_min_dim` (bounded by `image_max_dim`) and zero-pad to
    /// an `image_max_dim` square.
    Square,
    /// Scale like `Square` and pad each side up to a multiple of 64.
    Pad64,
}

/// Weights of the five loss terms in the total loss.
#[derive(Config, Debug, Copy, PartialEq)]
pub struct LossWeights {
    #[config(default = "1.0")]
    pub rpn_class: f32,
    #[config(default = "1.0")]
    pub rpn_bbox: f32,
    #[config(default = "1.0")]
    pub mrcnn_class: f32,
    #[config(default = "1.0")]
    pub mrcnn_bbox: f32,
    #[config(default = "1.0")]
    pub mrcnn_mask: f32,
}

#[derive(Config, Debug)]
pub struct MaskRcnnConfig {
    /// Prefix of run directories and checkpoint files.
    #[config(default = "\"crypt\".to_string()")]
    pub name: String,

    #[config(default = "4")]
    pub gpu_count: usize,

    #[config(default = "1")]
    pub images_per_gpu: usize,

    /// Training samples per epoch; `steps_per_epoch` is derived from it.
    #[config(default = "664")]
    pub total_training_samples: usize,

    /// Validation batches run at the end of every epoch.
    #[config(default = "1")]
    pub validation_steps: usize,

    #[config(default = "ResNetDepth::Resnet101")]
    pub backbone: ResNetDepth,

    #[config(default = "vec![4, 8, 16, 32, 64]")]
    pub backbone_strides: Vec<usize>,

    #[config(default = "256")]
    pub top_down_pyramid_size: usize,

    #[config(default = "1024")]
    pub fpn_classif_fc_layers_size: usize,

    /// Including background.
    #[config(default = "2")]
    pub num_classes: usize,

    /// Anchor side in pixels, one per pyramid level.
    #[config(default = "vec![32.0, 64.0, 128.0, 256.0, 512.0]")]
    pub rpn_anchor_scales: Vec<f32>,

    /// Width over height.
    #[config(default = "vec![0.5, 1.0, 2.0]")]
    pub rpn_anchor_ratios: Vec<f32>,

    #[config(default = "1")]
    pub rpn_anchor_stride: usize,

    #[config(default = "0.7")]
    pub rpn_nms_threshold: f32,

    #[config(default = "256")]
    pub rpn_train_anchors_per_image: usize,

    #[config(default = "6000")]
    pub pre_nms_limit: usize,

    #[config(default = "2000")]
    pub post_nms_rois_training: usize,

    #[config(default = "1000")]
    pub post_nms_rois_inference: usize,

    #[config(default = "[0.1, 0.1, 0.2, 0.2]")]
    pub rpn_bbox_std_dev: [f32; 4],

    #[config(default = "[0.1, 0.1, 0.2, 0.2]")]
    pub bbox_std_dev: [f32; 4],

    #[config(default = "ImageResizeMode::Square")]
    pub image_resize_mode: ImageResizeMode,

    #[config(default = "800")]
    pub image_min_dim: usize,

    #[config(default = "1024")]
    pub image_max_dim: usize,

    /// Minimum scale applied when resizing; `0.0` disables it.
    #[config(default = "0.0")]
    pub image_min_scale: f32,

    #[config(default = "3")]
    pub image_channel_count: usize,

    /// RGB mean subtracted from every pixel.
    #[config(default = "[123.7, 116.8, 103.9]")]
    pub mean_pixel: [f32; 3],

    /// Store ground-truth masks cropped to their boxes at `mini_mask_shape`.
    #[config(default = "true")]
    pub use_mini_mask: bool,

    #[config(default = "[56, 56]")]
    pub mini_mask_shape: [usize; 2],

    #[config(default = "200")]
    pub train_rois_per_image: usize,

    #[config(default = "0.33")]
    pub roi_positive_ratio: f32,

    #[config(default = "7")]
    pub pool_size: usize,

    #[config(default = "14")]
    pub mask_pool_size: usize,

    #[config(default = "[28, 28]")]
    pub mask_shape: [usize; 2],

    #[config(default = "256")]
    pub max_gt_instances: usize,

    #[config(default = "512")]
    pub detection_max_instances: usize,

    #[config(default = "0.7")]
    pub detection_min_confidence: f32,

    #[config(default = "0.3")]
    pub detection_nms_threshold: f32,

    #[config(default = "0.001")]
    pub learning_rate: f64,

    #[config(default = "0.9")]
    pub learning_momentum: f64,

    #[config(default = "0.0001")]
    pub weight_decay: f64,

    #[config(default = "5.0")]
    pub gradient_clip_norm: f32,

    #[config(default = "LossWeights::new()")]
    pub loss_weights: LossWeights,

    /// Maximum aspect ratio change when scaling.
    #[config(default = "1.3")]
    pub aspect_ratio: f32,

    /// Minimum enlargement of images.
    #[config(default = "1.2")]
    pub min_enlarge: f32,

    /// Maximum zoom per image.
    #[config(default = "1.5")]
    pub zoom: f32,

    /// Degrees.
    #[config(default = "10.0")]
    pub rot_range: f32,

    #[config(default = "15")]
    pub channel_shift_range: u8,

    #[config(default = "123")]
    pub seed: u64,
}

impl MaskRcnnConfig {
    pub const fn batch_size(&self) -> usize {
        self.gpu_count * self.images_per_gpu
    }

    /// Training batches per epoch. Zero when `images_per_gpu` is zero,
    /// which [`MaskRcnnConfig::validate`] rejects.
    pub fn steps_per_epoch(&self) -> usize {
        self.total_training_samples
            .checked_div(self.images_per_gpu)
            .unwrap_or(0)
    }

    /// `[height, width, channels]` of the network input.
    pub const fn image_shape(&self) -> [usize; 3] {
        [
            self.image_max_dim,
            self.image_max_dim,
            self.image_channel_count,
        ]
    }

    pub fn anchors_per_location(&self) -> usize {
        self.rpn_anchor_ratios.len()
    }

    /// Every parameter and derived value as `(NAME, value)`, sorted by name.
    pub fn display_entries(&self) -> Vec<(String, String)> {
        let mut entries: Vec<(String, String)> = match serde_json::to_value(self) {
            Ok(Value::Object(fields)) => fields
                .into_iter()
                .map(|(name, value)| (name.to_uppercase(), display_value(&value)))
                .collect(),
            _ => Vec::new(),
        };

        entries.push(("BATCH_SIZE".into(), self.batch_size().to_string()));
        entries.push(("STEPS_PER_EPOCH".into(), self.steps_per_epoch().to_string()));
        entries.push(("IMAGE_SHAPE".into(), format!("{:?}", self.image_shape())));

        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries.dedup_by(|a, b| a.0 == b.0);
        entries
    }

    /// Logs every parameter in a two-column table.
    pub fn display(&self) {
        tracing::info!("Configurations:");
        for (name, value) in self.display_entries() {
            tracing::info!("{name:30} {value}");
        }
    }

    /// Checks the values the model and data pipeline depend on.
    ///
    /// # Errors
    ///
    /// Returns [`MrcnnError::InvalidConfiguration`] naming the first
    /// offending parameter.
    pub fn validate(&self) -> MrcnnResult<()> {
        let invalid = |reason: String| Err(MrcnnError::InvalidConfiguration { reason });

        if self.gpu_count == 0 || self.images_per_gpu == 0 {
            return invalid(format!(
                "gpu_count ({}) and images_per_gpu ({}) must be positive",
                self.gpu_count, self.images_per_gpu
            ));
        }
        if self.num_classes < 2 {
            return invalid(format!(
                "num_classes must include background and at least one class, got {}",
                self.num_classes
            ));
        }
        if self.backbone_strides.len() != 5 {
            return invalid(format!(
                "backbone_strides needs one stride for P2..P6, got {}",
                self.backbone_strides.len()
            ));
        }
        if self.rpn_anchor_scales.len() != self.backbone_strides.len() {
            return invalid(format!(
                "{} anchor scales for {} pyramid levels",
                self.rpn_anchor_scales.len(),
                self.backbone_strides.len()
            ));
        }
        if self.rpn_anchor_ratios.is_empty() || self.rpn_anchor_stride == 0 {
            return invalid("anchor ratios and stride must be non-empty".into());
        }
        match self.image_resize_mode {
            ImageResizeMode::Square if self.image_max_dim % 64 != 0 => {
                return invalid(format!(
                    "image_max_dim must be divisible by 64, got {}",
                    self.image_max_dim
                ));
            }
            ImageResizeMode::Pad64 if self.image_min_dim % 64 != 0 => {
                return invalid(format!(
                    "image_min_dim must be divisible by 64 in Pad64 mode, got {}",
                    self.image_min_dim
                ));
            }
            _ => {}
        }
        if self.image_channel_count != 3 {
            return invalid(format!(
                "only RGB input is supported, got {} channels",
                self.image_channel_count
            ));
        }
        if !(self.roi_positive_ratio > 0.0 && self.roi_positive_ratio <= 1.0) {
            return invalid(format!(
                "roi_positive_ratio must be in (0, 1], got {}",
                self.roi_positive_ratio
            ));
        }
        if self.train_rois_per_image == 0 || self.rpn_train_anchors_per_image == 0 {
            return invalid("train_rois_per_image and rpn_train_anchors_per_image must be positive".into());
        }
        if self.mask_shape != [2 * self.mask_pool_size; 2] {
            return invalid(format!(
                "mask_shape {:?} must be twice mask_pool_size {}",
                self.mask_shape, self.mask_pool_size
            ));
        }
        if self.pool_size == 0 || self.mini_mask_shape.contains(&0) {
            return invalid("pool_size and mini_mask_shape must be positive".into());
        }
        Ok(())
    }
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}
