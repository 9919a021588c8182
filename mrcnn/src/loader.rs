//! Turns dataset entries into network-ready samples and batches them.
//!
//! Samples are built on the host (decode, resize, augment, targets) by the
//! dataset so the data loader workers can run them in parallel. The batcher
//! only packs pixels into a tensor. A sample that cannot be built is kept
//! as a [`SampleFailure`] instead of ending the epoch. The training loop
//! skips up to [`MAX_SAMPLE_FAILURES`] of them per call, then aborts.

use std::{
    marker::PhantomData,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use burn::{
    data::{dataloader::batcher::Batcher, dataset::Dataset},
    prelude::*,
};
use image::GrayImage;
use mrcnn_ops::BBox;
use rand::{rngs::StdRng, seq::index::sample as sample_indices, Rng, SeedableRng};

use crate::{
    augmentation::Augmentation,
    config::MaskRcnnConfig,
    dataset::PreparedDataset,
    error::{MrcnnError, MrcnnResult},
    image_ops::{extract_bboxes, minimize_mask, mold_image, resize_image, resize_mask, MaskGrid},
    targets::GroundTruth,
};

/// One image ready for the network.
#[derive(Debug, Clone)]
pub struct MrcnnItem {
    pub image_id: String,
    /// Mean-subtracted HWC pixels.
    pub image: Vec<f32>,
    pub height: usize,
    pub width: usize,
    /// Region of the input holding image pixels (the rest is padding).
    pub window: BBox,
    pub gt: GroundTruth,
}

/// An image that could not be turned into a sample.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleFailure {
    pub image_id: String,
    pub reason: String,
}

pub type Sample = Result<MrcnnItem, SampleFailure>;

/// Sample failures tolerated per training call before it aborts.
pub const MAX_SAMPLE_FAILURES: usize = 5;

/// Counts sample failures and turns them into an error once more than
/// `limit` have been seen.
#[derive(Debug, Clone)]
pub struct FailureBudget {
    limit: usize,
    seen: usize,
}

impl Default for FailureBudget {
    fn default() -> Self {
        Self::new(MAX_SAMPLE_FAILURES)
    }
}

impl FailureBudget {
    pub const fn new(limit: usize) -> Self {
        Self { limit, seen: 0 }
    }

    pub const fn seen(&self) -> usize {
        self.seen
    }

    /// Logs `failures` and counts them against the budget.
    ///
    /// # Errors
    ///
    /// [`MrcnnError::SampleLoadFailed`] for the failure that exceeds the
    /// limit.
    pub fn record(&mut self, failures: &[SampleFailure]) -> MrcnnResult<()> {
        for failure in failures {
            self.seen += 1;
            if self.seen > self.limit {
                return Err(MrcnnError::SampleLoadFailed {
                    image_id: failure.image_id.clone(),
                    reason: failure.reason.clone(),
                });
            }
            tracing::warn!(
                image_id = %failure.image_id,
                reason = %failure.reason,
                failures = self.seen,
                limit = self.limit,
                "skipping sample"
            );
        }
        Ok(())
    }
}

/// Loads image `index` with its ground truth in network input coordinates.
///
/// Masks are resized with the image, then augmented with it. Instances that
/// vanish (rotated out of frame) are dropped and at most
/// `max_gt_instances` are kept, chosen at random.
///
/// # Errors
///
/// Decoding errors from the dataset and [`MrcnnError::MaskSizeMismatch`]
/// when a mask does not cover the image.
pub fn load_image_gt<R: Rng + ?Sized>(
    dataset: &PreparedDataset,
    index: usize,
    config: &MaskRcnnConfig,
    augmentation: Option<&Augmentation>,
    rng: &mut R,
) -> MrcnnResult<MrcnnItem> {
    let info = dataset.image_info(index)?;
    let image = dataset.load_image(index)?;
    let instances = dataset.load_mask(index)?;

    if let Some(mask) = instances
        .masks
        .iter()
        .find(|mask| mask.dimensions() != image.dimensions())
    {
        return Err(MrcnnError::MaskSizeMismatch {
            path: info.path.clone(),
            expected: image.dimensions(),
            actual: mask.dimensions(),
        });
    }

    let resized = resize_image(
        &image,
        config.image_min_dim,
        config.image_max_dim,
        config.image_min_scale,
        config.image_resize_mode,
    );
    let masks: Vec<GrayImage> = instances
        .masks
        .iter()
        .map(|mask| resize_mask(mask, resized.scale, resized.padding))
        .collect();

    let (image, masks) = match augmentation {
        Some(augmentation) => augmentation.apply(resized.image, masks, rng),
        None => (resized.image, masks),
    };

    let (mut masks, mut class_ids): (Vec<GrayImage>, Vec<usize>) = masks
        .into_iter()
        .zip(instances.class_ids.iter().map(|&id| id as usize))
        .filter(|(mask, _)| mask.pixels().any(|p| p[0] > 0))
        .unzip();

    if masks.len() > config.max_gt_instances {
        let mut keep = sample_indices(rng, masks.len(), config.max_gt_instances).into_vec();
        keep.sort_unstable();
        masks = keep.iter().map(|&i| masks[i].clone()).collect();
        class_ids = keep.iter().map(|&i| class_ids[i]).collect();
    }

    let boxes = extract_bboxes(&masks);
    let grids: Vec<MaskGrid> = if config.use_mini_mask {
        masks
            .iter()
            .zip(&boxes)
            .map(|(mask, bbox)| minimize_mask(mask, bbox, config.mini_mask_shape))
            .collect()
    } else {
        masks.iter().map(MaskGrid::from_gray).collect()
    };

    Ok(MrcnnItem {
        image_id: info.id.clone(),
        image: mold_image(&image, config.mean_pixel),
        height: image.height() as usize,
        width: image.width() as usize,
        window: resized.window,
        gt: GroundTruth {
            class_ids,
            boxes,
            masks: grids,
            mini_masks: config.use_mini_mask,
        },
    })
}

/// [`Dataset`] of training samples over a [`PreparedDataset`].
///
/// Every `get` seeds a fresh RNG from the base seed and a draw counter, so
/// repeated visits of an image are augmented differently while a run stays
/// reproducible for a fixed access order.
pub struct SampleDataset {
    dataset: Arc<PreparedDataset>,
    config: Arc<MaskRcnnConfig>,
    augmentation: Option<Augmentation>,
    seed: u64,
    draws: AtomicU64,
}

impl SampleDataset {
    pub fn new(
        dataset: Arc<PreparedDataset>,
        config: Arc<MaskRcnnConfig>,
        augmentation: Option<Augmentation>,
    ) -> Self {
        let seed = config.seed;
        Self {
            dataset,
            config,
            augmentation,
            seed,
            draws: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }
}

impl Dataset<Sample> for SampleDataset {
    fn get(&self, index: usize) -> Option<Sample> {
        if index >= self.dataset.len() {
            return None;
        }
        let draw = self.draws.fetch_add(1, Ordering::Relaxed);
        let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(draw));

        let sample = load_image_gt(
            &self.dataset,
            index,
            &self.config,
            self.augmentation.as_ref(),
            &mut rng,
        )
        .map_err(|err| SampleFailure {
            image_id: self
                .dataset
                .image_info(index)
                .map(|info| info.id.clone())
                .unwrap_or_else(|_| index.to_string()),
            reason: err.to_string(),
        });
        Some(sample)
    }

    fn len(&self) -> usize {
        self.dataset.len()
    }
}

/// A batch of images plus the host-side ground truth of each.
#[derive(Debug, Clone)]
pub struct MrcnnBatch<B: Backend> {
    /// `[N, 3, H, W]`; `None` when no sample of the batch could be loaded.
    pub images: Option<Tensor<B, 4>>,
    pub image_ids: Vec<String>,
    pub windows: Vec<BBox>,
    pub ground_truth: Vec<GroundTruth>,
    pub failures: Vec<SampleFailure>,
}

impl<B: Backend> MrcnnBatch<B> {
    pub fn len(&self) -> usize {
        self.image_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.image_ids.is_empty()
    }
}

/// Packs samples into an `[N, 3, H, W]` tensor, zero-padding smaller images
/// at the bottom and right.
#[derive(Clone, Default)]
pub struct MrcnnBatcher<B: Backend> {
    _phantom: PhantomData<B>,
}

impl<B: Backend> MrcnnBatcher<B> {
    pub const fn new() -> Self {
        Self {
            _phantom: PhantomData,
        }
    }
}

impl<B: Backend> Batcher<B, Sample, MrcnnBatch<B>> for MrcnnBatcher<B> {
    fn batch(&self, items: Vec<Sample>, device: &B::Device) -> MrcnnBatch<B> {
        let (items, failures): (Vec<_>, Vec<_>) = items.into_iter().partition(Result::is_ok);
        let items: Vec<MrcnnItem> = items.into_iter().filter_map(Result::ok).collect();
        let failures: Vec<SampleFailure> = failures.into_iter().filter_map(Result::err).collect();

        let height = items.iter().map(|item| item.height).max().unwrap_or(0);
        let width = items.iter().map(|item| item.width).max().unwrap_or(0);
        let plane = height * width;

        let images = (!items.is_empty()).then(|| {
            let mut data = vec![0.0f32; items.len() * 3 * plane];
            for (n, item) in items.iter().enumerate() {
                // HWC to CHW
                for (pixel, rgb) in item.image.chunks_exact(3).enumerate() {
                    let (y, x) = (pixel / item.width, pixel % item.width);
                    for (c, value) in rgb.iter().enumerate() {
                        data[(n * 3 + c) * plane + y * width + x] = *value;
                    }
                }
            }
            Tensor::from_data(TensorData::new(data, [items.len(), 3, height, width]), device)
        });

        let mut batch = MrcnnBatch {
            images,
            image_ids: Vec::with_capacity(items.len()),
            windows: Vec::with_capacity(items.len()),
            ground_truth: Vec::with_capacity(items.len()),
            failures,
        };
        for item in items {
            batch.image_ids.push(item.image_id);
            batch.windows.push(item.window);
            batch.ground_truth.push(item.gt);
        }
        batch
    }
}
