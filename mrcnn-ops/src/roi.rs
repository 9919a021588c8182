//! Region-of-interest pooling over a feature pyramid.

use burn::{prelude::*, tensor::module::adaptive_avg_pool2d};

use crate::boxes::BBox;

/// Canonical ROI size of the FPN paper (mapped to `P4`).
const CANONICAL_SIZE: f32 = 224.0;

/// A box tied to one image of the batch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Roi {
    pub batch_index: usize,
    pub bbox: BBox,
}

/// Pyramid level (2..=5) a box of this size is pooled from.
pub fn roi_level(bbox: &BBox) -> usize {
    let size = (bbox.height().max(1e-6) * bbox.width().max(1e-6)).sqrt();
    let level = 4.0 + (size / CANONICAL_SIZE).log2().round();
    level.clamp(2.0, 5.0) as usize
}

/// Pools every ROI to `[output_size, output_size]` from the level chosen by
/// [`roi_level`].
///
/// `feature_maps` are `P2..P5` with the matching `strides`. Each ROI is
/// cropped to the feature cells it covers (at least one cell) and average
/// pooled, so gradients flow back into the pyramid. Returns `None` when
/// there are no ROIs.
pub fn pyramid_roi_pool<B: Backend>(
    feature_maps: &[Tensor<B, 4>],
    strides: &[usize],
    rois: &[Roi],
    output_size: usize,
) -> Option<Tensor<B, 4>> {
    if rois.is_empty() {
        return None;
    }

    let pooled = rois
        .iter()
        .map(|roi| {
            let level = (roi_level(&roi.bbox) - 2).min(feature_maps.len() - 1);
            let features = &feature_maps[level];
            let stride = strides[level] as f32;
            let [_, channels, height, width] = features.dims();

            let (y0, y1) = cell_span(roi.bbox.y1, roi.bbox.y2, stride, height);
            let (x0, x1) = cell_span(roi.bbox.x1, roi.bbox.x2, stride, width);

            let crop = features.clone().slice([
                roi.batch_index..roi.batch_index + 1,
                0..channels,
                y0..y1,
                x0..x1,
            ]);
            adaptive_avg_pool2d(crop, [output_size, output_size])
        })
        .collect();

    Some(Tensor::cat(pooled, 0))
}

/// Feature cells covered by `[start, end)` in pixels, never empty.
fn cell_span(start: f32, end: f32, stride: f32, len: usize) -> (usize, usize) {
    let first = ((start / stride).floor().max(0.0) as usize).min(len - 1);
    let last = ((end / stride).ceil().max(0.0) as usize).clamp(first + 1, len);
    (first, last)
}

/// Bilinear crop of a single-channel grid (`height * width`, row-major) to
/// `out_h * out_w` samples over `bbox`.
///
/// Samples outside the grid read as zero.
pub fn crop_and_resize(
    grid: &[f32],
    height: usize,
    width: usize,
    bbox: &BBox,
    out_h: usize,
    out_w: usize,
) -> Vec<f32> {
    let step_y = bbox.height() / out_h as f32;
    let step_x = bbox.width() / out_w as f32;

    let sample = |y: f32, x: f32| -> f32 {
        if y < -0.5 || x < -0.5 || y > height as f32 - 0.5 || x > width as f32 - 0.5 {
            return 0.0;
        }
        let y = y.clamp(0.0, (height - 1) as f32);
        let x = x.clamp(0.0, (width - 1) as f32);
        let (y0, x0) = (y.floor() as usize, x.floor() as usize);
        let (y1, x1) = ((y0 + 1).min(height - 1), (x0 + 1).min(width - 1));
        let (dy, dx) = (y - y0 as f32, x - x0 as f32);

        let top = grid[y0 * width + x0] * (1.0 - dx) + grid[y0 * width + x1] * dx;
        let bottom = grid[y1 * width + x0] * (1.0 - dx) + grid[y1 * width + x1] * dx;
        top * (1.0 - dy) + bottom * dy
    };

    let mut out = Vec::with_capacity(out_h * out_w);
    for i in 0..out_h {
        let y = bbox.y1 + (i as f32 + 0.5) * step_y - 0.5;
        for j in 0..out_w {
            let x = bbox.x1 + (j as f32 + 0.5) * step_x - 0.5;
            out.push(sample(y, x));
        }
    }
    out
}
