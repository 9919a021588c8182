//! Resizing, padding and mask conversions applied before images reach the
//! network.

use image::{imageops, imageops::FilterType, GrayImage, Luma, Rgb, RgbImage};
use mrcnn_ops::BBox;

use crate::config::ImageResizeMode;

/// A dense single-channel mask with values in `[0, 1]`, row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct MaskGrid {
    pub height: usize,
    pub width: usize,
    pub data: Vec<f32>,
}

impl MaskGrid {
    pub fn from_gray(mask: &GrayImage) -> Self {
        Self {
            height: mask.height() as usize,
            width: mask.width() as usize,
            data: mask.pixels().map(|p| f32::from(p[0] > 0)).collect(),
        }
    }

    pub fn to_gray(&self) -> GrayImage {
        GrayImage::from_fn(self.width as u32, self.height as u32, |x, y| {
            let value = self.data[y as usize * self.width + x as usize];
            Luma([if value >= 0.5 { 255 } else { 0 }])
        })
    }
}

/// Output of [`resize_image`].
#[derive(Debug, Clone)]
pub struct ResizedImage {
    pub image: RgbImage,
    /// Area of the padded image holding the original pixels.
    pub window: BBox,
    pub scale: f32,
    /// `(top, bottom)` and `(left, right)` zero padding.
    pub padding: [(u32, u32); 2],
}

/// Scales and pads `image` according to `mode`.
pub fn resize_image(
    image: &RgbImage,
    min_dim: usize,
    max_dim: usize,
    min_scale: f32,
    mode: ImageResizeMode,
) -> ResizedImage {
    let (h, w) = (image.height(), image.width());
    let unchanged = ResizedImage {
        image: image.clone(),
        window: BBox::new(0.0, 0.0, h as f32, w as f32),
        scale: 1.0,
        padding: [(0, 0), (0, 0)],
    };
    if mode == ImageResizeMode::None {
        return unchanged;
    }

    let mut scale = if min_dim > 0 {
        (min_dim as f32 / h.min(w) as f32).max(1.0)
    } else {
        1.0
    };
    if min_scale > 0.0 && scale < min_scale {
        scale = min_scale;
    }
    if mode == ImageResizeMode::Square && max_dim > 0 {
        let image_max = h.max(w) as f32;
        if (image_max * scale).round() > max_dim as f32 {
            scale = max_dim as f32 / image_max;
        }
    }

    let scaled = if (scale - 1.0).abs() > f32::EPSILON {
        let new_h = ((h as f32 * scale).round() as u32).max(1);
        let new_w = ((w as f32 * scale).round() as u32).max(1);
        imageops::resize(image, new_w, new_h, FilterType::Triangle)
    } else {
        image.clone()
    };
    let (h, w) = (scaled.height(), scaled.width());

    let padding = match mode {
        ImageResizeMode::Square => {
            let max_dim = max_dim as u32;
            let top = max_dim.saturating_sub(h) / 2;
            let left = max_dim.saturating_sub(w) / 2;
            [
                (top, max_dim.saturating_sub(h) - top),
                (left, max_dim.saturating_sub(w) - left),
            ]
        }
        _ => {
            let pad = |len: u32| {
                let total = len.next_multiple_of(64) - len;
                (total / 2, total - total / 2)
            };
            [pad(h), pad(w)]
        }
    };

    let out_h = h + padding[0].0 + padding[0].1;
    let out_w = w + padding[1].0 + padding[1].1;
    let mut padded = RgbImage::from_pixel(out_w, out_h, Rgb([0, 0, 0]));
    imageops::replace(
        &mut padded,
        &scaled,
        i64::from(padding[1].0),
        i64::from(padding[0].0),
    );

    let (top, left) = (padding[0].0 as f32, padding[1].0 as f32);
    ResizedImage {
        image: padded,
        window: BBox::new(top, left, top + h as f32, left + w as f32),
        scale,
        padding,
    }
}

/// Applies the scale and padding of [`resize_image`] to a mask, with
/// nearest-neighbour sampling.
pub fn resize_mask(mask: &GrayImage, scale: f32, padding: [(u32, u32); 2]) -> GrayImage {
    let (h, w) = (mask.height(), mask.width());
    let scaled = if (scale - 1.0).abs() > f32::EPSILON {
        let new_h = ((h as f32 * scale).round() as u32).max(1);
        let new_w = ((w as f32 * scale).round() as u32).max(1);
        imageops::resize(mask, new_w, new_h, FilterType::Nearest)
    } else {
        mask.clone()
    };

    let out_h = scaled.height() + padding[0].0 + padding[0].1;
    let out_w = scaled.width() + padding[1].0 + padding[1].1;
    let mut padded = GrayImage::new(out_w, out_h);
    imageops::replace(
        &mut padded,
        &scaled,
        i64::from(padding[1].0),
        i64::from(padding[0].0),
    );
    padded
}

/// Tight box around the non-zero pixels of each mask. Empty masks give an
/// all-zero box.
pub fn extract_bboxes(masks: &[GrayImage]) -> Vec<BBox> {
    masks
        .iter()
        .map(|mask| {
            let mut bounds: Option<(u32, u32, u32, u32)> = None;
            for (x, y, pixel) in mask.enumerate_pixels() {
                if pixel[0] == 0 {
                    continue;
                }
                bounds = Some(match bounds {
                    None => (y, x, y, x),
                    Some((y1, x1, y2, x2)) => (y1.min(y), x1.min(x), y2.max(y), x2.max(x)),
                });
            }
            bounds.map_or_else(BBox::default, |(y1, x1, y2, x2)| {
                BBox::new(y1 as f32, x1 as f32, (y2 + 1) as f32, (x2 + 1) as f32)
            })
        })
        .collect()
}

/// Crops `mask` to `bbox` and resizes it to `shape`, thresholded at 0.5.
pub fn minimize_mask(mask: &GrayImage, bbox: &BBox, shape: [usize; 2]) -> MaskGrid {
    let x = bbox.x1.max(0.0) as u32;
    let y = bbox.y1.max(0.0) as u32;
    let w = (bbox.width().max(1.0) as u32).min(mask.width().saturating_sub(x)).max(1);
    let h = (bbox.height().max(1.0) as u32).min(mask.height().saturating_sub(y)).max(1);

    let crop = imageops::crop_imm(mask, x, y, w, h).to_image();
    let resized = imageops::resize(&crop, shape[1] as u32, shape[0] as u32, FilterType::Triangle);

    MaskGrid {
        height: shape[0],
        width: shape[1],
        data: resized
            .pixels()
            .map(|p| f32::from(p[0] >= 128))
            .collect(),
    }
}

/// Inverse of [`minimize_mask`]: places a mini mask back into an image of
/// `image_shape` (`[height, width]`).
pub fn expand_mask(mini: &MaskGrid, bbox: &BBox, image_shape: [u32; 2]) -> GrayImage {
    let mut mask = GrayImage::new(image_shape[1], image_shape[0]);
    let w = bbox.width().round().max(1.0) as u32;
    let h = bbox.height().round().max(1.0) as u32;

    let resized = imageops::resize(&mini.to_gray(), w, h, FilterType::Triangle);
    let binary = GrayImage::from_fn(w, h, |x, y| {
        Luma([if resized.get_pixel(x, y)[0] >= 128 { 255 } else { 0 }])
    });
    imageops::replace(&mut mask, &binary, bbox.x1 as i64, bbox.y1 as i64);
    mask
}

/// HWC float pixels with the mean subtracted.
pub fn mold_image(image: &RgbImage, mean_pixel: [f32; 3]) -> Vec<f32> {
    image
        .pixels()
        .flat_map(|p| {
            [
                f32::from(p[0]) - mean_pixel[0],
                f32::from(p[1]) - mean_pixel[1],
                f32::from(p[2]) - mean_pixel[2],
            ]
        })
        .collect()
}

/// Pastes a predicted `mask_shape` probability grid into an image-sized
/// binary mask covering `bbox`.
pub fn unmold_mask(mask: &MaskGrid, bbox: &BBox, image_shape: [u32; 2]) -> GrayImage {
    let mut full = GrayImage::new(image_shape[1], image_shape[0]);
    let w = bbox.width().round().max(1.0) as u32;
    let h = bbox.height().round().max(1.0) as u32;

    let probabilities = GrayImage::from_fn(mask.width as u32, mask.height as u32, |x, y| {
        let value = mask.data[y as usize * mask.width + x as usize];
        Luma([(value.clamp(0.0, 1.0) * 255.0).round() as u8])
    });
    let resized = imageops::resize(&probabilities, w, h, FilterType::Triangle);
    let binary = GrayImage::from_fn(w, h, |x, y| {
        Luma([if resized.get_pixel(x, y)[0] >= 128 { 255 } else { 0 }])
    });
    imageops::replace(&mut full, &binary, bbox.x1.round() as i64, bbox.y1.round() as i64);
    full
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square_mask(size: u32, from: u32, to: u32) -> GrayImage {
        GrayImage::from_fn(size, size, |x, y| {
            Luma([if (from..to).contains(&x) && (from..to).contains(&y) {
                255
            } else {
                0
            }])
        })
    }

    #[test]
    fn square_mode_scales_short_side_and_pads() {
        let image = RgbImage::from_pixel(50, 100, Rgb([10, 20, 30]));
        let resized = resize_image(&image, 128, 256, 0.0, ImageResizeMode::Square);

        assert_eq!(resized.image.dimensions(), (256, 256));
        assert!((resized.scale - 2.56).abs() < 1e-5);
        assert_eq!(resized.window, BBox::new(0.0, 64.0, 256.0, 192.0));
        assert_eq!(resized.padding, [(0, 0), (64, 64)]);
    }

    #[test]
    fn square_mode_never_exceeds_max_dim() {
        let image = RgbImage::new(64, 64);
        let resized = resize_image(&image, 100, 64, 0.0, ImageResizeMode::Square);
        assert_eq!(resized.image.dimensions(), (64, 64));
        assert_eq!(resized.scale, 1.0);
    }

    #[test]
    fn pad64_rounds_each_side_up() {
        let image = RgbImage::new(100, 70);
        let resized = resize_image(&image, 0, 0, 0.0, ImageResizeMode::Pad64);
        assert_eq!(resized.image.dimensions(), (128, 128));
        assert_eq!(resized.padding, [(29, 29), (14, 14)]);
    }

    #[test]
    fn none_mode_is_identity() {
        let image = RgbImage::new(30, 20);
        let resized = resize_image(&image, 800, 1024, 0.0, ImageResizeMode::None);
        assert_eq!(resized.image.dimensions(), (30, 20));
        assert_eq!(resized.window, BBox::new(0.0, 0.0, 20.0, 30.0));
    }

    #[test]
    fn mask_follows_image_geometry() {
        let mask = square_mask(32, 8, 16);
        let resized = resize_mask(&mask, 2.0, [(4, 4), (0, 0)]);
        assert_eq!(resized.dimensions(), (64, 72));

        let bbox = extract_bboxes(&[resized])[0];
        let expected = BBox::new(20.0, 16.0, 36.0, 32.0);
        for (a, b) in bbox.to_array().iter().zip(expected.to_array()) {
            assert!((a - b).abs() <= 1.0, "{bbox:?}");
        }
    }

    #[test]
    fn bboxes_are_exclusive_and_empty_masks_are_zero() {
        let boxes = extract_bboxes(&[square_mask(16, 2, 5), GrayImage::new(16, 16)]);
        assert_eq!(boxes[0], BBox::new(2.0, 2.0, 5.0, 5.0));
        assert_eq!(boxes[1], BBox::default());
    }

    #[test]
    fn mini_mask_expands_back_to_the_instance() {
        let mask = square_mask(64, 16, 48);
        let bbox = extract_bboxes(std::slice::from_ref(&mask))[0];

        let mini = minimize_mask(&mask, &bbox, [8, 8]);
        assert!(mini.data.iter().all(|&v| v == 1.0));

        let expanded = expand_mask(&mini, &bbox, [64, 64]);
        assert_eq!(expanded, mask);
    }

    #[test]
    fn molding_subtracts_the_mean() {
        let image = RgbImage::from_pixel(1, 2, Rgb([124, 117, 104]));
        let molded = mold_image(&image, [123.7, 116.8, 103.9]);
        assert_eq!(molded.len(), 6);
        assert!((molded[0] - 0.3).abs() < 1e-4);
        assert!((molded[5] - 0.1).abs() < 1e-4);
    }

    #[test]
    fn unmolded_mask_covers_its_box() {
        let grid = MaskGrid {
            height: 4,
            width: 4,
            data: vec![0.9; 16],
        };
        let mask = unmold_mask(&grid, &BBox::new(2.0, 4.0, 10.0, 12.0), [16, 16]);
        assert_eq!(extract_bboxes(&[mask]), vec![BBox::new(2.0, 4.0, 10.0, 12.0)]);
    }
}
