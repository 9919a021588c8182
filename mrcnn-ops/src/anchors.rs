//! Anchor pyramids.
//!
//! Anchors are laid out level by level (finest first), then row-major over
//! the feature map, then by aspect ratio. The RPN head flattens its outputs
//! in the same order.

use crate::boxes::BBox;

/// Spatial size of each pyramid level for an input of `image_shape`
/// (`[height, width]`).
pub fn backbone_shapes(image_shape: [usize; 2], strides: &[usize]) -> Vec<[usize; 2]> {
    strides
        .iter()
        .map(|&stride| {
            [
                image_shape[0].div_ceil(stride),
                image_shape[1].div_ceil(stride),
            ]
        })
        .collect()
}

/// Anchors of one scale on a single feature map.
pub fn generate_anchors(
    scale: f32,
    ratios: &[f32],
    shape: [usize; 2],
    feature_stride: usize,
    anchor_stride: usize,
) -> Vec<BBox> {
    let sizes: Vec<(f32, f32)> = ratios
        .iter()
        .map(|ratio| (scale / ratio.sqrt(), scale * ratio.sqrt()))
        .collect();

    let mut anchors = Vec::with_capacity(
        shape[0].div_ceil(anchor_stride) * shape[1].div_ceil(anchor_stride) * sizes.len(),
    );
    for y in (0..shape[0]).step_by(anchor_stride) {
        let cy = (y * feature_stride) as f32;
        for x in (0..shape[1]).step_by(anchor_stride) {
            let cx = (x * feature_stride) as f32;
            for &(h, w) in &sizes {
                anchors.push(BBox::new(
                    cy - 0.5 * h,
                    cx - 0.5 * w,
                    cy + 0.5 * h,
                    cx + 0.5 * w,
                ));
            }
        }
    }
    anchors
}

/// Anchors for every pyramid level, one scale per level.
pub fn generate_pyramid_anchors(
    scales: &[f32],
    ratios: &[f32],
    feature_shapes: &[[usize; 2]],
    feature_strides: &[usize],
    anchor_stride: usize,
) -> Vec<BBox> {
    scales
        .iter()
        .zip(feature_shapes)
        .zip(feature_strides)
        .flat_map(|((&scale, &shape), &stride)| {
            generate_anchors(scale, ratios, shape, stride, anchor_stride)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shapes_round_up() {
        assert_eq!(
            backbone_shapes([64, 64], &[4, 8, 16, 32, 64]),
            vec![[16, 16], [8, 8], [4, 4], [2, 2], [1, 1]]
        );
        assert_eq!(backbone_shapes([1024, 1024], &[64]), vec![[16, 16]]);
    }

    #[test]
    fn anchors_follow_scale_and_ratio() {
        let anchors = generate_anchors(32.0, &[0.5, 1.0, 2.0], [2, 2], 4, 1);
        assert_eq!(anchors.len(), 2 * 2 * 3);

        // square anchor at the origin cell
        let square = anchors[1];
        assert!((square.height() - 32.0).abs() < 1e-4);
        assert!((square.width() - 32.0).abs() < 1e-4);
        assert_eq!(square.center(), (0.0, 0.0));

        // ratio 2.0 is twice as wide as it is tall
        let wide = anchors[2];
        assert!((wide.width() / wide.height() - 2.0).abs() < 1e-4);

        // second column, first row
        assert_eq!(anchors[3].center(), (0.0, 4.0));
    }

    #[test]
    fn pyramid_concatenates_levels() {
        let shapes = backbone_shapes([64, 64], &[4, 8, 16, 32, 64]);
        let anchors = generate_pyramid_anchors(
            &[8.0, 16.0, 32.0, 64.0, 128.0],
            &[0.5, 1.0, 2.0],
            &shapes,
            &[4, 8, 16, 32, 64],
            1,
        );
        assert_eq!(anchors.len(), (256 + 64 + 16 + 4 + 1) * 3);
    }

    #[test]
    fn anchor_stride_skips_cells() {
        let anchors = generate_anchors(16.0, &[1.0], [4, 4], 8, 2);
        assert_eq!(anchors.len(), 4);
    }
}
