//! Geometric and color augmentation applied to training samples.
//!
//! An [`Augmentation`] is a stateless description of the pipeline. Each
//! sample draws its concrete [`Transform`]s from a caller-supplied RNG, then
//! the same geometric transforms are applied to the image and to every
//! instance mask so they stay aligned. Color shifts only touch the image.

use image::{imageops, GrayImage, Luma, Rgb, RgbImage};
use imageproc::geometric_transformations::{rotate_about_center, Interpolation};
use rand::Rng;

/// Rotation angle in degrees, clockwise.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RotationRange {
    Fixed(f32),
    /// Uniform in `[low, high]`.
    Uniform(f32, f32),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Augmentation {
    /// Mirror left-right with probability `p`.
    Fliplr(f64),
    /// Mirror top-bottom with probability `p`.
    Flipud(f64),
    /// Exactly one child, chosen uniformly.
    OneOf(Vec<Augmentation>),
    /// The child with probability `p`.
    Sometimes(f64, Box<Augmentation>),
    Rotate(RotationRange),
    /// Adds an integer drawn from `[low, high]` independently to each
    /// channel.
    AddPerChannel { low: i16, high: i16 },
    Sequential(Vec<Augmentation>),
}

/// A concrete operation drawn from an [`Augmentation`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Transform {
    FlipHorizontal,
    FlipVertical,
    Rotate(f32),
    AddChannels([i16; 3]),
}

impl Transform {
    pub const fn is_geometric(&self) -> bool {
        !matches!(self, Self::AddChannels(_))
    }
}

impl Augmentation {
    /// Random flips, a right-angle rotation, a small rotation on half of
    /// the samples and a per-channel intensity shift.
    pub fn crypts() -> Self {
        Self::Sequential(vec![
            Self::Fliplr(0.5),
            Self::Flipud(0.5),
            Self::OneOf(
                [0.0, 90.0, 180.0, 270.0]
                    .into_iter()
                    .map(|angle| Self::Rotate(RotationRange::Fixed(angle)))
                    .collect(),
            ),
            Self::Sometimes(
                0.5,
                Box::new(Self::Rotate(RotationRange::Uniform(-10.0, 10.0))),
            ),
            Self::AddPerChannel { low: -15, high: 15 },
        ])
    }

    /// Draws the transforms for one sample.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Vec<Transform> {
        let mut transforms = Vec::new();
        self.sample_into(rng, &mut transforms);
        transforms
    }

    fn sample_into<R: Rng + ?Sized>(&self, rng: &mut R, out: &mut Vec<Transform>) {
        match self {
            Self::Fliplr(p) => {
                if rng.random_bool(*p) {
                    out.push(Transform::FlipHorizontal);
                }
            }
            Self::Flipud(p) => {
                if rng.random_bool(*p) {
                    out.push(Transform::FlipVertical);
                }
            }
            Self::OneOf(children) => {
                if !children.is_empty() {
                    let index = rng.random_range(0..children.len());
                    children[index].sample_into(rng, out);
                }
            }
            Self::Sometimes(p, child) => {
                if rng.random_bool(*p) {
                    child.sample_into(rng, out);
                }
            }
            Self::Rotate(RotationRange::Fixed(angle)) => out.push(Transform::Rotate(*angle)),
            Self::Rotate(RotationRange::Uniform(low, high)) => {
                out.push(Transform::Rotate(rng.random_range(*low..=*high)));
            }
            Self::AddPerChannel { low, high } => {
                let mut shift = || rng.random_range(*low..=*high);
                out.push(Transform::AddChannels([shift(), shift(), shift()]));
            }
            Self::Sequential(children) => {
                for child in children {
                    child.sample_into(rng, out);
                }
            }
        }
    }

    /// Samples once and applies the result to `image` and `masks`.
    pub fn apply<R: Rng + ?Sized>(
        &self,
        image: RgbImage,
        masks: Vec<GrayImage>,
        rng: &mut R,
    ) -> (RgbImage, Vec<GrayImage>) {
        apply_transforms(&self.sample(rng), image, masks)
    }
}

/// Applies `transforms` in order.
pub fn apply_transforms(
    transforms: &[Transform],
    mut image: RgbImage,
    mut masks: Vec<GrayImage>,
) -> (RgbImage, Vec<GrayImage>) {
    for transform in transforms {
        match *transform {
            Transform::FlipHorizontal => {
                imageops::flip_horizontal_in_place(&mut image);
                masks.iter_mut().for_each(imageops::flip_horizontal_in_place);
            }
            Transform::FlipVertical => {
                imageops::flip_vertical_in_place(&mut image);
                masks.iter_mut().for_each(imageops::flip_vertical_in_place);
            }
            Transform::Rotate(angle) => {
                image = rotate_rgb(&image, angle);
                masks = masks.iter().map(|mask| rotate_mask(mask, angle)).collect();
            }
            Transform::AddChannels(shift) => {
                for pixel in image.pixels_mut() {
                    for (channel, delta) in pixel.0.iter_mut().zip(shift) {
                        *channel = (i16::from(*channel) + delta).clamp(0, 255) as u8;
                    }
                }
            }
        }
    }
    (image, masks)
}

/// Quarter turns for right angles on square images, otherwise `None`.
fn quarter_turns(angle: f32, width: u32, height: u32) -> Option<u32> {
    let turns = angle / 90.0;
    let rounded = turns.round();
    ((turns - rounded).abs() < 1e-4 && (width == height || rounded as i64 % 2 == 0))
        .then(|| rounded.rem_euclid(4.0) as u32)
}

fn rotate_rgb(image: &RgbImage, angle: f32) -> RgbImage {
    match quarter_turns(angle, image.width(), image.height()) {
        Some(0) => image.clone(),
        Some(1) => imageops::rotate90(image),
        Some(2) => imageops::rotate180(image),
        Some(_) => imageops::rotate270(image),
        None => rotate_about_center(
            image,
            angle.to_radians(),
            Interpolation::Bilinear,
            Rgb([0, 0, 0]),
        ),
    }
}

fn rotate_mask(mask: &GrayImage, angle: f32) -> GrayImage {
    match quarter_turns(angle, mask.width(), mask.height()) {
        Some(0) => mask.clone(),
        Some(1) => imageops::rotate90(mask),
        Some(2) => imageops::rotate180(mask),
        Some(_) => imageops::rotate270(mask),
        None => rotate_about_center(mask, angle.to_radians(), Interpolation::Nearest, Luma([0])),
    }
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, SeedableRng};

    use super::*;

    /// A bright square at `(x0..x0 + 3, y0..y0 + 3)` and its mask.
    fn marked(size: u32, x0: u32, y0: u32) -> (RgbImage, GrayImage) {
        let inside = |x: u32, y: u32| (x0..x0 + 3).contains(&x) && (y0..y0 + 3).contains(&y);
        let image = RgbImage::from_fn(size, size, |x, y| {
            if inside(x, y) {
                Rgb([200, 200, 200])
            } else {
                Rgb([0, 0, 0])
            }
        });
        let mask = GrayImage::from_fn(size, size, |x, y| Luma([if inside(x, y) { 255 } else { 0 }]));
        (image, mask)
    }

    fn aligned(image: &RgbImage, mask: &GrayImage) -> bool {
        mask.enumerate_pixels()
            .all(|(x, y, m)| (m[0] > 0) == (image.get_pixel(x, y)[0] > 100))
    }

    #[test]
    fn crypts_pipeline_has_five_steps_in_order() {
        let Augmentation::Sequential(steps) = Augmentation::crypts() else {
            panic!("expected a sequence");
        };
        assert_eq!(steps.len(), 5);
        assert_eq!(steps[0], Augmentation::Fliplr(0.5));
        assert_eq!(steps[1], Augmentation::Flipud(0.5));
        assert!(matches!(&steps[2], Augmentation::OneOf(children) if children.len() == 4));
        assert!(matches!(&steps[3], Augmentation::Sometimes(p, _) if *p == 0.5));
        assert_eq!(steps[4], Augmentation::AddPerChannel { low: -15, high: 15 });
    }

    #[test]
    fn sampling_is_reproducible_and_bounded() {
        let pipeline = Augmentation::crypts();
        let a = pipeline.sample(&mut StdRng::seed_from_u64(7));
        let b = pipeline.sample(&mut StdRng::seed_from_u64(7));
        assert_eq!(a, b);

        let mut rng = StdRng::seed_from_u64(11);
        for _ in 0..200 {
            let transforms = pipeline.sample(&mut rng);
            // the right-angle rotation and the color shift are always drawn
            assert!(transforms
                .iter()
                .any(|t| matches!(t, Transform::Rotate(a) if a % 90.0 == 0.0)));
            for transform in transforms {
                match transform {
                    Transform::AddChannels(shift) => {
                        assert!(shift.iter().all(|s| (-15..=15).contains(s)));
                    }
                    Transform::Rotate(angle) if angle % 90.0 != 0.0 => {
                        assert!((-10.0..=10.0).contains(&angle));
                    }
                    _ => {}
                }
            }
        }
    }

    #[test]
    fn geometric_transforms_keep_masks_aligned() {
        let (image, mask) = marked(16, 2, 5);
        let transforms = [
            Transform::FlipHorizontal,
            Transform::Rotate(90.0),
            Transform::FlipVertical,
            Transform::Rotate(270.0),
            Transform::Rotate(180.0),
        ];
        let (image, masks) = apply_transforms(&transforms, image, vec![mask.clone()]);

        assert_eq!(image.dimensions(), (16, 16));
        assert_ne!(masks[0], mask);
        assert!(aligned(&image, &masks[0]));
    }

    #[test]
    fn color_shift_leaves_masks_alone() {
        let (image, mask) = marked(8, 0, 0);
        let (shifted, masks) = apply_transforms(
            &[Transform::AddChannels([-15, 0, 15])],
            image,
            vec![mask.clone()],
        );
        assert_eq!(masks[0], mask);
        assert_eq!(shifted.get_pixel(0, 0).0, [185, 200, 215]);
        assert_eq!(shifted.get_pixel(7, 7).0, [0, 0, 15]);
    }

    #[test]
    fn small_rotation_keeps_the_image_size() {
        let (image, mask) = marked(32, 14, 14);
        let (rotated, masks) = apply_transforms(&[Transform::Rotate(7.5)], image, vec![mask]);
        assert_eq!(rotated.dimensions(), (32, 32));
        assert_eq!(masks[0].dimensions(), (32, 32));
        assert!(masks[0].pixels().any(|p| p[0] == 255));
    }
}
