//! Axis-aligned boxes in pixel coordinates and the delta encoding used by
//! the region proposal network and the box regression head.

/// A box as `(y1, x1, y2, x2)` with `y2`/`x2` exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct BBox {
    pub y1: f32,
    pub x1: f32,
    pub y2: f32,
    pub x2: f32,
}

impl BBox {
    pub const fn new(y1: f32, x1: f32, y2: f32, x2: f32) -> Self {
        Self { y1, x1, y2, x2 }
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }

    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn area(&self) -> f32 {
        self.height().max(0.0) * self.width().max(0.0)
    }

    pub fn center(&self) -> (f32, f32) {
        (self.y1 + 0.5 * self.height(), self.x1 + 0.5 * self.width())
    }

    pub fn is_empty(&self) -> bool {
        self.height() <= 0.0 || self.width() <= 0.0
    }

    pub fn iou(&self, other: &Self) -> f32 {
        let y1 = self.y1.max(other.y1);
        let x1 = self.x1.max(other.x1);
        let y2 = self.y2.min(other.y2);
        let x2 = self.x2.min(other.x2);
        let intersection = (y2 - y1).max(0.0) * (x2 - x1).max(0.0);
        let union = self.area() + other.area() - intersection;
        if union <= 0.0 {
            0.0
        } else {
            intersection / union
        }
    }

    /// Clamps the box into `window`.
    pub fn clip(&self, window: &Self) -> Self {
        Self {
            y1: self.y1.clamp(window.y1, window.y2),
            x1: self.x1.clamp(window.x1, window.x2),
            y2: self.y2.clamp(window.y1, window.y2),
            x2: self.x2.clamp(window.x1, window.x2),
        }
    }

    /// Deltas `(dy, dx, log(dh), log(dw))` that turn `self` into `target`.
    pub fn refinement_to(&self, target: &Self) -> [f32; 4] {
        let (cy, cx) = self.center();
        let (gy, gx) = target.center();
        let (h, w) = (self.height(), self.width());

        [
            (gy - cy) / h,
            (gx - cx) / w,
            (target.height() / h).ln(),
            (target.width() / w).ln(),
        ]
    }

    /// Inverse of [`BBox::refinement_to`].
    pub fn apply_deltas(&self, deltas: [f32; 4]) -> Self {
        let (cy, cx) = self.center();
        let cy = cy + deltas[0] * self.height();
        let cx = cx + deltas[1] * self.width();
        let h = self.height() * deltas[2].exp();
        let w = self.width() * deltas[3].exp();

        Self {
            y1: cy - 0.5 * h,
            x1: cx - 0.5 * w,
            y2: cy + 0.5 * h,
            x2: cx + 0.5 * w,
        }
    }

    pub fn to_array(&self) -> [f32; 4] {
        [self.y1, self.x1, self.y2, self.x2]
    }
}

/// Divides each delta component by its standard deviation.
pub fn normalize_deltas(deltas: [f32; 4], std_dev: [f32; 4]) -> [f32; 4] {
    [
        deltas[0] / std_dev[0],
        deltas[1] / std_dev[1],
        deltas[2] / std_dev[2],
        deltas[3] / std_dev[3],
    ]
}

pub fn denormalize_deltas(deltas: [f32; 4], std_dev: [f32; 4]) -> [f32; 4] {
    [
        deltas[0] * std_dev[0],
        deltas[1] * std_dev[1],
        deltas[2] * std_dev[2],
        deltas[3] * std_dev[3],
    ]
}

/// IoU matrix, row-major `[boxes1.len(), boxes2.len()]`.
pub fn compute_overlaps(boxes1: &[BBox], boxes2: &[BBox]) -> Vec<f32> {
    let mut overlaps = Vec::with_capacity(boxes1.len() * boxes2.len());
    for a in boxes1 {
        overlaps.extend(boxes2.iter().map(|b| a.iou(b)));
    }
    overlaps
}
