//! Box geometry and pyramid pooling shared by the Mask R-CNN heads and
//! target builders.

pub mod anchors;
pub mod boxes;
pub mod nms;
pub mod roi;

pub use anchors::{backbone_shapes, generate_anchors, generate_pyramid_anchors};
pub use boxes::{compute_overlaps, denormalize_deltas, normalize_deltas, BBox};
pub use nms::{non_max_suppression, top_k};
pub use roi::{crop_and_resize, pyramid_roi_pool, roi_level, Roi};
