mod fpn;
mod heads;
mod mask_rcnn;
mod rpn;

pub use fpn::*;
pub use heads::*;
pub use mask_rcnn::*;
pub use rpn::*;
