//! Mask R-CNN instance segmentation on Burn, with the dataset adapter,
//! augmentation and staged training driver for the crypts dataset.

pub mod augmentation;
pub mod config;
pub mod dataset;
pub mod detection;
pub mod error;
pub mod image_ops;
pub mod loader;
pub mod losses;
pub mod model;
pub mod schedule;
pub mod targets;
pub mod training;
pub mod weights;


pub use augmentation::{Augmentation, RotationRange, Transform};
pub use config::{ImageResizeMode, LossWeights, MaskRcnnConfig};
pub use dataset::{list_image_ids, ClassInfo, CryptsDataset, InstanceMasks, PreparedDataset};
pub use detection::Detection;
pub use error::{MrcnnError, MrcnnResult};
pub use model::{MaskRcnn, MaskRcnnRecord};
pub use schedule::{run_schedule, ScheduleReport, ScheduleState, TrainingSchedule, TrainingStage, TrainingTarget};
pub use training::{MaskRcnnTrainer, Mode, TrainableLayers};
pub use weights::HeadLayer;

pub use mrcnn_ops::BBox;
pub use resnet::ResNetDepth;
