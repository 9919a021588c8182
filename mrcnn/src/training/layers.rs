use burn::{optim::GradientsParams, tensor::backend::AutodiffBackend};
use resnet::ResNetStage;

use crate::model::MaskRcnn;

/// What the wrapper is built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Training,
    Inference,
}

impl Mode {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Training => "training",
            Self::Inference => "inference",
        }
    }
}

/// Layers updated by a training call. The FPN, RPN and the heads are
/// always trained; the selector decides how much of the backbone joins them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrainableLayers {
    /// Backbone frozen.
    Heads,
    /// ResNet stage 3 and up.
    Stage3Up,
    /// ResNet stage 4 and up.
    Stage4Up,
    /// ResNet stage 5 only.
    Stage5Up,
    #[default]
    All,
}

impl TrainableLayers {
    /// Backbone stages that receive no update.
    pub const fn frozen_stages(&self) -> &'static [ResNetStage] {
        use ResNetStage::*;
        match self {
            Self::Heads => &[Stem, Res2, Res3, Res4, Res5],
            Self::Stage3Up => &[Stem, Res2],
            Self::Stage4Up => &[Stem, Res2, Res3],
            Self::Stage5Up => &[Stem, Res2, Res3, Res4],
            Self::All => &[],
        }
    }

    pub fn trains(&self, stage: ResNetStage) -> bool {
        !self.frozen_stages().contains(&stage)
    }
}

/// Removes the gradients of frozen backbone stages so the optimizer leaves
/// them untouched.
pub(crate) fn discard_frozen<B: AutodiffBackend>(
    grads: &mut B::Gradients,
    model: &MaskRcnn<B>,
    layers: TrainableLayers,
) {
    let backbone = &model.backbone;
    for stage in layers.frozen_stages() {
        let _ = match stage {
            ResNetStage::Stem => GradientsParams::from_module(grads, &backbone.stem),
            ResNetStage::Res2 => GradientsParams::from_module(grads, &backbone.res2),
            ResNetStage::Res3 => GradientsParams::from_module(grads, &backbone.res3),
            ResNetStage::Res4 => GradientsParams::from_module(grads, &backbone.res4),
            ResNetStage::Res5 => GradientsParams::from_module(grads, &backbone.res5),
        };
    }
}
