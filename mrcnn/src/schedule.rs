//! Staged fine-tuning from pretrained weights.
//!
//! [`run_schedule`] loads the pretrained weights with the class-specific
//! head layers excluded, runs every stage in order and persists the final
//! weights next to the per-epoch checkpoints. Any error aborts the run.

use std::{
    fmt,
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use burn::tensor::backend::AutodiffBackend;

use crate::{
    augmentation::Augmentation,
    dataset::PreparedDataset,
    error::MrcnnResult,
    training::{MaskRcnnTrainer, TrainableLayers},
    weights::HeadLayer,
};

/// File name of the weights written after the last stage.
pub const FINAL_WEIGHTS: &str = "final.mpk";

/// The operations the driver needs from a model wrapper.
pub trait TrainingTarget {
    fn load_weights(&mut self, path: &Path, exclude: &[HeadLayer]) -> MrcnnResult<()>;

    /// Trains until `epochs` epochs are complete in total.
    fn train(
        &mut self,
        train_set: &PreparedDataset,
        val_set: &PreparedDataset,
        learning_rate: f64,
        epochs: usize,
        augmentation: Option<&Augmentation>,
        layers: TrainableLayers,
    ) -> MrcnnResult<()>;

    fn log_dir(&self) -> &Path;

    fn save_weights(&self, path: &Path) -> MrcnnResult<()>;
}

impl<B: AutodiffBackend> TrainingTarget for MaskRcnnTrainer<B> {
    fn load_weights(&mut self, path: &Path, exclude: &[HeadLayer]) -> MrcnnResult<()> {
        MaskRcnnTrainer::load_weights(self, path, exclude)
    }

    fn train(
        &mut self,
        train_set: &PreparedDataset,
        val_set: &PreparedDataset,
        learning_rate: f64,
        epochs: usize,
        augmentation: Option<&Augmentation>,
        layers: TrainableLayers,
    ) -> MrcnnResult<()> {
        MaskRcnnTrainer::train(
            self,
            train_set,
            val_set,
            learning_rate,
            epochs,
            augmentation,
            layers,
        )
    }

    fn log_dir(&self) -> &Path {
        MaskRcnnTrainer::log_dir(self)
    }

    fn save_weights(&self, path: &Path) -> MrcnnResult<()> {
        MaskRcnnTrainer::save_weights(self, path)
    }
}

/// One training call: train until `epochs` at `learning_rate`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrainingStage {
    pub learning_rate: f64,
    /// Cumulative epoch target.
    pub epochs: usize,
    pub layers: TrainableLayers,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrainingSchedule {
    stages: Vec<TrainingStage>,
}

impl TrainingSchedule {
    pub fn new(stages: Vec<TrainingStage>) -> Self {
        Self { stages }
    }

    /// All layers at `learning_rate` until epoch 30, a tenth of it until 50,
    /// a thirtieth until 75.
    pub fn crypts(learning_rate: f64) -> Self {
        Self::new(
            [(1.0, 30), (10.0, 50), (30.0, 75)]
                .into_iter()
                .map(|(divisor, epochs)| TrainingStage {
                    learning_rate: learning_rate / divisor,
                    epochs,
                    layers: TrainableLayers::All,
                })
                .collect(),
        )
    }

    pub fn stages(&self) -> &[TrainingStage] {
        &self.stages
    }
}

/// Progress of a schedule run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleState {
    Start,
    WeightsLoaded,
    /// The given 1-based stage has completed.
    StageDone(usize),
    Persisted,
}

impl fmt::Display for ScheduleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Start => f.write_str("Start"),
            Self::WeightsLoaded => f.write_str("WeightsLoaded"),
            Self::StageDone(stage) => write!(f, "Stage{stage}Done"),
            Self::Persisted => f.write_str("Persisted"),
        }
    }
}

/// Outcome of a completed schedule.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleReport {
    pub final_weights: PathBuf,
    /// Time spent from the first stage until the final weights were saved.
    pub elapsed: Duration,
    pub state: ScheduleState,
}

impl ScheduleReport {
    pub fn elapsed_hours(&self) -> f64 {
        self.elapsed.as_secs_f64() / 3600.0
    }
}

/// Loads `weights` without the COCO head layers, runs every stage of
/// `schedule` and writes `<log_dir>/final.mpk`.
///
/// # Errors
///
/// The first error of any step, after which nothing else runs.
pub fn run_schedule<T: TrainingTarget>(
    target: &mut T,
    train_set: &PreparedDataset,
    val_set: &PreparedDataset,
    weights: &Path,
    schedule: &TrainingSchedule,
    augmentation: Option<&Augmentation>,
) -> MrcnnResult<ScheduleReport> {
    let mut state = ScheduleState::Start;

    tracing::info!(
        train_images = train_set.len(),
        val_images = val_set.len(),
        weights = %weights.display(),
        "starting schedule"
    );
    target.load_weights(weights, &HeadLayer::COCO_EXCLUSIONS)?;
    advance(&mut state, ScheduleState::WeightsLoaded);
    let started = Instant::now();

    for (index, stage) in schedule.stages().iter().enumerate() {
        tracing::info!(
            stage = index + 1,
            learning_rate = stage.learning_rate,
            epochs = stage.epochs,
            layers = ?stage.layers,
            "training stage"
        );
        target.train(
            train_set,
            val_set,
            stage.learning_rate,
            stage.epochs,
            augmentation,
            stage.layers,
        )?;
        advance(&mut state, ScheduleState::StageDone(index + 1));
    }

    let final_weights = target.log_dir().join(FINAL_WEIGHTS);
    target.save_weights(&final_weights)?;
    advance(&mut state, ScheduleState::Persisted);

    let report = ScheduleReport {
        final_weights,
        elapsed: started.elapsed(),
        state,
    };
    tracing::info!(
        elapsed_hours = report.elapsed_hours(),
        final_weights = %report.final_weights.display(),
        "schedule complete"
    );
    Ok(report)
}

fn advance(state: &mut ScheduleState, next: ScheduleState) {
    tracing::debug!(from = %state, to = %next, "schedule state");
    *state = next;
}
