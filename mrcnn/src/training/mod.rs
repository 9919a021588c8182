//! Training wrapper around [`MaskRcnn`].
//!
//! [`MaskRcnnTrainer`] owns the model, the run directory and the epoch
//! counter. `train` is called with a cumulative epoch target, so successive
//! calls continue where the previous one stopped.

mod layers;
mod step;

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Instant,
};

use burn::{
    data::dataloader::{DataLoader, DataLoaderBuilder},
    grad_clipping::GradientClippingConfig,
    module::AutodiffModule,
    optim::{
        decay::WeightDecayConfig, momentum::MomentumConfig, GradientsParams, Optimizer, SgdConfig,
    },
    prelude::*,
    tensor::backend::AutodiffBackend,
};
use image::RgbImage;
use rand::{rngs::StdRng, SeedableRng};

pub use layers::{Mode, TrainableLayers};
pub use step::{compute_losses, AnchorCache};

use crate::{
    augmentation::Augmentation,
    config::MaskRcnnConfig,
    dataset::PreparedDataset,
    detection::{detect, Detection},
    error::{MrcnnError, MrcnnResult},
    loader::{FailureBudget, MrcnnBatch, MrcnnBatcher, SampleDataset},
    losses::LossValues,
    model::MaskRcnn,
    weights::{self, checkpoint_epoch, checkpoint_file_name, HeadLayer},
};

/// A Mask R-CNN model with its run directory and epoch counter.
pub struct MaskRcnnTrainer<B: AutodiffBackend> {
    mode: Mode,
    config: Arc<MaskRcnnConfig>,
    model: MaskRcnn<B>,
    model_dir: PathBuf,
    log_dir: PathBuf,
    epoch: usize,
    num_workers: usize,
    device: B::Device,
}

impl<B: AutodiffBackend> MaskRcnnTrainer<B> {
    /// Builds a freshly initialised model and creates the run directory
    /// `<model_dir>/<name><YYYYmmddTHHMM>`.
    ///
    /// # Errors
    ///
    /// [`MrcnnError::InvalidConfiguration`] if `config` does not validate,
    /// [`MrcnnError::Io`] if the run directory cannot be created.
    pub fn new(
        mode: Mode,
        config: MaskRcnnConfig,
        model_dir: impl AsRef<Path>,
        device: &B::Device,
    ) -> MrcnnResult<Self> {
        config.validate()?;
        B::seed(config.seed);

        let model_dir = model_dir.as_ref().to_path_buf();
        let started = chrono::Local::now().format("%Y%m%dT%H%M");
        let log_dir = model_dir.join(format!("{}{started}", config.name.to_lowercase()));
        if mode == Mode::Training {
            std::fs::create_dir_all(&log_dir).map_err(|source| MrcnnError::Io {
                path: log_dir.clone(),
                source,
            })?;
        }

        tracing::info!(
            mode = mode.name(),
            backbone = ?config.backbone,
            log_dir = %log_dir.display(),
            "created Mask R-CNN"
        );

        Ok(Self {
            mode,
            model: config.init_model(device),
            config: Arc::new(config),
            model_dir,
            log_dir,
            epoch: 0,
            num_workers: 0,
            device: device.clone(),
        })
    }

    /// Data loader threads used by `train`. With zero, the default, samples
    /// load on the training thread.
    #[must_use]
    pub fn with_num_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers;
        self
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn config(&self) -> &MaskRcnnConfig {
        &self.config
    }

    pub fn model(&self) -> &MaskRcnn<B> {
        &self.model
    }

    /// Directory checkpoints of this run are written to.
    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    /// Last completed epoch.
    pub fn epoch(&self) -> usize {
        self.epoch
    }

    /// Loads weights, keeping the fresh values of the `exclude` layers.
    ///
    /// Loading a checkpoint written by this wrapper resumes its epoch
    /// counter and run directory.
    pub fn load_weights(&mut self, path: &Path, exclude: &[HeadLayer]) -> MrcnnResult<()> {
        self.model = weights::load_weights(self.model.clone(), path, exclude, &self.device)?;

        if let Some(epoch) = checkpoint_epoch(path) {
            self.epoch = epoch;
            if let Some(run_dir) = path.parent().filter(|dir| dir.is_dir()) {
                self.log_dir = run_dir.to_path_buf();
            }
            tracing::info!(epoch, log_dir = %self.log_dir.display(), "resuming from checkpoint");
        }
        Ok(())
    }

    pub fn save_weights(&self, path: &Path) -> MrcnnResult<()> {
        weights::save_weights(&self.model, path)?;
        tracing::info!(path = %path.display(), "saved weights");
        Ok(())
    }

    /// Last checkpoint of the newest run with this configuration's name.
    pub fn find_last(&self) -> MrcnnResult<PathBuf> {
        weights::find_last(&self.model_dir, &self.config.name)
    }

    /// Trains until `epochs` epochs are complete in total.
    ///
    /// Each epoch runs `steps_per_epoch` training batches, drawn cyclically
    /// from a shuffled loader, and `validation_steps` validation batches,
    /// then writes `mask_rcnn_<name>_<epoch:04>.mpk` to the log directory.
    /// `augmentation` applies to the training samples only.
    ///
    /// # Errors
    ///
    /// [`MrcnnError::WrongMode`] in inference mode, dataset and checkpoint
    /// errors otherwise. Samples that fail to load are logged and skipped
    /// until more than [`MAX_SAMPLE_FAILURES`](crate::loader::MAX_SAMPLE_FAILURES)
    /// have failed ([`MrcnnError::SampleLoadFailed`]). An epoch without a
    /// single update fails with [`MrcnnError::NoTrainingSteps`].
    pub fn train(
        &mut self,
        train_set: &PreparedDataset,
        val_set: &PreparedDataset,
        learning_rate: f64,
        epochs: usize,
        augmentation: Option<&Augmentation>,
        layers: TrainableLayers,
    ) -> MrcnnResult<()> {
        if self.mode != Mode::Training {
            return Err(MrcnnError::WrongMode {
                operation: "train",
                expected: Mode::Training.name(),
            });
        }
        if train_set.is_empty() {
            return Err(MrcnnError::EmptyDataset { split: "training" });
        }
        if epochs <= self.epoch {
            tracing::info!(epoch = self.epoch, target = epochs, "epoch target already reached");
            return Ok(());
        }

        let config = Arc::clone(&self.config);
        let train_loader = self.loader::<B>(train_set, augmentation.cloned());
        let val_loader = (!val_set.is_empty()).then(|| self.loader::<B::InnerBackend>(val_set, None));

        let mut optimizer = self.optimizer_config().init::<B, MaskRcnn<B>>();
        let mut anchors = AnchorCache::default();
        let mut rng = StdRng::seed_from_u64(epoch_seed(config.seed, self.epoch));
        let mut budget = FailureBudget::default();
        let steps = config.steps_per_epoch();

        tracing::info!(
            from_epoch = self.epoch,
            to_epoch = epochs,
            learning_rate,
            ?layers,
            steps,
            checkpoint_dir = %self.log_dir.display(),
            "starting training"
        );
        std::fs::create_dir_all(&self.log_dir).map_err(|source| MrcnnError::Io {
            path: self.log_dir.clone(),
            source,
        })?;

        let mut train_iter = train_loader.iter();
        for epoch in self.epoch + 1..=epochs {
            let started = Instant::now();
            let mut totals = LossValues::default();
            let mut counted = 0;

            for _ in 0..steps {
                let batch = match train_iter.next() {
                    Some(batch) => batch,
                    None => {
                        train_iter = train_loader.iter();
                        match train_iter.next() {
                            Some(batch) => batch,
                            None => break,
                        }
                    }
                };
                budget.record(&batch.failures)?;

                let Some(losses) =
                    compute_losses(&self.model, &batch, &mut anchors, &config, &mut rng)?
                else {
                    continue;
                };
                let values = losses.values(&config.loss_weights);

                let mut grads = losses.total(&config.loss_weights).backward();
                layers::discard_frozen(&mut grads, &self.model, layers);
                let grads = GradientsParams::from_grads(grads, &self.model);
                self.model = optimizer.step(learning_rate, self.model.clone(), grads);

                totals += values;
                counted += 1;
            }
            if counted == 0 {
                return Err(MrcnnError::NoTrainingSteps { epoch });
            }
            let train_losses = totals.mean(counted);

            let val_losses = match &val_loader {
                Some(loader) => Some(self.validate(
                    loader.as_ref(),
                    &mut anchors,
                    &mut rng,
                    &mut budget,
                )?),
                None => None,
            };

            self.epoch = epoch;
            let checkpoint = self
                .log_dir
                .join(checkpoint_file_name(&config.name, epoch));
            weights::save_weights(&self.model, &checkpoint)?;

            tracing::info!(
                epoch,
                of = epochs,
                loss = train_losses.loss,
                rpn_class_loss = train_losses.rpn_class,
                rpn_bbox_loss = train_losses.rpn_bbox,
                mrcnn_class_loss = train_losses.mrcnn_class,
                mrcnn_bbox_loss = train_losses.mrcnn_bbox,
                mrcnn_mask_loss = train_losses.mrcnn_mask,
                val_loss = val_losses.map(|v| v.loss),
                steps = counted,
                elapsed_secs = started.elapsed().as_secs_f32(),
                checkpoint = %checkpoint.display(),
                "epoch complete"
            );
        }
        Ok(())
    }

    /// Runs detection on `images` in their own coordinates.
    ///
    /// # Errors
    ///
    /// [`MrcnnError::WrongMode`] unless built in inference mode.
    pub fn detect(&self, images: &[RgbImage]) -> MrcnnResult<Vec<Vec<Detection>>> {
        if self.mode != Mode::Inference {
            return Err(MrcnnError::WrongMode {
                operation: "detect",
                expected: Mode::Inference.name(),
            });
        }
        detect(&self.model.valid(), images, &self.config, &self.device)
    }

    fn loader<L: Backend<Device = B::Device>>(
        &self,
        dataset: &PreparedDataset,
        augmentation: Option<Augmentation>,
    ) -> Arc<dyn DataLoader<L, MrcnnBatch<L>>> {
        let seed = epoch_seed(self.config.seed, self.epoch);
        let samples = SampleDataset::new(
            Arc::new(dataset.clone()),
            Arc::clone(&self.config),
            augmentation,
        )
        .with_seed(seed);

        let builder = DataLoaderBuilder::new(MrcnnBatcher::<L>::new())
            .batch_size(self.config.batch_size())
            .shuffle(seed)
            .set_device(self.device.clone());
        // zero workers loads on the calling thread
        if self.num_workers > 0 {
            builder.num_workers(self.num_workers).build(samples)
        } else {
            builder.build(samples)
        }
    }

    fn optimizer_config(&self) -> SgdConfig {
        let config = &self.config;
        SgdConfig::new()
            .with_momentum(Some(
                MomentumConfig::new()
                    .with_momentum(config.learning_momentum)
                    .with_dampening(0.0),
            ))
            .with_weight_decay(Some(WeightDecayConfig::new(config.weight_decay as f32)))
            .with_gradient_clipping(Some(GradientClippingConfig::Norm(config.gradient_clip_norm)))
    }

    /// Mean losses over `validation_steps` batches of the inference model.
    fn validate(
        &self,
        loader: &dyn DataLoader<B::InnerBackend, MrcnnBatch<B::InnerBackend>>,
        anchors: &mut AnchorCache,
        rng: &mut StdRng,
        budget: &mut FailureBudget,
    ) -> MrcnnResult<LossValues> {
        let model = self.model.valid();
        let mut totals = LossValues::default();
        let mut counted = 0;

        let mut iter = loader.iter();
        for _ in 0..self.config.validation_steps {
            let batch = match iter.next() {
                Some(batch) => batch,
                None => {
                    iter = loader.iter();
                    match iter.next() {
                        Some(batch) => batch,
                        None => break,
                    }
                }
            };
            budget.record(&batch.failures)?;
            if let Some(losses) = compute_losses(&model, &batch, anchors, &self.config, rng)? {
                totals += losses.values(&self.config.loss_weights);
                counted += 1;
            }
        }
        Ok(totals.mean(counted))
    }
}

/// Seed of a training call that starts after `epoch`, kept apart from the
/// per-draw offsets added to it.
fn epoch_seed(seed: u64, epoch: usize) -> u64 {
    seed ^ ((epoch as u64) << 32)
}
