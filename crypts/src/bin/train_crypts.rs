//! Fine-tunes Mask R-CNN on the crypts dataset.
//!
//! Starting from COCO weights with the class-specific heads replaced, all
//! layers train at the configured learning rate until epoch 30, at a tenth
//! of it until epoch 50 and at a thirtieth until epoch 75. Checkpoints and
//! `final.mpk` land in `<root>/logs/crypt<YYYYmmddTHHMM>/`.
//!
//! Set `RUST_LOG` to change the log level (default `info`).

use std::path::PathBuf;

use anyhow::{ensure, Context, Result};
use burn::config::Config;
use clap::Parser;
use crypts::{create_device, get_backend_name, prepare_split, CryptsLayout, TrainingBackend};
use mrcnn::{run_schedule, Augmentation, MaskRcnnConfig, MaskRcnnTrainer, Mode, TrainingSchedule};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Directory holding `dataset/new_crypts` and the COCO weights
    #[arg(long, default_value = ".")]
    root: PathBuf,

    /// JSON configuration replacing the built-in defaults
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Pretrained weights (default: `<root>/mask_rcnn_coco.mpk`)
    #[arg(long)]
    weights: Option<PathBuf>,

    /// Data loader worker threads (0 loads samples on the training thread)
    #[arg(long, default_value_t = 0)]
    workers: usize,
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let layout = CryptsLayout::new(&args.root);

    let config = match &args.config {
        Some(path) => MaskRcnnConfig::load(path)
            .with_context(|| format!("Failed to load config file: {}", path.display()))?,
        None => MaskRcnnConfig::new(),
    };
    config.validate().context("Invalid configuration")?;

    let weights = args.weights.unwrap_or_else(|| layout.coco_weights());
    ensure!(
        weights.is_file(),
        "Pretrained weights not found: {}",
        weights.display()
    );

    let train_set = prepare_split(&layout.train_dir())?;
    let val_set = prepare_split(&layout.valid_dir())?;
    ensure!(!train_set.is_empty(), "No training images under {}", layout.train_dir().display());

    config.display();
    tracing::info!(backend = get_backend_name(), "selected backend");

    let device = create_device();
    let schedule = TrainingSchedule::crypts(config.learning_rate);
    let mut trainer =
        MaskRcnnTrainer::<TrainingBackend>::new(Mode::Training, config, layout.model_dir(), &device)
            .context("Failed to create the model")?
            .with_num_workers(args.workers);

    let report = run_schedule(
        &mut trainer,
        &train_set,
        &val_set,
        &weights,
        &schedule,
        Some(&Augmentation::crypts()),
    )
    .context("Training failed")?;

    println!(
        "Finished in {:.2} hours, final weights at {}",
        report.elapsed_hours(),
        report.final_weights.display()
    );
    Ok(())
}
