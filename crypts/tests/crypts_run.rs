use std::{cell::RefCell, path::Path};

use crypts::{prepare_split, CryptsLayout};
use image::{GrayImage, Luma, Rgb, RgbImage};
use mrcnn::{
    run_schedule, Augmentation, HeadLayer, MrcnnResult, PreparedDataset, ScheduleState,
    TrainableLayers, TrainingSchedule, TrainingTarget,
};

fn write_split(base: &Path, ids: &[&str]) {
    std::fs::create_dir_all(base.join("Images")).unwrap();
    for id in ids {
        RgbImage::from_pixel(32, 32, Rgb([200, 150, 180]))
            .save(base.join("Images").join(id))
            .unwrap();
        let stem = Path::new(id).file_stem().unwrap().to_string_lossy().into_owned();
        let masks = base.join("Masks").join(stem);
        std::fs::create_dir_all(&masks).unwrap();
        GrayImage::from_fn(32, 32, |x, y| Luma([if x < 10 && y < 10 { 255 } else { 0 }]))
            .save(masks.join("0.png"))
            .unwrap();
    }
}

#[derive(Default)]
struct Recorder {
    loaded: RefCell<Vec<HeadLayer>>,
    stages: RefCell<Vec<(f64, usize, TrainableLayers, usize, usize)>>,
    saved: RefCell<Option<std::path::PathBuf>>,
}

impl TrainingTarget for Recorder {
    fn load_weights(&mut self, _path: &Path, exclude: &[HeadLayer]) -> MrcnnResult<()> {
        self.loaded.borrow_mut().extend_from_slice(exclude);
        Ok(())
    }

    fn train(
        &mut self,
        train_set: &PreparedDataset,
        val_set: &PreparedDataset,
        learning_rate: f64,
        epochs: usize,
        _augmentation: Option<&Augmentation>,
        layers: TrainableLayers,
    ) -> MrcnnResult<()> {
        self.stages.borrow_mut().push((
            learning_rate,
            epochs,
            layers,
            train_set.len(),
            val_set.len(),
        ));
        Ok(())
    }

    fn log_dir(&self) -> &Path {
        Path::new("logs/crypt20260101T0000")
    }

    fn save_weights(&self, path: &Path) -> MrcnnResult<()> {
        *self.saved.borrow_mut() = Some(path.to_path_buf());
        Ok(())
    }
}

#[test]
fn crypts_run_trains_three_stages_on_both_splits() {
    let root = tempfile::tempdir().unwrap();
    let layout = CryptsLayout::new(root.path());
    write_split(&layout.train_dir(), &["a.png", "b.png"]);
    write_split(&layout.valid_dir(), &["c.png"]);

    let train_set = prepare_split(&layout.train_dir()).unwrap();
    let val_set = prepare_split(&layout.valid_dir()).unwrap();
    assert_eq!((train_set.len(), val_set.len()), (2, 1));

    let mut target = Recorder::default();
    let augmentation = Augmentation::crypts();
    let report = run_schedule(
        &mut target,
        &train_set,
        &val_set,
        &layout.coco_weights(),
        &TrainingSchedule::crypts(0.001),
        Some(&augmentation),
    )
    .unwrap();

    assert_eq!(target.loaded.into_inner(), HeadLayer::COCO_EXCLUSIONS.to_vec());
    let epochs: Vec<usize> = target.stages.borrow().iter().map(|s| s.1).collect();
    assert_eq!(epochs, vec![30, 50, 75]);
    for &(_, _, layers, train, val) in target.stages.borrow().iter() {
        assert_eq!(layers, TrainableLayers::All);
        assert_eq!((train, val), (2, 1));
    }
    assert_eq!(report.state, ScheduleState::Persisted);
    assert_eq!(
        target.saved.into_inner(),
        Some(Path::new("logs/crypt20260101T0000/final.mpk").to_path_buf())
    );
}
