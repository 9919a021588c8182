//! Loading and saving model weights.
//!
//! Weights are Burn records addressed by layer name. Layers listed in an
//! exclusion set keep the model's freshly initialised values, which is how
//! COCO weights are reused for a dataset with a different class count.

use std::{
    fmt,
    path::{Path, PathBuf},
};

use burn::{
    module::{Module, ModuleVisitor, ParamId},
    record::{FullPrecisionSettings, NamedMpkFileRecorder, Recorder},
    tensor::{backend::Backend, Tensor},
};

use crate::{
    error::{MrcnnError, MrcnnResult},
    model::{MaskRcnn, MaskRcnnRecord},
};

/// Output layers whose shape depends on the number of classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeadLayer {
    ClassLogits,
    BboxFc,
    /// The per-class reshape of the box regression output. It carries no
    /// parameters, so excluding it changes nothing.
    Bbox,
    Mask,
}

impl HeadLayer {
    /// Layers replaced when starting from COCO weights.
    pub const COCO_EXCLUSIONS: [Self; 4] = [Self::ClassLogits, Self::BboxFc, Self::Bbox, Self::Mask];

    pub const fn name(&self) -> &'static str {
        match self {
            Self::ClassLogits => "mrcnn_class_logits",
            Self::BboxFc => "mrcnn_bbox_fc",
            Self::Bbox => "mrcnn_bbox",
            Self::Mask => "mrcnn_mask",
        }
    }
}

impl fmt::Display for HeadLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// File format, chosen by extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightFormat {
    /// Burn named MessagePack (`.mpk`), the format checkpoints are written in.
    NamedMpk,
    PyTorch,
    SafeTensors,
}

impl WeightFormat {
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("pt" | "pth") => Self::PyTorch,
            Some("safetensors") => Self::SafeTensors,
            _ => Self::NamedMpk,
        }
    }
}

/// Reads a model record from `path`.
pub fn load_record<B: Backend>(path: &Path, device: &B::Device) -> MrcnnResult<MaskRcnnRecord<B>> {
    if !path.is_file() {
        return Err(MrcnnError::WeightsNotFound {
            path: path.to_path_buf(),
        });
    }
    let failed = |reason: String| MrcnnError::WeightLoadingFailed {
        path: path.to_path_buf(),
        reason,
    };

    match WeightFormat::from_path(path) {
        WeightFormat::NamedMpk => NamedMpkFileRecorder::<FullPrecisionSettings>::new()
            .load(path.to_path_buf(), device)
            .map_err(|e| failed(format!("MessagePack record loading failed: {e}"))),
        #[cfg(feature = "pretrained")]
        WeightFormat::PyTorch => {
            use burn_import::pytorch::{LoadArgs, PyTorchFileRecorder};
            PyTorchFileRecorder::<FullPrecisionSettings>::default()
                .load(LoadArgs::new(path.to_path_buf()), device)
                .map_err(|e| failed(format!("PyTorch record loading failed: {e}")))
        }
        #[cfg(feature = "pretrained")]
        WeightFormat::SafeTensors => {
            use burn_import::safetensors::{LoadArgs, SafetensorsFileRecorder};
            SafetensorsFileRecorder::<FullPrecisionSettings>::default()
                .load(LoadArgs::new(path.to_path_buf()), device)
                .map_err(|e| failed(format!("Safetensors record loading failed: {e}")))
        }
        #[cfg(not(feature = "pretrained"))]
        format => Err(failed(format!(
            "{format:?} weights need the `pretrained` feature"
        ))),
    }
}

/// Loads `path` into `model`, keeping the current values of `exclude`.
///
/// # Errors
///
/// [`MrcnnError::WeightsNotFound`] or [`MrcnnError::WeightLoadingFailed`]
/// when the file cannot be read, [`MrcnnError::ShapeMismatch`] when a
/// layer that is not excluded does not fit the model.
pub fn load_weights<B: Backend>(
    model: MaskRcnn<B>,
    path: &Path,
    exclude: &[HeadLayer],
    device: &B::Device,
) -> MrcnnResult<MaskRcnn<B>> {
    let mut record = load_record::<B>(path, device)?;
    let fresh = model.clone().into_record();
    let excluded = |layer: HeadLayer| exclude.contains(&layer);

    if !excluded(HeadLayer::ClassLogits) {
        check_shape(
            HeadLayer::ClassLogits.name(),
            &fresh.classifier.mrcnn_class_logits.weight.val().dims(),
            &record.classifier.mrcnn_class_logits.weight.val().dims(),
        )?;
    }
    if !excluded(HeadLayer::BboxFc) {
        check_shape(
            HeadLayer::BboxFc.name(),
            &fresh.classifier.mrcnn_bbox_fc.weight.val().dims(),
            &record.classifier.mrcnn_bbox_fc.weight.val().dims(),
        )?;
    }
    if !excluded(HeadLayer::Mask) {
        check_shape(
            HeadLayer::Mask.name(),
            &fresh.mask.mrcnn_mask.weight.val().dims(),
            &record.mask.mrcnn_mask.weight.val().dims(),
        )?;
    }

    if excluded(HeadLayer::ClassLogits) {
        record.classifier.mrcnn_class_logits = fresh.classifier.mrcnn_class_logits;
    }
    if excluded(HeadLayer::BboxFc) {
        record.classifier.mrcnn_bbox_fc = fresh.classifier.mrcnn_bbox_fc;
    }
    if excluded(HeadLayer::Mask) {
        record.mask.mrcnn_mask = fresh.mask.mrcnn_mask;
    }

    let loaded = model.clone().load_record(record);
    check_groups(&model, &loaded)?;

    tracing::info!(
        path = %path.display(),
        excluded = ?exclude.iter().map(HeadLayer::name).collect::<Vec<_>>(),
        "loaded weights"
    );
    Ok(loaded)
}

fn check_shape(layer: &str, expected: &[usize], actual: &[usize]) -> MrcnnResult<()> {
    if expected == actual {
        Ok(())
    } else {
        Err(MrcnnError::ShapeMismatch {
            layer: layer.to_string(),
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        })
    }
}

/// Collects the shape of every float parameter in visiting order.
#[derive(Default)]
struct ParamShapes(Vec<Vec<usize>>);

impl<B: Backend> ModuleVisitor<B> for ParamShapes {
    fn visit_float<const D: usize>(&mut self, _id: ParamId, tensor: &Tensor<B, D>) {
        self.0.push(tensor.dims().to_vec());
    }
}

fn param_shapes<B: Backend, M: Module<B>>(module: &M) -> Vec<Vec<usize>> {
    let mut shapes = ParamShapes::default();
    module.visit(&mut shapes);
    shapes.0
}

/// Compares the shape of every parameter, layer group by layer group.
fn check_groups<B: Backend>(expected: &MaskRcnn<B>, actual: &MaskRcnn<B>) -> MrcnnResult<()> {
    let groups = [
        ("backbone", param_shapes(&expected.backbone), param_shapes(&actual.backbone)),
        ("fpn", param_shapes(&expected.fpn), param_shapes(&actual.fpn)),
        ("rpn", param_shapes(&expected.rpn), param_shapes(&actual.rpn)),
        ("mrcnn_class", param_shapes(&expected.classifier), param_shapes(&actual.classifier)),
        ("mrcnn_mask", param_shapes(&expected.mask), param_shapes(&actual.mask)),
    ];
    for (group, expected, actual) in groups {
        if expected.len() != actual.len() {
            return Err(MrcnnError::ShapeMismatch {
                layer: group.to_string(),
                expected: vec![expected.len()],
                actual: vec![actual.len()],
            });
        }
        for (index, (expected, actual)) in expected.iter().zip(&actual).enumerate() {
            check_shape(&format!("{group}[{index}]"), expected, actual)?;
        }
    }
    Ok(())
}

/// Writes `model` to `path` as a named MessagePack record.
pub fn save_weights<B: Backend>(model: &MaskRcnn<B>, path: &Path) -> MrcnnResult<()> {
    model
        .clone()
        .save_file(path.to_path_buf(), &NamedMpkFileRecorder::<FullPrecisionSettings>::new())
        .map_err(|e| MrcnnError::CheckpointFailed {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
}

/// `mask_rcnn_<name>_<epoch:04>.mpk`
pub fn checkpoint_file_name(name: &str, epoch: usize) -> String {
    format!("mask_rcnn_{}_{epoch:04}.mpk", name.to_lowercase())
}

/// Epoch encoded in a checkpoint file name written by this crate.
pub fn checkpoint_epoch(path: &Path) -> Option<usize> {
    let stem = path.file_stem()?.to_str()?;
    let (prefix, epoch) = stem.strip_prefix("mask_rcnn_")?.rsplit_once('_')?;
    (!prefix.is_empty() && epoch.len() == 4 && epoch.bytes().all(|b| b.is_ascii_digit()))
        .then(|| epoch.parse().ok())
        .flatten()
}

/// Last checkpoint of the most recent run of `name` under `model_dir`.
///
/// Run directories sort chronologically because their suffix is the start
/// time as `YYYYmmddTHHMM`.
pub fn find_last(model_dir: &Path, name: &str) -> MrcnnResult<PathBuf> {
    let key = name.to_lowercase();
    let not_found = || MrcnnError::WeightsNotFound {
        path: model_dir.to_path_buf(),
    };

    let read = |dir: &Path| {
        std::fs::read_dir(dir).map_err(|source| MrcnnError::DirectoryReadFailed {
            path: dir.to_path_buf(),
            source,
        })
    };

    let mut runs: Vec<PathBuf> = read(model_dir)?
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| {
            path.is_dir()
                && path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with(&key))
        })
        .collect();
    runs.sort();
    let run = runs.pop().ok_or_else(not_found)?;

    let mut checkpoints: Vec<PathBuf> = read(&run)?
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| checkpoint_epoch(path).is_some())
        .collect();
    checkpoints.sort();
    checkpoints.pop().ok_or(MrcnnError::WeightsNotFound { path: run })
}

#[cfg(test)]
mod tests {
    use burn::{backend::NdArray, module::Param};

    use super::*;
    use crate::tests::tiny_config;

    type TestBackend = NdArray<f32>;

    #[test]
    fn coco_exclusions_are_the_four_head_outputs() {
        let names: Vec<&str> = HeadLayer::COCO_EXCLUSIONS
            .iter()
            .map(HeadLayer::name)
            .collect();
        assert_eq!(
            names,
            vec!["mrcnn_class_logits", "mrcnn_bbox_fc", "mrcnn_bbox", "mrcnn_mask"]
        );
    }

    #[test]
    fn formats_follow_the_extension() {
        assert_eq!(WeightFormat::from_path(Path::new("a.pth")), WeightFormat::PyTorch);
        assert_eq!(
            WeightFormat::from_path(Path::new("a.safetensors")),
            WeightFormat::SafeTensors
        );
        assert_eq!(WeightFormat::from_path(Path::new("a.mpk")), WeightFormat::NamedMpk);
    }

    #[test]
    fn checkpoint_names_encode_the_epoch() {
        assert_eq!(checkpoint_file_name("Crypt", 7), "mask_rcnn_crypt_0007.mpk");
        assert_eq!(checkpoint_epoch(Path::new("logs/run/mask_rcnn_crypt_0030.mpk")), Some(30));
        assert_eq!(checkpoint_epoch(Path::new("mask_rcnn_coco.mpk")), None);
        assert_eq!(checkpoint_epoch(Path::new("final.mpk")), None);
    }

    #[test]
    fn head_exclusion_allows_a_different_class_count() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("coco.mpk");
        let device = Default::default();

        let coco = tiny_config().with_num_classes(4).init_model::<TestBackend>(&device);
        save_weights(&coco, &path).unwrap();

        let model = tiny_config().init_model::<TestBackend>(&device);
        let loaded = load_weights(model.clone(), &path, &HeadLayer::COCO_EXCLUSIONS, &device).unwrap();
        assert_eq!(loaded.num_params(), model.num_params());

        match load_weights(model, &path, &[], &device) {
            Err(MrcnnError::ShapeMismatch { layer, .. }) => assert_eq!(layer, "mrcnn_class_logits"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn reshaped_layers_with_the_same_size_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reshaped.mpk");
        let device = Default::default();

        let model = tiny_config().init_model::<TestBackend>(&device);
        let mut record = model.clone().into_record();
        let weight = record.rpn.rpn_class_raw.weight.val();
        let [out_channels, in_channels, kh, kw] = weight.dims();
        record.rpn.rpn_class_raw.weight =
            Param::from_tensor(weight.reshape([in_channels, out_channels, kh, kw]));
        save_weights(&model.clone().load_record(record), &path).unwrap();

        match load_weights(model, &path, &HeadLayer::COCO_EXCLUSIONS, &device) {
            Err(MrcnnError::ShapeMismatch { layer, expected, actual }) => {
                assert!(layer.starts_with("rpn["));
                assert_eq!(expected, vec![out_channels, in_channels, kh, kw]);
                assert_eq!(actual, vec![in_channels, out_channels, kh, kw]);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn missing_weights_are_reported() {
        let device = Default::default();
        let model = tiny_config().init_model::<TestBackend>(&device);
        assert!(matches!(
            load_weights(model, Path::new("/does/not/exist.mpk"), &[], &device),
            Err(MrcnnError::WeightsNotFound { .. })
        ));
    }

    #[test]
    fn find_last_picks_the_newest_run_and_epoch() {
        let dir = tempfile::tempdir().unwrap();
        for (run, files) in [
            ("crypt20240101T0900", vec!["mask_rcnn_crypt_0005.mpk"]),
            ("crypt20240102T0900", vec!["mask_rcnn_crypt_0001.mpk", "mask_rcnn_crypt_0002.mpk", "final.mpk"]),
            ("other20250101T0000", vec!["mask_rcnn_other_0009.mpk"]),
        ] {
            let run_dir = dir.path().join(run);
            std::fs::create_dir_all(&run_dir).unwrap();
            for file in files {
                std::fs::write(run_dir.join(file), b"").unwrap();
            }
        }

        let last = find_last(dir.path(), "crypt").unwrap();
        assert!(last.ends_with("crypt20240102T0900/mask_rcnn_crypt_0002.mpk"));
        assert!(find_last(dir.path(), "absent").is_err());
    }
}
