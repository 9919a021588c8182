//! The crypts dataset: image identifiers resolved against an
//! `Images/` + `Masks/` directory layout.
//!
//! Registration ([`CryptsDataset::load`]) only records identifiers.
//! [`CryptsDataset::prepare`] resolves every file and consumes the adapter,
//! so the accessors of [`PreparedDataset`] cannot be reached before
//! preparation and a dataset cannot be prepared twice.

use std::{
    collections::{BTreeMap, BTreeSet},
    path::{Path, PathBuf},
};

use image::{GrayImage, Luma, RgbImage};
use walkdir::WalkDir;

use crate::error::{MrcnnError, MrcnnResult};

/// Source tag of every class and image registered by this adapter.
pub const SOURCE: &str = "crypts";

const MASK_EXTENSIONS: [&str; 6] = ["png", "tif", "tiff", "bmp", "jpg", "jpeg"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassInfo {
    pub source: &'static str,
    pub id: u32,
    pub name: &'static str,
}

/// Where the instance masks of an image live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MaskSource {
    /// `Masks/<stem>/`, one binary image per instance, in file name order.
    InstanceDirectory(Vec<PathBuf>),
    /// `Masks/<stem>.<ext>`, one distinct non-zero value per instance.
    LabelImage(PathBuf),
}

#[derive(Debug, Clone)]
pub struct ImageInfo {
    pub id: String,
    pub source: &'static str,
    pub path: PathBuf,
    pub masks: MaskSource,
}

/// Binary instance masks (0 or 255) with one class id each.
#[derive(Debug, Clone, Default)]
pub struct InstanceMasks {
    pub masks: Vec<GrayImage>,
    pub class_ids: Vec<u32>,
}

impl InstanceMasks {
    pub fn len(&self) -> usize {
        self.masks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.masks.is_empty()
    }
}

/// Identifiers registered for later resolution.
#[derive(Debug, Clone)]
pub struct CryptsDataset {
    classes: Vec<ClassInfo>,
    registered: BTreeMap<String, PathBuf>,
}

impl Default for CryptsDataset {
    fn default() -> Self {
        Self::new()
    }
}

impl CryptsDataset {
    pub fn new() -> Self {
        Self {
            classes: vec![
                ClassInfo {
                    source: "",
                    id: 0,
                    name: "BG",
                },
                ClassInfo {
                    source: SOURCE,
                    id: 1,
                    name: "crypt",
                },
            ],
            registered: BTreeMap::new(),
        }
    }

    /// Registers `identifiers` (file names inside `<base_directory>/Images`).
    ///
    /// Nothing is read from disk. An identifier registered twice keeps its
    /// first base directory.
    pub fn load<I, S>(&mut self, identifiers: I, base_directory: impl AsRef<Path>)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let base = base_directory.as_ref();
        for id in identifiers {
            self.registered
                .entry(id.into())
                .or_insert_with(|| base.to_path_buf());
        }
    }

    pub fn classes(&self) -> &[ClassInfo] {
        &self.classes
    }

    /// Number of registered (distinct) identifiers.
    pub fn registered(&self) -> usize {
        self.registered.len()
    }

    /// Resolves every registered identifier and builds the index.
    ///
    /// # Errors
    ///
    /// [`MrcnnError::MissingImage`] or [`MrcnnError::MissingMasks`] for the
    /// first identifier whose files do not exist, or
    /// [`MrcnnError::DirectoryReadFailed`] when a mask directory cannot be
    /// listed.
    pub fn prepare(self) -> MrcnnResult<PreparedDataset> {
        let images = self
            .registered
            .into_iter()
            .map(|(id, base)| resolve(id, &base))
            .collect::<MrcnnResult<Vec<_>>>()?;

        tracing::debug!(images = images.len(), "prepared {SOURCE} dataset");

        Ok(PreparedDataset {
            classes: self.classes,
            images,
        })
    }
}

fn resolve(id: String, base: &Path) -> MrcnnResult<ImageInfo> {
    let path = base.join("Images").join(&id);
    if !path.is_file() {
        return Err(MrcnnError::MissingImage { image_id: id, path });
    }

    let stem = Path::new(&id)
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| id.clone());
    let mask_root = base.join("Masks");
    let instance_dir = mask_root.join(&stem);

    let masks = if instance_dir.is_dir() {
        MaskSource::InstanceDirectory(list_files(&instance_dir)?)
    } else if let Some(label) = MASK_EXTENSIONS
        .iter()
        .map(|ext| mask_root.join(format!("{stem}.{ext}")))
        .find(|candidate| candidate.is_file())
    {
        MaskSource::LabelImage(label)
    } else {
        return Err(MrcnnError::MissingMasks {
            image_id: id,
            path: mask_root,
        });
    };

    Ok(ImageInfo {
        id,
        source: SOURCE,
        path,
        masks,
    })
}

/// Regular files directly inside `dir`, sorted by name.
fn list_files(dir: &Path) -> MrcnnResult<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
    {
        let entry = entry.map_err(|err| MrcnnError::DirectoryReadFailed {
            path: dir.to_path_buf(),
            source: err
                .into_io_error()
                .unwrap_or_else(|| std::io::Error::other("directory walk failed")),
        })?;
        if entry.file_type().is_file() {
            files.push(entry.into_path());
        }
    }
    Ok(files)
}

/// File names of the regular files directly inside `dir`, sorted.
///
/// # Errors
///
/// [`MrcnnError::DirectoryReadFailed`] if `dir` cannot be read.
pub fn list_image_ids(dir: impl AsRef<Path>) -> MrcnnResult<Vec<String>> {
    Ok(list_files(dir.as_ref())?
        .into_iter()
        .filter_map(|path| {
            path.file_name()
                .map(|name| name.to_string_lossy().into_owned())
        })
        .collect())
}

/// A resolved dataset with a stable index, sorted by identifier.
#[derive(Debug, Clone)]
pub struct PreparedDataset {
    classes: Vec<ClassInfo>,
    images: Vec<ImageInfo>,
}

impl PreparedDataset {
    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    pub fn classes(&self) -> &[ClassInfo] {
        &self.classes
    }

    pub fn num_classes(&self) -> usize {
        self.classes.len()
    }

    pub fn image_ids(&self) -> impl Iterator<Item = &str> {
        self.images.iter().map(|info| info.id.as_str())
    }

    pub fn image_info(&self, index: usize) -> MrcnnResult<&ImageInfo> {
        self.images.get(index).ok_or(MrcnnError::IndexOutOfRange {
            index,
            len: self.images.len(),
        })
    }

    /// Decodes the image at `index` as 8-bit RGB.
    pub fn load_image(&self, index: usize) -> MrcnnResult<RgbImage> {
        let info = self.image_info(index)?;
        let image = image::open(&info.path).map_err(|source| MrcnnError::ImageOpenFailed {
            path: info.path.clone(),
            source,
        })?;
        Ok(image.to_rgb8())
    }

    /// Decodes the instance masks at `index`. Every instance is a crypt.
    pub fn load_mask(&self, index: usize) -> MrcnnResult<InstanceMasks> {
        let info = self.image_info(index)?;
        let masks = match &info.masks {
            MaskSource::InstanceDirectory(files) => files
                .iter()
                .map(|path| {
                    let mask = open_mask(path)?.to_luma8();
                    Ok(binarize(&mask, |value| value > 0))
                })
                .collect::<MrcnnResult<Vec<_>>>()?,
            MaskSource::LabelImage(path) => {
                let labels = open_mask(path)?.to_luma16();
                let values: BTreeSet<u16> =
                    labels.pixels().map(|p| p[0]).filter(|&v| v != 0).collect();
                values
                    .into_iter()
                    .map(|label| binarize_labels(&labels, label))
                    .collect()
            }
        };

        let class_ids = vec![1; masks.len()];
        Ok(InstanceMasks { masks, class_ids })
    }
}

fn open_mask(path: &Path) -> MrcnnResult<image::DynamicImage> {
    image::open(path).map_err(|source| MrcnnError::ImageOpenFailed {
        path: path.to_path_buf(),
        source,
    })
}

fn binarize(mask: &GrayImage, on: impl Fn(u8) -> bool) -> GrayImage {
    GrayImage::from_fn(mask.width(), mask.height(), |x, y| {
        Luma([if on(mask.get_pixel(x, y)[0]) { 255 } else { 0 }])
    })
}

fn binarize_labels(labels: &image::ImageBuffer<Luma<u16>, Vec<u16>>, label: u16) -> GrayImage {
    GrayImage::from_fn(labels.width(), labels.height(), |x, y| {
        Luma([if labels.get_pixel(x, y)[0] == label { 255 } else { 0 }])
    })
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    fn write_image(path: &Path) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        RgbImage::from_pixel(8, 8, image::Rgb([40, 80, 120]))
            .save(path)
            .unwrap();
    }

    fn write_instance(path: &Path, from: u32, to: u32) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        GrayImage::from_fn(8, 8, |x, y| {
            Luma([if (from..to).contains(&x) && (from..to).contains(&y) {
                255
            } else {
                0
            }])
        })
        .save(path)
        .unwrap();
    }

    #[test]
    fn registration_collapses_duplicates() {
        let mut dataset = CryptsDataset::new();
        dataset.load(["b.png", "a.png", "b.png"], "/nowhere");
        assert_eq!(dataset.registered(), 2);
        assert_eq!(dataset.classes()[1].name, "crypt");
    }

    #[test]
    fn prepare_resolves_both_mask_layouts() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path();
        write_image(&base.join("Images/a.png"));
        write_image(&base.join("Images/b.png"));
        write_instance(&base.join("Masks/a/0.png"), 0, 3);
        write_instance(&base.join("Masks/a/1.png"), 4, 8);
        GrayImage::from_fn(8, 8, |x, _| Luma([if x < 4 { 1 } else { 7 }]))
            .save(base.join("Masks/b.png"))
            .unwrap();

        let mut dataset = CryptsDataset::new();
        dataset.load(list_image_ids(base.join("Images")).unwrap(), base);
        let prepared = dataset.prepare().unwrap();

        assert_eq!(prepared.len(), 2);
        assert_eq!(prepared.image_ids().collect::<Vec<_>>(), vec!["a.png", "b.png"]);

        let a = prepared.load_mask(0).unwrap();
        assert_eq!(a.len(), 2);
        assert_eq!(a.class_ids, vec![1, 1]);
        assert_eq!(a.masks[0].get_pixel(1, 1)[0], 255);
        assert_eq!(a.masks[0].get_pixel(5, 5)[0], 0);

        let b = prepared.load_mask(1).unwrap();
        assert_eq!(b.len(), 2);
        assert_eq!(b.masks[1].get_pixel(6, 0)[0], 255);

        assert_eq!(prepared.load_image(0).unwrap().dimensions(), (8, 8));
    }

    #[test]
    fn missing_files_name_the_identifier() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path();
        write_image(&base.join("Images/a.png"));

        let mut dataset = CryptsDataset::new();
        dataset.load(["a.png"], base);
        match dataset.prepare() {
            Err(MrcnnError::MissingMasks { image_id, .. }) => assert_eq!(image_id, "a.png"),
            other => panic!("unexpected: {other:?}"),
        }

        let mut dataset = CryptsDataset::new();
        dataset.load(["ghost.png"], base);
        assert!(matches!(
            dataset.prepare(),
            Err(MrcnnError::MissingImage { .. })
        ));
    }

    #[test]
    fn accessors_check_the_index() {
        let prepared = CryptsDataset::new().prepare().unwrap();
        assert!(prepared.is_empty());
        assert!(matches!(
            prepared.load_image(0),
            Err(MrcnnError::IndexOutOfRange { index: 0, len: 0 })
        ));
    }
}
