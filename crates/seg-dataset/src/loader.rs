//! Image and ground-truth loading.
//!
//! A data root holds `image/` and `gt/`. Files are paired by stem, so
//! `image/tile_01.png` goes with `gt/tile_01.png` (or `gt/tile_01.tif`).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use image::DynamicImage;
use seg_core::{Error, ImageDimensions, ImageId, ImagePair, LabelMap, Result};
use tracing::debug;

/// File extensions recognised as images
pub const IMAGE_EXTENSIONS: &[&str] = &["png", "tif", "tiff", "jpg", "jpeg", "bmp"];

/// Loader for a paired `image/` + `gt/` directory
#[derive(Debug, Clone)]
pub struct PairedImageLoader {
    root_dir: PathBuf,
    num_classes: usize,
}

impl PairedImageLoader {
    pub fn new(root_dir: impl Into<PathBuf>, num_classes: usize) -> Self {
        Self {
            root_dir: root_dir.into(),
            num_classes,
        }
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    pub fn image_dir(&self) -> PathBuf {
        self.root_dir.join("image")
    }

    pub fn gt_dir(&self) -> PathBuf {
        self.root_dir.join("gt")
    }

    /// Lists image/ground-truth pairs sorted by id.
    ///
    /// Every image needs a ground truth and vice versa.
    pub fn scan(&self) -> Result<Vec<ImagePair>> {
        let images = scan_directory(&self.image_dir())?;
        let mut gts = scan_directory(&self.gt_dir())?;

        if images.is_empty() {
            return Err(Error::Dataset(format!(
                "No images found in {}",
                self.image_dir().display()
            )));
        }

        let mut pairs = Vec::with_capacity(images.len());
        for (stem, image_path) in images {
            let gt_path = gts.remove(&stem).ok_or_else(|| {
                Error::Config(format!(
                    "Image {} has no ground truth in {}",
                    image_path.display(),
                    self.gt_dir().display()
                ))
            })?;
            pairs.push(ImagePair {
                id: ImageId::new(stem),
                image_path,
                gt_path,
            });
        }

        if let Some((_, orphan)) = gts.into_iter().next() {
            return Err(Error::Config(format!(
                "Ground truth {} has no matching image",
                orphan.display()
            )));
        }

        debug!("Found {} pairs under {}", pairs.len(), self.root_dir.display());
        Ok(pairs)
    }

    /// Loads an RGB image as CHW floats in `[0, 1]`
    pub fn load_image(&self, path: &Path) -> Result<(ImageDimensions, Vec<f32>)> {
        let img = open_image(path)?.to_rgb8();
        let (width, height) = (img.width() as usize, img.height() as usize);
        let plane = height * width;

        let mut data = vec![0.0f32; 3 * plane];
        for (x, y, pixel) in img.enumerate_pixels() {
            let idx = y as usize * width + x as usize;
            for c in 0..3 {
                data[c * plane + idx] = pixel[c] as f32 / 255.0;
            }
        }

        Ok((ImageDimensions::new(height, width), data))
    }

    /// Loads a ground-truth file whose pixel values are class indices.
    ///
    /// 8- and 16-bit grayscale are read as is. RGB(A) is accepted only when
    /// every pixel is gray, which rejects colour-coded and palette masks
    /// (palette PNGs decode to RGB). Other formats are configuration errors.
    pub fn load_ground_truth(&self, path: &Path) -> Result<LabelMap> {
        let gt = open_image(path)?;
        let dims = ImageDimensions::new(gt.height() as usize, gt.width() as usize);

        let values: Vec<u32> = match &gt {
            DynamicImage::ImageLuma8(img) => img.pixels().map(|p| p[0] as u32).collect(),
            DynamicImage::ImageLuma16(img) => img.pixels().map(|p| p[0] as u32).collect(),
            DynamicImage::ImageRgb8(img) => gray_values(img.pixels().map(|p| [p[0], p[1], p[2]]), path)?,
            DynamicImage::ImageRgba8(img) => gray_values(img.pixels().map(|p| [p[0], p[1], p[2]]), path)?,
            other => {
                return Err(Error::Config(format!(
                    "{}: unsupported ground-truth pixel format {:?}",
                    path.display(),
                    other.color()
                )))
            }
        };

        let labels = values
            .into_iter()
            .map(|label| {
                if label as usize >= self.num_classes {
                    Err(Error::LabelOutOfRange {
                        label,
                        num_classes: self.num_classes,
                    })
                } else {
                    Ok(label)
                }
            })
            .collect::<Result<Vec<u32>>>()
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;

        LabelMap::new(dims, labels)
    }

    /// Loads both halves of a pair, checking that their sizes agree
    pub fn load_pair(&self, pair: &ImagePair) -> Result<(ImageDimensions, Vec<f32>, LabelMap)> {
        let (dims, image) = self.load_image(&pair.image_path)?;
        let labels = self.load_ground_truth(&pair.gt_path)?;

        if labels.dims() != dims {
            return Err(Error::Config(format!(
                "Image {} is {} but its ground truth is {}",
                pair.id,
                dims,
                labels.dims()
            )));
        }

        Ok((dims, image, labels))
    }
}

fn gray_values(pixels: impl Iterator<Item = [u8; 3]>, path: &Path) -> Result<Vec<u32>> {
    pixels
        .map(|[r, g, b]| {
            if r == g && g == b {
                Ok(r as u32)
            } else {
                Err(Error::Config(format!(
                    "{}: colour pixel ({r}, {g}, {b}) in ground truth, expected class indices",
                    path.display()
                )))
            }
        })
        .collect()
}

fn open_image(path: &Path) -> Result<DynamicImage> {
    if !path.exists() {
        return Err(Error::NotFound(format!(
            "Image file not found: {}",
            path.display()
        )));
    }

    image::open(path)
        .map_err(|e| Error::Image(format!("Failed to load image {}: {}", path.display(), e)))
}

/// Image files in `dir` keyed by stem
fn scan_directory(dir: &Path) -> Result<BTreeMap<String, PathBuf>> {
    if !dir.is_dir() {
        return Err(Error::Config(format!(
            "Directory not found: {}",
            dir.display()
        )));
    }

    let mut files = BTreeMap::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }

        let is_image = path
            .extension()
            .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_string_lossy().to_lowercase().as_str()))
            .unwrap_or(false);
        if !is_image {
            continue;
        }

        let Some(stem) = path.file_stem().map(|s| s.to_string_lossy().into_owned()) else {
            continue;
        };
        if let Some(previous) = files.insert(stem.clone(), path.clone()) {
            return Err(Error::Config(format!(
                "Two files share the stem '{stem}': {} and {}",
                previous.display(),
                path.display()
            )));
        }
    }

    Ok(files)
}
