//! Paired OCT datasets and image loading

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use image::imageops::{self, FilterType};
use log::{info, warn};
use ndarray::{Array2, Zip};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use crate::{Result, SsmError};

const IMAGE_EXTENSIONS: &[&str] = &["png", "tif", "tiff", "jpg", "jpeg", "bmp"];

/// A noisy scan and its training target
#[derive(Debug, Clone, PartialEq)]
pub struct ImagePair {
    /// Patient or subject identifier
    pub patient: String,
    /// Noisy scan in `[0, 1]`
    pub input: Array2<f32>,
    /// Target (averaged or binarised) in `[0, 1]`
    pub target: Array2<f32>,
}

/// Collection of image pairs grouped by patient
#[derive(Debug, Clone, Default)]
pub struct PairedDataset {
    pairs: Vec<ImagePair>,
}

impl PairedDataset {
    /// Create an empty dataset
    pub fn new() -> Self {
        PairedDataset { pairs: Vec::new() }
    }

    /// Wrap existing pairs
    pub fn from_pairs(pairs: Vec<ImagePair>) -> Self {
        PairedDataset { pairs }
    }

    /// Add a pair; input and target must share a shape
    pub fn push(&mut self, pair: ImagePair) -> Result<()> {
        if pair.input.dim() != pair.target.dim() {
            return Err(SsmError::Shape(format!(
                "input {:?} and target {:?} differ for patient {}",
                pair.input.dim(),
                pair.target.dim(),
                pair.patient
            )));
        }
        self.pairs.push(pair);
        Ok(())
    }

    /// Add many pairs
    pub fn extend(&mut self, pairs: impl IntoIterator<Item = ImagePair>) -> Result<()> {
        for pair in pairs {
            self.push(pair)?;
        }
        Ok(())
    }

    /// Number of pairs
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// All pairs
    pub fn pairs(&self) -> &[ImagePair] {
        &self.pairs
    }

    /// Consume into the pairs
    pub fn into_pairs(self) -> Vec<ImagePair> {
        self.pairs
    }

    /// Distinct patient identifiers, sorted
    pub fn patients(&self) -> Vec<String> {
        self.pairs
            .iter()
            .map(|p| p.patient.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

/// Min–max normalise to `[0, 1]`; constant images become zeros
pub fn normalize_image(image: &Array2<f32>) -> Array2<f32> {
    let (min, max) = image
        .iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
    let range = max - min;
    if !range.is_finite() || range <= f32::EPSILON {
        return Array2::zeros(image.raw_dim());
    }
    image.mapv(|v| (v - min) / range)
}

/// Load a grayscale image as `[H, W]` values in `[0, 1]`.
///
/// `resize` is `(height, width)`; resampling is bilinear.
pub fn load_grayscale(path: &Path, resize: Option<(usize, usize)>) -> Result<Array2<f32>> {
    let img = image::open(path)?.to_luma16();
    let img = match resize {
        Some((h, w)) if (img.height() as usize, img.width() as usize) != (h, w) => {
            imageops::resize(&img, w as u32, h as u32, FilterType::Triangle)
        }
        _ => img,
    };

    let (width, height) = img.dimensions();
    Ok(Array2::from_shape_fn((height as usize, width as usize), |(r, c)| {
        img.get_pixel(c as u32, r as u32)[0] as f32 / u16::MAX as f32
    }))
}

/// Image files in a directory, sorted by name
pub fn list_image_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.is_file()
                && path
                    .extension()
                    .and_then(|ext| ext.to_str())
                    .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
                    .unwrap_or(false)
        })
        .collect();
    files.sort();
    Ok(files)
}

/// Sub-directories of a directory, sorted by name
pub fn list_subdirs(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut dirs: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_dir())
        .collect();
    dirs.sort();
    Ok(dirs)
}

/// Raw and averaged scans of one SD-OCT subject
#[derive(Debug, Clone, Default)]
pub struct SdoctSample {
    /// Single-frame noisy scans
    pub raw: Vec<Array2<f32>>,
    /// Registered-and-averaged reference scans
    pub avg: Vec<Array2<f32>>,
}

/// Load an SD-OCT evaluation set laid out as `<root>/<subject>/{raw,avg}/*`
pub fn load_sdoct_dataset(root: &Path) -> Result<BTreeMap<String, SdoctSample>> {
    let mut dataset = BTreeMap::new();

    for subject_dir in list_subdirs(root)? {
        let subject = subject_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let raw_dir = subject_dir.join("raw");
        let avg_dir = subject_dir.join("avg");
        if !raw_dir.is_dir() || !avg_dir.is_dir() {
            warn!("Skipping {}: expected raw/ and avg/ sub-directories", subject_dir.display());
            continue;
        }

        let raw = list_image_files(&raw_dir)?
            .iter()
            .map(|p| load_grayscale(p, None))
            .collect::<Result<Vec<_>>>()?;
        let avg = list_image_files(&avg_dir)?
            .iter()
            .map(|p| load_grayscale(p, None))
            .collect::<Result<Vec<_>>>()?;
        if raw.is_empty() || avg.is_empty() {
            warn!("Skipping {}: no images found", subject);
            continue;
        }

        dataset.insert(subject, SdoctSample { raw, avg });
    }

    if dataset.is_empty() {
        return Err(SsmError::Data(format!("no SD-OCT subjects found under {}", root.display())));
    }
    info!("Loaded {} SD-OCT subjects from {}", dataset.len(), root.display());
    Ok(dataset)
}

/// Layered retina-like phantom in `[0, 1]`
pub fn synthetic_phantom<R: Rng>(height: usize, width: usize, rng: &mut R) -> Array2<f32> {
    let n_layers = rng.gen_range(3..6);
    let layers: Vec<(f32, f32, f32, f32)> = (0..n_layers)
        .map(|_| {
            let centre = rng.gen_range(0.2..0.8) * height as f32;
            let thickness = rng.gen_range(0.02..0.08) * height as f32;
            let brightness = rng.gen_range(0.4..1.0);
            let tilt = rng.gen_range(-0.1..0.1);
            (centre, thickness, brightness, tilt)
        })
        .collect();
    let phase = rng.gen_range(0.0..std::f32::consts::TAU);

    Array2::from_shape_fn((height, width), |(r, c)| {
        let x = c as f32 / width.max(1) as f32;
        let curve = 0.05 * height as f32 * (std::f32::consts::TAU * x + phase).sin();
        layers
            .iter()
            .map(|&(centre, thickness, brightness, tilt)| {
                let boundary = centre + curve + tilt * c as f32;
                let d = (r as f32 - boundary) / thickness.max(1.0);
                brightness * (-0.5 * d * d).exp()
            })
            .fold(0.0f32, f32::max)
    })
}

/// Synthetic speckle pairs: multiplicative exponential speckle on phantoms.
///
/// The target is the clean phantom; every four images share a patient id.
pub fn synthetic_pairs(n: usize, height: usize, width: usize, seed: u64) -> PairedDataset {
    let mut rng = StdRng::seed_from_u64(seed);
    let pairs = (0..n)
        .map(|i| {
            let clean = synthetic_phantom(height, width, &mut rng);
            let mut noisy = clean.clone();
            Zip::from(&mut noisy).for_each(|v| {
                // Exponential speckle with unit mean plus a faint floor
                let u: f32 = rng.gen_range(f32::EPSILON..1.0);
                let speckle = -u.ln();
                *v = (*v * speckle + 0.05 * rng.gen::<f32>()).clamp(0.0, 1.0);
            });
            ImagePair {
                patient: format!("synthetic_{:03}", i / 4),
                input: noisy,
                target: clean,
            }
        })
        .collect();
    PairedDataset::from_pairs(pairs)
}

/// Seeded shuffle followed by a train/validation split.
///
/// The validation set holds `floor(val_split * n)` pairs and the training set
/// the rest; both must end up non-empty.
pub fn split_dataset(
    dataset: PairedDataset,
    val_split: f32,
    seed: u64,
) -> Result<(Vec<ImagePair>, Vec<ImagePair>)> {
    if !(0.0..1.0).contains(&val_split) {
        return Err(SsmError::InvalidConfig(format!("val_split must be in [0, 1), got {}", val_split)));
    }

    let mut pairs = dataset.into_pairs();
    let mut rng = StdRng::seed_from_u64(seed);
    pairs.shuffle(&mut rng);

    let val_size = (pairs.len() as f32 * val_split) as usize;
    let train_size = pairs.len() - val_size;
    if train_size == 0 || val_size == 0 {
        return Err(SsmError::Data(format!(
            "split of {} pairs with val_split={} leaves an empty set ({} train, {} val)",
            pairs.len(),
            val_split,
            train_size,
            val_size
        )));
    }

    let val = pairs.split_off(train_size);
    Ok((pairs, val))
}
