//! Paired OCTA preprocessing
//!
//! Each patient directory holds a sequence of repeated B-scans of the same
//! location. A scan is paired with a target built from it and its following
//! neighbours: their mean, optionally thresholded at a high percentile to keep
//! only flow signal, with tiny connected blobs removed.

use std::collections::VecDeque;
use std::path::Path;

use log::{info, warn};
use ndarray::Array2;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use super::dataset::{list_image_files, list_subdirs, load_grayscale, normalize_image, ImagePair, PairedDataset};
use crate::{Result, SsmError};

/// Target construction settings
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreprocessConfig {
    /// Scans averaged into each target, the scan itself included
    pub n_neighbours: usize,
    /// Percentile (0–100) used as the binarisation threshold
    pub threshold: f32,
    /// Threshold the averaged target into a flow mask
    pub binary: bool,
    /// Connected components smaller than this many pixels are removed
    pub post_process_size: usize,
    /// Square side every scan is resized to
    pub resize: Option<usize>,
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        PreprocessConfig {
            n_neighbours: 4,
            threshold: 99.0,
            binary: true,
            post_process_size: 2,
            resize: Some(256),
        }
    }
}

impl PreprocessConfig {
    /// Check the settings
    pub fn validate(&self) -> Result<()> {
        if self.n_neighbours == 0 {
            return Err(SsmError::InvalidConfig("n_neighbours must be positive".to_string()));
        }
        if !(0.0..=100.0).contains(&self.threshold) {
            return Err(SsmError::InvalidConfig(format!(
                "threshold percentile must be in [0, 100], got {}",
                self.threshold
            )));
        }
        if self.resize == Some(0) {
            return Err(SsmError::InvalidConfig("resize must be positive".to_string()));
        }
        Ok(())
    }
}

/// Mean of `scans[index .. index + n]`, clamped at the end of the sequence
pub fn neighbour_average(scans: &[Array2<f32>], index: usize, n: usize) -> Result<Array2<f32>> {
    let end = (index + n.max(1)).min(scans.len());
    let window = scans.get(index..end).filter(|w| !w.is_empty()).ok_or_else(|| {
        SsmError::Data(format!("scan index {} out of range for {} scans", index, scans.len()))
    })?;

    let mut sum = Array2::<f32>::zeros(window[0].raw_dim());
    for scan in window {
        if scan.dim() != sum.dim() {
            return Err(SsmError::Shape(format!(
                "neighbouring scans differ in shape: {:?} vs {:?}",
                scan.dim(),
                sum.dim()
            )));
        }
        sum += scan;
    }
    Ok(sum / window.len() as f32)
}

/// Percentile with linear interpolation between closest ranks
pub fn percentile(image: &Array2<f32>, q: f32) -> f32 {
    let mut values: Vec<f32> = image.iter().copied().filter(|v| v.is_finite()).collect();
    if values.is_empty() {
        return 0.0;
    }
    values.sort_by(|a, b| a.total_cmp(b));

    let rank = (q.clamp(0.0, 100.0) / 100.0) * (values.len() - 1) as f32;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    let frac = rank - lo as f32;
    values[lo] + (values[hi] - values[lo]) * frac
}

/// 1 where the pixel is strictly above `threshold`, 0 elsewhere
pub fn binarize(image: &Array2<f32>, threshold: f32) -> Array2<f32> {
    image.mapv(|v| if v > threshold { 1.0 } else { 0.0 })
}

/// Zero out 4-connected foreground components with fewer than `min_size` pixels
pub fn remove_small_components(mask: &Array2<f32>, min_size: usize) -> Array2<f32> {
    let mut out = mask.clone();
    if min_size <= 1 {
        return out;
    }

    let (height, width) = mask.dim();
    let mut visited = Array2::from_elem((height, width), false);
    let mut queue = VecDeque::new();
    let mut component = Vec::new();

    for start_r in 0..height {
        for start_c in 0..width {
            if visited[[start_r, start_c]] || mask[[start_r, start_c]] <= 0.0 {
                continue;
            }

            component.clear();
            visited[[start_r, start_c]] = true;
            queue.push_back((start_r, start_c));
            while let Some((r, c)) = queue.pop_front() {
                component.push((r, c));
                let neighbours = [
                    (r.wrapping_sub(1), c),
                    (r + 1, c),
                    (r, c.wrapping_sub(1)),
                    (r, c + 1),
                ];
                for (nr, nc) in neighbours {
                    if nr < height && nc < width && !visited[[nr, nc]] && mask[[nr, nc]] > 0.0 {
                        visited[[nr, nc]] = true;
                        queue.push_back((nr, nc));
                    }
                }
            }

            if component.len() < min_size {
                for &(r, c) in &component {
                    out[[r, c]] = 0.0;
                }
            }
        }
    }
    out
}

/// Build the target for one scan of a sequence
pub fn build_target(scans: &[Array2<f32>], index: usize, config: &PreprocessConfig) -> Result<Array2<f32>> {
    let averaged = neighbour_average(scans, index, config.n_neighbours)?;
    if !config.binary {
        return Ok(normalize_image(&averaged));
    }
    let threshold = percentile(&averaged, config.threshold);
    let mask = binarize(&averaged, threshold);
    Ok(remove_small_components(&mask, config.post_process_size))
}

/// Turn a scan sequence of one patient into image pairs
pub fn pairs_from_sequence(
    patient: &str,
    scans: &[Array2<f32>],
    config: &PreprocessConfig,
) -> Result<Vec<ImagePair>> {
    (0..scans.len())
        .map(|i| {
            Ok(ImagePair {
                patient: patient.to_string(),
                input: scans[i].clone(),
                target: build_target(scans, i, config)?,
            })
        })
        .collect()
}

/// Load `n_patients` patients starting at index `start` from `root` and build pairs.
///
/// Patients are the sorted sub-directories of `root`; each contributes its
/// first `n_images` sorted scans.
pub fn paired_preprocessing(
    root: &Path,
    start: usize,
    n_patients: usize,
    n_images: usize,
    config: &PreprocessConfig,
) -> Result<PairedDataset> {
    config.validate()?;
    let patient_dirs: Vec<_> = list_subdirs(root)?.into_iter().skip(start).take(n_patients).collect();
    if patient_dirs.is_empty() {
        return Err(SsmError::Data(format!(
            "no patient directories under {} (start={})",
            root.display(),
            start
        )));
    }
    if patient_dirs.len() < n_patients {
        warn!(
            "Requested {} patients but only {} are available from index {}",
            n_patients,
            patient_dirs.len(),
            start
        );
    }

    let resize = config.resize.map(|s| (s, s));
    let per_patient: Vec<Result<Vec<ImagePair>>> = patient_dirs
        .par_iter()
        .map(|dir| {
            let patient = dir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let scans = list_image_files(dir)?
                .iter()
                .take(n_images)
                .map(|path| load_grayscale(path, resize).map(|img| normalize_image(&img)))
                .collect::<Result<Vec<_>>>()?;
            if scans.is_empty() {
                warn!("Patient {} has no scans", patient);
            }
            pairs_from_sequence(&patient, &scans, config)
        })
        .collect();

    let mut dataset = PairedDataset::new();
    for pairs in per_patient {
        dataset.extend(pairs?)?;
    }
    if dataset.is_empty() {
        return Err(SsmError::Data(format!("no scans found under {}", root.display())));
    }

    info!(
        "Prepared {} pairs from {} patients (binary={}, threshold={})",
        dataset.len(),
        dataset.patients().len(),
        config.binary,
        config.threshold
    );
    Ok(dataset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_neighbour_average_clamps_at_end() {
        let scans: Vec<Array2<f32>> = (0..5).map(|i| Array2::from_elem((2, 2), i as f32)).collect();
        assert_eq!(neighbour_average(&scans, 0, 4).unwrap()[[0, 0]], 1.5);
        assert_eq!(neighbour_average(&scans, 3, 4).unwrap()[[0, 0]], 3.5);
        assert_eq!(neighbour_average(&scans, 4, 4).unwrap()[[1, 1]], 4.0);
        assert!(neighbour_average(&scans, 5, 4).is_err());
    }

    #[test]
    fn test_percentile() {
        let img = Array2::from_shape_vec((1, 5), vec![5.0, 1.0, 3.0, 2.0, 4.0]).unwrap();
        assert_eq!(percentile(&img, 0.0), 1.0);
        assert_eq!(percentile(&img, 50.0), 3.0);
        assert_eq!(percentile(&img, 100.0), 5.0);
        assert!((percentile(&img, 90.0) - 4.6).abs() < 1e-5);
    }

    #[test]
    fn test_remove_small_components() {
        let mask = array![
            [1.0, 1.0, 0.0, 0.0],
            [1.0, 0.0, 0.0, 1.0],
            [0.0, 0.0, 0.0, 0.0],
            [0.0, 1.0, 0.0, 0.0],
        ];
        let cleaned = remove_small_components(&mask, 2);
        assert_eq!(
            cleaned,
            array![
                [1.0, 1.0, 0.0, 0.0],
                [1.0, 0.0, 0.0, 0.0],
                [0.0, 0.0, 0.0, 0.0],
                [0.0, 0.0, 0.0, 0.0],
            ]
        );
        // Diagonal neighbours are separate components
        let diagonal = array![[1.0, 0.0], [0.0, 1.0]];
        assert!(remove_small_components(&diagonal, 2).iter().all(|&v| v == 0.0));
        assert_eq!(remove_small_components(&diagonal, 1), diagonal);
    }

    #[test]
    fn test_build_target_binary() {
        let mut scan = Array2::<f32>::zeros((10, 10));
        scan[[4, 4]] = 1.0;
        scan[[4, 5]] = 1.0;
        scan[[0, 9]] = 0.9;
        let scans = vec![scan.clone(), scan];
        let config = PreprocessConfig {
            threshold: 95.0,
            ..Default::default()
        };
        let target = build_target(&scans, 0, &config).unwrap();
        assert_eq!(target[[4, 4]], 1.0);
        assert_eq!(target[[4, 5]], 1.0);
        // Above threshold but a single pixel
        assert_eq!(target[[0, 9]], 0.0);
        assert_eq!(target.sum(), 2.0);
    }

    #[test]
    fn test_pairs_from_sequence() {
        let scans: Vec<Array2<f32>> = (0..3).map(|i| Array2::from_elem((4, 4), i as f32 / 2.0)).collect();
        let config = PreprocessConfig {
            binary: false,
            ..Default::default()
        };
        let pairs = pairs_from_sequence("p1", &scans, &config).unwrap();
        assert_eq!(pairs.len(), 3);
        assert!(pairs.iter().all(|p| p.patient == "p1" && p.target.dim() == (4, 4)));
        assert_eq!(pairs[2].input, scans[2]);
    }

    #[test]
    fn test_paired_preprocessing_from_disk() {
        let root = std::env::temp_dir().join(format!("oct_ssm_pre_{}", std::process::id()));
        for patient in ["a", "b", "c"] {
            let dir = root.join(patient);
            std::fs::create_dir_all(&dir).unwrap();
            for i in 0..3u32 {
                let img = image::GrayImage::from_fn(12, 12, |x, y| image::Luma([((x * 7 + y * 3 + i * 11) % 255) as u8]));
                img.save(dir.join(format!("scan_{}.png", i))).unwrap();
            }
        }

        let config = PreprocessConfig {
            resize: Some(8),
            ..Default::default()
        };
        let dataset = paired_preprocessing(&root, 1, 5, 2, &config).unwrap();
        assert_eq!(dataset.len(), 4);
        assert_eq!(dataset.patients(), vec!["b", "c"]);
        assert!(dataset.pairs().iter().all(|p| p.input.dim() == (8, 8)));

        assert!(paired_preprocessing(&root, 3, 1, 2, &config).is_err());
        std::fs::remove_dir_all(&root).ok();
    }
}
