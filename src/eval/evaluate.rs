//! Baseline and model evaluation on averaged SD-OCT scans

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::Path;

use image::imageops::{self, FilterType};
use image::{ImageBuffer, Luma};
use log::info;
use ndarray::{s, Array2, Array4};
use serde::{Deserialize, Serialize};

use super::metrics::{compute_metrics, ImageMetrics};
use crate::data::{normalize_image, PatchConfig};
use crate::nn::SeparationNet;
use crate::utils::save_json;
use crate::{Result, SsmError};

/// Bilinear resize of a float image to `(height, width)`
pub fn resize_image(image: &Array2<f32>, height: usize, width: usize) -> Result<Array2<f32>> {
    let (h, w) = image.dim();
    if (h, w) == (height, width) {
        return Ok(image.clone());
    }
    let buffer: ImageBuffer<Luma<f32>, Vec<f32>> =
        ImageBuffer::from_raw(w as u32, h as u32, image.iter().copied().collect())
            .ok_or_else(|| SsmError::Shape(format!("cannot wrap a {}x{} image", h, w)))?;
    let resized = imageops::resize(&buffer, width as u32, height as u32, FilterType::Triangle);
    Array2::from_shape_vec((height, width), resized.into_raw()).map_err(|e| SsmError::Shape(e.to_string()))
}

/// Resize both images to `size x size` (when given) and min–max normalise them
pub fn normalise_sample(
    raw: &Array2<f32>,
    reference: &Array2<f32>,
    size: Option<usize>,
) -> Result<(Array2<f32>, Array2<f32>)> {
    let (raw, reference) = match size {
        Some(s) => (resize_image(raw, s, s)?, resize_image(reference, s, s)?),
        None => (raw.clone(), reference.clone()),
    };
    if raw.dim() != reference.dim() {
        return Err(SsmError::Shape(format!(
            "raw {:?} and reference {:?} differ; set an image size",
            raw.dim(),
            reference.dim()
        )));
    }
    Ok((normalize_image(&raw), normalize_image(&reference)))
}

/// Metrics of the unprocessed scan
pub fn evaluate_baseline(raw: &Array2<f32>, reference: &Array2<f32>, roi_size: usize) -> Result<ImageMetrics> {
    compute_metrics(raw, reference, roi_size)
}

/// Denoise with the model's flow component and measure it
pub fn evaluate_model(
    model: &SeparationNet,
    raw: &Array2<f32>,
    reference: &Array2<f32>,
    patch: Option<&PatchConfig>,
    roi_size: usize,
) -> Result<(ImageMetrics, Array2<f32>)> {
    let (h, w) = raw.dim();
    let input = raw.clone().into_shape_with_order((1, 1, h, w)).map_err(|e| SsmError::Shape(e.to_string()))?;
    let output = match patch {
        Some(patch) => model.forward_patched(&input, patch)?,
        None => model.forward(&input)?,
    };
    let denoised = flow_image(&output.flow);
    let metrics = compute_metrics(&denoised, reference, roi_size)?;
    Ok((metrics, denoised))
}

fn flow_image(flow: &Array4<f32>) -> Array2<f32> {
    flow.slice(s![0, 0, .., ..]).to_owned()
}

/// Mean and population standard deviation of one metric
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct MetricSummary {
    /// Mean
    #[serde(with = "super::metrics::float_repr")]
    pub mean: f32,
    /// Standard deviation
    #[serde(with = "super::metrics::float_repr")]
    pub std: f32,
}

impl MetricSummary {
    /// Summarise a set of values
    pub fn from_values(values: &[f32]) -> Self {
        if values.is_empty() {
            return MetricSummary { mean: 0.0, std: 0.0 };
        }
        let n = values.len() as f32;
        let mean = values.iter().sum::<f32>() / n;
        // Identical values, infinite ones included, have no spread
        if values.iter().all(|&v| v == values[0]) {
            return MetricSummary { mean, std: 0.0 };
        }
        let var = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / n;
        MetricSummary { mean, std: var.sqrt() }
    }
}

/// Per-metric summaries of a list of measurements
pub fn summarise(metrics: &[ImageMetrics]) -> BTreeMap<String, MetricSummary> {
    let mut columns: BTreeMap<&'static str, Vec<f32>> = BTreeMap::new();
    for m in metrics {
        for (name, value) in m.values() {
            columns.entry(name).or_default().push(value);
        }
    }
    columns
        .into_iter()
        .map(|(name, values)| (name.to_string(), MetricSummary::from_values(&values)))
        .collect()
}

const METRIC_ORDER: [&str; 5] = ["psnr", "ssim", "cnr", "enl", "mse"];

/// Table of one measurement per method; logged and returned
pub fn display_metrics(metrics: &BTreeMap<String, ImageMetrics>) -> String {
    let mut table = format!("{:<12}", "method");
    for name in METRIC_ORDER {
        let _ = write!(table, "{:>12}", name);
    }
    for (method, m) in metrics {
        let _ = write!(table, "\n{:<12}", method);
        for (_, value) in m.values() {
            let _ = write!(table, "{:>12.4}", value);
        }
    }
    info!("\n{}", table);
    table
}

/// Table of mean ± std per method over many images; logged and returned
pub fn display_grouped_metrics(groups: &BTreeMap<String, Vec<ImageMetrics>>) -> String {
    let mut table = format!("{:<12}", "method");
    for name in METRIC_ORDER {
        let _ = write!(table, "{:>20}", name);
    }
    for (method, metrics) in groups {
        let summary = summarise(metrics);
        let _ = write!(table, "\n{:<12}", method);
        for name in METRIC_ORDER {
            let cell = summary
                .get(name)
                .map(|s| format!("{:.4} ± {:.4}", s.mean, s.std))
                .unwrap_or_default();
            let _ = write!(table, "{:>20}", cell);
        }
    }
    info!("\n{}", table);
    table
}

/// Result of an evaluation run
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EvaluationReport {
    /// Run label, e.g. `patient_count/4_patients`
    pub ablation: String,
    /// Checkpoint the model came from
    pub checkpoint: Option<String>,
    /// Metrics per subject and method
    pub subjects: BTreeMap<String, BTreeMap<String, ImageMetrics>>,
    /// Summary per method and metric
    pub summary: BTreeMap<String, BTreeMap<String, MetricSummary>>,
}

impl EvaluationReport {
    /// Add one subject's measurements
    pub fn insert(&mut self, subject: &str, method: &str, metrics: ImageMetrics) {
        self.subjects
            .entry(subject.to_string())
            .or_default()
            .insert(method.to_string(), metrics);
    }

    /// Measurements grouped by method
    pub fn grouped(&self) -> BTreeMap<String, Vec<ImageMetrics>> {
        let mut groups: BTreeMap<String, Vec<ImageMetrics>> = BTreeMap::new();
        for methods in self.subjects.values() {
            for (method, metrics) in methods {
                groups.entry(method.clone()).or_default().push(*metrics);
            }
        }
        groups
    }

    /// Recompute the per-method summaries
    pub fn finalise(&mut self) {
        self.summary = self
            .grouped()
            .iter()
            .map(|(method, metrics)| (method.clone(), summarise(metrics)))
            .collect();
    }

    /// Write as JSON
    pub fn save(&self, path: &Path) -> Result<()> {
        save_json(self, path)?;
        info!("Evaluation report saved to {}", path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::Architecture;

    fn phantom() -> Array2<f32> {
        Array2::from_shape_fn((32, 32), |(r, c)| if (8..24).contains(&r) { 0.8 + 0.01 * (c % 3) as f32 } else { 0.1 })
    }

    #[test]
    fn test_resize_and_normalise() {
        let raw = Array2::from_shape_fn((10, 20), |(r, c)| (r + c) as f32);
        let resized = resize_image(&raw, 5, 8).unwrap();
        assert_eq!(resized.dim(), (5, 8));

        let (a, b) = normalise_sample(&raw, &raw, Some(16)).unwrap();
        assert_eq!(a.dim(), (16, 16));
        assert_eq!(a, b);
        let max = a.iter().cloned().fold(f32::MIN, f32::max);
        assert!((max - 1.0).abs() < 1e-6);

        assert!(normalise_sample(&raw, &Array2::zeros((4, 4)), None).is_err());
    }

    #[test]
    fn test_summary_statistics() {
        let summary = MetricSummary::from_values(&[1.0, 3.0]);
        assert_eq!(summary, MetricSummary { mean: 2.0, std: 1.0 });
        assert_eq!(MetricSummary::from_values(&[]).mean, 0.0);
    }

    #[test]
    fn test_evaluate_model_and_baseline() {
        let reference = phantom();
        let raw = reference.mapv(|v| (v * 1.2).min(1.0));
        let baseline = evaluate_baseline(&raw, &reference, 8).unwrap();
        assert!(baseline.psnr.is_finite());

        let model = SeparationNet::new(Architecture::Simple, 2, 0).unwrap();
        let patch = PatchConfig::new(16);
        let (metrics, denoised) = evaluate_model(&model, &raw, &reference, Some(&patch), 8).unwrap();
        assert_eq!(denoised.dim(), (32, 32));
        assert!(metrics.ssim.is_finite());
    }

    #[test]
    fn test_report_with_identical_images_reloads() {
        let reference = phantom();
        let metrics = compute_metrics(&reference, &reference, 8).unwrap();
        assert_eq!(metrics.psnr, f32::INFINITY);

        let mut report = EvaluationReport::default();
        report.insert("s1", "baseline", metrics);
        report.insert("s2", "baseline", metrics);
        report.finalise();
        assert_eq!(report.summary["baseline"]["psnr"], MetricSummary { mean: f32::INFINITY, std: 0.0 });

        let path = std::env::temp_dir().join(format!("oct_ssm_report_inf_{}.json", std::process::id()));
        report.save(&path).unwrap();
        let loaded: EvaluationReport = crate::utils::load_json(&path).unwrap();
        assert_eq!(loaded.subjects["s1"]["baseline"].psnr, f32::INFINITY);
        assert_eq!(loaded, report);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_report_grouping() {
        let m = |psnr| ImageMetrics { psnr, ssim: 0.5, cnr: 1.0, enl: 2.0, mse: 0.01 };
        let mut report = EvaluationReport {
            ablation: "patient_count/2_patients".to_string(),
            ..Default::default()
        };
        report.insert("s1", "baseline", m(20.0));
        report.insert("s2", "baseline", m(22.0));
        report.insert("s1", "ssm", m(25.0));
        report.finalise();

        assert_eq!(report.grouped()["baseline"].len(), 2);
        assert_eq!(report.summary["baseline"]["psnr"].mean, 21.0);
        assert_eq!(report.summary["ssm"]["psnr"].std, 0.0);

        let table = display_grouped_metrics(&report.grouped());
        assert!(table.contains("baseline"));
        assert!(table.contains("21.0000 ± 1.0000"));
        assert!(display_metrics(&report.subjects["s1"]).contains("ssm"));

        let path = std::env::temp_dir().join(format!("oct_ssm_report_{}.json", std::process::id()));
        report.save(&path).unwrap();
        let loaded: EvaluationReport = crate::utils::load_json(&path).unwrap();
        assert_eq!(loaded, report);
        std::fs::remove_file(&path).ok();
    }
}
