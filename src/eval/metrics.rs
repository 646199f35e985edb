//! Image-quality metrics against averaged references
//!
//! PSNR and SSIM compare a denoised scan with its registered average. CNR and
//! ENL are measured on the scan alone, inside regions picked from the
//! reference: the brightest block stands in for tissue and the darkest for
//! background.

use ndarray::{s, Array2, ArrayView2, Zip};
use serde::{Deserialize, Serialize};

use crate::{Result, SsmError};

const SSIM_WINDOW: usize = 11;
const SSIM_SIGMA: f32 = 1.5;
const SSIM_K1: f32 = 0.01;
const SSIM_K2: f32 = 0.03;

fn check_same_shape(image: &Array2<f32>, reference: &Array2<f32>) -> Result<()> {
    if image.dim() != reference.dim() {
        return Err(SsmError::Shape(format!(
            "image {:?} and reference {:?} differ",
            image.dim(),
            reference.dim()
        )));
    }
    if image.is_empty() {
        return Err(SsmError::Shape("metrics of an empty image".to_string()));
    }
    Ok(())
}

/// Mean and population variance, accumulated in f64.
///
/// Variance below f32 resolution of the mean is reported as exactly zero.
fn mean_var(values: ArrayView2<f32>) -> (f32, f32) {
    let n = values.len().max(1) as f64;
    let mean = values.fold(0.0f64, |acc, &v| acc + v as f64) / n;
    let var = values.fold(0.0f64, |acc, &v| {
        let d = v as f64 - mean;
        acc + d * d
    }) / n;
    let floor = f64::from(f32::EPSILON) * mean * mean;
    let var = if var <= floor { 0.0 } else { var };
    (mean as f32, var as f32)
}

/// Mean squared error
pub fn mse(image: &Array2<f32>, reference: &Array2<f32>) -> Result<f32> {
    check_same_shape(image, reference)?;
    let sum = Zip::from(image)
        .and(reference)
        .fold(0.0f32, |acc, &a, &b| acc + (a - b) * (a - b));
    Ok(sum / image.len() as f32)
}

/// Peak signal-to-noise ratio in dB; infinite for identical images
pub fn psnr(image: &Array2<f32>, reference: &Array2<f32>, data_range: f32) -> Result<f32> {
    let err = mse(image, reference)?;
    if err == 0.0 {
        return Ok(f32::INFINITY);
    }
    Ok(10.0 * (data_range * data_range / err).log10())
}

fn gaussian_kernel(size: usize, sigma: f32) -> Vec<f32> {
    let centre = (size / 2) as f32;
    let weights: Vec<f32> = (0..size)
        .map(|i| {
            let d = i as f32 - centre;
            (-d * d / (2.0 * sigma * sigma)).exp()
        })
        .collect();
    let total: f32 = weights.iter().sum();
    weights.into_iter().map(|w| w / total).collect()
}

/// Separable filter over the region where the window fits entirely
fn filter_valid(image: &Array2<f32>, kernel: &[f32]) -> Array2<f32> {
    let (h, w) = image.dim();
    let n = kernel.len();
    let rows = Array2::from_shape_fn((h, w + 1 - n), |(r, c)| {
        kernel.iter().enumerate().map(|(i, k)| k * image[[r, c + i]]).sum::<f32>()
    });
    Array2::from_shape_fn((h + 1 - n, w + 1 - n), |(r, c)| {
        kernel.iter().enumerate().map(|(i, k)| k * rows[[r + i, c]]).sum::<f32>()
    })
}

/// Structural similarity with an 11-tap Gaussian window (σ = 1.5).
///
/// Images narrower than the window use the largest odd window that fits.
pub fn ssim(image: &Array2<f32>, reference: &Array2<f32>, data_range: f32) -> Result<f32> {
    check_same_shape(image, reference)?;
    let (h, w) = image.dim();
    let mut window = SSIM_WINDOW.min(h).min(w);
    if window % 2 == 0 {
        window -= 1;
    }
    let kernel = gaussian_kernel(window, SSIM_SIGMA);

    let mu_x = filter_valid(image, &kernel);
    let mu_y = filter_valid(reference, &kernel);
    let xx = filter_valid(&(image * image), &kernel);
    let yy = filter_valid(&(reference * reference), &kernel);
    let xy = filter_valid(&(image * reference), &kernel);

    let c1 = (SSIM_K1 * data_range).powi(2);
    let c2 = (SSIM_K2 * data_range).powi(2);

    let mut total = 0.0f32;
    Zip::from(&mu_x)
        .and(&mu_y)
        .and(&xx)
        .and(&yy)
        .and(&xy)
        .for_each(|&mx, &my, &sxx, &syy, &sxy| {
            let var_x = sxx - mx * mx;
            let var_y = syy - my * my;
            let cov = sxy - mx * my;
            total += ((2.0 * mx * my + c1) * (2.0 * cov + c2))
                / ((mx * mx + my * my + c1) * (var_x + var_y + c2));
        });
    Ok(total / mu_x.len() as f32)
}

/// Square region of interest
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Roi {
    /// Top row
    pub row: usize,
    /// Left column
    pub col: usize,
    /// Side length
    pub size: usize,
}

impl Roi {
    /// Borrow the region from an image
    pub fn view<'a>(&self, image: &'a Array2<f32>) -> Result<ArrayView2<'a, f32>> {
        let (h, w) = image.dim();
        if self.size == 0 || self.row + self.size > h || self.col + self.size > w {
            return Err(SsmError::Shape(format!("{:?} does not fit in a {}x{} image", self, h, w)));
        }
        Ok(image.slice(s![self.row..self.row + self.size, self.col..self.col + self.size]))
    }
}

/// Contrast-to-noise ratio between a signal and a background region
pub fn cnr(image: &Array2<f32>, signal: &Roi, background: &Roi) -> Result<f32> {
    let (mu_s, var_s) = mean_var(signal.view(image)?);
    let (mu_b, var_b) = mean_var(background.view(image)?);
    let contrast = (mu_s - mu_b).abs();
    let noise = (var_s + var_b).sqrt();
    if noise == 0.0 {
        return Ok(if contrast == 0.0 { 0.0 } else { f32::INFINITY });
    }
    Ok(contrast / noise)
}

/// Equivalent number of looks inside a homogeneous region
pub fn enl(image: &Array2<f32>, roi: &Roi) -> Result<f32> {
    let (mu, var) = mean_var(roi.view(image)?);
    if var == 0.0 {
        return Ok(f32::INFINITY);
    }
    Ok(mu * mu / var)
}

/// Brightest and darkest `size`-blocks of the reference on a non-overlapping grid
pub fn auto_rois(reference: &Array2<f32>, size: usize) -> Result<(Roi, Roi)> {
    let (h, w) = reference.dim();
    if size == 0 || h < size || w < size || (h / size) * (w / size) < 2 {
        return Err(SsmError::Shape(format!(
            "a {}x{} image holds fewer than two {}x{} regions",
            h, w, size, size
        )));
    }

    let mut brightest: Option<(f32, Roi)> = None;
    let mut darkest: Option<(f32, Roi)> = None;
    for row in (0..=h - size).step_by(size) {
        for col in (0..=w - size).step_by(size) {
            let roi = Roi { row, col, size };
            let (mean, _) = mean_var(roi.view(reference)?);
            if brightest.map_or(true, |(best, _)| mean > best) {
                brightest = Some((mean, roi));
            }
            if darkest.map_or(true, |(best, _)| mean < best) {
                darkest = Some((mean, roi));
            }
        }
    }

    match (brightest, darkest) {
        (Some((_, signal)), Some((_, background))) if signal != background => Ok((signal, background)),
        _ => Err(SsmError::Shape("reference is flat, no contrasting regions".to_string())),
    }
}

/// JSON form of an `f32` that may be infinite or NaN.
///
/// JSON has no literal for either, so they are written as the strings
/// `"inf"`, `"-inf"` and `"nan"`; finite values stay numbers.
pub(crate) mod float_repr {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Number(f32),
        Text(String),
    }

    pub fn serialize<S: Serializer>(value: &f32, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        if value.is_finite() {
            serializer.serialize_f32(*value)
        } else if value.is_nan() {
            serializer.serialize_str("nan")
        } else if *value > 0.0 {
            serializer.serialize_str("inf")
        } else {
            serializer.serialize_str("-inf")
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<f32, D::Error> {
        match Repr::deserialize(deserializer)? {
            Repr::Number(value) => Ok(value),
            Repr::Text(text) => match text.as_str() {
                "inf" => Ok(f32::INFINITY),
                "-inf" => Ok(f32::NEG_INFINITY),
                "nan" => Ok(f32::NAN),
                other => Err(D::Error::custom(format!("invalid metric value '{}'", other))),
            },
        }
    }
}

/// Metrics of one image
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ImageMetrics {
    /// Peak signal-to-noise ratio (dB)
    #[serde(with = "float_repr")]
    pub psnr: f32,
    /// Structural similarity
    #[serde(with = "float_repr")]
    pub ssim: f32,
    /// Contrast-to-noise ratio
    #[serde(with = "float_repr")]
    pub cnr: f32,
    /// Equivalent number of looks
    #[serde(with = "float_repr")]
    pub enl: f32,
    /// Mean squared error
    #[serde(with = "float_repr")]
    pub mse: f32,
}

impl ImageMetrics {
    /// `(name, value)` pairs in display order
    pub fn values(&self) -> [(&'static str, f32); 5] {
        [
            ("psnr", self.psnr),
            ("ssim", self.ssim),
            ("cnr", self.cnr),
            ("enl", self.enl),
            ("mse", self.mse),
        ]
    }
}

/// All metrics of `image` against `reference`, both in `[0, 1]`
pub fn compute_metrics(image: &Array2<f32>, reference: &Array2<f32>, roi_size: usize) -> Result<ImageMetrics> {
    let (signal, background) = auto_rois(reference, roi_size)?;
    Ok(ImageMetrics {
        psnr: psnr(image, reference, 1.0)?,
        ssim: ssim(image, reference, 1.0)?,
        cnr: cnr(image, &signal, &background)?,
        enl: enl(image, &signal)?,
        mse: mse(image, reference)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn noisy(shape: (usize, usize), seed: u64) -> Array2<f32> {
        let mut rng = StdRng::seed_from_u64(seed);
        Array2::from_shape_fn(shape, |_| rng.gen_range(0.0..1.0))
    }

    #[test]
    fn test_psnr() {
        let image = Array2::from_elem((8, 8), 0.5);
        let reference = Array2::from_elem((8, 8), 0.6);
        assert!((psnr(&image, &reference, 1.0).unwrap() - 20.0).abs() < 1e-3);
        assert_eq!(psnr(&image, &image, 1.0).unwrap(), f32::INFINITY);
        assert!(psnr(&image, &Array2::zeros((8, 9)), 1.0).is_err());
    }

    #[test]
    fn test_ssim() {
        let reference = noisy((32, 32), 1);
        assert!((ssim(&reference, &reference, 1.0).unwrap() - 1.0).abs() < 1e-5);

        let slightly = &reference * 0.9 + 0.05;
        let very = noisy((32, 32), 2);
        let close = ssim(&slightly, &reference, 1.0).unwrap();
        let far = ssim(&very, &reference, 1.0).unwrap();
        assert!(close > far, "{} <= {}", close, far);
        assert!(far < 0.5);

        // Smaller than the window still works
        let tiny = noisy((6, 7), 3);
        assert!((ssim(&tiny, &tiny, 1.0).unwrap() - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_cnr_and_enl() {
        let mut image = Array2::<f32>::zeros((4, 8));
        image.slice_mut(s![.., ..4]).assign(&Array2::from_shape_fn((4, 4), |(r, _)| 0.8 + 0.1 * (r % 2) as f32));
        image.slice_mut(s![.., 4..]).assign(&Array2::from_shape_fn((4, 4), |(r, _)| 0.1 * (r % 2) as f32));
        let signal = Roi { row: 0, col: 0, size: 4 };
        let background = Roi { row: 0, col: 4, size: 4 };

        // Means 0.85 and 0.05, each with variance 0.0025
        let expected_cnr = 0.8 / (0.005f32).sqrt();
        assert!((cnr(&image, &signal, &background).unwrap() - expected_cnr).abs() < 1e-3);
        assert!((enl(&image, &signal).unwrap() - 0.85 * 0.85 / 0.0025).abs() < 0.5);

        assert!(enl(&image, &Roi { row: 2, col: 6, size: 4 }).is_err());
    }

    #[test]
    fn test_flat_regions_are_infinite() {
        let mut image = Array2::from_elem((8, 16), 0.9f32);
        image.slice_mut(s![.., 8..]).fill(0.1);
        let signal = Roi { row: 0, col: 0, size: 8 };
        let background = Roi { row: 0, col: 8, size: 8 };

        assert_eq!(mean_var(signal.view(&image).unwrap()).1, 0.0);
        assert_eq!(enl(&image, &signal).unwrap(), f32::INFINITY);
        assert_eq!(cnr(&image, &signal, &background).unwrap(), f32::INFINITY);
        assert_eq!(cnr(&image, &signal, &signal).unwrap(), 0.0);
    }

    #[test]
    fn test_non_finite_metrics_serialise() {
        let metrics = ImageMetrics {
            psnr: f32::INFINITY,
            ssim: 1.0,
            cnr: f32::NEG_INFINITY,
            enl: f32::NAN,
            mse: 0.0,
        };
        let json = serde_json::to_string(&metrics).unwrap();
        assert!(json.contains("\"psnr\":\"inf\""));
        assert!(json.contains("\"ssim\":1.0"));

        let loaded: ImageMetrics = serde_json::from_str(&json).unwrap();
        assert_eq!(loaded.psnr, f32::INFINITY);
        assert_eq!(loaded.cnr, f32::NEG_INFINITY);
        assert!(loaded.enl.is_nan());
        assert_eq!(loaded.ssim, 1.0);

        let bad = json.replace("\"inf\"", "\"huge\"");
        assert!(serde_json::from_str::<ImageMetrics>(&bad).is_err());
    }

    #[test]
    fn test_auto_rois() {
        let mut reference = Array2::from_elem((40, 40), 0.2);
        reference.slice_mut(s![20.., 20..]).fill(1.0);
        reference.slice_mut(s![..20, 20..]).fill(0.05);
        let (signal, background) = auto_rois(&reference, 20).unwrap();
        assert_eq!(signal, Roi { row: 20, col: 20, size: 20 });
        assert_eq!(background, Roi { row: 0, col: 20, size: 20 });

        assert!(auto_rois(&Array2::from_elem((40, 40), 0.3), 20).is_err());
        assert!(auto_rois(&reference, 30).is_err());
    }

    #[test]
    fn test_compute_metrics_prefers_closer_image() {
        let mut reference = Array2::from_elem((32, 32), 0.1);
        reference.slice_mut(s![8..24, 8..24]).fill(0.9);
        let noise = noisy((32, 32), 4);
        let mild = &reference + &(noise.mapv(|v| (v - 0.5) * 0.1));
        let heavy = &reference + &(noise.mapv(|v| (v - 0.5) * 0.8));

        let mild_metrics = compute_metrics(&mild, &reference, 8).unwrap();
        let heavy_metrics = compute_metrics(&heavy, &reference, 8).unwrap();
        assert!(mild_metrics.psnr > heavy_metrics.psnr);
        assert!(mild_metrics.ssim > heavy_metrics.ssim);
        assert!(mild_metrics.cnr > heavy_metrics.cnr);
        assert!(mild_metrics.enl > heavy_metrics.enl);
    }
}
