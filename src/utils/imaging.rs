//! Writing scans and progress panels as PNG

use std::path::Path;

use image::{GrayImage, Luma};
use ndarray::Array2;

use super::ensure_parent_dir;
use crate::data::normalize_image;
use crate::{Result, SsmError};

const PANEL_GAP: u32 = 2;

/// Convert `[0, 1]` values to an 8-bit image; out-of-range values are clamped
pub fn to_gray_image(image: &Array2<f32>) -> GrayImage {
    let (height, width) = image.dim();
    GrayImage::from_fn(width as u32, height as u32, |x, y| {
        let v = image[[y as usize, x as usize]];
        Luma([(v.clamp(0.0, 1.0) * 255.0).round() as u8])
    })
}

/// Save a `[0, 1]` image as grayscale
pub fn save_grayscale(image: &Array2<f32>, path: &Path) -> Result<()> {
    ensure_parent_dir(path)?;
    to_gray_image(image).save(path)?;
    Ok(())
}

/// Side-by-side panel of equally sized images, each min–max normalised
pub fn panel_image(images: &[&Array2<f32>]) -> Result<GrayImage> {
    let (height, width) = match images.first() {
        Some(first) => first.dim(),
        None => return Err(SsmError::Shape("panel needs at least one image".to_string())),
    };
    if images.iter().any(|img| img.dim() != (height, width)) {
        return Err(SsmError::Shape("panel images must share one size".to_string()));
    }

    let (h, w) = (height as u32, width as u32);
    let n = images.len() as u32;
    let mut panel = GrayImage::from_pixel(n * w + (n - 1) * PANEL_GAP, h, Luma([255]));
    for (i, img) in images.iter().enumerate() {
        let tile = to_gray_image(&normalize_image(img));
        image::imageops::replace(&mut panel, &tile, (i as u32 * (w + PANEL_GAP)) as i64, 0);
    }
    Ok(panel)
}

/// Write an input | target | flow | noise panel
pub fn save_progress_panel(
    input: &Array2<f32>,
    target: &Array2<f32>,
    flow: &Array2<f32>,
    noise: &Array2<f32>,
    path: &Path,
) -> Result<()> {
    ensure_parent_dir(path)?;
    panel_image(&[input, target, flow, noise])?.save(path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_gray_image_clamps() {
        let img = Array2::from_shape_vec((1, 3), vec![-1.0, 0.5, 2.0]).unwrap();
        let gray = to_gray_image(&img);
        assert_eq!(gray.dimensions(), (3, 1));
        assert_eq!(gray.get_pixel(0, 0)[0], 0);
        assert_eq!(gray.get_pixel(1, 0)[0], 128);
        assert_eq!(gray.get_pixel(2, 0)[0], 255);
    }

    #[test]
    fn test_panel_layout() {
        let a = Array2::from_shape_fn((4, 5), |(r, c)| (r + c) as f32);
        let b = Array2::zeros((4, 5));
        let panel = panel_image(&[&a, &b, &a]).unwrap();
        assert_eq!(panel.dimensions(), (3 * 5 + 2 * PANEL_GAP, 4));
        // Gap column stays white, constant tile is black
        assert_eq!(panel.get_pixel(5, 0)[0], 255);
        assert_eq!(panel.get_pixel(8, 2)[0], 0);

        assert!(panel_image(&[]).is_err());
        assert!(panel_image(&[&a, &Array2::zeros((4, 4))]).is_err());
    }
}
