//! Patch extraction and reconstruction
//!
//! Images are tiled into square patches for memory-bounded processing and
//! stitched back afterwards. Offsets advance by `stride` and the last offset
//! on each axis is pulled back to `dim - patch_size`, so the tiles always
//! cover the image. Pixels covered by several tiles are averaged on the way
//! back. Axes shorter than a patch are zero-padded.

use std::ops::Range;

use ndarray::{s, Array3, Array4, ArrayView4, Axis, Zip};
use serde::{Deserialize, Serialize};

use crate::{Result, SsmError};

/// Patch geometry
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "PatchConfigFields")]
pub struct PatchConfig {
    /// Side of the square patch
    pub patch_size: usize,
    /// Step between patch origins; equal to `patch_size` for a plain grid
    pub stride: usize,
    /// Patches per forward pass
    pub patch_batch_size: usize,
}

impl Default for PatchConfig {
    fn default() -> Self {
        PatchConfig {
            patch_size: 128,
            stride: 128,
            patch_batch_size: 16,
        }
    }
}

/// Deserialised form; a missing stride follows the patch size
#[derive(Deserialize)]
struct PatchConfigFields {
    patch_size: Option<usize>,
    stride: Option<usize>,
    patch_batch_size: Option<usize>,
}

impl From<PatchConfigFields> for PatchConfig {
    fn from(fields: PatchConfigFields) -> Self {
        let defaults = PatchConfig::default();
        let patch_size = fields.patch_size.unwrap_or(defaults.patch_size);
        PatchConfig {
            patch_size,
            stride: fields.stride.unwrap_or(patch_size),
            patch_batch_size: fields.patch_batch_size.unwrap_or(defaults.patch_batch_size),
        }
    }
}

impl PatchConfig {
    /// Non-overlapping grid of `patch_size` tiles
    pub fn new(patch_size: usize) -> Self {
        PatchConfig {
            patch_size,
            stride: patch_size,
            ..Default::default()
        }
    }

    /// Use overlapping tiles
    pub fn with_stride(mut self, stride: usize) -> Self {
        self.stride = stride;
        self
    }

    /// Set the number of patches per forward pass
    pub fn with_patch_batch_size(mut self, patch_batch_size: usize) -> Self {
        self.patch_batch_size = patch_batch_size;
        self
    }

    /// Check the geometry
    pub fn validate(&self) -> Result<()> {
        if self.patch_size == 0 {
            return Err(SsmError::InvalidConfig("patch_size must be positive".to_string()));
        }
        if self.stride == 0 || self.stride > self.patch_size {
            return Err(SsmError::InvalidConfig(format!(
                "stride must be in 1..={}, got {}",
                self.patch_size, self.stride
            )));
        }
        if self.patch_batch_size == 0 {
            return Err(SsmError::InvalidConfig("patch_batch_size must be positive".to_string()));
        }
        Ok(())
    }
}

/// Where a patch was taken from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchLocation {
    /// Index of the image in the batch
    pub image: usize,
    /// Top row of the patch
    pub row: usize,
    /// Left column of the patch
    pub col: usize,
}

/// Patch origins along one axis
fn axis_offsets(len: usize, patch: usize, stride: usize) -> Vec<usize> {
    if len <= patch {
        return vec![0];
    }
    let last = len - patch;
    let mut offsets: Vec<usize> = (0..=last).step_by(stride).collect();
    if offsets.last() != Some(&last) {
        offsets.push(last);
    }
    offsets
}

/// Tile a `[B, C, H, W]` batch into `[N, C, p, p]` patches
pub fn extract_patches(
    batch: &Array4<f32>,
    config: &PatchConfig,
) -> Result<(Array4<f32>, Vec<PatchLocation>)> {
    config.validate()?;
    let (images, channels, height, width) = batch.dim();
    let p = config.patch_size;
    let rows = axis_offsets(height, p, config.stride);
    let cols = axis_offsets(width, p, config.stride);

    let mut locations = Vec::with_capacity(images * rows.len() * cols.len());
    for image in 0..images {
        for &row in &rows {
            for &col in &cols {
                locations.push(PatchLocation { image, row, col });
            }
        }
    }

    let mut patches = Array4::zeros((locations.len(), channels, p, p));
    for (mut patch, loc) in patches.outer_iter_mut().zip(&locations) {
        let rh = p.min(height - loc.row);
        let cw = p.min(width - loc.col);
        patch
            .slice_mut(s![.., ..rh, ..cw])
            .assign(&batch.slice(s![loc.image, .., loc.row..loc.row + rh, loc.col..loc.col + cw]));
    }

    Ok((patches, locations))
}

/// Stitch patches back into a batch of the given `[B, C, H, W]` shape
pub fn reconstruct_from_patches(
    patches: &Array4<f32>,
    locations: &[PatchLocation],
    shape: (usize, usize, usize, usize),
    config: &PatchConfig,
) -> Result<Array4<f32>> {
    let p = config.patch_size;
    let (images, channels, height, width) = shape;
    if patches.dim().0 != locations.len() {
        return Err(SsmError::Shape(format!(
            "{} patches for {} locations",
            patches.dim().0,
            locations.len()
        )));
    }
    if patches.dim().1 != channels || patches.dim().2 != p || patches.dim().3 != p {
        return Err(SsmError::Shape(format!(
            "patches of shape {:?} cannot fill channels={} with patch_size={}",
            patches.dim(),
            channels,
            p
        )));
    }

    let mut sum = Array4::<f32>::zeros(shape);
    let mut coverage = Array3::<f32>::zeros((images, height, width));

    for (patch, loc) in patches.outer_iter().zip(locations) {
        if loc.image >= images || loc.row >= height.max(1) || loc.col >= width.max(1) {
            return Err(SsmError::Shape(format!(
                "patch location {:?} lies outside {:?}",
                loc, shape
            )));
        }
        let rh = p.min(height - loc.row);
        let cw = p.min(width - loc.col);

        let mut dest = sum.slice_mut(s![loc.image, .., loc.row..loc.row + rh, loc.col..loc.col + cw]);
        dest += &patch.slice(s![.., ..rh, ..cw]);
        let mut count = coverage.slice_mut(s![loc.image, loc.row..loc.row + rh, loc.col..loc.col + cw]);
        count += 1.0;
    }

    for c in 0..channels {
        let mut channel = sum.slice_mut(s![.., c, .., ..]);
        Zip::from(&mut channel).and(&coverage).for_each(|v, &n| {
            if n > 0.0 {
                *v /= n;
            }
        });
    }

    Ok(sum)
}

/// Index ranges of at most `chunk_size` items covering `0..len`
pub fn patch_chunks(len: usize, chunk_size: usize) -> impl Iterator<Item = Range<usize>> {
    let step = chunk_size.max(1);
    (0..len).step_by(step).map(move |start| start..(start + step).min(len))
}

/// Concatenate batches along the first axis
pub fn concat_batches(parts: &[Array4<f32>]) -> Result<Array4<f32>> {
    let views: Vec<ArrayView4<f32>> = parts.iter().map(|p| p.view()).collect();
    ndarray::concatenate(Axis(0), &views).map_err(|e| SsmError::Shape(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn ramp(shape: (usize, usize, usize, usize)) -> Array4<f32> {
        let mut i = 0.0;
        Array4::from_shape_fn(shape, |_| {
            i += 1.0;
            i
        })
    }

    fn assert_close(a: &Array4<f32>, b: &Array4<f32>) {
        assert_eq!(a.dim(), b.dim());
        for (x, y) in a.iter().zip(b.iter()) {
            assert!((x - y).abs() <= 1e-4 * x.abs().max(1.0), "{} != {}", x, y);
        }
    }

    #[test]
    fn test_axis_offsets() {
        assert_eq!(axis_offsets(256, 128, 128), vec![0, 128]);
        assert_eq!(axis_offsets(300, 128, 128), vec![0, 128, 172]);
        assert_eq!(axis_offsets(50, 128, 128), vec![0]);
        assert_eq!(axis_offsets(10, 4, 3), vec![0, 3, 6]);
    }

    #[test]
    fn test_extract_grid() {
        let batch = ramp((2, 1, 256, 256));
        let (patches, locations) = extract_patches(&batch, &PatchConfig::default()).unwrap();
        assert_eq!(patches.dim(), (8, 1, 128, 128));
        assert_eq!(locations[3], PatchLocation { image: 0, row: 128, col: 128 });
        assert_eq!(locations[4].image, 1);
        assert_eq!(patches[[1, 0, 0, 0]], batch[[0, 0, 0, 128]]);
    }

    #[test]
    fn test_roundtrip_uneven_image() {
        let batch = ramp((1, 1, 300, 200));
        let config = PatchConfig::new(128);
        let (patches, locations) = extract_patches(&batch, &config).unwrap();
        assert_eq!(locations.len(), 6);
        let rebuilt = reconstruct_from_patches(&patches, &locations, batch.dim(), &config).unwrap();
        assert_close(&rebuilt, &batch);
    }

    #[test]
    fn test_small_image_is_padded() {
        let batch = ramp((1, 1, 20, 30));
        let config = PatchConfig::new(32);
        let (patches, locations) = extract_patches(&batch, &config).unwrap();
        assert_eq!(patches.dim(), (1, 1, 32, 32));
        assert_eq!(patches[[0, 0, 25, 31]], 0.0);
        let rebuilt = reconstruct_from_patches(&patches, &locations, batch.dim(), &config).unwrap();
        assert_close(&rebuilt, &batch);
    }

    #[test]
    fn test_overlapping_patches_average() {
        let batch = Array4::ones((1, 1, 8, 8));
        let config = PatchConfig::new(4).with_stride(2);
        let (mut patches, locations) = extract_patches(&batch, &config).unwrap();
        assert_eq!(locations.len(), 9);
        // Scale one patch: overlapped pixels must come back as the mean
        patches.index_axis_mut(Axis(0), 0).fill(3.0);
        let rebuilt = reconstruct_from_patches(&patches, &locations, batch.dim(), &config).unwrap();
        assert_eq!(rebuilt[[0, 0, 0, 0]], 3.0);
        assert_eq!(rebuilt[[0, 0, 2, 0]], 2.0);
        assert_eq!(rebuilt[[0, 0, 2, 2]], 1.5);
        assert_eq!(rebuilt[[0, 0, 7, 7]], 1.0);
    }

    #[test]
    fn test_reconstruct_rejects_mismatch() {
        let batch = ramp((1, 1, 16, 16));
        let config = PatchConfig::new(8);
        let (patches, mut locations) = extract_patches(&batch, &config).unwrap();
        assert!(reconstruct_from_patches(&patches, &locations[1..], batch.dim(), &config).is_err());
        locations[0].image = 3;
        assert!(reconstruct_from_patches(&patches, &locations, batch.dim(), &config).is_err());
    }

    #[test]
    fn test_invalid_config() {
        let batch = ramp((1, 1, 8, 8));
        assert!(extract_patches(&batch, &PatchConfig::new(0)).is_err());
        assert!(extract_patches(&batch, &PatchConfig::new(4).with_stride(5)).is_err());
        assert!(extract_patches(&batch, &PatchConfig::new(4).with_patch_batch_size(0)).is_err());
    }

    #[test]
    fn test_stride_defaults_to_patch_size() {
        let config: PatchConfig = serde_json::from_str(r#"{"patch_size": 64}"#).unwrap();
        assert_eq!(config, PatchConfig::new(64));
        let config: PatchConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, PatchConfig::default());
    }

    #[test]
    fn test_patch_chunks() {
        let chunks: Vec<_> = patch_chunks(37, 16).collect();
        assert_eq!(chunks, vec![0..16, 16..32, 32..37]);
        assert_eq!(patch_chunks(0, 16).count(), 0);
    }

    proptest! {
        #[test]
        fn prop_patches_tile_without_gaps(
            images in 1usize..3,
            height in 1usize..48,
            width in 1usize..48,
            patch in 1usize..24,
            stride_frac in 0.05f64..1.0,
        ) {
            let stride = ((patch as f64 * stride_frac).ceil() as usize).clamp(1, patch);
            let config = PatchConfig::new(patch).with_stride(stride);
            let batch = ramp((images, 1, height, width));
            let (patches, locations) = extract_patches(&batch, &config).unwrap();
            prop_assert_eq!(patches.dim().0, locations.len());

            let rebuilt = reconstruct_from_patches(&patches, &locations, batch.dim(), &config).unwrap();
            for (x, y) in batch.iter().zip(rebuilt.iter()) {
                prop_assert!((x - y).abs() <= 1e-4 * x.abs().max(1.0));
            }
        }
    }
}
