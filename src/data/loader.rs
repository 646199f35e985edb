//! Batching of image pairs into `[B, 1, H, W]` tensors

use ndarray::{s, Array4};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use super::dataset::ImagePair;
use crate::{Result, SsmError};

/// One batch of inputs and targets
#[derive(Debug, Clone)]
pub struct Batch {
    /// Noisy scans `[B, 1, H, W]`
    pub inputs: Array4<f32>,
    /// Targets `[B, 1, H, W]`
    pub targets: Array4<f32>,
}

impl Batch {
    /// Number of samples in the batch
    pub fn len(&self) -> usize {
        self.inputs.dim().0
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Data loader for batching
pub struct DataLoader {
    pairs: Vec<ImagePair>,
    order: Vec<usize>,
    batch_size: usize,
    shuffle: bool,
    current_idx: usize,
    rng: StdRng,
    image_dim: (usize, usize),
}

impl DataLoader {
    /// Create a loader; all pairs must share one image size
    pub fn new(pairs: Vec<ImagePair>, batch_size: usize, shuffle: bool, seed: u64) -> Result<Self> {
        if batch_size == 0 {
            return Err(SsmError::InvalidConfig("batch_size must be positive".to_string()));
        }
        let image_dim = match pairs.first() {
            Some(pair) => pair.input.dim(),
            None => return Err(SsmError::Data("data loader needs at least one pair".to_string())),
        };
        if let Some(odd) = pairs
            .iter()
            .find(|p| p.input.dim() != image_dim || p.target.dim() != image_dim)
        {
            return Err(SsmError::Shape(format!(
                "all pairs must be {:?}, found input {:?} / target {:?} for patient {}",
                image_dim,
                odd.input.dim(),
                odd.target.dim(),
                odd.patient
            )));
        }

        let mut loader = DataLoader {
            order: (0..pairs.len()).collect(),
            pairs,
            batch_size,
            shuffle,
            current_idx: 0,
            rng: StdRng::seed_from_u64(seed),
            image_dim,
        };
        if shuffle {
            loader.shuffle_data();
        }
        Ok(loader)
    }

    fn shuffle_data(&mut self) {
        self.order.shuffle(&mut self.rng);
    }

    /// Rewind for a new epoch, reshuffling when enabled
    pub fn reset(&mut self) {
        self.current_idx = 0;
        if self.shuffle {
            self.shuffle_data();
        }
    }

    /// Get next batch
    pub fn next_batch(&mut self) -> Option<Batch> {
        if self.current_idx >= self.order.len() {
            return None;
        }

        let end_idx = (self.current_idx + self.batch_size).min(self.order.len());
        let indices = &self.order[self.current_idx..end_idx];
        let (h, w) = self.image_dim;
        let mut inputs = Array4::zeros((indices.len(), 1, h, w));
        let mut targets = Array4::zeros((indices.len(), 1, h, w));
        for (slot, &idx) in indices.iter().enumerate() {
            inputs.slice_mut(s![slot, 0, .., ..]).assign(&self.pairs[idx].input);
            targets.slice_mut(s![slot, 0, .., ..]).assign(&self.pairs[idx].target);
        }
        self.current_idx = end_idx;

        Some(Batch { inputs, targets })
    }

    /// Start a new epoch and iterate over its batches
    pub fn iter(&mut self) -> impl Iterator<Item = Batch> + '_ {
        self.reset();
        std::iter::from_fn(move || self.next_batch())
    }

    /// Get number of batches
    pub fn num_batches(&self) -> usize {
        (self.pairs.len() + self.batch_size - 1) / self.batch_size
    }

    /// Number of pairs
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Batch size
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// `(height, width)` shared by every pair
    pub fn image_dim(&self) -> (usize, usize) {
        self.image_dim
    }

    /// Pair by position in the underlying dataset
    pub fn sample(&self, idx: usize) -> Option<&ImagePair> {
        self.pairs.get(idx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    fn pairs(n: usize) -> Vec<ImagePair> {
        (0..n)
            .map(|i| ImagePair {
                patient: format!("p{}", i),
                input: Array2::from_elem((3, 4), i as f32),
                target: Array2::from_elem((3, 4), -(i as f32)),
            })
            .collect()
    }

    fn first_values(loader: &mut DataLoader) -> Vec<f32> {
        let mut values = Vec::new();
        while let Some(batch) = loader.next_batch() {
            for b in 0..batch.len() {
                values.push(batch.inputs[[b, 0, 0, 0]]);
            }
        }
        values
    }

    #[test]
    fn test_data_loader() {
        let mut loader = DataLoader::new(pairs(5), 2, false, 0).unwrap();
        assert_eq!(loader.num_batches(), 3);

        let batch1 = loader.next_batch().unwrap();
        assert_eq!(batch1.inputs.dim(), (2, 1, 3, 4));
        assert_eq!(batch1.inputs[[1, 0, 2, 3]], 1.0);
        assert_eq!(batch1.targets[[1, 0, 0, 0]], -1.0);

        assert_eq!(loader.next_batch().unwrap().len(), 2);
        let batch3 = loader.next_batch().unwrap();
        assert_eq!(batch3.len(), 1);
        assert_eq!(batch3.inputs[[0, 0, 0, 0]], 4.0);
        assert!(loader.next_batch().is_none());

        loader.reset();
        assert_eq!(first_values(&mut loader), vec![0.0, 1.0, 2.0, 3.0, 4.0]);

        let sizes: Vec<usize> = loader.iter().map(|b| b.len()).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
    }

    #[test]
    fn test_shuffle_is_seeded_permutation() {
        let mut a = DataLoader::new(pairs(20), 4, true, 7).unwrap();
        let mut b = DataLoader::new(pairs(20), 4, true, 7).unwrap();
        let order_a = first_values(&mut a);
        assert_eq!(order_a, first_values(&mut b));

        let mut sorted = order_a.clone();
        sorted.sort_by(|x, y| x.total_cmp(y));
        assert_eq!(sorted, (0..20).map(|i| i as f32).collect::<Vec<_>>());
    }

    #[test]
    fn test_rejects_bad_input() {
        assert!(DataLoader::new(Vec::new(), 2, false, 0).is_err());
        assert!(DataLoader::new(pairs(2), 0, false, 0).is_err());

        let mut mixed = pairs(2);
        mixed[1].target = Array2::zeros((3, 5));
        assert!(DataLoader::new(mixed, 2, false, 0).is_err());
    }
}
