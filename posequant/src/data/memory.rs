use rand::{Rng, SeedableRng, rngs::StdRng};

use super::{BatchReader, CalibrationSource, IndexedReader};
use crate::{error::PipelineResult, tensor::Tensor};

/// Samples already held in memory.
#[derive(Clone, Debug, Default)]
pub struct InMemorySource {
    samples: Vec<Tensor<f32>>,
}

impl InMemorySource {
    pub fn new(samples: Vec<Tensor<f32>>) -> Self {
        Self { samples }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

impl CalibrationSource for InMemorySource {
    fn name(&self) -> String {
        format!("{} in-memory samples", self.samples.len())
    }

    fn open(&self) -> PipelineResult<Box<dyn BatchReader + '_>> {
        Ok(Box::new(IndexedReader::new(self.samples.len(), move |i| {
            self.samples.get(i).cloned()
        })))
    }
}

/// Uniform [0, 1) samples from a seeded generator, for models without a corpus.
#[derive(Clone, Debug)]
pub struct SyntheticSource {
    pub count: usize,
    pub shape: Vec<usize>,
    pub seed: u64,
}

impl SyntheticSource {
    pub fn new(count: usize, shape: Vec<usize>, seed: u64) -> Self {
        Self { count, shape, seed }
    }
}

impl CalibrationSource for SyntheticSource {
    fn name(&self) -> String {
        format!("{} synthetic samples (seed {})", self.count, self.seed)
    }

    fn open(&self) -> PipelineResult<Box<dyn BatchReader + '_>> {
        let mut rng = StdRng::seed_from_u64(self.seed);
        let len: usize = self.shape.iter().product();
        Ok(Box::new(IndexedReader::new(self.count, move |_| {
            let data = (0..len).map(|_| rng.gen::<f32>()).collect();
            Some(Tensor::new(self.shape.clone(), data))
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_memory_batches() {
        let source = InMemorySource::new((0..5).map(|i| Tensor::new(vec![1], vec![i as f32])).collect());
        let mut reader = source.open().unwrap();
        assert_eq!(reader.next_batch(2).unwrap().len(), 2);
        assert_eq!(reader.next_batch(2).unwrap().len(), 2);
        let last = reader.next_batch(2).unwrap();
        assert_eq!(last[0].get_data(), &[4.0]);
        assert!(reader.next_batch(2).is_none());
    }

    #[test]
    fn test_synthetic_is_reproducible() {
        let source = SyntheticSource::new(3, vec![1, 3, 2, 2], 7);
        let first = source.open().unwrap().next_batch(3).unwrap();
        let again = source.open().unwrap().next_batch(3).unwrap();
        assert_eq!(first, again);
        assert_ne!(first[0], first[1]);
        assert!(first.iter().flat_map(|t| t.get_data()).all(|v| (0.0..1.0).contains(v)));
    }
}
