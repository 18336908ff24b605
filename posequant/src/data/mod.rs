//! Calibration inputs. A source is opened into a reader that yields batches of
//! `[1, C, H, W]` samples; opening again restarts the sequence from the first sample.
mod image_folder;
mod memory;

use crate::{error::PipelineResult, tensor::Tensor};
pub use image_folder::{IMAGE_EXTENSIONS, ImageFolder};
pub use memory::{InMemorySource, SyntheticSource};

pub trait CalibrationSource {
    /// Short description used in logs and errors.
    fn name(&self) -> String;

    /// Start a new pass over the samples.
    fn open(&self) -> PipelineResult<Box<dyn BatchReader + '_>>;
}

pub trait BatchReader {
    /// Up to `batch_size` samples, `None` once the source is exhausted. The last batch
    /// may be short.
    fn next_batch(&mut self, batch_size: usize) -> Option<Vec<Tensor<f32>>>;
}

/// Adapter for sources that can produce sample `i` on demand.
pub(crate) struct IndexedReader<F> {
    next: usize,
    len: usize,
    produce: F,
}

impl<F> IndexedReader<F>
where
    F: FnMut(usize) -> Option<Tensor<f32>>,
{
    pub(crate) fn new(len: usize, produce: F) -> Self {
        Self { next: 0, len, produce }
    }
}

impl<F> BatchReader for IndexedReader<F>
where
    F: FnMut(usize) -> Option<Tensor<f32>>,
{
    fn next_batch(&mut self, batch_size: usize) -> Option<Vec<Tensor<f32>>> {
        let mut batch = Vec::with_capacity(batch_size);
        while batch.len() < batch_size.max(1) && self.next < self.len {
            let i = self.next;
            self.next += 1;
            // Unreadable samples are skipped by the producer.
            if let Some(sample) = (self.produce)(i) {
                batch.push(sample);
            }
        }
        (!batch.is_empty()).then_some(batch)
    }
}
