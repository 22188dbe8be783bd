//! Sample bookkeeping shared by every feed of a pass.

use std::ops::Range;

use super::{PatchSize, RasterError, RasterStack};

/// Check that every feed yields the same, non-zero number of samples.
pub fn common_sample_count<'a, I>(feeds: I) -> Result<usize, RasterError>
where
    I: IntoIterator<Item = (&'a str, &'a RasterStack, PatchSize)>,
{
    let mut expected: Option<usize> = None;
    for (name, stack, patch) in feeds {
        let count = stack.sample_count(patch)?;
        match expected {
            None => expected = Some(count),
            Some(expected) if expected != count => {
                return Err(RasterError::SampleCountMismatch {
                    name: name.to_string(),
                    count,
                    expected,
                });
            }
            Some(_) => {}
        }
    }
    match expected {
        Some(count) if count > 0 => Ok(count),
        _ => Err(RasterError::NoSamples),
    }
}

/// Split of a sample range into consecutive batches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchPlan {
    samples: usize,
    batch_size: usize,
}

impl BatchPlan {
    pub fn new(samples: usize, batch_size: usize) -> Self {
        Self {
            samples,
            batch_size: batch_size.max(1),
        }
    }

    pub fn samples(&self) -> usize {
        self.samples
    }

    /// Number of batches; the last one may be short.
    pub fn len(&self) -> usize {
        self.samples.div_ceil(self.batch_size)
    }

    pub fn is_empty(&self) -> bool {
        self.samples == 0
    }

    pub fn batches(&self) -> impl Iterator<Item = Range<usize>> + '_ {
        (0..self.len()).map(move |index| {
            let start = index * self.batch_size;
            start..(start + self.batch_size).min(self.samples)
        })
    }
}
