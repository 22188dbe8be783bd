use std::collections::HashMap;
use std::io;
use std::path::PathBuf;

use rastertrain::raster::{PatchSize, RasterError, RasterLoader, RasterStack};

/// Stack of 1x1 single band samples.
pub fn column(values: &[f32]) -> RasterStack {
    let samples: Vec<Vec<f32>> = values.iter().map(|&value| vec![value]).collect();
    RasterStack::from_samples(1, PatchSize::new(1, 1), &samples).unwrap()
}

/// Loader serving stacks registered by path.
#[derive(Default)]
pub struct MemoryLoader {
    stacks: HashMap<PathBuf, RasterStack>,
}

impl MemoryLoader {
    pub fn with(mut self, path: &str, stack: RasterStack) -> Self {
        self.stacks.insert(PathBuf::from(path), stack);
        self
    }
}

impl RasterLoader for MemoryLoader {
    fn load(&self, paths: &[PathBuf]) -> Result<RasterStack, RasterError> {
        let path = paths.first().ok_or(RasterError::EmptyList)?;
        self.stacks
            .get(path)
            .cloned()
            .ok_or_else(|| RasterError::Decode {
                path: path.clone(),
                source: image::ImageError::IoError(io::Error::new(
                    io::ErrorKind::NotFound,
                    "not registered",
                )),
            })
    }
}
