//! Multi-band raster stacks used as training and validation sources.
//!
//! A stack holds every band of every image of a source list as one
//! `bands x rows x cols` array. Sources are "patches images": samples are
//! laid out vertically, one patch footprint per sample.

use std::fmt;
use std::ops::Range;
use std::path::{Path, PathBuf};

use image::DynamicImage;
use ndarray::{Array3, Array4, ArrayView3, Axis, s};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod patches;

pub use patches::{BatchPlan, common_sample_count};

/// Errors raised while loading or sampling raster stacks.
#[derive(Debug, Error)]
pub enum RasterError {
    #[error("No image given for the raster stack")]
    EmptyList,
    #[error("Failed to read image {path}: {source}")]
    Decode {
        path: PathBuf,
        source: image::ImageError,
    },
    #[error("Unsupported pixel layout in {path}")]
    UnsupportedPixelType { path: PathBuf },
    #[error("Image {path} is {width}x{height}, expected {expected_width}x{expected_height}")]
    SizeMismatch {
        path: PathBuf,
        width: usize,
        height: usize,
        expected_width: usize,
        expected_height: usize,
    },
    #[error("Raster is {cols} columns wide but patches of {patch} need {} columns", .patch.width)]
    PatchWidthMismatch { cols: usize, patch: PatchSize },
    #[error("Raster has {rows} rows, which is not a multiple of the patch height of {patch}")]
    PatchHeightMismatch { rows: usize, patch: PatchSize },
    #[error("Source \"{name}\" holds {count} samples, expected {expected}")]
    SampleCountMismatch {
        name: String,
        count: usize,
        expected: usize,
    },
    #[error("Bound sources hold no samples")]
    NoSamples,
    #[error("Invalid raster shape: {0}")]
    Shape(#[from] ndarray::ShapeError),
}

/// Patch footprint of a source, in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PatchSize {
    pub width: usize,
    pub height: usize,
}

impl PatchSize {
    pub fn new(width: usize, height: usize) -> Self {
        Self { width, height }
    }

    /// Number of pixels covered by one patch.
    pub fn pixels(&self) -> usize {
        self.width * self.height
    }
}

impl fmt::Display for PatchSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.width, self.height)
    }
}

/// Loads raster stacks from a list of image paths.
pub trait RasterLoader {
    fn load(&self, paths: &[PathBuf]) -> Result<RasterStack, RasterError>;
}

/// Loader decoding images from disk.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageLoader;

impl RasterLoader for ImageLoader {
    fn load(&self, paths: &[PathBuf]) -> Result<RasterStack, RasterError> {
        RasterStack::load(paths)
    }
}

/// In-memory multi-band raster (`bands x rows x cols`).
#[derive(Debug, Clone, PartialEq)]
pub struct RasterStack {
    data: Array3<f32>,
}

impl RasterStack {
    pub fn from_array(data: Array3<f32>) -> Self {
        Self { data }
    }

    /// Build a patches image from per-sample values laid out `rows x cols x bands`.
    pub fn from_samples(
        bands: usize,
        patch: PatchSize,
        samples: &[Vec<f32>],
    ) -> Result<Self, RasterError> {
        let rows = patch.height * samples.len();
        let mut data = Array3::<f32>::zeros((bands, rows, patch.width));
        for (index, sample) in samples.iter().enumerate() {
            let view =
                ArrayView3::from_shape((patch.height, patch.width, bands), sample.as_slice())?;
            let rows = index * patch.height..(index + 1) * patch.height;
            data.slice_mut(s![.., rows, ..])
                .assign(&view.permuted_axes([2, 0, 1]));
        }
        Ok(Self { data })
    }

    /// Decode every image and stack their bands in list order.
    pub fn load<P: AsRef<Path>>(paths: &[P]) -> Result<Self, RasterError> {
        if paths.is_empty() {
            return Err(RasterError::EmptyList);
        }
        let mut layers: Vec<Array3<f32>> = Vec::with_capacity(paths.len());
        for path in paths {
            let layer = decode_bands(path.as_ref())?;
            if let Some(first) = layers.first() {
                let (_, rows, cols) = first.dim();
                let (_, height, width) = layer.dim();
                if rows != height || cols != width {
                    return Err(RasterError::SizeMismatch {
                        path: path.as_ref().to_path_buf(),
                        width,
                        height,
                        expected_width: cols,
                        expected_height: rows,
                    });
                }
            }
            layers.push(layer);
        }
        let views: Vec<_> = layers.iter().map(|layer| layer.view()).collect();
        let data = ndarray::concatenate(Axis(0), &views)?;
        tracing::debug!(
            "Loaded raster stack of {} bands, {}x{} pixels",
            data.dim().0,
            data.dim().2,
            data.dim().1
        );
        Ok(Self { data })
    }

    pub fn bands(&self) -> usize {
        self.data.dim().0
    }

    pub fn rows(&self) -> usize {
        self.data.dim().1
    }

    pub fn cols(&self) -> usize {
        self.data.dim().2
    }

    /// Number of samples the stack holds for a given patch footprint.
    pub fn sample_count(&self, patch: PatchSize) -> Result<usize, RasterError> {
        if self.cols() != patch.width {
            return Err(RasterError::PatchWidthMismatch {
                cols: self.cols(),
                patch,
            });
        }
        if patch.height == 0 || self.rows() % patch.height != 0 {
            return Err(RasterError::PatchHeightMismatch {
                rows: self.rows(),
                patch,
            });
        }
        Ok(self.rows() / patch.height)
    }

    /// Borrow one sample as `bands x height x width`.
    pub fn patch(&self, sample: usize, patch: PatchSize) -> ArrayView3<'_, f32> {
        let start = sample * patch.height;
        self.data.slice(s![.., start..start + patch.height, ..])
    }

    /// Copy a range of samples into a `samples x height x width x bands` tensor.
    pub fn read_batch(&self, samples: Range<usize>, patch: PatchSize) -> Array4<f32> {
        let rows = samples.start * patch.height..samples.end * patch.height;
        let window = self.data.slice(s![.., rows, ..]);
        let count = samples.len();
        let mut batch = Array4::<f32>::zeros((count, patch.height, patch.width, self.bands()));
        for (index, mut sample) in batch.outer_iter_mut().enumerate() {
            let rows = index * patch.height..(index + 1) * patch.height;
            sample.assign(&window.slice(s![.., rows, ..]).permuted_axes([1, 2, 0]));
        }
        batch
    }
}

fn decode_bands(path: &Path) -> Result<Array3<f32>, RasterError> {
    let image = image::open(path).map_err(|source| RasterError::Decode {
        path: path.to_path_buf(),
        source,
    })?;
    let width = image.width() as usize;
    let height = image.height() as usize;
    let (channels, values) = match &image {
        DynamicImage::ImageLuma8(buf) => (1, raw_to_f32(buf.as_raw().as_slice())),
        DynamicImage::ImageLumaA8(buf) => (2, raw_to_f32(buf.as_raw().as_slice())),
        DynamicImage::ImageRgb8(buf) => (3, raw_to_f32(buf.as_raw().as_slice())),
        DynamicImage::ImageRgba8(buf) => (4, raw_to_f32(buf.as_raw().as_slice())),
        DynamicImage::ImageLuma16(buf) => (1, raw_to_f32(buf.as_raw().as_slice())),
        DynamicImage::ImageLumaA16(buf) => (2, raw_to_f32(buf.as_raw().as_slice())),
        DynamicImage::ImageRgb16(buf) => (3, raw_to_f32(buf.as_raw().as_slice())),
        DynamicImage::ImageRgba16(buf) => (4, raw_to_f32(buf.as_raw().as_slice())),
        DynamicImage::ImageRgb32F(buf) => (3, buf.as_raw().clone()),
        DynamicImage::ImageRgba32F(buf) => (4, buf.as_raw().clone()),
        _ => {
            return Err(RasterError::UnsupportedPixelType {
                path: path.to_path_buf(),
            });
        }
    };
    let interleaved = Array3::from_shape_vec((height, width, channels), values)?;
    Ok(interleaved.permuted_axes([2, 0, 1]).as_standard_layout().into_owned())
}

fn raw_to_f32<T: Copy + Into<f32>>(raw: &[T]) -> Vec<f32> {
    raw.iter().map(|&value| value.into()).collect()
}
