use std::fs;
use std::path::Path;

use image::imageops::FilterType;
use image::DynamicImage;
use ndarray::{Array3, Array4, ArrayView3, Axis};
use serde::{Deserialize, Serialize};

use crate::error::{HierarchyError, Result};

/// Preprocessing parameters shared between training-data preparation and inference.
///
/// Stored as `config.json` next to the data, e.g.
/// `{"target_size": [224, 224], "mean": [0.5, 0.5, 0.5], "std": [0.2, 0.2, 0.2]}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreprocessConfig {
    /// `[height, width]`
    #[serde(alias = "min_size")]
    pub target_size: [u32; 2],
    /// Per-channel RGB mean of the training images, in `[0, 1]` units
    pub mean: [f32; 3],
    /// Per-channel RGB standard deviation
    pub std: [f32; 3],
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            target_size: [224, 224],
            mean: [0.485, 0.456, 0.406],
            std: [0.229, 0.224, 0.225],
        }
    }
}

impl PreprocessConfig {
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read(path).map_err(|e| {
            HierarchyError::Config(format!("Cannot read preprocessing config {:?}: {}", path, e))
        })?;
        let config: Self = serde_json::from_slice(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        fs::write(path, serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.target_size.contains(&0) {
            return Err(HierarchyError::Config(format!(
                "Target size must be non-zero, got {:?}",
                self.target_size
            )));
        }
        if self.std.iter().any(|s| !(s.is_finite() && *s > 0.0)) {
            return Err(HierarchyError::Config(format!(
                "Channel std must be positive, got {:?}",
                self.std
            )));
        }
        if self.mean.iter().any(|m| !m.is_finite()) {
            return Err(HierarchyError::Config(format!(
                "Channel mean must be finite, got {:?}",
                self.mean
            )));
        }
        Ok(())
    }
}

/// Turns decoded images into normalized `(3, H, W)` tensors.
#[derive(Debug, Clone)]
pub struct Preprocessor {
    config: PreprocessConfig,
}

impl Preprocessor {
    pub fn new(config: PreprocessConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &PreprocessConfig {
        &self.config
    }

    /// Resizes to the target size, composites transparency over white, scales to
    /// `[0, 1]` and normalizes each channel. Output is CHW.
    pub fn apply(&self, image: &DynamicImage) -> Array3<f32> {
        let [height, width] = self.config.target_size;
        let rgba = image
            .resize_exact(width, height, FilterType::Triangle)
            .to_rgba8();

        let mut out = Array3::<f32>::zeros((3, height as usize, width as usize));
        for (x, y, pixel) in rgba.enumerate_pixels() {
            let alpha = pixel[3] as f32 / 255.0;
            for c in 0..3 {
                let value = pixel[c] as f32 / 255.0 * alpha + (1.0 - alpha);
                out[[c, y as usize, x as usize]] = (value - self.config.mean[c]) / self.config.std[c];
            }
        }
        out
    }

    pub fn load<P: AsRef<Path>>(&self, path: P) -> Result<Array3<f32>> {
        let image = image::open(path.as_ref())?;
        Ok(self.apply(&image))
    }

    /// Stacks images into an `(N, 3, H, W)` batch.
    pub fn batch(&self, images: &[DynamicImage]) -> Result<Array4<f32>> {
        let tensors: Vec<Array3<f32>> = images.iter().map(|img| self.apply(img)).collect();
        stack_images(&tensors)
    }

    pub fn load_batch<P: AsRef<Path>>(&self, paths: &[P]) -> Result<Array4<f32>> {
        let tensors = paths
            .iter()
            .map(|p| self.load(p))
            .collect::<Result<Vec<_>>>()?;
        stack_images(&tensors)
    }
}

pub(crate) fn stack_images(tensors: &[Array3<f32>]) -> Result<Array4<f32>> {
    if tensors.is_empty() {
        return Err(HierarchyError::Validation("Cannot build an empty batch".into()));
    }
    let views: Vec<ArrayView3<'_, f32>> = tensors.iter().map(|t| t.view()).collect();
    ndarray::stack(Axis(0), &views)
        .map_err(|e| HierarchyError::Data(format!("Images have mismatched shapes: {}", e)))
}
