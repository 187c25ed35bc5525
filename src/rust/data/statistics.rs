use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use serde::Serialize;

use super::dataset::ImageFolderSource;
use super::preprocess::PreprocessConfig;
use crate::error::{HierarchyError, Result};

/// Summary of a raw image folder laid out as `<root>/<class>/<image>`.
///
/// Channel mean and std are estimated from every `sample_every`-th usable image,
/// in `[0, 1]` units.
#[derive(Debug, Clone, Serialize)]
pub struct ImageStatistics {
    pub total_files: usize,
    pub sampled: usize,
    /// Smallest usable image as `[height, width]`
    pub min_size: Option<[u32; 2]>,
    pub smallest_file: Option<PathBuf>,
    pub corrupted_files: Vec<PathBuf>,
    pub files_below_min_size: Vec<PathBuf>,
    pub mean: [f32; 3],
    pub std: [f32; 3],
}

impl ImageStatistics {
    /// Images narrower or shorter than `min_size_threshold` are not usable.
    pub fn scan<P: AsRef<Path>>(root: P, min_size_threshold: u32, sample_every: usize) -> Result<Self> {
        let root = root.as_ref();
        if sample_every == 0 {
            return Err(HierarchyError::Validation("sample_every must be positive".into()));
        }

        let mut class_dirs = Vec::new();
        for entry in fs::read_dir(root)? {
            let path = entry?.path();
            if path.is_dir() {
                class_dirs.push(path);
            }
        }
        class_dirs.sort();

        let mut stats = Self {
            total_files: 0,
            sampled: 0,
            min_size: None,
            smallest_file: None,
            corrupted_files: Vec::new(),
            files_below_min_size: Vec::new(),
            mean: [0.0; 3],
            std: [0.0; 3],
        };
        let mut sum = [0.0f64; 3];
        let mut squared_sum = [0.0f64; 3];
        let mut usable = 0usize;

        for dir in &class_dirs {
            for path in ImageFolderSource::list_images(dir)? {
                stats.total_files += 1;
                let (width, height) = match image::image_dimensions(&path) {
                    Ok(dims) => dims,
                    Err(e) => {
                        warn!("Unreadable image {:?}: {}", path, e);
                        stats.corrupted_files.push(path);
                        continue;
                    }
                };
                if width < min_size_threshold || height < min_size_threshold {
                    stats.files_below_min_size.push(path);
                    continue;
                }

                let smaller = stats
                    .min_size
                    .map_or(true, |[h, w]| width < w && height < h);
                if smaller {
                    stats.min_size = Some([height, width]);
                    stats.smallest_file = Some(path.clone());
                }

                if usable % sample_every == 0 {
                    match image::open(&path) {
                        Ok(img) => {
                            let rgb = img.to_rgb8();
                            let pixels = (rgb.width() as f64) * (rgb.height() as f64);
                            let mut image_sum = [0.0f64; 3];
                            let mut image_squared = [0.0f64; 3];
                            for pixel in rgb.pixels() {
                                for c in 0..3 {
                                    let v = pixel[c] as f64 / 255.0;
                                    image_sum[c] += v;
                                    image_squared[c] += v * v;
                                }
                            }
                            for c in 0..3 {
                                sum[c] += image_sum[c] / pixels;
                                squared_sum[c] += image_squared[c] / pixels;
                            }
                            stats.sampled += 1;
                        }
                        Err(e) => {
                            warn!("Unreadable image {:?}: {}", path, e);
                            stats.corrupted_files.push(path);
                            continue;
                        }
                    }
                }
                usable += 1;
            }
            debug!("Scanned {:?}", dir);
        }

        if stats.sampled == 0 {
            return Err(HierarchyError::Data(format!(
                "No usable images under {:?}",
                root
            )));
        }
        let n = stats.sampled as f64;
        for c in 0..3 {
            let mean = sum[c] / n;
            stats.mean[c] = mean as f32;
            stats.std[c] = (squared_sum[c] / n - mean * mean).max(0.0).sqrt() as f32;
        }
        info!(
            "{} images ({} corrupted, {} below {}px), mean {:?}, std {:?}",
            stats.total_files,
            stats.corrupted_files.len(),
            stats.files_below_min_size.len(),
            min_size_threshold,
            stats.mean,
            stats.std
        );
        Ok(stats)
    }

    /// The preprocessing config implied by this dataset: resize to the smallest
    /// usable image and normalize with the measured channel statistics.
    pub fn preprocess_config(&self) -> Result<PreprocessConfig> {
        let target_size = self
            .min_size
            .ok_or_else(|| HierarchyError::Data("No usable images were scanned".into()))?;
        let config = PreprocessConfig {
            target_size,
            mean: self.mean,
            std: self.std,
        };
        config.validate()?;
        Ok(config)
    }
}
