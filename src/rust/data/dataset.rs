use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, warn};
use ndarray::Array4;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use super::preprocess::{stack_images, Preprocessor};
use crate::error::{HierarchyError, Result};
use crate::hierarchy::NodeId;

pub(crate) const IMAGE_EXTENSIONS: [&str; 5] = ["png", "jpg", "jpeg", "bmp", "webp"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Split {
    Train,
    Val,
    Test,
}

/// One output class of a node model: a direct child and the leaves whose samples
/// are labelled with it. The class index is the group's position in the job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelGroup {
    pub label: NodeId,
    pub leaves: Vec<NodeId>,
}

/// Preprocessed inputs `(N, C, H, W)` and their class indices.
#[derive(Debug, Clone)]
pub struct Batch {
    pub inputs: Array4<f32>,
    pub labels: Vec<usize>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

pub type BatchStream = Box<dyn Iterator<Item = Result<Batch>> + Send>;

/// Supplies training data scoped to one node's children.
pub trait BatchSource: Send + Sync {
    /// Sample locations with class indices for one split, in iteration order.
    fn samples(&self, groups: &[LabelGroup], split: Split) -> Result<Vec<(PathBuf, usize)>>;

    fn batch_iterator(
        &self,
        groups: &[LabelGroup],
        split: Split,
        batch_size: usize,
    ) -> Result<BatchStream>;
}

/// Fractions of each leaf's samples assigned to train and validation; the rest is test.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SplitRatios {
    pub train: f64,
    pub val: f64,
}

impl Default for SplitRatios {
    fn default() -> Self {
        Self {
            train: 0.70,
            val: 0.15,
        }
    }
}

/// Reads images from `<root>/<leaf_id>/`.
///
/// Each leaf's files are split deterministically with a seeded shuffle, so train,
/// validation and test never overlap across runs. Train batches are shuffled and a
/// trailing partial train batch is dropped.
#[derive(Debug, Clone)]
pub struct ImageFolderSource {
    root: PathBuf,
    preprocessor: Preprocessor,
    ratios: SplitRatios,
    seed: u64,
}

impl ImageFolderSource {
    pub fn new<P: AsRef<Path>>(root: P, preprocessor: Preprocessor) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            preprocessor,
            ratios: SplitRatios::default(),
            seed: 42,
        }
    }

    pub fn with_ratios(mut self, ratios: SplitRatios) -> Result<Self> {
        if ratios.train < 0.0 || ratios.val < 0.0 || ratios.train + ratios.val > 1.0 {
            return Err(HierarchyError::Config(format!(
                "Invalid split ratios {:?}",
                ratios
            )));
        }
        self.ratios = ratios;
        Ok(self)
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub(crate) fn list_images(dir: &Path) -> Result<Vec<PathBuf>> {
        if !dir.is_dir() {
            warn!("No image directory for leaf at {:?}", dir);
            return Ok(Vec::new());
        }
        let mut files = Vec::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            let is_image = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
                .unwrap_or(false);
            if is_image {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }
}

impl BatchSource for ImageFolderSource {
    fn samples(&self, groups: &[LabelGroup], split: Split) -> Result<Vec<(PathBuf, usize)>> {
        let mut samples = Vec::new();
        for (label, group) in groups.iter().enumerate() {
            let before = samples.len();
            for leaf in &group.leaves {
                let files = Self::list_images(&self.root.join(leaf))?;
                let n = files.len();
                let mut indices: Vec<usize> = (0..n).collect();
                indices.shuffle(&mut ChaCha8Rng::seed_from_u64(self.seed));

                let n_train = (n as f64 * self.ratios.train) as usize;
                let n_val = (n as f64 * self.ratios.val) as usize;
                let selected = match split {
                    Split::Train => &indices[..n_train],
                    Split::Val => &indices[n_train..n_train + n_val],
                    Split::Test => &indices[n_train + n_val..],
                };
                samples.extend(selected.iter().map(|&i| (files[i].clone(), label)));
            }
            debug!(
                "{:?} split: class {} ({}) has {} samples",
                split,
                label,
                group.label,
                samples.len() - before
            );
        }

        if split == Split::Train {
            samples.shuffle(&mut ChaCha8Rng::seed_from_u64(self.seed));
        }
        Ok(samples)
    }

    fn batch_iterator(
        &self,
        groups: &[LabelGroup],
        split: Split,
        batch_size: usize,
    ) -> Result<BatchStream> {
        if batch_size == 0 {
            return Err(HierarchyError::Validation("Batch size must be positive".into()));
        }
        let samples = self.samples(groups, split)?;
        if samples.is_empty() {
            return Err(HierarchyError::Data(format!(
                "No {:?} samples under {:?}",
                split, self.root
            )));
        }

        let mut chunks: Vec<Vec<(PathBuf, usize)>> =
            samples.chunks(batch_size).map(<[_]>::to_vec).collect();
        if split == Split::Train && chunks.last().map_or(false, |c| c.len() < batch_size) {
            chunks.pop();
        }

        let preprocessor = self.preprocessor.clone();
        Ok(Box::new(chunks.into_iter().map(move |chunk| {
            let tensors = chunk
                .iter()
                .map(|(path, _)| preprocessor.load(path))
                .collect::<Result<Vec<_>>>()?;
            Ok(Batch {
                inputs: stack_images(&tensors)?,
                labels: chunk.iter().map(|(_, label)| *label).collect(),
            })
        })))
    }
}
