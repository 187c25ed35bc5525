//! Stubs shared by unit tests.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ndarray::{Array2, Array4, ArrayView4};

use crate::data::{Batch, BatchSource, BatchStream, LabelGroup, Split};
use crate::error::{HierarchyError, Result};
use crate::model::{ModelLoader, NodeClassifier};
use crate::registry::NodeModelRegistry;
use crate::training::{NodeTrainer, TrainingJob};

/// Three classes; pair with metadata recording two.
pub const WRONG_WIDTH: &[u8] = b"0.2 0.3 0.5";

/// Emits the same probabilities for every sample, as log-scores.
#[derive(Debug)]
pub struct FixedScoresModel {
    log_probs: Vec<f32>,
}

impl FixedScoresModel {
    pub fn new(probs: &[f32]) -> Self {
        Self {
            log_probs: probs.iter().map(|p| p.ln()).collect(),
        }
    }
}

impl NodeClassifier for FixedScoresModel {
    fn num_classes(&self) -> usize {
        self.log_probs.len()
    }

    fn predict(&self, batch: ArrayView4<'_, f32>) -> Result<Array2<f32>> {
        let n = batch.shape()[0];
        Ok(Array2::from_shape_fn((n, self.log_probs.len()), |(_, j)| {
            self.log_probs[j]
        }))
    }
}

/// Reads whitespace-separated probabilities from the artifact file.
#[derive(Debug, Default)]
pub struct FixedScoresLoader;

impl ModelLoader for FixedScoresLoader {
    fn load(&self, node: &str, path: &Path, _num_classes: usize) -> Result<Box<dyn NodeClassifier>> {
        let text = fs::read_to_string(path)?;
        let probs = text
            .split_whitespace()
            .map(|v| {
                v.parse::<f32>().map_err(|e| HierarchyError::ModelLoadError {
                    node: node.to_string(),
                    reason: e.to_string(),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Box::new(FixedScoresModel::new(&probs)))
    }
}

pub fn fixed_registry() -> (tempfile::TempDir, NodeModelRegistry) {
    let dir = tempfile::tempdir().unwrap();
    let registry =
        NodeModelRegistry::with_loader(dir.path(), Arc::new(FixedScoresLoader)).unwrap();
    (dir, registry)
}

/// Writes `probs` as the node's artifact.
pub fn write_scores(registry: &NodeModelRegistry, node: &str, probs: &[f32]) {
    let text = probs.iter().map(f32::to_string).collect::<Vec<_>>().join(" ");
    fs::write(registry.model_path(node).unwrap(), text).unwrap();
}

/// Yields `batches` tiny zero batches per split.
pub struct SyntheticSource {
    batches: usize,
}

impl SyntheticSource {
    pub fn new(batches: usize) -> Self {
        Self { batches }
    }
}

impl BatchSource for SyntheticSource {
    fn samples(&self, groups: &[LabelGroup], split: Split) -> Result<Vec<(PathBuf, usize)>> {
        let classes = groups.len().max(1);
        Ok((0..self.batches * 4)
            .map(|i| (PathBuf::from(format!("{split:?}/{i}.png")), i % classes))
            .collect())
    }

    fn batch_iterator(
        &self,
        groups: &[LabelGroup],
        _split: Split,
        batch_size: usize,
    ) -> Result<BatchStream> {
        let classes = groups.len().max(1);
        let size = batch_size.min(4);
        Ok(Box::new((0..self.batches).map(move |_| {
            Ok(Batch {
                inputs: Array4::zeros((size, 3, 2, 2)),
                labels: (0..size).map(|i| i % classes).collect(),
            })
        })))
    }
}

/// Records fitted nodes and writes uniform-score artifacts.
pub struct RecordingTrainer {
    pub fitted: Vec<String>,
    pub groups: BTreeMap<String, Vec<LabelGroup>>,
    pub batches_seen: usize,
    pub fail_on: Option<String>,
    pub write_artifact: bool,
}

impl Default for RecordingTrainer {
    fn default() -> Self {
        Self {
            fitted: Vec::new(),
            groups: BTreeMap::new(),
            batches_seen: 0,
            fail_on: None,
            write_artifact: true,
        }
    }
}

impl RecordingTrainer {
    pub fn failing_on(node: &str) -> Self {
        Self {
            fail_on: Some(node.to_string()),
            ..Self::default()
        }
    }
}

impl NodeTrainer for RecordingTrainer {
    fn fit(&mut self, job: &TrainingJob<'_>, artifact: &Path) -> anyhow::Result<()> {
        if self.fail_on.as_deref() == Some(job.node()) {
            anyhow::bail!("simulated failure on {}", job.node());
        }
        for batch in job.train_batches()? {
            let batch = batch?;
            assert!(batch.labels.iter().all(|&l| l < job.num_classes()));
            self.batches_seen += 1;
        }
        self.fitted.push(job.node().to_string());
        self.groups
            .insert(job.node().to_string(), job.groups().to_vec());
        if self.write_artifact {
            let p = 1.0 / job.num_classes() as f32;
            let text = vec![p.to_string(); job.num_classes()].join(" ");
            fs::write(artifact, text)?;
        }
        Ok(())
    }
}
