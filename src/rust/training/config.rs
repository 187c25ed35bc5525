use std::fs;
use std::path::{Path, PathBuf};

use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::{HierarchyError, Result};

const DEFAULT_CONFIG: &str = "default";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Optimizer {
    Adam,
    AdamW,
}

/// Hyperparameters handed to the trainer for one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainConfig {
    pub epochs: usize,
    pub batch_size: usize,
    /// Peak learning rate of the one-cycle schedule
    pub max_lr: f64,
    pub div_factor: f64,
    pub final_div_factor: f64,
    pub pct_start: f64,
    pub grad_clip_value: f64,
    pub weight_decay: f64,
    pub early_stopping_patience: usize,
    pub label_smoothing: f64,
    pub optimizer: Optimizer,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            epochs: 30,
            batch_size: 32,
            max_lr: 1e-3,
            div_factor: 25.0,
            final_div_factor: 1e4,
            pct_start: 0.3,
            grad_clip_value: 0.5,
            weight_decay: 1e-4,
            early_stopping_patience: 5,
            label_smoothing: 0.1,
            optimizer: Optimizer::AdamW,
        }
    }
}

impl TrainConfig {
    pub fn initial_lr(&self) -> f64 {
        self.max_lr / self.div_factor
    }

    pub fn min_lr(&self) -> f64 {
        self.max_lr / self.final_div_factor
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(HierarchyError::Config(msg.to_string()));
        if self.epochs == 0 {
            return invalid("epochs must be positive");
        }
        if self.batch_size == 0 {
            return invalid("batch_size must be positive");
        }
        if !(self.max_lr > 0.0) || !(self.div_factor > 0.0) || !(self.final_div_factor > 0.0) {
            return invalid("max_lr, div_factor and final_div_factor must be positive");
        }
        if !(0.0..=1.0).contains(&self.pct_start) {
            return invalid("pct_start must lie in [0, 1]");
        }
        if !(0.0..1.0).contains(&self.label_smoothing) {
            return invalid("label_smoothing must lie in [0, 1)");
        }
        if self.grad_clip_value < 0.0 || self.weight_decay < 0.0 {
            return invalid("grad_clip_value and weight_decay must not be negative");
        }
        Ok(())
    }
}

/// Resolves per-node training configs from a directory of JSON files.
///
/// `<node_id>.json` wins over `default.json`; without either, the built-in
/// [`TrainConfig::default`] is used.
#[derive(Debug, Clone, Default)]
pub struct TrainConfigStore {
    dir: Option<PathBuf>,
}

impl TrainConfigStore {
    /// Uses the config directory at `dir`, which must exist.
    pub fn new<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        if !dir.is_dir() {
            return Err(HierarchyError::Config(format!(
                "Training config directory {:?} does not exist",
                dir
            )));
        }
        Ok(Self {
            dir: Some(dir.to_path_buf()),
        })
    }

    /// A store that always yields the built-in defaults.
    pub fn builtin() -> Self {
        Self::default()
    }

    pub fn resolve(&self, node: &str) -> Result<TrainConfig> {
        let Some(dir) = &self.dir else {
            return Ok(TrainConfig::default());
        };

        for name in [node, DEFAULT_CONFIG] {
            let path = dir.join(format!("{name}.json"));
            if path.is_file() {
                debug!("Using training config {:?} for node {}", path, node);
                let config: TrainConfig = serde_json::from_slice(&fs::read(&path)?)
                    .map_err(|e| HierarchyError::Config(format!("{:?}: {}", path, e)))?;
                config.validate()?;
                return Ok(config);
            }
        }
        Ok(TrainConfig::default())
    }
}
