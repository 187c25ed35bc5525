use std::sync::OnceLock;

use ort::session::builder::{GraphOptimizationLevel, SessionBuilder};
use ort::session::Session;
use serde::{Deserialize, Serialize};

use crate::error::{HierarchyError, Result};

static INIT: OnceLock<std::result::Result<(), String>> = OnceLock::new();

/// Graph optimization applied when node models are loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum OptimizationLevel {
    Disable,
    Basic,
    Extended,
    #[default]
    All,
}

impl From<OptimizationLevel> for GraphOptimizationLevel {
    fn from(level: OptimizationLevel) -> Self {
        match level {
            OptimizationLevel::Disable => GraphOptimizationLevel::Disable,
            OptimizationLevel::Basic => GraphOptimizationLevel::Level1,
            OptimizationLevel::Extended => GraphOptimizationLevel::Level2,
            OptimizationLevel::All => GraphOptimizationLevel::Level3,
        }
    }
}

/// Threading and optimization settings shared by every node model session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// 0 lets ONNX Runtime decide
    #[serde(default)]
    pub inter_threads: usize,
    /// 0 lets ONNX Runtime decide
    #[serde(default)]
    pub intra_threads: usize,
    #[serde(default)]
    pub optimization_level: OptimizationLevel,
}

fn init_onnx_environment() -> ort::Result<()> {
    ort::init().with_name("hierarch").commit()?;
    Ok(())
}

/// Initializes the process-wide ONNX Runtime environment once. Later calls return
/// the outcome of the first attempt.
pub fn ensure_initialized() -> Result<()> {
    INIT.get_or_init(|| init_onnx_environment().map_err(|e| e.to_string()))
        .clone()
        .map_err(|e| HierarchyError::Config(format!("ONNX Runtime initialization failed: {e}")))
}

pub fn create_session_builder(config: &RuntimeConfig) -> Result<SessionBuilder> {
    ensure_initialized()?;
    let mut builder = Session::builder()?;

    if config.inter_threads > 0 {
        builder = builder.with_inter_threads(config.inter_threads)?;
    }
    if config.intra_threads > 0 {
        builder = builder.with_intra_threads(config.intra_threads)?;
    }
    builder = builder.with_optimization_level(config.optimization_level.into())?;

    Ok(builder)
}
