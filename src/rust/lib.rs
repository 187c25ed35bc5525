//! Hierarchical image classification: one classifier per internal node of a category
//! tree, trained breadth-first and composed into leaf probabilities at inference time.
//!
//! # Training
//!
//! ```no_run
//! # fn main() -> hierarch::Result<()> {
//! use hierarch::{
//!     CommandTrainer, ImageFolderSource, NodeModelRegistry, PreprocessConfig, Preprocessor,
//!     TrainingScheduler, Tree,
//! };
//!
//! let tree = Tree::from_path("hierarchy.csv")?;
//! let registry = NodeModelRegistry::new("registry")?;
//! let source = ImageFolderSource::new("images", Preprocessor::new(PreprocessConfig::default())?);
//! let trainer = CommandTrainer::new("train-node").with_data_root("images");
//!
//! // Resumes after the last completed node if a previous run was interrupted.
//! let report = TrainingScheduler::new(&tree, &registry, trainer, &source).run()?;
//! println!("{:?}", report.outcome);
//! # Ok(())
//! # }
//! ```
//!
//! # Prediction
//!
//! ```no_run
//! # fn main() -> hierarch::Result<()> {
//! use hierarch::{HierarchicalPredictor, NodeModelRegistry, Tree};
//!
//! let predictor = HierarchicalPredictor::builder()
//!     .with_tree(Tree::from_path("hierarchy.csv")?)
//!     .with_registry(NodeModelRegistry::new("registry")?)
//!     .build()?;
//!
//! for (leaf, probability) in &predictor.predict_paths(&["photo.jpg"])?.top_k(5)[0] {
//!     println!("{leaf}: {:.1}%", probability * 100.0);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Thread Safety
//!
//! [`HierarchicalPredictor`] is `Send + Sync`; share it across threads with `Arc`.
//! Prediction only reads the loaded models and the mask.

pub mod data;
pub mod error;
pub mod evaluation;
pub mod hierarchy;
pub mod model;
pub mod predictor;
pub mod registry;
mod runtime;
pub mod training;
mod utils;

#[cfg(test)]
mod testing;

pub use data::{
    Batch, BatchSource, BatchStream, ImageFolderSource, ImageStatistics, LabelGroup,
    PreprocessConfig, Preprocessor, Split, SplitRatios,
};
pub use error::{HierarchyError, Result};
pub use evaluation::{evaluate, Accuracy, EvaluationReport};
pub use hierarchy::{CategoryNode, Edge, MaskBuilder, MaskMatrix, NodeId, PathWeighting, Tree};
pub use model::{ModelLoader, NodeClassifier, OnnxModelLoader, OnnxNodeModel};
pub use predictor::{
    compose_leaf_probabilities, HierarchicalPredictor, HierarchicalPredictorBuilder,
    LeafProbabilities,
};
pub use registry::{NodeMetadata, NodeModelRegistry};
pub use runtime::{create_session_builder, OptimizationLevel, RuntimeConfig};
pub use training::{
    resume_point, CommandTrainer, NodeState, NodeTrainer, Optimizer, Prefetcher, ResumePoint,
    RunOutcome, RunReport, TrainConfig, TrainConfigStore, TrainingJob, TrainingProgress,
    TrainingScheduler,
};

pub fn init_logger() {
    env_logger::init();
}
