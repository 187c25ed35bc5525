//! Breadth-first, resumable training of the per-node classifiers.

pub mod command;
pub mod config;
pub mod prefetch;
pub mod progress;
pub mod scheduler;

pub use command::CommandTrainer;
pub use config::{Optimizer, TrainConfig, TrainConfigStore};
pub use prefetch::{Prefetcher, DEFAULT_CAPACITY};
pub use progress::TrainingProgress;
pub use scheduler::{
    resume_point, NodeState, NodeTrainer, ResumePoint, RunOutcome, RunReport, TrainingJob,
    TrainingScheduler,
};
