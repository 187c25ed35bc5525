//! Image preprocessing and per-node training data.

pub mod dataset;
pub mod preprocess;
pub mod statistics;

pub use dataset::{Batch, BatchSource, BatchStream, ImageFolderSource, LabelGroup, Split, SplitRatios};
pub use preprocess::{PreprocessConfig, Preprocessor};
pub use statistics::ImageStatistics;
