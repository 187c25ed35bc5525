use std::io;

/// Errors produced while loading a hierarchy, training its nodes or composing predictions.
#[derive(Debug, thiserror::Error)]
pub enum HierarchyError {
    /// The hierarchy source violates the single-root tree structure
    #[error("Malformed hierarchy: {0}")]
    MalformedHierarchy(String),
    /// Parent links loop back on themselves
    #[error("Cyclic hierarchy: {0}")]
    CyclicHierarchy(String),
    /// A node id is not part of the loaded tree or registry
    #[error("Unknown node: {0}")]
    UnknownNode(String),
    #[error("Metadata not found for node {0}")]
    MetadataNotFound(String),
    #[error("Failed to load model for node {node}: {reason}")]
    ModelLoadError { node: String, reason: String },
    #[error("Shape mismatch for node {node}: expected {expected} outputs, got {actual}")]
    ShapeMismatch {
        node: String,
        expected: usize,
        actual: usize,
    },
    /// The tree has no edges, so there is nothing to compose
    #[error("Hierarchy has no edges; a single-node tree is not hierarchical")]
    EmptyHierarchy,
    #[error("Mask was built for hierarchy {expected} but the loaded hierarchy is {actual}")]
    StaleMask { expected: String, actual: String },
    #[error("Training failed for node {node}: {source}")]
    Training {
        node: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("Data error: {0}")]
    Data(String),
    #[error("Config error: {0}")]
    Config(String),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),
    #[error("ONNX Runtime error: {0}")]
    Ort(#[from] ort::Error),
}

pub type Result<T> = std::result::Result<T, HierarchyError>;
