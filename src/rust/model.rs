use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use log::{debug, error};
use ndarray::{Array2, ArrayView4, Ix2};
use ort::session::Session;
use ort::value::{Tensor, ValueType};

use crate::error::{HierarchyError, Result};
use crate::runtime::{create_session_builder, RuntimeConfig};

/// A trained per-node classifier.
///
/// Implementations must not mutate their state during `predict`, so a single
/// instance can serve concurrent requests.
pub trait NodeClassifier: Send + Sync + fmt::Debug {
    /// Number of classes (direct children of the node) the model scores.
    fn num_classes(&self) -> usize;

    /// Raw class scores for a preprocessed `(N, C, H, W)` batch, shape `(N, num_classes)`.
    fn predict(&self, batch: ArrayView4<'_, f32>) -> Result<Array2<f32>>;
}

/// Turns a persisted node artifact into a [`NodeClassifier`].
pub trait ModelLoader: Send + Sync {
    fn load(&self, node: &str, path: &Path, num_classes: usize) -> Result<Box<dyn NodeClassifier>>;
}

/// A node classifier backed by an ONNX Runtime session.
///
/// The model is expected to take a single float input of shape `(N, 3, H, W)` and
/// produce one `(N, num_classes)` output of unnormalized scores.
pub struct OnnxNodeModel {
    node: String,
    session: Session,
    input_name: String,
    num_classes: usize,
}

// Compile-time verification of thread-safety
const _: () = {
    fn assert_send_sync<T: Send + Sync>() {}
    fn verify_thread_safety() {
        assert_send_sync::<OnnxNodeModel>();
    }
};

impl fmt::Debug for OnnxNodeModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OnnxNodeModel")
            .field("node", &self.node)
            .field("input_name", &self.input_name)
            .field("num_classes", &self.num_classes)
            .finish()
    }
}

impl OnnxNodeModel {
    fn validate(node: &str, session: &Session, num_classes: usize) -> Result<()> {
        let load_error = |reason: String| HierarchyError::ModelLoadError {
            node: node.to_string(),
            reason,
        };

        if session.inputs.len() != 1 {
            return Err(load_error(format!(
                "Model must have exactly 1 input, found {}",
                session.inputs.len()
            )));
        }
        let output = session
            .outputs
            .first()
            .ok_or_else(|| load_error("Model has no outputs".to_string()))?;

        // Dynamic dimensions are reported as -1 and checked at prediction time.
        if let ValueType::Tensor { dimensions, .. } = &output.output_type {
            if let Some(&width) = dimensions.last() {
                if width > 0 && width as usize != num_classes {
                    return Err(load_error(format!(
                        "Artifact produces {} classes but metadata records {}",
                        width, num_classes
                    )));
                }
            }
        }
        Ok(())
    }
}

impl NodeClassifier for OnnxNodeModel {
    fn num_classes(&self) -> usize {
        self.num_classes
    }

    fn predict(&self, batch: ArrayView4<'_, f32>) -> Result<Array2<f32>> {
        let input = batch.as_standard_layout().into_owned().into_dyn();

        let mut input_tensors = HashMap::new();
        input_tensors.insert(self.input_name.as_str(), Tensor::from_array(input)?);

        let outputs = self.session.run(input_tensors)?;
        let scores = outputs[0].try_extract_tensor::<f32>()?;
        let scores = scores.into_dimensionality::<Ix2>().map_err(|e| {
            HierarchyError::Validation(format!(
                "Node {} produced a non-2D output: {}",
                self.node, e
            ))
        })?;

        if scores.ncols() != self.num_classes {
            return Err(HierarchyError::ShapeMismatch {
                node: self.node.clone(),
                expected: self.num_classes,
                actual: scores.ncols(),
            });
        }
        Ok(scores.to_owned())
    }
}

/// Loads `.onnx` node artifacts with a shared runtime configuration.
#[derive(Debug, Clone, Default)]
pub struct OnnxModelLoader {
    runtime_config: RuntimeConfig,
}

impl OnnxModelLoader {
    pub fn new(runtime_config: RuntimeConfig) -> Self {
        Self { runtime_config }
    }
}

impl ModelLoader for OnnxModelLoader {
    fn load(&self, node: &str, path: &Path, num_classes: usize) -> Result<Box<dyn NodeClassifier>> {
        debug!("Loading ONNX model for node {} from {:?}", node, path);
        let session = create_session_builder(&self.runtime_config)?
            .commit_from_file(path)
            .map_err(|e| {
                error!("Failed to load model for node {}: {}", node, e);
                HierarchyError::ModelLoadError {
                    node: node.to_string(),
                    reason: e.to_string(),
                }
            })?;

        OnnxNodeModel::validate(node, &session, num_classes)?;
        let input_name = session.inputs[0].name.clone();

        Ok(Box::new(OnnxNodeModel {
            node: node.to_string(),
            session,
            input_name,
            num_classes,
        }))
    }
}
