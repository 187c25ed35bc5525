use std::collections::BTreeSet;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::error::{HierarchyError, Result};
use crate::hierarchy::{MaskMatrix, NodeId};
use crate::model::{ModelLoader, NodeClassifier, OnnxModelLoader};

const MODEL_EXTENSION: &str = "onnx";
const METADATA_EXTENSION: &str = "json";
const MASK_FILE: &str = "hierarchy_mask.safetensors";

/// Per-node record written once the node is complete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeMetadata {
    pub n_classes: usize,
    /// Exactly one child: no model exists, the output is always probability 1.
    pub is_single_label: bool,
    /// Child ids in class-index order.
    pub children: Vec<NodeId>,
}

impl NodeMetadata {
    pub fn new(children: Vec<NodeId>) -> Self {
        Self {
            n_classes: children.len(),
            is_single_label: children.len() == 1,
            children,
        }
    }
}

/// On-disk store of node models, node metadata and the hierarchy mask.
///
/// Layout, one flat directory:
/// - `<node_id>.onnx` model artifact
/// - `<node_id>.json` [`NodeMetadata`]
/// - `hierarchy_mask.safetensors`
#[derive(Clone)]
pub struct NodeModelRegistry {
    dir: PathBuf,
    loader: Arc<dyn ModelLoader>,
}

impl std::fmt::Debug for NodeModelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeModelRegistry")
            .field("dir", &self.dir)
            .finish_non_exhaustive()
    }
}

impl NodeModelRegistry {
    /// Opens (creating if needed) a registry in `dir` that loads ONNX artifacts.
    pub fn new<P: AsRef<Path>>(dir: P) -> Result<Self> {
        Self::with_loader(dir, Arc::new(OnnxModelLoader::default()))
    }

    pub fn with_loader<P: AsRef<Path>>(dir: P, loader: Arc<dyn ModelLoader>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir, loader })
    }

    /// Replaces the loader used by [`Self::load_model`].
    pub fn with_model_loader(mut self, loader: Arc<dyn ModelLoader>) -> Self {
        self.loader = loader;
        self
    }

    /// Opens the registry at [`Self::default_dir`].
    pub fn new_default() -> Result<Self> {
        Self::new(Self::default_dir())
    }

    /// Returns the default registry directory
    pub fn default_dir() -> PathBuf {
        // 1. Check environment variable
        if let Ok(path) = env::var("HIERARCH_REGISTRY") {
            return PathBuf::from(path);
        }

        // 2. Use platform-specific data directory
        if let Some(data_dir) = dirs::data_dir() {
            return data_dir.join("hierarch").join("registry");
        }

        // 3. Fallback to user's home directory
        if let Some(home_dir) = dirs::home_dir() {
            return home_dir.join(".local").join("share").join("hierarch").join("registry");
        }

        // 4. If all else fails, use system temp directory
        env::temp_dir().join("hierarch").join("registry")
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Node ids double as file stems, so they must not escape the registry directory.
    fn artifact_stem(id: &str) -> Result<&str> {
        if id.is_empty() || id == "." || id == ".." || id.contains(['/', '\\']) {
            return Err(HierarchyError::Validation(format!(
                "Node id '{}' cannot be used as an artifact name",
                id
            )));
        }
        Ok(id)
    }

    pub fn model_path(&self, id: &str) -> Result<PathBuf> {
        let stem = Self::artifact_stem(id)?;
        Ok(self.dir.join(format!("{stem}.{MODEL_EXTENSION}")))
    }

    pub fn metadata_path(&self, id: &str) -> Result<PathBuf> {
        let stem = Self::artifact_stem(id)?;
        Ok(self.dir.join(format!("{stem}.{METADATA_EXTENSION}")))
    }

    pub fn mask_path(&self) -> PathBuf {
        self.dir.join(MASK_FILE)
    }

    /// Whether the node is complete: its metadata exists and, unless the node is
    /// single-label, so does its model artifact.
    pub fn has_model(&self, id: &str) -> bool {
        let metadata = match self.metadata_path(id) {
            Ok(path) if path.exists() => self.load_metadata(id),
            _ => return false,
        };
        match metadata {
            Ok(metadata) if metadata.is_single_label => true,
            Ok(_) => self.model_path(id).map(|p| p.exists()).unwrap_or(false),
            Err(e) => {
                warn!("Ignoring unreadable metadata for node {}: {}", id, e);
                false
            }
        }
    }

    /// Writes (or overwrites) the node's metadata. The file is replaced atomically.
    pub fn save_metadata(&self, id: &str, metadata: &NodeMetadata) -> Result<()> {
        let path = self.metadata_path(id)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(metadata)?)?;
        fs::rename(&tmp, &path)?;
        debug!("Saved metadata for node {} to {:?}", id, path);
        Ok(())
    }

    pub fn load_metadata(&self, id: &str) -> Result<NodeMetadata> {
        let path = self.metadata_path(id)?;
        if !path.exists() {
            return Err(HierarchyError::MetadataNotFound(id.to_string()));
        }
        let metadata: NodeMetadata = serde_json::from_slice(&fs::read(&path)?)?;
        if metadata.n_classes != metadata.children.len() {
            return Err(HierarchyError::Validation(format!(
                "Metadata for node {} records {} classes but {} children",
                id,
                metadata.n_classes,
                metadata.children.len()
            )));
        }
        Ok(metadata)
    }

    /// Loads the node's classifier through the configured [`ModelLoader`].
    pub fn load_model(&self, id: &str) -> Result<Box<dyn NodeClassifier>> {
        let metadata = self.load_metadata(id)?;
        if metadata.is_single_label {
            return Err(HierarchyError::ModelLoadError {
                node: id.to_string(),
                reason: "single-label nodes have no model".to_string(),
            });
        }
        let path = self.model_path(id)?;
        if !path.exists() {
            return Err(HierarchyError::ModelLoadError {
                node: id.to_string(),
                reason: format!("artifact {:?} does not exist", path),
            });
        }

        let model = self.loader.load(id, &path, metadata.n_classes)?;
        if model.num_classes() != metadata.n_classes {
            return Err(HierarchyError::ModelLoadError {
                node: id.to_string(),
                reason: format!(
                    "artifact has {} classes but metadata records {}",
                    model.num_classes(),
                    metadata.n_classes
                ),
            });
        }
        info!("Loaded model for node {} ({} classes)", id, metadata.n_classes);
        Ok(model)
    }

    /// Ids of every node whose metadata file is present.
    pub fn completed_nodes(&self) -> Result<BTreeSet<NodeId>> {
        let mut ids = BTreeSet::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(METADATA_EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                if self.has_model(stem) {
                    ids.insert(stem.to_string());
                }
            }
        }
        Ok(ids)
    }

    pub fn has_mask(&self) -> bool {
        self.mask_path().exists()
    }

    pub fn save_mask(&self, mask: &MaskMatrix) -> Result<()> {
        mask.save(self.mask_path())
    }

    pub fn load_mask(&self) -> Result<MaskMatrix> {
        let path = self.mask_path();
        if !path.exists() {
            return Err(HierarchyError::Config(format!(
                "No hierarchy mask at {:?}; run training to completion first",
                path
            )));
        }
        MaskMatrix::load(path)
    }
}
