use std::collections::HashMap;
use std::fs;
use std::path::Path;

use log::{debug, info};
use ndarray::Array2;
use safetensors::tensor::{Dtype, TensorView};
use safetensors::SafeTensors;
use serde::{Deserialize, Serialize};

use super::tree::{Edge, NodeId, Tree};
use crate::error::{HierarchyError, Result};

const MASK_TENSOR: &str = "mask";
const META_LEAVES: &str = "leaves";
const META_EDGES: &str = "edges";
const META_FINGERPRINT: &str = "fingerprint";
const META_WEIGHTING: &str = "weighting";

/// How the incidence rows of the mask are weighted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum PathWeighting {
    /// Each row is divided by its path length, so leaves at every depth carry the
    /// same total mask weight.
    #[default]
    Normalized,
    /// Raw 0/1 incidence: composition yields the product of the conditional
    /// probabilities along the root path.
    Product,
}

impl PathWeighting {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normalized => "normalized",
            Self::Product => "product",
        }
    }

    fn parse(value: &str) -> Result<Self> {
        match value {
            "normalized" => Ok(Self::Normalized),
            "product" => Ok(Self::Product),
            other => Err(HierarchyError::Serialization(format!(
                "Unknown mask weighting '{}'",
                other
            ))),
        }
    }
}

/// Leaf x edge incidence matrix together with the leaf (row) and edge (column)
/// orderings it was built with.
#[derive(Debug, Clone)]
pub struct MaskMatrix {
    matrix: Array2<f32>,
    leaves: Vec<NodeId>,
    edges: Vec<Edge>,
    columns: HashMap<Edge, usize>,
    fingerprint: String,
    weighting: PathWeighting,
}

impl MaskMatrix {
    fn new(
        matrix: Array2<f32>,
        leaves: Vec<NodeId>,
        edges: Vec<Edge>,
        fingerprint: String,
        weighting: PathWeighting,
    ) -> Result<Self> {
        if matrix.dim() != (leaves.len(), edges.len()) {
            return Err(HierarchyError::Serialization(format!(
                "Mask shape {:?} does not match {} leaves x {} edges",
                matrix.dim(),
                leaves.len(),
                edges.len()
            )));
        }
        let mut columns = HashMap::with_capacity(edges.len());
        for (col, edge) in edges.iter().enumerate() {
            if columns.insert(edge.clone(), col).is_some() {
                return Err(HierarchyError::Serialization(format!(
                    "Edge {} -> {} appears twice in mask",
                    edge.parent, edge.child
                )));
            }
        }
        Ok(Self {
            matrix,
            leaves,
            edges,
            columns,
            fingerprint,
            weighting,
        })
    }

    pub fn matrix(&self) -> &Array2<f32> {
        &self.matrix
    }

    /// Row order.
    pub fn leaves(&self) -> &[NodeId] {
        &self.leaves
    }

    /// Column order.
    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn num_leaves(&self) -> usize {
        self.leaves.len()
    }

    pub fn num_edges(&self) -> usize {
        self.edges.len()
    }

    /// Fingerprint of the tree this mask was built from.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn weighting(&self) -> PathWeighting {
        self.weighting
    }

    /// Column assigned to the `parent -> child` edge.
    pub fn column(&self, parent: &str, child: &str) -> Option<usize> {
        self.columns.get(&Edge::new(parent, child)).copied()
    }

    /// Fails with `StaleMask` if this mask was built for a different tree.
    pub fn ensure_matches(&self, tree: &Tree) -> Result<()> {
        let actual = tree.fingerprint();
        if actual != self.fingerprint {
            return Err(HierarchyError::StaleMask {
                expected: self.fingerprint.clone(),
                actual,
            });
        }
        Ok(())
    }

    /// Serializes to safetensors: one F32 `mask` tensor plus the orderings as metadata.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let bytes: Vec<u8> = self.matrix.iter().flat_map(|v| v.to_le_bytes()).collect();
        let shape = vec![self.num_leaves(), self.num_edges()];
        let view = TensorView::new(Dtype::F32, shape, &bytes)
            .map_err(|e| HierarchyError::Serialization(format!("Invalid mask tensor: {e}")))?;

        let mut metadata = HashMap::new();
        metadata.insert(META_LEAVES.to_string(), serde_json::to_string(&self.leaves)?);
        metadata.insert(META_EDGES.to_string(), serde_json::to_string(&self.edges)?);
        metadata.insert(META_FINGERPRINT.to_string(), self.fingerprint.clone());
        metadata.insert(
            META_WEIGHTING.to_string(),
            self.weighting.as_str().to_string(),
        );

        safetensors::serialize(vec![(MASK_TENSOR, view)], Some(metadata)).map_err(|e| {
            HierarchyError::Serialization(format!("SafeTensors serialization failed: {e}"))
        })
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let (_, header) = SafeTensors::read_metadata(data)
            .map_err(|e| HierarchyError::Serialization(format!("Invalid mask file: {e}")))?;
        let metadata = header.metadata().as_ref().ok_or_else(|| {
            HierarchyError::Serialization("Mask file carries no metadata".to_string())
        })?;
        let entry = |key: &str| {
            metadata.get(key).ok_or_else(|| {
                HierarchyError::Serialization(format!("Mask metadata is missing '{}'", key))
            })
        };
        let leaves: Vec<NodeId> = serde_json::from_str(entry(META_LEAVES)?)?;
        let edges: Vec<Edge> = serde_json::from_str(entry(META_EDGES)?)?;
        let fingerprint = entry(META_FINGERPRINT)?.clone();
        let weighting = PathWeighting::parse(entry(META_WEIGHTING)?)?;

        let tensors = SafeTensors::deserialize(data)
            .map_err(|e| HierarchyError::Serialization(format!("Invalid mask file: {e}")))?;
        let tensor = tensors
            .tensor(MASK_TENSOR)
            .map_err(|e| HierarchyError::Serialization(format!("Mask tensor missing: {e}")))?;
        if tensor.dtype() != Dtype::F32 || tensor.shape().len() != 2 {
            return Err(HierarchyError::Serialization(format!(
                "Mask tensor must be a 2D F32 array, found {:?} {:?}",
                tensor.dtype(),
                tensor.shape()
            )));
        }
        let values: Vec<f32> = tensor
            .data()
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        let matrix = Array2::from_shape_vec((tensor.shape()[0], tensor.shape()[1]), values)
            .map_err(|e| HierarchyError::Serialization(format!("Mask shape error: {e}")))?;

        Self::new(matrix, leaves, edges, fingerprint, weighting)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.to_bytes()?)?;
        info!(
            "Saved hierarchy mask ({} leaves x {} edges) to {:?}",
            self.num_leaves(),
            self.num_edges(),
            path
        );
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = fs::read(path.as_ref())?;
        Self::from_bytes(&data)
    }
}

/// Derives the leaf-path incidence matrix from a tree.
#[derive(Debug, Clone, Default)]
pub struct MaskBuilder {
    weighting: PathWeighting,
}

impl MaskBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_weighting(mut self, weighting: PathWeighting) -> Self {
        self.weighting = weighting;
        self
    }

    pub fn weighting(&self) -> PathWeighting {
        self.weighting
    }

    /// Builds the mask. Columns follow breadth-first edge discovery, rows follow
    /// breadth-first leaf discovery, and each row marks the edges on the leaf's
    /// path to the root.
    pub fn build(&self, tree: &Tree) -> Result<MaskMatrix> {
        let edges = tree.edges();
        if edges.is_empty() {
            return Err(HierarchyError::EmptyHierarchy);
        }
        let columns: HashMap<&Edge, usize> =
            edges.iter().enumerate().map(|(col, e)| (e, col)).collect();
        let leaves = tree.leaves();
        let mut matrix = Array2::<f32>::zeros((leaves.len(), edges.len()));

        for (row, leaf) in leaves.iter().enumerate() {
            let mut current = leaf.as_str();
            let mut steps = 0;
            while let Some(parent) = tree.parent(current)? {
                let col = columns
                    .get(&Edge::new(parent, current))
                    .copied()
                    .ok_or_else(|| HierarchyError::UnknownNode(current.to_string()))?;
                matrix[[row, col]] = 1.0;
                current = parent;
                steps += 1;
                if steps > edges.len() {
                    return Err(HierarchyError::CyclicHierarchy(format!(
                        "Path from leaf '{}' never reaches the root",
                        leaf
                    )));
                }
            }
        }

        if self.weighting == PathWeighting::Normalized {
            for mut row in matrix.rows_mut() {
                let path_len = row.sum();
                if path_len > 0.0 {
                    row.mapv_inplace(|v| v / path_len);
                }
            }
        }

        debug!(
            "Built {:?} mask: {} leaves x {} edges",
            self.weighting,
            leaves.len(),
            edges.len()
        );
        MaskMatrix::new(matrix, leaves, edges, tree.fingerprint(), self.weighting)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hierarchy::tree::CategoryNode;
    use approx::assert_abs_diff_eq;

    fn two_level() -> Tree {
        Tree::from_nodes(vec![
            CategoryNode::root("root"),
            CategoryNode::child("x", "root"),
            CategoryNode::child("y", "root"),
            CategoryNode::child("a", "x"),
            CategoryNode::child("b", "x"),
        ])
        .unwrap()
    }

    #[test]
    fn test_rows_sum_to_one() {
        let tree = Tree::from_nodes(vec![
            CategoryNode::root("r"),
            CategoryNode::child("p", "r"),
            CategoryNode::child("q", "r"),
            CategoryNode::child("p1", "p"),
            CategoryNode::child("p2", "p"),
            CategoryNode::child("p2a", "p2"),
            CategoryNode::child("p2b", "p2"),
            CategoryNode::child("q1", "q"),
        ])
        .unwrap();
        let mask = MaskBuilder::new().build(&tree).unwrap();
        assert_eq!(mask.num_leaves(), tree.leaf_count());
        assert_eq!(mask.num_edges(), tree.len() - 1);
        for row in mask.matrix().rows() {
            assert_abs_diff_eq!(row.sum(), 1.0, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_two_level_layout() {
        let mask = MaskBuilder::new().build(&two_level()).unwrap();
        assert_eq!(mask.leaves(), &["y", "a", "b"]);
        assert_eq!(mask.column("root", "x"), Some(0));
        assert_eq!(mask.column("root", "y"), Some(1));
        assert_eq!(mask.column("x", "a"), Some(2));
        assert_eq!(mask.column("x", "b"), Some(3));
        assert_eq!(mask.column("y", "a"), None);

        let m = mask.matrix();
        assert_eq!(m.row(0).to_vec(), vec![0.0, 1.0, 0.0, 0.0]);
        assert_eq!(m.row(1).to_vec(), vec![0.5, 0.0, 0.5, 0.0]);
        assert_eq!(m.row(2).to_vec(), vec![0.5, 0.0, 0.0, 0.5]);
    }

    #[test]
    fn test_product_weighting_keeps_incidence() {
        let mask = MaskBuilder::new()
            .with_weighting(PathWeighting::Product)
            .build(&two_level())
            .unwrap();
        assert_eq!(mask.weighting(), PathWeighting::Product);
        assert_eq!(mask.matrix().row(1).to_vec(), vec![1.0, 0.0, 1.0, 0.0]);
        assert_eq!(mask.matrix().row(2).sum(), 2.0);
    }

    #[test]
    fn test_single_level_is_identity() {
        let tree = Tree::from_nodes(vec![
            CategoryNode::root("x"),
            CategoryNode::child("a", "x"),
            CategoryNode::child("b", "x"),
        ])
        .unwrap();
        let mask = MaskBuilder::new().build(&tree).unwrap();
        assert_eq!(mask.matrix(), &Array2::<f32>::eye(2));
    }

    #[test]
    fn test_single_node_tree_is_empty_hierarchy() {
        let tree = Tree::from_nodes(vec![CategoryNode::root("only")]).unwrap();
        assert!(matches!(
            MaskBuilder::new().build(&tree),
            Err(HierarchyError::EmptyHierarchy)
        ));
    }

    #[test]
    fn test_persisted_mask_keeps_orderings() {
        let tree = two_level();
        let mask = MaskBuilder::new().build(&tree).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("hierarchy_mask.safetensors");
        mask.save(&path).unwrap();

        let loaded = MaskMatrix::load(&path).unwrap();
        assert_eq!(loaded.matrix(), mask.matrix());
        assert_eq!(loaded.edges(), mask.edges());
        assert_eq!(loaded.leaves(), mask.leaves());
        assert_eq!(loaded.column("x", "b"), Some(3));
        assert_eq!(loaded.weighting(), PathWeighting::Normalized);
        assert!(loaded.ensure_matches(&tree).is_ok());
    }

    #[test]
    fn test_stale_mask_detected() {
        let mask = MaskBuilder::new().build(&two_level()).unwrap();
        let other = Tree::from_nodes(vec![
            CategoryNode::root("root"),
            CategoryNode::child("x", "root"),
            CategoryNode::child("z", "root"),
        ])
        .unwrap();
        assert!(matches!(
            mask.ensure_matches(&other),
            Err(HierarchyError::StaleMask { .. })
        ));
    }

    #[test]
    fn test_garbage_bytes_rejected() {
        assert!(matches!(
            MaskMatrix::from_bytes(b"definitely not safetensors"),
            Err(HierarchyError::Serialization(_))
        ));
    }
}
