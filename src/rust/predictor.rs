use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;

use image::DynamicImage;
use log::{debug, error, info};
use ndarray::{Array2, ArrayView2, ArrayView4};

use crate::data::{PreprocessConfig, Preprocessor};
use crate::error::{HierarchyError, Result};
use crate::hierarchy::{MaskMatrix, NodeId, Tree};
use crate::model::{NodeClassifier, OnnxModelLoader};
use crate::registry::NodeModelRegistry;
use crate::runtime::RuntimeConfig;
use crate::utils::{normalize_rows, softmax_rows};

/// Added to edge probabilities before taking the log.
const LOG_EPSILON: f32 = 1e-10;

/// Combines per-edge conditional probabilities into leaf probabilities.
///
/// `edge_probs` is `(batch, num_edges)` in the mask's column order. Computes
/// `exp(log(p + eps) · maskᵀ)` and renormalizes every row to sum to one.
pub fn compose_leaf_probabilities(
    edge_probs: &ArrayView2<'_, f32>,
    mask: &MaskMatrix,
) -> Result<Array2<f32>> {
    if edge_probs.ncols() != mask.num_edges() {
        return Err(HierarchyError::Validation(format!(
            "Got {} edge probabilities but the mask has {} edges",
            edge_probs.ncols(),
            mask.num_edges()
        )));
    }
    let log_probs = edge_probs.mapv(|p| (p + LOG_EPSILON).ln());
    let mut leaf_probs = log_probs.dot(&mask.matrix().t()).mapv(f32::exp);
    normalize_rows(&mut leaf_probs);
    Ok(leaf_probs)
}

/// Leaf probabilities for a batch, one row per input.
#[derive(Debug, Clone)]
pub struct LeafProbabilities {
    matrix: Array2<f32>,
    leaves: Vec<NodeId>,
}

impl LeafProbabilities {
    /// `(batch, num_leaves)`
    pub fn matrix(&self) -> &Array2<f32> {
        &self.matrix
    }

    /// Column order of [`Self::matrix`].
    pub fn leaves(&self) -> &[NodeId] {
        &self.leaves
    }

    pub fn len(&self) -> usize {
        self.matrix.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.matrix.nrows() == 0
    }

    /// Probability of `leaf` for input `row`.
    pub fn get(&self, row: usize, leaf: &str) -> Option<f32> {
        let col = self.leaves.iter().position(|l| l == leaf)?;
        self.matrix.get((row, col)).copied()
    }

    /// The `k` most probable leaves of every row, highest first.
    pub fn top_k(&self, k: usize) -> Vec<Vec<(NodeId, f32)>> {
        self.matrix
            .rows()
            .into_iter()
            .map(|row| {
                let mut ranked: Vec<(usize, f32)> = row.iter().copied().enumerate().collect();
                ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
                ranked
                    .into_iter()
                    .take(k)
                    .map(|(col, p)| (self.leaves[col].clone(), p))
                    .collect()
            })
            .collect()
    }
}

/// One internal node's contribution to the edge probability matrix.
#[derive(Debug)]
struct NodeOutput {
    node: NodeId,
    /// `None` for single-label nodes
    model: Option<Box<dyn NodeClassifier>>,
    /// Mask column of each child edge, in class-index order
    columns: Vec<usize>,
}

/// Composes the per-node classifiers of a trained hierarchy into leaf predictions.
///
/// Every node output is placed by looking up its `(parent, child)` edge in the
/// persisted mask, so prediction never depends on traversal order matching the
/// order the mask was built with.
#[derive(Debug)]
pub struct HierarchicalPredictor {
    outputs: Vec<NodeOutput>,
    mask: MaskMatrix,
    preprocessor: Preprocessor,
}

// Ensure HierarchicalPredictor is Send + Sync
const _: () = {
    fn assert_send_sync<T: Send + Sync>() {}
    fn verify_thread_safety() {
        assert_send_sync::<HierarchicalPredictor>();
    }
};

impl HierarchicalPredictor {
    /// Creates a new builder for constructing a predictor
    ///
    /// # Example
    /// ```no_run
    /// use hierarch::{HierarchicalPredictor, NodeModelRegistry, Tree};
    ///
    /// # fn main() -> hierarch::Result<()> {
    /// let predictor = HierarchicalPredictor::builder()
    ///     .with_tree(Tree::from_path("hierarchy.csv")?)
    ///     .with_registry(NodeModelRegistry::new("registry")?)
    ///     .build()?;
    /// let top = predictor.predict_paths(&["photo.jpg"])?.top_k(5);
    /// # Ok(())
    /// # }
    /// ```
    pub fn builder() -> HierarchicalPredictorBuilder {
        HierarchicalPredictorBuilder::new()
    }

    pub fn mask(&self) -> &MaskMatrix {
        &self.mask
    }

    /// Leaf ids in output column order.
    pub fn leaves(&self) -> &[NodeId] {
        self.mask.leaves()
    }

    pub fn preprocessor(&self) -> &Preprocessor {
        &self.preprocessor
    }

    /// Per-edge probabilities `(batch, num_edges)` in mask column order.
    pub fn edge_probabilities(&self, batch: ArrayView4<'_, f32>) -> Result<Array2<f32>> {
        let n = batch.shape()[0];
        let mut edge_probs = Array2::<f32>::zeros((n, self.mask.num_edges()));

        for output in &self.outputs {
            let Some(model) = &output.model else {
                for &col in &output.columns {
                    edge_probs.column_mut(col).fill(1.0);
                }
                continue;
            };

            let scores = model.predict(batch)?;
            if scores.ncols() != output.columns.len() {
                error!(
                    "Model for node {} produced {} outputs, expected {}",
                    output.node,
                    scores.ncols(),
                    output.columns.len()
                );
                return Err(HierarchyError::ShapeMismatch {
                    node: output.node.clone(),
                    expected: output.columns.len(),
                    actual: scores.ncols(),
                });
            }
            if scores.nrows() != n {
                return Err(HierarchyError::Validation(format!(
                    "Model for node {} returned {} rows for a batch of {}",
                    output.node,
                    scores.nrows(),
                    n
                )));
            }

            let probs = softmax_rows(&scores.view());
            for (class, &col) in output.columns.iter().enumerate() {
                edge_probs.column_mut(col).assign(&probs.column(class));
            }
        }
        Ok(edge_probs)
    }

    /// Leaf probabilities for a preprocessed `(N, 3, H, W)` batch.
    pub fn predict(&self, batch: ArrayView4<'_, f32>) -> Result<LeafProbabilities> {
        let edge_probs = self.edge_probabilities(batch)?;
        let matrix = compose_leaf_probabilities(&edge_probs.view(), &self.mask)?;
        debug!("Composed leaf probabilities for {} inputs", matrix.nrows());
        Ok(LeafProbabilities {
            matrix,
            leaves: self.mask.leaves().to_vec(),
        })
    }

    pub fn predict_images(&self, images: &[DynamicImage]) -> Result<LeafProbabilities> {
        let batch = self.preprocessor.batch(images)?;
        self.predict(batch.view())
    }

    pub fn predict_paths<P: AsRef<Path>>(&self, paths: &[P]) -> Result<LeafProbabilities> {
        let batch = self.preprocessor.load_batch(paths)?;
        self.predict(batch.view())
    }
}

/// A builder for constructing a HierarchicalPredictor with a fluent interface.
#[derive(Debug, Default)]
pub struct HierarchicalPredictorBuilder {
    tree: Option<Tree>,
    registry: Option<NodeModelRegistry>,
    preprocess_config: Option<PreprocessConfig>,
    runtime_config: Option<RuntimeConfig>,
}

impl HierarchicalPredictorBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tree(mut self, tree: Tree) -> Self {
        self.tree = Some(tree);
        self
    }

    pub fn with_registry(mut self, registry: NodeModelRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Defaults to [`PreprocessConfig::default`].
    pub fn with_preprocess_config(mut self, config: PreprocessConfig) -> Self {
        self.preprocess_config = Some(config);
        self
    }

    /// Loads node models as ONNX sessions with these settings, replacing the
    /// registry's own loader.
    pub fn with_runtime_config(mut self, config: RuntimeConfig) -> Self {
        self.runtime_config = Some(config);
        self
    }

    /// Loads the mask and every internal node's model.
    ///
    /// # Errors
    /// - `StaleMask` if the persisted mask was built for a different tree
    /// - `UnknownNode` if a node has no metadata or an edge has no mask column
    /// - `ModelLoadError` if an artifact is missing or does not fit its metadata
    pub fn build(self) -> Result<HierarchicalPredictor> {
        let tree = self
            .tree
            .ok_or_else(|| HierarchyError::Config("A hierarchy is required".into()))?;
        let mut registry = self
            .registry
            .ok_or_else(|| HierarchyError::Config("A model registry is required".into()))?;
        if let Some(config) = self.runtime_config {
            registry = registry.with_model_loader(Arc::new(OnnxModelLoader::new(config)));
        }
        let preprocessor = Preprocessor::new(self.preprocess_config.unwrap_or_default())?;

        let mask = registry.load_mask()?;
        mask.ensure_matches(&tree)?;

        let mut covered = vec![false; mask.num_edges()];
        let mut outputs = Vec::new();
        let mut queue = VecDeque::from([tree.root().to_string()]);
        while let Some(node) = queue.pop_front() {
            outputs.push(Self::load_node(&tree, &registry, &mask, &node, &mut covered)?);
            queue.extend(tree.non_leaf_children(&node)?);
        }

        if let Some(col) = covered.iter().position(|c| !c) {
            let edge = &mask.edges()[col];
            return Err(HierarchyError::UnknownNode(format!(
                "{} (no node output for edge {} -> {})",
                edge.child, edge.parent, edge.child
            )));
        }

        info!(
            "Loaded hierarchical predictor: {} nodes, {} leaves",
            outputs.len(),
            mask.num_leaves()
        );
        Ok(HierarchicalPredictor {
            outputs,
            mask,
            preprocessor,
        })
    }

    fn load_node(
        tree: &Tree,
        registry: &NodeModelRegistry,
        mask: &MaskMatrix,
        node: &str,
        covered: &mut [bool],
    ) -> Result<NodeOutput> {
        let metadata = registry.load_metadata(node).map_err(|e| match e {
            HierarchyError::MetadataNotFound(id) => {
                error!("No metadata for node {}; is training complete?", id);
                HierarchyError::UnknownNode(id)
            }
            other => other,
        })?;

        if metadata.children.as_slice() != tree.children(node)? {
            return Err(HierarchyError::Validation(format!(
                "Registry records children {:?} for node {} but the hierarchy has {:?}",
                metadata.children,
                node,
                tree.children(node)?
            )));
        }

        let mut columns = Vec::with_capacity(metadata.children.len());
        for child in &metadata.children {
            let col = mask
                .column(node, child)
                .ok_or_else(|| HierarchyError::UnknownNode(child.clone()))?;
            if std::mem::replace(&mut covered[col], true) {
                return Err(HierarchyError::Validation(format!(
                    "Edge {} -> {} is produced twice",
                    node, child
                )));
            }
            columns.push(col);
        }

        let model = if metadata.is_single_label {
            None
        } else {
            Some(registry.load_model(node)?)
        };
        Ok(NodeOutput {
            node: node.to_string(),
            model,
            columns,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hierarchy::{CategoryNode, MaskBuilder, PathWeighting};
    use crate::registry::NodeMetadata;
    use crate::testing::{fixed_registry, write_scores};
    use approx::assert_abs_diff_eq;
    use ndarray::{array, Array4};

    fn tree(nodes: &[(&str, Option<&str>)]) -> Tree {
        Tree::from_nodes(nodes.iter().map(|(id, parent)| match parent {
            Some(p) => CategoryNode::child(*id, *p),
            None => CategoryNode::root(*id),
        }))
        .unwrap()
    }

    fn trained(
        tree: &Tree,
        scores: &[(&str, Vec<f32>)],
        weighting: PathWeighting,
    ) -> (tempfile::TempDir, NodeModelRegistry) {
        let (dir, registry) = fixed_registry();
        for node in tree.internal_nodes() {
            let children = tree.children(&node).unwrap().to_vec();
            if let Some((_, probs)) = scores.iter().find(|(id, _)| *id == node) {
                write_scores(&registry, &node, probs);
            }
            registry
                .save_metadata(&node, &NodeMetadata::new(children))
                .unwrap();
        }
        let mask = MaskBuilder::new()
            .with_weighting(weighting)
            .build(tree)
            .unwrap();
        registry.save_mask(&mask).unwrap();
        (dir, registry)
    }

    fn predictor(tree: &Tree, registry: &NodeModelRegistry) -> HierarchicalPredictor {
        HierarchicalPredictor::builder()
            .with_tree(tree.clone())
            .with_registry(registry.clone())
            .build()
            .unwrap()
    }

    fn inputs(n: usize) -> Array4<f32> {
        Array4::zeros((n, 3, 2, 2))
    }

    #[test]
    fn test_single_level_passes_probabilities_through() {
        let tree = tree(&[("x", None), ("a", Some("x")), ("b", Some("x"))]);
        let (_dir, registry) = trained(&tree, &[("x", vec![0.3, 0.7])], PathWeighting::Normalized);

        let probs = predictor(&tree, &registry).predict(inputs(2).view()).unwrap();
        assert_eq!(probs.leaves(), &["a", "b"]);
        for row in 0..2 {
            assert_abs_diff_eq!(probs.get(row, "a").unwrap(), 0.3, epsilon = 1e-5);
            assert_abs_diff_eq!(probs.get(row, "b").unwrap(), 0.7, epsilon = 1e-5);
        }
    }

    fn two_level() -> Tree {
        tree(&[
            ("root", None),
            ("x", Some("root")),
            ("y", Some("root")),
            ("a", Some("x")),
            ("b", Some("x")),
        ])
    }

    #[test]
    fn test_two_level_product_is_chain_rule() {
        let tree = two_level();
        let (_dir, registry) = trained(
            &tree,
            &[("root", vec![0.4, 0.6]), ("x", vec![0.25, 0.75])],
            PathWeighting::Product,
        );
        let probs = predictor(&tree, &registry).predict(inputs(1).view()).unwrap();
        assert_abs_diff_eq!(probs.get(0, "a").unwrap(), 0.10, epsilon = 1e-5);
        assert_abs_diff_eq!(probs.get(0, "b").unwrap(), 0.30, epsilon = 1e-5);
        assert_abs_diff_eq!(probs.get(0, "y").unwrap(), 0.60, epsilon = 1e-5);
        assert_abs_diff_eq!(probs.matrix().sum(), 1.0, epsilon = 1e-5);
    }

    #[test]
    fn test_two_level_normalized_uses_path_mean() {
        let tree = two_level();
        let (_dir, registry) = trained(
            &tree,
            &[("root", vec![0.4, 0.6]), ("x", vec![0.25, 0.75])],
            PathWeighting::Normalized,
        );
        let probs = predictor(&tree, &registry).predict(inputs(1).view()).unwrap();

        let (a, b, y) = (0.1f32.sqrt(), 0.3f32.sqrt(), 0.6f32);
        let total = a + b + y;
        assert_abs_diff_eq!(probs.get(0, "a").unwrap(), a / total, epsilon = 1e-5);
        assert_abs_diff_eq!(probs.get(0, "b").unwrap(), b / total, epsilon = 1e-5);
        assert_abs_diff_eq!(probs.get(0, "y").unwrap(), y / total, epsilon = 1e-5);
    }

    #[test]
    fn test_single_label_column_position_does_not_matter() {
        // The single-label node is "p" in the first tree and "q" in the second, so
        // its constant column sits before, then after, the sibling's block.
        for (solo, multi) in [("p", "q"), ("q", "p")] {
            let solo_leaf = format!("{solo}1");
            let (m1, m2) = (format!("{multi}1"), format!("{multi}2"));
            let tree = tree(&[
                ("root", None),
                ("p", Some("root")),
                ("q", Some("root")),
                (solo_leaf.as_str(), Some(solo)),
                (m1.as_str(), Some(multi)),
                (m2.as_str(), Some(multi)),
            ]);
            let (_dir, registry) = trained(
                &tree,
                &[("root", vec![0.2, 0.8]), (multi, vec![0.25, 0.75])],
                PathWeighting::Product,
            );
            let predictor = predictor(&tree, &registry);

            let solo_col = predictor.mask().column(solo, &solo_leaf).unwrap();
            let multi_col = predictor.mask().column(multi, &m1).unwrap();
            assert_eq!(solo_col < multi_col, solo == "p");
            let edges = predictor.edge_probabilities(inputs(1).view()).unwrap();
            assert_abs_diff_eq!(edges[[0, solo_col]], 1.0);

            let probs = predictor.predict(inputs(1).view()).unwrap();
            let (p_solo, p_multi) = if solo == "p" { (0.2, 0.8) } else { (0.8, 0.2) };
            assert_abs_diff_eq!(probs.get(0, &solo_leaf).unwrap(), p_solo, epsilon = 1e-5);
            assert_abs_diff_eq!(probs.get(0, &m1).unwrap(), p_multi * 0.25, epsilon = 1e-5);
            assert_abs_diff_eq!(probs.get(0, &m2).unwrap(), p_multi * 0.75, epsilon = 1e-5);
        }
    }

    #[test]
    fn test_wrong_output_width_is_shape_mismatch() {
        #[derive(Debug)]
        struct Wide;
        impl NodeClassifier for Wide {
            fn num_classes(&self) -> usize {
                2
            }
            fn predict(&self, batch: ArrayView4<'_, f32>) -> Result<Array2<f32>> {
                Ok(Array2::zeros((batch.shape()[0], 3)))
            }
        }

        let tree = tree(&[("x", None), ("a", Some("x")), ("b", Some("x"))]);
        let mask = MaskBuilder::new().build(&tree).unwrap();
        let predictor = HierarchicalPredictor {
            outputs: vec![NodeOutput {
                node: "x".into(),
                model: Some(Box::new(Wide)),
                columns: vec![0, 1],
            }],
            mask,
            preprocessor: Preprocessor::new(PreprocessConfig::default()).unwrap(),
        };
        assert!(matches!(
            predictor.predict(inputs(1).view()),
            Err(HierarchyError::ShapeMismatch { expected: 2, actual: 3, .. })
        ));
    }

    #[test]
    fn test_missing_metadata_is_unknown_node() {
        let tree = two_level();
        let (_dir, registry) = trained(
            &tree,
            &[("root", vec![0.4, 0.6]), ("x", vec![0.25, 0.75])],
            PathWeighting::Normalized,
        );
        std::fs::remove_file(registry.metadata_path("x").unwrap()).unwrap();
        let result = HierarchicalPredictor::builder()
            .with_tree(tree)
            .with_registry(registry)
            .build();
        assert!(matches!(result, Err(HierarchyError::UnknownNode(id)) if id == "x"));
    }

    #[test]
    fn test_mask_for_other_tree_is_stale() {
        let tree = two_level();
        let (_dir, registry) = trained(
            &tree,
            &[("root", vec![0.4, 0.6]), ("x", vec![0.25, 0.75])],
            PathWeighting::Normalized,
        );
        let other = tree_with_extra_leaf();
        let result = HierarchicalPredictor::builder()
            .with_tree(other)
            .with_registry(registry)
            .build();
        assert!(matches!(result, Err(HierarchyError::StaleMask { .. })));
    }

    fn tree_with_extra_leaf() -> Tree {
        tree(&[
            ("root", None),
            ("x", Some("root")),
            ("y", Some("root")),
            ("a", Some("x")),
            ("b", Some("x")),
            ("c", Some("x")),
        ])
    }

    #[test]
    fn test_compose_handles_zero_probabilities() {
        let tree = two_level();
        let mask = MaskBuilder::new()
            .with_weighting(PathWeighting::Product)
            .build(&tree)
            .unwrap();
        // columns: root->x, root->y, x->a, x->b
        let edges = array![[1.0f32, 0.0, 0.0, 1.0]];
        let leaf = compose_leaf_probabilities(&edges.view(), &mask).unwrap();
        assert!(leaf.iter().all(|p| p.is_finite()));
        let b = mask.leaves().iter().position(|l| l == "b").unwrap();
        assert_abs_diff_eq!(leaf[[0, b]], 1.0, epsilon = 1e-5);

        let short = array![[1.0f32, 0.0]];
        assert!(compose_leaf_probabilities(&short.view(), &mask).is_err());
    }

    #[test]
    fn test_top_k() {
        let probs = LeafProbabilities {
            matrix: array![[0.1f32, 0.6, 0.3], [0.5, 0.2, 0.3]],
            leaves: vec!["a".into(), "b".into(), "c".into()],
        };
        let top = probs.top_k(2);
        assert_eq!(top[0], vec![("b".to_string(), 0.6), ("c".to_string(), 0.3)]);
        assert_eq!(top[1][0].0, "a");
        assert_eq!(probs.top_k(10)[0].len(), 3);
    }
}
