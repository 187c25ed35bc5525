use std::collections::BTreeSet;

use log::{debug, info};

use crate::error::Result;
use crate::hierarchy::{NodeId, Tree};
use crate::registry::NodeModelRegistry;

/// The set of internal nodes whose artifacts are already persisted.
///
/// Computed once at the start of a run and threaded through the scheduler.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrainingProgress {
    completed: BTreeSet<NodeId>,
}

impl TrainingProgress {
    pub fn new<I, S>(completed: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<NodeId>,
    {
        Self {
            completed: completed.into_iter().map(Into::into).collect(),
        }
    }

    /// Checks every internal node of `tree` against the registry.
    ///
    /// A node trained for a different set of children than the tree now has is
    /// not complete and will be retrained.
    pub fn scan(tree: &Tree, registry: &NodeModelRegistry) -> Self {
        let progress = Self::new(
            tree.internal_nodes()
                .into_iter()
                .filter(|id| registry.has_model(id) && Self::children_match(tree, registry, id)),
        );
        debug!(
            "{} of {} internal nodes already complete",
            progress.len(),
            tree.internal_nodes().len()
        );
        progress
    }

    fn children_match(tree: &Tree, registry: &NodeModelRegistry, id: &str) -> bool {
        match (registry.load_metadata(id), tree.children(id)) {
            (Ok(metadata), Ok(children)) if metadata.children.as_slice() == children => true,
            (Ok(metadata), Ok(children)) => {
                info!(
                    "Node {} was trained for {:?} but now has children {:?}; retraining",
                    id, metadata.children, children
                );
                false
            }
            _ => false,
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.completed.contains(id)
    }

    /// Leaves never need a model, so they count as complete.
    pub fn is_complete(&self, tree: &Tree, id: &str) -> Result<bool> {
        Ok(tree.is_leaf(id)? || self.contains(id))
    }

    pub fn mark_complete(&mut self, id: impl Into<NodeId>) {
        self.completed.insert(id.into());
    }

    pub fn len(&self) -> usize {
        self.completed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.completed.is_empty()
    }
}
