use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};

use anyhow::anyhow;
use log::{debug, error, info};
use serde::Serialize;

use super::config::{TrainConfig, TrainConfigStore};
use super::prefetch::{Prefetcher, DEFAULT_CAPACITY};
use super::progress::TrainingProgress;
use crate::data::{Batch, BatchSource, LabelGroup, Split};
use crate::error::{HierarchyError, Result};
use crate::hierarchy::{MaskBuilder, NodeId, Tree};
use crate::registry::{NodeMetadata, NodeModelRegistry};

/// Fits one node model. Implementations write the fitted artifact to `artifact`.
pub trait NodeTrainer {
    fn fit(&mut self, job: &TrainingJob<'_>, artifact: &Path) -> anyhow::Result<()>;
}

impl<T: NodeTrainer + ?Sized> NodeTrainer for &mut T {
    fn fit(&mut self, job: &TrainingJob<'_>, artifact: &Path) -> anyhow::Result<()> {
        (**self).fit(job, artifact)
    }
}

impl<T: NodeTrainer + ?Sized> NodeTrainer for Box<T> {
    fn fit(&mut self, job: &TrainingJob<'_>, artifact: &Path) -> anyhow::Result<()> {
        (**self).fit(job, artifact)
    }
}

/// Everything a trainer needs to fit the model of one internal node.
pub struct TrainingJob<'a> {
    node: &'a str,
    groups: Vec<LabelGroup>,
    config: TrainConfig,
    source: &'a dyn BatchSource,
}

impl<'a> TrainingJob<'a> {
    pub fn node(&self) -> &str {
        self.node
    }

    /// One group per direct child, in class-index order.
    pub fn groups(&self) -> &[LabelGroup] {
        &self.groups
    }

    pub fn num_classes(&self) -> usize {
        self.groups.len()
    }

    pub fn config(&self) -> &TrainConfig {
        &self.config
    }

    /// Sample locations with class indices, for trainers that load data themselves.
    pub fn samples(&self, split: Split) -> Result<Vec<(PathBuf, usize)>> {
        self.source.samples(&self.groups, split)
    }

    pub fn train_batches(&self) -> Result<Prefetcher<Batch>> {
        self.batches(Split::Train)
    }

    pub fn val_batches(&self) -> Result<Prefetcher<Batch>> {
        self.batches(Split::Val)
    }

    fn batches(&self, split: Split) -> Result<Prefetcher<Batch>> {
        let stream = self
            .source
            .batch_iterator(&self.groups, split, self.config.batch_size)?;
        Prefetcher::spawn(stream, DEFAULT_CAPACITY)
    }
}

/// Where a training run starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumePoint {
    /// Nothing usable is persisted; start at the root.
    Fresh,
    /// Restart at the parent of the first incomplete node in breadth-first order.
    Resume { frontier: NodeId, start: NodeId },
    /// Every internal node is complete.
    AlreadyComplete,
}

/// Finds where to (re)start, walking breadth-first through completed nodes.
pub fn resume_point(tree: &Tree, progress: &TrainingProgress) -> Result<ResumePoint> {
    let root = tree.root();
    let mut queue = VecDeque::from([root]);
    while let Some(node) = queue.pop_front() {
        if !progress.is_complete(tree, node)? {
            if node == root {
                return Ok(ResumePoint::Fresh);
            }
            let start = tree
                .parent(node)?
                .ok_or_else(|| HierarchyError::UnknownNode(node.to_string()))?;
            return Ok(ResumePoint::Resume {
                frontier: node.to_string(),
                start: start.to_string(),
            });
        }
        queue.extend(tree.children(node)?.iter().map(String::as_str));
    }
    Ok(ResumePoint::AlreadyComplete)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Untrained,
    Training,
    Trained,
    SingleLabelSkipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    AlreadyComplete,
}

/// Summary of one orchestration run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub outcome: RunOutcome,
    /// Node the first breadth-first pass started from
    pub start_node: Option<NodeId>,
    /// Final state of every internal node
    pub states: BTreeMap<NodeId, NodeState>,
    /// Nodes fitted during this run, in order
    pub trained: Vec<NodeId>,
    pub mask_written: bool,
}

/// Trains the internal nodes of a tree breadth-first, one at a time, then writes
/// the hierarchy mask.
pub struct TrainingScheduler<'a, T: NodeTrainer> {
    tree: &'a Tree,
    registry: &'a NodeModelRegistry,
    trainer: T,
    source: &'a dyn BatchSource,
    configs: TrainConfigStore,
    mask_builder: MaskBuilder,
}

impl<'a, T: NodeTrainer> TrainingScheduler<'a, T> {
    pub fn new(
        tree: &'a Tree,
        registry: &'a NodeModelRegistry,
        trainer: T,
        source: &'a dyn BatchSource,
    ) -> Self {
        Self {
            tree,
            registry,
            trainer,
            source,
            configs: TrainConfigStore::builtin(),
            mask_builder: MaskBuilder::new(),
        }
    }

    pub fn with_configs(mut self, configs: TrainConfigStore) -> Self {
        self.configs = configs;
        self
    }

    pub fn with_mask_builder(mut self, mask_builder: MaskBuilder) -> Self {
        self.mask_builder = mask_builder;
        self
    }

    /// Completed nodes as currently persisted.
    pub fn progress(&self) -> TrainingProgress {
        TrainingProgress::scan(self.tree, self.registry)
    }

    /// Runs training to completion.
    ///
    /// A trainer failure aborts the run; artifacts of nodes finished earlier stay
    /// in place so the next run resumes after them.
    pub fn run(&mut self) -> Result<RunReport> {
        if self.tree.edges().is_empty() {
            return Err(HierarchyError::EmptyHierarchy);
        }

        let mut progress = self.progress();
        let mut states = self.initial_states(&progress)?;
        self.preflight(&progress)?;

        let first_start = match resume_point(self.tree, &progress)? {
            ResumePoint::AlreadyComplete => {
                info!("All nodes are already trained");
                let mask_written = match self.stored_mask_is_current() {
                    Ok(()) => false,
                    Err(e) => {
                        info!("Rebuilding hierarchy mask: {}", e);
                        self.write_mask()?;
                        true
                    }
                };
                return Ok(RunReport {
                    outcome: RunOutcome::AlreadyComplete,
                    start_node: None,
                    states,
                    trained: Vec::new(),
                    mask_written,
                });
            }
            ResumePoint::Fresh => {
                info!("Starting training from scratch");
                self.tree.root().to_string()
            }
            ResumePoint::Resume { frontier, start } => {
                info!(
                    "Resuming training from node {} (first incomplete node: {})",
                    start, frontier
                );
                start
            }
        };

        let mut trained = Vec::new();
        let mut start = first_start.clone();
        loop {
            self.train_from(&start, &mut progress, &mut states, &mut trained)?;

            // A pass only covers the subtree of its start node; continue with the
            // next incomplete region, if any.
            match resume_point(self.tree, &progress)? {
                ResumePoint::AlreadyComplete => break,
                ResumePoint::Fresh => start = self.tree.root().to_string(),
                ResumePoint::Resume { frontier, start: next } => {
                    debug!("Continuing with node {} (first incomplete node: {})", next, frontier);
                    start = next;
                }
            }
        }

        self.write_mask()?;
        info!("Finished training hierarchy ({} nodes fitted)", trained.len());

        Ok(RunReport {
            outcome: RunOutcome::Completed,
            start_node: Some(first_start),
            states,
            trained,
            mask_written: true,
        })
    }

    fn initial_states(&self, progress: &TrainingProgress) -> Result<BTreeMap<NodeId, NodeState>> {
        let mut states = BTreeMap::new();
        for node in self.tree.internal_nodes() {
            let state = if !progress.contains(&node) {
                NodeState::Untrained
            } else if self.tree.children(&node)?.len() == 1 {
                NodeState::SingleLabelSkipped
            } else {
                NodeState::Trained
            };
            states.insert(node, state);
        }
        Ok(states)
    }

    /// Resolves the config of every node still to be fitted, so a bad config file
    /// fails the run before any training starts.
    fn preflight(&self, progress: &TrainingProgress) -> Result<()> {
        for node in self.tree.internal_nodes() {
            if !progress.contains(&node) && self.tree.children(&node)?.len() > 1 {
                self.configs.resolve(&node)?;
                self.registry.model_path(&node)?;
            }
        }
        Ok(())
    }

    fn train_from(
        &mut self,
        start: &str,
        progress: &mut TrainingProgress,
        states: &mut BTreeMap<NodeId, NodeState>,
        trained: &mut Vec<NodeId>,
    ) -> Result<()> {
        let mut queue = VecDeque::from([start.to_string()]);
        while let Some(node) = queue.pop_front() {
            let children = self.tree.children(&node)?.to_vec();
            queue.extend(children.iter().cloned());

            if children.is_empty() || progress.contains(&node) {
                continue;
            }

            if children.len() == 1 {
                info!("Node {} has a single child; no model needed", node);
                self.registry
                    .save_metadata(&node, &NodeMetadata::new(children))?;
                states.insert(node.clone(), NodeState::SingleLabelSkipped);
            } else {
                states.insert(node.clone(), NodeState::Training);
                self.train_node(&node, &children)?;
                states.insert(node.clone(), NodeState::Trained);
                trained.push(node.clone());
            }
            progress.mark_complete(node);
        }
        Ok(())
    }

    fn train_node(&mut self, node: &str, children: &[NodeId]) -> Result<()> {
        let config = self.configs.resolve(node)?;
        let groups = children
            .iter()
            .map(|child| {
                Ok(LabelGroup {
                    label: child.clone(),
                    leaves: self.tree.leaf_descendants(child)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let artifact = self.registry.model_path(node)?;

        info!("Training node {} ({} classes)", node, children.len());
        let job = TrainingJob {
            node,
            groups,
            config,
            source: self.source,
        };
        self.trainer.fit(&job, &artifact).map_err(|source| {
            error!("Training failed for node {}: {:#}", node, source);
            HierarchyError::Training {
                node: node.to_string(),
                source,
            }
        })?;

        if !artifact.exists() {
            error!("Trainer wrote no artifact for node {}", node);
            return Err(HierarchyError::Training {
                node: node.to_string(),
                source: anyhow!("trainer reported success but {:?} does not exist", artifact),
            });
        }

        self.registry
            .save_metadata(node, &NodeMetadata::new(children.to_vec()))?;
        info!("Finished training node {}", node);
        Ok(())
    }

    /// Fails if the persisted mask is missing, was built for another tree or
    /// uses a different weighting.
    fn stored_mask_is_current(&self) -> Result<()> {
        let mask = self.registry.load_mask()?;
        mask.ensure_matches(self.tree)?;
        if mask.weighting() != self.mask_builder.weighting() {
            return Err(HierarchyError::Config(format!(
                "mask uses {} weighting, {} requested",
                mask.weighting().as_str(),
                self.mask_builder.weighting().as_str()
            )));
        }
        Ok(())
    }

    fn write_mask(&self) -> Result<()> {
        info!("Creating hierarchy mask matrix");
        let mask = self.mask_builder.build(self.tree)?;
        self.registry.save_mask(&mask)
    }
}
