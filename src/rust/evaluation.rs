//! Top-k accuracy of a trained hierarchy on held-out samples.

use std::collections::BTreeMap;

use log::{debug, info};
use serde::Serialize;

use crate::data::{BatchSource, LabelGroup, Split};
use crate::error::{HierarchyError, Result};
use crate::hierarchy::NodeId;
use crate::predictor::HierarchicalPredictor;

const TOP_K: [usize; 3] = [1, 3, 5];

/// Fraction of samples whose true leaf ranks within the top 1, 3 and 5.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Accuracy {
    pub count: usize,
    pub top1: f64,
    pub top3: f64,
    pub top5: f64,
}

#[derive(Debug, Clone, Copy, Default)]
struct Hits {
    count: usize,
    within: [usize; 3],
}

impl Hits {
    fn record(&mut self, rank: Option<usize>) {
        self.count += 1;
        for (hits, k) in self.within.iter_mut().zip(TOP_K) {
            if rank.map_or(false, |r| r < k) {
                *hits += 1;
            }
        }
    }

    fn accuracy(&self) -> Accuracy {
        let rate = |hits: usize| {
            if self.count == 0 {
                0.0
            } else {
                hits as f64 / self.count as f64
            }
        };
        Accuracy {
            count: self.count,
            top1: rate(self.within[0]),
            top3: rate(self.within[1]),
            top5: rate(self.within[2]),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EvaluationReport {
    pub split: Split,
    pub overall: Accuracy,
    /// Keyed by leaf id; leaves without samples report a zero count
    pub per_leaf: BTreeMap<NodeId, Accuracy>,
}

/// One class per leaf, in the predictor's leaf order.
pub fn leaf_groups(leaves: &[NodeId]) -> Vec<LabelGroup> {
    leaves
        .iter()
        .map(|leaf| LabelGroup {
            label: leaf.clone(),
            leaves: vec![leaf.clone()],
        })
        .collect()
}

/// Runs the predictor over one split of `source` and scores the leaf rankings.
pub fn evaluate(
    predictor: &HierarchicalPredictor,
    source: &dyn BatchSource,
    split: Split,
    batch_size: usize,
) -> Result<EvaluationReport> {
    let leaves = predictor.leaves();
    let groups = leaf_groups(leaves);
    let mut overall = Hits::default();
    let mut per_leaf = vec![Hits::default(); leaves.len()];

    for batch in source.batch_iterator(&groups, split, batch_size)? {
        let batch = batch?;
        let probabilities = predictor.predict(batch.inputs.view())?;
        let ranked = probabilities.top_k(TOP_K[TOP_K.len() - 1]);
        for (row, &label) in ranked.iter().zip(&batch.labels) {
            let truth = leaves.get(label).ok_or_else(|| {
                HierarchyError::Data(format!(
                    "Sample label {} is outside the {} leaves",
                    label,
                    leaves.len()
                ))
            })?;
            let rank = row.iter().position(|(leaf, _)| leaf == truth);
            overall.record(rank);
            per_leaf[label].record(rank);
        }
        debug!("Evaluated {} samples", overall.count);
    }

    let report = EvaluationReport {
        split,
        overall: overall.accuracy(),
        per_leaf: leaves
            .iter()
            .cloned()
            .zip(per_leaf.iter().map(Hits::accuracy))
            .collect(),
    };
    info!(
        "{:?} accuracy over {} samples: top1 {:.2}, top3 {:.2}, top5 {:.2}",
        split,
        report.overall.count,
        report.overall.top1,
        report.overall.top3,
        report.overall.top5
    );
    Ok(report)
}
