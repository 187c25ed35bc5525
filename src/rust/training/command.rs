use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{bail, Context};
use log::{debug, info};
use serde::Serialize;

use super::config::TrainConfig;
use super::scheduler::{NodeTrainer, TrainingJob};
use crate::data::{LabelGroup, Split};

#[derive(Debug, Serialize)]
struct ManifestSample {
    path: PathBuf,
    class: usize,
}

/// The test split is withheld for evaluation.
#[derive(Debug, Serialize)]
struct ManifestSplits {
    train: Vec<ManifestSample>,
    val: Vec<ManifestSample>,
}

/// Everything the external trainer reads for one node.
#[derive(Debug, Serialize)]
struct Manifest<'a> {
    node: &'a str,
    num_classes: usize,
    classes: &'a [LabelGroup],
    config: &'a TrainConfig,
    splits: ManifestSplits,
    data_root: Option<&'a Path>,
    preprocess_config: Option<&'a Path>,
}

fn listed(job: &TrainingJob<'_>, split: Split) -> crate::error::Result<Vec<ManifestSample>> {
    Ok(job
        .samples(split)?
        .into_iter()
        .map(|(path, class)| ManifestSample { path, class })
        .collect())
}

/// Delegates fitting to an external program.
///
/// The program is invoked as `<program> [args..] --node <id> --manifest <json> --output <artifact>`
/// and must write an ONNX model to `--output` and exit with status zero. The manifest
/// lists the exact train and validation samples with their class indices, so the
/// program sees the same split as every other consumer of the source.
#[derive(Debug, Clone)]
pub struct CommandTrainer {
    program: OsString,
    args: Vec<OsString>,
    data_root: Option<PathBuf>,
    preprocess_config: Option<PathBuf>,
}

impl CommandTrainer {
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            data_root: None,
            preprocess_config: None,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Image folder the program should read samples from.
    pub fn with_data_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.data_root = Some(root.into());
        self
    }

    pub fn with_preprocess_config(mut self, path: impl Into<PathBuf>) -> Self {
        self.preprocess_config = Some(path.into());
        self
    }
}

impl NodeTrainer for CommandTrainer {
    fn fit(&mut self, job: &TrainingJob<'_>, artifact: &Path) -> anyhow::Result<()> {
        let manifest = Manifest {
            node: job.node(),
            num_classes: job.num_classes(),
            classes: job.groups(),
            config: job.config(),
            splits: ManifestSplits {
                train: listed(job, Split::Train)?,
                val: listed(job, Split::Val)?,
            },
            data_root: self.data_root.as_deref(),
            preprocess_config: self.preprocess_config.as_deref(),
        };
        debug!(
            "Manifest for node {} lists {} train and {} val samples",
            job.node(),
            manifest.splits.train.len(),
            manifest.splits.val.len()
        );
        let manifest_path = artifact.with_extension("manifest.json");
        fs::write(&manifest_path, serde_json::to_vec_pretty(&manifest)?)
            .with_context(|| format!("writing manifest {:?}", manifest_path))?;

        info!("Running {:?} for node {}", self.program, job.node());
        let status = Command::new(&self.program)
            .args(&self.args)
            .arg("--node")
            .arg(job.node())
            .arg("--manifest")
            .arg(&manifest_path)
            .arg("--output")
            .arg(artifact)
            .status()
            .with_context(|| format!("failed to start {:?}", self.program));

        let _ = fs::remove_file(&manifest_path);
        let status = status?;
        debug!("Trainer for node {} exited with {}", job.node(), status);
        if !status.success() {
            bail!("{:?} exited with {}", self.program, status);
        }
        Ok(())
    }
}
