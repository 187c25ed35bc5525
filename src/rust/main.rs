use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use hierarch::{
    evaluate, resume_point, CommandTrainer, HierarchicalPredictor, ImageFolderSource,
    ImageStatistics, MaskBuilder, NodeModelRegistry, OptimizationLevel, PathWeighting,
    PreprocessConfig, Preprocessor, ResumePoint, RuntimeConfig, Split, SplitRatios,
    TrainConfigStore, TrainingProgress, TrainingScheduler, Tree,
};
use log::info;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct Common {
    /// Hierarchy CSV with an `id,parent_id[,name]` header
    #[arg(long)]
    hierarchy: PathBuf,
    /// Model registry directory (defaults to $HIERARCH_REGISTRY or the platform data dir)
    #[arg(long)]
    registry: Option<PathBuf>,
}

impl Common {
    fn load(&self) -> anyhow::Result<(Tree, NodeModelRegistry)> {
        let tree = Tree::from_path(&self.hierarchy)
            .with_context(|| format!("loading hierarchy {:?}", self.hierarchy))?;
        let registry = match &self.registry {
            Some(dir) => NodeModelRegistry::new(dir)?,
            None => NodeModelRegistry::new_default()?,
        };
        info!(
            "Hierarchy: {} nodes, {} leaves; registry at {:?}",
            tree.len(),
            tree.leaf_count(),
            registry.dir()
        );
        Ok((tree, registry))
    }
}

/// How each leaf's images are divided into train, validation and test.
#[derive(Args)]
struct SplitArgs {
    #[arg(long, default_value_t = 42)]
    seed: u64,
    #[arg(long, default_value_t = 0.70)]
    train_ratio: f64,
    #[arg(long, default_value_t = 0.15)]
    val_ratio: f64,
}

impl SplitArgs {
    fn source(&self, data: &Path, preprocessor: Preprocessor) -> anyhow::Result<ImageFolderSource> {
        Ok(ImageFolderSource::new(data, preprocessor)
            .with_ratios(SplitRatios {
                train: self.train_ratio,
                val: self.val_ratio,
            })?
            .with_seed(self.seed))
    }
}

#[derive(Subcommand)]
enum Command {
    /// Train every incomplete node, resuming after the last completed one
    Train {
        #[command(flatten)]
        common: Common,
        /// Image folder with one subdirectory per leaf id
        #[arg(long)]
        data: PathBuf,
        /// Program that fits one node model
        #[arg(long)]
        trainer: String,
        /// Extra argument passed to the trainer before the node arguments
        #[arg(long = "trainer-arg", allow_hyphen_values = true)]
        trainer_args: Vec<String>,
        /// Directory of per-node training configs (`<node>.json`, `default.json`)
        #[arg(long)]
        train_configs: Option<PathBuf>,
        /// Preprocessing config (`target_size`, `mean`, `std`)
        #[arg(long)]
        preprocess_config: Option<PathBuf>,
        #[command(flatten)]
        split: SplitArgs,
        /// Mask row weighting. `product` scores a leaf by the product of the
        /// conditionals along its path; the default `normalized` uses their
        /// geometric mean, so deep leaves are not penalized for path length.
        #[arg(long, value_enum, default_value_t = PathWeighting::Normalized)]
        weighting: PathWeighting,
    },
    /// Rebuild the hierarchy mask
    Mask {
        #[command(flatten)]
        common: Common,
        /// Mask row weighting. `product` scores a leaf by the product of the
        /// conditionals along its path; the default `normalized` uses their
        /// geometric mean, so deep leaves are not penalized for path length.
        #[arg(long, value_enum, default_value_t = PathWeighting::Normalized)]
        weighting: PathWeighting,
    },
    /// Predict leaf categories for images
    Predict {
        #[command(flatten)]
        common: Common,
        #[arg(long)]
        preprocess_config: Option<PathBuf>,
        /// Number of leaves to report per image
        #[arg(long, default_value_t = 5)]
        top_k: usize,
        #[arg(long, default_value_t = 0)]
        intra_threads: usize,
        #[arg(long, value_enum, default_value_t = OptimizationLevel::All)]
        optimization_level: OptimizationLevel,
        #[arg(required = true)]
        images: Vec<PathBuf>,
    },
    /// Report top-1/3/5 accuracy on the test split, overall and per leaf
    Evaluate {
        #[command(flatten)]
        common: Common,
        /// Image folder with one subdirectory per leaf id
        #[arg(long)]
        data: PathBuf,
        #[arg(long)]
        preprocess_config: Option<PathBuf>,
        #[command(flatten)]
        split: SplitArgs,
        #[arg(long, default_value_t = 16)]
        batch_size: usize,
    },
    /// Measure a raw image folder and derive its preprocessing config
    Stats {
        /// Folder with one subdirectory per class
        #[arg(long)]
        data: PathBuf,
        /// Images smaller than this in either dimension are skipped
        #[arg(long, default_value_t = 0)]
        min_size: u32,
        /// Measure channel statistics on every n-th usable image
        #[arg(long, default_value_t = 25)]
        sample_every: usize,
        /// Where to write the derived preprocessing config
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Show training progress and where the next run would start
    Inspect {
        #[command(flatten)]
        common: Common,
    },
}

fn load_preprocess_config(path: Option<&PathBuf>) -> anyhow::Result<PreprocessConfig> {
    Ok(match path {
        Some(path) => PreprocessConfig::from_path(path)?,
        None => PreprocessConfig::default(),
    })
}

fn main() -> anyhow::Result<()> {
    hierarch::init_logger();
    let cli = Cli::parse();
    let start_time = Instant::now();

    match cli.command {
        Command::Train {
            common,
            data,
            trainer,
            trainer_args,
            train_configs,
            preprocess_config,
            split,
            weighting,
        } => {
            let (tree, registry) = common.load()?;
            let preprocessor = Preprocessor::new(load_preprocess_config(preprocess_config.as_ref())?)?;
            let source = split.source(&data, preprocessor)?;
            let configs = match train_configs {
                Some(dir) => TrainConfigStore::new(dir)?,
                None => TrainConfigStore::builtin(),
            };
            let mut trainer = CommandTrainer::new(trainer)
                .with_args(trainer_args)
                .with_data_root(&data);
            if let Some(path) = preprocess_config {
                trainer = trainer.with_preprocess_config(path);
            }

            let report = TrainingScheduler::new(&tree, &registry, trainer, &source)
                .with_configs(configs)
                .with_mask_builder(MaskBuilder::new().with_weighting(weighting))
                .run()?;
            info!("=== Training finished in {:.2?} ===", start_time.elapsed());
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Mask { common, weighting } => {
            let (tree, registry) = common.load()?;
            let mask = MaskBuilder::new().with_weighting(weighting).build(&tree)?;
            registry.save_mask(&mask)?;
            println!(
                "Wrote {} x {} mask to {:?}",
                mask.num_leaves(),
                mask.num_edges(),
                registry.mask_path()
            );
        }
        Command::Predict {
            common,
            preprocess_config,
            top_k,
            intra_threads,
            optimization_level,
            images,
        } => {
            let (tree, registry) = common.load()?;
            let predictor = HierarchicalPredictor::builder()
                .with_tree(tree)
                .with_registry(registry)
                .with_preprocess_config(load_preprocess_config(preprocess_config.as_ref())?)
                .with_runtime_config(RuntimeConfig {
                    intra_threads,
                    optimization_level,
                    ..RuntimeConfig::default()
                })
                .build()?;
            info!("Predictor ready (took {:.2?})", start_time.elapsed());

            let probabilities = predictor.predict_paths(&images[..])?;
            for (image, ranked) in images.iter().zip(probabilities.top_k(top_k)) {
                println!("\n{}", image.display());
                for (leaf, probability) in ranked {
                    println!("  {}: {:.1}%", leaf, probability * 100.0);
                }
            }
            info!("Classified {} images in {:.2?}", images.len(), start_time.elapsed());
        }
        Command::Evaluate {
            common,
            data,
            preprocess_config,
            split,
            batch_size,
        } => {
            let (tree, registry) = common.load()?;
            let predictor = HierarchicalPredictor::builder()
                .with_tree(tree)
                .with_registry(registry)
                .with_preprocess_config(load_preprocess_config(preprocess_config.as_ref())?)
                .build()?;
            let source = split.source(&data, predictor.preprocessor().clone())?;
            let report = evaluate(&predictor, &source, Split::Test, batch_size)?;
            info!("Evaluation finished in {:.2?}", start_time.elapsed());
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Stats {
            data,
            min_size,
            sample_every,
            output,
        } => {
            let stats = ImageStatistics::scan(&data, min_size, sample_every)
                .with_context(|| format!("scanning {:?}", data))?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
            if let Some(path) = output {
                stats.preprocess_config()?.save(&path)?;
                println!("Wrote preprocessing config to {:?}", path);
            }
        }
        Command::Inspect { common } => {
            let (tree, registry) = common.load()?;
            let progress = TrainingProgress::scan(&tree, &registry);
            for node in tree.internal_nodes() {
                let status = if progress.contains(&node) { "complete" } else { "pending" };
                println!(
                    "{:<24} {:<10} {} children",
                    tree.display_name(&node)?,
                    status,
                    tree.children(&node)?.len()
                );
            }
            match resume_point(&tree, &progress)? {
                ResumePoint::Fresh => println!("Next run starts from scratch"),
                ResumePoint::Resume { frontier, start } => {
                    println!("Next run resumes from {} (first incomplete node: {})", start, frontier)
                }
                ResumePoint::AlreadyComplete => println!("All nodes are trained"),
            }
            let mask = match registry.load_mask() {
                Ok(mask) => match mask.ensure_matches(&tree) {
                    Ok(()) => "current".to_string(),
                    Err(e) => format!("stale ({})", e),
                },
                Err(_) => "missing".to_string(),
            };
            println!("Mask: {}", mask);

            let known = tree.internal_nodes();
            let orphaned: Vec<String> = registry
                .completed_nodes()?
                .into_iter()
                .filter(|id| !known.contains(id))
                .collect();
            if !orphaned.is_empty() {
                println!("Stored nodes not in this hierarchy: {}", orphaned.join(", "));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_weighting_help_names_product() {
        let mut cmd = Cli::command();
        let help = cmd
            .find_subcommand_mut("train")
            .unwrap()
            .render_long_help()
            .to_string();
        assert!(help.contains("product of the"));
        assert!(help.contains("[default: normalized]"));
    }

    #[test]
    fn test_split_flags_reach_source() {
        let cli = Cli::parse_from([
            "hierarch", "evaluate", "--hierarchy", "h.csv", "--data", "images", "--seed", "7",
            "--train-ratio", "0.6",
        ]);
        match cli.command {
            Command::Evaluate { split, .. } => {
                assert_eq!(split.seed, 7);
                assert_eq!(split.train_ratio, 0.6);
                assert_eq!(split.val_ratio, 0.15);
                let pre = Preprocessor::new(PreprocessConfig::default()).unwrap();
                assert!(split.source(Path::new("images"), pre).is_ok());
            }
            _ => panic!("expected evaluate"),
        }
    }
}
