// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use clap::{ArgAction, Args, Parser, Subcommand, ValueHint};
use serde::{Deserialize, Serialize};
use spiral_config::ConfigLayering;
use st_tensor::Tensor;
use st_unlearn::checkpoint::load_model;
use st_unlearn::features::export_split;
use st_unlearn::runner::{build_model, load_original_model};
use st_unlearn::{
    aggregate_unlearning_score, run_unlearning, CaseRegistry, CheckpointFormat, JsonFileStore,
    LabeledSample, RunConfig, SplitAccuracy, UnlearnReport, UnlearningDataset,
};
use std::error::Error;
use std::fs;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use tracing::info;

type DynError = Box<dyn Error>;

type Result<T> = std::result::Result<T, DynError>;

/// Flattened samples on disk: `rows` inputs of `cols` values plus one label each.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct DiskDataset {
    rows: usize,
    cols: usize,
    data: Vec<f32>,
    labels: Vec<usize>,
}

impl DiskDataset {
    fn into_samples(self) -> Result<Vec<LabeledSample>> {
        if self.rows == 0 || self.cols == 0 {
            return Err(invalid_input("dataset must have non-zero dimensions"));
        }
        if self.data.len() != self.rows * self.cols {
            return Err(Box::new(io::Error::new(
                ErrorKind::InvalidData,
                format!(
                    "dataset payload has {} values but expected {} (rows * cols)",
                    self.data.len(),
                    self.rows * self.cols
                ),
            )));
        }
        if self.labels.len() != self.rows {
            return Err(Box::new(io::Error::new(
                ErrorKind::InvalidData,
                format!("{} labels for {} rows", self.labels.len(), self.rows),
            )));
        }
        let cols = self.cols;
        self.data
            .chunks(cols)
            .zip(self.labels)
            .map(|(row, label)| -> Result<LabeledSample> {
                let input = Tensor::from_vec(1, cols, row.to_vec())
                    .map_err(|err| Box::new(err) as DynError)?;
                Ok((input, label))
            })
            .collect()
    }
}

#[derive(Parser)]
#[command(
    author,
    version,
    about = "Class-level machine unlearning driver for SpiralTorch ResNets"
)]
struct Cli {
    /// Base configuration layer (TOML)
    #[arg(long, global = true, value_hint = ValueHint::FilePath)]
    config: Option<PathBuf>,

    /// Run-level override layer (JSON), merged on top of --config
    #[arg(long, global = true, value_hint = ValueHint::FilePath)]
    overrides: Option<PathBuf>,

    /// Registry file; defaults to `paths.registry` from the configuration
    #[arg(long, global = true, value_hint = ValueHint::FilePath)]
    registry: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Unlearn the configured forgetting set and record both cases
    Run(RunArgs),

    /// Print the aggregate unlearning score of a recorded case
    Aus(AusArgs),

    /// Write penultimate-layer features of a checkpoint to `paths.features_dir`
    ExportFeatures(ExportFeaturesArgs),
}

#[derive(Args)]
struct RunArgs {
    /// Training samples (JSON, DiskDataset format)
    #[arg(long, value_hint = ValueHint::FilePath)]
    train: PathBuf,

    /// Held-out samples (JSON, DiskDataset format)
    #[arg(long, value_hint = ValueHint::FilePath)]
    test: PathBuf,

    /// Original model weights; defaults to the configured checkpoint name
    #[arg(long, value_hint = ValueHint::FilePath, conflicts_with = "from_scratch")]
    checkpoint: Option<PathBuf>,

    /// Start from freshly initialised weights instead of a checkpoint
    #[arg(long, action = ArgAction::SetTrue)]
    from_scratch: bool,

    /// Override the configured unlearning method
    #[arg(long)]
    method: Option<String>,

    /// Save the unlearned model under `paths.checkpoint_dir`
    #[arg(long, action = ArgAction::SetTrue)]
    save_checkpoint: bool,

    /// Destination for a JSON summary of the run
    #[arg(long, value_hint = ValueHint::FilePath)]
    report: Option<PathBuf>,
}

#[derive(Args)]
struct AusArgs {
    /// Unlearning method name as stored in the registry
    #[arg(long)]
    method: String,

    /// Forgetting-set key, e.g. "[0, 3]"
    #[arg(long)]
    forgetting_set: String,

    /// Dataset name; defaults to `dataset.name`
    #[arg(long)]
    dataset: Option<String>,
}

#[derive(Args)]
struct ExportFeaturesArgs {
    /// Samples to embed (JSON, DiskDataset format)
    #[arg(long, value_hint = ValueHint::FilePath)]
    data: PathBuf,

    /// Model weights (.json or bincode)
    #[arg(long, value_hint = ValueHint::FilePath)]
    checkpoint: PathBuf,

    /// Split label used in the output file names
    #[arg(long, default_value = "train")]
    split: String,

    /// Method label used in the output file names; defaults to `method`
    #[arg(long)]
    method: Option<String>,
}

#[derive(Serialize)]
struct RunSummary<'a> {
    dataset: &'a str,
    method: &'a str,
    forgetting_set: &'a str,
    original: SplitAccuracy,
    unlearned: SplitAccuracy,
    aus: f64,
    checkpoint: Option<&'a Path>,
    report: &'a UnlearnReport,
}

fn main() {
    if let Err(err) = try_main() {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();
    spiral_config::tracing::init_tracing()?;
    let mut config = load_config(&cli)?;
    if let Some(path) = &cli.registry {
        config.paths.registry = path.clone();
    }
    match &cli.command {
        Command::Run(args) => run(&mut config, args),
        Command::Aus(args) => print_aus(&config, args),
        Command::ExportFeatures(args) => export_features(&config, args),
    }
}

fn load_config(cli: &Cli) -> Result<RunConfig> {
    let layering = if cli.config.is_none() && cli.overrides.is_none() {
        ConfigLayering::discover()
    } else {
        let mut layering = ConfigLayering::default();
        if let Some(base) = &cli.config {
            layering = layering.with_base(base);
        }
        if let Some(run) = &cli.overrides {
            layering = layering.with_run(run);
        }
        layering
    };
    Ok(RunConfig::load(layering)?)
}

fn run(config: &mut RunConfig, args: &RunArgs) -> Result<()> {
    if let Some(method) = &args.method {
        config.method = method.clone();
        config.validate()?;
    }
    if args.save_checkpoint {
        config.paths.save_checkpoints = true;
    }
    let train = read_dataset(&args.train)?;
    let test = read_dataset(&args.test)?;
    let model = if args.from_scratch {
        build_model(config)?
    } else if let Some(path) = &args.checkpoint {
        let mut model = build_model(config)?;
        load_model(&mut model, path, CheckpointFormat::from_path(path))?;
        model
    } else {
        load_original_model(config, CheckpointFormat::default())?
    };

    let registry = CaseRegistry::new(JsonFileStore::new(config.paths.registry.clone()));
    let outcome = run_unlearning(config, model, train, test, &registry, None)?;
    println!(
        "[{method}] forget {key}: retain {retain:.2}% -> {retain_after:.2}%, forget {forget:.2}% -> {forget_after:.2}%, AUS {aus:.4}",
        method = outcome.kind,
        key = outcome.forgetting_set,
        retain = outcome.original.accuracy_retaining,
        retain_after = outcome.unlearned.accuracy_retaining,
        forget = outcome.original.accuracy_forgetting,
        forget_after = outcome.unlearned.accuracy_forgetting,
        aus = outcome.aus,
    );

    if let Some(path) = &args.report {
        let summary = RunSummary {
            dataset: &config.dataset.name,
            method: outcome.kind.name(),
            forgetting_set: &outcome.forgetting_set,
            original: outcome.original,
            unlearned: outcome.unlearned,
            aus: outcome.aus,
            checkpoint: outcome.checkpoint.as_deref(),
            report: &outcome.report,
        };
        write_json(&summary, path)?;
        info!(path = %path.display(), "wrote run summary");
    }
    Ok(())
}

fn print_aus(config: &RunConfig, args: &AusArgs) -> Result<()> {
    let dataset = args.dataset.as_deref().unwrap_or(&config.dataset.name);
    let registry = CaseRegistry::new(JsonFileStore::new(config.paths.registry.clone()));
    let score = aggregate_unlearning_score(&registry, dataset, &args.method, &args.forgetting_set)?;
    println!("{score:.6}");
    Ok(())
}

fn export_features(config: &RunConfig, args: &ExportFeaturesArgs) -> Result<()> {
    let samples = read_dataset(&args.data)?;
    let mut model = build_model(config)?;
    load_model(&mut model, &args.checkpoint, CheckpointFormat::from_path(&args.checkpoint))?;

    let forget = config.forget.resolve(config.dataset.num_classes, config.seed())?;
    let dataset = UnlearningDataset::wrap_classes(samples, &forget)?;
    let loader = dataset.evaluation_loader(config.train.batch_size);
    let method = args.method.as_deref().unwrap_or(&config.method);
    let split = export_split(
        &model,
        &loader,
        &config.paths.features_dir,
        &args.split,
        method,
        forget.forget().len(),
    )?;
    println!(
        "exported {} rows of {} features to {}",
        split.labels.len(),
        split.features.shape().1,
        config.paths.features_dir.display()
    );
    Ok(())
}

fn read_dataset(path: &Path) -> Result<Vec<LabeledSample>> {
    let contents = fs::read_to_string(path)?;
    let disk: DiskDataset = serde_json::from_str(&contents)?;
    disk.into_samples()
}

fn write_json<T: Serialize>(value: &T, path: &Path) -> Result<()> {
    ensure_parent_dir(path)?;
    fs::write(path, serde_json::to_string_pretty(value)?)?;
    Ok(())
}

fn ensure_parent_dir(path: &Path) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

fn invalid_input(message: &str) -> DynError {
    Box::new(io::Error::new(ErrorKind::InvalidInput, message.to_string()))
}
