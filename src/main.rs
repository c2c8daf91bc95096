// SPDX-License-Identifier: MIT OR Apache-2.0

//! evo-steer CLI: multi-scale activation steering sweeps over sequence models

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use evo_steer::output::run_basename;
use evo_steer::{
    ModelConfig, OutputType, ReferenceModel, RunInputs, SeqTokenizer, SteeringConfig,
    SteeringVector, SweepConfig, run_sweep, select_device,
};
use tracing::{Level, info, warn};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "evo-steer")]
#[command(about = "Score sequences under scaled activation steering")]
#[command(version)]
struct Cli {
    /// FASTA file with the sequences to score
    #[arg(long)]
    fasta_file: PathBuf,

    /// Output directory for results
    #[arg(long, default_value = ".")]
    output_dir: PathBuf,

    /// logits, logits_and_embedding, embedding or summary_only
    #[arg(long, default_value = "logits")]
    output_type: OutputType,

    /// Layers to save embeddings from (comma and/or space separated)
    #[arg(long, num_args = 1..)]
    embedding_layers: Vec<String>,

    /// TSV with `seq_id  start  end` rows restricting saved positions
    #[arg(long)]
    query_table: Option<PathBuf>,

    /// Layer whose output receives the steering vector
    #[arg(long)]
    steering_layer: Option<String>,

    /// TSV whose first column is the steering vector
    #[arg(long)]
    steering_vector: Option<PathBuf>,

    /// Comma-separated scales; prefix with `n` to negate (e.g. "1,n0.5")
    #[arg(long, allow_hyphen_values = true)]
    steering_scales: Option<String>,

    /// Abort when a steering vector cannot be installed instead of skipping the scale
    #[arg(long)]
    strict_steering: bool,

    /// Model directory (config.json, model.safetensors, optional tokenizer.json)
    #[arg(long, required_unless_present = "synthetic", conflicts_with = "synthetic")]
    model_dir: Option<PathBuf>,

    /// Use a deterministic synthetic model instead of loading weights
    #[arg(long)]
    synthetic: bool,

    /// Override the tokenizer with a tokenizer.json file
    #[arg(long)]
    tokenizer: Option<PathBuf>,

    /// Force CPU mode
    #[arg(long)]
    cpu: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    // Configuration (fails before any inference)
    let vector = cli
        .steering_vector
        .as_ref()
        .map(|path| {
            SteeringVector::load(path)
                .with_context(|| format!("loading steering vector {}", path.display()))
        })
        .transpose()?;
    let steering = SteeringConfig::new(
        cli.steering_layer.clone(),
        vector,
        cli.steering_scales.as_deref(),
    )?;
    let config = SweepConfig::new(cli.output_type, &cli.embedding_layers, steering)?
        .with_strict_steering(cli.strict_steering);

    // Inputs
    let inputs = RunInputs::load(&cli.fasta_file, cli.query_table.as_deref())
        .with_context(|| format!("loading inputs from {}", cli.fasta_file.display()))?;
    if inputs.store.is_empty() {
        info!("no sequences found in {}", cli.fasta_file.display());
        return Ok(());
    }
    info!(
        "Loaded {} sequences ({} query ranges)",
        inputs.store.len(),
        inputs.queries.as_ref().map_or(0, |q| q.len())
    );

    // Model
    let device = select_device(cli.cpu)?;
    let mut model = match &cli.model_dir {
        Some(dir) => ReferenceModel::load(dir, &device)
            .with_context(|| format!("loading model from {}", dir.display()))?,
        None => ReferenceModel::synthetic(ModelConfig::default(), &device)?,
    };
    if let Some(path) = &cli.tokenizer {
        let tokenizer = SeqTokenizer::from_hf_path(path)
            .with_context(|| format!("loading tokenizer {}", path.display()))?;
        model = model.with_tokenizer(tokenizer);
    }

    // Sweep
    let basename = run_basename(&cli.fasta_file);
    let report = run_sweep(&mut model, &inputs, &config, &cli.output_dir, &basename)?;

    for result in &report.results {
        info!("{}: {} sequences", result.label(), result.sequences.len());
    }
    for skipped in &report.skipped {
        warn!("{} skipped: {}", skipped.pass.label, skipped.reason);
    }
    info!("Results saved to {}", cli.output_dir.display());

    Ok(())
}
