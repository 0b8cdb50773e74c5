//! attrgen - LLM attribute generation
//!
//! Loads objects from JSON, asks the model for attribute concepts per object,
//! then for values per (object, concept), and writes the nested result to JSON.
//!
//! Usage:
//!   cargo run -- --config configs/attribute_generation.yaml
//!   cargo run -- --skip-concepts --limit 20

use std::path::PathBuf;

use anyhow::{Context, Result};
use attrgen::config::{GenerationConfig, load_env_file, resolve_config_path};
use attrgen::pipeline::Pipeline;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "attrgen")]
#[command(about = "Generate object attributes (concepts, then values) with an LLM", long_about = None)]
struct Cli {
    /// Pipeline YAML config (default: $ATTRGEN_CONFIG, then configs/attribute_generation.yaml)
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// API keys YAML file (overrides keys_path)
    #[arg(long)]
    keys: Option<PathBuf>,
    /// Objects JSON file (overrides input_file)
    #[arg(long)]
    input: Option<PathBuf>,
    /// Attributes JSON file (overrides output_file)
    #[arg(long)]
    output: Option<PathBuf>,
    /// Do not run concept generation
    #[arg(long)]
    skip_concepts: bool,
    /// Do not run value generation
    #[arg(long)]
    skip_values: bool,
    /// Only process the first N objects
    #[arg(long)]
    limit: Option<usize>,
}

impl Cli {
    fn apply(&self, config: &mut GenerationConfig) {
        if let Some(keys) = &self.keys {
            config.keys_path = keys.clone();
        }
        if let Some(input) = &self.input {
            config.input_file = input.clone();
        }
        if let Some(output) = &self.output {
            config.output_file = output.clone();
        }
        if self.skip_concepts {
            config.run_concept_generation = false;
        }
        if self.skip_values {
            config.run_value_generation = false;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    load_env_file();
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("attrgen=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config_path = resolve_config_path(cli.config.as_deref());
    let mut config = GenerationConfig::load(&config_path)
        .with_context(|| format!("failed to load config {}", config_path.display()))?;
    cli.apply(&mut config);
    config.validate().context("invalid configuration after CLI overrides")?;
    info!("Configuration loaded from {}", config_path.display());

    let pipeline = Pipeline::from_config(config)
        .context("failed to initialise generation pipeline")?
        .with_limit(cli.limit);
    let stats = pipeline.run().await.context("generation run failed")?;

    if stats.total_failed() > 0 {
        warn!(
            "{} requests failed after retries; rerun to fill the gaps",
            stats.total_failed()
        );
    }
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}
