//! # daq-specfile
//!
//! Converts newline-delimited JSON run documents into a legacy SPEC file.
//!
//! ```bash
//! daq-specfile run.jsonl --output ./spec --prefix "{start[scan_id]}"
//! ```
//!
//! Each input line is a `["kind", {...}]` pair. The manifest of written files
//! is printed to stdout as JSON.

use anyhow::{Context, Result};
use clap::Parser;
use daq_specfile::config::ExportConfig;
use daq_specfile::export::{export_outcome, read_jsonl};
use daq_specfile::SpecError;
use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Export run documents to a SPEC file
#[derive(Parser)]
#[command(name = "daq-specfile")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Newline-delimited JSON document stream
    #[arg(value_name = "INPUT")]
    input: PathBuf,

    /// Directory for the SPEC file
    #[arg(short, long, default_value = ".")]
    output: PathBuf,

    /// File prefix template, e.g. "{start[scan_id]}-"
    #[arg(short, long)]
    prefix: Option<String>,

    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => ExportConfig::load_from(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => ExportConfig::load().context("Failed to load configuration")?,
    };

    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    if cli.json_logs {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let file = File::open(&cli.input)
        .with_context(|| format!("Failed to open {}", cli.input.display()))?;
    let documents = read_jsonl(BufReader::new(file))
        .with_context(|| format!("Failed to read documents from {}", cli.input.display()))?;
    tracing::info!(documents = documents.len(), input = %cli.input.display(), "loaded documents");

    let outcome = export_outcome(documents, &cli.output, cli.prefix.as_deref(), &config)
        .context("Invalid export settings")?;
    let manifest = match outcome.error {
        None => outcome.manifest,
        Some(err @ SpecError::UnsupportedPlanKind { .. }) => {
            tracing::warn!(error = %err, "stopped at unsupported run; earlier scans kept");
            outcome.manifest
        }
        Some(err) => {
            if !outcome.manifest.is_empty() {
                tracing::warn!(files = ?outcome.manifest, "files written before the error");
            }
            return Err(err).context("Export failed");
        }
    };

    println!(
        "{}",
        serde_json::to_string_pretty(&manifest).context("Failed to encode manifest")?
    );
    Ok(())
}
