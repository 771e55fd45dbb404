use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use framelabel_contracts::labels::LabelSet;
use framelabel_engine::{
    aggregate_cache, normalize_extension, ClientSettings, JobScanner, LabelClientRegistry,
    LabelJob, LabelJobConfig, OutputLayout, RunOutcome, DEFAULT_CONCURRENCY,
};
use serde_json::json;
use tracing_subscriber::EnvFilter;

const EXIT_ITEMS_FAILED: i32 = 2;

#[derive(Debug, Parser)]
#[command(name = "framelabel", version, about = "Resumable concurrent image labeling")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Label every image that has no label yet.
    Run(RunArgs),
    /// Print the ids a run would dispatch.
    Scan(ScanArgs),
    /// Fold a leftover label cache into a snapshot without labeling.
    Gather(GatherArgs),
}

#[derive(Debug, Parser)]
struct RunArgs {
    #[arg(long)]
    input: PathBuf,
    #[arg(long)]
    output: PathBuf,
    #[arg(long)]
    prompt: PathBuf,
    #[arg(long, default_value = "azure")]
    client: String,
    #[arg(long, default_value_t = DEFAULT_CONCURRENCY)]
    concurrency: usize,
    #[arg(long, default_value = "jpg")]
    ext: String,
    #[arg(long)]
    max_dim: Option<u32>,
    #[arg(long)]
    deadline_secs: Option<u64>,
    #[arg(long)]
    retry_malformed: bool,
    #[arg(long)]
    model: Option<String>,
}

#[derive(Debug, Parser)]
struct ScanArgs {
    #[arg(long)]
    input: PathBuf,
    #[arg(long)]
    output: PathBuf,
    #[arg(long, default_value = "jpg")]
    ext: String,
    #[arg(long)]
    retry_malformed: bool,
}

#[derive(Debug, Parser)]
struct GatherArgs {
    #[arg(long)]
    output: PathBuf,
}

fn main() {
    let _ = dotenvy::dotenv();
    init_tracing();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("framelabel error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run(args) => run_label_job(args),
        Command::Scan(args) => run_scan(args),
        Command::Gather(args) => run_gather(args),
    }
}

/// Logs go to stderr; `FRAMELABEL_LOG` wins over `RUST_LOG`.
fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_writer(std::io::stderr)
        .init();
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env("FRAMELABEL_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

fn run_label_job(args: RunArgs) -> Result<i32> {
    let config = LabelJobConfig::builder(&args.input, &args.output, &args.prompt)
        .concurrency(args.concurrency)
        .image_extension(args.ext.clone())
        .max_image_dim(args.max_dim)
        .deadline(args.deadline_secs.map(Duration::from_secs))
        .retry_malformed(args.retry_malformed)
        .build()?;

    let settings = ClientSettings::from_env().with_model(args.model.clone());
    let client = LabelClientRegistry::from_settings(&settings)?.resolve(&args.client)?;

    let outcome = LabelJob::new(config, client).run()?;
    println!("{}", serde_json::to_string_pretty(&outcome_json(&outcome))?);
    Ok(exit_code(&outcome))
}

fn run_scan(args: ScanArgs) -> Result<i32> {
    // No prompt is needed to scan, so the layout is built without a config.
    let layout = OutputLayout::new(&args.output);
    let extension = normalize_extension(&args.ext)?;
    let scanner = JobScanner::new(extension, layout.snapshots(), layout.cache())
        .retry_malformed(args.retry_malformed);

    let report = scanner.scan(&args.input)?;
    for id in report.pending_ids() {
        println!("{id}");
    }
    tracing::info!(
        pending = report.pending.len(),
        candidates = report.candidates.len(),
        "scan finished"
    );
    Ok(0)
}

fn run_gather(args: GatherArgs) -> Result<i32> {
    let layout = OutputLayout::new(&args.output);
    if !layout.cache().exists() {
        tracing::info!(cache_dir = %layout.cache_dir().display(), "no label cache to gather");
        return Ok(0);
    }
    let outcome = aggregate_cache(&layout, LabelSet::new())
        .with_context(|| format!("failed gathering {}", layout.cache_dir().display()))?;
    let payload = json!({
        "drained": outcome.drained,
        "labels": outcome.labels.len(),
        "rejected": outcome.rejected,
        "snapshot": outcome.snapshot_path.to_string_lossy(),
    });
    println!("{}", serde_json::to_string_pretty(&payload)?);
    Ok(0)
}

fn outcome_json(outcome: &RunOutcome) -> serde_json::Value {
    json!({
        "run_id": outcome.run_id,
        "status": outcome.status.as_str(),
        "candidates": outcome.candidates,
        "dispatched": outcome.dispatched,
        "completed": outcome.completed,
        "failed": outcome.failed.iter().map(|item| item.id.clone()).collect::<Vec<_>>(),
        "not_started": outcome.not_started.len(),
        "labels": outcome.labels.len(),
        "rejected": outcome.rejected,
        "snapshot": outcome.snapshot_path.as_ref().map(|path| path.to_string_lossy().to_string()),
    })
}

fn exit_code(outcome: &RunOutcome) -> i32 {
    if outcome.has_failures() || !outcome.not_started.is_empty() {
        EXIT_ITEMS_FAILED
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use framelabel_engine::{normalize_extension, ConfigError};

    use super::{Cli, Command};

    #[test]
    fn run_arguments_parse_with_defaults() -> anyhow::Result<()> {
        let cli = Cli::try_parse_from([
            "framelabel",
            "run",
            "--input",
            "frames",
            "--output",
            "out",
            "--prompt",
            "label.md",
        ])?;
        let Command::Run(args) = cli.command else {
            anyhow::bail!("expected run subcommand");
        };
        assert_eq!(args.client, "azure");
        assert_eq!(args.concurrency, 4);
        assert_eq!(args.ext, "jpg");
        assert!(!args.retry_malformed);
        assert_eq!(args.deadline_secs, None);
        Ok(())
    }

    #[test]
    fn run_requires_prompt() {
        let parsed = Cli::try_parse_from(["framelabel", "run", "--input", "a", "--output", "b"]);
        assert!(parsed.is_err());
    }

    #[test]
    fn gather_takes_only_output() -> anyhow::Result<()> {
        let cli = Cli::try_parse_from(["framelabel", "gather", "--output", "out"])?;
        assert!(matches!(cli.command, Command::Gather(_)));
        Ok(())
    }

    #[test]
    fn scan_extension_uses_engine_validation() -> anyhow::Result<()> {
        let cli = Cli::try_parse_from([
            "framelabel",
            "scan",
            "--input",
            "a",
            "--output",
            "b",
            "--ext",
            " . ",
        ])?;
        let Command::Scan(args) = cli.command else {
            anyhow::bail!("expected scan subcommand");
        };
        assert!(matches!(
            normalize_extension(&args.ext),
            Err(ConfigError::EmptyExtension)
        ));
        assert_eq!(normalize_extension(" .JPG ")?, "jpg");
        Ok(())
    }
}
