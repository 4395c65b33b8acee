// Main entry point for the batch delisting analyzer

use analyzer::{
    load_tasks, BatchDriver, CheckpointStore, CninfoSource, CompletionClient, Config,
    DriverOptions, HttpDocumentProvider, ModelRoster, ReconcilingFetcher, ResultWriter,
};
use anyhow::{Context, Result};
use clap::Parser;
use llm_client::LlmClient;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "delist-analyzer", about = "Extract delisting facts from exchange announcements")]
struct Args {
    /// CSV sheet of companies to analyze.
    #[arg(short, long)]
    input: PathBuf,

    /// CSV sheet results are appended to.
    #[arg(short, long, default_value = "delist_results.csv")]
    output: PathBuf,

    /// Optional JSON configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Process at most this many new items.
    #[arg(short, long)]
    limit: Option<usize>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,analyzer=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = Config::load(args.config.as_deref()).context("Failed to load configuration")?;

    let tasks = load_tasks(&args.input)?;
    tracing::info!(tasks = tasks.len(), input = %args.input.display(), "task sheet loaded");

    // Backend and model roster, seeded from the deployed model list.
    let llm = LlmClient::new(&config.api_key, &config.base_url)
        .context("Failed to build completion client")?;
    let deployed: Vec<String> = llm
        .list_models()
        .await
        .context("Failed to list models on the completion backend")?
        .into_iter()
        .map(|m| m.id)
        .collect();
    let roster = Arc::new(ModelRoster::new(&deployed, &config.model_allowlist));
    let completion = CompletionClient::new(llm, roster, config.completion_attempts);

    let source = CninfoSource::new(
        Duration::from_secs(config.source_timeout_secs),
        config.page_retries,
        Duration::from_millis(config.page_retry_delay_ms),
    )
    .context("Failed to build announcement source")?;
    let fetcher = ReconcilingFetcher::new(
        source,
        Duration::from_millis(config.page_delay_ms),
        config.max_passes,
    );

    let provider = HttpDocumentProvider::new(
        &config.converter_url,
        Duration::from_secs(config.converter_timeout_secs),
    )
    .context("Failed to build document provider")?;

    let mut checkpoints =
        CheckpointStore::open(&config.checkpoint_path).context("Failed to open checkpoint ledger")?;
    let mut output = ResultWriter::open(&args.output).context("Failed to open output sheet")?;

    let options = DriverOptions {
        lookback_days: config.lookback_days,
        max_rounds: config.max_rounds,
        max_doc_len: config.max_doc_len,
        limit: args.limit,
    };

    let mut driver = BatchDriver::new(&fetcher, &completion, &provider, &mut checkpoints, options);
    let summary = driver.run(tasks, &mut output).await?;

    tracing::info!(
        submitted = summary.submitted,
        skipped = summary.skipped,
        exhausted = summary.exhausted,
        failed = summary.failed,
        resumed = summary.resumed,
        "analyzer finished"
    );
    Ok(())
}
