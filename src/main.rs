use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use std::sync::Arc;
use market_merge::api::{self, ApiState};
use market_merge::config::AppConfig;
use market_merge::ingestion::SourceRegistry;
use market_merge::observability::{logging, metrics};
use market_merge::pipeline::{Orchestrator, RunState};

/// Multi-source market data ingestion and unification
#[derive(Parser)]
#[command(name = "market-merge")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the query API and run pipeline passes on startup, on a schedule, or on demand
    Serve(CommonArgs),
    /// Run one pipeline pass and print per-source outcomes as JSON
    RunOnce(CommonArgs),
}

#[derive(Args)]
struct CommonArgs {
    /// Config overlay loaded on top of config/default (config/{env})
    #[arg(long, env = "MARKET_MERGE_ENV", default_value = "development")]
    env: String,
}

fn build(config: &AppConfig) -> anyhow::Result<Orchestrator> {
    let store = config.open_store().context("opening store")?;
    let registry = SourceRegistry::from_config(&config.sources).context("building sources")?;
    if registry.is_empty() {
        tracing::warn!("No enabled sources configured");
    }
    if config.pipeline.chaos_mode {
        tracing::warn!("Chaos mode is enabled; every run will abort mid-stream");
    }
    Ok(Orchestrator::new(config.pipeline_context(store), registry))
}

async fn serve(config: AppConfig) -> anyhow::Result<()> {
    let orchestrator = build(&config)?;

    if config.pipeline.run_on_startup {
        orchestrator.trigger();
    }
    let schedule = config.pipeline.run_interval().map(|every| {
        tracing::info!(interval_secs = every.as_secs(), "Scheduling periodic passes");
        orchestrator.schedule(every)
    });

    let state = Arc::new(ApiState::new(orchestrator));
    let served = api::serve(&config.service.bind_addr, state).await;

    if let Some(schedule) = schedule {
        schedule.abort();
    }
    served.context("API server")
}

async fn run_once(config: AppConfig) -> anyhow::Result<()> {
    let orchestrator = build(&config)?;
    let report = orchestrator.run_all().await;
    println!("{}", serde_json::to_string_pretty(&report)?);

    if !report.all_succeeded() {
        let unsuccessful = report.outcomes.len() - report.count(RunState::Succeeded);
        anyhow::bail!("{} source(s) did not succeed", unsuccessful);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let env = match &cli.command {
        Commands::Serve(args) | Commands::RunOnce(args) => args.env.clone(),
    };

    let config = AppConfig::load(&env).with_context(|| format!("loading config for `{}`", env))?;
    logging::init(config.service.log_format);
    metrics::register_metrics();
    tracing::info!(env = %env, sources = config.sources.len(), "market-merge starting");

    match cli.command {
        Commands::Serve(_) => serve(config).await,
        Commands::RunOnce(_) => run_once(config).await,
    }
}
