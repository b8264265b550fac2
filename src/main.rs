use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use report_engine::{
    init_telemetry, shutdown_telemetry, DateRange, MetricsScope, NotificationDispatcher,
    OperationTimer, RateLimitedHttpClient, ReportConfig, ReportEngineConfig, ReportOrchestrator,
    ReportTransport, ShareReportLoader,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "report-engine")]
#[command(about = "Generate delivery-metrics reports across one or more date ranges")]
struct Cli {
    /// Engine configuration file (defaults to report-engine.toml / .report-engine-rc)
    #[arg(long, global = true)]
    engine_config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Request reports for every range and print the per-range results
    Generate {
        /// Report settings (metrics, calendar, board / pipeline / source control) as TOML or JSON
        #[arg(long)]
        config: PathBuf,
        /// Date range as <start>..<end>, e.g. 2024-01-01..2024-01-14; repeatable
        #[arg(long = "range", required = true)]
        ranges: Vec<DateRange>,
        /// Metric family to request
        #[arg(long, default_value = "all")]
        scope: MetricsScope,
    },
    /// Load a shared report by id
    Share {
        report_id: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    ReportEngineConfig::load_env_file()?;
    let engine_config = match &cli.engine_config {
        Some(path) => ReportEngineConfig::load_from(path)?,
        None => ReportEngineConfig::load()?,
    };
    init_telemetry(&engine_config.observability)?;

    let result = tokio::runtime::Runtime::new()?.block_on(async {
        match cli.command {
            Commands::Generate {
                config,
                ranges,
                scope,
            } => generate_command(&engine_config, &config, ranges, scope).await,
            Commands::Share { report_id } => share_command(&engine_config, &report_id).await,
        }
    });

    shutdown_telemetry();
    result
}

fn transport(engine_config: &ReportEngineConfig) -> Result<Arc<dyn ReportTransport>> {
    let client = RateLimitedHttpClient::new(&engine_config.server)
        .context("Failed to build HTTP client")?;
    Ok(Arc::new(client))
}

async fn generate_command(
    engine_config: &ReportEngineConfig,
    config_path: &Path,
    ranges: Vec<DateRange>,
    scope: MetricsScope,
) -> Result<()> {
    let report_config = ReportConfig::from_path(config_path)?;
    let orchestrator =
        ReportOrchestrator::new(transport(engine_config)?, engine_config.polling.clone());
    let dispatcher = NotificationDispatcher::attach(orchestrator.store());
    let timer = OperationTimer::new("generate_report");

    orchestrator
        .start_to_request_data(scope, &ranges, &report_config)
        .await?;

    tokio::select! {
        _ = orchestrator.wait_until_settled() => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("Interrupted, stopping report polling");
            orchestrator.stop_polling_reports();
        }
    }
    timer.finish();
    orchestrator.metrics().log_stats();
    dispatcher.on_polling_settled();

    for notification in dispatcher.drain_ready() {
        eprintln!("[{:?}] {}: {}", notification.level, notification.range, notification.message);
    }
    println!(
        "{}",
        serde_json::to_string_pretty(&orchestrator.report_infos())?
    );
    Ok(())
}

async fn share_command(engine_config: &ReportEngineConfig, report_id: &str) -> Result<()> {
    let loader = ShareReportLoader::new(transport(engine_config)?);
    let dispatcher = NotificationDispatcher::attach(loader.store());

    let shared = loader
        .load(report_id)
        .await
        .with_context(|| format!("Failed to load shared report {report_id}"))?;

    for notification in dispatcher.drain_ready() {
        eprintln!("[{:?}] {}: {}", notification.level, notification.range, notification.message);
    }
    println!("{}", serde_json::to_string_pretty(&shared)?);
    Ok(())
}
