mod cli;

use std::io::Read;
use std::path::Path;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use cli::{Cli, Command, LogFormat};
use pipeaudit::repository::parse_repositories;
use pipeaudit::{
    CallbackEvent, ContinuationToken, Gateways, Orchestrator, ReportAggregator, RunId,
    RunOptions, RunScope, Settings, TokenBridge, callback, parse_repository_list,
    validate_run_input,
};

fn init_tracing(level: LevelFilter, format: LogFormat) {
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();
    let registry = tracing_subscriber::registry().with(filter);
    let layer = fmt::layer().with_target(false).with_writer(std::io::stderr);
    match format {
        LogFormat::Text => registry.with(layer).init(),
        LogFormat::Json => registry.with(layer.json()).init(),
    }
}

/// Read JSON from `path`, or from stdin when no path is given.
fn read_json(path: Option<&Path>) -> Result<Value> {
    let raw = match path {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?,
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("failed to read stdin")?;
            buf
        }
    };
    serde_json::from_str(&raw).context("input is not valid JSON")
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn execute(command: Command, settings: Settings) -> Result<()> {
    let settings = Arc::new(settings);
    let gateways = Gateways::from_settings(&settings);

    match command {
        Command::ListRepositories => {
            let orchestrator = Orchestrator::new(gateways, settings);
            let repositories = orchestrator.discover().await?;
            print_json(&repositories)
        }
        Command::Provision { input, run_id } => {
            let request = validate_run_input(&read_json(input.as_deref())?)?;
            let token = request.token.unwrap_or_else(ContinuationToken::generate);
            let orchestrator = Orchestrator::new(gateways, settings);
            let scope = orchestrator.scope(run_id.unwrap_or_else(RunId::generate));
            let provisioned = orchestrator
                .provision(&scope, request.repositories, &token)
                .await?;
            print_json(&json!({
                "run_id": provisioned.run_id,
                "pipeline": provisioned.pipeline,
                "token": token,
                "repositories": provisioned.repositories,
            }))
        }
        Command::Redeem { input } => {
            let event = CallbackEvent::from_value(read_json(input.as_deref())?)?;
            let bridge = TokenBridge::new(gateways.signals.clone(), gateways.pipelines.clone());
            let redemption = bridge.redeem(&event).await?;
            print_json(&redemption)
        }
        Command::Summarize { input, run_id } => {
            let repositories = parse_repository_list(&read_json(input.as_deref())?)?;
            let scope = RunScope::new(run_id, settings.pipeline_name.clone());
            let aggregator =
                ReportAggregator::new(gateways.store.clone(), settings.max_concurrency);
            let aggregation = aggregator.summarize(&scope, &repositories).await;
            print_json(&aggregation)
        }
        Command::Cleanup { input, run_id } => {
            let repositories = parse_repository_list(&read_json(input.as_deref())?)?;
            let orchestrator = Orchestrator::new(gateways, settings);
            let report = orchestrator
                .cleanup(&orchestrator.scope(run_id), &repositories)
                .await?;
            if !report.failed_projects.is_empty() {
                warn!(
                    failed = report.failed_projects.len(),
                    "some build projects were not deleted"
                );
            }
            print_json(&report)
        }
        Command::Run {
            repositories,
            run_id,
            listen,
            wait_timeout,
        } => {
            let repositories = if repositories.is_empty() {
                None
            } else {
                Some(parse_repositories(repositories)?)
            };
            let orchestrator = Arc::new(Orchestrator::new(gateways, settings));

            let listener = TcpListener::bind(listen)
                .await
                .with_context(|| format!("failed to listen on {listen}"))?;
            let server = tokio::spawn(callback::serve(listener, orchestrator.bridge()));

            let options = RunOptions {
                repositories,
                run_id,
                wait_timeout: wait_timeout.map(Duration::from_secs),
            };
            let outcome = tokio::select! {
                outcome = orchestrator.run(options) => outcome,
                _ = tokio::signal::ctrl_c() => {
                    server.abort();
                    bail!("interrupted before the run finished");
                }
            };
            server.abort();

            let outcome = outcome?;
            info!(
                run = %outcome.run_id,
                degraded = outcome.aggregation.is_degraded(),
                "run complete"
            );
            print_json(&outcome)
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbosity.tracing_level_filter(), cli.log_format);

    let settings = cli.config.into_settings();
    if let Err(e) = execute(cli.command, settings).await {
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}
