//! The run lifecycle: discover → provision → wait for the callback →
//! aggregate → {notify, cleanup}.
//!
//! Each step takes what the previous one produced by value. The repository
//! list discovered (or supplied) at the start is the list every later step
//! sees; nothing recomputes it.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use futures::future::join_all;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{Semaphore, oneshot};
use tracing::{debug, info, instrument, warn};

use crate::config::Settings;
use crate::error::AuditError;
use crate::gateway::Gateways;
use crate::registry::{RunPhase, RunRegistry};
use crate::report::{Aggregation, ReportAggregator};
use crate::repository::{Repository, RunId, RunScope, ensure_distinct};
use crate::token::{ContinuationToken, TaskOutcome, TokenBridge, TokenLedger};
use crate::topology::TopologyBuilder;

pub const NOTIFY_SUBJECT: &str = "npm Audit Report";

/// Validated run-creation input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRequest {
    pub repositories: Vec<Repository>,
    pub token: Option<ContinuationToken>,
}

/// Parse a bare JSON array of repository names. Names that would share a
/// build project are rejected.
pub fn parse_repository_list(value: &Value) -> Result<Vec<Repository>, AuditError> {
    let items = value
        .as_array()
        .ok_or_else(|| AuditError::Validation("repositories must be an array of strings".into()))?;
    let repositories = items
        .iter()
        .map(|item| {
            let name = item.as_str().ok_or_else(|| {
                AuditError::Validation(format!("repository entry {item} is not a string"))
            })?;
            Repository::new(name)
        })
        .collect::<Result<Vec<_>, _>>()?;
    ensure_distinct(&repositories)?;
    Ok(repositories)
}

/// Check `{ repositories: [string], token?: string }` without touching the
/// network.
pub fn validate_run_input(input: &Value) -> Result<RunRequest, AuditError> {
    let repositories = input
        .get("repositories")
        .ok_or_else(|| AuditError::Validation("repositories is required".into()))?;
    let repositories = parse_repository_list(repositories)?;
    if repositories.is_empty() {
        return Err(AuditError::Validation(
            "repositories must contain at least one entry".into(),
        ));
    }

    let token = match input.get("token") {
        None | Some(Value::Null) => None,
        Some(Value::String(raw)) => Some(ContinuationToken::new(raw.as_str())?),
        Some(other) => {
            return Err(AuditError::Validation(format!(
                "token must be a string, got {other}"
            )));
        }
    };

    Ok(RunRequest {
        repositories,
        token,
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Provisioned {
    pub run_id: RunId,
    pub pipeline: String,
    pub repositories: Vec<Repository>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProjectFailure {
    pub project: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub deleted_projects: Vec<String>,
    pub failed_projects: Vec<ProjectFailure>,
    pub pipeline: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunOutcome {
    pub run_id: RunId,
    pub pipeline: String,
    pub aggregation: Aggregation,
    pub cleanup: CleanupReport,
}

/// Options for a whole in-process run.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Audit these instead of discovering repositories.
    pub repositories: Option<Vec<Repository>>,
    pub run_id: Option<RunId>,
    /// Stop waiting for the pipeline callback after this long.
    pub wait_timeout: Option<Duration>,
}

pub struct Orchestrator {
    gateways: Gateways,
    settings: Arc<Settings>,
    topology: TopologyBuilder,
    aggregator: ReportAggregator,
    registry: RunRegistry,
    ledger: Arc<TokenLedger>,
    bridge: Arc<TokenBridge>,
}

impl Orchestrator {
    pub fn new(gateways: Gateways, settings: Arc<Settings>) -> Self {
        let topology = TopologyBuilder::new(
            gateways.builds.clone(),
            gateways.pipelines.clone(),
            settings.clone(),
        );
        let aggregator = ReportAggregator::new(gateways.store.clone(), settings.max_concurrency);
        let ledger = Arc::new(TokenLedger::new());
        let bridge = Arc::new(TokenBridge::registered_only(
            ledger.clone(),
            gateways.pipelines.clone(),
        ));
        Self {
            gateways,
            settings,
            topology,
            aggregator,
            registry: RunRegistry::new(),
            ledger,
            bridge,
        }
    }

    /// Bridge wired to this orchestrator's in-process token ledger; serve it
    /// with `callback::router` so pipeline callbacks resume waiting runs.
    pub fn bridge(&self) -> Arc<TokenBridge> {
        self.bridge.clone()
    }

    pub fn registry(&self) -> &RunRegistry {
        &self.registry
    }

    pub fn scope(&self, run_id: RunId) -> RunScope {
        RunScope::new(run_id, self.settings.pipeline_name.clone())
    }

    #[instrument(skip(self))]
    pub async fn discover(&self) -> Result<Vec<Repository>> {
        let role = self.settings.require_source_role()?;
        let repositories = self.gateways.source.list_repositories(role).await?;
        info!(count = repositories.len(), "repositories discovered");
        Ok(repositories)
    }

    /// Create the run's build projects and pipeline, then hand the
    /// repository list back unchanged.
    #[instrument(skip(self, scope, repositories, token), fields(run = %scope.run_id()))]
    pub async fn provision(
        &self,
        scope: &RunScope,
        repositories: Vec<Repository>,
        token: &ContinuationToken,
    ) -> Result<Provisioned> {
        ensure_distinct(&repositories)?;
        let pipeline = self.topology.provision(scope, &repositories, token).await?;
        Ok(Provisioned {
            run_id: scope.run_id().clone(),
            pipeline,
            repositories,
        })
    }

    pub async fn summarize(&self, scope: &RunScope, repositories: &[Repository]) -> Aggregation {
        self.aggregator.summarize(scope, repositories).await
    }

    #[instrument(skip_all)]
    pub async fn notify(&self, aggregation: &Aggregation) -> Result<()> {
        let message = match aggregation {
            Aggregation::Summarized(summary) => summary.text.clone(),
            Aggregation::Degraded {
                repositories,
                reason,
            } => {
                let names: Vec<&str> = repositories.iter().map(Repository::as_str).collect();
                format!(
                    "Audit summary unavailable for {}.\nReason: {reason}",
                    names.join(", ")
                )
            }
        };
        self.gateways
            .notifier
            .publish(NOTIFY_SUBJECT, &message)
            .await
            .context("failed to publish audit summary")?;
        info!(degraded = aggregation.is_degraded(), "audit summary published");
        Ok(())
    }

    /// Delete every build project of the run, then the pipeline. A project
    /// that fails to delete is recorded and does not stop the others; the
    /// pipeline is deleted afterwards regardless, and its failure is the
    /// error returned.
    #[instrument(skip(self, scope, repositories), fields(run = %scope.run_id(), repos = repositories.len()))]
    pub async fn cleanup(
        &self,
        scope: &RunScope,
        repositories: &[Repository],
    ) -> Result<CleanupReport> {
        let sem = Arc::new(Semaphore::new(self.settings.max_concurrency.max(1)));
        let results = join_all(repositories.iter().map(|repo| {
            let sem = sem.clone();
            let builds = self.gateways.builds.clone();
            let project = scope.project_name(repo);
            async move {
                let _permit = sem.acquire().await.expect("semaphore closed");
                let result = builds.delete_project(&project).await;
                (project, result)
            }
        }))
        .await;

        let mut report = CleanupReport {
            pipeline: scope.pipeline_name(),
            ..CleanupReport::default()
        };
        for (project, result) in results {
            match result {
                Ok(()) => {
                    debug!(project = %project, "build project deleted");
                    report.deleted_projects.push(project);
                }
                Err(e) => {
                    warn!(project = %project, error = %e, "failed to delete build project");
                    report.failed_projects.push(ProjectFailure {
                        project,
                        error: format!("{e:#}"),
                    });
                }
            }
        }

        self.topology
            .delete_pipeline(&report.pipeline)
            .await
            .with_context(|| format!("failed to delete pipeline {}", report.pipeline))?;
        Ok(report)
    }

    /// Notify and clean up side by side; both always run to completion.
    pub async fn finish(&self, scope: &RunScope, aggregation: &Aggregation) -> Result<CleanupReport> {
        let (notified, cleaned) = tokio::join!(
            self.notify(aggregation),
            self.cleanup(scope, aggregation.repositories())
        );
        match (notified, cleaned) {
            (Ok(()), Ok(report)) => Ok(report),
            (Err(e), Ok(_)) => Err(e),
            (Ok(()), Err(e)) => Err(e),
            (Err(notify), Err(cleanup)) => {
                warn!(error = %notify, "notification failed as well");
                Err(cleanup)
            }
        }
    }

    /// Drive one run end to end. Pipeline callbacks must reach
    /// [`Orchestrator::bridge`] for the run to get past the wait.
    #[instrument(skip(self, options))]
    pub async fn run(&self, options: RunOptions) -> Result<RunOutcome> {
        let repositories = match options.repositories {
            Some(repositories) => repositories,
            None => self.discover().await?,
        };
        if repositories.is_empty() {
            return Err(AuditError::Validation("no repositories to audit".into()).into());
        }
        ensure_distinct(&repositories)?;

        let scope = self.scope(options.run_id.unwrap_or_else(RunId::generate));
        let run_id = scope.run_id().clone();
        self.registry
            .register(run_id.clone(), repositories.clone(), scope.pipeline_name());
        info!(run = %run_id, repos = repositories.len(), "run started");

        let (token, resumed) = self.ledger.issue();
        self.bridge.register(&token);
        let result = self
            .drive(&scope, repositories, &token, resumed, options.wait_timeout)
            .await;
        self.bridge.forget(&token);
        self.ledger.forget(&token);

        match &result {
            Ok(_) => self.registry.advance(&run_id, RunPhase::Finished)?,
            Err(e) => self.registry.fail(&run_id, e)?,
        }
        result
    }

    async fn drive(
        &self,
        scope: &RunScope,
        repositories: Vec<Repository>,
        token: &ContinuationToken,
        resumed: oneshot::Receiver<TaskOutcome>,
        wait_timeout: Option<Duration>,
    ) -> Result<RunOutcome> {
        let run_id = scope.run_id();
        let provisioned = self.provision(scope, repositories, token).await?;
        self.registry.advance(run_id, RunPhase::AwaitingCallback)?;
        info!(run = %run_id, pipeline = %provisioned.pipeline, "waiting for pipeline callback");

        let outcome = match wait_timeout {
            Some(limit) => match tokio::time::timeout(limit, resumed).await {
                Ok(received) => received,
                Err(_) => {
                    warn!(run = %run_id, "no pipeline callback in time, cleaning up");
                    if let Err(e) = self.cleanup(scope, &provisioned.repositories).await {
                        warn!(run = %run_id, error = %e, "cleanup after timeout failed");
                    }
                    bail!("timed out after {limit:?} waiting for the pipeline callback");
                }
            },
            None => resumed.await,
        }
        .context("continuation token was dropped before it was redeemed")?;

        self.registry.advance(run_id, RunPhase::Aggregating)?;
        let aggregation = match outcome {
            TaskOutcome::Succeeded(_) => self.summarize(scope, &provisioned.repositories).await,
            TaskOutcome::Failed { error, cause } => {
                warn!(run = %run_id, error = %error, "pipeline reported failure");
                Aggregation::Degraded {
                    repositories: provisioned.repositories.clone(),
                    reason: format!("pipeline reported failure: {error}: {cause}"),
                }
            }
        };

        self.registry.advance(run_id, RunPhase::Finishing)?;
        let cleanup = self.finish(scope, &aggregation).await?;
        info!(run = %run_id, "run finished");
        Ok(RunOutcome {
            run_id: run_id.clone(),
            pipeline: provisioned.pipeline,
            aggregation,
            cleanup,
        })
    }
}
