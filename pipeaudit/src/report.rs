use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::Semaphore;
use tracing::{debug, info, instrument, warn};

use crate::gateway::ObjectStore;
use crate::repository::{Repository, RunScope};

pub const SUMMARY_HEADER: &str = "Following packages have high or critical vulnerabilities:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Low,
    Moderate,
    High,
    Critical,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Vulnerability {
    pub severity: Severity,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(flatten)]
    pub details: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SeverityCounts {
    pub info: u64,
    pub low: u64,
    pub moderate: u64,
    pub high: u64,
    pub critical: u64,
    pub total: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ReportMetadata {
    pub vulnerabilities: SeverityCounts,
    pub dependencies: Value,
}

/// Raw scanner output for one repository.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditReport {
    #[serde(default)]
    pub audit_report_version: Option<u64>,
    #[serde(default)]
    pub vulnerabilities: BTreeMap<String, Vulnerability>,
    #[serde(default)]
    pub metadata: ReportMetadata,
}

impl AuditReport {
    pub fn parse(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).context("failed to parse audit report")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SeverityBuckets {
    pub criticals: Vec<String>,
    pub highs: Vec<String>,
}

/// Bucket vulnerability ids by severity. Anything below high is left out.
pub fn classify_by_severity(report: &AuditReport) -> SeverityBuckets {
    let mut buckets = SeverityBuckets::default();
    for (id, vulnerability) in &report.vulnerabilities {
        match vulnerability.severity {
            Severity::Critical => buckets.criticals.push(id.clone()),
            Severity::High => buckets.highs.push(id.clone()),
            _ => {}
        }
    }
    buckets
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RepositoryFindings {
    pub repository: Repository,
    pub report_file: String,
    pub counts: SeverityCounts,
    #[serde(flatten)]
    pub buckets: SeverityBuckets,
}

impl RepositoryFindings {
    fn line(&self) -> String {
        format!(
            "{}- High: {} and Critical: {}",
            self.report_file, self.counts.high, self.counts.critical
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub text: String,
    pub repositories: Vec<Repository>,
    pub findings: Vec<RepositoryFindings>,
}

/// Outcome of aggregation. `Degraded` hands back the run's repositories
/// untouched together with the reason no summary was produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Aggregation {
    Summarized(RunSummary),
    Degraded {
        repositories: Vec<Repository>,
        reason: String,
    },
}

impl Aggregation {
    pub fn repositories(&self) -> &[Repository] {
        match self {
            Aggregation::Summarized(summary) => &summary.repositories,
            Aggregation::Degraded { repositories, .. } => repositories,
        }
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, Aggregation::Degraded { .. })
    }
}

pub struct ReportAggregator {
    store: Arc<dyn ObjectStore>,
    max_concurrency: usize,
}

impl ReportAggregator {
    pub fn new(store: Arc<dyn ObjectStore>, max_concurrency: usize) -> Self {
        Self {
            store,
            max_concurrency: max_concurrency.max(1),
        }
    }

    async fn findings_for(
        &self,
        scope: &RunScope,
        repo: &Repository,
    ) -> Result<Option<RepositoryFindings>> {
        let key = scope.report_key(repo);
        let raw = self
            .store
            .fetch_object(&key)
            .await
            .with_context(|| format!("fetching audit report for {repo}"))?;
        let report = AuditReport::parse(&raw).with_context(|| format!("reading {key}"))?;

        if report.vulnerabilities.is_empty() {
            debug!(repo = %repo, "no vulnerabilities reported");
            return Ok(None);
        }
        Ok(Some(RepositoryFindings {
            repository: repo.clone(),
            report_file: scope.report_file(repo),
            buckets: classify_by_severity(&report),
            counts: report.metadata.vulnerabilities,
        }))
    }

    /// Fetch every repository's report and fold them into one summary.
    /// Severity counts come from the report metadata as written by the
    /// scanner. Any fetch or parse failure degrades the whole aggregation.
    #[instrument(skip(self, scope, repositories), fields(run = %scope.run_id(), repos = repositories.len()))]
    pub async fn summarize(&self, scope: &RunScope, repositories: &[Repository]) -> Aggregation {
        let sem = Arc::new(Semaphore::new(self.max_concurrency));
        let results = join_all(repositories.iter().map(|repo| {
            let sem = sem.clone();
            async move {
                let _permit = sem.acquire().await.expect("semaphore closed");
                self.findings_for(scope, repo).await
            }
        }))
        .await;

        let mut findings = Vec::new();
        for result in results {
            match result {
                Ok(Some(found)) => findings.push(found),
                Ok(None) => {}
                Err(e) => {
                    let reason = format!("{e:#}");
                    warn!(reason = %reason, "aggregation degraded, no summary produced");
                    return Aggregation::Degraded {
                        repositories: repositories.to_vec(),
                        reason,
                    };
                }
            }
        }

        let lines: Vec<String> = findings.iter().map(RepositoryFindings::line).collect();
        let text = format!("{SUMMARY_HEADER}\n{}", lines.join("\n"));
        info!(reported = findings.len(), "audit reports summarized");
        Aggregation::Summarized(RunSummary {
            text,
            repositories: repositories.to_vec(),
            findings,
        })
    }
}
