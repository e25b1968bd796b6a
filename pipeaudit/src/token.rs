//! Suspend/resume plumbing between the workflow and the pipeline engine.
//!
//! The pipeline's Invoke action carries a continuation token. When the
//! pipeline reaches that action its callback event comes back here, and the
//! bridge has to tell two independent systems that the job is done: the
//! workflow engine (so the paused step resumes) and the pipeline engine (so
//! its own action completes).

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fmt;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::oneshot;
use tracing::{debug, info, instrument, warn};

use crate::error::AuditError;
use crate::gateway::{Pipelines, SignalReceipt, WorkflowSignals};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContinuationToken(String);

impl ContinuationToken {
    pub fn new(token: impl Into<String>) -> Result<Self, AuditError> {
        let token = token.into();
        if token.trim().is_empty() {
            return Err(AuditError::Validation(
                "continuation token must not be empty".to_string(),
            ));
        }
        Ok(Self(token))
    }

    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The token as embedded in the Invoke action: a JSON string literal.
    pub fn to_user_parameters(&self) -> String {
        Value::String(self.0.clone()).to_string()
    }

    /// Accepts the JSON-encoded form written by `to_user_parameters` as well
    /// as a bare token.
    pub fn from_user_parameters(raw: &str) -> Result<Self, AuditError> {
        match serde_json::from_str::<String>(raw) {
            Ok(decoded) => Self::new(decoded),
            Err(_) => Self::new(raw.trim()),
        }
    }
}

impl fmt::Display for ContinuationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Tokens are long opaque blobs; a prefix is enough to correlate logs.
        let prefix: String = self.0.chars().take(12).collect();
        if prefix.len() < self.0.len() {
            write!(f, "{prefix}…")
        } else {
            f.write_str(&prefix)
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CallbackEvent {
    #[serde(rename = "CodePipeline.job")]
    pub job: PipelineJob,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineJob {
    pub id: String,
    pub data: JobData,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobData {
    pub action_configuration: ActionConfiguration,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ActionConfiguration {
    pub configuration: JobConfiguration,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct JobConfiguration {
    pub user_parameters: Option<String>,
    pub function_name: Option<String>,
}

impl CallbackEvent {
    pub fn from_value(value: Value) -> Result<Self, AuditError> {
        serde_json::from_value(value)
            .map_err(|e| AuditError::Validation(format!("malformed pipeline job event: {e}")))
    }

    pub fn job_id(&self) -> &str {
        &self.job.id
    }

    pub fn token(&self) -> Result<ContinuationToken, AuditError> {
        let raw = self
            .job
            .data
            .action_configuration
            .configuration
            .user_parameters
            .as_deref()
            .ok_or_else(|| {
                AuditError::Validation("pipeline job event carries no UserParameters".to_string())
            })?;
        ContinuationToken::from_user_parameters(raw)
    }
}

/// Signal the workflow engine. When a success signal fails or is rejected,
/// a failure signal is sent as a best-effort fallback so the paused task
/// does not wait forever. A transport error is returned; a rejected receipt
/// is handed back for the caller to inspect.
#[instrument(skip(signals))]
pub async fn signal_task_outcome(
    signals: &dyn WorkflowSignals,
    token: &ContinuationToken,
    success: bool,
) -> Result<SignalReceipt> {
    let sent = if success {
        signals.send_task_success(token, &json!({ "success": true })).await
    } else {
        signals
            .send_task_failure(token, "PipelineJobFailed", "pipeline reported failure")
            .await
    };

    match sent {
        Ok(receipt) if success && !receipt.accepted() => {
            warn!(token = %token, status = receipt.status, "workflow engine rejected the success signal, sending failure signal");
            let cause = format!("task success rejected with HTTP {}", receipt.status);
            send_fallback_failure(signals, token, &cause).await;
            Ok(receipt)
        }
        Ok(receipt) => Ok(receipt),
        Err(e) => {
            warn!(token = %token, error = %e, "workflow signal failed, sending failure signal");
            if success {
                send_fallback_failure(signals, token, &e.to_string()).await;
            }
            Err(e)
        }
    }
}

async fn send_fallback_failure(signals: &dyn WorkflowSignals, token: &ContinuationToken, cause: &str) {
    match signals.send_task_failure(token, "CallbackFailed", cause).await {
        Ok(receipt) if !receipt.accepted() => {
            warn!(token = %token, status = receipt.status, "failure signal was rejected too");
        }
        Ok(_) => {}
        Err(e) => warn!(token = %token, error = %e, "failure signal also failed"),
    }
}

/// Result of a paused task, as delivered to the waiting run.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Succeeded(Value),
    Failed { error: String, cause: String },
}

enum LedgerEntry {
    Waiting(oneshot::Sender<TaskOutcome>),
    Settled,
}

/// In-process workflow engine: mints tokens and resumes the waiting run when
/// a token is signalled. Each token settles exactly once.
#[derive(Default)]
pub struct TokenLedger {
    entries: Mutex<HashMap<ContinuationToken, LedgerEntry>>,
}

impl TokenLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn issue(&self) -> (ContinuationToken, oneshot::Receiver<TaskOutcome>) {
        let token = ContinuationToken::generate();
        let (tx, rx) = oneshot::channel();
        self.entries
            .lock()
            .expect("ledger lock poisoned")
            .insert(token.clone(), LedgerEntry::Waiting(tx));
        debug!(token = %token, "continuation token issued");
        (token, rx)
    }

    pub fn is_settled(&self, token: &ContinuationToken) -> bool {
        matches!(
            self.entries.lock().expect("ledger lock poisoned").get(token),
            Some(LedgerEntry::Settled)
        )
    }

    /// Drop a token once its run is over. Later signals for it are
    /// rejected as unknown.
    pub fn forget(&self, token: &ContinuationToken) {
        self.entries
            .lock()
            .expect("ledger lock poisoned")
            .remove(token);
    }

    fn settle(&self, token: &ContinuationToken, outcome: TaskOutcome) -> Result<SignalReceipt> {
        let mut entries = self.entries.lock().expect("ledger lock poisoned");
        let entry = entries
            .get_mut(token)
            .ok_or_else(|| AuditError::UnknownToken(token.to_string()))?;
        match std::mem::replace(entry, LedgerEntry::Settled) {
            LedgerEntry::Settled => Err(AuditError::TokenAlreadyRedeemed(token.to_string()).into()),
            LedgerEntry::Waiting(tx) => {
                if tx.send(outcome).is_err() {
                    warn!(token = %token, "run stopped waiting before the token was redeemed");
                }
                Ok(SignalReceipt { status: 200 })
            }
        }
    }
}

#[async_trait]
impl WorkflowSignals for TokenLedger {
    async fn send_task_success(
        &self,
        token: &ContinuationToken,
        output: &Value,
    ) -> Result<SignalReceipt> {
        self.settle(token, TaskOutcome::Succeeded(output.clone()))
    }

    async fn send_task_failure(
        &self,
        token: &ContinuationToken,
        error: &str,
        cause: &str,
    ) -> Result<SignalReceipt> {
        self.settle(
            token,
            TaskOutcome::Failed {
                error: error.to_string(),
                cause: cause.to_string(),
            },
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BridgeState {
    /// Neither system has acknowledged yet.
    Issued,
    /// Workflow resumed; the pipeline job report is still outstanding.
    WorkflowAcked,
    /// Pipeline job reported; the workflow signal is still outstanding.
    JobAcked,
    Complete,
}

#[derive(Debug, Default, Clone, Copy)]
struct Acks {
    workflow: bool,
    job: bool,
    in_flight: bool,
}

impl Acks {
    fn state(&self) -> BridgeState {
        match (self.workflow, self.job) {
            (false, false) => BridgeState::Issued,
            (true, false) => BridgeState::WorkflowAcked,
            (false, true) => BridgeState::JobAcked,
            (true, true) => BridgeState::Complete,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Redemption {
    pub job_id: String,
    pub workflow_signaled: bool,
    pub job_reported: bool,
    pub state: BridgeState,
}

type AckTable = Mutex<HashMap<ContinuationToken, Acks>>;

/// Marks a token as being redeemed; clears the mark when the redemption
/// ends, including when its future is dropped half way.
struct InFlight<'a> {
    table: &'a AckTable,
    token: &'a ContinuationToken,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if let Ok(mut table) = self.table.lock() {
            if let Some(acks) = table.get_mut(self.token) {
                acks.in_flight = false;
            }
        }
    }
}

/// Correlation table keyed by token, tracking both acknowledgements. A
/// repeated redeem only retries what is still missing; a complete token
/// cannot be redeemed again.
pub struct TokenBridge {
    signals: Arc<dyn WorkflowSignals>,
    pipelines: Arc<dyn Pipelines>,
    table: AckTable,
    admit_unregistered: bool,
}

impl TokenBridge {
    /// Bridge that accepts any token, for one-shot redemption of tokens
    /// issued by a remote workflow engine. Its table lives only as long as
    /// the bridge; across processes the engine itself is what rejects a
    /// token that was already used.
    pub fn new(signals: Arc<dyn WorkflowSignals>, pipelines: Arc<dyn Pipelines>) -> Self {
        Self {
            signals,
            pipelines,
            table: Mutex::new(HashMap::new()),
            admit_unregistered: true,
        }
    }

    /// Bridge that only redeems tokens handed to [`TokenBridge::register`];
    /// anything else is an unknown token and leaves no trace in the table.
    pub fn registered_only(signals: Arc<dyn WorkflowSignals>, pipelines: Arc<dyn Pipelines>) -> Self {
        Self {
            admit_unregistered: false,
            ..Self::new(signals, pipelines)
        }
    }

    pub fn register(&self, token: &ContinuationToken) {
        self.table
            .lock()
            .expect("bridge lock poisoned")
            .entry(token.clone())
            .or_default();
    }

    pub fn forget(&self, token: &ContinuationToken) {
        self.table
            .lock()
            .expect("bridge lock poisoned")
            .remove(token);
    }

    pub fn state(&self, token: &ContinuationToken) -> Option<BridgeState> {
        self.table
            .lock()
            .expect("bridge lock poisoned")
            .get(token)
            .map(Acks::state)
    }

    fn begin<'a>(&'a self, token: &'a ContinuationToken) -> Result<(Acks, InFlight<'a>), AuditError> {
        let mut table = self.table.lock().expect("bridge lock poisoned");
        let acks = match table.entry(token.clone()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(_) if !self.admit_unregistered => {
                return Err(AuditError::UnknownToken(token.to_string()));
            }
            Entry::Vacant(entry) => entry.insert(Acks::default()),
        };
        if acks.in_flight || acks.state() == BridgeState::Complete {
            return Err(AuditError::TokenAlreadyRedeemed(token.to_string()));
        }
        acks.in_flight = true;
        let prior = *acks;
        Ok((
            prior,
            InFlight {
                table: &self.table,
                token,
            },
        ))
    }

    /// Record acknowledgements as soon as they land, so a redemption cut
    /// short after the workflow signal does not signal again on retry.
    fn record(&self, token: &ContinuationToken, prior: Acks, workflow: bool, job: bool) -> BridgeState {
        let mut table = self.table.lock().expect("bridge lock poisoned");
        let acks = match table.get_mut(token) {
            Some(acks) => acks,
            // Forgotten while in flight; report what this attempt achieved.
            None => {
                return Acks {
                    workflow: prior.workflow || workflow,
                    job: prior.job || job,
                    in_flight: false,
                }
                .state();
            }
        };
        acks.workflow |= workflow;
        acks.job |= job;
        acks.state()
    }

    #[instrument(skip(self, event), fields(job = %event.job_id()))]
    pub async fn redeem(&self, event: &CallbackEvent) -> Result<Redemption> {
        let token = event.token()?;
        let job_id = event.job_id();
        if job_id.is_empty() {
            return Err(AuditError::Validation("pipeline job event carries no job id".into()).into());
        }
        let (prior, _in_flight) = self.begin(&token)?;

        let workflow = if prior.workflow {
            debug!(token = %token, "workflow already acknowledged, not signalling again");
            Ok(SignalReceipt { status: 200 })
        } else {
            signal_task_outcome(self.signals.as_ref(), &token, true).await
        };
        let workflow_ok = matches!(&workflow, Ok(receipt) if receipt.accepted());
        self.record(&token, prior, workflow_ok, false);

        // Attempted whatever happened to the workflow signal.
        let job = if prior.job {
            Ok(())
        } else {
            self.pipelines.report_job_outcome(job_id, workflow_ok).await
        };
        if let Err(e) = &job {
            warn!(job = %job_id, error = %e, "failed to report pipeline job outcome");
        }

        let state = self.record(&token, prior, workflow_ok, job.is_ok());
        info!(job = %job_id, token = %token, workflow_ok, state = ?state, "callback handled");

        workflow?;
        job?;
        Ok(Redemption {
            job_id: job_id.to_string(),
            workflow_signaled: workflow_ok,
            job_reported: true,
            state,
        })
    }
}
