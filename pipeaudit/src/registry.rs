use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use crate::error::AuditError;
use crate::repository::{Repository, RunId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunPhase {
    Provisioning,
    AwaitingCallback,
    Aggregating,
    Finishing,
    Finished,
    Failed,
}

impl RunPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunPhase::Finished | RunPhase::Failed)
    }
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunPhase::Provisioning => "provisioning",
            RunPhase::AwaitingCallback => "awaiting-callback",
            RunPhase::Aggregating => "aggregating",
            RunPhase::Finishing => "finishing",
            RunPhase::Finished => "finished",
            RunPhase::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunState {
    pub repositories: Vec<Repository>,
    pub pipeline_name: String,
    pub phase: RunPhase,
    pub started_at: DateTime<Utc>,
    pub error: Option<String>,
}

/// Terminal runs kept for inspection before the oldest are dropped.
pub const DEFAULT_RETAINED_RUNS: usize = 64;

#[derive(Default)]
struct Runs {
    states: HashMap<RunId, RunState>,
    /// Terminal runs, oldest first.
    ended: VecDeque<RunId>,
}

impl Runs {
    fn state_mut(&mut self, run_id: &RunId) -> Result<&mut RunState, AuditError> {
        self.states
            .get_mut(run_id)
            .ok_or_else(|| AuditError::UnknownRun(run_id.clone()))
    }

    fn mark_ended(&mut self, run_id: &RunId, retain: usize) {
        self.ended.push_back(run_id.clone());
        while self.ended.len() > retain {
            if let Some(oldest) = self.ended.pop_front() {
                debug!(run = %oldest, "run dropped from registry");
                self.states.remove(&oldest);
            }
        }
    }
}

/// Runs this process has started, keyed by run id. Active runs are always
/// kept; only the most recent terminal ones are.
pub struct RunRegistry {
    runs: Mutex<Runs>,
    retain: usize,
}

impl Default for RunRegistry {
    fn default() -> Self {
        Self::with_retention(DEFAULT_RETAINED_RUNS)
    }
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retention(retain: usize) -> Self {
        Self {
            runs: Mutex::new(Runs::default()),
            retain,
        }
    }

    pub fn register(&self, run_id: RunId, repositories: Vec<Repository>, pipeline_name: String) {
        let state = RunState {
            repositories,
            pipeline_name,
            phase: RunPhase::Provisioning,
            started_at: Utc::now(),
            error: None,
        };
        debug!(run = %run_id, "run registered");
        let mut runs = self.runs.lock().expect("registry lock poisoned");
        runs.ended.retain(|id| id != &run_id);
        runs.states.insert(run_id, state);
    }

    pub fn advance(&self, run_id: &RunId, phase: RunPhase) -> Result<(), AuditError> {
        let mut runs = self.runs.lock().expect("registry lock poisoned");
        let state = runs.state_mut(run_id)?;
        debug!(run = %run_id, from = %state.phase, to = %phase, "run phase changed");
        let was_terminal = state.phase.is_terminal();
        state.phase = phase;
        if phase.is_terminal() && !was_terminal {
            runs.mark_ended(run_id, self.retain);
        }
        Ok(())
    }

    pub fn fail(&self, run_id: &RunId, error: &anyhow::Error) -> Result<(), AuditError> {
        let mut runs = self.runs.lock().expect("registry lock poisoned");
        let state = runs.state_mut(run_id)?;
        let was_terminal = state.phase.is_terminal();
        state.phase = RunPhase::Failed;
        state.error = Some(format!("{error:#}"));
        if !was_terminal {
            runs.mark_ended(run_id, self.retain);
        }
        Ok(())
    }

    pub fn get(&self, run_id: &RunId) -> Result<RunState, AuditError> {
        self.runs
            .lock()
            .expect("registry lock poisoned")
            .states
            .get(run_id)
            .cloned()
            .ok_or_else(|| AuditError::UnknownRun(run_id.clone()))
    }

    /// Runs that have not reached a terminal phase.
    pub fn active(&self) -> Vec<RunId> {
        self.runs
            .lock()
            .expect("registry lock poisoned")
            .states
            .iter()
            .filter(|(_, s)| !s.phase.is_terminal())
            .map(|(id, _)| id.clone())
            .collect()
    }
}
