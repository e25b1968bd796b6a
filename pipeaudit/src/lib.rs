pub mod buildspec;
pub mod callback;
pub mod config;
pub mod error;
pub mod gateway;
pub mod orchestrator;
pub mod registry;
pub mod report;
pub mod repository;
pub mod token;
pub mod topology;

pub use config::Settings;
pub use error::AuditError;
pub use gateway::Gateways;
pub use orchestrator::{
    CleanupReport, Orchestrator, Provisioned, RunOptions, RunOutcome, RunRequest,
    parse_repository_list, validate_run_input,
};
pub use report::{Aggregation, ReportAggregator, RunSummary, classify_by_severity};
pub use repository::{Repository, RunId, RunScope};
pub use token::{CallbackEvent, ContinuationToken, Redemption, TokenBridge, TokenLedger};
pub use topology::{StageKind, StageSpec, TopologyBuilder};
