//! Narrow clients for the external systems a run talks to.
//!
//! Each capability is a trait so the topology builder, token bridge and
//! aggregator can be exercised against fakes; the concrete types speak HTTP.

pub mod build;
pub mod client;
pub mod notify;
pub mod pipeline;
pub mod signals;
pub mod source;
pub mod storage;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use crate::buildspec::BuildProjectSpec;
use crate::config::Settings;
use crate::repository::Repository;
use crate::token::ContinuationToken;
use crate::topology::PipelineDefinition;

pub use build::CodeBuildGateway;
pub use client::{ServiceClient, SessionCredentials, TargetResponse};
pub use notify::TopicNotifier;
pub use pipeline::CodePipelineGateway;
pub use signals::StepFunctionsGateway;
pub use source::{CodeCommitGateway, RepositoryFilter, StsCredentials};
pub use storage::BucketStore;

/// Duration of the cross-account session used for repository listing.
pub const LISTING_SESSION: Duration = Duration::from_secs(900);

#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn assume_role(&self, role_arn: &str, duration: Duration) -> Result<SessionCredentials>;
}

#[async_trait]
pub trait SourceControl: Send + Sync {
    /// Repositories visible through `role_arn`, minus reserved names.
    async fn list_repositories(&self, role_arn: &str) -> Result<Vec<Repository>>;
}

#[async_trait]
pub trait BuildProjects: Send + Sync {
    /// Create the project and return the name the service confirmed.
    async fn create_project(&self, spec: &BuildProjectSpec) -> Result<String>;
    async fn delete_project(&self, name: &str) -> Result<()>;
}

#[async_trait]
pub trait Pipelines: Send + Sync {
    /// Submit the definition; `None` when the service did not echo a name.
    async fn create_pipeline(&self, definition: &PipelineDefinition) -> Result<Option<String>>;
    async fn delete_pipeline(&self, name: &str) -> Result<()>;
    /// Tell the pipeline engine its invoke job finished.
    async fn report_job_outcome(&self, job_id: &str, success: bool) -> Result<()>;
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn fetch_object(&self, key: &str) -> Result<String>;
}

/// Outcome of a workflow signal that reached the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalReceipt {
    pub status: u16,
}

impl SignalReceipt {
    pub fn accepted(&self) -> bool {
        self.status == 200
    }
}

#[async_trait]
pub trait WorkflowSignals: Send + Sync {
    async fn send_task_success(
        &self,
        token: &ContinuationToken,
        output: &Value,
    ) -> Result<SignalReceipt>;
    async fn send_task_failure(
        &self,
        token: &ContinuationToken,
        error: &str,
        cause: &str,
    ) -> Result<SignalReceipt>;
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn publish(&self, subject: &str, message: &str) -> Result<()>;
}

/// The HTTP-backed gateways, wired from one `Settings`.
#[derive(Clone)]
pub struct Gateways {
    pub source: Arc<dyn SourceControl>,
    pub builds: Arc<dyn BuildProjects>,
    pub pipelines: Arc<dyn Pipelines>,
    pub store: Arc<dyn ObjectStore>,
    pub signals: Arc<dyn WorkflowSignals>,
    pub notifier: Arc<dyn Notifier>,
}

impl Gateways {
    pub fn from_settings(settings: &Settings) -> Self {
        let credentials = Arc::new(StsCredentials::new(settings.credentials_endpoint()));
        let filter = RepositoryFilter {
            include: settings.repository_include.clone(),
            ..RepositoryFilter::default()
        };
        Self {
            source: Arc::new(CodeCommitGateway::new(
                settings.source_endpoint(),
                credentials,
                filter,
            )),
            builds: Arc::new(CodeBuildGateway::new(settings.build_endpoint())),
            pipelines: Arc::new(CodePipelineGateway::new(settings.pipeline_endpoint())),
            store: Arc::new(BucketStore::new(
                settings.storage_endpoint(),
                settings.artifact_bucket.clone(),
            )),
            signals: Arc::new(StepFunctionsGateway::new(settings.workflow_endpoint())),
            notifier: Arc::new(TopicNotifier::new(
                settings.notify_endpoint(),
                settings.notify_topic_arn.clone(),
            )),
        }
    }
}
