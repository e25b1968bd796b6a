//! Builds the per-run pipeline graph: one Source and one Build action per
//! repository, plus a single Invoke action that hands control back to the
//! workflow.

use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use futures::future::join_all;
use serde::{Serialize, Serializer};
use tokio::sync::Semaphore;
use tracing::{debug, info, instrument, warn};

use crate::buildspec::BuildProjectSpec;
use crate::config::Settings;
use crate::error::AuditError;
use crate::gateway::{BuildProjects, Pipelines};
use crate::repository::{Repository, RunScope};
use crate::token::ContinuationToken;

const INVOKE_ACTION_NAME: &str = "NotifyWorkflow";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum StageKind {
    Source,
    Build,
    Invoke,
}

impl StageKind {
    pub fn provider(&self) -> &'static str {
        match self {
            StageKind::Source => "CodeCommit",
            StageKind::Build => "CodeBuild",
            StageKind::Invoke => "Lambda",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageKind::Source => write!(f, "Source"),
            StageKind::Build => write!(f, "Build"),
            StageKind::Invoke => write!(f, "Invoke"),
        }
    }
}

/// What a stage needs from the caller, per kind.
#[derive(Debug, Clone, Copy)]
pub enum StageSpec<'a> {
    Source,
    Build,
    Invoke { token: &'a ContinuationToken },
}

impl StageSpec<'_> {
    pub fn kind(&self) -> StageKind {
        match self {
            StageSpec::Source => StageKind::Source,
            StageSpec::Build => StageKind::Build,
            StageSpec::Invoke { .. } => StageKind::Invoke,
        }
    }
}

fn bool_as_string<S: Serializer>(value: &bool, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(if *value { "true" } else { "false" })
}

/// Provider configuration of one action, shaped by its stage kind.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ActionConfig {
    #[serde(rename_all = "PascalCase")]
    Source {
        repository_name: String,
        branch_name: String,
        #[serde(serialize_with = "bool_as_string")]
        poll_for_source_changes: bool,
    },
    #[serde(rename_all = "PascalCase")]
    Build { project_name: String },
    #[serde(rename_all = "PascalCase")]
    Invoke {
        function_name: String,
        user_parameters: String,
    },
}

impl ActionConfig {
    pub fn kind(&self) -> StageKind {
        match self {
            ActionConfig::Source { .. } => StageKind::Source,
            ActionConfig::Build { .. } => StageKind::Build,
            ActionConfig::Invoke { .. } => StageKind::Invoke,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActionTypeId {
    pub category: StageKind,
    pub owner: &'static str,
    pub provider: &'static str,
    pub version: &'static str,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArtifactRef {
    pub name: String,
}

impl ArtifactRef {
    fn named(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionDeclaration {
    pub name: String,
    pub action_type_id: ActionTypeId,
    pub configuration: ActionConfig,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub input_artifacts: Vec<ArtifactRef>,
    pub output_artifacts: Vec<ArtifactRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role_arn: Option<String>,
}

impl ActionDeclaration {
    fn new(name: impl Into<String>, configuration: ActionConfig) -> Self {
        let kind = configuration.kind();
        Self {
            name: name.into(),
            action_type_id: ActionTypeId {
                category: kind,
                owner: "AWS",
                provider: kind.provider(),
                version: "1",
            },
            configuration,
            input_artifacts: vec![],
            output_artifacts: vec![],
            role_arn: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageDeclaration {
    pub name: String,
    pub actions: Vec<ActionDeclaration>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EncryptionKey {
    pub id: String,
    #[serde(rename = "type")]
    pub key_type: &'static str,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactStore {
    pub location: String,
    #[serde(rename = "type")]
    pub store_type: &'static str,
    pub encryption_key: EncryptionKey,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineDefinition {
    pub name: String,
    pub role_arn: String,
    pub artifact_store: ArtifactStore,
    pub stages: Vec<StageDeclaration>,
}

pub struct TopologyBuilder {
    builds: Arc<dyn BuildProjects>,
    pipelines: Arc<dyn Pipelines>,
    settings: Arc<Settings>,
}

impl TopologyBuilder {
    pub fn new(
        builds: Arc<dyn BuildProjects>,
        pipelines: Arc<dyn Pipelines>,
        settings: Arc<Settings>,
    ) -> Self {
        Self {
            builds,
            pipelines,
            settings,
        }
    }

    /// Actions for one stage. Source and Build fan out one action per
    /// repository; Invoke always yields exactly one.
    ///
    /// Building the Build stage creates the backing build projects. If any of
    /// them fails the ones already created are deleted again and the whole
    /// stage fails.
    #[instrument(skip(self, scope, repositories, spec), fields(run = %scope.run_id(), kind = %spec.kind(), repos = repositories.len()))]
    pub async fn actions(
        &self,
        scope: &RunScope,
        repositories: &[Repository],
        spec: StageSpec<'_>,
    ) -> Result<Vec<ActionDeclaration>> {
        match spec {
            StageSpec::Source => Ok(self.source_actions(repositories)),
            StageSpec::Build => self.build_actions(scope, repositories).await,
            StageSpec::Invoke { token } => Ok(vec![self.invoke_action(token)?]),
        }
    }

    /// A stage named after its kind.
    pub async fn stage(
        &self,
        scope: &RunScope,
        repositories: &[Repository],
        spec: StageSpec<'_>,
    ) -> Result<StageDeclaration> {
        let actions = self.actions(scope, repositories, spec).await?;
        Ok(StageDeclaration {
            name: spec.kind().to_string(),
            actions,
        })
    }

    fn source_actions(&self, repositories: &[Repository]) -> Vec<ActionDeclaration> {
        repositories
            .iter()
            .map(|repo| {
                let normalized = repo.normalized();
                let mut action = ActionDeclaration::new(
                    format!("{normalized}-{}", StageKind::Source),
                    ActionConfig::Source {
                        repository_name: repo.to_string(),
                        branch_name: self.settings.source_branch.clone(),
                        // The run triggers the pipeline itself; polling would start it twice.
                        poll_for_source_changes: false,
                    },
                );
                action.output_artifacts = vec![ArtifactRef::named(format!("{normalized}-Source"))];
                action.role_arn = self.settings.source_role_arn.clone();
                action
            })
            .collect()
    }

    async fn build_actions(
        &self,
        scope: &RunScope,
        repositories: &[Repository],
    ) -> Result<Vec<ActionDeclaration>> {
        // Every spec is rendered up front so missing configuration fails
        // before the first project exists.
        let specs = repositories
            .iter()
            .map(|repo| BuildProjectSpec::for_repository(scope, repo, &self.settings))
            .collect::<Result<Vec<_>>>()?;

        let sem = Arc::new(Semaphore::new(self.settings.max_concurrency.max(1)));
        let futures: Vec<_> = repositories
            .iter()
            .zip(specs)
            .map(|(repo, spec)| {
                let sem = sem.clone();
                let builds = self.builds.clone();
                async move {
                    let _permit = sem.acquire().await.expect("semaphore closed");
                    let result = builds.create_project(&spec).await;
                    (repo, result)
                }
            })
            .collect();
        let results = join_all(futures).await;

        let mut created = Vec::new();
        let mut first_error = None;
        for (repo, result) in results {
            match result {
                Ok(project) => created.push((repo, project)),
                Err(e) => {
                    warn!(repo = %repo, error = %e, "build project provisioning failed");
                    if first_error.is_none() {
                        first_error =
                            Some(e.context(format!("provisioning build project for {repo}")));
                    }
                }
            }
        }

        if let Some(err) = first_error {
            let names: Vec<String> = created.into_iter().map(|(_, project)| project).collect();
            self.rollback_projects(&names).await;
            return Err(err);
        }

        Ok(created
            .into_iter()
            .map(|(repo, project)| {
                let normalized = repo.normalized();
                debug!(repo = %repo, project = %project, "build project ready");
                let mut action = ActionDeclaration::new(
                    format!("{normalized}-{}", StageKind::Build),
                    ActionConfig::Build {
                        project_name: project,
                    },
                );
                action.input_artifacts = vec![ArtifactRef::named(format!("{normalized}-Source"))];
                action.output_artifacts = vec![ArtifactRef::named(format!("{normalized}-Build"))];
                action
            })
            .collect())
    }

    fn invoke_action(&self, token: &ContinuationToken) -> Result<ActionDeclaration> {
        let function_name = self.settings.require_callback_function()?;
        let mut action = ActionDeclaration::new(
            INVOKE_ACTION_NAME,
            ActionConfig::Invoke {
                function_name: function_name.to_string(),
                user_parameters: token.to_user_parameters(),
            },
        );
        action.output_artifacts = vec![ArtifactRef::named(INVOKE_ACTION_NAME)];
        Ok(action)
    }

    /// Delete build projects best-effort, logging each failure.
    pub async fn rollback_projects(&self, names: &[String]) {
        let results = join_all(names.iter().map(|name| {
            let builds = self.builds.clone();
            async move { (name, builds.delete_project(name).await) }
        }))
        .await;
        for (name, result) in results {
            if let Err(e) = result {
                warn!(project = %name, error = %e, "failed to roll back build project");
            }
        }
    }

    /// Submit the stages as one pipeline and return its confirmed name.
    #[instrument(skip(self, stages), fields(stages = stages.len()))]
    pub async fn create_pipeline(&self, name: &str, stages: Vec<StageDeclaration>) -> Result<String> {
        if stages.is_empty() {
            return Err(AuditError::NoStages.into());
        }
        let definition = PipelineDefinition {
            name: name.to_string(),
            role_arn: self.settings.require_pipeline_role()?.to_string(),
            artifact_store: ArtifactStore {
                location: self.settings.require_bucket()?.to_string(),
                store_type: "S3",
                encryption_key: EncryptionKey {
                    id: self.settings.require_kms_key()?.to_string(),
                    key_type: "KMS",
                },
            },
            stages,
        };

        let confirmed = self
            .pipelines
            .create_pipeline(&definition)
            .await?
            .ok_or_else(|| AuditError::PipelineNotConfirmed(name.to_string()))?;
        info!(pipeline = %confirmed, "pipeline created");
        Ok(confirmed)
    }

    #[instrument(skip(self))]
    pub async fn delete_pipeline(&self, name: &str) -> Result<()> {
        self.pipelines.delete_pipeline(name).await?;
        info!(pipeline = %name, "pipeline deleted");
        Ok(())
    }

    /// Build the Source → Build → Invoke topology and create the pipeline.
    /// Build projects created along the way are removed again if a later
    /// step fails.
    #[instrument(skip(self, scope, repositories, token), fields(run = %scope.run_id()))]
    pub async fn provision(
        &self,
        scope: &RunScope,
        repositories: &[Repository],
        token: &ContinuationToken,
    ) -> Result<String> {
        // Checked before the Build stage creates anything.
        self.settings.require_callback_function()?;
        self.settings.require_pipeline_role()?;

        let source = self.stage(scope, repositories, StageSpec::Source).await?;
        let build = self.stage(scope, repositories, StageSpec::Build).await?;
        let projects: Vec<String> = build
            .actions
            .iter()
            .filter_map(|a| match &a.configuration {
                ActionConfig::Build { project_name } => Some(project_name.clone()),
                _ => None,
            })
            .collect();

        let result = async {
            let invoke = self
                .stage(scope, repositories, StageSpec::Invoke { token })
                .await?;
            self.create_pipeline(&scope.pipeline_name(), vec![source, build, invoke])
                .await
        }
        .await;

        if result.is_err() {
            self.rollback_projects(&projects).await;
        }
        result
    }
}
