use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde_json::json;
use tracing::instrument;

use super::BuildProjects;
use super::client::ServiceClient;
use crate::buildspec::BuildProjectSpec;

const CODEBUILD_TARGET: &str = "CodeBuild_20161006";

pub struct CodeBuildGateway {
    client: ServiceClient,
}

impl CodeBuildGateway {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: ServiceClient::new(endpoint, CODEBUILD_TARGET),
        }
    }
}

#[async_trait]
impl BuildProjects for CodeBuildGateway {
    #[instrument(skip(self, spec), fields(project = %spec.name))]
    async fn create_project(&self, spec: &BuildProjectSpec) -> Result<String> {
        let body = serde_json::to_value(spec).context("failed to encode build project")?;
        let response = self
            .client
            .call("CreateProject", &body)
            .await
            .with_context(|| format!("failed to create build project {}", spec.name))?;

        response
            .body
            .get("project")
            .and_then(|p| p.get("name"))
            .and_then(|n| n.as_str())
            .map(str::to_string)
            .with_context(|| format!("error creating project {}: no name returned", spec.name))
    }

    #[instrument(skip(self))]
    async fn delete_project(&self, name: &str) -> Result<()> {
        if name.is_empty() {
            bail!("no project name provided");
        }
        self.client
            .call("DeleteProject", &json!({ "name": name }))
            .await
            .with_context(|| format!("failed to delete {name}"))?;
        Ok(())
    }
}
