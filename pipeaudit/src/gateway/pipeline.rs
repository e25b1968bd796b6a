use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::instrument;

use super::Pipelines;
use super::client::ServiceClient;
use crate::topology::PipelineDefinition;

const CODEPIPELINE_TARGET: &str = "CodePipeline_20150709";

pub struct CodePipelineGateway {
    client: ServiceClient,
}

impl CodePipelineGateway {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: ServiceClient::new(endpoint, CODEPIPELINE_TARGET),
        }
    }
}

fn job_result_body(job_id: &str, success: bool) -> (&'static str, Value) {
    if success {
        ("PutJobSuccessResult", json!({ "jobId": job_id }))
    } else {
        (
            "PutJobFailureResult",
            json!({
                "jobId": job_id,
                "failureDetails": {
                    "type": "JobFailed",
                    "message": "Failed to send task success",
                    "externalExecutionId": job_id,
                },
            }),
        )
    }
}

#[async_trait]
impl Pipelines for CodePipelineGateway {
    #[instrument(skip(self, definition), fields(pipeline = %definition.name, stages = definition.stages.len()))]
    async fn create_pipeline(&self, definition: &PipelineDefinition) -> Result<Option<String>> {
        let body = json!({ "pipeline": definition });
        let response = self
            .client
            .call("CreatePipeline", &body)
            .await
            .with_context(|| format!("failed to create pipeline {}", definition.name))?;

        Ok(response
            .body
            .get("pipeline")
            .and_then(|p| p.get("name"))
            .and_then(|n| n.as_str())
            .map(str::to_string))
    }

    #[instrument(skip(self))]
    async fn delete_pipeline(&self, name: &str) -> Result<()> {
        self.client
            .call("DeletePipeline", &json!({ "name": name }))
            .await
            .with_context(|| format!("failed to delete {name}"))?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn report_job_outcome(&self, job_id: &str, success: bool) -> Result<()> {
        if job_id.is_empty() {
            bail!("no job id provided");
        }
        let (operation, body) = job_result_body(job_id, success);
        self.client
            .call(operation, &body)
            .await
            .with_context(|| format!("failed to report outcome of job {job_id}"))?;
        Ok(())
    }
}
