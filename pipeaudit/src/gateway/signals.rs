use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::instrument;

use super::client::ServiceClient;
use super::{SignalReceipt, WorkflowSignals};
use crate::token::ContinuationToken;

const STATES_TARGET: &str = "AWSStepFunctions";

/// Signals a remote workflow engine holding the paused task.
pub struct StepFunctionsGateway {
    client: ServiceClient,
}

impl StepFunctionsGateway {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: ServiceClient::new(endpoint, STATES_TARGET),
        }
    }
}

#[async_trait]
impl WorkflowSignals for StepFunctionsGateway {
    #[instrument(skip_all)]
    async fn send_task_success(
        &self,
        token: &ContinuationToken,
        output: &Value,
    ) -> Result<SignalReceipt> {
        let body = json!({
            "taskToken": token.as_str(),
            "output": output.to_string(),
        });
        let response = self
            .client
            .call_raw("SendTaskSuccess", &body)
            .await
            .context("failed to send task success")?;
        Ok(SignalReceipt {
            status: response.status.as_u16(),
        })
    }

    #[instrument(skip_all)]
    async fn send_task_failure(
        &self,
        token: &ContinuationToken,
        error: &str,
        cause: &str,
    ) -> Result<SignalReceipt> {
        let body = json!({
            "taskToken": token.as_str(),
            "error": error,
            "cause": cause,
        });
        let response = self
            .client
            .call("SendTaskFailure", &body)
            .await
            .context("failed to send task failure")?;
        Ok(SignalReceipt {
            status: response.status.as_u16(),
        })
    }
}
