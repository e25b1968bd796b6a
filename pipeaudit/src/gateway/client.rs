use anyhow::{Context, Result, bail};
use serde_json::Value;
use tracing::instrument;

const JSON_CONTENT_TYPE: &str = "application/x-amz-json-1.1";

/// Short-lived session credentials forwarded on a single request.
#[derive(Clone)]
pub struct SessionCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: String,
}

impl std::fmt::Debug for SessionCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCredentials")
            .field("access_key_id", &self.access_key_id)
            .finish_non_exhaustive()
    }
}

/// Response of a target call: the HTTP status plus the decoded body.
#[derive(Debug, Clone)]
pub struct TargetResponse {
    pub status: reqwest::StatusCode,
    pub body: Value,
}

/// JSON target-protocol client for one managed service endpoint.
#[derive(Clone)]
pub struct ServiceClient {
    client: reqwest::Client,
    endpoint: String,
    target_prefix: &'static str,
}

impl ServiceClient {
    pub fn new(endpoint: impl Into<String>, target_prefix: &'static str) -> Self {
        Self {
            client: reqwest::Client::builder()
                .user_agent("pipeaudit")
                .build()
                .expect("failed to build HTTP client"),
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            target_prefix,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Invoke `operation`, failing on any non-success status.
    #[instrument(skip(self, body), fields(service = self.target_prefix))]
    pub async fn call(&self, operation: &str, body: &Value) -> Result<TargetResponse> {
        self.call_with(operation, body, None).await
    }

    #[instrument(skip(self, body, credentials), fields(service = self.target_prefix))]
    pub async fn call_with(
        &self,
        operation: &str,
        body: &Value,
        credentials: Option<&SessionCredentials>,
    ) -> Result<TargetResponse> {
        let response = self.send(operation, body, credentials).await?;
        if !response.status.is_success() {
            bail!(
                "{}.{operation} returned HTTP {}: {}",
                self.target_prefix,
                response.status,
                error_message(&response.body)
            );
        }
        Ok(response)
    }

    /// Invoke `operation` and hand back whatever status the service replied
    /// with. Transport failures are still errors.
    #[instrument(skip(self, body), fields(service = self.target_prefix))]
    pub async fn call_raw(&self, operation: &str, body: &Value) -> Result<TargetResponse> {
        self.send(operation, body, None).await
    }

    async fn send(
        &self,
        operation: &str,
        body: &Value,
        credentials: Option<&SessionCredentials>,
    ) -> Result<TargetResponse> {
        let target = format!("{}.{operation}", self.target_prefix);
        let mut request = self
            .client
            .post(format!("{}/", self.endpoint))
            .header("Content-Type", JSON_CONTENT_TYPE)
            .header("X-Amz-Target", &target)
            .body(body.to_string());
        if let Some(creds) = credentials {
            request = request
                .header("X-Amz-Access-Key-Id", &creds.access_key_id)
                .header("X-Amz-Secret-Access-Key", &creds.secret_access_key)
                .header("X-Amz-Security-Token", &creds.session_token);
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("request {target} to {} failed", self.endpoint))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .with_context(|| format!("failed to read {target} response body"))?;
        let body = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text)
                .with_context(|| format!("failed to parse JSON from {target}"))?
        };

        Ok(TargetResponse { status, body })
    }
}

fn error_message(body: &Value) -> String {
    body.get("message")
        .or_else(|| body.get("Message"))
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| body.to_string())
}
