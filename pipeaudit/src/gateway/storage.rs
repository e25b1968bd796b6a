use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use tracing::instrument;

use super::ObjectStore;
use crate::error::AuditError;

/// Path-style reads from the artifact bucket.
pub struct BucketStore {
    client: reqwest::Client,
    endpoint: String,
    bucket: Option<String>,
}

impl BucketStore {
    pub fn new(endpoint: impl Into<String>, bucket: Option<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .user_agent("pipeaudit")
                .build()
                .expect("failed to build HTTP client"),
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            bucket,
        }
    }
}

#[async_trait]
impl ObjectStore for BucketStore {
    #[instrument(skip(self))]
    async fn fetch_object(&self, key: &str) -> Result<String> {
        let bucket = self
            .bucket
            .as_deref()
            .ok_or(AuditError::MissingConfig("BUILDSPEC_BUCKET"))?;
        let url = format!("{}/{bucket}/{key}", self.endpoint);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("failed to fetch {url}"))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            bail!("{key} not found in {bucket}");
        }
        if !status.is_success() {
            bail!("{url} returned HTTP {status}");
        }

        let body = response
            .text()
            .await
            .with_context(|| format!("failed to read body from {url}"))?;
        if body.is_empty() {
            return Err(AuditError::MissingObjectBody(key.to_string()).into());
        }
        Ok(body)
    }
}
