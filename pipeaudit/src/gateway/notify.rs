use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::json;
use tracing::instrument;

use super::Notifier;
use super::client::ServiceClient;
use crate::error::AuditError;

const SNS_TARGET: &str = "AmazonSNS";

/// Publishes run summaries to a distribution topic.
pub struct TopicNotifier {
    client: ServiceClient,
    topic_arn: Option<String>,
}

impl TopicNotifier {
    pub fn new(endpoint: impl Into<String>, topic_arn: Option<String>) -> Self {
        Self {
            client: ServiceClient::new(endpoint, SNS_TARGET),
            topic_arn,
        }
    }
}

#[async_trait]
impl Notifier for TopicNotifier {
    #[instrument(skip(self, message))]
    async fn publish(&self, subject: &str, message: &str) -> Result<()> {
        let topic = self
            .topic_arn
            .as_deref()
            .ok_or(AuditError::MissingConfig("NOTIFY_TOPIC_ARN"))?;
        let body = json!({
            "TopicArn": topic,
            "Subject": subject,
            "Message": message,
        });
        self.client
            .call("Publish", &body)
            .await
            .with_context(|| format!("failed to publish to {topic}"))?;
        Ok(())
    }
}
