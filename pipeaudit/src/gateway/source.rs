use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, instrument};

use super::client::{ServiceClient, SessionCredentials};
use super::{CredentialProvider, LISTING_SESSION, SourceControl};
use crate::repository::Repository;

const STS_TARGET: &str = "AWSSecurityTokenServiceV20110615";
const CODECOMMIT_TARGET: &str = "CodeCommit_20150413";
const SESSION_NAME: &str = "pipeaudit-listing";

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AssumeRoleResponse {
    credentials: Option<StsCredentialsBody>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StsCredentialsBody {
    access_key_id: Option<String>,
    secret_access_key: Option<String>,
    session_token: Option<String>,
}

pub struct StsCredentials {
    client: ServiceClient,
}

impl StsCredentials {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: ServiceClient::new(endpoint, STS_TARGET),
        }
    }
}

#[async_trait]
impl CredentialProvider for StsCredentials {
    #[instrument(skip(self))]
    async fn assume_role(&self, role_arn: &str, duration: Duration) -> Result<SessionCredentials> {
        let body = json!({
            "RoleArn": role_arn,
            "RoleSessionName": SESSION_NAME,
            "DurationSeconds": duration.as_secs(),
        });
        let response = self
            .client
            .call("AssumeRole", &body)
            .await
            .with_context(|| format!("failed to assume role {role_arn}"))?;

        parse_credentials(response.body)
    }
}

fn parse_credentials(body: serde_json::Value) -> Result<SessionCredentials> {
    let parsed: AssumeRoleResponse =
        serde_json::from_value(body).context("failed to deserialize AssumeRole response")?;

    match parsed.credentials {
        Some(StsCredentialsBody {
            access_key_id: Some(access_key_id),
            secret_access_key: Some(secret_access_key),
            session_token: Some(session_token),
        }) => Ok(SessionCredentials {
            access_key_id,
            secret_access_key,
            session_token,
        }),
        _ => bail!("no credentials returned from STS"),
    }
}

/// Name-based rules deciding which repositories a run audits.
#[derive(Debug, Clone)]
pub struct RepositoryFilter {
    /// Substring a repository name must contain, if set.
    pub include: Option<String>,
    /// Substrings marking documentation and scan-infrastructure repositories.
    pub exclude: Vec<String>,
}

impl Default for RepositoryFilter {
    fn default() -> Self {
        Self {
            include: None,
            exclude: vec!["npm-audit".into(), "pipeaudit".into(), "docs".into()],
        }
    }
}

impl RepositoryFilter {
    pub fn admits(&self, name: &str) -> bool {
        if let Some(include) = &self.include {
            if !name.contains(include.as_str()) {
                return false;
            }
        }
        !self.exclude.iter().any(|e| name.contains(e.as_str()))
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListRepositoriesResponse {
    repositories: Option<Vec<RepositoryMetadata>>,
    next_token: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RepositoryMetadata {
    repository_name: Option<String>,
}

pub struct CodeCommitGateway {
    client: ServiceClient,
    credentials: Arc<dyn CredentialProvider>,
    filter: RepositoryFilter,
}

impl CodeCommitGateway {
    pub fn new(
        endpoint: impl Into<String>,
        credentials: Arc<dyn CredentialProvider>,
        filter: RepositoryFilter,
    ) -> Self {
        Self {
            client: ServiceClient::new(endpoint, CODECOMMIT_TARGET),
            credentials,
            filter,
        }
    }
}

#[async_trait]
impl SourceControl for CodeCommitGateway {
    #[instrument(skip(self))]
    async fn list_repositories(&self, role_arn: &str) -> Result<Vec<Repository>> {
        // Scoped to this call; the session is dropped when listing finishes.
        let session = self
            .credentials
            .assume_role(role_arn, LISTING_SESSION)
            .await?;

        let mut names = Vec::new();
        let mut next_token: Option<String> = None;
        let mut saw_listing = false;
        loop {
            let body = match &next_token {
                Some(token) => json!({ "nextToken": token }),
                None => json!({}),
            };
            let response = self
                .client
                .call_with("ListRepositories", &body, Some(&session))
                .await
                .context("failed to list repositories")?;
            let page: ListRepositoriesResponse = serde_json::from_value(response.body)
                .context("failed to deserialize ListRepositories response")?;

            if let Some(repos) = page.repositories {
                saw_listing = true;
                names.extend(repos.into_iter().filter_map(|r| r.repository_name));
            }
            match page.next_token {
                Some(token) if !token.is_empty() => next_token = Some(token),
                _ => break,
            }
        }

        if !saw_listing {
            bail!("no repositories found");
        }

        let total = names.len();
        let repositories = names
            .into_iter()
            .filter(|name| self.filter.admits(name))
            .map(Repository::new)
            .collect::<Result<Vec<_>, _>>()?;
        debug!(total, kept = repositories.len(), "repositories listed");
        Ok(repositories)
    }
}
