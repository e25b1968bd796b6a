use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::AuditError;

/// A source repository identifier, validated as non-empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Repository(String);

impl Repository {
    pub fn new(name: impl Into<String>) -> Result<Self, AuditError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(AuditError::Validation(
                "repository names must be non-empty strings".to_string(),
            ));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Resource-safe form of the name: every character outside
    /// `[A-Za-z0-9_-]` becomes a dash, so `de.ves.pt` turns into `de-ves-pt`.
    pub fn normalized(&self) -> String {
        self.0
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '-'
                }
            })
            .collect()
    }
}

impl fmt::Display for Repository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Repository {
    type Err = AuditError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for Repository {
    type Error = AuditError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Repository> for String {
    fn from(repo: Repository) -> Self {
        repo.0
    }
}

/// Short identifier namespacing every external resource a run creates.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RunId(String);

impl RunId {
    pub fn generate() -> Self {
        let uuid = uuid::Uuid::new_v4().simple().to_string();
        Self(uuid[..8].to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for RunId {
    type Err = AuditError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let valid = !s.is_empty()
            && s.len() <= 32
            && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '-');
        if !valid {
            return Err(AuditError::Validation(format!(
                "run id must be 1-32 characters of [A-Za-z0-9-], got {s:?}"
            )));
        }
        Ok(Self(s.to_string()))
    }
}

impl TryFrom<String> for RunId {
    type Error = AuditError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<RunId> for String {
    fn from(id: RunId) -> Self {
        id.0
    }
}

/// Derives every per-run resource name from the run id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunScope {
    run_id: RunId,
    pipeline_base: String,
}

impl RunScope {
    pub fn new(run_id: RunId, pipeline_base: impl Into<String>) -> Self {
        Self {
            run_id,
            pipeline_base: pipeline_base.into(),
        }
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub fn pipeline_name(&self) -> String {
        format!("{}-{}", self.pipeline_base, self.run_id)
    }

    pub fn project_name(&self, repo: &Repository) -> String {
        format!("{}-{}-scan", repo.normalized(), self.run_id)
    }

    /// File name of the audit artifact; also the label used in summaries.
    pub fn report_file(&self, repo: &Repository) -> String {
        format!("{}-audit-report.json", repo.normalized())
    }

    pub fn report_key(&self, repo: &Repository) -> String {
        format!("runs/{}/{}", self.run_id, self.report_file(repo))
    }
}

/// Parse a list of raw names, rejecting the whole list on the first bad
/// entry or on names that collide once normalized.
pub fn parse_repositories<I, S>(names: I) -> Result<Vec<Repository>, AuditError>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let repositories = names
        .into_iter()
        .map(Repository::new)
        .collect::<Result<Vec<_>, _>>()?;
    ensure_distinct(&repositories)?;
    Ok(repositories)
}

/// Every repository of a run owns its build project, action names and
/// report key, all derived from the normalized name.
pub fn ensure_distinct(repositories: &[Repository]) -> Result<(), AuditError> {
    let mut seen: HashMap<String, &Repository> = HashMap::new();
    for repo in repositories {
        if let Some(first) = seen.insert(repo.normalized(), repo) {
            let message = if first == repo {
                format!("repository {repo} is listed more than once")
            } else {
                format!(
                    "repositories {first} and {repo} both map to the resource name {}",
                    repo.normalized()
                )
            };
            return Err(AuditError::Validation(message));
        }
    }
    Ok(())
}
