use anyhow::{Context, Result};
use serde::Serialize;

use crate::config::Settings;
use crate::repository::{Repository, RunScope};

const BUILD_IMAGE: &str = "aws/codebuild/standard:7.0";
const COMPUTE_TYPE: &str = "BUILD_GENERAL1_SMALL";

#[derive(Serialize)]
struct ScanBuildSpec {
    version: f64,
    phases: Phases,
}

#[derive(Serialize)]
struct Phases {
    build: BuildPhase,
}

#[derive(Serialize)]
struct BuildPhase {
    #[serde(rename = "on-failure")]
    on_failure: &'static str,
    commands: Vec<String>,
}

/// Inline build specification for one repository's scan.
///
/// `npm audit` exits non-zero whenever it finds anything, so the command is
/// forced to succeed and the phase continues on failure; the report upload
/// must still happen.
pub fn scan_buildspec(report_file: &str, bucket: &str, report_key: &str) -> Result<String> {
    let spec = ScanBuildSpec {
        version: 0.2,
        phases: Phases {
            build: BuildPhase {
                on_failure: "CONTINUE",
                commands: vec![
                    format!("npm audit --json > {report_file}; exit 0"),
                    format!("aws s3 cp --sse aws:kms {report_file} s3://{bucket}/{report_key}"),
                ],
            },
        },
    };
    serde_yaml::to_string(&spec).context("failed to render buildspec")
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProjectSource {
    #[serde(rename = "type")]
    pub source_type: String,
    pub buildspec: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ProjectArtifacts {
    #[serde(rename = "type")]
    pub artifact_type: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct EnvironmentVariable {
    pub name: String,
    pub value: String,
    #[serde(rename = "type")]
    pub variable_type: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProjectEnvironment {
    #[serde(rename = "type")]
    pub environment_type: String,
    pub image: String,
    pub compute_type: String,
    pub image_pull_credentials_type: String,
    pub environment_variables: Vec<EnvironmentVariable>,
}

/// Request body for creating one repository's scan project.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BuildProjectSpec {
    pub name: String,
    pub source: ProjectSource,
    pub service_role: String,
    pub artifacts: ProjectArtifacts,
    pub encryption_key: String,
    pub environment: ProjectEnvironment,
}

impl BuildProjectSpec {
    /// Fails with `AuditError::MissingConfig` when the build role, bucket or
    /// key is absent.
    pub fn for_repository(
        scope: &RunScope,
        repo: &Repository,
        settings: &Settings,
    ) -> Result<Self> {
        let service_role = settings.require_build_role()?;
        let bucket = settings.require_bucket()?;
        let encryption_key = settings.require_kms_key()?;

        let buildspec = scan_buildspec(
            &scope.report_file(repo),
            bucket,
            &scope.report_key(repo),
        )?;

        Ok(Self {
            name: scope.project_name(repo),
            source: ProjectSource {
                source_type: "CODEPIPELINE".into(),
                buildspec,
            },
            service_role: service_role.to_string(),
            artifacts: ProjectArtifacts {
                artifact_type: "CODEPIPELINE".into(),
            },
            encryption_key: encryption_key.to_string(),
            environment: ProjectEnvironment {
                environment_type: "LINUX_CONTAINER".into(),
                image: BUILD_IMAGE.into(),
                compute_type: COMPUTE_TYPE.into(),
                image_pull_credentials_type: "CODEBUILD".into(),
                environment_variables: vec![EnvironmentVariable {
                    name: "ENVIRONMENT".into(),
                    value: "dev".into(),
                    variable_type: "PLAINTEXT".into(),
                }],
            },
        })
    }
}
