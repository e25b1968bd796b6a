use crate::error::AuditError;

pub const DEFAULT_REGION: &str = "eu-central-1";
pub const DEFAULT_BRANCH: &str = "develop";
pub const DEFAULT_PIPELINE_NAME: &str = "NPM-Audit-Pipeline";
pub const DEFAULT_MAX_CONCURRENCY: usize = 10;

/// Base URLs of the managed services. `None` means the regional default.
#[derive(Debug, Clone, Default)]
pub struct Endpoints {
    pub source: Option<String>,
    pub credentials: Option<String>,
    pub build: Option<String>,
    pub pipeline: Option<String>,
    pub storage: Option<String>,
    pub workflow: Option<String>,
    pub notify: Option<String>,
}

/// Runtime configuration, filled from flags and environment by the CLI.
/// Every value is optional at load time; operations
/// check the ones they need through the `require_*` accessors before making
/// any network call.
#[derive(Debug, Clone)]
pub struct Settings {
    pub region: String,
    pub pipeline_name: String,
    pub source_branch: String,
    pub max_concurrency: usize,
    pub pipeline_role_arn: Option<String>,
    pub build_role_arn: Option<String>,
    pub source_role_arn: Option<String>,
    pub artifact_bucket: Option<String>,
    pub kms_key_id: Option<String>,
    pub callback_function: Option<String>,
    pub notify_topic_arn: Option<String>,
    /// Only repositories whose name contains this are audited.
    pub repository_include: Option<String>,
    pub endpoints: Endpoints,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            region: DEFAULT_REGION.to_string(),
            pipeline_name: DEFAULT_PIPELINE_NAME.to_string(),
            source_branch: DEFAULT_BRANCH.to_string(),
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            pipeline_role_arn: None,
            build_role_arn: None,
            source_role_arn: None,
            artifact_bucket: None,
            kms_key_id: None,
            callback_function: None,
            notify_topic_arn: None,
            repository_include: None,
            endpoints: Endpoints::default(),
        }
    }
}

fn required<'a>(value: &'a Option<String>, key: &'static str) -> Result<&'a str, AuditError> {
    value.as_deref().ok_or(AuditError::MissingConfig(key))
}

impl Settings {
    pub fn require_pipeline_role(&self) -> Result<&str, AuditError> {
        required(&self.pipeline_role_arn, "CODEPIPELINE_SERVICE_ROLE_ARN")
    }

    pub fn require_build_role(&self) -> Result<&str, AuditError> {
        required(&self.build_role_arn, "CODEBUILD_SERVICE_ROLE_ARN")
    }

    pub fn require_source_role(&self) -> Result<&str, AuditError> {
        required(&self.source_role_arn, "SOURCE_ROLE_ARN")
    }

    pub fn require_bucket(&self) -> Result<&str, AuditError> {
        required(&self.artifact_bucket, "BUILDSPEC_BUCKET")
    }

    pub fn require_kms_key(&self) -> Result<&str, AuditError> {
        required(&self.kms_key_id, "KMS_KEY_ID")
    }

    pub fn require_callback_function(&self) -> Result<&str, AuditError> {
        required(&self.callback_function, "SEND_SUCCESS_LAMBDA")
    }

    pub fn require_notify_topic(&self) -> Result<&str, AuditError> {
        required(&self.notify_topic_arn, "NOTIFY_TOPIC_ARN")
    }

    fn regional(&self, service: &str) -> String {
        format!("https://{service}.{}.amazonaws.com", self.region)
    }

    pub fn source_endpoint(&self) -> String {
        self.endpoints.source.clone().unwrap_or_else(|| self.regional("codecommit"))
    }

    pub fn credentials_endpoint(&self) -> String {
        self.endpoints.credentials.clone().unwrap_or_else(|| self.regional("sts"))
    }

    pub fn build_endpoint(&self) -> String {
        self.endpoints.build.clone().unwrap_or_else(|| self.regional("codebuild"))
    }

    pub fn pipeline_endpoint(&self) -> String {
        self.endpoints.pipeline.clone().unwrap_or_else(|| self.regional("codepipeline"))
    }

    pub fn storage_endpoint(&self) -> String {
        self.endpoints.storage.clone().unwrap_or_else(|| self.regional("s3"))
    }

    pub fn workflow_endpoint(&self) -> String {
        self.endpoints.workflow.clone().unwrap_or_else(|| self.regional("states"))
    }

    pub fn notify_endpoint(&self) -> String {
        self.endpoints.notify.clone().unwrap_or_else(|| self.regional("sns"))
    }
}
