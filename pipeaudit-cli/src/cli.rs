use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use clap_verbosity_flag::{InfoLevel, Verbosity};
use pipeaudit::RunId;
use pipeaudit::config::{
    DEFAULT_BRANCH, DEFAULT_MAX_CONCURRENCY, DEFAULT_PIPELINE_NAME, DEFAULT_REGION, Endpoints,
    Settings,
};

/// Provision per-run dependency audit pipelines, collect their reports and
/// tear them down again
#[derive(Parser)]
#[command(name = "pipeaudit", version)]
pub struct Cli {
    #[command(flatten)]
    pub verbosity: Verbosity<InfoLevel>,

    /// Log line format on stderr
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    pub log_format: LogFormat,

    #[command(flatten)]
    pub config: ConfigArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Command {
    /// List the repositories a run would audit
    ListRepositories,

    /// Create build projects and the pipeline for a run
    Provision {
        /// Run input `{ "repositories": [...], "token": "..." }`; stdin when omitted
        #[arg(long)]
        input: Option<PathBuf>,

        /// Namespace for the run's resources; generated when omitted
        #[arg(long)]
        run_id: Option<RunId>,
    },

    /// Handle a pipeline job callback event
    ///
    /// Each invocation starts with an empty correlation table, so the
    /// redeem-once check spans a single process. A token already redeemed by
    /// an earlier invocation is refused only by the workflow engine, in which
    /// case the job is reported as failed. Use `run` to keep one table for
    /// the whole lifecycle.
    Redeem {
        /// Pipeline job event JSON; stdin when omitted
        #[arg(long)]
        input: Option<PathBuf>,
    },

    /// Summarize the audit reports of a run
    Summarize {
        /// JSON array of repository names; stdin when omitted
        #[arg(long)]
        input: Option<PathBuf>,

        #[arg(long)]
        run_id: RunId,
    },

    /// Delete a run's build projects and pipeline
    Cleanup {
        /// JSON array of repository names; stdin when omitted
        #[arg(long)]
        input: Option<PathBuf>,

        #[arg(long)]
        run_id: RunId,
    },

    /// Run the whole lifecycle in this process
    Run {
        /// Audit these repositories instead of discovering them
        #[arg(long, value_delimiter = ',')]
        repositories: Vec<String>,

        #[arg(long)]
        run_id: Option<RunId>,

        /// Address serving the pipeline callback endpoint
        #[arg(long, default_value = "127.0.0.1:8080")]
        listen: SocketAddr,

        /// Give up waiting for the pipeline callback after this many seconds
        #[arg(long)]
        wait_timeout: Option<u64>,
    },
}

#[derive(Args)]
pub struct ConfigArgs {
    #[arg(long, env = "AWS_REGION", default_value = DEFAULT_REGION, global = true)]
    pub region: String,

    /// Base name of the per-run pipeline
    #[arg(long, env = "PIPELINE_NAME", default_value = DEFAULT_PIPELINE_NAME, global = true)]
    pub pipeline_name: String,

    /// Branch each Source action checks out
    #[arg(long, env = "SOURCE_BRANCH", default_value = DEFAULT_BRANCH, global = true)]
    pub source_branch: String,

    /// Upper bound on concurrent per-repository calls
    #[arg(long, env = "PIPEAUDIT_MAX_CONCURRENCY", default_value_t = DEFAULT_MAX_CONCURRENCY, global = true)]
    pub max_concurrency: usize,

    #[arg(long, env = "CODEPIPELINE_SERVICE_ROLE_ARN", global = true)]
    pub pipeline_role_arn: Option<String>,

    #[arg(long, env = "CODEBUILD_SERVICE_ROLE_ARN", global = true)]
    pub build_role_arn: Option<String>,

    /// Role assumed to list repositories and attached to Source actions
    #[arg(long, env = "SOURCE_ROLE_ARN", global = true)]
    pub source_role_arn: Option<String>,

    /// Bucket holding pipeline artifacts and audit reports
    #[arg(long, env = "BUILDSPEC_BUCKET", global = true)]
    pub bucket: Option<String>,

    #[arg(long, env = "KMS_KEY_ID", global = true)]
    pub kms_key_id: Option<String>,

    /// Function the Invoke action calls to hand the token back
    #[arg(long, env = "SEND_SUCCESS_LAMBDA", global = true)]
    pub callback_function: Option<String>,

    #[arg(long, env = "NOTIFY_TOPIC_ARN", global = true)]
    pub notify_topic_arn: Option<String>,

    /// Only audit repositories whose name contains this
    #[arg(long, env = "REPOSITORY_INCLUDE", global = true)]
    pub repository_include: Option<String>,

    #[arg(long, env = "PIPEAUDIT_SOURCE_ENDPOINT", global = true, hide = true)]
    pub source_endpoint: Option<String>,

    #[arg(long, env = "PIPEAUDIT_CREDENTIALS_ENDPOINT", global = true, hide = true)]
    pub credentials_endpoint: Option<String>,

    #[arg(long, env = "PIPEAUDIT_BUILD_ENDPOINT", global = true, hide = true)]
    pub build_endpoint: Option<String>,

    #[arg(long, env = "PIPEAUDIT_PIPELINE_ENDPOINT", global = true, hide = true)]
    pub pipeline_endpoint: Option<String>,

    #[arg(long, env = "PIPEAUDIT_STORAGE_ENDPOINT", global = true, hide = true)]
    pub storage_endpoint: Option<String>,

    #[arg(long, env = "PIPEAUDIT_WORKFLOW_ENDPOINT", global = true, hide = true)]
    pub workflow_endpoint: Option<String>,

    #[arg(long, env = "PIPEAUDIT_NOTIFY_ENDPOINT", global = true, hide = true)]
    pub notify_endpoint: Option<String>,
}

impl ConfigArgs {
    pub fn into_settings(self) -> Settings {
        Settings {
            region: self.region,
            pipeline_name: self.pipeline_name,
            source_branch: self.source_branch,
            max_concurrency: self.max_concurrency.max(1),
            pipeline_role_arn: self.pipeline_role_arn,
            build_role_arn: self.build_role_arn,
            source_role_arn: self.source_role_arn,
            artifact_bucket: self.bucket,
            kms_key_id: self.kms_key_id,
            callback_function: self.callback_function,
            notify_topic_arn: self.notify_topic_arn,
            repository_include: self.repository_include,
            endpoints: Endpoints {
                source: self.source_endpoint,
                credentials: self.credentials_endpoint,
                build: self.build_endpoint,
                pipeline: self.pipeline_endpoint,
                storage: self.storage_endpoint,
                workflow: self.workflow_endpoint,
                notify: self.notify_endpoint,
            },
        }
    }
}
