use std::sync::Arc;
use std::time::Duration;

use pipeaudit::AuditError;
use pipeaudit::gateway::{
    BucketStore, BuildProjects, CodeBuildGateway, CodeCommitGateway, CodePipelineGateway,
    CredentialProvider, Notifier, ObjectStore, Pipelines, RepositoryFilter, SourceControl,
    StepFunctionsGateway, StsCredentials, TopicNotifier, WorkflowSignals,
};
use pipeaudit::{ContinuationToken, RunScope, Settings};
use serde_json::json;
use wiremock::matchers::{body_json, body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn target(name: &str) -> wiremock::matchers::HeaderExactMatcher {
    header("X-Amz-Target", name)
}

async fn sts_server() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/"))
        .and(target("AWSSecurityTokenServiceV20110615.AssumeRole"))
        .and(body_partial_json(json!({
            "RoleArn": "arn:aws:iam::1:role/reader",
            "DurationSeconds": 900
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "Credentials": {
                "AccessKeyId": "AKIA",
                "SecretAccessKey": "secret",
                "SessionToken": "session"
            }
        })))
        .expect(1)
        .mount(&server)
        .await;
    server
}

#[tokio::test]
async fn listing_assumes_role_follows_pages_and_filters() {
    let sts = sts_server().await;
    let codecommit = MockServer::start().await;
    Mock::given(method("POST"))
        .and(target("CodeCommit_20150413.ListRepositories"))
        .and(header("X-Amz-Security-Token", "session"))
        .and(body_json(json!({})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "repositories": [
                { "repositoryName": "de.ves.pt.web" },
                { "repositoryName": "npm-audit-infra" }
            ],
            "nextToken": "page-2"
        })))
        .mount(&codecommit)
        .await;
    Mock::given(method("POST"))
        .and(target("CodeCommit_20150413.ListRepositories"))
        .and(body_json(json!({ "nextToken": "page-2" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "repositories": [
                { "repositoryName": "de.ves.pt.docs" },
                { "repositoryName": "de.ves.pt.api" },
                { "repositoryName": "other.service" }
            ]
        })))
        .mount(&codecommit)
        .await;

    let credentials: Arc<dyn CredentialProvider> = Arc::new(StsCredentials::new(sts.uri()));
    let gateway = CodeCommitGateway::new(
        codecommit.uri(),
        credentials,
        RepositoryFilter {
            include: Some("de.ves.pt".into()),
            ..RepositoryFilter::default()
        },
    );

    let repositories = gateway
        .list_repositories("arn:aws:iam::1:role/reader")
        .await
        .unwrap();

    let names: Vec<&str> = repositories.iter().map(|r| r.as_str()).collect();
    assert_eq!(names, vec!["de.ves.pt.web", "de.ves.pt.api"]);
}

#[tokio::test]
async fn listing_without_repositories_field_fails() {
    let sts = sts_server().await;
    let codecommit = MockServer::start().await;
    Mock::given(method("POST"))
        .and(target("CodeCommit_20150413.ListRepositories"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(&codecommit)
        .await;

    let gateway = CodeCommitGateway::new(
        codecommit.uri(),
        Arc::new(StsCredentials::new(sts.uri())),
        RepositoryFilter::default(),
    );
    let err = gateway
        .list_repositories("arn:aws:iam::1:role/reader")
        .await
        .unwrap_err();
    assert!(err.to_string().contains("no repositories found"));
}

#[tokio::test]
async fn assume_role_without_credentials_fails() {
    let sts = MockServer::start().await;
    Mock::given(method("POST"))
        .and(target("AWSSecurityTokenServiceV20110615.AssumeRole"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(&sts)
        .await;

    let err = StsCredentials::new(sts.uri())
        .assume_role("arn:role", Duration::from_secs(900))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("no credentials returned from STS"));
}

fn settings() -> Settings {
    Settings {
        build_role_arn: Some("arn:build".into()),
        artifact_bucket: Some("audit-bucket".into()),
        kms_key_id: Some("kms-1".into()),
        ..Settings::default()
    }
}

#[tokio::test]
async fn create_project_returns_confirmed_name() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(target("CodeBuild_20161006.CreateProject"))
        .and(body_partial_json(json!({
            "name": "de-ves-pt-r1-scan",
            "serviceRole": "arn:build",
            "encryptionKey": "kms-1"
        })))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "project": { "name": "de-ves-pt-r1-scan" } })),
        )
        .mount(&server)
        .await;

    let scope = RunScope::new("r1".parse().unwrap(), "NPM-Audit-Pipeline");
    let spec = pipeaudit::buildspec::BuildProjectSpec::for_repository(
        &scope,
        &"de.ves.pt".parse().unwrap(),
        &settings(),
    )
    .unwrap();

    let name = CodeBuildGateway::new(server.uri())
        .create_project(&spec)
        .await
        .unwrap();
    assert_eq!(name, "de-ves-pt-r1-scan");
}

#[tokio::test]
async fn create_project_error_status_propagates() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(target("CodeBuild_20161006.CreateProject"))
        .respond_with(
            ResponseTemplate::new(400)
                .set_body_json(json!({ "message": "Project already exists" })),
        )
        .mount(&server)
        .await;

    let scope = RunScope::new("r1".parse().unwrap(), "NPM-Audit-Pipeline");
    let spec = pipeaudit::buildspec::BuildProjectSpec::for_repository(
        &scope,
        &"a".parse().unwrap(),
        &settings(),
    )
    .unwrap();

    let err = CodeBuildGateway::new(server.uri())
        .create_project(&spec)
        .await
        .unwrap_err();
    let rendered = format!("{err:#}");
    assert!(rendered.contains("failed to create build project a-r1-scan"));
    assert!(rendered.contains("Project already exists"));
}

#[tokio::test]
async fn delete_project_sends_name() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(target("CodeBuild_20161006.DeleteProject"))
        .and(body_json(json!({ "name": "a-r1-scan" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(1)
        .mount(&server)
        .await;

    CodeBuildGateway::new(server.uri())
        .delete_project("a-r1-scan")
        .await
        .unwrap();
}

#[tokio::test]
async fn job_failure_is_reported_with_details() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(target("CodePipeline_20150709.PutJobFailureResult"))
        .and(body_json(json!({
            "jobId": "123",
            "failureDetails": {
                "type": "JobFailed",
                "message": "Failed to send task success",
                "externalExecutionId": "123"
            }
        })))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    CodePipelineGateway::new(server.uri())
        .report_job_outcome("123", false)
        .await
        .unwrap();
}

#[tokio::test]
async fn job_success_is_reported() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(target("CodePipeline_20150709.PutJobSuccessResult"))
        .and(body_json(json!({ "jobId": "123" })))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    CodePipelineGateway::new(server.uri())
        .report_job_outcome("123", true)
        .await
        .unwrap();
}

#[tokio::test]
async fn pipeline_delete_failure_propagates() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(target("CodePipeline_20150709.DeletePipeline"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let err = CodePipelineGateway::new(server.uri())
        .delete_pipeline("NPM-Audit-Pipeline-r1")
        .await
        .unwrap_err();
    assert!(err.to_string().contains("NPM-Audit-Pipeline-r1"));
}

#[tokio::test]
async fn object_fetch_reads_path_style_key() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/audit-bucket/runs/r1/a-audit-report.json"))
        .respond_with(ResponseTemplate::new(200).set_body_string("{\"vulnerabilities\":{}}"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/audit-bucket/runs/r1/empty-audit-report.json"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let store = BucketStore::new(server.uri(), Some("audit-bucket".into()));

    let body = store.fetch_object("runs/r1/a-audit-report.json").await.unwrap();
    assert_eq!(body, "{\"vulnerabilities\":{}}");

    let err = store
        .fetch_object("runs/r1/empty-audit-report.json")
        .await
        .unwrap_err();
    assert_eq!(
        AuditError::find(&err),
        Some(&AuditError::MissingObjectBody(
            "runs/r1/empty-audit-report.json".into()
        ))
    );

    let err = store.fetch_object("runs/r1/gone.json").await.unwrap_err();
    assert!(err.to_string().contains("not found in audit-bucket"));
}

#[tokio::test]
async fn task_success_reports_service_status() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(target("AWSStepFunctions.SendTaskSuccess"))
        .and(body_json(json!({
            "taskToken": "tok-1",
            "output": "{\"success\":true}"
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(&server)
        .await;

    let signals = StepFunctionsGateway::new(server.uri());
    let token = ContinuationToken::new("tok-1").unwrap();
    let receipt = signals
        .send_task_success(&token, &json!({ "success": true }))
        .await
        .unwrap();
    assert!(receipt.accepted());

    let stranger = ContinuationToken::new("tok-2").unwrap();
    let receipt = signals
        .send_task_success(&stranger, &json!({ "success": true }))
        .await
        .unwrap();
    assert_eq!(receipt.status, 404);
    assert!(!receipt.accepted());
}

#[tokio::test]
async fn publish_sends_subject_and_message() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(target("AmazonSNS.Publish"))
        .and(body_json(json!({
            "TopicArn": "arn:topic",
            "Subject": "npm Audit Report",
            "Message": "body"
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "MessageId": "m-1" })))
        .expect(1)
        .mount(&server)
        .await;

    TopicNotifier::new(server.uri(), Some("arn:topic".into()))
        .publish("npm Audit Report", "body")
        .await
        .unwrap();
}

#[tokio::test]
async fn publish_without_topic_is_a_config_error() {
    let err = TopicNotifier::new("http://127.0.0.1:1", None)
        .publish("npm Audit Report", "body")
        .await
        .unwrap_err();
    assert_eq!(
        AuditError::find(&err),
        Some(&AuditError::MissingConfig("NOTIFY_TOPIC_ARN"))
    );
}
