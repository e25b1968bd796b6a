use std::sync::Arc;

use pipeaudit::callback::{self, CALLBACK_PATH};
use pipeaudit::gateway::{CodePipelineGateway, StepFunctionsGateway};
use pipeaudit::{ContinuationToken, TokenBridge};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use wiremock::matchers::{body_partial_json, header, method};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn serve(bridge: Arc<TokenBridge>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        callback::serve(listener, bridge).await.unwrap();
    });
    format!("http://{addr}{CALLBACK_PATH}")
}

fn job_event(job_id: &str, token: &ContinuationToken) -> Value {
    json!({
        "CodePipeline.job": {
            "id": job_id,
            "accountId": "111111111111",
            "data": {
                "actionConfiguration": {
                    "configuration": {
                        "FunctionName": "send-token",
                        "UserParameters": token.to_user_parameters()
                    }
                },
                "inputArtifacts": [],
                "outputArtifacts": []
            }
        }
    })
}

async fn mock_services(signal_status: u16) -> (MockServer, MockServer) {
    let workflow = MockServer::start().await;
    Mock::given(method("POST"))
        .and(header("X-Amz-Target", "AWSStepFunctions.SendTaskSuccess"))
        .respond_with(ResponseTemplate::new(signal_status).set_body_json(json!({})))
        .mount(&workflow)
        .await;

    let pipeline = MockServer::start().await;
    Mock::given(method("POST"))
        .and(header("X-Amz-Target", "CodePipeline_20150709.PutJobSuccessResult"))
        .and(body_partial_json(json!({ "jobId": "123" })))
        .respond_with(ResponseTemplate::new(200))
        .mount(&pipeline)
        .await;
    Mock::given(method("POST"))
        .and(header("X-Amz-Target", "CodePipeline_20150709.PutJobFailureResult"))
        .and(body_partial_json(json!({ "jobId": "123" })))
        .respond_with(ResponseTemplate::new(200))
        .mount(&pipeline)
        .await;

    (workflow, pipeline)
}

fn bridge(workflow: &MockServer, pipeline: &MockServer) -> Arc<TokenBridge> {
    Arc::new(TokenBridge::new(
        Arc::new(StepFunctionsGateway::new(workflow.uri())),
        Arc::new(CodePipelineGateway::new(pipeline.uri())),
    ))
}

async fn requests_with_target(server: &MockServer, target: &str) -> usize {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|r| {
            r.headers
                .get("X-Amz-Target")
                .and_then(|v| v.to_str().ok())
                == Some(target)
        })
        .count()
}

#[tokio::test]
async fn callback_redeems_once_then_conflicts() {
    let (workflow, pipeline) = mock_services(200).await;
    let url = serve(bridge(&workflow, &pipeline)).await;
    let token = ContinuationToken::new("tok-1").unwrap();
    let http = reqwest::Client::new();

    let first = http
        .post(&url)
        .json(&job_event("123", &token))
        .send()
        .await
        .unwrap();
    assert_eq!(first.status(), 200);
    let body: Value = first.json().await.unwrap();
    assert_eq!(body["state"], "Complete");
    assert_eq!(body["workflow_signaled"], true);

    let second = http
        .post(&url)
        .json(&job_event("123", &token))
        .send()
        .await
        .unwrap();
    assert_eq!(second.status(), 409);

    assert_eq!(
        requests_with_target(&workflow, "AWSStepFunctions.SendTaskSuccess").await,
        1
    );
    assert_eq!(
        requests_with_target(&pipeline, "CodePipeline_20150709.PutJobSuccessResult").await,
        1
    );
}

#[tokio::test]
async fn rejected_signal_reports_job_failure() {
    let (workflow, pipeline) = mock_services(400).await;
    Mock::given(method("POST"))
        .and(header("X-Amz-Target", "AWSStepFunctions.SendTaskFailure"))
        .and(body_partial_json(json!({ "taskToken": "tok-2", "error": "CallbackFailed" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(&workflow)
        .await;
    let url = serve(bridge(&workflow, &pipeline)).await;
    let token = ContinuationToken::new("tok-2").unwrap();

    let response = reqwest::Client::new()
        .post(&url)
        .json(&job_event("123", &token))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["workflow_signaled"], false);
    assert_eq!(body["state"], "JobAcked");
    assert_eq!(
        requests_with_target(&pipeline, "CodePipeline_20150709.PutJobFailureResult").await,
        1
    );
    assert_eq!(
        requests_with_target(&workflow, "AWSStepFunctions.SendTaskFailure").await,
        1
    );
}

#[tokio::test]
async fn malformed_event_is_bad_request() {
    let (workflow, pipeline) = mock_services(200).await;
    let url = serve(bridge(&workflow, &pipeline)).await;

    let response = reqwest::Client::new()
        .post(&url)
        .json(&json!({ "CodePipeline.job": { "id": "123" } }))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 400);
    assert_eq!(
        requests_with_target(&pipeline, "CodePipeline_20150709.PutJobSuccessResult").await,
        0
    );
}

#[tokio::test]
async fn unreachable_pipeline_engine_is_bad_gateway() {
    let workflow = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(&workflow)
        .await;
    let pipeline = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(503).set_body_json(json!({ "message": "throttled" })),
        )
        .mount(&pipeline)
        .await;

    let url = serve(bridge(&workflow, &pipeline)).await;
    let token = ContinuationToken::new("tok-3").unwrap();
    let response = reqwest::Client::new()
        .post(&url)
        .json(&job_event("123", &token))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 502);
    let body: Value = response.json().await.unwrap();
    assert!(body["error"]["message"].as_str().unwrap().contains("throttled"));
}
