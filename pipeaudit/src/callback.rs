//! HTTP entry point for pipeline job callbacks.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::error::AuditError;
use crate::token::{CallbackEvent, Redemption, TokenBridge};

pub const CALLBACK_PATH: &str = "/callbacks/pipeline-job";

#[derive(Debug)]
pub struct CallbackError {
    status: StatusCode,
    message: String,
}

impl From<anyhow::Error> for CallbackError {
    fn from(err: anyhow::Error) -> Self {
        let status = match AuditError::find(&err) {
            Some(AuditError::Validation(_)) => StatusCode::BAD_REQUEST,
            Some(AuditError::TokenAlreadyRedeemed(_)) => StatusCode::CONFLICT,
            Some(AuditError::UnknownToken(_)) => StatusCode::NOT_FOUND,
            _ => StatusCode::BAD_GATEWAY,
        };
        Self {
            status,
            message: format!("{err:#}"),
        }
    }
}

impl From<AuditError> for CallbackError {
    fn from(err: AuditError) -> Self {
        anyhow::Error::from(err).into()
    }
}

impl IntoResponse for CallbackError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": {
                "message": self.message,
                "status": self.status.as_u16(),
            }
        }));
        (self.status, body).into_response()
    }
}

async fn pipeline_job(
    State(bridge): State<Arc<TokenBridge>>,
    Json(body): Json<Value>,
) -> Result<Json<Redemption>, CallbackError> {
    let event = CallbackEvent::from_value(body)?;
    match bridge.redeem(&event).await {
        Ok(redemption) => Ok(Json(redemption)),
        Err(e) => {
            warn!(job = %event.job_id(), error = %e, "callback redemption failed");
            Err(e.into())
        }
    }
}

pub fn router(bridge: Arc<TokenBridge>) -> Router {
    Router::new()
        .route(CALLBACK_PATH, post(pipeline_job))
        .with_state(bridge)
}

/// Serve the callback router until the listener fails.
pub async fn serve(listener: TcpListener, bridge: Arc<TokenBridge>) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, path = CALLBACK_PATH, "callback endpoint listening");
    }
    axum::serve(listener, router(bridge)).await
}
