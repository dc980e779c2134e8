//! Callback endpoints the agent subprocess posts to.
//!
//! Unauthenticated by default (the agent runs beside the orchestrator);
//! when `callback_secret` is configured, `x-studio-secret` must match.
//! An unknown reply id is an orphan callback: logged, answered with
//! `{success: true}` so the agent does not retry.

use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use studio_runtime::RuntimeError;
use tracing::{error, warn};

use crate::error::ApiError;
use crate::server::AppState;

/// Header carrying the shared callback secret.
pub const CALLBACK_SECRET_HEADER: &str = "x-studio-secret";

/// Body of `/trpc/pushMessageToChatAgent`.
#[derive(Debug, Deserialize)]
pub struct AgentPushRequest {
    /// The reply the events belong to.
    #[serde(rename = "replyId")]
    pub reply_id: String,
    /// Structured event batch.
    #[serde(default)]
    pub events: Option<Vec<Value>>,
    /// Legacy whole-message form.
    #[serde(default)]
    pub msg: Option<Value>,
}

/// Body of `/trpc/pushFinishedSignalToChatAgent`.
#[derive(Debug, Deserialize)]
pub struct AgentFinishedRequest {
    /// The finished reply.
    #[serde(rename = "replyId")]
    pub reply_id: String,
}

fn check_secret(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    if let Some(secret) = &state.config.callback_secret {
        let provided = headers
            .get(CALLBACK_SECRET_HEADER)
            .and_then(|value| value.to_str().ok());
        if provided != Some(secret.as_str()) {
            return Err(ApiError::unauthorized("invalid callback secret"));
        }
    }
    Ok(())
}

/// POST `/trpc/pushMessageToChatAgent` — event batch from the agent.
pub async fn push_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<AgentPushRequest>,
) -> Result<Json<Value>, ApiError> {
    check_secret(&state, &headers)?;

    match state
        .orchestrator
        .push_events(&req.reply_id, req.events.as_deref(), req.msg.as_ref())
        .await
    {
        Ok(()) => Ok(Json(json!({"success": true}))),
        Err(RuntimeError::UnknownReply(reply_id)) => {
            // Orphan callback: never fatal, and success avoids agent retries
            warn!(reply_id, "callback for unknown reply dropped");
            Ok(Json(json!({"success": true})))
        }
        Err(e) => {
            error!(reply_id = req.reply_id, error = %e, "failed to process agent events");
            Ok(Json(json!({"success": false, "error": e.to_string()})))
        }
    }
}

/// POST `/trpc/pushFinishedSignalToChatAgent` — the agent's completion signal.
pub async fn push_finished(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<AgentFinishedRequest>,
) -> Result<Json<Value>, ApiError> {
    check_secret(&state, &headers)?;

    match state.orchestrator.push_finished(&req.reply_id).await {
        Ok(()) => Ok(Json(json!({"success": true}))),
        Err(RuntimeError::UnknownReply(reply_id)) => {
            warn!(reply_id, "finished signal for unknown reply dropped");
            Ok(Json(json!({"success": true})))
        }
        Err(e) => {
            error!(reply_id = req.reply_id, error = %e, "failed to process finished signal");
            Ok(Json(json!({"success": false, "error": e.to_string()})))
        }
    }
}
