//! Chat routes: send, stream, interrupt, upload.

use std::time::Duration;

use axum::extract::{Multipart, State};
use axum::response::{Json, Response};
use serde::Deserialize;
use serde_json::{json, Value};
use studio_runtime::SendRequest;
use tracing::info;

use crate::auth::AuthedUser;
use crate::error::ApiError;
use crate::server::AppState;
use crate::sse::reply_sse_response;

/// Body of `/api/chat/send` and `/api/chat/stream`.
#[derive(Debug, Deserialize)]
pub struct ChatMessageRequest {
    /// The user's message.
    pub message: String,
    /// Existing conversation, or absent to start a new one.
    pub conversation_id: Option<String>,
}

/// Body of `/api/chat/interrupt`.
#[derive(Debug, Deserialize)]
pub struct InterruptRequest {
    /// Reply to cancel.
    pub reply_id: String,
}

async fn build_send_request(
    state: &AppState,
    user: &AuthedUser,
    req: ChatMessageRequest,
) -> SendRequest {
    let uploaded_files = match &req.conversation_id {
        Some(id) => state.storage.list_files(&user.0, id).await,
        None => Vec::new(),
    };
    SendRequest {
        user_id: user.0.clone(),
        conversation_id: req.conversation_id,
        message: req.message,
        uploaded_files,
    }
}

/// POST `/api/chat/send` — start a reply without streaming; clients follow
/// it over the socket bus.
pub async fn send(
    State(state): State<AppState>,
    user: AuthedUser,
    Json(req): Json<ChatMessageRequest>,
) -> Result<Json<Value>, ApiError> {
    info!(user_id = user.0, len = req.message.chars().count(), "chat send");
    let send_req = build_send_request(&state, &user, req).await;
    let outcome = state.orchestrator.send(send_req).await?;
    // The SSE subscription is intentionally dropped: this endpoint's
    // consumers follow the reply through the socket bus.
    Ok(Json(json!({
        "success": true,
        "data": {
            "conversation_id": outcome.conversation_id,
            "reply_id": outcome.reply_id,
            "status": "processing",
            "timestamp": chrono::Utc::now().to_rfc3339(),
        },
    })))
}

/// POST `/api/chat/stream` — start a reply and stream it back as SSE.
pub async fn stream(
    State(state): State<AppState>,
    user: AuthedUser,
    Json(req): Json<ChatMessageRequest>,
) -> Result<Response, ApiError> {
    info!(user_id = user.0, len = req.message.chars().count(), "chat stream");
    let send_req = build_send_request(&state, &user, req).await;
    let outcome = state.orchestrator.send(send_req).await?;
    Ok(reply_sse_response(
        outcome.conversation_id,
        outcome.reply_id,
        outcome.subscription,
        Duration::from_secs(state.config.sse_heartbeat_secs),
    ))
}

/// POST `/api/chat/interrupt` — cancel a running reply.
pub async fn interrupt(
    State(state): State<AppState>,
    user: AuthedUser,
    Json(req): Json<InterruptRequest>,
) -> Result<Json<Value>, ApiError> {
    let found = state.orchestrator.interrupt(&req.reply_id, &user.0).await?;
    // Nudge the reserved agent namespace as well
    state.broadcaster.send_interrupt().await;
    Ok(Json(json!({"success": found})))
}

/// POST `/api/chat/upload` — multipart upload of a chat file.
pub async fn upload(
    State(state): State<AppState>,
    user: AuthedUser,
    mut multipart: Multipart,
) -> Result<Json<Value>, ApiError> {
    let mut conversation_id: Option<String> = None;
    let mut file: Option<(String, Vec<u8>)> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(format!("invalid multipart body: {e}")))?
    {
        match field.name() {
            Some("conversation_id") => {
                conversation_id = Some(
                    field
                        .text()
                        .await
                        .map_err(|e| ApiError::bad_request(e.to_string()))?,
                );
            }
            Some("file") => {
                let filename = field.file_name().unwrap_or("upload.bin").to_string();
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::bad_request(e.to_string()))?;
                file = Some((filename, bytes.to_vec()));
            }
            _ => {}
        }
    }

    let conversation_id =
        conversation_id.ok_or_else(|| ApiError::bad_request("missing conversation_id"))?;
    let (filename, content) = file.ok_or_else(|| ApiError::bad_request("missing file"))?;

    // An existing conversation must belong to the caller
    if let Some(conversation) = state.orchestrator.store().get_conversation(&conversation_id)? {
        if conversation.user_id != user.0 {
            return Err(ApiError::forbidden("conversation belongs to another user"));
        }
    }

    state
        .storage
        .save_file(&user.0, &conversation_id, &filename, &content)
        .await
        .map_err(|e| ApiError::internal(format!("failed to store file: {e}")))?;

    Ok(Json(json!({
        "success": true,
        "data": {"filename": filename},
    })))
}
