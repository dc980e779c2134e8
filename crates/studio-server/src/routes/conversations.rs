//! Conversation history routes.

use axum::extract::{Path, State};
use axum::response::Json;
use serde_json::{json, Value};
use studio_store::row_types::ConversationRow;

use crate::auth::AuthedUser;
use crate::error::ApiError;
use crate::server::AppState;

/// Look up a conversation and check the caller owns it.
fn owned_conversation(
    state: &AppState,
    user: &AuthedUser,
    id: &str,
) -> Result<ConversationRow, ApiError> {
    let conversation = state
        .orchestrator
        .store()
        .get_conversation(id)?
        .ok_or_else(|| ApiError::not_found(format!("conversation not found: {id}")))?;
    if conversation.user_id != user.0 {
        return Err(ApiError::forbidden("conversation belongs to another user"));
    }
    Ok(conversation)
}

/// GET `/api/conversations` — the caller's conversations, newest first.
pub async fn list(
    State(state): State<AppState>,
    user: AuthedUser,
) -> Result<Json<Value>, ApiError> {
    let conversations = state.orchestrator.store().list_conversations(&user.0)?;
    Ok(Json(json!({
        "success": true,
        "data": {"conversations": conversations},
    })))
}

/// GET `/api/conversations/{id}/messages` — full transcript in order.
pub async fn messages(
    State(state): State<AppState>,
    user: AuthedUser,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let conversation = owned_conversation(&state, &user, &id)?;
    let messages = state.orchestrator.store().list_messages(&conversation.id)?;
    Ok(Json(json!({
        "success": true,
        "data": {
            "conversation": conversation,
            "messages": messages,
        },
    })))
}

/// DELETE `/api/conversations/{id}` — cancel live replies, then delete.
pub async fn remove(
    State(state): State<AppState>,
    user: AuthedUser,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let conversation = owned_conversation(&state, &user, &id)?;
    let cancelled = state.orchestrator.cancel_conversation(&conversation.id).await;
    let deleted = state
        .orchestrator
        .store()
        .delete_conversation(&conversation.id)?;
    Ok(Json(json!({
        "success": deleted,
        "data": {"cancelled_replies": cancelled},
    })))
}
