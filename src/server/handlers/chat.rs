use std::sync::Arc;

use axum::extract::{Path, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::core::errors::ChatError;
use crate::state::AppState;
use crate::store::types::Message;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    pub conversation_id: String,
    pub content: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRef {
    pub message_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditMessageRequest {
    pub message_id: String,
    pub content: String,
}

pub async fn send_message(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SendMessageRequest>,
) -> Result<Json<Message>, ChatError> {
    let message = state
        .engine
        .send_message(&req.conversation_id, &req.content)
        .await?;
    Ok(Json(message))
}

pub async fn regenerate_message(
    State(state): State<Arc<AppState>>,
    Json(req): Json<MessageRef>,
) -> Result<Json<Message>, ChatError> {
    let message = state.engine.regenerate(&req.message_id).await?;
    Ok(Json(message))
}

pub async fn edit_message(
    State(state): State<Arc<AppState>>,
    Json(req): Json<EditMessageRequest>,
) -> Result<Json<Message>, ChatError> {
    let message = state.engine.edit(&req.message_id, &req.content).await?;
    Ok(Json(message))
}

pub async fn stop_generation(State(state): State<Arc<AppState>>) -> Json<Value> {
    state.engine.stop_generation().await;
    Json(json!({ "stopped": true }))
}

pub async fn get_branch_siblings(
    State(state): State<Arc<AppState>>,
    Path(message_id): Path<String>,
) -> Result<Json<Vec<Message>>, ChatError> {
    let siblings = state.engine.get_branch_siblings(&message_id).await?;
    Ok(Json(siblings))
}

pub async fn switch_branch(
    State(state): State<Arc<AppState>>,
    Json(req): Json<MessageRef>,
) -> Result<Json<Vec<Message>>, ChatError> {
    let path = state.engine.switch_branch(&req.message_id).await?;
    Ok(Json(path))
}
