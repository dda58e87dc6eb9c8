use std::sync::Arc;

use axum::extract::{Path, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::core::errors::ChatError;
use crate::state::AppState;
use crate::store::conversations::ConversationUpdate;
use crate::store::types::{Conversation, Message};

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateConversationRequest {
    pub character_ids: Vec<String>,
    pub title: Option<String>,
    pub persona_id: Option<String>,
}

pub async fn create_conversation(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateConversationRequest>,
) -> Result<Json<Conversation>, ChatError> {
    let conversation = state
        .engine
        .create_conversation(
            &req.character_ids,
            req.title.as_deref(),
            req.persona_id.as_deref(),
        )
        .await?;
    Ok(Json(conversation))
}

pub async fn get_conversation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Conversation>, ChatError> {
    Ok(Json(state.store.get_conversation(&id).await?))
}

pub async fn list_conversations(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<Conversation>>, ChatError> {
    Ok(Json(state.store.list_conversations().await?))
}

pub async fn update_conversation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(update): Json<ConversationUpdate>,
) -> Result<Json<Conversation>, ChatError> {
    Ok(Json(state.store.update_conversation(&id, update).await?))
}

pub async fn delete_conversation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ChatError> {
    state.store.delete_conversation(&id).await?;
    Ok(Json(json!({ "deleted": id })))
}

pub async fn get_conversation_messages(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Vec<Message>>, ChatError> {
    Ok(Json(state.engine.conversation_messages(&id).await?))
}

pub async fn find_conversation_by_character(
    State(state): State<Arc<AppState>>,
    Path(character_id): Path<String>,
) -> Result<Json<Option<Conversation>>, ChatError> {
    Ok(Json(
        state
            .store
            .find_conversation_by_character(&character_id)
            .await?,
    ))
}

pub async fn attach_lorebook(
    State(state): State<Arc<AppState>>,
    Path((id, lorebook_id)): Path<(String, String)>,
) -> Result<Json<Conversation>, ChatError> {
    state.store.attach_lorebook(&id, &lorebook_id).await?;
    Ok(Json(state.store.get_conversation(&id).await?))
}

pub async fn detach_lorebook(
    State(state): State<Arc<AppState>>,
    Path((id, lorebook_id)): Path<(String, String)>,
) -> Result<Json<Conversation>, ChatError> {
    state.store.detach_lorebook(&id, &lorebook_id).await?;
    Ok(Json(state.store.get_conversation(&id).await?))
}
