use std::sync::Arc;

use axum::extract::{Path, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::cards::parse_character_card;
use crate::core::errors::ChatError;
use crate::state::AppState;
use crate::store::types::{Character, CharacterDraft};

pub async fn create_character(
    State(state): State<Arc<AppState>>,
    Json(draft): Json<CharacterDraft>,
) -> Result<Json<Character>, ChatError> {
    Ok(Json(state.store.create_character(draft).await?))
}

pub async fn get_character(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Character>, ChatError> {
    Ok(Json(state.store.get_character(&id).await?))
}

pub async fn list_characters(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<Character>>, ChatError> {
    Ok(Json(state.store.list_characters().await?))
}

pub async fn update_character(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(draft): Json<CharacterDraft>,
) -> Result<Json<Character>, ChatError> {
    Ok(Json(state.store.update_character(&id, draft).await?))
}

pub async fn delete_character(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ChatError> {
    state.store.delete_character(&id).await?;
    Ok(Json(json!({ "deleted": id })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportCardRequest {
    pub json_or_base64: String,
    pub avatar: Option<String>,
}

/// Import a character card (raw JSON or base64 JSON as extracted from a PNG
/// by the external chunk decoder).
pub async fn import_character_card(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ImportCardRequest>,
) -> Result<Json<Character>, ChatError> {
    let mut draft = parse_character_card(&req.json_or_base64)?;
    draft.avatar_ref = req.avatar;
    Ok(Json(state.store.create_character(draft).await?))
}
