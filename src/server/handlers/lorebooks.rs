use std::sync::Arc;

use axum::extract::{Path, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::core::errors::ChatError;
use crate::state::AppState;
use crate::store::types::{Lorebook, LorebookEntry, LorebookEntryDraft};

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LorebookRequest {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub is_global: bool,
    pub is_enabled: Option<bool>,
}

pub async fn create_lorebook(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LorebookRequest>,
) -> Result<Json<Lorebook>, ChatError> {
    Ok(Json(
        state
            .store
            .create_lorebook(&req.name, &req.description, req.is_global)
            .await?,
    ))
}

pub async fn get_lorebook(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Lorebook>, ChatError> {
    Ok(Json(state.store.get_lorebook(&id).await?))
}

pub async fn list_lorebooks(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<Lorebook>>, ChatError> {
    Ok(Json(state.store.list_lorebooks().await?))
}

pub async fn update_lorebook(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<LorebookRequest>,
) -> Result<Json<Lorebook>, ChatError> {
    let existing = state.store.get_lorebook(&id).await?;
    Ok(Json(
        state
            .store
            .update_lorebook(
                &id,
                &req.name,
                &req.description,
                req.is_global,
                req.is_enabled.unwrap_or(existing.is_enabled),
            )
            .await?,
    ))
}

pub async fn delete_lorebook(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ChatError> {
    state.store.delete_lorebook(&id).await?;
    Ok(Json(json!({ "deleted": id })))
}

pub async fn create_entry(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(draft): Json<LorebookEntryDraft>,
) -> Result<Json<LorebookEntry>, ChatError> {
    Ok(Json(state.store.create_lorebook_entry(&id, draft).await?))
}

pub async fn list_entries(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Vec<LorebookEntry>>, ChatError> {
    Ok(Json(state.store.list_lorebook_entries(&id).await?))
}

pub async fn get_entry(
    State(state): State<Arc<AppState>>,
    Path(entry_id): Path<String>,
) -> Result<Json<LorebookEntry>, ChatError> {
    Ok(Json(state.store.get_lorebook_entry(&entry_id).await?))
}

pub async fn update_entry(
    State(state): State<Arc<AppState>>,
    Path(entry_id): Path<String>,
    Json(draft): Json<LorebookEntryDraft>,
) -> Result<Json<LorebookEntry>, ChatError> {
    Ok(Json(
        state.store.update_lorebook_entry(&entry_id, draft).await?,
    ))
}

pub async fn delete_entry(
    State(state): State<Arc<AppState>>,
    Path(entry_id): Path<String>,
) -> Result<Json<Value>, ChatError> {
    state.store.delete_lorebook_entry(&entry_id).await?;
    Ok(Json(json!({ "deleted": entry_id })))
}
