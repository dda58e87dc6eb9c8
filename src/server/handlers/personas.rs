use std::sync::Arc;

use axum::extract::{Path, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::core::errors::ChatError;
use crate::state::AppState;
use crate::store::types::Persona;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersonaRequest {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub is_default: bool,
}

pub async fn create_persona(
    State(state): State<Arc<AppState>>,
    Json(req): Json<PersonaRequest>,
) -> Result<Json<Persona>, ChatError> {
    Ok(Json(
        state
            .store
            .create_persona(&req.name, &req.description, req.is_default)
            .await?,
    ))
}

pub async fn get_persona(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Persona>, ChatError> {
    Ok(Json(state.store.get_persona(&id).await?))
}

pub async fn list_personas(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<Persona>>, ChatError> {
    Ok(Json(state.store.list_personas().await?))
}

pub async fn update_persona(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<PersonaRequest>,
) -> Result<Json<Persona>, ChatError> {
    Ok(Json(
        state
            .store
            .update_persona(&id, &req.name, &req.description)
            .await?,
    ))
}

pub async fn set_default_persona(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Persona>, ChatError> {
    Ok(Json(state.store.set_default_persona(&id).await?))
}

pub async fn delete_persona(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ChatError> {
    state.store.delete_persona(&id).await?;
    Ok(Json(json!({ "deleted": id })))
}
