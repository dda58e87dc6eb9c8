use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};

use crate::core::errors::ChatError;
use crate::state::AppState;
use crate::store::export::DataArchive;

pub async fn export_all_data(
    State(state): State<Arc<AppState>>,
) -> Result<Json<DataArchive>, ChatError> {
    let mut archive = state.store.export_all().await?;
    archive.settings = Some(state.config.load_config()?);
    Ok(Json(archive))
}

pub async fn import_data(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<Value>,
) -> Result<Json<Value>, ChatError> {
    let archive: DataArchive = serde_json::from_value(payload)
        .map_err(|e| ChatError::validation(format!("invalid import payload: {e}")))?;

    let settings = archive.settings.clone();
    let summary = state.store.import_archive(archive).await?;
    if let Some(settings) = settings {
        state.config.update_config(settings, true)?;
    }

    Ok(Json(json!({ "summary": summary })))
}
