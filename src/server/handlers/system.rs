use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};

use crate::core::config::GenerationSettings;
use crate::core::errors::ChatError;
use crate::setup::{setup_status, SetupStatus};
use crate::sidecar::StatusReport;
use crate::state::AppState;

pub async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "model": state.sidecar.status(),
    }))
}

pub async fn get_model_status(State(state): State<Arc<AppState>>) -> Json<StatusReport> {
    Json(state.sidecar.status())
}

pub async fn start_sidecar(
    State(state): State<Arc<AppState>>,
) -> Result<Json<StatusReport>, ChatError> {
    // A freshly downloaded binary may not have been seen yet.
    state.sidecar.refresh_binary_path().await;

    let settings = GenerationSettings::from_config(&state.config.load_config()?);
    state.sidecar.start(&settings).await?;
    Ok(Json(state.sidecar.status()))
}

pub async fn stop_sidecar(State(state): State<Arc<AppState>>) -> Json<StatusReport> {
    state.sidecar.stop().await;
    Json(state.sidecar.status())
}

pub async fn get_setup_status(
    State(state): State<Arc<AppState>>,
) -> Result<Json<SetupStatus>, ChatError> {
    let settings = GenerationSettings::from_config(&state.config.load_config()?);
    Ok(Json(setup_status(&state.paths, &settings)))
}

/// Mark first-run onboarding finished.
pub async fn complete_setup(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ChatError> {
    state.config.set_value("app.first_run", json!(false))?;
    Ok(Json(json!({ "firstRun": false })))
}

pub async fn get_config(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ChatError> {
    Ok(Json(state.config.load_config()?))
}

pub async fn update_config(
    State(state): State<Arc<AppState>>,
    Json(patch): Json<Value>,
) -> Result<Json<Value>, ChatError> {
    state.config.update_config(patch, true)?;
    Ok(Json(state.config.load_config()?))
}
