use std::sync::Arc;

use axum::extract::{Path, State};
use axum::Json;
use serde::Deserialize;

use crate::core::errors::ChatError;
use crate::state::AppState;
use crate::store::types::{Download, DownloadKind};

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartDownloadRequest {
    pub url: String,
    pub kind: DownloadKind,
    pub checksum: Option<String>,
}

pub async fn start_download(
    State(state): State<Arc<AppState>>,
    Json(req): Json<StartDownloadRequest>,
) -> Result<Json<Download>, ChatError> {
    Ok(Json(
        state
            .downloads
            .start(&req.url, req.kind, req.checksum.as_deref())
            .await?,
    ))
}

pub async fn pause_download(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Download>, ChatError> {
    Ok(Json(state.downloads.pause(&id).await?))
}

pub async fn resume_download(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Download>, ChatError> {
    Ok(Json(state.downloads.resume(&id).await?))
}

pub async fn cancel_download(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Download>, ChatError> {
    Ok(Json(state.downloads.cancel(&id).await?))
}

pub async fn get_download_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Download>, ChatError> {
    Ok(Json(state.downloads.status(&id).await?))
}

pub async fn list_downloads(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<Download>>, ChatError> {
    Ok(Json(state.downloads.list().await?))
}
