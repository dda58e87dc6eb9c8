use std::sync::Arc;

use crate::core::config::{defaults::default_config, AppPaths, ConfigService};
use crate::downloads::DownloadManager;
use crate::engine::ChatEngine;
use crate::events::EventBus;
use crate::sidecar::SidecarSupervisor;
use crate::store::Store;

pub mod error;

pub use error::InitializationError;

/// Global application state shared across all routes and background tasks.
///
/// All process-wide handles (store, sidecar, event bus) are constructed once
/// here and passed explicitly; nothing reaches for ambient globals.
#[derive(Clone)]
pub struct AppState {
    pub paths: Arc<AppPaths>,
    pub config: ConfigService,
    pub store: Store,
    pub bus: EventBus,
    pub sidecar: SidecarSupervisor,
    pub engine: ChatEngine,
    pub downloads: DownloadManager,
}

impl AppState {
    pub async fn initialize() -> Result<Arc<Self>, InitializationError> {
        Self::initialize_with(Arc::new(AppPaths::new())).await
    }

    pub async fn initialize_with(paths: Arc<AppPaths>) -> Result<Arc<Self>, InitializationError> {
        let config = ConfigService::new(paths.clone());
        if !config.config_path().exists() {
            config
                .update_config(default_config(), false)
                .map_err(InitializationError::Config)?;
        }

        let bus = EventBus::default();
        let store = Store::new(&paths.db_path)
            .await
            .map_err(InitializationError::Storage)?;

        let sidecar = SidecarSupervisor::new(paths.clone(), bus.clone());
        let downloads = DownloadManager::new(store.clone(), paths.clone(), bus.clone());
        downloads
            .recover()
            .await
            .map_err(InitializationError::Storage)?;

        let engine = ChatEngine::new(
            store.clone(),
            sidecar.clone(),
            config.clone(),
            bus.clone(),
            None,
        );

        Ok(Arc::new(AppState {
            paths,
            config,
            store,
            bus,
            sidecar,
            engine,
            downloads,
        }))
    }
}
