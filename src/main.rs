//! Hearth backend.
//!
//! Local HTTP/WebSocket server hosting the chat orchestration core for the
//! desktop view: conversation storage, prompt assembly, sidecar-driven
//! streaming inference, lorebooks, and model downloads.

use std::process::ExitCode;
use std::sync::Arc;

use hearth_backend::core::config::{AppPaths, GenerationSettings};
use hearth_backend::logging;
use hearth_backend::server;
use hearth_backend::state::{AppState, InitializationError};

#[tokio::main]
async fn main() -> ExitCode {
    let paths = Arc::new(AppPaths::new());
    let _log_guard = logging::init(&paths);

    match run(paths).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!("{err}");
            ExitCode::from(err.exit_code())
        }
    }
}

async fn run(paths: Arc<AppPaths>) -> Result<(), InitializationError> {
    tracing::info!("starting hearth backend");
    let state = AppState::initialize_with(paths).await?;

    // Bring the sidecar up when a model is already configured; the
    // onboarding flow drives it otherwise.
    let settings = GenerationSettings::from_config(
        &state
            .config
            .load_config()
            .map_err(InitializationError::Config)?,
    );
    if let Some(model_path) = &settings.model_path {
        if !model_path.exists() {
            return Err(InitializationError::ModelNotFound(
                model_path.display().to_string(),
            ));
        }
        state
            .sidecar
            .start(&settings)
            .await
            .map_err(InitializationError::Sidecar)?;
    }

    let app = server::router(state.clone());

    let host = std::env::var("HEARTH_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port = std::env::var("HEARTH_PORT")
        .ok()
        .and_then(|p| p.parse::<u16>().ok())
        .unwrap_or(4815);
    let addr = format!("{host}:{port}");
    tracing::info!("listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| InitializationError::Server(e.to_string()))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| InitializationError::Server(e.to_string()))?;

    // Shutdown cancels any in-flight generation and stops the sidecar
    // within its grace period.
    state.engine.stop_generation().await;
    state.sidecar.stop().await;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown requested");
}
