use std::sync::Arc;

use axum::http::{header, HeaderValue, Method};
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::server::handlers::{
    characters, chat, conversations, data, downloads, lorebooks, personas, system,
};
use crate::server::ws::ws_handler;
use crate::state::AppState;

/// The command surface: REST routes for every operation, plus the `/ws`
/// event stream the view subscribes to.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(system::health))
        // chat
        .route("/api/chat/send", post(chat::send_message))
        .route("/api/chat/regenerate", post(chat::regenerate_message))
        .route("/api/chat/edit", post(chat::edit_message))
        .route("/api/chat/stop", post(chat::stop_generation))
        .route("/api/chat/siblings/:message_id", get(chat::get_branch_siblings))
        .route("/api/chat/switch-branch", post(chat::switch_branch))
        // conversations
        .route(
            "/api/conversations",
            get(conversations::list_conversations).post(conversations::create_conversation),
        )
        .route(
            "/api/conversations/:id",
            get(conversations::get_conversation)
                .patch(conversations::update_conversation)
                .delete(conversations::delete_conversation),
        )
        .route(
            "/api/conversations/:id/messages",
            get(conversations::get_conversation_messages),
        )
        .route(
            "/api/conversations/by-character/:character_id",
            get(conversations::find_conversation_by_character),
        )
        .route(
            "/api/conversations/:id/lorebooks/:lorebook_id",
            post(conversations::attach_lorebook).delete(conversations::detach_lorebook),
        )
        // characters
        .route(
            "/api/characters",
            get(characters::list_characters).post(characters::create_character),
        )
        .route(
            "/api/characters/:id",
            get(characters::get_character)
                .put(characters::update_character)
                .delete(characters::delete_character),
        )
        .route("/api/characters/import-card", post(characters::import_character_card))
        // personas
        .route(
            "/api/personas",
            get(personas::list_personas).post(personas::create_persona),
        )
        .route(
            "/api/personas/:id",
            get(personas::get_persona)
                .put(personas::update_persona)
                .delete(personas::delete_persona),
        )
        .route("/api/personas/:id/default", post(personas::set_default_persona))
        // lorebooks
        .route(
            "/api/lorebooks",
            get(lorebooks::list_lorebooks).post(lorebooks::create_lorebook),
        )
        .route(
            "/api/lorebooks/:id",
            get(lorebooks::get_lorebook)
                .put(lorebooks::update_lorebook)
                .delete(lorebooks::delete_lorebook),
        )
        .route(
            "/api/lorebooks/:id/entries",
            get(lorebooks::list_entries).post(lorebooks::create_entry),
        )
        .route(
            "/api/lorebooks/entries/:entry_id",
            get(lorebooks::get_entry)
                .put(lorebooks::update_entry)
                .delete(lorebooks::delete_entry),
        )
        // system
        .route("/api/model/status", get(system::get_model_status))
        .route("/api/sidecar/start", post(system::start_sidecar))
        .route("/api/sidecar/stop", post(system::stop_sidecar))
        .route("/api/setup/status", get(system::get_setup_status))
        .route("/api/setup/complete", post(system::complete_setup))
        .route(
            "/api/config",
            get(system::get_config).post(system::update_config),
        )
        // downloads
        .route(
            "/api/downloads",
            get(downloads::list_downloads).post(downloads::start_download),
        )
        .route("/api/downloads/:id", get(downloads::get_download_status))
        .route("/api/downloads/:id/pause", post(downloads::pause_download))
        .route("/api/downloads/:id/resume", post(downloads::resume_download))
        .route("/api/downloads/:id/cancel", post(downloads::cancel_download))
        // data exchange
        .route("/api/data/export", get(data::export_all_data))
        .route("/api/data/import", post(data::import_data))
        // event stream
        .route("/ws", get(ws_handler))
        .with_state(state)
        .layer(build_cors_layer())
        .layer(TraceLayer::new_for_http())
}

fn build_cors_layer() -> CorsLayer {
    let origins: Vec<HeaderValue> = default_local_origins()
        .into_iter()
        .filter_map(|origin| HeaderValue::from_str(origin).ok())
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([header::ACCEPT, header::CONTENT_TYPE])
}

fn default_local_origins() -> Vec<&'static str> {
    vec![
        "tauri://localhost",
        "https://tauri.localhost",
        "http://tauri.localhost",
        "http://localhost",
        "http://localhost:5173",
        "http://localhost:3000",
        "http://127.0.0.1",
        "http://127.0.0.1:5173",
        "http://127.0.0.1:3000",
    ]
}
