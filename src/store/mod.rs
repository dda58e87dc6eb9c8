use std::path::Path;

use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;

use crate::core::errors::ChatError;

pub mod characters;
pub mod conversations;
pub mod downloads;
pub mod export;
pub mod lorebooks;
pub mod messages;
pub mod personas;
pub mod types;

pub use types::*;

/// Transactional persistence for all durable entities.
///
/// Every mutation happens inside a transaction; branch mutations in
/// particular are single transactions so readers observe either the old or
/// the new active path, never a mix.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub async fn new(db_path: &Path) -> Result<Self, ChatError> {
        let conn_str = format!("sqlite://{}?mode=rwc", db_path.to_string_lossy());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&conn_str)
            .await
            .map_err(|e| ChatError::Storage(format!("failed to open database: {e}")))?;

        init_schema(&pool).await?;
        Ok(Self { pool })
    }

    /// In-memory store for tests. A single connection keeps every query on
    /// the same database.
    pub async fn in_memory() -> Result<Self, ChatError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| ChatError::Storage(format!("failed to open database: {e}")))?;

        init_schema(&pool).await?;
        Ok(Self { pool })
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub(crate) fn now() -> String {
        chrono::Utc::now().to_rfc3339()
    }

    pub(crate) fn new_id() -> String {
        uuid::Uuid::new_v4().to_string()
    }
}

async fn init_schema(pool: &SqlitePool) -> Result<(), ChatError> {
    let statements = [
        "CREATE TABLE IF NOT EXISTS characters (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            personality TEXT NOT NULL DEFAULT '',
            scenario TEXT NOT NULL DEFAULT '',
            backstory TEXT NOT NULL DEFAULT '',
            system_prompt TEXT,
            first_message TEXT,
            alternate_greetings JSON,
            example_dialogues TEXT,
            physical_traits TEXT,
            speech_patterns TEXT,
            likes JSON,
            dislikes JSON,
            tags JSON,
            avatar_ref TEXT,
            rating TEXT NOT NULL DEFAULT 'sfw',
            pov_type TEXT NOT NULL DEFAULT 'any',
            is_bundled INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
        "CREATE TABLE IF NOT EXISTS personas (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            is_default INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
        "CREATE TABLE IF NOT EXISTS conversations (
            id TEXT PRIMARY KEY,
            title TEXT,
            character_ids JSON NOT NULL,
            persona_id TEXT,
            active_message_id TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
        "CREATE TABLE IF NOT EXISTS conversation_lorebooks (
            conversation_id TEXT NOT NULL,
            lorebook_id TEXT NOT NULL,
            PRIMARY KEY (conversation_id, lorebook_id)
        )",
        "CREATE TABLE IF NOT EXISTS messages (
            id TEXT PRIMARY KEY,
            conversation_id TEXT NOT NULL,
            parent_id TEXT,
            author_type TEXT NOT NULL,
            author_id TEXT,
            content TEXT NOT NULL DEFAULT '',
            branch_index INTEGER NOT NULL DEFAULT 0,
            is_active_branch INTEGER NOT NULL DEFAULT 0,
            token_count INTEGER NOT NULL DEFAULT 0,
            generation_params JSON,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
        )",
        "CREATE INDEX IF NOT EXISTS idx_messages_conversation ON messages(conversation_id)",
        "CREATE INDEX IF NOT EXISTS idx_messages_parent ON messages(conversation_id, parent_id)",
        "CREATE TABLE IF NOT EXISTS lorebooks (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            is_global INTEGER NOT NULL DEFAULT 0,
            is_enabled INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
        "CREATE TABLE IF NOT EXISTS lorebook_entries (
            id TEXT PRIMARY KEY,
            lorebook_id TEXT NOT NULL,
            name TEXT NOT NULL DEFAULT '',
            keywords JSON NOT NULL,
            content TEXT NOT NULL DEFAULT '',
            priority INTEGER NOT NULL DEFAULT 0,
            is_enabled INTEGER NOT NULL DEFAULT 1,
            case_sensitive INTEGER NOT NULL DEFAULT 0,
            match_whole_word INTEGER NOT NULL DEFAULT 0,
            insertion_position TEXT NOT NULL DEFAULT 'after_system',
            token_budget INTEGER,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(lorebook_id) REFERENCES lorebooks(id) ON DELETE CASCADE
        )",
        "CREATE INDEX IF NOT EXISTS idx_lorebook_entries_book ON lorebook_entries(lorebook_id)",
        "CREATE TABLE IF NOT EXISTS conversation_summaries (
            id TEXT PRIMARY KEY,
            conversation_id TEXT NOT NULL,
            covers_up_to TEXT,
            content TEXT NOT NULL,
            token_count INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            FOREIGN KEY(conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
        )",
        "CREATE TABLE IF NOT EXISTS downloads (
            id TEXT PRIMARY KEY,
            url TEXT NOT NULL,
            destination_path TEXT NOT NULL,
            kind TEXT NOT NULL,
            expected_size INTEGER,
            downloaded_bytes INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL DEFAULT 'pending',
            checksum TEXT,
            error TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
    ];

    for statement in statements {
        sqlx::query(statement)
            .execute(pool)
            .await
            .map_err(|e| ChatError::Storage(format!("schema init failed: {e}")))?;
    }

    Ok(())
}
