use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

// ---------------------------------------------------------------------------
// Characters
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rating {
    Sfw,
    Nsfw,
    Limitless,
}

impl Rating {
    pub fn as_str(&self) -> &'static str {
        match self {
            Rating::Sfw => "sfw",
            Rating::Nsfw => "nsfw",
            Rating::Limitless => "limitless",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "nsfw" => Rating::Nsfw,
            "limitless" => Rating::Limitless,
            _ => Rating::Sfw,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PovType {
    Any,
    First,
    Second,
    Third,
}

impl PovType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PovType::Any => "any",
            PovType::First => "first",
            PovType::Second => "second",
            PovType::Third => "third",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "first" => PovType::First,
            "second" => PovType::Second,
            "third" => PovType::Third,
            _ => PovType::Any,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Character {
    pub id: String,
    pub name: String,
    pub description: String,
    pub personality: String,
    pub scenario: String,
    pub backstory: String,
    pub system_prompt: Option<String>,
    pub first_message: Option<String>,
    pub alternate_greetings: Vec<String>,
    pub example_dialogues: Option<String>,
    pub physical_traits: Option<String>,
    pub speech_patterns: Option<String>,
    pub likes: Vec<String>,
    pub dislikes: Vec<String>,
    pub tags: Vec<String>,
    pub avatar_ref: Option<String>,
    pub rating: Rating,
    pub pov_type: PovType,
    pub is_bundled: bool,
    pub created_at: String,
    pub updated_at: String,
}

/// Mutable character content; identity (`id`, timestamps) is assigned by the
/// store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CharacterDraft {
    pub name: String,
    pub description: String,
    pub personality: String,
    pub scenario: String,
    pub backstory: String,
    pub system_prompt: Option<String>,
    pub first_message: Option<String>,
    pub alternate_greetings: Vec<String>,
    pub example_dialogues: Option<String>,
    pub physical_traits: Option<String>,
    pub speech_patterns: Option<String>,
    pub likes: Vec<String>,
    pub dislikes: Vec<String>,
    pub tags: Vec<String>,
    pub avatar_ref: Option<String>,
    pub rating: Option<Rating>,
    pub pov_type: Option<PovType>,
    pub is_bundled: bool,
}

// ---------------------------------------------------------------------------
// Personas
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Persona {
    pub id: String,
    pub name: String,
    pub description: String,
    pub is_default: bool,
    pub created_at: String,
    pub updated_at: String,
}

// ---------------------------------------------------------------------------
// Conversations
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    pub title: Option<String>,
    pub character_ids: Vec<String>,
    pub persona_id: Option<String>,
    pub active_message_id: Option<String>,
    pub lorebook_ids: Vec<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl Conversation {
    pub fn is_group(&self) -> bool {
        self.character_ids.len() > 1
    }
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthorType {
    User,
    Character,
    System,
}

impl AuthorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthorType::User => "user",
            AuthorType::Character => "character",
            AuthorType::System => "system",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "character" => AuthorType::Character,
            "system" => AuthorType::System,
            _ => AuthorType::User,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub parent_id: Option<String>,
    pub author_type: AuthorType,
    pub author_id: Option<String>,
    pub content: String,
    pub branch_index: i64,
    pub is_active_branch: bool,
    pub token_count: i64,
    pub generation_params: Option<Value>,
    pub created_at: String,
    pub updated_at: String,
}

/// Content of a message about to be appended; tree position is assigned by
/// the store.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub author_type: AuthorType,
    pub author_id: Option<String>,
    pub content: String,
    pub token_count: i64,
    pub generation_params: Option<Value>,
}

// ---------------------------------------------------------------------------
// Lorebooks
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lorebook {
    pub id: String,
    pub name: String,
    pub description: String,
    pub is_global: bool,
    pub is_enabled: bool,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InsertionPosition {
    BeforeSystem,
    AfterSystem,
    BeforeHistory,
}

impl InsertionPosition {
    pub fn as_str(&self) -> &'static str {
        match self {
            InsertionPosition::BeforeSystem => "before_system",
            InsertionPosition::AfterSystem => "after_system",
            InsertionPosition::BeforeHistory => "before_history",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "before_system" => InsertionPosition::BeforeSystem,
            "before_history" => InsertionPosition::BeforeHistory,
            _ => InsertionPosition::AfterSystem,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LorebookEntry {
    pub id: String,
    pub lorebook_id: String,
    pub name: String,
    pub keywords: Vec<String>,
    pub content: String,
    pub priority: i64,
    pub is_enabled: bool,
    pub case_sensitive: bool,
    pub match_whole_word: bool,
    pub insertion_position: InsertionPosition,
    pub token_budget: Option<i64>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LorebookEntryDraft {
    pub name: String,
    pub keywords: Vec<String>,
    pub content: String,
    pub priority: i64,
    pub is_enabled: Option<bool>,
    pub case_sensitive: bool,
    pub match_whole_word: bool,
    pub insertion_position: Option<InsertionPosition>,
    pub token_budget: Option<i64>,
}

// ---------------------------------------------------------------------------
// Summaries
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    pub id: String,
    pub conversation_id: String,
    /// Id of the newest message the summary covers, when known.
    pub covers_up_to: Option<String>,
    pub content: String,
    pub token_count: i64,
    pub created_at: String,
}

// ---------------------------------------------------------------------------
// Downloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadKind {
    Binary,
    Model,
}

impl DownloadKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DownloadKind::Binary => "binary",
            DownloadKind::Model => "model",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "binary" => DownloadKind::Binary,
            _ => DownloadKind::Model,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadStatus {
    Pending,
    Downloading,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl DownloadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DownloadStatus::Pending => "pending",
            DownloadStatus::Downloading => "downloading",
            DownloadStatus::Paused => "paused",
            DownloadStatus::Completed => "completed",
            DownloadStatus::Failed => "failed",
            DownloadStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "downloading" => DownloadStatus::Downloading,
            "paused" => DownloadStatus::Paused,
            "completed" => DownloadStatus::Completed,
            "failed" => DownloadStatus::Failed,
            "cancelled" => DownloadStatus::Cancelled,
            _ => DownloadStatus::Pending,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DownloadStatus::Completed | DownloadStatus::Failed | DownloadStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Download {
    pub id: String,
    pub url: String,
    pub destination_path: String,
    pub kind: DownloadKind,
    pub expected_size: Option<i64>,
    pub downloaded_bytes: i64,
    pub status: DownloadStatus,
    pub checksum: Option<String>,
    pub error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn string_list(value: Option<Value>) -> Vec<String> {
    value
        .and_then(|v| serde_json::from_value::<Vec<String>>(v).ok())
        .unwrap_or_default()
}

pub fn character_from_row(row: &SqliteRow) -> Character {
    Character {
        id: row.try_get("id").unwrap_or_default(),
        name: row.try_get("name").unwrap_or_default(),
        description: row.try_get("description").unwrap_or_default(),
        personality: row.try_get("personality").unwrap_or_default(),
        scenario: row.try_get("scenario").unwrap_or_default(),
        backstory: row.try_get("backstory").unwrap_or_default(),
        system_prompt: row.try_get("system_prompt").unwrap_or(None),
        first_message: row.try_get("first_message").unwrap_or(None),
        alternate_greetings: string_list(row.try_get("alternate_greetings").unwrap_or(None)),
        example_dialogues: row.try_get("example_dialogues").unwrap_or(None),
        physical_traits: row.try_get("physical_traits").unwrap_or(None),
        speech_patterns: row.try_get("speech_patterns").unwrap_or(None),
        likes: string_list(row.try_get("likes").unwrap_or(None)),
        dislikes: string_list(row.try_get("dislikes").unwrap_or(None)),
        tags: string_list(row.try_get("tags").unwrap_or(None)),
        avatar_ref: row.try_get("avatar_ref").unwrap_or(None),
        rating: Rating::parse(&row.try_get::<String, _>("rating").unwrap_or_default()),
        pov_type: PovType::parse(&row.try_get::<String, _>("pov_type").unwrap_or_default()),
        is_bundled: row.try_get::<bool, _>("is_bundled").unwrap_or(false),
        created_at: row.try_get("created_at").unwrap_or_default(),
        updated_at: row.try_get("updated_at").unwrap_or_default(),
    }
}

pub fn persona_from_row(row: &SqliteRow) -> Persona {
    Persona {
        id: row.try_get("id").unwrap_or_default(),
        name: row.try_get("name").unwrap_or_default(),
        description: row.try_get("description").unwrap_or_default(),
        is_default: row.try_get::<bool, _>("is_default").unwrap_or(false),
        created_at: row.try_get("created_at").unwrap_or_default(),
        updated_at: row.try_get("updated_at").unwrap_or_default(),
    }
}

pub fn conversation_from_row(row: &SqliteRow, lorebook_ids: Vec<String>) -> Conversation {
    Conversation {
        id: row.try_get("id").unwrap_or_default(),
        title: row.try_get("title").unwrap_or(None),
        character_ids: string_list(row.try_get("character_ids").unwrap_or(None)),
        persona_id: row.try_get("persona_id").unwrap_or(None),
        active_message_id: row.try_get("active_message_id").unwrap_or(None),
        lorebook_ids,
        created_at: row.try_get("created_at").unwrap_or_default(),
        updated_at: row.try_get("updated_at").unwrap_or_default(),
    }
}

pub fn message_from_row(row: &SqliteRow) -> Message {
    Message {
        id: row.try_get("id").unwrap_or_default(),
        conversation_id: row.try_get("conversation_id").unwrap_or_default(),
        parent_id: row.try_get("parent_id").unwrap_or(None),
        author_type: AuthorType::parse(&row.try_get::<String, _>("author_type").unwrap_or_default()),
        author_id: row.try_get("author_id").unwrap_or(None),
        content: row.try_get("content").unwrap_or_default(),
        branch_index: row.try_get("branch_index").unwrap_or(0),
        is_active_branch: row.try_get::<bool, _>("is_active_branch").unwrap_or(false),
        token_count: row.try_get("token_count").unwrap_or(0),
        generation_params: row.try_get("generation_params").unwrap_or(None),
        created_at: row.try_get("created_at").unwrap_or_default(),
        updated_at: row.try_get("updated_at").unwrap_or_default(),
    }
}

pub fn lorebook_from_row(row: &SqliteRow) -> Lorebook {
    Lorebook {
        id: row.try_get("id").unwrap_or_default(),
        name: row.try_get("name").unwrap_or_default(),
        description: row.try_get("description").unwrap_or_default(),
        is_global: row.try_get::<bool, _>("is_global").unwrap_or(false),
        is_enabled: row.try_get::<bool, _>("is_enabled").unwrap_or(true),
        created_at: row.try_get("created_at").unwrap_or_default(),
        updated_at: row.try_get("updated_at").unwrap_or_default(),
    }
}

pub fn lorebook_entry_from_row(row: &SqliteRow) -> LorebookEntry {
    LorebookEntry {
        id: row.try_get("id").unwrap_or_default(),
        lorebook_id: row.try_get("lorebook_id").unwrap_or_default(),
        name: row.try_get("name").unwrap_or_default(),
        keywords: string_list(row.try_get("keywords").unwrap_or(None)),
        content: row.try_get("content").unwrap_or_default(),
        priority: row.try_get("priority").unwrap_or(0),
        is_enabled: row.try_get::<bool, _>("is_enabled").unwrap_or(true),
        case_sensitive: row.try_get::<bool, _>("case_sensitive").unwrap_or(false),
        match_whole_word: row.try_get::<bool, _>("match_whole_word").unwrap_or(false),
        insertion_position: InsertionPosition::parse(
            &row.try_get::<String, _>("insertion_position")
                .unwrap_or_default(),
        ),
        token_budget: row.try_get("token_budget").unwrap_or(None),
        created_at: row.try_get("created_at").unwrap_or_default(),
        updated_at: row.try_get("updated_at").unwrap_or_default(),
    }
}

pub fn summary_from_row(row: &SqliteRow) -> ConversationSummary {
    ConversationSummary {
        id: row.try_get("id").unwrap_or_default(),
        conversation_id: row.try_get("conversation_id").unwrap_or_default(),
        covers_up_to: row.try_get("covers_up_to").unwrap_or(None),
        content: row.try_get("content").unwrap_or_default(),
        token_count: row.try_get("token_count").unwrap_or(0),
        created_at: row.try_get("created_at").unwrap_or_default(),
    }
}

pub fn download_from_row(row: &SqliteRow) -> Download {
    Download {
        id: row.try_get("id").unwrap_or_default(),
        url: row.try_get("url").unwrap_or_default(),
        destination_path: row.try_get("destination_path").unwrap_or_default(),
        kind: DownloadKind::parse(&row.try_get::<String, _>("kind").unwrap_or_default()),
        expected_size: row.try_get("expected_size").unwrap_or(None),
        downloaded_bytes: row.try_get("downloaded_bytes").unwrap_or(0),
        status: DownloadStatus::parse(&row.try_get::<String, _>("status").unwrap_or_default()),
        checksum: row.try_get("checksum").unwrap_or(None),
        error: row.try_get("error").unwrap_or(None),
        created_at: row.try_get("created_at").unwrap_or_default(),
        updated_at: row.try_get("updated_at").unwrap_or_default(),
    }
}
