//! Core data models stored in SQLite and exposed over the HTTP API.
//!
//! The knowledge-base lifecycle is:
//!
//! ```text
//! folder scan → KbFile (pending) → extract → chunk → embed → KbChunk
//!                                                      ↓
//!                                             KbFile (processed | error)
//! ```
//!
//! Conversations own ordered messages; settings is a flat key/value table.
//! All timestamps are Unix epoch seconds.

use serde::{Deserialize, Serialize};

/// File registry statuses. A file is created `pending`, moves to
/// `processed` on success or `error` on failure, and is reset to
/// `pending` whenever it is re-registered by a scan or upload.
pub const STATUS_PENDING: &str = "pending";
pub const STATUS_PROCESSED: &str = "processed";
pub const STATUS_ERROR: &str = "error";

/// Well-known settings keys.
pub const SYSTEM_PROMPT_KEY: &str = "system_prompt";
pub const KB_FOLDER_KEY: &str = "kb_folder";
pub const KB_EMBEDDING_MODEL_KEY: &str = "kb_embedding_model";

/// Default system instruction seeded on first startup.
pub const DEFAULT_SYSTEM_PROMPT: &str = "你是一个中文的助手，你会根据用户的问题回答用户的问题。";

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Conversation {
    pub id: i64,
    pub title: String,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Message {
    pub id: i64,
    pub conversation_id: i64,
    /// `system`, `user`, or `assistant`.
    pub role: String,
    pub content: String,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Setting {
    pub id: i64,
    pub key: String,
    pub value: String,
    pub created_at: i64,
    pub updated_at: i64,
}

/// A registered knowledge-base file.
///
/// `path` is the dedup key: re-registering an existing path keeps the id
/// stable, refreshes checksum/size, and resets the status to `pending`.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct KbFile {
    pub id: i64,
    pub path: String,
    /// MD5 hex digest of the file contents.
    pub checksum: String,
    pub size: i64,
    pub status: String,
    pub created_at: i64,
    pub updated_at: i64,
}

/// A retrievable text span owned by a [`KbFile`].
///
/// `vector` is a little-endian f32 byte blob (`dimension × 4` bytes) and
/// may be empty when embedding was skipped or failed; such chunks remain
/// reachable through keyword search.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct KbChunk {
    pub id: i64,
    pub file_id: i64,
    pub content: String,
    pub vector: Vec<u8>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// One role/content turn as sent to the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

/// Per-file chunking progress, shown in the progress panel while a large
/// file streams its chunks through embedding.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ChunkProgress {
    pub file_name: String,
    pub total_chunks: usize,
    pub processed_chunks: usize,
    pub progress: f64,
}

/// Snapshot of the ingestion pipeline state, polled via the progress
/// endpoint. `status` is one of `idle`, `scanning`, `syncing`,
/// `processing`, `completed`.
#[derive(Debug, Clone, Serialize)]
pub struct SyncProgress {
    pub total_files: usize,
    pub processed_files: usize,
    pub current_file: String,
    pub status: String,
    pub progress: f64,
    pub chunk_progress: Vec<ChunkProgress>,
}

impl Default for SyncProgress {
    fn default() -> Self {
        Self {
            total_files: 0,
            processed_files: 0,
            current_file: String::new(),
            status: "idle".to_string(),
            progress: 0.0,
            chunk_progress: Vec::new(),
        }
    }
}
