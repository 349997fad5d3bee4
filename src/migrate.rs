//! Database schema migrations.
//!
//! Creates all required tables and seeds defaults; safe to run on every
//! startup.
//!
//! # Schema
//!
//! ```text
//! ┌───────────────┐     ┌───────────────┐     ┌──────────────┐
//! │ conversations │──┐  │   messages    │     │   settings   │
//! │               │  │  │               │     │              │
//! │ id (PK)       │  └──│ conversation_ │     │ id (PK)      │
//! │ title         │     │   id          │     │ key (UNIQUE) │
//! │ created_at    │     │ role          │     │ value        │
//! │ updated_at    │     │ content       │     └──────────────┘
//! └───────────────┘     └───────────────┘
//!
//! ┌───────────────┐     ┌───────────────┐
//! │   kb_files    │──┐  │   kb_chunks   │
//! │               │  │  │               │
//! │ id (PK)       │  └──│ file_id       │
//! │ path (UNIQUE) │     │ content       │
//! │ checksum      │     │ vector (BLOB) │
//! │ size          │     └───────────────┘
//! │ status        │
//! └───────────────┘
//! ```
//!
//! # Seeds
//!
//! - The `system_prompt` setting, when missing.
//! - A `Default` conversation, when missing; orphan messages with
//!   `conversation_id = 0` are re-homed onto it.

use sqlx::SqlitePool;

use crate::error::Result;
use crate::models::{DEFAULT_SYSTEM_PROMPT, SYSTEM_PROMPT_KEY};
use crate::store;

/// Run all migrations and seed default rows. Idempotent.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS conversations (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            title TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS messages (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            conversation_id INTEGER NOT NULL,
            role TEXT NOT NULL,
            content TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS settings (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            key TEXT NOT NULL UNIQUE,
            value TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS kb_files (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            path TEXT NOT NULL UNIQUE,
            checksum TEXT NOT NULL,
            size INTEGER NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS kb_chunks (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            file_id INTEGER NOT NULL,
            content TEXT NOT NULL,
            vector BLOB NOT NULL DEFAULT (x''),
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            FOREIGN KEY (file_id) REFERENCES kb_files(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_kb_chunks_file_id ON kb_chunks(file_id)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_messages_conversation_id ON messages(conversation_id)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_kb_files_status ON kb_files(status)")
        .execute(pool)
        .await?;

    seed_defaults(pool).await?;

    Ok(())
}

async fn seed_defaults(pool: &SqlitePool) -> Result<()> {
    if store::get_setting(pool, SYSTEM_PROMPT_KEY).await?.is_none() {
        store::set_setting(pool, SYSTEM_PROMPT_KEY, DEFAULT_SYSTEM_PROMPT).await?;
    }

    let default_conv = store::get_or_create_default_conversation(pool).await?;
    sqlx::query("UPDATE messages SET conversation_id = ? WHERE conversation_id = 0")
        .bind(default_conv.id)
        .execute(pool)
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let pool = db::connect(&dir.path().join("kb.db")).await.unwrap();
        run_migrations(&pool).await.unwrap();
        run_migrations(&pool).await.unwrap();

        let prompt = store::get_setting(&pool, SYSTEM_PROMPT_KEY)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(prompt, DEFAULT_SYSTEM_PROMPT);

        let conv = store::get_or_create_default_conversation(&pool)
            .await
            .unwrap();
        assert_eq!(conv.title, "Default");
    }
}
