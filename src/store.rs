//! All SQL access: conversations, messages, settings, the knowledge-base
//! file registry, and chunk storage.
//!
//! Chunk writes are transactional per file: the caller opens a transaction,
//! deletes the file's old chunks, streams batched inserts through
//! [`insert_chunk_batch`], and commits. A failure anywhere rolls the whole
//! file back. File status changes happen outside the transaction.

use sqlx::{QueryBuilder, Sqlite, SqlitePool, Transaction};

use crate::error::{Error, Result};
use crate::models::{
    Conversation, KbChunk, KbFile, Message, Setting, KB_EMBEDDING_MODEL_KEY, KB_FOLDER_KEY,
    SYSTEM_PROMPT_KEY,
};

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

// ============ Conversations ============

pub async fn create_conversation(pool: &SqlitePool, title: &str) -> Result<Conversation> {
    let title = title.trim();
    let title = if title.is_empty() { "New chat" } else { title };
    let ts = now();
    let id = sqlx::query(
        "INSERT INTO conversations (title, created_at, updated_at) VALUES (?, ?, ?)",
    )
    .bind(title)
    .bind(ts)
    .bind(ts)
    .execute(pool)
    .await?
    .last_insert_rowid();

    Ok(Conversation {
        id,
        title: title.to_string(),
        created_at: ts,
        updated_at: ts,
    })
}

pub async fn list_conversations(pool: &SqlitePool, limit: i64) -> Result<Vec<Conversation>> {
    let limit = if limit <= 0 { 50 } else { limit };
    let rows = sqlx::query_as::<_, Conversation>(
        "SELECT * FROM conversations ORDER BY updated_at DESC, id DESC LIMIT ?",
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn get_conversation(pool: &SqlitePool, id: i64) -> Result<Option<Conversation>> {
    let row = sqlx::query_as::<_, Conversation>("SELECT * FROM conversations WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(row)
}

pub async fn get_or_create_default_conversation(pool: &SqlitePool) -> Result<Conversation> {
    let existing =
        sqlx::query_as::<_, Conversation>("SELECT * FROM conversations WHERE title = 'Default'")
            .fetch_optional(pool)
            .await?;
    match existing {
        Some(c) => Ok(c),
        None => create_conversation(pool, "Default").await,
    }
}

pub async fn update_conversation_title(pool: &SqlitePool, id: i64, title: &str) -> Result<()> {
    let title = title.trim();
    if title.is_empty() {
        return Ok(());
    }
    sqlx::query("UPDATE conversations SET title = ?, updated_at = ? WHERE id = ?")
        .bind(title)
        .bind(now())
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Delete a conversation and all of its messages.
pub async fn delete_conversation(pool: &SqlitePool, id: i64) -> Result<()> {
    if id == 0 {
        return Ok(());
    }
    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM messages WHERE conversation_id = ?")
        .bind(id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM conversations WHERE id = ?")
        .bind(id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(())
}

// ============ Messages ============

pub async fn save_message(
    pool: &SqlitePool,
    conversation_id: i64,
    role: &str,
    content: &str,
) -> Result<Message> {
    let ts = now();
    let id = sqlx::query(
        "INSERT INTO messages (conversation_id, role, content, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(conversation_id)
    .bind(role)
    .bind(content)
    .bind(ts)
    .bind(ts)
    .execute(pool)
    .await?
    .last_insert_rowid();

    sqlx::query("UPDATE conversations SET updated_at = ? WHERE id = ?")
        .bind(ts)
        .bind(conversation_id)
        .execute(pool)
        .await?;

    Ok(Message {
        id,
        conversation_id,
        role: role.to_string(),
        content: content.to_string(),
        created_at: ts,
        updated_at: ts,
    })
}

/// Conversation history in insertion order, truncated to `limit`.
pub async fn get_history(
    pool: &SqlitePool,
    conversation_id: i64,
    limit: i64,
) -> Result<Vec<Message>> {
    let limit = if limit <= 0 { 200 } else { limit };
    let rows = sqlx::query_as::<_, Message>(
        "SELECT * FROM messages WHERE conversation_id = ? ORDER BY id ASC LIMIT ?",
    )
    .bind(conversation_id)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn get_last_user_message(
    pool: &SqlitePool,
    conversation_id: i64,
) -> Result<Option<Message>> {
    let row = sqlx::query_as::<_, Message>(
        "SELECT * FROM messages WHERE conversation_id = ? AND role = 'user' \
         ORDER BY id DESC LIMIT 1",
    )
    .bind(conversation_id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

pub async fn get_first_user_message(
    pool: &SqlitePool,
    conversation_id: i64,
) -> Result<Option<Message>> {
    let row = sqlx::query_as::<_, Message>(
        "SELECT * FROM messages WHERE conversation_id = ? AND role = 'user' \
         ORDER BY id ASC LIMIT 1",
    )
    .bind(conversation_id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

/// Delete every message after `message_id` within a conversation. Used by
/// retry to rewind to the last user turn.
pub async fn delete_messages_after(
    pool: &SqlitePool,
    conversation_id: i64,
    message_id: i64,
) -> Result<()> {
    sqlx::query("DELETE FROM messages WHERE conversation_id = ? AND id > ?")
        .bind(conversation_id)
        .bind(message_id)
        .execute(pool)
        .await?;
    Ok(())
}

// ============ Settings ============

pub async fn get_setting(pool: &SqlitePool, key: &str) -> Result<Option<String>> {
    let row = sqlx::query_as::<_, Setting>("SELECT * FROM settings WHERE key = ?")
        .bind(key)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|s| s.value))
}

pub async fn set_setting(pool: &SqlitePool, key: &str, value: &str) -> Result<()> {
    if key.is_empty() {
        return Ok(());
    }
    let ts = now();
    sqlx::query(
        r#"
        INSERT INTO settings (key, value, created_at, updated_at) VALUES (?, ?, ?, ?)
        ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
        "#,
    )
    .bind(key)
    .bind(value)
    .bind(ts)
    .bind(ts)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get_system_prompt(pool: &SqlitePool) -> Result<Option<String>> {
    get_setting(pool, SYSTEM_PROMPT_KEY).await
}

pub async fn get_kb_folder(pool: &SqlitePool) -> Result<Option<String>> {
    get_setting(pool, KB_FOLDER_KEY).await
}

pub async fn get_kb_embedding_model(pool: &SqlitePool) -> Result<Option<String>> {
    get_setting(pool, KB_EMBEDDING_MODEL_KEY).await
}

pub async fn set_kb_embedding_model(pool: &SqlitePool, model: &str) -> Result<()> {
    set_setting(pool, KB_EMBEDDING_MODEL_KEY, model).await
}

// ============ Knowledge-base files ============

/// Register a file, or refresh an existing registration.
///
/// `path` is the dedup key: an existing row keeps its id, takes the new
/// checksum/size, and drops back to `pending` so the next processing pass
/// picks it up again.
pub async fn save_kb_file(
    pool: &SqlitePool,
    path: &str,
    size: i64,
    checksum: &str,
) -> Result<KbFile> {
    let ts = now();
    sqlx::query(
        r#"
        INSERT INTO kb_files (path, checksum, size, status, created_at, updated_at)
        VALUES (?, ?, ?, 'pending', ?, ?)
        ON CONFLICT(path) DO UPDATE SET
            checksum = excluded.checksum,
            size = excluded.size,
            status = 'pending',
            updated_at = excluded.updated_at
        "#,
    )
    .bind(path)
    .bind(checksum)
    .bind(size)
    .bind(ts)
    .bind(ts)
    .execute(pool)
    .await?;

    let file = sqlx::query_as::<_, KbFile>("SELECT * FROM kb_files WHERE path = ?")
        .bind(path)
        .fetch_one(pool)
        .await?;
    Ok(file)
}

pub async fn list_kb_files(pool: &SqlitePool) -> Result<Vec<KbFile>> {
    let rows = sqlx::query_as::<_, KbFile>("SELECT * FROM kb_files ORDER BY id ASC")
        .fetch_all(pool)
        .await?;
    Ok(rows)
}

pub async fn get_kb_file(pool: &SqlitePool, id: i64) -> Result<Option<KbFile>> {
    let row = sqlx::query_as::<_, KbFile>("SELECT * FROM kb_files WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(row)
}

pub async fn update_kb_file_status(pool: &SqlitePool, id: i64, status: &str) -> Result<()> {
    sqlx::query("UPDATE kb_files SET status = ?, updated_at = ? WHERE id = ?")
        .bind(status)
        .bind(now())
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Delete a file record with its chunks in one transaction, then
/// best-effort remove the physical file.
pub async fn delete_kb_file(pool: &SqlitePool, id: i64) -> Result<()> {
    let file = get_kb_file(pool, id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("kb file {id}")))?;

    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM kb_chunks WHERE file_id = ?")
        .bind(id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM kb_files WHERE id = ?")
        .bind(id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;

    let _ = std::fs::remove_file(&file.path);
    Ok(())
}

/// Drop every chunk and file record. Physical files are left in place.
pub async fn reset_knowledge_base(pool: &SqlitePool) -> Result<()> {
    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM kb_chunks").execute(&mut *tx).await?;
    sqlx::query("DELETE FROM kb_files").execute(&mut *tx).await?;
    tx.commit().await?;
    Ok(())
}

// ============ Chunks ============

/// A chunk ready for insertion: content plus an optional encoded vector
/// (empty when embedding was skipped or failed).
#[derive(Debug, Clone)]
pub struct NewChunk {
    pub content: String,
    pub vector: Vec<u8>,
}

pub async fn delete_file_chunks(tx: &mut Transaction<'_, Sqlite>, file_id: i64) -> Result<()> {
    sqlx::query("DELETE FROM kb_chunks WHERE file_id = ?")
        .bind(file_id)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

/// Bulk-insert one batch of chunks inside the caller's transaction.
pub async fn insert_chunk_batch(
    tx: &mut Transaction<'_, Sqlite>,
    file_id: i64,
    batch: &[NewChunk],
) -> Result<()> {
    if batch.is_empty() {
        return Ok(());
    }
    let ts = now();
    let mut qb: QueryBuilder<Sqlite> =
        QueryBuilder::new("INSERT INTO kb_chunks (file_id, content, vector, created_at, updated_at) ");
    qb.push_values(batch, |mut b, chunk| {
        b.push_bind(file_id)
            .push_bind(&chunk.content)
            .push_bind(&chunk.vector)
            .push_bind(ts)
            .push_bind(ts);
    });
    qb.build().execute(&mut **tx).await?;
    Ok(())
}

pub async fn count_file_chunks(pool: &SqlitePool, file_id: i64) -> Result<i64> {
    let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM kb_chunks WHERE file_id = ?")
        .bind(file_id)
        .fetch_one(pool)
        .await?;
    Ok(n)
}

/// Keyword candidate fetch: a disjunctive LIKE over chunk content for the
/// given tokens, in storage order. Returns nothing when no usable token
/// remains.
pub async fn search_chunk_candidates(
    pool: &SqlitePool,
    tokens: &[String],
    limit: i64,
) -> Result<Vec<KbChunk>> {
    if tokens.is_empty() {
        return Ok(Vec::new());
    }
    let limit = if limit <= 0 { 5 } else { limit };

    let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
        "SELECT id, file_id, content, vector, created_at, updated_at FROM kb_chunks WHERE ",
    );
    {
        let mut clauses = qb.separated(" OR ");
        for token in tokens {
            clauses
                .push("content LIKE ")
                .push_bind_unseparated(format!("%{token}%"));
        }
    }
    qb.push(" LIMIT ").push_bind(limit);

    let rows = qb.build_query_as::<KbChunk>().fetch_all(pool).await?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::STATUS_PENDING;
    use crate::{db, migrate};

    async fn test_pool() -> (tempfile::TempDir, SqlitePool) {
        let dir = tempfile::tempdir().unwrap();
        let pool = db::connect(&dir.path().join("store.db")).await.unwrap();
        migrate::run_migrations(&pool).await.unwrap();
        (dir, pool)
    }

    #[tokio::test]
    async fn kb_file_upsert_keeps_id_and_resets_status() {
        let (_dir, pool) = test_pool().await;

        let first = save_kb_file(&pool, "/kb/a.txt", 10, "aaaa").await.unwrap();
        assert_eq!(first.status, STATUS_PENDING);

        update_kb_file_status(&pool, first.id, "processed")
            .await
            .unwrap();

        let second = save_kb_file(&pool, "/kb/a.txt", 12, "bbbb").await.unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(second.checksum, "bbbb");
        assert_eq!(second.size, 12);
        assert_eq!(second.status, STATUS_PENDING);
    }

    #[tokio::test]
    async fn chunk_replace_is_transactional() {
        let (_dir, pool) = test_pool().await;
        let file = save_kb_file(&pool, "/kb/b.txt", 1, "cc").await.unwrap();

        let mut tx = pool.begin().await.unwrap();
        delete_file_chunks(&mut tx, file.id).await.unwrap();
        let batch = vec![
            NewChunk {
                content: "one".into(),
                vector: vec![],
            },
            NewChunk {
                content: "two".into(),
                vector: vec![0, 0, 128, 63],
            },
        ];
        insert_chunk_batch(&mut tx, file.id, &batch).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(count_file_chunks(&pool, file.id).await.unwrap(), 2);

        // A dropped (uncommitted) transaction leaves the old rows intact.
        let mut tx = pool.begin().await.unwrap();
        delete_file_chunks(&mut tx, file.id).await.unwrap();
        drop(tx);
        assert_eq!(count_file_chunks(&pool, file.id).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn file_delete_cascades_to_chunks() {
        let (_dir, pool) = test_pool().await;
        let file = save_kb_file(&pool, "/kb/c.txt", 1, "dd").await.unwrap();

        let mut tx = pool.begin().await.unwrap();
        insert_chunk_batch(
            &mut tx,
            file.id,
            &[NewChunk {
                content: "orphan-check".into(),
                vector: vec![],
            }],
        )
        .await
        .unwrap();
        tx.commit().await.unwrap();

        delete_kb_file(&pool, file.id).await.unwrap();
        assert_eq!(count_file_chunks(&pool, file.id).await.unwrap(), 0);
        assert!(get_kb_file(&pool, file.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn candidate_search_matches_any_token() {
        let (_dir, pool) = test_pool().await;
        let file = save_kb_file(&pool, "/kb/d.txt", 1, "ee").await.unwrap();
        let mut tx = pool.begin().await.unwrap();
        insert_chunk_batch(
            &mut tx,
            file.id,
            &[
                NewChunk {
                    content: "Paris is the capital of France.".into(),
                    vector: vec![],
                },
                NewChunk {
                    content: "Berlin is the capital of Germany.".into(),
                    vector: vec![],
                },
            ],
        )
        .await
        .unwrap();
        tx.commit().await.unwrap();

        let hits = search_chunk_candidates(&pool, &["France".to_string()], 10)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].content.contains("Paris"));

        let hits = search_chunk_candidates(&pool, &["capital".to_string()], 10)
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);

        let none = search_chunk_candidates(&pool, &[], 10).await.unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn retry_rewind_deletes_later_messages() {
        let (_dir, pool) = test_pool().await;
        let conv = create_conversation(&pool, "t").await.unwrap();
        let m1 = save_message(&pool, conv.id, "user", "question").await.unwrap();
        save_message(&pool, conv.id, "assistant", "answer")
            .await
            .unwrap();

        delete_messages_after(&pool, conv.id, m1.id).await.unwrap();
        let history = get_history(&pool, conv.id, 0).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].role, "user");
    }
}
