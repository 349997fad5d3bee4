//! HTTP surface: router, shared state, and the conversation, settings,
//! and knowledge-base handlers. Chat handlers live in [`crate::chat`].
//!
//! All responses are JSON except the token streams. Errors map through
//! [`crate::error::Error`]'s `IntoResponse` into
//! `{ "error": "<message>" }` bodies.

use std::path::Path as FsPath;
use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, Multipart, Path, Query, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Deserialize;
use sqlx::SqlitePool;
use tower_http::cors::{Any, CorsLayer};
use tracing::warn;

use crate::chat;
use crate::engine::EngineHandle;
use crate::error::{Error, Result};
use crate::extract;
use crate::ingest::KnowledgeBase;
use crate::models::{KB_FOLDER_KEY, SYSTEM_PROMPT_KEY};
use crate::search::Retriever;
use crate::store;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub pool: SqlitePool,
    pub engine: EngineHandle,
    pub kb: Arc<KnowledgeBase>,
    pub retriever: Arc<Retriever>,
}

/// Build the full application router.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route(
            "/api/conversations",
            get(list_conversations).post(create_conversation),
        )
        .route("/api/conversations/:id", delete(delete_conversation))
        .route("/api/conversations/:id/messages", get(list_messages))
        .route(
            "/api/conversations/:id/chat",
            post(chat::chat_with_conversation),
        )
        .route(
            "/api/conversations/:id/chat/stream",
            post(chat::chat_stream_with_conversation),
        )
        .route(
            "/api/conversations/:id/retry/stream",
            post(chat::retry_stream),
        )
        .route("/api/kb/sync", post(sync_kb))
        .route("/api/kb/files", get(list_kb_files))
        .route("/api/kb/files/:id", delete(delete_kb_file))
        .route("/api/kb/upload", post(upload_kb_file))
        .route("/api/kb/reset", post(reset_kb))
        .route("/api/kb/progress", get(sync_progress))
        .route("/api/kb/pause", post(pause_sync))
        .route("/api/kb/resume", post(resume_sync))
        .route("/api/kb/cancel", post(cancel_sync))
        .route("/api/kb/download", get(download_kb_file))
        .route("/api/kb/content", get(kb_file_content))
        .route("/api/kb/search/debug", get(debug_search))
        .route(
            "/api/settings/kb-folder",
            get(get_kb_folder).post(set_kb_folder),
        )
        .route(
            "/api/settings/system-prompt",
            get(get_system_prompt).post(set_system_prompt),
        )
        .route("/api/models", get(chat::list_models))
        .route("/api/models/select", post(chat::select_model))
        .route("/v1/chat/completions", post(chat::oai_chat_completions))
        .layer(DefaultBodyLimit::max(256 * 1024 * 1024))
        .layer(cors)
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

// ============ Conversations ============

async fn list_conversations(State(state): State<AppState>) -> Result<Response> {
    let conversations = store::list_conversations(&state.pool, 50).await?;
    Ok(Json(conversations).into_response())
}

#[derive(Deserialize)]
struct CreateConversationRequest {
    #[serde(default)]
    title: String,
}

async fn create_conversation(
    State(state): State<AppState>,
    Json(req): Json<CreateConversationRequest>,
) -> Result<Response> {
    let conversation = store::create_conversation(&state.pool, &req.title).await?;
    Ok(Json(conversation).into_response())
}

async fn delete_conversation(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Response> {
    store::delete_conversation(&state.pool, id).await?;
    Ok(Json(serde_json::json!({ "ok": true })).into_response())
}

async fn list_messages(State(state): State<AppState>, Path(id): Path<i64>) -> Result<Response> {
    let messages = store::get_history(&state.pool, id, 200).await?;
    Ok(Json(messages).into_response())
}

// ============ Settings ============

#[derive(Deserialize)]
struct UpdateSettingRequest {
    value: String,
}

async fn get_kb_folder(State(state): State<AppState>) -> Result<Response> {
    let folder = store::get_kb_folder(&state.pool).await?.unwrap_or_default();
    Ok(Json(serde_json::json!({ "folder": folder })).into_response())
}

async fn set_kb_folder(
    State(state): State<AppState>,
    Json(req): Json<UpdateSettingRequest>,
) -> Result<Response> {
    store::set_setting(&state.pool, KB_FOLDER_KEY, &req.value).await?;
    Ok(Json(serde_json::json!({ "ok": true })).into_response())
}

async fn get_system_prompt(State(state): State<AppState>) -> Result<Response> {
    let prompt = store::get_setting(&state.pool, SYSTEM_PROMPT_KEY)
        .await?
        .unwrap_or_default();
    Ok(Json(serde_json::json!({ "prompt": prompt })).into_response())
}

async fn set_system_prompt(
    State(state): State<AppState>,
    Json(req): Json<UpdateSettingRequest>,
) -> Result<Response> {
    store::set_setting(&state.pool, SYSTEM_PROMPT_KEY, &req.value).await?;
    Ok(Json(serde_json::json!({ "ok": true })).into_response())
}

// ============ Knowledge base ============

/// Scan synchronously, then process in the background: the scan is quick
/// and its errors are worth surfacing; processing can run for minutes.
async fn sync_kb(State(state): State<AppState>) -> Result<Response> {
    state.kb.scan_folder().await?;

    let kb = state.kb.clone();
    tokio::spawn(async move {
        if let Err(err) = kb.process_files().await {
            if !err.is_cancelled() {
                warn!("processing knowledge base files failed: {err}");
            }
        }
    });

    Ok(Json(serde_json::json!({ "ok": true, "message": "Knowledge base sync started" }))
        .into_response())
}

async fn list_kb_files(State(state): State<AppState>) -> Result<Response> {
    let files = store::list_kb_files(&state.pool).await?;
    Ok(Json(files).into_response())
}

async fn delete_kb_file(State(state): State<AppState>, Path(id): Path<i64>) -> Result<Response> {
    if id <= 0 {
        return Err(Error::InvalidInput("invalid file id".to_string()));
    }
    store::delete_kb_file(&state.pool, id).await?;
    Ok(Json(serde_json::json!({ "ok": true })).into_response())
}

async fn reset_kb(State(state): State<AppState>) -> Result<Response> {
    store::reset_knowledge_base(&state.pool).await?;
    Ok(
        Json(serde_json::json!({ "ok": true, "message": "Knowledge base reset successfully" }))
            .into_response(),
    )
}

async fn sync_progress(State(state): State<AppState>) -> Response {
    Json(state.kb.sync_progress()).into_response()
}

async fn pause_sync(State(state): State<AppState>) -> Response {
    state.kb.pause_sync();
    Json(serde_json::json!({ "ok": true })).into_response()
}

async fn resume_sync(State(state): State<AppState>) -> Response {
    state.kb.resume_sync();
    Json(serde_json::json!({ "ok": true })).into_response()
}

async fn cancel_sync(State(state): State<AppState>) -> Response {
    state.kb.cancel_sync();
    Json(serde_json::json!({ "ok": true })).into_response()
}

async fn upload_kb_file(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Response> {
    let folder = state_kb_folder(&state.pool).await?;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| Error::InvalidInput(format!("multipart: {e}")))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let filename = field
            .file_name()
            .map(sanitize_filename)
            .filter(|n| !n.is_empty())
            .ok_or_else(|| Error::InvalidInput("file name is required".to_string()))?;
        let data = field
            .bytes()
            .await
            .map_err(|e| Error::InvalidInput(format!("multipart: {e}")))?;

        std::fs::create_dir_all(&folder)?;
        let dst = FsPath::new(&folder).join(&filename);
        std::fs::write(&dst, &data)?;

        state.kb.add_file(&dst).await?;
        return Ok(
            Json(serde_json::json!({ "ok": true, "path": dst.to_string_lossy() }))
                .into_response(),
        );
    }

    Err(Error::InvalidInput("no file uploaded".to_string()))
}

#[derive(Deserialize)]
struct FileQuery {
    file: String,
}

async fn download_kb_file(
    State(state): State<AppState>,
    Query(query): Query<FileQuery>,
) -> Result<Response> {
    let path = resolve_kb_path(&state.pool, &query.file).await?;
    let bytes = tokio::fs::read(&path).await?;
    let disposition = format!(
        "attachment; filename=\"{}\"",
        path.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    );
    Ok((
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        bytes,
    )
        .into_response())
}

/// Extracted-text preview of a knowledge-base file.
async fn kb_file_content(
    State(state): State<AppState>,
    Query(query): Query<FileQuery>,
) -> Result<Response> {
    let path = resolve_kb_path(&state.pool, &query.file).await?;
    let content = tokio::task::spawn_blocking(move || extract::file_content(&path))
        .await
        .map_err(|e| Error::Transient(format!("extract task failed: {e}")))??;
    Ok(Json(serde_json::json!({ "content": content })).into_response())
}

#[derive(Deserialize)]
struct DebugSearchQuery {
    #[serde(default)]
    q: String,
    limit: Option<usize>,
}

async fn debug_search(
    State(state): State<AppState>,
    Query(query): Query<DebugSearchQuery>,
) -> Result<Response> {
    let result = state
        .retriever
        .debug_search(&query.q, query.limit.unwrap_or(10))
        .await?;
    Ok(Json(result).into_response())
}

// ============ Helpers ============

async fn state_kb_folder(pool: &SqlitePool) -> Result<String> {
    store::get_kb_folder(pool)
        .await?
        .filter(|f| !f.trim().is_empty())
        .ok_or_else(|| Error::InvalidInput("knowledge base folder not set".to_string()))
}

/// Only the basename is honored; path components are dropped to keep
/// reads inside the knowledge-base folder.
fn sanitize_filename(name: &str) -> String {
    FsPath::new(name)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

async fn resolve_kb_path(pool: &SqlitePool, file: &str) -> Result<std::path::PathBuf> {
    if file.trim().is_empty() {
        return Err(Error::InvalidInput("file parameter is required".to_string()));
    }
    let folder = state_kb_folder(pool).await?;
    let clean = sanitize_filename(file);
    let path = FsPath::new(&folder).join(&clean);
    if !path.exists() {
        return Err(Error::NotFound(format!("file: {clean}")));
    }
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filenames_are_reduced_to_basenames() {
        assert_eq!(sanitize_filename("report.pdf"), "report.pdf");
        assert_eq!(sanitize_filename("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_filename("a/b/c.txt"), "c.txt");
    }
}
