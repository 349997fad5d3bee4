//! Chat endpoints: conversation-scoped plain and streaming chat, retry,
//! and the OpenAI-compatible completions surface.
//!
//! Ordering within one conversation: the user message is persisted
//! before the engine runs, the assistant message after the stream
//! completes, and the title pass after that. Streaming handlers return
//! the response immediately; persistence rides on the stream's
//! completion handle.

use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::engine::ChatOptions;
use crate::error::{Error, Result};
use crate::models::ChatMessage;
use crate::prompt;
use crate::server::AppState;
use crate::store;
use crate::stream::{stream_plain_tokens, stream_sse_tokens, SseMeta, StreamOptions, TokenProducer};
use crate::title;

#[derive(Deserialize)]
pub struct ChatRequest {
    pub message: String,
}

#[derive(Serialize)]
pub struct ChatResponse {
    pub response: String,
}

/// POST /api/conversations/:id/chat
pub async fn chat_with_conversation(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<ChatRequest>,
) -> Result<Json<ChatResponse>> {
    validate_chat(id, &req)?;

    store::save_message(&state.pool, id, "user", &req.message).await?;
    title::ensure_fallback_title(&state.pool, id, &req.message).await;

    let messages = store::get_history(&state.pool, id, 200).await?;
    let history =
        prompt::build_history_with_kb(&state.pool, &state.retriever, &messages, 20, &req.message)
            .await;

    let reply = state
        .engine
        .with_locked(move |e| e.chat(&history))
        .await?;

    store::save_message(&state.pool, id, "assistant", &reply).await?;
    title::try_generate_smart_title(&state.pool, &state.engine, id).await;

    Ok(Json(ChatResponse { response: reply }))
}

/// POST /api/conversations/:id/chat/stream
pub async fn chat_stream_with_conversation(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<ChatRequest>,
) -> Result<Response> {
    validate_chat(id, &req)?;

    store::save_message(&state.pool, id, "user", &req.message).await?;
    title::ensure_fallback_title(&state.pool, id, &req.message).await;

    let messages = store::get_history(&state.pool, id, 200).await?;
    let history =
        prompt::build_history_with_kb(&state.pool, &state.retriever, &messages, 10, &req.message)
            .await;

    Ok(run_chat_stream(state, id, history))
}

/// POST /api/conversations/:id/retry/stream
///
/// Rewinds to the last user turn, then regenerates.
pub async fn retry_stream(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Response> {
    if id <= 0 {
        return Err(Error::InvalidInput("invalid conversation id".to_string()));
    }
    let last_user = store::get_last_user_message(&state.pool, id)
        .await?
        .ok_or_else(|| Error::InvalidInput("no user message".to_string()))?;
    store::delete_messages_after(&state.pool, id, last_user.id).await?;

    let messages = store::get_history(&state.pool, id, 200).await?;
    let history =
        prompt::build_retry_history_with_kb(&state.pool, &state.retriever, &messages, 5).await;
    debug!("retry history: {} turns", history.len());

    Ok(run_chat_stream(state, id, history))
}

/// Start the producer/writer pair and arrange for persistence once the
/// stream finishes.
fn run_chat_stream(state: AppState, conversation_id: i64, history: Vec<ChatMessage>) -> Response {
    let engine = state.engine.clone();
    let produce: TokenProducer =
        Box::new(move |emit| engine.lock_sync(|e| e.chat_stream(&history, emit)));

    let stream = stream_plain_tokens(produce, StreamOptions::default());
    let completion = stream.completion;

    tokio::spawn(async move {
        match completion.await {
            Ok((text, Ok(()))) => {
                if let Err(err) =
                    store::save_message(&state.pool, conversation_id, "assistant", &text).await
                {
                    warn!("persisting assistant message failed: {err}");
                }
                title::try_generate_smart_title(&state.pool, &state.engine, conversation_id).await;
            }
            Ok((_, Err(err))) if err.is_cancelled() => {
                debug!("stream cancelled for conversation {conversation_id}");
            }
            Ok((_, Err(err))) => warn!("stream for conversation {conversation_id} failed: {err}"),
            Err(err) => warn!("stream task for conversation {conversation_id} failed: {err}"),
        }
    });

    stream.response
}

fn validate_chat(id: i64, req: &ChatRequest) -> Result<()> {
    if id <= 0 {
        return Err(Error::InvalidInput("invalid conversation id".to_string()));
    }
    if req.message.trim().is_empty() {
        return Err(Error::InvalidInput("message is required".to_string()));
    }
    Ok(())
}

// ============ OpenAI-compatible surface ============

#[derive(Deserialize)]
pub struct OaiChatRequest {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub stream: bool,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub max_tokens: Option<u32>,
    /// Either a string or an array of strings.
    pub stop: Option<serde_json::Value>,
}

/// POST /v1/chat/completions
pub async fn oai_chat_completions(
    State(state): State<AppState>,
    Json(req): Json<OaiChatRequest>,
) -> Result<Response> {
    if req.messages.is_empty() {
        return Err(Error::InvalidInput("messages is required".to_string()));
    }

    let model_name = req
        .model
        .clone()
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| "local-llama.cpp".to_string());

    let mut opts = ChatOptions::default();
    if let Some(max_tokens) = req.max_tokens.filter(|&n| n > 0) {
        opts.max_tokens = max_tokens;
    }
    if let Some(temperature) = req.temperature {
        opts.temperature = temperature;
    }
    if let Some(top_p) = req.top_p {
        opts.top_p = top_p;
    }
    opts.stop = parse_stops(req.stop.as_ref());

    let now = chrono::Utc::now();
    let id = format!("chatcmpl-{}", now.timestamp_nanos_opt().unwrap_or_default());
    let created = now.timestamp();

    if req.stream {
        let engine = state.engine.clone();
        let messages = req.messages;
        let produce: TokenProducer = Box::new(move |emit| {
            engine.lock_sync(|e| e.chat_stream_with_options(&messages, &opts, emit))
        });
        let stream = stream_sse_tokens(
            produce,
            SseMeta {
                id,
                created,
                model: model_name,
            },
        );
        let completion = stream.completion;
        tokio::spawn(async move {
            if let Ok((_, Err(err))) = completion.await {
                if !err.is_cancelled() {
                    warn!("completions stream failed: {err}");
                }
            }
        });
        return Ok(stream.response);
    }

    let messages = req.messages;
    let reply = state
        .engine
        .with_locked(move |e| e.chat_with_options(&messages, &opts))
        .await?;

    let body = serde_json::json!({
        "id": id,
        "object": "chat.completion",
        "created": created,
        "model": model_name,
        "choices": [{
            "index": 0,
            "message": { "role": "assistant", "content": reply },
            "finish_reason": "stop",
        }],
    });
    Ok(Json(body).into_response())
}

fn parse_stops(value: Option<&serde_json::Value>) -> Vec<String> {
    match value {
        Some(serde_json::Value::String(s)) => vec![s.clone()],
        Some(serde_json::Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    }
}

// ============ Model management ============

#[derive(Serialize)]
pub struct ModelsResponse {
    pub current_model: String,
    pub models: Vec<String>,
}

/// GET /api/models
pub async fn list_models(State(state): State<AppState>) -> Result<Json<ModelsResponse>> {
    let (models, current_path) = state
        .engine
        .with_locked(|e| Ok((e.list_models()?, e.model_path())))
        .await?;

    let current_model = std::path::Path::new(&current_path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    Ok(Json(ModelsResponse {
        current_model,
        models,
    }))
}

#[derive(Deserialize)]
pub struct SelectModelRequest {
    pub model: String,
}

/// POST /api/models/select
pub async fn select_model(
    State(state): State<AppState>,
    Json(req): Json<SelectModelRequest>,
) -> Result<Json<serde_json::Value>> {
    if req.model.trim().is_empty() {
        return Err(Error::InvalidInput("model is required".to_string()));
    }
    let model = req.model.clone();
    state
        .engine
        .with_locked(move |e| e.switch_model(&model))
        .await?;
    Ok(Json(
        serde_json::json!({ "status": "success", "model": req.model }),
    ))
}
