//! Language-model engine abstraction.
//!
//! The model binding is not safe for concurrent use, so every call goes
//! through an injected [`EngineHandle`] carrying a process-wide mutex.
//! Chat, streaming, embedding, and model switching all contend on the
//! same lock; callers run engine work on blocking threads via
//! [`EngineHandle::with_locked`] so the async executor is never stalled.
//!
//! Two implementations are provided:
//! - [`HttpEngine`] — an OpenAI-compatible client for a local
//!   `llama-server` / Ollama style endpoint.
//! - [`MockEngine`] — deterministic scripted engine for tests.
//!
//! This module also owns the vector codecs: embeddings are persisted as
//! little-endian f32 byte blobs.

use std::io::{BufRead, BufReader};
use std::sync::{Arc, Mutex};

use md5::{Digest, Md5};
use serde_json::json;

use crate::error::{Error, Result};
use crate::models::ChatMessage;

/// Sampling parameters for the OpenAI-compatible surface.
#[derive(Debug, Clone)]
pub struct ChatOptions {
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: u32,
    pub repeat_penalty: f32,
    pub stop: Vec<String>,
}

impl Default for ChatOptions {
    fn default() -> Self {
        Self {
            max_tokens: 512,
            temperature: 0.7,
            top_p: 0.95,
            top_k: 40,
            repeat_penalty: 1.1,
            stop: Vec::new(),
        }
    }
}

/// The opaque model capability.
///
/// `chat_stream` drives the token callback until generation ends or the
/// callback returns `false`; the callback must not perform network I/O —
/// it only hands the token to the stream coordinator.
pub trait Engine: Send {
    fn chat(&mut self, history: &[ChatMessage]) -> Result<String>;

    fn chat_stream(
        &mut self,
        history: &[ChatMessage],
        on_token: &mut dyn FnMut(&str) -> bool,
    ) -> Result<()>;

    fn embed(&mut self, text: &str) -> Result<Vec<f32>>;

    /// Identifier of the active model; recorded as the knowledge base's
    /// embedding model at ingest time.
    fn model_path(&self) -> String;

    fn switch_model(&mut self, model: &str) -> Result<()>;

    fn list_models(&self) -> Result<Vec<String>>;

    /// Release model resources. Called once at shutdown, under the same
    /// mutex as every other engine operation.
    fn close(&mut self) {}

    fn chat_with_options(
        &mut self,
        history: &[ChatMessage],
        _opts: &ChatOptions,
    ) -> Result<String> {
        self.chat(history)
    }

    fn chat_stream_with_options(
        &mut self,
        history: &[ChatMessage],
        _opts: &ChatOptions,
        on_token: &mut dyn FnMut(&str) -> bool,
    ) -> Result<()> {
        self.chat_stream(history, on_token)
    }
}

/// Cloneable handle owning the engine serialization mutex.
#[derive(Clone)]
pub struct EngineHandle {
    inner: Arc<Mutex<Box<dyn Engine>>>,
}

impl EngineHandle {
    pub fn new(engine: Box<dyn Engine>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(engine)),
        }
    }

    /// Run `f` with the engine locked, on the current thread. Intended
    /// for code already executing on a blocking thread.
    pub fn lock_sync<T>(&self, f: impl FnOnce(&mut dyn Engine) -> Result<T>) -> Result<T> {
        let mut guard = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(guard.as_mut())
    }

    /// Run `f` with the engine locked on a blocking thread and await the
    /// result. Serializes all engine access process-wide.
    pub async fn with_locked<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut dyn Engine) -> Result<T> + Send + 'static,
    {
        let handle = self.clone();
        tokio::task::spawn_blocking(move || handle.lock_sync(f))
            .await
            .map_err(|e| Error::Transient(format!("engine task failed: {e}")))?
    }

    /// Identifier of the active model, trimmed.
    pub async fn model_path(&self) -> Result<String> {
        self.with_locked(|e| Ok(e.model_path().trim().to_string()))
            .await
    }
}

// ============ Vector codecs ============

/// Encode a float vector as little-endian f32 bytes (`len × 4`).
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode little-endian f32 bytes back into a float vector. A trailing
/// partial word is ignored.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Cosine similarity between two vectors. Returns `0.0` for mismatched
/// lengths, empty inputs, or a zero norm on either side.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Lowercase hex MD5 of a text, used as the embedding-cache key.
pub fn content_hash(text: &str) -> String {
    format!("{:x}", Md5::digest(text.as_bytes()))
}

// ============ HTTP engine ============

/// OpenAI-compatible engine client (llama.cpp `llama-server`, Ollama).
///
/// The `model` string is sent with every request and doubles as the
/// identifier recorded in the `kb_embedding_model` setting.
pub struct HttpEngine {
    client: reqwest::blocking::Client,
    base_url: String,
    model: String,
}

impl HttpEngine {
    /// Build a client for `base_url` (e.g. `http://127.0.0.1:8080/v1`).
    ///
    /// Constructs a blocking HTTP client; call from a blocking thread,
    /// not from inside the async runtime.
    pub fn new(base_url: &str, model: &str) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(10))
            .build()
            .map_err(|e| Error::Transient(format!("http client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
        })
    }

    fn chat_body(&self, history: &[ChatMessage], opts: Option<&ChatOptions>, stream: bool) -> serde_json::Value {
        let mut body = json!({
            "model": self.model,
            "messages": history,
            "stream": stream,
        });
        if let Some(opts) = opts {
            body["max_tokens"] = json!(opts.max_tokens);
            body["temperature"] = json!(opts.temperature);
            body["top_p"] = json!(opts.top_p);
            if !opts.stop.is_empty() {
                body["stop"] = json!(opts.stop);
            }
        }
        body
    }

    fn post_chat(&self, history: &[ChatMessage], opts: Option<&ChatOptions>) -> Result<String> {
        let resp = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .timeout(std::time::Duration::from_secs(300))
            .json(&self.chat_body(history, opts, false))
            .send()
            .map_err(|e| Error::Transient(format!("engine request: {e}")))?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().unwrap_or_default();
            return Err(Error::Transient(format!("engine returned {status}: {text}")));
        }
        let value: serde_json::Value = resp
            .json()
            .map_err(|e| Error::Transient(format!("engine response: {e}")))?;
        let content = value["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        Ok(content)
    }

    fn stream_chat(
        &self,
        history: &[ChatMessage],
        opts: Option<&ChatOptions>,
        on_token: &mut dyn FnMut(&str) -> bool,
    ) -> Result<()> {
        let resp = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .json(&self.chat_body(history, opts, true))
            .send()
            .map_err(|e| Error::Transient(format!("engine request: {e}")))?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().unwrap_or_default();
            return Err(Error::Transient(format!("engine returned {status}: {text}")));
        }

        let reader = BufReader::new(resp);
        for line in reader.lines() {
            let line = line.map_err(|e| Error::Transient(format!("engine stream: {e}")))?;
            let Some(data) = line.strip_prefix("data: ") else {
                continue;
            };
            if data.trim() == "[DONE]" {
                break;
            }
            let Ok(value) = serde_json::from_str::<serde_json::Value>(data) else {
                continue;
            };
            if let Some(token) = value["choices"][0]["delta"]["content"].as_str() {
                if !on_token(token) {
                    // Dropping the response closes the connection and
                    // stops generation server-side.
                    break;
                }
            }
        }
        Ok(())
    }
}

impl Engine for HttpEngine {
    fn chat(&mut self, history: &[ChatMessage]) -> Result<String> {
        self.post_chat(history, None)
    }

    fn chat_stream(
        &mut self,
        history: &[ChatMessage],
        on_token: &mut dyn FnMut(&str) -> bool,
    ) -> Result<()> {
        self.stream_chat(history, None, on_token)
    }

    fn embed(&mut self, text: &str) -> Result<Vec<f32>> {
        let resp = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .timeout(std::time::Duration::from_secs(120))
            .json(&json!({ "model": self.model, "input": [text] }))
            .send()
            .map_err(|e| Error::Transient(format!("embedding request: {e}")))?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().unwrap_or_default();
            return Err(Error::Transient(format!(
                "embedding returned {status}: {text}"
            )));
        }
        let value: serde_json::Value = resp
            .json()
            .map_err(|e| Error::Transient(format!("embedding response: {e}")))?;
        let embedding = value["data"][0]["embedding"]
            .as_array()
            .ok_or_else(|| Error::Transient("embedding response missing data".to_string()))?
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();
        Ok(embedding)
    }

    fn model_path(&self) -> String {
        self.model.clone()
    }

    fn switch_model(&mut self, model: &str) -> Result<()> {
        if model.trim().is_empty() {
            return Err(Error::InvalidInput("model must not be empty".to_string()));
        }
        self.model = model.trim().to_string();
        Ok(())
    }

    fn list_models(&self) -> Result<Vec<String>> {
        let resp = self
            .client
            .get(format!("{}/models", self.base_url))
            .timeout(std::time::Duration::from_secs(30))
            .send()
            .map_err(|e| Error::Transient(format!("models request: {e}")))?;
        let value: serde_json::Value = resp
            .json()
            .map_err(|e| Error::Transient(format!("models response: {e}")))?;
        let models = value["data"]
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(|m| m["id"].as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        Ok(models)
    }

    fn chat_with_options(&mut self, history: &[ChatMessage], opts: &ChatOptions) -> Result<String> {
        self.post_chat(history, Some(opts))
    }

    fn chat_stream_with_options(
        &mut self,
        history: &[ChatMessage],
        opts: &ChatOptions,
        on_token: &mut dyn FnMut(&str) -> bool,
    ) -> Result<()> {
        self.stream_chat(history, Some(opts), on_token)
    }
}

// ============ Mock engine ============

/// Deterministic engine for tests: canned replies streamed word-by-word
/// and hash-derived embeddings of a fixed dimension. Failure injection
/// covers the degraded paths (keyword-only retrieval, stream errors).
pub struct MockEngine {
    model: String,
    reply: String,
    dims: usize,
    fail_embed: bool,
    chat_error: Option<String>,
}

impl MockEngine {
    pub fn new(model: &str) -> Self {
        Self {
            model: model.to_string(),
            reply: "好的，我已经收到你的问题。".to_string(),
            dims: 8,
            fail_embed: false,
            chat_error: None,
        }
    }

    pub fn with_reply(mut self, reply: &str) -> Self {
        self.reply = reply.to_string();
        self
    }

    pub fn with_embedding_failure(mut self) -> Self {
        self.fail_embed = true;
        self
    }

    pub fn with_chat_error(mut self, message: &str) -> Self {
        self.chat_error = Some(message.to_string());
        self
    }
}

impl Engine for MockEngine {
    fn chat(&mut self, _history: &[ChatMessage]) -> Result<String> {
        if let Some(msg) = &self.chat_error {
            return Err(Error::Transient(msg.clone()));
        }
        Ok(self.reply.clone())
    }

    fn chat_stream(
        &mut self,
        _history: &[ChatMessage],
        on_token: &mut dyn FnMut(&str) -> bool,
    ) -> Result<()> {
        if let Some(msg) = &self.chat_error {
            return Err(Error::Transient(msg.clone()));
        }
        for token in self.reply.split_inclusive(' ') {
            if !on_token(token) {
                break;
            }
        }
        Ok(())
    }

    fn embed(&mut self, text: &str) -> Result<Vec<f32>> {
        if self.fail_embed {
            return Err(Error::Transient("embedding unavailable".to_string()));
        }
        let digest = Md5::digest(text.as_bytes());
        let vec = (0..self.dims)
            .map(|i| digest[i % digest.len()] as f32 / 255.0 - 0.5)
            .collect();
        Ok(vec)
    }

    fn model_path(&self) -> String {
        self.model.clone()
    }

    fn switch_model(&mut self, model: &str) -> Result<()> {
        self.model = model.to_string();
        Ok(())
    }

    fn list_models(&self) -> Result<Vec<String>> {
        Ok(vec![self.model.clone()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blob_roundtrip() {
        let vec = vec![1.0f32, -2.5, 3.125, 0.0, -0.001];
        let blob = vec_to_blob(&vec);
        assert_eq!(blob.len(), vec.len() * 4);
        assert_eq!(blob_to_vec(&blob), vec);
    }

    #[test]
    fn blob_decode_ignores_trailing_partial_word() {
        let mut blob = vec_to_blob(&[1.0, 2.0]);
        blob.push(0xAB);
        assert_eq!(blob_to_vec(&blob), vec![1.0, 2.0]);
    }

    #[test]
    fn cosine_basics() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);

        let a = vec![1.0, 0.0];
        let b = vec![0.0, 1.0];
        assert!(cosine_similarity(&a, &b).abs() < 1e-6);

        // Symmetric.
        let c = vec![0.3, -0.7];
        assert_eq!(cosine_similarity(&a, &c), cosine_similarity(&c, &a));
    }

    #[test]
    fn cosine_zero_norm_and_mismatch() {
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
    }

    #[test]
    fn mock_engine_is_deterministic() {
        let mut engine = MockEngine::new("mock-model");
        let a = engine.embed("同一段文本").unwrap();
        let b = engine.embed("同一段文本").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 8);
    }

    #[test]
    fn mock_engine_streams_full_reply() {
        let mut engine = MockEngine::new("mock-model").with_reply("one two three");
        let mut out = String::new();
        engine
            .chat_stream(&[], &mut |t| {
                out.push_str(t);
                true
            })
            .unwrap();
        assert_eq!(out, "one two three");
    }

    #[test]
    fn mock_engine_stops_on_false() {
        let mut engine = MockEngine::new("mock-model").with_reply("one two three");
        let mut count = 0;
        engine
            .chat_stream(&[], &mut |_| {
                count += 1;
                false
            })
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn handle_serializes_access() {
        let handle = EngineHandle::new(Box::new(MockEngine::new("m")));
        let path = handle.model_path().await.unwrap();
        assert_eq!(path, "m");

        let reply = handle
            .with_locked(|e| e.chat(&[ChatMessage::new("user", "hi")]))
            .await
            .unwrap();
        assert!(!reply.is_empty());
    }
}
