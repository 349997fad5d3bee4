//! Streaming response coordination.
//!
//! Token generation runs under the engine mutex on a blocking thread;
//! network writes must not. The producer's yield callback only enqueues
//! into a bounded channel, and a writer task owns the response body,
//! coalescing tokens and flushing when the buffer reaches 2048 bytes, a
//! 40 ms tick fires, or the channel closes. A failed body write (client
//! disconnect) raises a stop flag the producer observes before the next
//! token, ending generation cooperatively.
//!
//! Error protocol: `ERROR: <msg>` is written only when zero bytes have
//! reached the wire; after partial output, errors are swallowed — the
//! bytes are already sent. An empty, uncancelled stream produces a
//! diagnostic error so "model said nothing" is visible to the client.

use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::Response;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;

use crate::error::{Error, Result};

const TOKEN_CHANNEL_CAPACITY: usize = 256;
const MAX_BUFFERED_BYTES: usize = 2048;
const FLUSH_INTERVAL: Duration = Duration::from_millis(40);

/// Token generation callback. Runs on a blocking thread, typically under
/// the engine mutex; the yield function must stay I/O-free.
pub type TokenProducer =
    Box<dyn FnOnce(&mut dyn FnMut(&str) -> bool) -> Result<()> + Send + 'static>;

pub struct StreamOptions {
    pub content_type: &'static str,
    pub cache_control: &'static str,
    pub error_prefix: &'static str,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            content_type: "text/plain; charset=utf-8",
            cache_control: "no-cache",
            error_prefix: "ERROR: ",
        }
    }
}

/// A streaming response plus a completion handle resolving to the full
/// accumulated text once the producer finishes. Callers persist the
/// assistant message from the completion, after the stream ends.
pub struct TokenStream {
    pub response: Response,
    pub completion: JoinHandle<(String, Result<()>)>,
}

/// Stream plain-text tokens produced by `produce` to the client.
pub fn stream_plain_tokens(produce: TokenProducer, opts: StreamOptions) -> TokenStream {
    let (token_tx, token_rx) = mpsc::channel::<String>(TOKEN_CHANNEL_CAPACITY);
    let (body_tx, body_rx) = mpsc::channel::<std::result::Result<Bytes, Infallible>>(16);
    let stop = Arc::new(AtomicBool::new(false));

    tokio::spawn(plain_writer(token_rx, body_tx, stop.clone()));
    let completion = spawn_producer(produce, token_tx, stop, opts.error_prefix);

    TokenStream {
        response: stream_response(body_rx, &opts),
        completion,
    }
}

fn stream_response(
    body_rx: mpsc::Receiver<std::result::Result<Bytes, Infallible>>,
    opts: &StreamOptions,
) -> Response {
    let mut response = Response::new(Body::from_stream(ReceiverStream::new(body_rx)));
    *response.status_mut() = StatusCode::OK;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(opts.content_type),
    );
    response.headers_mut().insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static(opts.cache_control),
    );
    response
}

/// Drain tokens into a buffer and flush on size, tick, or close.
async fn plain_writer(
    mut token_rx: mpsc::Receiver<String>,
    body_tx: mpsc::Sender<std::result::Result<Bytes, Infallible>>,
    stop: Arc<AtomicBool>,
) {
    let mut buf = String::new();
    let mut ticker = tokio::time::interval(FLUSH_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if !flush(&mut buf, &body_tx, &stop).await {
                    return;
                }
            }
            token = token_rx.recv() => match token {
                Some(token) => {
                    buf.push_str(&token);
                    if buf.len() >= MAX_BUFFERED_BYTES && !flush(&mut buf, &body_tx, &stop).await {
                        return;
                    }
                }
                None => {
                    let _ = flush(&mut buf, &body_tx, &stop).await;
                    return;
                }
            },
        }
    }
}

async fn flush(
    buf: &mut String,
    body_tx: &mpsc::Sender<std::result::Result<Bytes, Infallible>>,
    stop: &AtomicBool,
) -> bool {
    if buf.is_empty() {
        return true;
    }
    let bytes = Bytes::from(std::mem::take(buf).into_bytes());
    if body_tx.send(Ok(bytes)).await.is_err() {
        // Receiver dropped: the client is gone.
        stop.store(true, Ordering::Relaxed);
        return false;
    }
    true
}

fn spawn_producer(
    produce: TokenProducer,
    token_tx: mpsc::Sender<String>,
    stop: Arc<AtomicBool>,
    error_prefix: &'static str,
) -> JoinHandle<(String, Result<()>)> {
    tokio::task::spawn_blocking(move || {
        let mut out = String::new();
        let result = produce(&mut |token: &str| {
            if stop.load(Ordering::Relaxed) {
                return false;
            }
            if token.is_empty() {
                return true;
            }
            out.push_str(token);
            // A failed send means the writer exited (client disconnect).
            token_tx.blocking_send(token.to_string()).is_ok()
        });

        let disconnected = stop.load(Ordering::Relaxed);
        let final_result = match result {
            Err(err) => {
                if out.is_empty() && !disconnected {
                    let _ = token_tx.blocking_send(format!("{error_prefix}{err}"));
                }
                Err(err)
            }
            Ok(()) if disconnected => Err(Error::Cancelled),
            Ok(()) if out.is_empty() => {
                let msg = "Model produced no output (check logs for details)";
                let _ = token_tx.blocking_send(format!("{error_prefix}{msg}"));
                Err(Error::Transient(msg.to_string()))
            }
            Ok(()) => Ok(()),
        };
        (out, final_result)
    })
}

// ============ OpenAI-compatible SSE ============

/// Identifiers carried in every SSE chunk of one completion.
pub struct SseMeta {
    pub id: String,
    pub created: i64,
    pub model: String,
}

/// Stream tokens as OpenAI `chat.completion.chunk` events: a role chunk
/// first, coalesced content deltas, a `finish_reason: "stop"` chunk, and
/// the `[DONE]` sentinel. Coalescing uses the same 2048-byte / 40 ms
/// policy as the plain stream.
pub fn stream_sse_tokens(produce: TokenProducer, meta: SseMeta) -> TokenStream {
    let (token_tx, token_rx) = mpsc::channel::<String>(TOKEN_CHANNEL_CAPACITY);
    let (body_tx, body_rx) = mpsc::channel::<std::result::Result<Bytes, Infallible>>(16);
    let stop = Arc::new(AtomicBool::new(false));

    tokio::spawn(sse_writer(token_rx, body_tx, stop.clone(), meta));
    // SSE clients receive errors through the terminating [DONE]; no
    // inline ERROR text.
    let completion = spawn_producer(produce, token_tx, stop, "");

    let mut response = Response::new(Body::from_stream(ReceiverStream::new(body_rx)));
    *response.status_mut() = StatusCode::OK;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/event-stream"),
    );
    response
        .headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    response
        .headers_mut()
        .insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));

    TokenStream {
        response,
        completion,
    }
}

async fn sse_writer(
    mut token_rx: mpsc::Receiver<String>,
    body_tx: mpsc::Sender<std::result::Result<Bytes, Infallible>>,
    stop: Arc<AtomicBool>,
    meta: SseMeta,
) {
    let role_chunk = json!({
        "id": meta.id,
        "object": "chat.completion.chunk",
        "created": meta.created,
        "model": meta.model,
        "choices": [{ "index": 0, "delta": { "role": "assistant" }, "finish_reason": null }],
    });
    if !send_frame(&body_tx, &stop, sse_frame(&role_chunk)).await {
        return;
    }

    let content_chunk = |content: &str| {
        json!({
            "id": meta.id,
            "object": "chat.completion.chunk",
            "created": meta.created,
            "model": meta.model,
            "choices": [{ "index": 0, "delta": { "content": content }, "finish_reason": null }],
        })
    };

    let mut pending = String::new();
    let mut ticker = tokio::time::interval(FLUSH_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if !pending.is_empty() {
                    let frame = sse_frame(&content_chunk(&pending));
                    pending.clear();
                    if !send_frame(&body_tx, &stop, frame).await {
                        return;
                    }
                }
            }
            token = token_rx.recv() => match token {
                Some(token) => {
                    pending.push_str(&token);
                    if pending.len() >= MAX_BUFFERED_BYTES {
                        let frame = sse_frame(&content_chunk(&pending));
                        pending.clear();
                        if !send_frame(&body_tx, &stop, frame).await {
                            return;
                        }
                    }
                }
                None => {
                    if !pending.is_empty() {
                        let frame = sse_frame(&content_chunk(&pending));
                        pending.clear();
                        if !send_frame(&body_tx, &stop, frame).await {
                            return;
                        }
                    }
                    let final_chunk = json!({
                        "id": meta.id,
                        "object": "chat.completion.chunk",
                        "created": meta.created,
                        "model": meta.model,
                        "choices": [{ "index": 0, "delta": {}, "finish_reason": "stop" }],
                    });
                    if !send_frame(&body_tx, &stop, sse_frame(&final_chunk)).await {
                        return;
                    }
                    let _ = send_frame(&body_tx, &stop, Bytes::from_static(b"data: [DONE]\n\n"))
                        .await;
                    return;
                }
            },
        }
    }
}

fn sse_frame(value: &serde_json::Value) -> Bytes {
    Bytes::from(format!("data: {value}\n\n"))
}

async fn send_frame(
    body_tx: &mpsc::Sender<std::result::Result<Bytes, Infallible>>,
    stop: &AtomicBool,
    frame: Bytes,
) -> bool {
    if body_tx.send(Ok(frame)).await.is_err() {
        stop.store(true, Ordering::Relaxed);
        return false;
    }
    true
}
