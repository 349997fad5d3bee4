//! Prompt assembly: file attachments plus retrieved context spliced into
//! the latest user turn.
//!
//! The attachment pattern is exactly what the chat UI emits —
//! `[<label>](/api/kb/download?file=<urlencoded>)` with a bracket-free
//! label — and is not generalized. Filename resolution order matters:
//! first a basename match against registered files, then a join with the
//! configured folder.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use sqlx::SqlitePool;
use tracing::{debug, info, warn};

use crate::extract;
use crate::models::{ChatMessage, Message};
use crate::search::Retriever;
use crate::store;

const KB_PROMPT_HEADER: &str = "你是一个本地知识库助手。请仅基于提供的上下文回答问题。\n\n";
/// Attachment text cap, in runes (newlines preserved).
const MAX_ATTACHMENT_RUNES: usize = 10_000;
/// Aggregate retrieved-context budget, in runes.
const MAX_KB_RUNES: usize = 2000;
const RAG_TOP_K: usize = 5;

fn attachment_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\[([^\[\]]+)\]\(/api/kb/download\?file=([^)]+)\)")
            .expect("attachment pattern is valid")
    })
}

/// Last `tail` stored messages as engine turns.
pub fn build_history(messages: &[Message], tail: usize) -> Vec<ChatMessage> {
    let start = messages.len().saturating_sub(tail);
    messages[start..]
        .iter()
        .map(|m| ChatMessage::new(m.role.clone(), m.content.clone()))
        .collect()
}

/// History with knowledge-base context spliced into the latest user turn
/// and the stored system instruction up front.
pub async fn build_history_with_kb(
    pool: &SqlitePool,
    retriever: &Retriever,
    messages: &[Message],
    tail: usize,
    seed: &str,
) -> Vec<ChatMessage> {
    let history = build_history(messages, tail);
    let history = augment_history_with_kb(pool, retriever, history, seed).await;
    with_system_prompt(pool, history).await
}

/// Retry variant: only augments when the conversation actually ends on a
/// user turn (it does after the rewind).
pub async fn build_retry_history_with_kb(
    pool: &SqlitePool,
    retriever: &Retriever,
    messages: &[Message],
    tail: usize,
) -> Vec<ChatMessage> {
    let history = build_history(messages, tail);
    let history = match history.last() {
        Some(last) if last.role == "user" => {
            let seed = last.content.clone();
            augment_history_with_kb(pool, retriever, history, &seed).await
        }
        _ => history,
    };
    with_system_prompt(pool, history).await
}

/// Prepend the configured system instruction unless the history already
/// starts with one.
async fn with_system_prompt(pool: &SqlitePool, mut history: Vec<ChatMessage>) -> Vec<ChatMessage> {
    if history.first().is_some_and(|m| m.role == "system") {
        return history;
    }
    if let Ok(Some(system_prompt)) = store::get_system_prompt(pool).await {
        if !system_prompt.trim().is_empty() {
            history.insert(0, ChatMessage::new("system", system_prompt));
        }
    }
    history
}

/// Replace the content of the last user message with the assembled
/// prompt. History is returned unchanged when it does not end on a user
/// turn.
pub async fn augment_history_with_kb(
    pool: &SqlitePool,
    retriever: &Retriever,
    mut history: Vec<ChatMessage>,
    last_user_msg: &str,
) -> Vec<ChatMessage> {
    let attachment = attachment_content(pool, last_user_msg).await;

    let chunks = match retriever.query(last_user_msg, RAG_TOP_K).await {
        Ok(chunks) => {
            if !chunks.is_empty() {
                info!("kb retrieval: {} chunks for query", chunks.len());
            }
            budget_chunks(chunks.into_iter().map(|c| c.content).collect())
        }
        Err(err) => {
            warn!("kb retrieval failed: {err}");
            Vec::new()
        }
    };

    let prompt = compose_prompt(attachment.as_deref(), &chunks, last_user_msg);

    if let Some(last) = history.last_mut() {
        if last.role == "user" {
            last.content = prompt;
        }
    }
    history
}

/// Greedy selection under the aggregate rune budget. A chunk that would
/// overflow is skipped and the scan continues; if the very first chunk
/// alone overflows, it is truncated and selection stops.
fn budget_chunks(contents: Vec<String>) -> Vec<String> {
    let mut total = 0usize;
    let mut selected = Vec::new();
    for content in contents {
        let len = content.chars().count();
        if total + len > MAX_KB_RUNES {
            if selected.is_empty() {
                let truncated = truncate_runes(&content, MAX_KB_RUNES);
                selected.push(truncated);
                break;
            }
            debug!("kb chunk skipped by budget ({len} runes, {total} used)");
            continue;
        }
        total += len;
        selected.push(content);
    }
    selected
}

fn compose_prompt(attachment: Option<&str>, chunks: &[String], question: &str) -> String {
    let mut prompt = String::from(KB_PROMPT_HEADER);
    if let Some(text) = attachment {
        prompt.push_str(&format!("[上下文1]\n{text}\n\n"));
    }
    for (i, chunk) in chunks.iter().enumerate() {
        prompt.push_str(&format!("[参考{}]\n{}\n\n", i + 1, chunk));
    }
    prompt.push_str("问题：\n");
    prompt.push_str(question);
    prompt
}

/// Detect a file attachment in the message and extract its text.
async fn attachment_content(pool: &SqlitePool, message: &str) -> Option<String> {
    let caps = attachment_re().captures(message)?;
    let label = caps.get(1).map(|m| m.as_str().trim()).unwrap_or_default();
    let encoded = caps.get(2).map(|m| m.as_str()).unwrap_or_default();

    let mut filename = label.to_string();
    // The UI uses a placeholder label for fresh uploads; fall back to
    // the URL-encoded query parameter.
    if filename.is_empty() || filename == "已上传文件" {
        if let Ok(decoded) = urlencoding::decode(encoded) {
            if !decoded.is_empty() {
                filename = decoded.into_owned();
            }
        }
    }
    if filename.is_empty() {
        return None;
    }
    info!("attachment detected in message: {filename}");

    let full_path = resolve_attachment_path(pool, &filename).await?;
    let read_path = full_path.clone();
    let content = tokio::task::spawn_blocking(move || extract::file_content(&read_path))
        .await
        .ok()?;
    match content {
        Ok(text) => {
            let truncated = truncate_text_keep_newlines(&text, MAX_ATTACHMENT_RUNES);
            info!(
                "attachment read: {} ({} runes)",
                full_path.display(),
                truncated.chars().count()
            );
            Some(truncated)
        }
        Err(err) => {
            warn!("attachment read failed for {}: {err}", full_path.display());
            None
        }
    }
}

/// Registered-file basename match first, then a join against the
/// configured knowledge-base folder.
async fn resolve_attachment_path(pool: &SqlitePool, filename: &str) -> Option<PathBuf> {
    if let Ok(files) = store::list_kb_files(pool).await {
        for f in files {
            if Path::new(&f.path).file_name() == Some(OsStr::new(filename)) {
                return Some(PathBuf::from(f.path));
            }
        }
    }
    match store::get_kb_folder(pool).await {
        Ok(Some(folder)) if !folder.is_empty() => Some(Path::new(&folder).join(filename)),
        _ => {
            warn!("attachment not registered and kb folder unset: {filename}");
            None
        }
    }
}

/// Truncate to `n` runes, keeping internal newlines.
pub fn truncate_text_keep_newlines(s: &str, n: usize) -> String {
    let s = s.trim();
    if n == 0 {
        return String::new();
    }
    if s.chars().count() <= n {
        return s.to_string();
    }
    s.chars().take(n).collect()
}

/// Truncate to `n` runes after collapsing all whitespace to single
/// spaces. Used for titles, snippets, and oversize single chunks.
pub fn truncate_runes(s: &str, n: usize) -> String {
    let collapsed = s.split_whitespace().collect::<Vec<_>>().join(" ");
    if n == 0 {
        return String::new();
    }
    if collapsed.chars().count() <= n {
        return collapsed;
    }
    collapsed.chars().take(n).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attachment_pattern_matches_ui_links() {
        let msg = "解释下面文件 [已上传文件: [report.pdf](/api/kb/download?file=report.pdf)]";
        let caps = attachment_re().captures(msg).unwrap();
        assert_eq!(&caps[1], "report.pdf");
        assert_eq!(&caps[2], "report.pdf");
    }

    #[test]
    fn attachment_label_must_be_bracket_free() {
        // The outer [已上传文件: ...] wrapper must not be captured as a label.
        let msg = "[已上传文件: [成绩表.xlsx](/api/kb/download?file=%E6%88%90%E7%BB%A9%E8%A1%A8.xlsx)]";
        let caps = attachment_re().captures(msg).unwrap();
        assert_eq!(&caps[1], "成绩表.xlsx");
    }

    #[test]
    fn no_attachment_no_capture() {
        assert!(attachment_re().captures("普通消息，没有链接").is_none());
        assert!(attachment_re()
            .captures("[label](/api/other?file=x)")
            .is_none());
    }

    #[test]
    fn budget_keeps_chunks_until_full_then_skips() {
        let chunks = vec![
            "a".repeat(900),
            "b".repeat(900),
            "c".repeat(900), // would overflow, skipped
            "d".repeat(100), // still fits
        ];
        let selected = budget_chunks(chunks);
        assert_eq!(selected.len(), 3);
        assert!(selected[0].starts_with('a'));
        assert!(selected[1].starts_with('b'));
        assert!(selected[2].starts_with('d'));
    }

    #[test]
    fn oversize_first_chunk_is_truncated() {
        let chunks = vec!["x".repeat(5000), "y".repeat(10)];
        let selected = budget_chunks(chunks);
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].chars().count(), 2000);
    }

    #[test]
    fn prompt_shape() {
        let prompt = compose_prompt(
            Some("Q3 revenue was 1.2M."),
            &["Paris is the capital of France.".to_string()],
            "capital of France",
        );
        assert!(prompt.starts_with("你是一个本地知识库助手。请仅基于提供的上下文回答问题。\n\n"));
        assert!(prompt.contains("[上下文1]\nQ3 revenue was 1.2M.\n\n"));
        assert!(prompt.contains("[参考1]\nParis is the capital of France.\n\n"));
        assert!(prompt.ends_with("问题：\ncapital of France"));
    }

    #[test]
    fn history_tail_and_replacement() {
        let messages: Vec<Message> = (0..30)
            .map(|i| Message {
                id: i,
                conversation_id: 1,
                role: if i % 2 == 0 { "user" } else { "assistant" }.to_string(),
                content: format!("msg {i}"),
                created_at: 0,
                updated_at: 0,
            })
            .collect();
        let history = build_history(&messages, 10);
        assert_eq!(history.len(), 10);
        assert_eq!(history[0].content, "msg 20");
    }

    #[test]
    fn truncate_helpers() {
        assert_eq!(truncate_text_keep_newlines("  a\nb  ", 10), "a\nb");
        assert_eq!(truncate_text_keep_newlines("一二三四五", 3), "一二三");
        assert_eq!(truncate_runes("a\nb   c", 10), "a b c");
        assert_eq!(truncate_runes("abcdef", 3), "abc");
        assert_eq!(truncate_runes("x", 0), "");
    }
}
