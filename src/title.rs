//! Conversation title maintenance.
//!
//! A fresh conversation gets a fallback title clipped from the first
//! user message; after the first assistant reply a best-effort pass asks
//! the model for a short title, with heavy sanitization because small
//! models decorate their output freely.

use sqlx::SqlitePool;
use tracing::debug;

use crate::engine::{ChatOptions, EngineHandle};
use crate::models::ChatMessage;
use crate::prompt::truncate_runes;
use crate::store;

const MAX_TITLE_RUNES: usize = 20;

/// Set a clipped-user-text title on conversations that still carry a
/// placeholder. The `Default` conversation is never renamed.
pub async fn ensure_fallback_title(pool: &SqlitePool, conversation_id: i64, user_text: &str) {
    let Ok(Some(conv)) = store::get_conversation(pool, conversation_id).await else {
        return;
    };
    if conv.title == "Default" {
        return;
    }
    if !conv.title.trim().is_empty() && conv.title != "New chat" {
        return;
    }
    let mut title = truncate_runes(user_text, MAX_TITLE_RUNES);
    if title.is_empty() {
        title = "New chat".to_string();
    }
    let _ = store::update_conversation_title(pool, conversation_id, &title).await;
}

/// Ask the model for a short title once a conversation has content.
/// Falls back to a heuristic clip of the first user message. Runs after
/// assistant persistence and never fails the request.
pub async fn try_generate_smart_title(
    pool: &SqlitePool,
    engine: &EngineHandle,
    conversation_id: i64,
) {
    let Ok(Some(conv)) = store::get_conversation(pool, conversation_id).await else {
        return;
    };
    if conv.title == "Default" {
        return;
    }

    let Ok(Some(first_user)) = store::get_first_user_message(pool, conversation_id).await else {
        return;
    };
    let fallback = truncate_runes(&first_user.content, MAX_TITLE_RUNES);
    if conv.title != "New chat" && conv.title != fallback {
        return;
    }

    let prompt = vec![ChatMessage::new(
        "user",
        format!(
            "只输出一个不超过20字的中文标题，不要任何多余文字。标题：{}",
            first_user.content
        ),
    )];
    let opts = ChatOptions {
        max_tokens: 64,
        temperature: 0.7,
        top_p: 0.9,
        ..ChatOptions::default()
    };

    let generated = engine
        .with_locked(move |e| e.chat_with_options(&prompt, &opts))
        .await;

    if let Ok(out) = generated {
        let title = sanitize_title(&out);
        if !is_bad_title(&title, &fallback) {
            let _ = store::update_conversation_title(pool, conversation_id, &title).await;
            return;
        }
        debug!("generated title rejected: {title:?}");
    }

    let heuristic = heuristic_title_from_user(&first_user.content);
    if !heuristic.is_empty() && heuristic != fallback {
        let _ = store::update_conversation_title(pool, conversation_id, &heuristic).await;
    }
}

/// Strip model decoration: markdown, quotes, `<...>` tags, a leading
/// `标题:` marker, then keep only letters/numbers/space/-/_.
pub fn sanitize_title(title: &str) -> String {
    let mut title = title.trim().to_string();
    title = title
        .trim_matches(|c| "\"'“”‘’「」`".contains(c))
        .to_string();

    while let Some(start) = title.find('<') {
        match title[start..].find('>') {
            Some(end) => {
                title.replace_range(start..start + end + 1, "");
            }
            None => break,
        }
    }

    if let Some(i) = title.rfind("标题") {
        let sub = title[i..].trim();
        let sub = sub.strip_prefix("标题：").or_else(|| sub.strip_prefix("标题:")).unwrap_or(sub);
        title = sub.trim().to_string();
    }
    for prefix in ["标题：", "标题:"] {
        if let Some(rest) = title.strip_prefix(prefix) {
            title = rest.trim().to_string();
        }
    }

    let filtered: String = title
        .chars()
        .filter(|r| r.is_alphanumeric() || r.is_whitespace() || *r == '-' || *r == '_')
        .collect();
    truncate_runes(&filtered, MAX_TITLE_RUNES)
}

/// Clip a usable title out of the user's phrasing by dropping polite
/// request prefixes.
pub fn heuristic_title_from_user(s: &str) -> String {
    let mut s = s.trim().trim_start_matches(|c| "，。！？、,.!? ".contains(c));
    for prefix in ["请你", "请", "帮我", "给我", "麻烦", "能不能", "能否", "如何", "怎么"] {
        s = s.strip_prefix(prefix).unwrap_or(s).trim();
    }
    for prefix in [
        "写一个", "写", "总结一下", "总结", "解释一下", "解释", "介绍一下", "介绍", "给出", "提供",
    ] {
        s = s.strip_prefix(prefix).unwrap_or(s).trim();
    }
    let s = s.trim_start_matches(|c| "，。！？、,.!? ".contains(c));
    truncate_runes(s, MAX_TITLE_RUNES)
}

/// Reject titles that are empty, too short, or obvious filler the model
/// produced instead of a title.
pub fn is_bad_title(title: &str, fallback: &str) -> bool {
    let title = title.trim();
    if title.is_empty() || title == fallback {
        return true;
    }
    if title.chars().count() < 4 {
        return true;
    }
    for prefix in ["好的", "明白", "请", "您好", "你好"] {
        if title.starts_with(prefix) {
            return true;
        }
    }
    for keyword in ["提出", "问题", "我会", "尽力", "帮助"] {
        if title.contains(keyword) {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_strips_decoration() {
        assert_eq!(sanitize_title("《**标题：数据库设计**》"), "数据库设计");
        assert_eq!(sanitize_title("\"Rust 学习计划\""), "Rust 学习计划");
        assert_eq!(sanitize_title("<output>标题：周报总结</output>"), "周报总结");
    }

    #[test]
    fn sanitize_truncates_to_twenty_runes() {
        let long = "这是一个非常非常非常非常非常非常长的标题内容超过二十个字";
        assert_eq!(sanitize_title(long).chars().count(), 20);
    }

    #[test]
    fn heuristic_drops_request_prefixes() {
        assert_eq!(heuristic_title_from_user("请帮我总结一下季度报告"), "季度报告");
        assert_eq!(heuristic_title_from_user("如何写一个排序算法"), "排序算法");
    }

    #[test]
    fn bad_titles_are_rejected() {
        assert!(is_bad_title("", "fallback"));
        assert!(is_bad_title("你好", "fallback"));
        assert!(is_bad_title("好的我知道了", "fallback"));
        assert!(is_bad_title("有问题尽管问", "fallback"));
        assert!(!is_bad_title("季度收入分析", "fallback"));
    }
}
