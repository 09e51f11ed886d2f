//! Input sanitization and id validation.
//!
//! Everything that ends up in logs, error reports or the archive passes through here
//! first. Sanitizers are idempotent: running one over its own output is a no-op.

use std::sync::LazyLock;

use regex::Regex;

use crate::domain::{ChatId, UserId};

/// Cap for sanitized report/log fragments and extracted URLs.
pub const MAX_SANITIZED_LEN: usize = 1000;

/// Telegram's hard message length.
pub const MAX_MESSAGE_TEXT_LEN: usize = 4096;

static JS_SCHEME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)javascript:").expect("static regex"));
static EVENT_HANDLER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)on\w+=").expect("static regex"));
static BOT_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d+:[A-Za-z0-9_-]{35}$").expect("static regex"));

// ============== Sanitization ==============

/// Strip markup, script schemes, inline event handlers and control characters, then cap
/// the length at [`MAX_SANITIZED_LEN`] characters.
pub fn sanitize_input(input: &str) -> String {
    let mut out: String = input
        .chars()
        .filter(|c| *c != '<' && *c != '>' && !is_stripped_control(*c))
        .collect();

    // Removing one match can splice a new one together ("jajavascript:vascript:").
    loop {
        let pass = JS_SCHEME.replace_all(&out, "");
        let pass = EVENT_HANDLER.replace_all(&pass, "").into_owned();
        if pass == out {
            break;
        }
        out = pass;
    }

    cap_trimmed(&out, MAX_SANITIZED_LEN)
}

/// Remove control characters (keeping `\t`, `\n`, `\r`) and cap at the Telegram limit.
pub fn sanitize_message_text(text: &str) -> String {
    let out: String = text.chars().filter(|c| !is_stripped_control(*c)).collect();
    cap_trimmed(&out, MAX_MESSAGE_TEXT_LEN)
}

fn is_stripped_control(c: char) -> bool {
    matches!(c, '\u{0}'..='\u{8}' | '\u{b}' | '\u{c}' | '\u{e}'..='\u{1f}' | '\u{7f}')
}

fn cap_trimmed(s: &str, max_chars: usize) -> String {
    let capped: String = s.trim().chars().take(max_chars).collect();
    capped.trim_end().to_string()
}

// ============== Validation ==============

pub fn validate_user_id(user_id: UserId) -> bool {
    user_id.0 > 0
}

pub fn validate_chat_id(chat_id: ChatId) -> bool {
    chat_id.0 != 0
}

/// Parse a textual chat id (`^-?\d+$`).
pub fn parse_chat_id(raw: &str) -> Option<ChatId> {
    let digits = raw.strip_prefix('-').unwrap_or(raw);
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    raw.parse::<i64>().ok().map(ChatId)
}

/// Parse a textual user id (`^\d+$`, positive).
pub fn parse_user_id(raw: &str) -> Option<UserId> {
    if raw.is_empty() || !raw.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    raw.parse::<i64>()
        .ok()
        .map(UserId)
        .filter(|id| validate_user_id(*id))
}

pub fn is_valid_bot_token(token: &str) -> bool {
    BOT_TOKEN.is_match(token)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_markup_and_script_vectors() {
        let s = sanitize_input("<b>hi</b> javascript:alert(1) <img onerror=x>");
        assert!(!s.contains('<'));
        assert!(!s.contains('>'));
        assert!(!s.to_lowercase().contains("javascript:"));
        assert!(!s.contains("onerror="));
    }

    #[test]
    fn sanitize_is_idempotent() {
        let inputs = [
            "jajavascript:vascript:alert(1)",
            "ononclick==x",
            "  padded\u{7}  ",
            "plain text",
            "",
        ];
        for input in inputs {
            let once = sanitize_input(input);
            assert_eq!(sanitize_input(&once), once, "input: {input:?}");
        }

        let long = format!("{} tail", "a ".repeat(MAX_SANITIZED_LEN));
        let once = sanitize_input(&long);
        assert!(once.chars().count() <= MAX_SANITIZED_LEN);
        assert_eq!(sanitize_input(&once), once);
    }

    #[test]
    fn nested_script_scheme_is_fully_removed() {
        assert_eq!(sanitize_input("jajavascript:vascript:x"), "x");
    }

    #[test]
    fn message_text_keeps_newlines() {
        let s = sanitize_message_text("line1\nline2\u{0}\r\n");
        assert_eq!(s, "line1\nline2");
    }

    #[test]
    fn id_parsing() {
        assert_eq!(parse_chat_id("-1001234"), Some(ChatId(-1001234)));
        assert_eq!(parse_chat_id("42"), Some(ChatId(42)));
        assert_eq!(parse_chat_id("-"), None);
        assert_eq!(parse_chat_id("12a"), None);
        assert_eq!(parse_user_id("42"), Some(UserId(42)));
        assert_eq!(parse_user_id("-42"), None);
        assert_eq!(parse_user_id("0"), None);
    }

    #[test]
    fn token_format() {
        assert!(is_valid_bot_token(
            "123456:ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghi"
        ));
        assert!(!is_valid_bot_token("not-a-token"));
    }
}
