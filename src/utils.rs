//! Small helpers: name normalization, anonymous identities, message splitting.

use rand::Rng;

/// Byte limit Twitch enforces on a single PRIVMSG body.
pub const PRIVMSG_LIMIT: usize = 500;

/// Canonicalize a channel name: lowercased, exactly one leading `#`.
pub fn channel(name: &str) -> String {
    let normalized = name.to_lowercase();
    if normalized.starts_with('#') {
        normalized
    } else {
        format!("#{normalized}")
    }
}

/// Canonicalize a username: lowercased, no leading `#`.
pub fn username(name: &str) -> String {
    let normalized = name.to_lowercase();
    match normalized.strip_prefix('#') {
        Some(rest) => rest.to_string(),
        None => normalized,
    }
}

/// Strip an `oauth:` prefix (any case) from a token.
pub fn token(value: &str) -> &str {
    if value.len() >= 6 && value[..6].eq_ignore_ascii_case("oauth:") {
        &value[6..]
    } else {
        value
    }
}

/// Format a password the way the PASS command wants it: `oauth:<token>`.
/// Empty input stays empty (anonymous login sends no PASS at all).
pub fn password(value: &str) -> String {
    let tok = token(value);
    if tok.is_empty() {
        String::new()
    } else {
        format!("oauth:{tok}")
    }
}

/// Generate a random anonymous login.
pub fn justinfan() -> String {
    format!("justinfan{}", rand::thread_rng().gen_range(1_000..90_000))
}

/// True for names matching `justinfan<digits>`.
pub fn is_justinfan(name: &str) -> bool {
    match name.strip_prefix("justinfan") {
        Some(digits) => !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()),
        None => false,
    }
}

/// If `text` is a CTCP ACTION (`\x01ACTION ...\x01`), return the inner text.
pub fn action_message(text: &str) -> Option<&str> {
    let inner = text.strip_prefix("\u{1}ACTION ")?.strip_suffix('\u{1}')?;
    if inner.is_empty() || inner.contains('\u{1}') {
        None
    } else {
        Some(inner)
    }
}

/// Undo the HTML entity escaping Twitch applies inside some tag values.
pub fn unescape_html(value: &str) -> String {
    value
        .replace("\\&amp\\;", "&")
        .replace("\\&lt\\;", "<")
        .replace("\\&gt\\;", ">")
        .replace("\\&quot\\;", "\"")
        .replace("\\&#039\\;", "'")
}

/// Split a message into chunks of at most `limit` bytes, preferring to break
/// at a space and never inside a UTF-8 sequence.
pub fn paginate(message: &str, limit: usize) -> Vec<&str> {
    let mut chunks = Vec::new();
    let mut rest = message;
    while rest.len() > limit {
        let mut cut = limit;
        while !rest.is_char_boundary(cut) {
            cut -= 1;
        }
        let split = match rest[..cut].rfind(' ') {
            Some(at) if at > 0 => at,
            _ => cut,
        };
        chunks.push(&rest[..split]);
        rest = rest[split..].trim_start_matches(' ');
    }
    if !rest.is_empty() || chunks.is_empty() {
        chunks.push(rest);
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_normalization() {
        assert_eq!(channel("Example"), "#example");
        assert_eq!(channel("#Already"), "#already");
    }

    #[test]
    fn username_normalization() {
        assert_eq!(username("Example"), "example");
        assert_eq!(username("#Nick"), "nick");
    }

    #[test]
    fn token_and_password() {
        assert_eq!(token("oauth:abc"), "abc");
        assert_eq!(token("OAuth:abc"), "abc");
        assert_eq!(password("abc"), "oauth:abc");
        assert_eq!(password("oauth:abc"), "oauth:abc");
        assert_eq!(password(""), "");
    }

    #[test]
    fn justinfan_detection() {
        assert!(is_justinfan("justinfan12345"));
        assert!(!is_justinfan("justinfan"));
        assert!(!is_justinfan("justinfanatic"));
        assert!(is_justinfan(&justinfan()));
    }

    #[test]
    fn action_unwrap() {
        assert_eq!(action_message("\u{1}ACTION waves\u{1}"), Some("waves"));
        assert_eq!(action_message("hello"), None);
        assert_eq!(action_message("\u{1}ACTION \u{1}"), None);
    }

    #[test]
    fn paginate_respects_limit() {
        let message = vec!["word"; 200].join(" ");
        let chunks = paginate(&message, 50);
        assert!(chunks.iter().all(|c| c.len() <= 50));
        assert!(chunks[0].contains("word"));
        // Nothing lost besides the separators we split on.
        assert_eq!(chunks.join(" "), message);
    }

    #[test]
    fn paginate_never_splits_utf8() {
        let message = "é".repeat(300);
        let chunks = paginate(&message, 500);
        assert!(chunks.len() > 1);
        assert!(chunks.iter().all(|c| c.len() <= 500));
        assert_eq!(chunks.concat(), message);
    }

    #[test]
    fn paginate_short_message_is_single_chunk() {
        assert_eq!(paginate("hi", 500), vec!["hi"]);
        assert_eq!(paginate("", 500), vec![""]);
    }
}
