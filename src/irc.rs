//! IRC message parsing and formatting.
//!
//! Handles IRCv3 message tags: `@key=value;key2=value2 :prefix COMMAND params`
//! with the trailing parameter introduced by `:`. Tag values use the IRCv3
//! escape set (`\:` `\s` `\\` `\r` `\n`).

use std::fmt;

use crate::tags::{Tag, TagMap};

/// A parsed IRC line. Produced only by [`IrcMessage::parse`]; the dispatcher
/// may enrich `tags` with structured fields before events are emitted.
#[derive(Debug, Clone, PartialEq)]
pub struct IrcMessage {
    /// The line as received, without the trailing CRLF.
    pub raw: String,
    pub tags: TagMap,
    /// Source, e.g. `nick!user@host` or a bare server name.
    pub prefix: Option<String>,
    /// Uppercase command token or three-digit numeric.
    pub command: String,
    /// Positional parameters; the trailing parameter is the final element and
    /// may contain spaces.
    pub params: Vec<String>,
}

impl IrcMessage {
    /// Parse a raw IRC line. Returns `None` for empty or truncated lines.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            return None;
        }
        let raw = line.to_string();
        let mut rest = line;

        let mut tags = TagMap::new();
        if let Some(stripped) = rest.strip_prefix('@') {
            let end = stripped.find(' ')?;
            for pair in stripped[..end].split(';') {
                if pair.is_empty() {
                    continue;
                }
                match pair.split_once('=') {
                    Some((key, value)) => {
                        tags.insert(key.to_string(), Tag::Str(unescape_tag_value(value)))
                    }
                    None => tags.insert(pair.to_string(), Tag::None),
                };
            }
            rest = stripped[end..].trim_start_matches(' ');
        }

        let prefix = if let Some(stripped) = rest.strip_prefix(':') {
            let end = stripped.find(' ')?;
            let prefix = stripped[..end].to_string();
            rest = stripped[end..].trim_start_matches(' ');
            Some(prefix)
        } else {
            None
        };

        if rest.is_empty() {
            return None;
        }

        let command;
        match rest.find(' ') {
            Some(at) => {
                command = rest[..at].to_ascii_uppercase();
                rest = rest[at..].trim_start_matches(' ');
            }
            None => {
                command = rest.to_ascii_uppercase();
                rest = "";
            }
        }

        let mut params = Vec::new();
        while !rest.is_empty() {
            if let Some(trailing) = rest.strip_prefix(':') {
                params.push(trailing.to_string());
                break;
            }
            match rest.find(' ') {
                Some(at) => {
                    params.push(rest[..at].to_string());
                    rest = rest[at..].trim_start_matches(' ');
                }
                None => {
                    params.push(rest.to_string());
                    break;
                }
            }
        }

        Some(IrcMessage {
            raw,
            tags,
            prefix,
            command,
            params,
        })
    }

    pub fn param(&self, index: usize) -> Option<&str> {
        self.params.get(index).map(String::as_str)
    }
}

impl fmt::Display for IrcMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(tags) = format_tags(&self.tags) {
            write!(f, "{tags} ")?;
        }
        if let Some(ref prefix) = self.prefix {
            write!(f, ":{prefix} ")?;
        }
        write!(f, "{}", self.command)?;
        for (i, param) in self.params.iter().enumerate() {
            if i == self.params.len() - 1
                && (param.contains(' ') || param.starts_with(':') || param.is_empty())
            {
                write!(f, " :{param}")?;
            } else {
                write!(f, " {param}")?;
            }
        }
        Ok(())
    }
}

/// Format a tag map as an `@key=value;...` prefix. `None` for an empty map.
/// Valueless tags emit bare keys; empty strings emit `key=`.
pub fn format_tags(tags: &TagMap) -> Option<String> {
    if tags.is_empty() {
        return None;
    }
    let mut out = String::from("@");
    let mut first = true;
    for (key, value) in tags {
        if !first {
            out.push(';');
        }
        first = false;
        match value.to_wire() {
            Some(v) => {
                out.push_str(key);
                out.push('=');
                out.push_str(&escape_tag_value(&v));
            }
            None => out.push_str(key),
        }
    }
    Some(out)
}

/// Unescape an IRCv3 tag value.
/// `\:` -> `;`, `\s` -> space, `\\` -> `\`, `\r` -> CR, `\n` -> LF; a
/// backslash before any other character yields that character, and a lone
/// trailing backslash is dropped.
pub fn unescape_tag_value(value: &str) -> String {
    let mut result = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some(':') => result.push(';'),
                Some('s') => result.push(' '),
                Some('\\') => result.push('\\'),
                Some('r') => result.push('\r'),
                Some('n') => result.push('\n'),
                Some(other) => result.push(other),
                None => {}
            }
        } else {
            result.push(c);
        }
    }
    result
}

/// Escape a value for IRCv3 tag encoding.
/// `;` -> `\:`, space -> `\s`, `\` -> `\\`, CR -> `\r`, LF -> `\n`
pub fn escape_tag_value(value: &str) -> String {
    let mut result = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            ';' => result.push_str("\\:"),
            ' ' => result.push_str("\\s"),
            '\\' => result.push_str("\\\\"),
            '\r' => result.push_str("\\r"),
            '\n' => result.push_str("\\n"),
            _ => result.push(c),
        }
    }
    result
}
