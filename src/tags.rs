//! Twitch tag values and the post-processing applied before dispatch.
//!
//! Incoming IRCv3 tags are heterogeneous: most are plain strings, a few are
//! numeric or boolean flags, and `badges`/`emotes` carry nested structure.
//! [`Tag`] models that as a value union with typed accessors; the original
//! wire string of a structured tag is preserved under a `-raw` sibling key.

use std::collections::HashMap;

pub type TagMap = HashMap<String, Tag>;

/// `badges` / `badge-info` decode to version-per-badge, e.g.
/// `broadcaster/1,subscriber/12` -> `{broadcaster: "1", subscriber: "12"}`.
pub type BadgeMap = HashMap<String, Option<String>>;

/// `emotes` decode to id -> occurrence ranges (inclusive byte offsets), e.g.
/// `25:0-4,6-10` -> `{25: [(0, 4), (6, 10)]}`.
pub type EmoteMap = HashMap<String, Vec<(usize, usize)>>;

#[derive(Debug, Clone, PartialEq)]
pub enum Tag {
    Str(String),
    Int(i64),
    Bool(bool),
    Badges(BadgeMap),
    Emotes(EmoteMap),
    /// A valueless tag (`@key;...`). Reads as the empty string.
    None,
}

impl Tag {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Tag::Str(s) => Some(s),
            Tag::None => Some(""),
            _ => Option::None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Tag::Int(n) => Some(*n),
            Tag::Str(s) => s.parse().ok(),
            _ => Option::None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Tag::Bool(b) => Some(*b),
            Tag::Str(s) => match s.as_str() {
                "1" => Some(true),
                "0" => Some(false),
                _ => Option::None,
            },
            _ => Option::None,
        }
    }

    pub fn as_badges(&self) -> Option<&BadgeMap> {
        match self {
            Tag::Badges(b) => Some(b),
            _ => Option::None,
        }
    }

    pub fn as_emotes(&self) -> Option<&EmoteMap> {
        match self {
            Tag::Emotes(e) => Some(e),
            _ => Option::None,
        }
    }

    /// Wire form of the value: `None` means a bare key, `Some("")` means
    /// `key=`. Inverse of parsing plus post-processing.
    pub(crate) fn to_wire(&self) -> Option<String> {
        match self {
            Tag::None => Option::None,
            Tag::Str(s) => Some(s.clone()),
            Tag::Int(n) => Some(n.to_string()),
            Tag::Bool(b) => Some(if *b { "1" } else { "0" }.to_string()),
            Tag::Badges(badges) => {
                let mut parts: Vec<String> = badges
                    .iter()
                    .map(|(name, version)| match version {
                        Some(v) => format!("{name}/{v}"),
                        Option::None => name.clone(),
                    })
                    .collect();
                parts.sort();
                Some(parts.join(","))
            }
            Tag::Emotes(emotes) => {
                let mut parts: Vec<String> = emotes
                    .iter()
                    .map(|(id, ranges)| {
                        let joined: Vec<String> = ranges
                            .iter()
                            .map(|(start, end)| format!("{start}-{end}"))
                            .collect();
                        format!("{id}:{}", joined.join(","))
                    })
                    .collect();
                parts.sort();
                Some(parts.join("/"))
            }
        }
    }
}

/// Tag keys whose values are integers on the wire.
const NUMERIC_TAGS: &[&str] = &[
    "bits",
    "ban-duration",
    "slow",
    "followers-only",
    "msg-param-streak-months",
    "msg-param-cumulative-months",
    "msg-param-months",
    "msg-param-mass-gift-count",
    "msg-param-viewerCount",
    "msg-param-threshold",
];

/// Tag keys carrying `"0"`/`"1"` flags.
const BOOLEAN_TAGS: &[&str] = &[
    "mod",
    "subscriber",
    "turbo",
    "first-msg",
    "returning-chatter",
    "emote-only",
    "r9k",
    "subs-only",
];

/// Enrich a freshly parsed tag map with structured fields. Runs once per
/// message, before any event carrying the map is dispatched.
pub fn post_process(tags: &mut TagMap) {
    parse_badge_tag(tags, "badges");
    parse_badge_tag(tags, "badge-info");
    parse_emote_tag(tags);

    for key in NUMERIC_TAGS {
        if let Some(Tag::Str(s)) = tags.get(*key) {
            if let Ok(n) = s.parse::<i64>() {
                tags.insert((*key).to_string(), Tag::Int(n));
            }
        }
    }
    for key in BOOLEAN_TAGS {
        let coerced = match tags.get(*key) {
            Some(Tag::Str(s)) if s == "1" => Some(true),
            Some(Tag::Str(s)) if s == "0" => Some(false),
            _ => None,
        };
        if let Some(flag) = coerced {
            tags.insert((*key).to_string(), Tag::Bool(flag));
        }
    }
}

/// `badges=broadcaster/1,subscriber/12` -> nested map, original string kept
/// under `<key>-raw`.
fn parse_badge_tag(tags: &mut TagMap, key: &str) {
    let raw = match tags.get(key) {
        Some(Tag::Str(s)) => s.clone(),
        _ => return,
    };
    let mut parsed = BadgeMap::new();
    for part in raw.split(',') {
        if part.is_empty() {
            continue;
        }
        match part.split_once('/') {
            Some((name, version)) => parsed.insert(name.to_string(), Some(version.to_string())),
            None => parsed.insert(part.to_string(), None),
        };
    }
    tags.insert(format!("{key}-raw"), Tag::Str(raw));
    tags.insert(key.to_string(), Tag::Badges(parsed));
}

/// `emotes=25:0-4,6-10/1902:12-16` -> id -> ranges, original kept under
/// `emotes-raw`.
fn parse_emote_tag(tags: &mut TagMap) {
    let raw = match tags.get("emotes") {
        Some(Tag::Str(s)) => s.clone(),
        _ => return,
    };
    let mut parsed = EmoteMap::new();
    for part in raw.split('/') {
        if part.is_empty() {
            continue;
        }
        let Some((id, ranges)) = part.split_once(':') else {
            continue;
        };
        let list = parsed.entry(id.to_string()).or_default();
        for range in ranges.split(',') {
            if let Some((start, end)) = range.split_once('-') {
                if let (Ok(start), Ok(end)) = (start.parse(), end.parse()) {
                    list.push((start, end));
                }
            }
        }
    }
    tags.insert("emotes-raw".to_string(), Tag::Str(raw));
    tags.insert("emotes".to_string(), Tag::Emotes(parsed));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn str_tags(pairs: &[(&str, &str)]) -> TagMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), Tag::Str(v.to_string())))
            .collect()
    }

    #[test]
    fn badges_decode_to_nested_map() {
        let mut tags = str_tags(&[("badges", "broadcaster/1,subscriber/12")]);
        post_process(&mut tags);
        let badges = tags["badges"].as_badges().unwrap();
        assert_eq!(badges["broadcaster"].as_deref(), Some("1"));
        assert_eq!(badges["subscriber"].as_deref(), Some("12"));
        assert_eq!(tags["badges-raw"].as_str(), Some("broadcaster/1,subscriber/12"));
    }

    #[test]
    fn emotes_decode_to_ranges() {
        let mut tags = str_tags(&[("emotes", "25:0-4,6-10/1902:12-16")]);
        post_process(&mut tags);
        let emotes = tags["emotes"].as_emotes().unwrap();
        assert_eq!(emotes["25"], vec![(0, 4), (6, 10)]);
        assert_eq!(emotes["1902"], vec![(12, 16)]);
    }

    #[test]
    fn numeric_and_boolean_coercion() {
        let mut tags = str_tags(&[
            ("bits", "100"),
            ("ban-duration", "600"),
            ("mod", "1"),
            ("subscriber", "0"),
            ("color", "#FF0000"),
        ]);
        post_process(&mut tags);
        assert_eq!(tags["bits"], Tag::Int(100));
        assert_eq!(tags["ban-duration"], Tag::Int(600));
        assert_eq!(tags["mod"], Tag::Bool(true));
        assert_eq!(tags["subscriber"], Tag::Bool(false));
        assert_eq!(tags["color"].as_str(), Some("#FF0000"));
    }

    #[test]
    fn followers_only_allows_negative() {
        let mut tags = str_tags(&[("followers-only", "-1")]);
        post_process(&mut tags);
        assert_eq!(tags["followers-only"], Tag::Int(-1));
    }

    #[test]
    fn valueless_tag_reads_as_empty_string() {
        assert_eq!(Tag::None.as_str(), Some(""));
        assert_eq!(Tag::None.to_wire(), None);
        assert_eq!(Tag::Str(String::new()).to_wire().as_deref(), Some(""));
    }
}
