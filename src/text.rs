//! Text helpers shared by the platform client and notifications.

use std::sync::LazyLock;

use regex::Regex;

static RE_TAGS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<[^>]*>").expect("valid tag regex"));

static RE_WS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("valid whitespace regex"));

/// Reduce platform HTML to plain text: tags become spaces, common entities
/// are decoded, whitespace collapses.
pub fn strip_html(html: &str) -> String {
    let without_tags = RE_TAGS.replace_all(html, " ");
    let decoded = decode_entities(&without_tags);
    RE_WS.replace_all(&decoded, " ").trim().to_string()
}

fn decode_entities(text: &str) -> String {
    // &amp; last so "&amp;lt;" decodes to "&lt;" rather than "<".
    text.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

/// First `max_chars` characters of `text`, with a marker when cut.
pub fn truncate_chars(text: &str, max_chars: usize, marker: &str) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars).collect();
    out.push_str(marker);
    out
}
