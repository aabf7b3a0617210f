use std::collections::BTreeMap;

use regex::Regex;
use once_cell::sync::Lazy;

pub const NO_SUBJECT: &str = "(no subject)";

pub const SNIPPET_LEN: usize = 200;

static REPLY_PREFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\s*(?:(?:re|fwd|fw)\s*:\s*)+").unwrap());

static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

static ANGLE_ADDR: Lazy<Regex> = Lazy::new(|| Regex::new(r"<([^<>@\s]+@[^<>\s]+)>").unwrap());

/// Provider headers with case-insensitive lookup. The original casing is
/// kept for storage.
#[derive(Clone, Debug, Default)]
pub struct HeaderBag {
    raw: BTreeMap<String, String>,
}

impl HeaderBag {
    pub fn new(raw: BTreeMap<String, String>) -> Self {
        Self { raw }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.raw
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn into_inner(self) -> BTreeMap<String, String> {
        self.raw
    }
}

/// Threading data pulled out of a message's headers and subject.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ThreadRefs {
    pub in_reply_to: Option<String>,
    pub references: Vec<String>,
    pub normalized_subject: String,
}

pub fn extract_refs(headers: &HeaderBag, subject: &str) -> ThreadRefs {
    let in_reply_to = headers
        .get("In-Reply-To")
        .map(strip_brackets)
        .filter(|id| !id.is_empty());

    let references = headers
        .get("References")
        .map(|value| {
            value
                .split_whitespace()
                .map(strip_brackets)
                .filter(|id| !id.is_empty())
                .collect()
        })
        .unwrap_or_default();

    ThreadRefs {
        in_reply_to,
        references,
        normalized_subject: normalize_subject(subject),
    }
}

pub fn strip_brackets(id: &str) -> String {
    id.trim().replace(['<', '>'], "")
}

/// Drops any run of leading `Re:` / `Fwd:` / `Fw:` markers and trims. A
/// subject left empty becomes `(no subject)`, so reply-only subjects such as
/// `Re:` all thread together under the placeholder.
pub fn normalize_subject(subject: &str) -> String {
    let stripped = REPLY_PREFIX.replace(subject, "");
    let trimmed = stripped.trim();
    if trimmed.is_empty() {
        NO_SUBJECT.to_string()
    } else {
        trimmed.to_string()
    }
}

pub fn snippet(body: &str) -> String {
    WHITESPACE
        .replace_all(body, " ")
        .trim()
        .chars()
        .take(SNIPPET_LEN)
        .collect()
}

/// `"Ada <ada@example.com>"` and `"ADA@example.com"` both route as
/// `ada@example.com`.
pub fn bare_address(addr: &str) -> String {
    match ANGLE_ADDR.captures(addr) {
        Some(caps) => caps[1].to_lowercase(),
        None => addr.trim().to_lowercase(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> HeaderBag {
        HeaderBag::new(
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
        )
    }

    #[test]
    fn strips_repeated_mixed_case_prefixes() {
        assert_eq!(normalize_subject("Re: Fwd: Re: Hello"), "Hello");
        assert_eq!(normalize_subject("RE: fw: FWD:Quarterly plan "), "Quarterly plan");
        assert_eq!(normalize_subject("  Project Update  "), "Project Update");
        assert_eq!(normalize_subject("Re :  Spaced"), "Spaced");
    }

    #[test]
    fn keeps_prefixes_that_are_not_leading() {
        assert_eq!(normalize_subject("Meeting Re: budget"), "Meeting Re: budget");
        assert_eq!(normalize_subject("Refund request"), "Refund request");
    }

    #[test]
    fn empty_subject_becomes_placeholder() {
        assert_eq!(normalize_subject(""), NO_SUBJECT);
        assert_eq!(normalize_subject("Re: "), NO_SUBJECT);
    }

    #[test]
    fn header_lookup_is_case_insensitive() {
        let refs = extract_refs(&headers(&[("in-reply-to", "<abc@mail>")]), "Re: x");
        assert_eq!(refs.in_reply_to.as_deref(), Some("abc@mail"));

        let refs = extract_refs(&headers(&[("IN-REPLY-TO", " <abc@mail> ")]), "x");
        assert_eq!(refs.in_reply_to.as_deref(), Some("abc@mail"));
    }

    #[test]
    fn references_keep_header_order() {
        let refs = extract_refs(
            &headers(&[("References", "<one@a>\n\t<two@b>   <three@c>")]),
            "Hello",
        );
        assert_eq!(refs.references, vec!["one@a", "two@b", "three@c"]);
        assert_eq!(refs.in_reply_to, None);
        assert_eq!(refs.normalized_subject, "Hello");
    }

    #[test]
    fn blank_headers_yield_no_match_data() {
        let refs = extract_refs(&headers(&[("In-Reply-To", "<>"), ("References", "   ")]), "Hi");
        assert_eq!(refs.in_reply_to, None);
        assert!(refs.references.is_empty());
    }

    #[test]
    fn snippet_collapses_whitespace_and_caps_length() {
        assert_eq!(snippet("  Here's\n\nthe   update...\t"), "Here's the update...");

        let long = "é".repeat(500);
        let s = snippet(&long);
        assert_eq!(s.chars().count(), SNIPPET_LEN);
    }

    #[test]
    fn bare_address_forms() {
        assert_eq!(bare_address("Bea <B@Y.com>"), "b@y.com");
        assert_eq!(bare_address(" b@y.com "), "b@y.com");
    }
}
