//! `application/x-www-form-urlencoded` bodies as ordered key/value pairs.

use urlencoding::{decode, encode};

pub fn parse_form(raw: &str) -> Vec<(String, String)> {
    raw.split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            (decode_component(key), decode_component(value))
        })
        .collect()
}

pub fn encode_form(pairs: &[(String, String)]) -> String {
    pairs
        .iter()
        .map(|(key, value)| format!("{}={}", encode(key), encode(value)))
        .collect::<Vec<_>>()
        .join("&")
}

/// Heuristic used when no content type is available.
pub fn looks_like_form(raw: &str) -> bool {
    let trimmed = raw.trim();
    !trimmed.is_empty()
        && !trimmed.starts_with('{')
        && !trimmed.starts_with('[')
        && !trimmed.chars().any(char::is_whitespace)
        && trimmed.split('&').all(|pair| {
            pair.split_once('=')
                .is_some_and(|(key, _)| !key.is_empty())
        })
}

pub fn form_value<'a>(pairs: &'a [(String, String)], key: &str) -> Option<&'a str> {
    pairs
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}

fn decode_component(raw: &str) -> String {
    let spaced = raw.replace('+', " ");
    decode(&spaced)
        .map(|value| value.into_owned())
        .unwrap_or(spaced)
}
