use crate::form::{encode_form, parse_form};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

pub const MASK: &str = "[REDACTED]";

/// Field names whose values are authentication material. Matched against
/// the snake_cased name, so `userToken` and `user_token` agree.
static SECRET_KEY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)(^|[_\-.])(access_?token|refresh_?token|auth_?token|id_?token|token|csrf(_?token)?|xsrf(_?token)?|fb_dtsg|dtsg|lsd|jazoest|password|passwd|secret|client_secret|api_?key|cookie|set-cookie|authorization|session_?token|sessionid|sid)$",
    )
    .expect("secret key pattern")
});

static BEARER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(bearer|basic)\s+[A-Za-z0-9._~+/=\-]+").expect("bearer pattern")
});

/// Any `name=value` or `"name": "value"` pair; the name is checked with
/// [`is_secret_key`].
static INLINE_PAIR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"([A-Za-z0-9_\-.]+)(["']?\s*[:=]\s*["']?)([^"'&;,\s?]+)"#)
        .expect("inline pair pattern")
});

pub fn is_secret_key(key: &str) -> bool {
    SECRET_KEY.is_match(&snake_case(key.trim()))
}

fn snake_case(key: &str) -> String {
    let mut out = String::with_capacity(key.len() + 4);
    let mut prev_lower = false;
    for ch in key.chars() {
        if ch.is_ascii_uppercase() && prev_lower {
            out.push('_');
        }
        prev_lower = ch.is_ascii_lowercase() || ch.is_ascii_digit();
        out.push(ch.to_ascii_lowercase());
    }
    out
}

/// Masks secrets embedded in free text: bearer credentials and
/// `name=value` / `"name": "value"` pairs for known secret names.
pub fn redact_text(text: &str) -> String {
    let masked = BEARER.replace_all(text, |caps: &regex::Captures| format!("{} {MASK}", &caps[1]));
    INLINE_PAIR
        .replace_all(&masked, |caps: &regex::Captures| {
            let value = &caps[3];
            // The credential after a scheme word was already masked above.
            let scheme = value.eq_ignore_ascii_case("bearer") || value.eq_ignore_ascii_case("basic");
            if is_secret_key(&caps[1]) && !scheme {
                format!("{}{}{MASK}", &caps[1], &caps[2])
            } else {
                caps[0].to_string()
            }
        })
        .into_owned()
}

/// Masks secret query parameters by name; the path is treated as text.
pub fn redact_url(url: &str) -> String {
    let Some((base, rest)) = url.split_once('?') else {
        return redact_text(url);
    };
    let (query, fragment) = match rest.split_once('#') {
        Some((query, fragment)) => (query, Some(fragment)),
        None => (rest, None),
    };
    let original = parse_form(query);
    let mut pairs = original.clone();
    redact_form(&mut pairs);
    let query = if pairs == original {
        query.to_string()
    } else {
        encode_form(&pairs)
    };
    let mut out = format!("{}?{query}", redact_text(base));
    if let Some(fragment) = fragment {
        out.push('#');
        out.push_str(&redact_text(fragment));
    }
    out
}

pub fn redact_json(root: &mut Value) {
    let mut stack: Vec<&mut Value> = vec![root];
    while let Some(node) = stack.pop() {
        match node {
            Value::Object(map) => {
                for (key, value) in map.iter_mut() {
                    if is_secret_key(key) && !value.is_null() {
                        *value = Value::String(MASK.into());
                    } else {
                        stack.push(value);
                    }
                }
            }
            Value::Array(items) => stack.extend(items.iter_mut()),
            Value::String(text) => *text = redact_text(text),
            _ => {}
        }
    }
}

/// Form pairs: secret keys are masked; JSON-valued fields are redacted
/// structurally and re-serialized.
pub fn redact_form(pairs: &mut [(String, String)]) {
    for (key, value) in pairs.iter_mut() {
        if is_secret_key(key) {
            if !value.is_empty() {
                *value = MASK.into();
            }
            continue;
        }
        let trimmed = value.trim_start();
        if (trimmed.starts_with('{') || trimmed.starts_with('['))
            && let Ok(mut parsed) = serde_json::from_str::<Value>(value)
        {
            redact_json(&mut parsed);
            *value = parsed.to_string();
        } else {
            *value = redact_text(value);
        }
    }
}

pub fn contains_mask(text: &str) -> bool {
    text.contains(MASK)
}
