//! Prompt construction for both generation phases and parsing of the model's list replies.

use std::collections::HashSet;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{AttrGenError, Result};

static LIST_MARKER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*(?:[-*•]+|\(?\d+[.):]|\(?[a-zA-Z][.)])\s+").unwrap());

pub fn concept_prompt(object: &str, count: usize) -> String {
    format!(
        "List {count} distinct attribute concepts that can describe the object \"{object}\" \
         (for example: color, material, shape). Each concept must be a short noun phrase \
         naming a category of attribute, not a specific value.\n\
         Respond with a JSON array of exactly {count} strings and nothing else."
    )
}

pub fn value_prompt(object: &str, concept: &str, count: usize) -> String {
    format!(
        "List {count} distinct, concrete values of the attribute \"{concept}\" that a \
         \"{object}\" could plausibly have. Each value must be a short phrase.\n\
         Respond with a JSON array of exactly {count} strings and nothing else."
    )
}

fn strip_code_fence(reply: &str) -> &str {
    let trimmed = reply.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop an optional language tag on the opening fence line
    let body = match rest.find('\n') {
        Some(idx) => &rest[idx + 1..],
        None => rest,
    };
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}

fn json_strings(values: Vec<serde_json::Value>) -> Vec<String> {
    values
        .into_iter()
        .filter_map(|v| match v {
            serde_json::Value::String(s) => Some(s),
            serde_json::Value::Number(n) => Some(n.to_string()),
            serde_json::Value::Object(map) => map
                .get("name")
                .or_else(|| map.get("value"))
                .and_then(|v| v.as_str())
                .map(str::to_string),
            _ => None,
        })
        .collect()
}

/// First JSON array in `text` that yields items, trying every `[` so bracketed
/// prose before the array is skipped.
fn json_items(text: &str) -> Option<Vec<String>> {
    text.match_indices('[').find_map(|(start, _)| {
        let values = serde_json::Deserializer::from_str(&text[start..])
            .into_iter::<Vec<serde_json::Value>>()
            .next()?
            .ok()?;
        let items = json_strings(values);
        (!items.is_empty()).then_some(items)
    })
}

fn line_items(text: &str) -> Vec<String> {
    let lines: Vec<&str> = text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        // Lead-in prose such as "Here are five colors:"
        .filter(|l| !l.ends_with(':'))
        .collect();

    if lines.len() == 1 && lines[0].contains(',') {
        return lines[0].split(',').map(str::to_string).collect();
    }
    lines
        .into_iter()
        .map(|l| LIST_MARKER_RE.replace(l, "").into_owned())
        .collect()
}

fn clean_item(raw: &str) -> String {
    let trimmed = raw
        .trim()
        .trim_end_matches([',', '.', ';'])
        .trim_matches(|c: char| matches!(c, '"' | '\'' | '`' | '*' | '[' | ']'))
        .trim();
    trimmed.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Extract up to `limit` unique items from a model reply.
///
/// Prefers a JSON array (fenced or embedded in prose) and falls back to one item
/// per line with bullets and numbering removed. Items are trimmed and
/// de-duplicated case-insensitively, keeping first occurrences.
pub fn parse_list(reply: &str, limit: usize) -> Result<Vec<String>> {
    let body = strip_code_fence(reply);
    let raw = json_items(body).unwrap_or_else(|| line_items(body));

    let mut seen = HashSet::new();
    let items: Vec<String> = raw
        .iter()
        .map(|s| clean_item(s))
        .filter(|s| !s.is_empty())
        .filter(|s| seen.insert(s.to_lowercase()))
        .take(limit)
        .collect();

    if items.is_empty() {
        return Err(AttrGenError::Parse {
            message: format!(
                "no list items found in reply: {}",
                reply.chars().take(120).collect::<String>()
            ),
        });
    }
    Ok(items)
}
