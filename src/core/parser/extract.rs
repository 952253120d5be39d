//! Value extraction from provider responses.

use regex::Regex;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::debug;

use crate::models::{ExtractedField, FieldKey, FieldKind, SectionSchema};

/// Strip a surrounding markdown fence ("```json ... ```") if present
fn strip_code_fence(response: &str) -> &str {
    let trimmed = response.trim();
    let Ok(fence_re) = Regex::new(r"(?s)```[a-zA-Z]*\s*\n?(.*?)\n?```") else {
        return trimmed;
    };
    match fence_re.captures(trimmed).and_then(|c| c.get(1)) {
        Some(inner) => inner.as_str().trim(),
        None => trimmed,
    }
}

/// Find the first balanced `{...}` block in text, honoring JSON strings
fn first_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, c) in text[start..].char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + c.len_utf8()]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Parse the response as a JSON object.
///
/// Looks inside a code fence first, then for the first balanced object in
/// the raw text.
pub fn extract_json_object(response: &str) -> Option<Map<String, Value>> {
    let candidates = [strip_code_fence(response), response.trim()];
    for candidate in candidates {
        if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(candidate) {
            return Some(map);
        }
        if let Some(block) = first_json_object(candidate) {
            if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(block) {
                return Some(map);
            }
        }
    }
    None
}

/// Lowercase, strip markup, and turn spaces and hyphens into underscores
pub fn normalize_key(label: &str) -> String {
    label
        .trim()
        .trim_matches(|c: char| c == '*' || c == '#' || c == '`' || c == '_' || c == '"')
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| if c == ' ' || c == '-' { '_' } else { c })
        .collect()
}

fn lookup<'a>(map: &'a Map<String, Value>, key: &str) -> Option<&'a Value> {
    map.get(key)
        .or_else(|| map.iter().find(|(k, _)| normalize_key(k) == key).map(|(_, v)| v))
}

/// Pull targeted fields out of a parsed JSON object.
///
/// Accepts nested `{"section": {"field": v}}`, flat `{"section.field": v}`,
/// and for a single target `{"value": v}` or `{"field": v}`. Null values
/// count as absent.
pub fn fields_from_json(map: &Map<String, Value>, targets: &[FieldKey]) -> Vec<ExtractedField> {
    let single = targets.len() == 1;
    let mut found = Vec::new();

    for key in targets {
        let nested = lookup(map, &key.section)
            .and_then(|s| s.as_object())
            .and_then(|s| lookup(s, &key.field));
        let flat = || lookup(map, &key.to_string());
        let direct = || {
            if single {
                lookup(map, "value").or_else(|| lookup(map, &key.field))
            } else {
                None
            }
        };

        if let Some(value) = nested.or_else(flat).or_else(direct) {
            if !value.is_null() {
                found.push(ExtractedField {
                    key: key.clone(),
                    value: value.clone(),
                    via_fallback: false,
                });
            }
        }
    }
    found
}

/// Split "label: rest" where the label is short and has no sentence punctuation
fn split_label(line: &str) -> Option<(&str, &str)> {
    let (label, rest) = line.split_once(':')?;
    let label = label.trim_start_matches(|c: char| c == '-' || c == '*' || c == '•' || c.is_whitespace());
    if label.is_empty() || label.chars().count() > 60 || label.contains([',', '?', '!']) {
        return None;
    }
    if label.split_whitespace().count() > 6 {
        return None;
    }
    Some((label, rest.trim().trim_start_matches("**").trim()))
}

fn bullet_item(line: &str) -> Option<&str> {
    let t = line.trim_start();
    for marker in ["- ", "* ", "• "] {
        if let Some(rest) = t.strip_prefix(marker) {
            return Some(rest.trim());
        }
    }
    let digits = t.chars().take_while(|c| c.is_ascii_digit()).count();
    if digits > 0 {
        let rest = &t[digits..];
        if let Some(item) = rest.strip_prefix(". ").or_else(|| rest.strip_prefix(") ")) {
            return Some(item.trim());
        }
    }
    None
}

fn match_section(schema: &SectionSchema, label: &str) -> Option<String> {
    let normalized = normalize_key(label);
    schema
        .sections
        .iter()
        .find(|s| s.id == normalized || normalize_key(&s.title) == normalized)
        .map(|s| s.id.clone())
}

/// Heuristic text extraction for responses that are not valid JSON.
///
/// Recognizes `section.field: value` lines, section headings followed by
/// `field: value` lines, and bullet lists under a field label. For a single
/// targeted field with no labels at all, the whole cleaned response becomes
/// the value.
pub fn extract_fallback(response: &str, schema: &SectionSchema, targets: &[FieldKey]) -> Vec<ExtractedField> {
    let body = strip_code_fence(response);
    let mut parts: BTreeMap<FieldKey, Vec<String>> = BTreeMap::new();
    let mut current_section: Option<String> = match targets {
        [only] => Some(only.section.clone()),
        _ => None,
    };
    let mut current_field: Option<FieldKey> = None;

    for line in body.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        if trimmed.starts_with('#') {
            if let Some(section) = match_section(schema, trimmed) {
                current_section = Some(section);
                current_field = None;
            }
            continue;
        }

        if let Some((label, rest)) = split_label(trimmed) {
            let normalized = normalize_key(label);
            let key = match normalized.split_once('.') {
                Some((section, field)) => Some(FieldKey::new(section, field)),
                None => current_section
                    .as_ref()
                    .map(|section| FieldKey::new(section.as_str(), normalized.as_str())),
            };

            if let Some(key) = key.filter(|k| targets.contains(k)) {
                if !rest.is_empty() {
                    parts.entry(key.clone()).or_default().push(rest.to_string());
                }
                current_field = Some(key);
                continue;
            }
            if rest.is_empty() {
                if let Some(section) = match_section(schema, label) {
                    current_section = Some(section);
                    current_field = None;
                    continue;
                }
            }
        } else if let Some(section) = match_section(schema, trimmed) {
            current_section = Some(section);
            current_field = None;
            continue;
        }

        if let Some(field) = &current_field {
            let text = bullet_item(trimmed).unwrap_or(trimmed);
            parts.entry(field.clone()).or_default().push(text.to_string());
        }
    }

    if parts.is_empty() {
        if let [only] = targets {
            if !body.is_empty() && !body.starts_with('{') {
                debug!("No labelled lines, using whole response for {}", only);
                parts.insert(only.clone(), vec![body.to_string()]);
            }
        }
    }

    parts
        .into_iter()
        .filter_map(|(key, lines)| {
            let def = schema.field(&key)?;
            let value = match def.kind {
                FieldKind::List { .. } => Value::Array(lines.into_iter().map(Value::String).collect()),
                _ => Value::String(lines.join(" ")),
            };
            Some(ExtractedField {
                key,
                value,
                via_fallback: true,
            })
        })
        .collect()
}
