//! Parser module for reading provider responses and assembling prompts.

mod extract;
mod prompts;

pub use extract::*;
pub use prompts::*;

use tracing::debug;

use crate::models::{CallTarget, FieldKey, ParsedOutput, SectionSchema};

/// Longest slice of raw output kept inside a `ParseError`
const PARSE_ERROR_SNIPPET: usize = 200;

/// Fields a call was asked to produce
pub fn target_keys(schema: &SectionSchema, target: &CallTarget) -> Vec<FieldKey> {
    match target {
        CallTarget::Full => schema.keys(),
        CallTarget::Field(key) => vec![key.clone()],
    }
}

/// Parse a provider response against the fields it was asked for.
///
/// Strict JSON is tried first. When that yields nothing, the heuristic text
/// extraction runs over the same response.
pub fn parse_output(response: &str, schema: &SectionSchema, target: &CallTarget) -> ParsedOutput {
    let targets = target_keys(schema, target);

    let mut fields = extract_json_object(response)
        .map(|map| fields_from_json(&map, &targets))
        .unwrap_or_default();
    if fields.is_empty() {
        fields = extract_fallback(response, schema, &targets);
        if !fields.is_empty() {
            debug!("Recovered {} field(s) with fallback extraction", fields.len());
        }
    }

    if fields.is_empty() {
        let snippet: String = response.chars().take(PARSE_ERROR_SNIPPET).collect();
        return ParsedOutput::ParseError(snippet);
    }

    let missing: Vec<FieldKey> = targets
        .into_iter()
        .filter(|key| !fields.iter().any(|f| &f.key == key))
        .collect();
    if missing.is_empty() {
        ParsedOutput::Ok(fields)
    } else {
        ParsedOutput::PartialOk(fields, missing)
    }
}
