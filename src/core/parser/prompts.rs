//! Prompt assembly for analysis calls.

use serde_json::{Map, Value};

use crate::core::prompts::STRICT_FORMAT_REMINDER;
use crate::models::{FieldDef, SectionDef, SectionSchema};

/// Assemble the first-pass prompt: whole transcript, every section
pub fn assemble_full_prompt(schema: &SectionSchema, transcript: &str) -> String {
    let mut prompt = String::new();

    prompt.push_str("[CONTEXT]\n");
    prompt.push_str("### Transcript\n");
    prompt.push_str(transcript);
    if !transcript.ends_with('\n') {
        prompt.push('\n');
    }
    prompt.push('\n');

    prompt.push_str("[INSTRUCTIONS]\n");
    prompt.push_str("Write the session report. Field definitions:\n");
    for section in &schema.sections {
        prompt.push_str(&format!("\n## {} ({}): {}\n", section.title, section.id, section.description));
        for field in &section.fields {
            prompt.push_str(&format!(
                "- {}: {} [{}]\n",
                field.id,
                field.description,
                field.kind.describe()
            ));
        }
    }
    prompt.push_str("\nRespond with JSON shaped like this template:\n");
    prompt.push_str(&report_template(schema));
    prompt.push('\n');

    prompt
}

/// JSON template with every section and field id, values null
fn report_template(schema: &SectionSchema) -> String {
    let mut root = Map::new();
    for section in &schema.sections {
        let fields: Map<String, Value> = section
            .fields
            .iter()
            .map(|f| (f.id.clone(), Value::Null))
            .collect();
        root.insert(section.id.clone(), Value::Object(fields));
    }
    serde_json::to_string_pretty(&Value::Object(root)).unwrap_or_default()
}

/// Assemble a targeted prompt for one missing field
pub fn assemble_field_prompt(section: &SectionDef, field: &FieldDef, excerpt: &str, strict_format: bool) -> String {
    let mut prompt = String::new();

    prompt.push_str("[CONTEXT]\n");
    prompt.push_str("### Transcript excerpt\n");
    prompt.push_str(excerpt);
    if !excerpt.ends_with('\n') {
        prompt.push('\n');
    }
    prompt.push('\n');

    prompt.push_str("[INSTRUCTIONS]\n");
    prompt.push_str(&format!("Section: {} - {}\n", section.title, section.description));
    prompt.push_str(&format!("Field: {}\n", field.id));
    prompt.push_str(&format!("Meaning: {}\n", field.description));
    prompt.push_str(&format!("Shape: {}\n", field.kind.describe()));
    prompt.push_str("\nRespond with {\"value\": ...}\n");

    if strict_format {
        prompt.push('\n');
        prompt.push_str(STRICT_FORMAT_REMINDER);
        prompt.push('\n');
    }

    prompt
}

fn keyword_hits(line: &str, keywords: &[String]) -> usize {
    let lower = line.to_lowercase();
    keywords
        .iter()
        .filter(|k| !k.is_empty() && lower.contains(&k.to_lowercase()))
        .count()
}

fn truncate_chars(text: &str, budget: usize) -> String {
    text.chars().take(budget).collect()
}

/// Pick the transcript lines most relevant to a field, within a character budget.
///
/// Lines are ranked by keyword hits and taken with one line of context on
/// each side, then emitted in transcript order with "..." between
/// non-adjacent runs. With no keyword hits the head of the transcript is used.
pub fn select_excerpt(transcript: &str, keywords: &[String], budget: usize) -> String {
    if transcript.chars().count() <= budget {
        return transcript.to_string();
    }

    let lines: Vec<&str> = transcript.lines().collect();
    let mut ranked: Vec<(usize, usize)> = lines
        .iter()
        .enumerate()
        .map(|(i, line)| (i, keyword_hits(line, keywords)))
        .filter(|(_, hits)| *hits > 0)
        .collect();
    if ranked.is_empty() {
        return truncate_chars(transcript, budget);
    }
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

    let mut included = vec![false; lines.len()];
    let mut used = 0usize;
    'outer: for (index, _) in ranked {
        let from = index.saturating_sub(1);
        let to = (index + 1).min(lines.len() - 1);
        for i in [index, from, to] {
            if included[i] {
                continue;
            }
            let cost = lines[i].chars().count() + 1;
            if used + cost > budget {
                if i == index {
                    break 'outer;
                }
                continue;
            }
            included[i] = true;
            used += cost;
        }
    }

    if used == 0 {
        return truncate_chars(transcript, budget);
    }

    let mut excerpt = String::new();
    let mut previous: Option<usize> = None;
    for (i, line) in lines.iter().enumerate().filter(|(i, _)| included[*i]) {
        if let Some(p) = previous {
            if i > p + 1 {
                excerpt.push_str("...\n");
            }
        }
        excerpt.push_str(line);
        excerpt.push('\n');
        previous = Some(i);
    }
    excerpt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FieldKey;

    #[test]
    fn test_full_prompt_lists_every_field() {
        let schema = SectionSchema::standard();
        let prompt = assemble_full_prompt(&schema, "Coach: welcome everyone");
        assert!(prompt.starts_with("[CONTEXT]"));
        assert!(prompt.contains("Coach: welcome everyone"));
        for key in schema.keys() {
            assert!(prompt.contains(&format!("\"{}\"", key.field)), "missing {}", key);
        }
    }

    #[test]
    fn test_field_prompt_strict_reminder() {
        let schema = SectionSchema::standard();
        let key = FieldKey::new("strengths", "strengths");
        let section = schema.section(&key.section).unwrap();
        let field = schema.field(&key).unwrap();

        let relaxed = assemble_field_prompt(section, field, "excerpt", false);
        let strict = assemble_field_prompt(section, field, "excerpt", true);
        assert!(relaxed.contains("Field: strengths"));
        assert!(!relaxed.contains(STRICT_FORMAT_REMINDER));
        assert!(strict.contains(STRICT_FORMAT_REMINDER));
    }

    #[test]
    fn test_excerpt_short_transcript_unchanged() {
        let text = "line one\nline two";
        assert_eq!(select_excerpt(text, &["two".to_string()], 1000), text);
    }

    #[test]
    fn test_excerpt_prefers_keyword_lines() {
        let mut transcript = String::new();
        for i in 0..50 {
            transcript.push_str(&format!("filler line number {}\n", i));
        }
        transcript.push_str("this is the drill we use next week\n");
        for i in 50..100 {
            transcript.push_str(&format!("filler line number {}\n", i));
        }

        let excerpt = select_excerpt(&transcript, &["drill".to_string()], 120);
        assert!(excerpt.contains("this is the drill we use next week"));
        assert!(excerpt.chars().count() <= 120);
    }

    #[test]
    fn test_excerpt_without_hits_uses_head() {
        let transcript = "a".repeat(500);
        let excerpt = select_excerpt(&transcript, &["zzz".to_string()], 100);
        assert_eq!(excerpt.len(), 100);
    }
}
