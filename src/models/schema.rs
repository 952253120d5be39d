use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::Path;

use crate::models::ConfigError;

/// Address of one required field in the report
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FieldKey {
    pub section: String,
    pub field: String,
}

impl FieldKey {
    pub fn new(section: impl Into<String>, field: impl Into<String>) -> Self {
        Self {
            section: section.into(),
            field: field.into(),
        }
    }
}

impl fmt::Display for FieldKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.section, self.field)
    }
}

/// Shape a field value must have
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FieldKind {
    /// Free text with a minimum length
    Text { min_chars: usize },
    /// List of short text items
    List { min_items: usize },
    /// Numeric rating within an inclusive range
    Score { min: f64, max: f64 },
}

impl FieldKind {
    /// Human-readable shape description used in prompts
    pub fn describe(&self) -> String {
        match self {
            FieldKind::Text { min_chars } => format!("string, at least {} characters", min_chars),
            FieldKind::List { min_items } => format!("array of strings, at least {} item(s)", min_items),
            FieldKind::Score { min, max } => format!("number between {} and {}", min, max),
        }
    }

    /// Rough character count a fully developed value of this kind reaches
    pub fn ideal_chars(&self) -> usize {
        match self {
            FieldKind::Text { min_chars } => (*min_chars * 3).max(60),
            FieldKind::List { min_items } => (*min_items * 60).max(60),
            FieldKind::Score { .. } => 1,
        }
    }
}

/// Reason a candidate value was rejected by the schema
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SchemaViolation {
    #[error("value is empty")]
    Empty,
    #[error("expected {expected}")]
    WrongShape { expected: String },
    #[error("placeholder text: {0}")]
    Placeholder(String),
    #[error("text too short: {chars} chars (min: {min})")]
    TooShort { chars: usize, min: usize },
    #[error("too few items: {items} (min: {min})")]
    TooFewItems { items: usize, min: usize },
    #[error("score {value} outside {min}..={max}")]
    OutOfRange { value: f64, min: f64, max: f64 },
}

/// Definition of one required field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDef {
    pub id: String,
    pub description: String,
    #[serde(flatten)]
    pub kind: FieldKind,
    /// Transcript terms that mark passages relevant to this field
    #[serde(default)]
    pub keywords: Vec<String>,
}

impl FieldDef {
    fn new(id: &str, description: &str, kind: FieldKind, keywords: &[&str]) -> Self {
        Self {
            id: id.to_string(),
            description: description.to_string(),
            kind,
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
        }
    }

    /// Validate a candidate value and return its normalized form.
    ///
    /// Lists given as a single string are split on newlines and semicolons,
    /// placeholder items are dropped, and scores accept numeric strings such
    /// as "7/10".
    pub fn check(&self, value: &Value, placeholders: &[String]) -> Result<Value, SchemaViolation> {
        match &self.kind {
            FieldKind::Text { min_chars } => {
                let text = match value {
                    Value::String(s) => s.trim().to_string(),
                    Value::Array(items) => items
                        .iter()
                        .filter_map(|v| v.as_str())
                        .collect::<Vec<_>>()
                        .join(" ")
                        .trim()
                        .to_string(),
                    Value::Null => return Err(SchemaViolation::Empty),
                    _ => {
                        return Err(SchemaViolation::WrongShape {
                            expected: self.kind.describe(),
                        })
                    }
                };
                if text.is_empty() {
                    return Err(SchemaViolation::Empty);
                }
                if is_placeholder(&text, placeholders) {
                    return Err(SchemaViolation::Placeholder(text));
                }
                let chars = text.chars().count();
                if chars < *min_chars {
                    return Err(SchemaViolation::TooShort { chars, min: *min_chars });
                }
                Ok(Value::String(text))
            }
            FieldKind::List { min_items } => {
                let raw_items: Vec<String> = match value {
                    Value::Array(items) => items
                        .iter()
                        .filter_map(|v| match v {
                            Value::String(s) => Some(s.clone()),
                            Value::Number(n) => Some(n.to_string()),
                            _ => None,
                        })
                        .collect(),
                    Value::String(s) => s
                        .split(|c| c == '\n' || c == ';')
                        .map(|s| s.to_string())
                        .collect(),
                    Value::Null => return Err(SchemaViolation::Empty),
                    _ => {
                        return Err(SchemaViolation::WrongShape {
                            expected: self.kind.describe(),
                        })
                    }
                };
                let items: Vec<Value> = raw_items
                    .iter()
                    .map(|item| strip_bullet(item))
                    .filter(|item| !item.is_empty() && !is_placeholder(item, placeholders))
                    .map(Value::String)
                    .collect();
                if items.is_empty() {
                    return Err(SchemaViolation::Empty);
                }
                if items.len() < *min_items {
                    return Err(SchemaViolation::TooFewItems {
                        items: items.len(),
                        min: *min_items,
                    });
                }
                Ok(Value::Array(items))
            }
            FieldKind::Score { min, max } => {
                let score = match value {
                    Value::Number(n) => n.as_f64(),
                    Value::String(s) => leading_number(s),
                    Value::Null => return Err(SchemaViolation::Empty),
                    _ => None,
                };
                let Some(score) = score else {
                    return Err(SchemaViolation::WrongShape {
                        expected: self.kind.describe(),
                    });
                };
                if score < *min || score > *max {
                    return Err(SchemaViolation::OutOfRange {
                        value: score,
                        min: *min,
                        max: *max,
                    });
                }
                serde_json::Number::from_f64(score)
                    .map(Value::Number)
                    .ok_or(SchemaViolation::WrongShape {
                        expected: self.kind.describe(),
                    })
            }
        }
    }
}

/// Definition of one report section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectionDef {
    pub id: String,
    pub title: String,
    pub description: String,
    pub fields: Vec<FieldDef>,
}

/// The fixed shape every report must fill
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectionSchema {
    pub sections: Vec<SectionDef>,
}

impl SectionSchema {
    /// The built-in coaching-session report: nine sections
    pub fn standard() -> Self {
        use FieldKind::*;

        let section = |id: &str, title: &str, description: &str, fields: Vec<FieldDef>| SectionDef {
            id: id.to_string(),
            title: title.to_string(),
            description: description.to_string(),
            fields,
        };

        Self {
            sections: vec![
                section("overview", "Session Overview", "What the session was and how it went overall", vec![
                    FieldDef::new("summary", "Narrative summary of the whole session", Text { min_chars: 80 }, &["today", "session", "overall", "welcome"]),
                    FieldDef::new("session_type", "Kind of session (training, match review, workshop, ...)", Text { min_chars: 3 }, &["training", "practice", "match", "review", "drill"]),
                ]),
                section("objectives", "Objectives", "Goals set for the session and whether they were pursued", vec![
                    FieldDef::new("stated_objectives", "Objectives stated by the coach", List { min_items: 1 }, &["goal", "objective", "aim", "focus", "want"]),
                    FieldDef::new("objective_alignment", "How well the activities served those objectives", Text { min_chars: 40 }, &["goal", "objective", "because", "so that"]),
                ]),
                section("structure", "Structure", "How the session was organized in time", vec![
                    FieldDef::new("phases", "Ordered phases of the session", List { min_items: 2 }, &["warm", "first", "next", "then", "finally", "cool"]),
                    FieldDef::new("time_management", "Use of time and transitions between phases", Text { min_chars: 40 }, &["minute", "time", "quick", "break", "water"]),
                ]),
                section("communication", "Communication", "How the coach communicated with participants", vec![
                    FieldDef::new("clarity", "Clarity of instructions and demonstrations", Text { min_chars: 40 }, &["listen", "show", "watch", "explain", "understand"]),
                    FieldDef::new("questioning", "Use of questions to check understanding", Text { min_chars: 40 }, &["?", "why", "what", "how", "who"]),
                    FieldDef::new("clarity_score", "Overall communication rating", Score { min: 1.0, max: 10.0 }, &["listen", "explain"]),
                ]),
                section("technical_content", "Technical Content", "Skills and tactics taught", vec![
                    FieldDef::new("topics_covered", "Technical or tactical topics covered", List { min_items: 1 }, &["pass", "shot", "defend", "press", "technique", "position"]),
                    FieldDef::new("accuracy", "Correctness of the technical guidance", Text { min_chars: 40 }, &["technique", "correct", "position", "body", "angle"]),
                ]),
                section("engagement", "Engagement", "Participation and energy of the group", vec![
                    FieldDef::new("engagement_level", "Overall engagement rating", Score { min: 1.0, max: 10.0 }, &["great", "energy", "effort", "come on", "well done"]),
                    FieldDef::new("participation", "Who participated and how", Text { min_chars: 40 }, &["everyone", "group", "pair", "team", "turn"]),
                ]),
                section("strengths", "Strengths", "What went well", vec![
                    FieldDef::new("strengths", "Concrete strengths of the session", List { min_items: 2 }, &["good", "great", "well done", "excellent", "nice"]),
                ]),
                section("improvements", "Areas for Improvement", "What could be better", vec![
                    FieldDef::new("improvements", "Concrete areas for improvement", List { min_items: 2 }, &["again", "not", "stop", "wrong", "should", "instead"]),
                ]),
                section("action_plan", "Action Plan", "Follow-up for the next sessions", vec![
                    FieldDef::new("next_steps", "Concrete next steps for the coach", List { min_items: 2 }, &["next", "week", "homework", "remember", "practice"]),
                    FieldDef::new("recommended_drills", "Drills to use next time", List { min_items: 1 }, &["drill", "exercise", "game", "rondo", "grid"]),
                ]),
            ],
        }
    }

    /// Load a schema from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadError(path.to_path_buf(), e))?;
        let schema: SectionSchema = toml::from_str(&contents)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e))?;
        if schema.total_fields() == 0 {
            return Err(ConfigError::Invalid(format!(
                "schema {} defines no fields",
                path.display()
            )));
        }
        Ok(schema)
    }

    /// Total number of required fields across all sections
    pub fn total_fields(&self) -> usize {
        self.sections.iter().map(|s| s.fields.len()).sum()
    }

    pub fn section(&self, id: &str) -> Option<&SectionDef> {
        self.sections.iter().find(|s| s.id == id)
    }

    pub fn field(&self, key: &FieldKey) -> Option<&FieldDef> {
        self.section(&key.section)
            .and_then(|s| s.fields.iter().find(|f| f.id == key.field))
    }

    /// Every field key, in section then field order
    pub fn keys(&self) -> Vec<FieldKey> {
        self.sections
            .iter()
            .flat_map(|s| s.fields.iter().map(move |f| FieldKey::new(&s.id, &f.id)))
            .collect()
    }
}

/// Whether text is a known placeholder rather than real content
pub fn is_placeholder(text: &str, placeholders: &[String]) -> bool {
    let normalized: String = text
        .trim()
        .trim_matches(|c: char| c == '.' || c == '!' || c == '"' || c == '\'')
        .to_lowercase();
    if normalized.is_empty() {
        return true;
    }
    if (normalized.starts_with('[') && normalized.ends_with(']'))
        || (normalized.starts_with('<') && normalized.ends_with('>'))
    {
        return true;
    }
    placeholders.iter().any(|p| {
        let p = p.to_lowercase();
        normalized == p || (p.len() > 8 && normalized.contains(&p))
    })
}

/// Strip "- ", "* ", "• " and "1." / "2)" list markers
fn strip_bullet(item: &str) -> String {
    let trimmed = item
        .trim()
        .trim_start_matches(|c: char| c == '-' || c == '*' || c == '•')
        .trim_start();
    let digits = trimmed.chars().take_while(|c| c.is_ascii_digit()).count();
    if digits > 0 {
        let rest = &trimmed[digits..];
        if let Some(stripped) = rest.strip_prefix('.').or_else(|| rest.strip_prefix(')')) {
            return stripped.trim().to_string();
        }
    }
    trimmed.trim().to_string()
}

fn leading_number(text: &str) -> Option<f64> {
    let trimmed = text.trim();
    let end = trimmed
        .char_indices()
        .find(|(_, c)| !(c.is_ascii_digit() || *c == '.'))
        .map(|(i, _)| i)
        .unwrap_or(trimmed.len());
    trimmed[..end].parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn placeholders() -> Vec<String> {
        vec!["n/a".to_string(), "tbd".to_string(), "not enough information".to_string()]
    }

    #[test]
    fn test_standard_schema_shape() {
        let schema = SectionSchema::standard();
        assert_eq!(schema.sections.len(), 9);
        assert_eq!(schema.total_fields(), schema.keys().len());
        assert_eq!(schema.keys()[0], FieldKey::new("overview", "summary"));
        assert!(schema.field(&FieldKey::new("action_plan", "next_steps")).is_some());
        assert!(schema.field(&FieldKey::new("action_plan", "missing")).is_none());
    }

    #[test]
    fn test_text_field_rules() {
        let def = FieldDef::new("t", "", FieldKind::Text { min_chars: 10 }, &[]);
        assert_eq!(def.check(&json!("  long enough text "), &placeholders()).unwrap(), json!("long enough text"));
        assert_eq!(def.check(&json!("short"), &placeholders()), Err(SchemaViolation::TooShort { chars: 5, min: 10 }));
        assert_eq!(def.check(&json!(""), &placeholders()), Err(SchemaViolation::Empty));
        assert!(matches!(def.check(&json!("N/A"), &placeholders()), Err(SchemaViolation::Placeholder(_))));
        assert!(matches!(def.check(&json!({"a": 1}), &placeholders()), Err(SchemaViolation::WrongShape { .. })));
    }

    #[test]
    fn test_list_field_splits_and_filters() {
        let def = FieldDef::new("l", "", FieldKind::List { min_items: 2 }, &[]);
        let value = def.check(&json!("- first item\n- TBD\n* second item"), &placeholders()).unwrap();
        assert_eq!(value, json!(["first item", "second item"]));
        assert_eq!(
            def.check(&json!(["only one"]), &placeholders()),
            Err(SchemaViolation::TooFewItems { items: 1, min: 2 })
        );
    }

    #[test]
    fn test_score_field_accepts_numeric_strings() {
        let def = FieldDef::new("s", "", FieldKind::Score { min: 1.0, max: 10.0 }, &[]);
        assert_eq!(def.check(&json!("7/10"), &placeholders()).unwrap(), json!(7.0));
        assert_eq!(def.check(&json!(8), &placeholders()).unwrap(), json!(8.0));
        assert!(matches!(def.check(&json!(11), &placeholders()), Err(SchemaViolation::OutOfRange { .. })));
        assert!(matches!(def.check(&json!("great"), &placeholders()), Err(SchemaViolation::WrongShape { .. })));
    }

    #[test]
    fn test_placeholder_detection() {
        let markers = placeholders();
        assert!(is_placeholder("[insert summary here]", &markers));
        assert!(is_placeholder("TBD.", &markers));
        assert!(is_placeholder("There is not enough information in the transcript", &markers));
        assert!(!is_placeholder("The coach ran a passing drill", &markers));
    }

    #[test]
    fn test_schema_toml_roundtrip_shape() {
        let toml_str = r#"
[[sections]]
id = "only"
title = "Only"
description = "single section"

[[sections.fields]]
id = "notes"
description = "notes"
kind = "text"
min_chars = 5
"#;
        let schema: SectionSchema = toml::from_str(toml_str).unwrap();
        assert_eq!(schema.total_fields(), 1);
        assert_eq!(schema.sections[0].fields[0].kind, FieldKind::Text { min_chars: 5 });
    }
}
