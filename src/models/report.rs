use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::models::{FieldKey, ProviderErrorKind, SectionSchema};

/// Probable reason a field is still missing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GapCause {
    /// Output was cut off at the provider's output ceiling
    TokenLimit,
    /// Output existed but the field could not be parsed or was invalid
    ParseFailure,
    /// The call exceeded its deadline
    Timeout,
    /// The provider reported a rate limit or exhausted quota
    QuotaExceeded,
    Unknown,
}

impl GapCause {
    pub fn name(&self) -> &'static str {
        match self {
            GapCause::TokenLimit => "token_limit",
            GapCause::ParseFailure => "parse_failure",
            GapCause::Timeout => "timeout",
            GapCause::QuotaExceeded => "quota_exceeded",
            GapCause::Unknown => "unknown",
        }
    }

    /// Precedence when several calls left the same field empty (higher wins)
    fn precedence(&self) -> u8 {
        match self {
            GapCause::QuotaExceeded => 4,
            GapCause::Timeout => 3,
            GapCause::TokenLimit => 2,
            GapCause::ParseFailure => 1,
            GapCause::Unknown => 0,
        }
    }

    /// Pick the most specific cause out of several
    pub fn strongest(causes: impl IntoIterator<Item = GapCause>) -> GapCause {
        causes
            .into_iter()
            .max_by_key(|c| c.precedence())
            .unwrap_or(GapCause::Unknown)
    }
}

impl fmt::Display for GapCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// One missing or schema-invalid field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Gap {
    pub section_id: String,
    pub field_id: String,
    pub cause: GapCause,
    pub attempts_made: u32,
}

impl Gap {
    pub fn key(&self) -> FieldKey {
        FieldKey::new(&self.section_id, &self.field_id)
    }
}

impl fmt::Display for Gap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{} ({}, {} attempt(s))",
            self.section_id, self.field_id, self.cause, self.attempts_made
        )
    }
}

/// What one call that targeted a field observed, kept for cause inference
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptNote {
    pub provider_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ProviderErrorKind>,
    pub output_chars: usize,
    pub truncated: bool,
    /// Schema violation or parse problem for this field, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejected: Option<String>,
}

impl AttemptNote {
    /// Cause this note points at, on its own
    pub fn cause(&self) -> GapCause {
        match self.error {
            Some(ProviderErrorKind::QuotaExceeded) => GapCause::QuotaExceeded,
            Some(ProviderErrorKind::Timeout) => GapCause::Timeout,
            Some(ProviderErrorKind::MalformedResponse) => GapCause::ParseFailure,
            Some(ProviderErrorKind::Transient) | Some(ProviderErrorKind::Cancelled) => GapCause::Unknown,
            None if self.truncated => GapCause::TokenLimit,
            None if self.output_chars > 0 && self.rejected.is_some() => GapCause::ParseFailure,
            None => GapCause::Unknown,
        }
    }
}

/// Content of a field slot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FieldState {
    Missing,
    Filled {
        value: Value,
        confidence: f64,
        provider_id: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSlot {
    pub id: String,
    pub state: FieldState,
    /// Targeted attempts made on this field
    #[serde(default)]
    pub attempts: u32,
    /// Outcomes of the latest pass's calls that targeted this field
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<AttemptNote>,
}

impl FieldSlot {
    fn missing(id: &str) -> Self {
        Self {
            id: id.to_string(),
            state: FieldState::Missing,
            attempts: 0,
            notes: Vec::new(),
        }
    }

    pub fn is_filled(&self) -> bool {
        matches!(self.state, FieldState::Filled { .. })
    }

    pub fn value(&self) -> Option<&Value> {
        match &self.state {
            FieldState::Filled { value, .. } => Some(value),
            FieldState::Missing => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectionReport {
    pub id: String,
    pub fields: Vec<FieldSlot>,
}

/// A schema-valid value offered to the report by one call
#[derive(Debug, Clone, PartialEq)]
pub struct FieldCandidate {
    pub key: FieldKey,
    pub value: Value,
    pub confidence: f64,
    pub provider_id: String,
}

/// What a merge did to the report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Filled,
    Upgraded,
    Kept,
    UnknownField,
}

/// The accumulating report of one job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub sections: Vec<SectionReport>,
}

impl Report {
    /// Empty report with every schema field missing
    pub fn empty(schema: &SectionSchema) -> Self {
        Self {
            sections: schema
                .sections
                .iter()
                .map(|s| SectionReport {
                    id: s.id.clone(),
                    fields: s.fields.iter().map(|f| FieldSlot::missing(&f.id)).collect(),
                })
                .collect(),
        }
    }

    pub fn slot(&self, key: &FieldKey) -> Option<&FieldSlot> {
        self.sections
            .iter()
            .find(|s| s.id == key.section)
            .and_then(|s| s.fields.iter().find(|f| f.id == key.field))
    }

    pub fn slot_mut(&mut self, key: &FieldKey) -> Option<&mut FieldSlot> {
        self.sections
            .iter_mut()
            .find(|s| s.id == key.section)
            .and_then(|s| s.fields.iter_mut().find(|f| f.id == key.field))
    }

    /// Merge a validated candidate.
    ///
    /// A filled field is only replaced by a strictly more confident value,
    /// and nothing here ever turns a filled field back into a missing one.
    pub fn merge(&mut self, candidate: FieldCandidate) -> MergeOutcome {
        let Some(slot) = self.slot_mut(&candidate.key) else {
            return MergeOutcome::UnknownField;
        };
        let outcome = match &slot.state {
            FieldState::Missing => MergeOutcome::Filled,
            FieldState::Filled { confidence, .. } if candidate.confidence > *confidence => {
                MergeOutcome::Upgraded
            }
            FieldState::Filled { .. } => return MergeOutcome::Kept,
        };
        slot.state = FieldState::Filled {
            value: candidate.value,
            confidence: candidate.confidence,
            provider_id: candidate.provider_id,
        };
        outcome
    }

    /// Replace the notes of the given fields with this pass's observations
    pub fn record_notes(&mut self, key: &FieldKey, notes: Vec<AttemptNote>) {
        if let Some(slot) = self.slot_mut(key) {
            slot.notes = notes;
        }
    }

    pub fn record_attempt(&mut self, key: &FieldKey) {
        if let Some(slot) = self.slot_mut(key) {
            slot.attempts += 1;
        }
    }

    pub fn filled_count(&self) -> usize {
        self.sections
            .iter()
            .flat_map(|s| s.fields.iter())
            .filter(|f| f.is_filled())
            .count()
    }

    /// Plain section -> field -> value map, missing fields as null
    pub fn to_values(&self) -> Value {
        let mut sections = serde_json::Map::new();
        for section in &self.sections {
            let mut fields = serde_json::Map::new();
            for slot in &section.fields {
                fields.insert(slot.id.clone(), slot.value().cloned().unwrap_or(Value::Null));
            }
            sections.insert(section.id.clone(), Value::Object(fields));
        }
        Value::Object(sections)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn candidate(confidence: f64, value: &str) -> FieldCandidate {
        FieldCandidate {
            key: FieldKey::new("strengths", "strengths"),
            value: json!(value),
            confidence,
            provider_id: "alpha".to_string(),
        }
    }

    #[test]
    fn test_empty_report_mirrors_schema() {
        let schema = SectionSchema::standard();
        let report = Report::empty(&schema);
        assert_eq!(report.sections.len(), 9);
        assert_eq!(report.filled_count(), 0);
        assert!(report.slot(&FieldKey::new("overview", "summary")).is_some());
    }

    #[test]
    fn test_merge_only_upgrades_on_higher_confidence() {
        let mut report = Report::empty(&SectionSchema::standard());
        assert_eq!(report.merge(candidate(0.5, "first")), MergeOutcome::Filled);
        assert_eq!(report.merge(candidate(0.4, "worse")), MergeOutcome::Kept);
        assert_eq!(report.merge(candidate(0.5, "equal")), MergeOutcome::Kept);
        assert_eq!(report.merge(candidate(0.9, "better")), MergeOutcome::Upgraded);

        let slot = report.slot(&FieldKey::new("strengths", "strengths")).unwrap();
        assert_eq!(slot.value(), Some(&json!("better")));
    }

    #[test]
    fn test_merge_unknown_field() {
        let mut report = Report::empty(&SectionSchema::standard());
        let mut c = candidate(0.5, "x");
        c.key = FieldKey::new("nope", "nope");
        assert_eq!(report.merge(c), MergeOutcome::UnknownField);
    }

    #[test]
    fn test_note_cause_inference() {
        let note = |error, output_chars, truncated, rejected: Option<&str>| AttemptNote {
            provider_id: "p".to_string(),
            error,
            output_chars,
            truncated,
            rejected: rejected.map(|s| s.to_string()),
        };
        assert_eq!(note(Some(ProviderErrorKind::Timeout), 0, false, None).cause(), GapCause::Timeout);
        assert_eq!(note(Some(ProviderErrorKind::QuotaExceeded), 0, false, None).cause(), GapCause::QuotaExceeded);
        assert_eq!(note(None, 4000, true, None).cause(), GapCause::TokenLimit);
        assert_eq!(note(None, 300, false, Some("not parsed")).cause(), GapCause::ParseFailure);
        assert_eq!(note(None, 300, false, None).cause(), GapCause::Unknown);
    }

    #[test]
    fn test_strongest_cause() {
        assert_eq!(GapCause::strongest([GapCause::Unknown, GapCause::Timeout]), GapCause::Timeout);
        assert_eq!(GapCause::strongest([GapCause::ParseFailure, GapCause::QuotaExceeded]), GapCause::QuotaExceeded);
        assert_eq!(GapCause::strongest([]), GapCause::Unknown);
    }

    #[test]
    fn test_report_serialization() {
        let mut report = Report::empty(&SectionSchema::standard());
        report.merge(candidate(0.7, "Good pressing"));
        let json = serde_json::to_string(&report).unwrap();
        assert!(json.contains("\"status\":\"filled\""));
        assert!(json.contains("\"status\":\"missing\""));
        let parsed: Report = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, report);
    }
}
