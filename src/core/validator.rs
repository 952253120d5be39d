use serde::Serialize;
use std::sync::Arc;

use crate::models::{FieldState, Gap, GapCause, Report, SectionSchema};

/// Score and gap list for one report
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Validation {
    pub score: f64,
    pub gaps: Vec<Gap>,
}

impl Validation {
    pub fn is_complete(&self) -> bool {
        self.gaps.is_empty()
    }
}

/// Measures how much of the schema a report fills
#[derive(Debug, Clone)]
pub struct CompletenessValidator {
    schema: Arc<SectionSchema>,
    placeholders: Vec<String>,
}

impl CompletenessValidator {
    pub fn new(schema: Arc<SectionSchema>, placeholders: Vec<String>) -> Self {
        Self { schema, placeholders }
    }

    pub fn schema(&self) -> &SectionSchema {
        &self.schema
    }

    /// Score the report and list every unfilled field with its probable cause.
    ///
    /// Pure function of the report: the cause comes from the notes the last
    /// pass left on each slot.
    pub fn validate(&self, report: &Report) -> Validation {
        let total = self.schema.total_fields();
        let mut valid = 0usize;
        let mut gaps = Vec::new();

        for key in self.schema.keys() {
            let Some(def) = self.schema.field(&key) else {
                continue;
            };
            let slot = report.slot(&key);

            let schema_valid = match slot.map(|s| &s.state) {
                Some(FieldState::Filled { value, .. }) => def.check(value, &self.placeholders).is_ok(),
                _ => false,
            };
            if schema_valid {
                valid += 1;
                continue;
            }

            let (cause, attempts_made) = match slot {
                Some(slot) => {
                    let inferred = GapCause::strongest(slot.notes.iter().map(|n| n.cause()));
                    let cause = if slot.is_filled() && inferred == GapCause::Unknown {
                        GapCause::ParseFailure
                    } else {
                        inferred
                    };
                    (cause, slot.attempts)
                }
                None => (GapCause::Unknown, 0),
            };
            gaps.push(Gap {
                section_id: key.section,
                field_id: key.field,
                cause,
                attempts_made,
            });
        }

        let score = if total == 0 { 1.0 } else { valid as f64 / total as f64 };
        Validation { score, gaps }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AttemptNote, FieldCandidate, FieldKey, ProviderErrorKind};
    use serde_json::json;

    fn validator() -> CompletenessValidator {
        CompletenessValidator::new(Arc::new(SectionSchema::standard()), vec!["tbd".to_string()])
    }

    #[test]
    fn test_empty_report_all_gaps() {
        let v = validator();
        let report = Report::empty(v.schema());
        let result = v.validate(&report);
        assert_eq!(result.score, 0.0);
        assert_eq!(result.gaps.len(), v.schema().total_fields());
        assert!(result.gaps.iter().all(|g| g.cause == GapCause::Unknown));
    }

    #[test]
    fn test_empty_schema_scores_one() {
        let v = CompletenessValidator::new(Arc::new(SectionSchema { sections: vec![] }), vec![]);
        let result = v.validate(&Report { sections: vec![] });
        assert_eq!(result.score, 1.0);
        assert!(result.is_complete());
    }

    #[test]
    fn test_filled_field_counts() {
        let v = validator();
        let mut report = Report::empty(v.schema());
        report.merge(FieldCandidate {
            key: FieldKey::new("strengths", "strengths"),
            value: json!(["clear demos", "good energy"]),
            confidence: 0.8,
            provider_id: "a".to_string(),
        });
        let result = v.validate(&report);
        assert!(result.score > 0.0);
        assert!(!result.gaps.iter().any(|g| g.field_id == "strengths"));
    }

    #[test]
    fn test_invalid_filled_value_is_parse_failure_gap() {
        let v = validator();
        let mut report = Report::empty(v.schema());
        report.merge(FieldCandidate {
            key: FieldKey::new("strengths", "strengths"),
            value: json!("TBD"),
            confidence: 0.8,
            provider_id: "a".to_string(),
        });
        let result = v.validate(&report);
        let gap = result.gaps.iter().find(|g| g.field_id == "strengths").unwrap();
        assert_eq!(gap.cause, GapCause::ParseFailure);
    }

    #[test]
    fn test_cause_from_notes() {
        let v = validator();
        let mut report = Report::empty(v.schema());
        let key = FieldKey::new("overview", "summary");
        report.record_attempt(&key);
        report.record_notes(
            &key,
            vec![
                AttemptNote {
                    provider_id: "a".to_string(),
                    error: None,
                    output_chars: 500,
                    truncated: false,
                    rejected: Some("too short".to_string()),
                },
                AttemptNote {
                    provider_id: "b".to_string(),
                    error: Some(ProviderErrorKind::Timeout),
                    output_chars: 0,
                    truncated: false,
                    rejected: None,
                },
            ],
        );
        let result = v.validate(&report);
        let gap = result.gaps.iter().find(|g| g.key() == key).unwrap();
        assert_eq!(gap.cause, GapCause::Timeout);
        assert_eq!(gap.attempts_made, 1);
    }
}
