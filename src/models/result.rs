use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;

use crate::models::FieldKey;

/// Classification of a failed provider call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderErrorKind {
    /// Network failure or server-side error; safe to retry
    Transient,
    Timeout,
    /// Rate limit or exhausted budget
    QuotaExceeded,
    /// Response body could not be decoded
    MalformedResponse,
    /// The job was cancelled while the call was in flight
    Cancelled,
}

impl fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProviderErrorKind::Transient => "transient",
            ProviderErrorKind::Timeout => "timeout",
            ProviderErrorKind::QuotaExceeded => "quota_exceeded",
            ProviderErrorKind::MalformedResponse => "malformed_response",
            ProviderErrorKind::Cancelled => "cancelled",
        };
        write!(f, "{}", name)
    }
}

/// What a provider call was asked to produce
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallTarget {
    /// First pass: every section
    Full,
    /// Targeted pass: a single field
    Field(FieldKey),
}

impl fmt::Display for CallTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallTarget::Full => write!(f, "full"),
            CallTarget::Field(key) => write!(f, "{}", key),
        }
    }
}

/// One value pulled out of a provider response
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedField {
    pub key: FieldKey,
    pub value: Value,
    /// True when recovered by heuristic text extraction rather than strict parsing
    pub via_fallback: bool,
}

/// Shape-checked result of parsing one provider response
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedOutput {
    /// Every targeted field was found
    Ok(Vec<ExtractedField>),
    /// Some fields were found, the listed ones were not
    PartialOk(Vec<ExtractedField>, Vec<FieldKey>),
    /// Nothing usable; the raw text is kept for the audit log
    ParseError(String),
}

impl ParsedOutput {
    pub fn fields(&self) -> &[ExtractedField] {
        match self {
            ParsedOutput::Ok(fields) | ParsedOutput::PartialOk(fields, _) => fields,
            ParsedOutput::ParseError(_) => &[],
        }
    }

    pub fn is_parse_error(&self) -> bool {
        matches!(self, ParsedOutput::ParseError(_))
    }
}

/// Outcome of one provider call within a pass
#[derive(Debug, Clone)]
pub struct ProviderResult {
    pub provider_id: String,
    pub target: CallTarget,
    pub raw_output: String,
    pub parsed: ParsedOutput,
    pub latency: Duration,
    pub truncated: bool,
    pub error: Option<ProviderErrorKind>,
}

impl ProviderResult {
    /// Result of a call that produced no output
    pub fn failed(provider_id: &str, target: CallTarget, latency: Duration, error: ProviderErrorKind) -> Self {
        Self {
            provider_id: provider_id.to_string(),
            target,
            raw_output: String::new(),
            parsed: ParsedOutput::ParseError(String::new()),
            latency,
            truncated: false,
            error: Some(error),
        }
    }

    pub fn output_chars(&self) -> usize {
        self.raw_output.chars().count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parsed_output_fields() {
        let field = ExtractedField {
            key: FieldKey::new("a", "b"),
            value: Value::String("x".to_string()),
            via_fallback: false,
        };
        assert_eq!(ParsedOutput::Ok(vec![field.clone()]).fields().len(), 1);
        assert_eq!(
            ParsedOutput::PartialOk(vec![field], vec![FieldKey::new("a", "c")]).fields().len(),
            1
        );
        assert!(ParsedOutput::ParseError("junk".to_string()).fields().is_empty());
    }

    #[test]
    fn test_failed_result() {
        let result = ProviderResult::failed("p", CallTarget::Full, Duration::from_millis(5), ProviderErrorKind::Timeout);
        assert_eq!(result.error, Some(ProviderErrorKind::Timeout));
        assert_eq!(result.output_chars(), 0);
        assert!(result.parsed.is_parse_error());
    }

    #[test]
    fn test_error_kind_serialization() {
        let json = serde_json::to_string(&ProviderErrorKind::QuotaExceeded).unwrap();
        assert_eq!(json, "\"quota_exceeded\"");
        assert_eq!(CallTarget::Field(FieldKey::new("s", "f")).to_string(), "s.f");
    }
}
