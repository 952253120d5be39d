use std::path::Path;
use std::sync::Arc;

use crate::core::{config_base_dir, load_config, load_schema, CompletenessValidator};
use crate::error::AnalyzerError;
use crate::models::{FinalizedJob, Report, SectionSchema};

fn active_schema(config_path: Option<&Path>) -> Result<(SectionSchema, Vec<String>), AnalyzerError> {
    let config = load_config(config_path, None, None)?;
    let schema = load_schema(&config, &config_base_dir(config_path)?)?;
    Ok((schema, config.heuristics.placeholder_markers))
}

/// Print the active section schema
pub fn show_schema(config_path: Option<&Path>) -> Result<(), AnalyzerError> {
    let (schema, _) = active_schema(config_path)?;

    println!("=== Report Schema ({} fields) ===", schema.total_fields());
    for section in &schema.sections {
        println!();
        println!("{} ({})", section.title, section.id);
        println!("  {}", section.description);
        for field in &section.fields {
            println!("  - {}: {} [{}]", field.id, field.description, field.kind.describe());
        }
    }
    Ok(())
}

/// Validate a saved report against the active schema and print score and gaps
pub fn score_report(config_path: Option<&Path>, report_path: &Path) -> Result<(), AnalyzerError> {
    let (schema, placeholders) = active_schema(config_path)?;
    let content = std::fs::read_to_string(report_path)?;
    // a bare report, or a finalized job record carrying one
    let report: Report = match serde_json::from_str::<Report>(&content) {
        Ok(report) => report,
        Err(_) => {
            let record: FinalizedJob = serde_json::from_str(&content)?;
            record.report.unwrap_or(Report { sections: Vec::new() })
        }
    };

    let validator = CompletenessValidator::new(Arc::new(schema), placeholders);
    let validation = validator.validate(&report);

    println!("Completeness: {:.0}%", validation.score * 100.0);
    if validation.gaps.is_empty() {
        println!("No gaps.");
    } else {
        println!("Gaps:");
        for gap in &validation.gaps {
            println!("  - {}", gap);
        }
    }
    Ok(())
}
