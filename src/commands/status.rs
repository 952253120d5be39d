use std::path::Path;

use crate::core::{config_base_dir, load_config, JsonReportStore};
use crate::error::AnalyzerError;

/// Summarize finalized jobs in the report store
pub async fn show_status(config_path: Option<&Path>, verbose: bool) -> Result<(), AnalyzerError> {
    let config = load_config(config_path, None, None)?;
    let store_path = config_base_dir(config_path)?.join(&config.store.path);
    let store = JsonReportStore::open(&store_path)?;

    let summary = store.summary().await;

    println!("=== sessionlens Status ===\n");
    println!("{}", summary);
    println!();

    if verbose {
        let records = store.all().await;
        if records.is_empty() {
            println!("No finalized jobs found.");
        } else {
            println!("Jobs:");
            for record in records {
                print!(
                    "  {} [{}] {} {:.0}%",
                    record.job_id,
                    record.final_state,
                    record.media_ref,
                    record.completeness_score * 100.0
                );
                if !record.gaps.is_empty() {
                    print!(" - {} gap(s)", record.gaps.len());
                }
                if let Some(ref failure) = record.failure {
                    print!(" - {}", failure);
                }
                println!();
            }
        }
    }

    Ok(())
}
