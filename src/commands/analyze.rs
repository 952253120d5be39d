use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

use crate::core::{
    config_base_dir, load_config, load_schema, FileTranscriptSource, JsonReportStore, Orchestrator,
    QueueManager,
};
use crate::error::AnalyzerError;
use crate::models::{Config, FieldState, JobStatusView, Report};

/// Options for a one-shot analysis
#[derive(Debug, Clone)]
pub struct AnalyzeOptions {
    pub media_ref: String,
    pub priority: i32,
    pub force: bool,
    pub transcripts: PathBuf,
    pub config_path: Option<PathBuf>,
    pub workers: Option<usize>,
    pub budget: Option<u32>,
    pub json: bool,
}

/// Load and validate config, then wire the queue with file-backed collaborators
pub fn build_queue(
    config_path: Option<&Path>,
    workers: Option<usize>,
    budget: Option<u32>,
    transcripts: &Path,
) -> Result<(Config, QueueManager), AnalyzerError> {
    let config = load_config(config_path, workers, budget)?;
    config.validate()?;

    let base_dir = config_base_dir(config_path)?;
    let schema = Arc::new(load_schema(&config, &base_dir)?);
    let orchestrator = Arc::new(Orchestrator::from_config(&config, schema)?);

    let store_path = if config.store.path.is_absolute() {
        config.store.path.clone()
    } else {
        base_dir.join(&config.store.path)
    };
    let store = Arc::new(JsonReportStore::open(&store_path)?);
    let transcripts = Arc::new(FileTranscriptSource::new(transcripts));

    let queue = QueueManager::new(&config, orchestrator, store, transcripts);
    Ok((config, queue))
}

/// Run the pipeline once in-process and print the outcome
pub async fn analyze_media(options: AnalyzeOptions) -> Result<(), AnalyzerError> {
    let (_config, queue) = build_queue(
        options.config_path.as_deref(),
        options.workers,
        options.budget,
        &options.transcripts,
    )?;
    queue.start();

    let enqueued = queue
        .enqueue(&options.media_ref, options.priority, options.force)
        .await?;
    info!("Analyzing {} as job {}", options.media_ref, enqueued.job_id);

    let result = queue.wait_for_terminal(&enqueued.job_id).await;
    queue.shutdown().await;
    let view = result?;

    if options.json {
        println!("{}", serde_json::to_string_pretty(&view)?);
    } else {
        print_job_view(&view);
    }
    Ok(())
}

/// Human-readable job outcome
pub fn print_job_view(view: &JobStatusView) {
    println!("=== Job {} ===", view.job.id);
    println!("Media:        {}", view.job.media_ref);
    println!("State:        {}", view.job.state);
    println!("Completeness: {:.0}%", view.completeness_score * 100.0);
    println!("Passes used:  {}", view.job.attempts_used);
    if let Some(failure) = &view.job.failure {
        println!("Failure:      {}", failure);
    }

    if !view.gaps.is_empty() {
        println!();
        println!("Gaps:");
        for gap in &view.gaps {
            println!("  - {}", gap);
        }
    }

    if let Some(report) = &view.report {
        println!();
        print_report(report);
    }
}

pub fn print_report(report: &Report) {
    for section in &report.sections {
        println!("## {}", section.id);
        for slot in &section.fields {
            match &slot.state {
                FieldState::Filled { value, confidence, provider_id } => {
                    let text = match value {
                        serde_json::Value::String(s) => s.clone(),
                        serde_json::Value::Array(items) => items
                            .iter()
                            .map(|i| i.as_str().map(str::to_string).unwrap_or_else(|| i.to_string()))
                            .collect::<Vec<_>>()
                            .join("; "),
                        other => other.to_string(),
                    };
                    println!("  {}: {} [{:.2} via {}]", slot.id, text, confidence, provider_id);
                }
                FieldState::Missing => println!("  {}: (missing)", slot.id),
            }
        }
    }
}
