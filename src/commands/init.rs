use std::fs;
use std::path::Path;
use tracing::info;

use crate::error::AnalyzerError;

/// Default configuration written by `sessionlens init`
pub const DEFAULT_CONFIG: &str = r#"# sessionlens configuration

[queue]
workers = 4
retain_finished = 256

[timeouts]
# must satisfy call < pass < job
call_seconds = 60
pass_seconds = 120
job_seconds = 900
timeout_retry_multiplier = 2.0

[retry]
max_targeted_passes = 5
max_attempts_per_gap = 3
backoff_base_ms = 500
backoff_cap_ms = 30000
backoff_jitter_ms = 250
circuit_breaker_threshold = 3

[heuristics]
token_limit_ratio = 0.95
excerpt_chars = 6000
min_excerpt_chars = 800

[store]
path = "reports.json"

[[providers]]
id = "local"
kind = "ollama"
url = "http://localhost:11434"
model = "qwen3:14b"
max_output_tokens = 4096
requests_per_minute = 60
burst = 4

# [[providers]]
# id = "cloud"
# kind = "openai"
# url = "https://api.openai.com"
# model = "gpt-4o-mini"
# api_key_env = "OPENAI_API_KEY"
# requests_per_minute = 30
"#;

/// Write a default sessionlens.toml and a transcripts directory
pub fn init_project(project_root: &Path) -> Result<(), AnalyzerError> {
    info!("Initializing sessionlens in {}", project_root.display());

    let transcripts_dir = project_root.join("transcripts");
    if !transcripts_dir.exists() {
        fs::create_dir_all(&transcripts_dir)?;
        info!("Created transcripts directory: {}", transcripts_dir.display());
    }

    create_file_if_not_exists(&project_root.join("sessionlens.toml"), DEFAULT_CONFIG)?;

    println!("sessionlens initialized in {}", project_root.display());
    println!();
    println!("Next steps:");
    println!("  1. Edit sessionlens.toml and configure your providers");
    println!("  2. Put transcripts under transcripts/");
    println!("  3. Run: sessionlens analyze <file> --transcripts transcripts");
    Ok(())
}

fn create_file_if_not_exists(path: &Path, content: &str) -> Result<(), AnalyzerError> {
    if path.exists() {
        info!("File already exists, skipping: {}", path.display());
    } else {
        fs::write(path, content)?;
        info!("Created: {}", path.display());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Config;
    use tempfile::TempDir;

    #[test]
    fn test_init_project_writes_valid_config() {
        let temp_dir = TempDir::new().unwrap();
        init_project(temp_dir.path()).unwrap();

        assert!(temp_dir.path().join("transcripts").is_dir());
        let config = Config::load_from_dir(temp_dir.path()).unwrap();
        assert_eq!(config.providers.len(), 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_init_project_keeps_existing_config() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join("sessionlens.toml"), "[queue]\nworkers = 7\n").unwrap();
        init_project(temp_dir.path()).unwrap();

        let config = Config::load_from_dir(temp_dir.path()).unwrap();
        assert_eq!(config.queue.workers, 7);
    }
}
