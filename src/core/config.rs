use std::path::{Path, PathBuf};
use tracing::info;

use crate::error::AnalyzerError;
use crate::models::{Config, ConfigError, SectionSchema};

/// Load configuration with CLI overrides.
///
/// An explicit path must exist; otherwise sessionlens.toml in the working
/// directory is used when present.
pub fn load_config(
    config_path: Option<&Path>,
    workers: Option<usize>,
    budget: Option<u32>,
) -> Result<Config, AnalyzerError> {
    let config = match config_path {
        Some(path) => Config::load_from_file(path)?,
        None => Config::load_from_dir(&std::env::current_dir()?)?,
    };
    let config = config.with_overrides(workers, budget);

    info!(
        "Configuration loaded: providers={}, workers={}, budget={} passes",
        config.providers.len(),
        config.queue.workers,
        config.retry.max_targeted_passes
    );

    Ok(config)
}

/// The schema named by the config, or the built-in one.
///
/// A relative `schema_path` is resolved against `base_dir`.
pub fn load_schema(config: &Config, base_dir: &Path) -> Result<SectionSchema, ConfigError> {
    match &config.schema_path {
        Some(path) => {
            let resolved: PathBuf = if path.is_absolute() {
                path.clone()
            } else {
                base_dir.join(path)
            };
            SectionSchema::load_from_file(&resolved)
        }
        None => Ok(SectionSchema::standard()),
    }
}

/// Directory relative paths in a config file are resolved against
pub fn config_base_dir(config_path: Option<&Path>) -> Result<PathBuf, AnalyzerError> {
    match config_path.and_then(|p| p.parent()).filter(|p| !p.as_os_str().is_empty()) {
        Some(parent) => Ok(parent.to_path_buf()),
        None => Ok(std::env::current_dir()?),
    }
}
