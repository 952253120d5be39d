use async_trait::async_trait;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::StoreError;
use crate::models::{FinalizedJob, JobState};

/// Receives every job exactly once, when it reaches a terminal state
#[async_trait]
pub trait ReportStore: Send + Sync {
    async fn persist(&self, record: FinalizedJob) -> Result<(), StoreError>;

    async fn get(&self, job_id: &str) -> Result<Option<FinalizedJob>, StoreError>;
}

/// Finalized jobs kept in one JSON file keyed by job id
pub struct JsonReportStore {
    path: PathBuf,
    records: RwLock<HashMap<String, FinalizedJob>>,
}

impl JsonReportStore {
    /// Open the store, loading any existing records
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let records = Self::load(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            records: RwLock::new(records),
        })
    }

    fn load(path: &Path) -> Result<HashMap<String, FinalizedJob>, StoreError> {
        if !path.exists() {
            debug!("Report store does not exist, starting fresh");
            return Ok(HashMap::new());
        }

        let content = fs::read_to_string(path)
            .map_err(|e| StoreError::ReadError(path.to_path_buf(), e))?;
        if content.trim().is_empty() {
            return Ok(HashMap::new());
        }

        let records: Vec<FinalizedJob> = serde_json::from_str(&content)
            .map_err(|e| StoreError::ParseError(path.to_path_buf(), e.to_string()))?;
        info!("Loaded {} finalized job(s) from {}", records.len(), path.display());

        Ok(records.into_iter().map(|r| (r.job_id.clone(), r)).collect())
    }

    /// Save a snapshot atomically (write to temp, then rename)
    fn save(path: &Path, mut snapshot: Vec<FinalizedJob>) -> Result<(), StoreError> {
        snapshot.sort_by(|a, b| a.finished_at.cmp(&b.finished_at).then(a.job_id.cmp(&b.job_id)));

        let json = serde_json::to_string_pretty(&snapshot)
            .map_err(|e| StoreError::SerializeError(e.to_string()))?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .map_err(|e| StoreError::WriteError(parent.to_path_buf(), e))?;
        }

        let temp_file = path.with_extension("json.tmp");
        fs::write(&temp_file, &json)
            .map_err(|e| StoreError::WriteError(temp_file.clone(), e))?;
        fs::rename(&temp_file, path)
            .map_err(|e| StoreError::WriteError(path.to_path_buf(), e))?;

        debug!("Saved {} finalized job(s)", snapshot.len());
        Ok(())
    }

    /// All records, oldest first
    pub async fn all(&self) -> Vec<FinalizedJob> {
        let records = self.records.read().await;
        let mut all: Vec<FinalizedJob> = records.values().cloned().collect();
        all.sort_by(|a, b| a.finished_at.cmp(&b.finished_at));
        all
    }

    /// Counts by final state
    pub async fn summary(&self) -> StoreSummary {
        let records = self.records.read().await;
        let mut summary = StoreSummary::default();
        for record in records.values() {
            match record.final_state {
                JobState::Complete => summary.complete += 1,
                JobState::Partial => summary.partial += 1,
                JobState::Failed => summary.failed += 1,
                _ => {}
            }
        }
        summary.total = records.len();
        summary
    }
}

#[async_trait]
impl ReportStore for JsonReportStore {
    async fn persist(&self, record: FinalizedJob) -> Result<(), StoreError> {
        // the write guard is held until the file is replaced so saves land in order
        let mut records = self.records.write().await;
        records.insert(record.job_id.clone(), record);
        let snapshot: Vec<FinalizedJob> = records.values().cloned().collect();
        let path = self.path.clone();

        tokio::task::spawn_blocking(move || Self::save(&path, snapshot))
            .await
            .map_err(|e| StoreError::TaskFailed(e.to_string()))?
    }

    async fn get(&self, job_id: &str) -> Result<Option<FinalizedJob>, StoreError> {
        Ok(self.records.read().await.get(job_id).cloned())
    }
}

/// Store that keeps records in memory only
#[derive(Default)]
pub struct MemoryReportStore {
    records: RwLock<Vec<FinalizedJob>>,
}

impl MemoryReportStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every persisted record in arrival order, duplicates included
    pub async fn records(&self) -> Vec<FinalizedJob> {
        self.records.read().await.clone()
    }
}

#[async_trait]
impl ReportStore for MemoryReportStore {
    async fn persist(&self, record: FinalizedJob) -> Result<(), StoreError> {
        self.records.write().await.push(record);
        Ok(())
    }

    async fn get(&self, job_id: &str) -> Result<Option<FinalizedJob>, StoreError> {
        Ok(self
            .records
            .read()
            .await
            .iter()
            .rev()
            .find(|r| r.job_id == job_id)
            .cloned())
    }
}

/// Summary of finalized jobs
#[derive(Debug, Default, PartialEq, Eq)]
pub struct StoreSummary {
    pub total: usize,
    pub complete: usize,
    pub partial: usize,
    pub failed: usize,
}

impl std::fmt::Display for StoreSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Total: {} | Complete: {} | Partial: {} | Failed: {}",
            self.total, self.complete, self.partial, self.failed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::TempDir;

    fn record(id: &str, state: JobState) -> FinalizedJob {
        FinalizedJob {
            job_id: id.to_string(),
            media_ref: format!("{}.txt", id),
            priority: 0,
            final_state: state,
            report: None,
            gaps: vec![],
            completeness_score: if state == JobState::Complete { 1.0 } else { 0.5 },
            attempts_used: 0,
            created_at: Utc::now(),
            finished_at: Utc::now(),
            superseded_by: None,
            failure: None,
        }
    }

    #[tokio::test]
    async fn test_persist_and_reload() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("reports.json");

        {
            let store = JsonReportStore::open(&path).unwrap();
            store.persist(record("job1", JobState::Complete)).await.unwrap();
            store.persist(record("job2", JobState::Partial)).await.unwrap();
        }

        let store = JsonReportStore::open(&path).unwrap();
        assert_eq!(store.get("job1").await.unwrap().unwrap().final_state, JobState::Complete);
        assert!(store.get("missing").await.unwrap().is_none());
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_persists_all_reach_disk() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("reports.json");
        let store = std::sync::Arc::new(JsonReportStore::open(&path).unwrap());

        let writes = (0..16).map(|i| {
            let store = store.clone();
            tokio::spawn(async move { store.persist(record(&format!("job{}", i), JobState::Complete)).await })
        });
        for result in futures::future::join_all(writes).await {
            result.unwrap().unwrap();
        }

        let reloaded = JsonReportStore::open(&path).unwrap();
        assert_eq!(reloaded.summary().await.total, 16);
    }

    #[tokio::test]
    async fn test_summary() {
        let temp_dir = TempDir::new().unwrap();
        let store = JsonReportStore::open(&temp_dir.path().join("nested/reports.json")).unwrap();
        store.persist(record("a", JobState::Complete)).await.unwrap();
        store.persist(record("b", JobState::Partial)).await.unwrap();
        store.persist(record("c", JobState::Failed)).await.unwrap();

        let summary = store.summary().await;
        assert_eq!(
            summary,
            StoreSummary { total: 3, complete: 1, partial: 1, failed: 1 }
        );
        assert_eq!(store.all().await.len(), 3);
    }

    #[tokio::test]
    async fn test_corrupt_store_is_error() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("reports.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(JsonReportStore::open(&path), Err(StoreError::ParseError(..))));
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryReportStore::new();
        store.persist(record("a", JobState::Failed)).await.unwrap();
        assert_eq!(store.records().await.len(), 1);
        assert!(store.get("a").await.unwrap().is_some());
    }
}
