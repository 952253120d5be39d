use chrono::Utc;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::core::orchestrator::{JobContext, Orchestrator, PassOutcome};
use crate::core::retry::GapFiller;
use crate::core::store::ReportStore;
use crate::core::transcript::TranscriptSource;
use crate::error::{PipelineError, QueueError};
use crate::models::{
    Config, Disposition, Enqueued, FinalizedJob, Gap, Job, JobState, JobStatusView, Report,
    RetryConfig, TimeoutConfig,
};

/// Latest published state of one job
#[derive(Debug, Clone)]
pub struct Progress {
    pub job: Job,
    pub report: Option<Report>,
    pub gaps: Vec<Gap>,
    pub score: f64,
}

impl Progress {
    fn view(&self) -> JobStatusView {
        JobStatusView {
            job: self.job.clone(),
            completeness_score: self.score,
            gaps: self.gaps.clone(),
            report: self.report.clone(),
        }
    }
}

/// Heap entry: higher priority first, then earlier enqueue
#[derive(Debug, PartialEq, Eq)]
struct QueuedJob {
    priority: i32,
    seq: u64,
    job_id: String,
}

impl Ord for QueuedJob {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueuedJob {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct JobEntry {
    progress: watch::Sender<Progress>,
    cancel: CancellationToken,
}

#[derive(Default)]
struct QueueState {
    jobs: HashMap<String, JobEntry>,
    active_by_media: HashMap<String, String>,
    heap: BinaryHeap<QueuedJob>,
    seq: u64,
    /// Finished jobs still in `jobs`, oldest first
    finished: VecDeque<String>,
}

/// A job handed to a worker
struct Claimed {
    job: Job,
    progress: watch::Sender<Progress>,
    cancel: CancellationToken,
}

/// How the pipeline for one job ended
enum Ending {
    Finished {
        report: Report,
        gaps: Vec<Gap>,
        score: f64,
        passes_used: u32,
    },
    Failed(String),
    Cancelled,
}

struct QueueInner {
    workers: usize,
    retain_finished: usize,
    timeouts: TimeoutConfig,
    retry: RetryConfig,
    orchestrator: Arc<Orchestrator>,
    filler: GapFiller,
    store: Arc<dyn ReportStore>,
    transcripts: Arc<dyn TranscriptSource>,
    state: Mutex<QueueState>,
    notify: Notify,
    shutdown: CancellationToken,
    handles: StdMutex<Vec<JoinHandle<()>>>,
}

/// Priority queue of analysis jobs with a fixed worker pool
#[derive(Clone)]
pub struct QueueManager {
    inner: Arc<QueueInner>,
}

impl QueueManager {
    pub fn new(
        config: &Config,
        orchestrator: Arc<Orchestrator>,
        store: Arc<dyn ReportStore>,
        transcripts: Arc<dyn TranscriptSource>,
    ) -> Self {
        let filler = GapFiller::new(orchestrator.clone(), config.retry.clone());
        Self {
            inner: Arc::new(QueueInner {
                workers: config.queue.workers.max(1),
                retain_finished: config.queue.retain_finished,
                timeouts: config.timeouts.clone(),
                retry: config.retry.clone(),
                orchestrator,
                filler,
                store,
                transcripts,
                state: Mutex::new(QueueState::default()),
                notify: Notify::new(),
                shutdown: CancellationToken::new(),
                handles: StdMutex::new(Vec::new()),
            }),
        }
    }

    /// Submit a media reference for analysis.
    ///
    /// While a job for the same media is active its id is returned, unless
    /// `force_reanalysis` is set: then the active job is superseded, cancelled
    /// and failed, and a new job is queued.
    pub async fn enqueue(&self, media_ref: &str, priority: i32, force_reanalysis: bool) -> Result<Enqueued, QueueError> {
        let media_ref = media_ref.trim();
        if media_ref.is_empty() {
            return Err(QueueError::InvalidMediaRef(media_ref.to_string()));
        }
        if self.inner.shutdown.is_cancelled() {
            return Err(QueueError::ShuttingDown);
        }

        let mut superseded: Option<FinalizedJob> = None;
        let job = Job::new(media_ref, priority);
        let job_id = job.id.clone();

        let disposition = {
            let mut state = self.inner.state.lock().await;

            let active = state
                .active_by_media
                .get(media_ref)
                .filter(|id| {
                    state
                        .jobs
                        .get(id.as_str())
                        .is_some_and(|entry| entry.progress.borrow().job.state.is_active())
                })
                .cloned();
            let disposition = match active {
                Some(active_id) if !force_reanalysis => {
                    debug!(job_id = %active_id, media_ref, "Job already active");
                    return Ok(Enqueued {
                        job_id: active_id,
                        disposition: Disposition::AlreadyActive,
                    });
                }
                Some(active_id) => {
                    if let Some(entry) = state.jobs.get(&active_id) {
                        entry.cancel.cancel();
                        let reason = format!("superseded by {}", job_id);
                        superseded = fail(&entry.progress, &reason, Some(job_id.clone()));
                    }
                    info!(job_id = %active_id, superseded_by = %job_id, "Superseding active job");
                    Disposition::Superseded { previous: active_id }
                }
                None => Disposition::Created,
            };

            state.seq += 1;
            let seq = state.seq;
            state.heap.push(QueuedJob {
                priority,
                seq,
                job_id: job_id.clone(),
            });
            state.active_by_media.insert(media_ref.to_string(), job_id.clone());
            let (progress, _) = watch::channel(Progress {
                job,
                report: None,
                gaps: Vec::new(),
                score: 0.0,
            });
            state.jobs.insert(
                job_id.clone(),
                JobEntry {
                    progress,
                    cancel: CancellationToken::new(),
                },
            );
            disposition
        };

        info!(job_id = %job_id, media_ref, priority, "Job queued");
        self.inner.notify.notify_one();
        if let Some(record) = superseded {
            self.inner.finish(record).await;
        }

        Ok(Enqueued { job_id, disposition })
    }

    /// Cancel a queued or running job; it ends Failed
    pub async fn cancel(&self, job_id: &str) -> Result<(), QueueError> {
        let record = {
            let mut state = self.inner.state.lock().await;
            let Some(entry) = state.jobs.get(job_id) else {
                drop(state);
                let archived = self.inner.archived(job_id).await?;
                return Err(QueueError::AlreadyTerminal {
                    job_id: job_id.to_string(),
                    state: archived.job.state,
                });
            };

            let current = entry.progress.borrow().job.state;
            if current.is_terminal() {
                return Err(QueueError::AlreadyTerminal {
                    job_id: job_id.to_string(),
                    state: current,
                });
            }
            entry.cancel.cancel();
            let record = fail(&entry.progress, "cancelled", None);
            let media_ref = entry.progress.borrow().job.media_ref.clone();
            state.release_media(&media_ref, job_id);
            record
        };

        info!(job_id, "Job cancelled");
        if let Some(record) = record {
            self.inner.finish(record).await;
        }
        Ok(())
    }

    /// Current job, score, gaps and best report so far.
    ///
    /// Jobs evicted from memory are answered from the report store.
    pub async fn status(&self, job_id: &str) -> Result<JobStatusView, QueueError> {
        {
            let state = self.inner.state.lock().await;
            if let Some(entry) = state.jobs.get(job_id) {
                return Ok(entry.progress.borrow().view());
            }
        }
        self.inner.archived(job_id).await
    }

    /// Watch a job's progress without polling
    pub async fn subscribe(&self, job_id: &str) -> Result<watch::Receiver<Progress>, QueueError> {
        let state = self.inner.state.lock().await;
        state
            .jobs
            .get(job_id)
            .map(|entry| entry.progress.subscribe())
            .ok_or_else(|| QueueError::NotFound(job_id.to_string()))
    }

    /// Resolve once the job reaches a terminal state
    pub async fn wait_for_terminal(&self, job_id: &str) -> Result<JobStatusView, QueueError> {
        let mut rx = match self.subscribe(job_id).await {
            Ok(rx) => rx,
            Err(QueueError::NotFound(_)) => return self.inner.archived(job_id).await,
            Err(e) => return Err(e),
        };
        let progress = rx
            .wait_for(|p| p.job.state.is_terminal())
            .await
            .map_err(|_| QueueError::NotFound(job_id.to_string()))?;
        Ok(progress.view())
    }

    /// Spawn the worker pool
    pub fn start(&self) {
        let Ok(mut handles) = self.inner.handles.lock() else {
            error!("Worker handle list poisoned, not starting workers");
            return;
        };
        if !handles.is_empty() {
            return;
        }
        for worker in 0..self.inner.workers {
            let inner = self.inner.clone();
            handles.push(tokio::spawn(async move { inner.worker_loop(worker).await }));
        }
        info!("Started {} worker(s)", self.inner.workers);
    }

    /// Stop the workers; running jobs are cancelled and end Failed
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let handles: Vec<JoinHandle<()>> = match self.inner.handles.lock() {
            Ok(mut handles) => handles.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("Worker ended abnormally: {}", e);
            }
        }
        info!("Queue shut down");
    }
}

impl QueueState {
    fn release_media(&mut self, media_ref: &str, job_id: &str) {
        if self.active_by_media.get(media_ref).map(String::as_str) == Some(job_id) {
            self.active_by_media.remove(media_ref);
        }
    }

    /// Remember a finished job, evicting the oldest beyond `keep`
    fn retire(&mut self, job_id: &str, keep: usize) {
        self.finished.push_back(job_id.to_string());
        while self.finished.len() > keep {
            let Some(old) = self.finished.pop_front() else {
                break;
            };
            if self.jobs.remove(&old).is_some() {
                debug!(job_id = %old, "Evicted finished job from memory");
            }
        }
    }
}

/// Publish progress unless the job is already terminal
fn publish(progress: &watch::Sender<Progress>, update: impl FnOnce(&mut Progress)) -> bool {
    progress.send_if_modified(|p| {
        if p.job.state.is_terminal() {
            return false;
        }
        update(p);
        true
    })
}

/// Move to `next` if the state machine allows it
fn transition(progress: &watch::Sender<Progress>, next: JobState, update: impl FnOnce(&mut Progress)) -> bool {
    progress.send_if_modified(|p| {
        if !p.job.state.can_transition_to(next) {
            return false;
        }
        p.job.state = next;
        update(p);
        true
    })
}

fn finalized(progress: &Progress) -> FinalizedJob {
    FinalizedJob {
        job_id: progress.job.id.clone(),
        media_ref: progress.job.media_ref.clone(),
        priority: progress.job.priority,
        final_state: progress.job.state,
        report: progress.report.clone(),
        gaps: progress.gaps.clone(),
        completeness_score: progress.score,
        attempts_used: progress.job.attempts_used,
        created_at: progress.job.created_at,
        finished_at: Utc::now(),
        superseded_by: progress.job.superseded_by.clone(),
        failure: progress.job.failure.clone(),
    }
}

/// Fail a job; returns the record to persist when this call did the transition
fn fail(progress: &watch::Sender<Progress>, reason: &str, superseded_by: Option<String>) -> Option<FinalizedJob> {
    let moved = transition(progress, JobState::Failed, |p| {
        p.job.failure = Some(reason.to_string());
        p.job.superseded_by = superseded_by;
    });
    moved.then(|| finalized(&progress.borrow()))
}

impl QueueInner {
    async fn worker_loop(self: Arc<Self>, worker: usize) {
        debug!(worker, "Worker started");
        loop {
            let claimed = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                claimed = self.next_job() => claimed,
            };
            self.run_job(claimed).await;
        }
        debug!(worker, "Worker stopped");
    }

    /// Wait for the highest-priority queued job and mark it Running
    async fn next_job(&self) -> Claimed {
        loop {
            {
                let mut state = self.state.lock().await;
                while let Some(queued) = state.heap.pop() {
                    let Some(entry) = state.jobs.get(&queued.job_id) else {
                        continue;
                    };
                    if !transition(&entry.progress, JobState::Running, |_| {}) {
                        // cancelled or superseded while waiting
                        continue;
                    }
                    let claimed = Claimed {
                        job: entry.progress.borrow().job.clone(),
                        progress: entry.progress.clone(),
                        cancel: entry.cancel.clone(),
                    };
                    if !state.heap.is_empty() {
                        self.notify.notify_one();
                    }
                    return claimed;
                }
            }
            self.notify.notified().await;
        }
    }

    async fn run_job(&self, claimed: Claimed) {
        let Claimed { job, progress, cancel } = claimed;
        info!(job_id = %job.id, media_ref = %job.media_ref, "Job started");

        let deadline = Instant::now() + self.timeouts.job();
        let ending = tokio::select! {
            ending = self.pipeline(&job, &progress, cancel.clone()) => Some(ending),
            _ = tokio::time::sleep_until(deadline) => None,
            _ = self.shutdown.cancelled() => Some(Ending::Failed("queue shut down".to_string())),
        };
        cancel.cancel();

        let mut state = self.state.lock().await;
        let record = match ending {
            None => {
                warn!(job_id = %job.id, "Job deadline exceeded, finalizing with best report so far");
                let validator = self.orchestrator.validator();
                let moved = transition(&progress, JobState::Partial, |p| {
                    let report = p
                        .report
                        .get_or_insert_with(|| Report::empty(validator.schema()));
                    let validation = validator.validate(report);
                    p.gaps = validation.gaps;
                    p.score = validation.score;
                });
                moved.then(|| finalized(&progress.borrow()))
            }
            Some(Ending::Finished { report, gaps, score, passes_used }) => {
                let next = if gaps.is_empty() { JobState::Complete } else { JobState::Partial };
                let moved = transition(&progress, next, |p| {
                    p.report = Some(report);
                    p.gaps = gaps;
                    p.score = score;
                    p.job.attempts_used = passes_used;
                });
                moved.then(|| finalized(&progress.borrow()))
            }
            Some(Ending::Failed(reason)) => fail(&progress, &reason, None),
            // cancel() or a supersede already failed and persisted the job
            Some(Ending::Cancelled) => None,
        };
        state.release_media(&job.media_ref, &job.id);
        drop(state);

        match record {
            Some(record) => {
                info!(
                    job_id = %record.job_id,
                    state = %record.final_state,
                    score = record.completeness_score,
                    gaps = record.gaps.len(),
                    "Job finished"
                );
                self.finish(record).await;
            }
            None => debug!(job_id = %job.id, "Job already finalized elsewhere"),
        }
    }

    async fn pipeline(&self, job: &Job, progress: &watch::Sender<Progress>, cancel: CancellationToken) -> Ending {
        let transcript = tokio::select! {
            _ = cancel.cancelled() => return Ending::Cancelled,
            result = self.transcripts.transcript(&job.media_ref) => result,
        };
        let transcript = match transcript {
            Ok(text) => text,
            Err(e) => {
                warn!(job_id = %job.id, "Transcript unavailable: {}", e);
                return Ending::Failed(format!("transcript unavailable: {}", e));
            }
        };

        let mut ctx = JobContext::new(job.id.clone(), cancel, self.retry.circuit_breaker_threshold);

        let first = match self.orchestrator.run_full_pass(&mut ctx, &transcript).await {
            Ok(outcome) => outcome,
            Err(PipelineError::Cancelled) => return Ending::Cancelled,
            Err(e @ PipelineError::NoProviders) => return Ending::Failed(e.to_string()),
        };
        publish_outcome(progress, &first, 0);

        if first.gaps.is_empty() {
            return Ending::Finished {
                report: first.report,
                gaps: first.gaps,
                score: first.score,
                passes_used: 0,
            };
        }

        transition(progress, JobState::AwaitingGapFill, |_| {});
        let resolution = self
            .filler
            .resolve_gaps(&mut ctx, &transcript, first.report, first.gaps, |outcome, passes| {
                publish_outcome(progress, outcome, passes);
            })
            .await;

        match resolution {
            Ok(resolution) => Ending::Finished {
                report: resolution.report,
                gaps: resolution.gaps,
                score: resolution.score,
                passes_used: resolution.passes_used,
            },
            Err(PipelineError::Cancelled) => Ending::Cancelled,
            Err(e @ PipelineError::NoProviders) => Ending::Failed(e.to_string()),
        }
    }

    /// Persist a finalized job, then let it age out of memory
    async fn finish(&self, record: FinalizedJob) {
        let job_id = record.job_id.clone();
        if let Err(e) = self.store.persist(record).await {
            // keep it in memory; the store cannot answer for it
            warn!(job_id = %job_id, "Failed to persist finalized job: {}", e);
            return;
        }
        self.state.lock().await.retire(&job_id, self.retain_finished);
    }

    async fn archived(&self, job_id: &str) -> Result<JobStatusView, QueueError> {
        let record = self
            .store
            .get(job_id)
            .await
            .map_err(|e| QueueError::Store(e.to_string()))?
            .ok_or_else(|| QueueError::NotFound(job_id.to_string()))?;
        Ok(record.view())
    }
}

fn publish_outcome(progress: &watch::Sender<Progress>, outcome: &PassOutcome, passes_used: u32) {
    publish(progress, |p| {
        p.report = Some(outcome.report.clone());
        p.gaps = outcome.gaps.clone();
        p.score = outcome.score;
        p.job.attempts_used = passes_used;
    });
}
