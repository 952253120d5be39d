use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::models::{Gap, Report};

/// State of an analysis job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting for a worker
    Queued,
    /// First full pass in progress
    Running,
    /// Gap-filling passes in progress
    AwaitingGapFill,
    /// Every required field filled
    Complete,
    /// Retry budget exhausted with gaps remaining
    Partial,
    /// Cancelled, superseded, or failed on configuration
    Failed,
}

impl JobState {
    /// Check if this state can no longer change
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Complete | JobState::Partial | JobState::Failed)
    }

    /// Check if this state counts against the one-active-job-per-media rule
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    /// Whether the state machine allows moving to `next`
    pub fn can_transition_to(&self, next: JobState) -> bool {
        use JobState::*;
        match (self, next) {
            (s, _) if s.is_terminal() => false,
            (_, Failed) => true,
            (Queued, Running) => true,
            (Running, AwaitingGapFill | Complete | Partial) => true,
            (AwaitingGapFill, AwaitingGapFill | Complete | Partial) => true,
            _ => false,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            JobState::Queued => "QUEUED",
            JobState::Running => "RUNNING",
            JobState::AwaitingGapFill => "AWAITING GAP FILL",
            JobState::Complete => "COMPLETE",
            JobState::Partial => "PARTIAL",
            JobState::Failed => "FAILED",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// One unit of analysis work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub media_ref: String,
    pub priority: i32,
    pub state: JobState,
    /// Targeted passes consumed so far
    pub attempts_used: u32,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub superseded_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

impl Job {
    pub fn new(media_ref: impl Into<String>, priority: i32) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            media_ref: media_ref.into(),
            priority,
            state: JobState::Queued,
            attempts_used: 0,
            created_at: Utc::now(),
            superseded_by: None,
            failure: None,
        }
    }
}

/// How an enqueue request was resolved
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "disposition", rename_all = "snake_case")]
pub enum Disposition {
    Created,
    /// An active job already covers this media; its id is returned
    AlreadyActive,
    /// The previous active job was cancelled in favour of this one
    Superseded { previous: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Enqueued {
    pub job_id: String,
    #[serde(flatten)]
    pub disposition: Disposition,
}

/// Snapshot returned by the status API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatusView {
    pub job: Job,
    pub completeness_score: f64,
    pub gaps: Vec<Gap>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<Report>,
}

/// Record handed to the report store when a job ends
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalizedJob {
    pub job_id: String,
    pub media_ref: String,
    #[serde(default)]
    pub priority: i32,
    pub final_state: JobState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<Report>,
    pub gaps: Vec<Gap>,
    pub completeness_score: f64,
    pub attempts_used: u32,
    #[serde(default)]
    pub created_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub superseded_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

impl FinalizedJob {
    /// Status view of a job that is no longer held by the queue
    pub fn view(self) -> JobStatusView {
        JobStatusView {
            job: Job {
                id: self.job_id,
                media_ref: self.media_ref,
                priority: self.priority,
                state: self.final_state,
                attempts_used: self.attempts_used,
                created_at: self.created_at,
                superseded_by: self.superseded_by,
                failure: self.failure,
            },
            completeness_score: self.completeness_score,
            gaps: self.gaps,
            report: self.report,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_state_is_terminal() {
        assert!(JobState::Complete.is_terminal());
        assert!(JobState::Partial.is_terminal());
        assert!(JobState::Failed.is_terminal());
        assert!(!JobState::Queued.is_terminal());
        assert!(!JobState::Running.is_terminal());
        assert!(!JobState::AwaitingGapFill.is_terminal());
    }

    #[test]
    fn test_job_state_transitions() {
        use JobState::*;
        assert!(Queued.can_transition_to(Running));
        assert!(Queued.can_transition_to(Failed));
        assert!(!Queued.can_transition_to(Complete));
        assert!(Running.can_transition_to(Complete));
        assert!(Running.can_transition_to(AwaitingGapFill));
        assert!(AwaitingGapFill.can_transition_to(AwaitingGapFill));
        assert!(AwaitingGapFill.can_transition_to(Partial));
        assert!(!AwaitingGapFill.can_transition_to(Running));
        assert!(!Complete.can_transition_to(Failed));
        assert!(!Partial.can_transition_to(Complete));
        assert!(!Failed.can_transition_to(Queued));
    }

    #[test]
    fn test_new_job() {
        let job = Job::new("media/1.txt", 3);
        assert_eq!(job.state, JobState::Queued);
        assert_eq!(job.priority, 3);
        assert_eq!(job.attempts_used, 0);
        assert!(job.superseded_by.is_none());
        assert_ne!(job.id, Job::new("media/1.txt", 3).id);
    }

    #[test]
    fn test_job_state_serialization() {
        let json = serde_json::to_string(&JobState::AwaitingGapFill).unwrap();
        assert_eq!(json, "\"awaiting_gap_fill\"");
    }

    #[test]
    fn test_enqueued_serialization() {
        let enqueued = Enqueued {
            job_id: "abc".to_string(),
            disposition: Disposition::Superseded { previous: "old".to_string() },
        };
        let json = serde_json::to_string(&enqueued).unwrap();
        assert!(json.contains("\"job_id\":\"abc\""));
        assert!(json.contains("\"disposition\":\"superseded\""));
        assert!(json.contains("\"previous\":\"old\""));
    }
}
