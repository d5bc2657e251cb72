//! Core data models for reposcan.
//!
//! These types are shared across all reposcan crates and represent the
//! work records being analysed, the jobs queued against them, and the
//! embeddings computed for them.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::error::Error;

// =============================================================================
// WORK RECORD TYPES
// =============================================================================

/// A repository record as stored by ingestion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkRecord {
    pub id: Uuid,
    /// Unique identity key, e.g. `owner/name`.
    pub full_name: String,
    pub owner: Option<String>,
    pub name: Option<String>,
    pub description: Option<String>,
    pub language: Option<String>,
    pub topics: Vec<String>,
    pub stars: i32,
    pub forks: i32,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    /// Raw upstream API payload snapshot.
    pub api_data: JsonValue,
    pub readme_content: Option<String>,
    pub fetched_at: DateTime<Utc>,
}

/// Request for upserting a repository record, keyed on `full_name`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewWorkRecord {
    pub full_name: String,
    pub owner: Option<String>,
    pub name: Option<String>,
    pub description: Option<String>,
    pub language: Option<String>,
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default)]
    pub stars: i32,
    #[serde(default)]
    pub forks: i32,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub api_data: JsonValue,
    pub readme_content: Option<String>,
}

impl NewWorkRecord {
    /// Minimal record with just an identity key and a description.
    pub fn new(full_name: impl Into<String>) -> Self {
        let full_name = full_name.into();
        let (owner, name) = match full_name.split_once('/') {
            Some((o, n)) => (Some(o.to_string()), Some(n.to_string())),
            None => (None, Some(full_name.clone())),
        };
        Self {
            full_name,
            owner,
            name,
            api_data: JsonValue::Null,
            ..Default::default()
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_readme(mut self, readme: impl Into<String>) -> Self {
        self.readme_content = Some(readme.into());
        self
    }
}

// =============================================================================
// JOB TYPES
// =============================================================================

/// Kind of analysis a queue job requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Compute a semantic embedding of the record
    Embedding,
    /// Classify the record into a category
    Classification,
    /// Score the sentiment of the record's text
    Sentiment,
}

impl TaskKind {
    /// All task kinds, in declaration order.
    pub const ALL: [TaskKind; 3] = [
        TaskKind::Embedding,
        TaskKind::Classification,
        TaskKind::Sentiment,
    ];

    /// Database/wire tag for this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Embedding => "embedding",
            TaskKind::Classification => "classification",
            TaskKind::Sentiment => "sentiment",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "embedding" => Ok(TaskKind::Embedding),
            "classification" => Ok(TaskKind::Classification),
            "sentiment" => Ok(TaskKind::Sentiment),
            other => Err(Error::InvalidInput(format!("unknown task kind: {other}"))),
        }
    }
}

/// Status of a job in the queue.
///
/// Transitions only move forward: `pending` → `processing` →
/// `completed` | `failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    /// Database/wire tag for this status.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    /// Whether the forward transition `self -> next` is allowed.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Processing)
                | (JobStatus::Processing, JobStatus::Completed)
                | (JobStatus::Processing, JobStatus::Failed)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(Error::InvalidInput(format!("unknown job status: {other}"))),
        }
    }
}

/// A job in the processing queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueJob {
    pub id: Uuid,
    pub work_item_id: Uuid,
    pub task_kind: TaskKind,
    pub priority: i32,
    pub status: JobStatus,
    pub attempts: i32,
    pub created_at: DateTime<Utc>,
    pub processing_started_at: Option<DateTime<Utc>>,
    pub processing_completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

/// Result of a lease reclaim sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReclaimOutcome {
    /// Jobs returned to `pending` for another attempt.
    pub requeued: u64,
    /// Jobs failed because their attempts were exhausted.
    pub failed: u64,
}

impl ReclaimOutcome {
    pub fn is_empty(&self) -> bool {
        self.requeued == 0 && self.failed == 0
    }
}

/// Claim time at or before which a `processing` job's lease has expired.
///
/// Fails with [`Error::InvalidInput`] when `now - lease` is not a
/// representable timestamp.
pub fn lease_cutoff(now: DateTime<Utc>, lease: Duration) -> crate::error::Result<DateTime<Utc>> {
    chrono::Duration::from_std(lease)
        .ok()
        .and_then(|lease| now.checked_sub_signed(lease))
        .ok_or_else(|| Error::InvalidInput(format!("lease out of range: {}s", lease.as_secs())))
}

/// Error message recorded on jobs whose lease ran out for the last time.
pub fn lease_expired_message(attempts: i32) -> String {
    format!("lease expired after {attempts} attempts")
}

// =============================================================================
// EMBEDDING TYPES
// =============================================================================

/// Embedding vector type (re-exported from pgvector).
pub use pgvector::Vector;

/// A cached embedding for one (work record, model) pair.
#[derive(Debug, Clone)]
pub struct Embedding {
    pub work_item_id: Uuid,
    pub model_id: String,
    pub vector: Vector,
    /// Exact text that produced `vector`.
    pub input_text: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_kind_tags_round_trip() {
        for kind in TaskKind::ALL {
            assert_eq!(kind.as_str().parse::<TaskKind>().unwrap(), kind);
        }
    }

    #[test]
    fn test_task_kind_unknown_is_rejected() {
        assert!("Embedding".parse::<TaskKind>().is_err());
        assert!("".parse::<TaskKind>().is_err());
    }

    #[test]
    fn test_task_kind_serde_matches_tag() {
        let json = serde_json::to_string(&TaskKind::Classification).unwrap();
        assert_eq!(json, "\"classification\"");
    }

    #[test]
    fn test_job_status_parse() {
        assert_eq!("processing".parse::<JobStatus>().unwrap(), JobStatus::Processing);
        assert!("running".parse::<JobStatus>().is_err());
    }

    #[test]
    fn test_job_status_forward_transitions_only() {
        use JobStatus::*;
        assert!(Pending.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Completed));
        assert!(Processing.can_transition_to(Failed));

        assert!(!Pending.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Pending));
        assert!(!Failed.can_transition_to(Processing));
        assert!(!Completed.can_transition_to(Failed));
    }

    #[test]
    fn test_new_work_record_splits_owner() {
        let rec = NewWorkRecord::new("tokio-rs/tokio").with_description("async runtime");
        assert_eq!(rec.owner.as_deref(), Some("tokio-rs"));
        assert_eq!(rec.name.as_deref(), Some("tokio"));
        assert_eq!(rec.description.as_deref(), Some("async runtime"));
    }

    #[test]
    fn test_new_work_record_without_owner() {
        let rec = NewWorkRecord::new("standalone");
        assert!(rec.owner.is_none());
        assert_eq!(rec.name.as_deref(), Some("standalone"));
    }

    #[test]
    fn test_lease_expired_message() {
        assert_eq!(lease_expired_message(3), "lease expired after 3 attempts");
    }

    #[test]
    fn test_lease_cutoff() {
        let now = Utc::now();
        let cutoff = lease_cutoff(now, Duration::from_secs(600)).unwrap();
        assert_eq!(now - cutoff, chrono::Duration::seconds(600));
        assert_eq!(lease_cutoff(now, Duration::ZERO).unwrap(), now);
    }

    #[test]
    fn test_lease_cutoff_out_of_range() {
        let err = lease_cutoff(Utc::now(), Duration::from_secs(10_000_000_000_000)).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));

        let err = lease_cutoff(Utc::now(), Duration::MAX).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[test]
    fn test_reclaim_outcome_empty() {
        assert!(ReclaimOutcome::default().is_empty());
        assert!(!ReclaimOutcome { requeued: 1, failed: 0 }.is_empty());
    }
}
