//! Core data models used throughout docqa.
//!
//! These types represent the passages, jobs, and query results that flow
//! through the ingestion and retrieval pipeline.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A chunk of a source document stored for retrieval.
///
/// `id` is the passage's position in the metadata sequence at insertion time
/// and never changes afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Passage {
    pub id: u64,
    pub doc_id: String,
    pub source: String,
    #[serde(rename = "chunk")]
    pub text: String,
}

/// A passage that has not been assigned an id yet.
#[derive(Debug, Clone)]
pub struct NewPassage {
    pub doc_id: String,
    pub source: String,
    pub text: String,
}

/// A search hit: inner-product score plus the passage it refers to.
#[derive(Debug, Clone)]
pub struct ScoredPassage {
    pub score: f32,
    pub passage: Passage,
}

/// Lifecycle of an ingestion job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Whether `self -> next` follows Queued -> Processing -> {Completed, Failed}.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Queued, JobStatus::Processing)
                | (JobStatus::Processing, JobStatus::Completed)
                | (JobStatus::Processing, JobStatus::Failed)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// A unit of asynchronous ingestion work with an observable status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub filename: String,
    pub status: JobStatus,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One retrieved passage as returned to `ask` callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextChunk {
    pub score: f32,
    pub source: String,
    pub doc_id: String,
    pub chunk: String,
}

impl From<ScoredPassage> for ContextChunk {
    fn from(hit: ScoredPassage) -> Self {
        Self {
            score: hit.score,
            source: hit.passage.source,
            doc_id: hit.passage.doc_id,
            chunk: hit.passage.text,
        }
    }
}

/// Result of a question against the index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AskResponse {
    pub answer: String,
    pub contexts: Vec<ContextChunk>,
    pub latency_ms: u64,
}

impl AskResponse {
    /// Distinct source labels in first-seen order.
    pub fn sources(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for c in &self.contexts {
            if !out.contains(&c.source) {
                out.push(c.source.clone());
            }
        }
        out
    }
}

/// Outcome of a synchronous ingest.
#[derive(Debug, Clone, Serialize)]
pub struct IngestReport {
    pub doc_id: String,
    pub chunks: usize,
    pub latency_ms: u64,
}
