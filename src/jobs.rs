//! Persistent status records for background ingestion.
//!
//! The whole job map lives in one JSON file keyed by job id and is rewritten
//! on every change. A job only ever moves forward:
//! `queued -> processing -> completed | failed`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tracing::debug;

use crate::error::{RagError, Result};
use crate::index::write_atomic;
use crate::models::{Job, JobStatus};

pub struct JobTracker {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JobTracker {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// Register a new job in the `queued` state.
    pub fn create(&self, filename: &str) -> Result<Job> {
        let _guard = self.guard();
        let mut jobs = read_jobs(&self.path)?;
        let now = Utc::now();
        let job = Job {
            id: uuid::Uuid::new_v4().to_string(),
            filename: filename.to_string(),
            status: JobStatus::Queued,
            error: None,
            created_at: now,
            updated_at: now,
        };
        jobs.insert(job.id.clone(), job.clone());
        write_jobs(&self.path, &jobs)?;
        debug!(job_id = %job.id, filename, "job created");
        Ok(job)
    }

    /// Move a job to `status`, recording `error` when given.
    pub fn update(&self, job_id: &str, status: JobStatus, error: Option<String>) -> Result<Job> {
        let _guard = self.guard();
        let mut jobs = read_jobs(&self.path)?;
        let job = jobs
            .get_mut(job_id)
            .ok_or_else(|| RagError::JobNotFound(job_id.to_string()))?;

        if !job.status.can_transition_to(status) {
            return Err(RagError::InvalidTransition {
                from: job.status,
                to: status,
            });
        }
        job.status = status;
        if error.is_some() {
            job.error = error;
        }
        job.updated_at = Utc::now();
        let updated = job.clone();

        write_jobs(&self.path, &jobs)?;
        debug!(job_id, status = %status, "job updated");
        Ok(updated)
    }

    pub fn get(&self, job_id: &str) -> Result<Job> {
        let _guard = self.guard();
        read_jobs(&self.path)?
            .remove(job_id)
            .ok_or_else(|| RagError::JobNotFound(job_id.to_string()))
    }

    /// All jobs, oldest first.
    pub fn list(&self) -> Result<Vec<Job>> {
        let _guard = self.guard();
        let mut jobs: Vec<Job> = read_jobs(&self.path)?.into_values().collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(jobs)
    }

    /// Run a tracker call on the blocking pool.
    ///
    /// Every tracker method reads or rewrites the job file, so async callers
    /// go through here instead of calling them on a runtime worker.
    pub async fn run_blocking<T, F>(self: &Arc<Self>, f: F) -> Result<T>
    where
        F: FnOnce(&JobTracker) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let tracker = Arc::clone(self);
        tokio::task::spawn_blocking(move || f(&tracker))
            .await
            .map_err(|e| RagError::Io(std::io::Error::other(e)))?
    }

    fn guard(&self) -> std::sync::MutexGuard<'_, ()> {
        // The lock protects no data of its own, so a poisoned guard is still usable.
        self.lock.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn read_jobs(path: &Path) -> Result<HashMap<String, Job>> {
    if !path.exists() {
        return Ok(HashMap::new());
    }
    let bytes = std::fs::read(path)?;
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(HashMap::new());
    }
    Ok(serde_json::from_slice(&bytes)?)
}

fn write_jobs(path: &Path, jobs: &HashMap<String, Job>) -> Result<()> {
    write_atomic(path, &serde_json::to_vec_pretty(jobs)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn tracker() -> (TempDir, JobTracker) {
        let tmp = TempDir::new().unwrap();
        let tracker = JobTracker::new(tmp.path().join("jobs.json"));
        (tmp, tracker)
    }

    #[test]
    fn create_then_get() {
        let (_tmp, tracker) = tracker();
        let job = tracker.create("report.pdf").unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert!(job.error.is_none());
        assert_eq!(tracker.get(&job.id).unwrap(), job);
    }

    #[test]
    fn full_lifecycle_is_persisted() {
        let (tmp, tracker) = tracker();
        let job = tracker.create("a.txt").unwrap();
        tracker.update(&job.id, JobStatus::Processing, None).unwrap();
        let done = tracker
            .update(&job.id, JobStatus::Failed, Some("boom".to_string()))
            .unwrap();
        assert_eq!(done.status, JobStatus::Failed);
        assert_eq!(done.error.as_deref(), Some("boom"));
        assert!(done.updated_at >= done.created_at);

        let reopened = JobTracker::new(tmp.path().join("jobs.json"));
        assert_eq!(reopened.get(&job.id).unwrap(), done);

        let raw: serde_json::Value =
            serde_json::from_slice(&std::fs::read(tmp.path().join("jobs.json")).unwrap()).unwrap();
        assert_eq!(raw[&job.id]["status"], "failed");
    }

    #[test]
    fn terminal_states_are_final() {
        let (_tmp, tracker) = tracker();
        let job = tracker.create("a.txt").unwrap();
        tracker.update(&job.id, JobStatus::Processing, None).unwrap();
        tracker.update(&job.id, JobStatus::Completed, None).unwrap();

        let err = tracker
            .update(&job.id, JobStatus::Processing, None)
            .unwrap_err();
        assert!(matches!(
            err,
            RagError::InvalidTransition {
                from: JobStatus::Completed,
                to: JobStatus::Processing
            }
        ));
        assert_eq!(tracker.get(&job.id).unwrap().status, JobStatus::Completed);
    }

    #[test]
    fn cannot_skip_processing() {
        let (_tmp, tracker) = tracker();
        let job = tracker.create("a.txt").unwrap();
        assert!(tracker.update(&job.id, JobStatus::Completed, None).is_err());
    }

    #[test]
    fn unknown_job() {
        let (_tmp, tracker) = tracker();
        assert!(matches!(
            tracker.get("nope").unwrap_err(),
            RagError::JobNotFound(_)
        ));
        assert!(matches!(
            tracker
                .update("nope", JobStatus::Processing, None)
                .unwrap_err(),
            RagError::JobNotFound(_)
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn blocking_calls_from_async_tasks() {
        let (_tmp, tracker) = tracker();
        let tracker = Arc::new(tracker);

        let mut handles = Vec::new();
        for i in 0..8 {
            let tracker = tracker.clone();
            handles.push(tokio::spawn(async move {
                let name = format!("{}.txt", i);
                let job = tracker.run_blocking(move |t| t.create(&name)).await.unwrap();
                let id = job.id.clone();
                tracker
                    .run_blocking(move |t| t.update(&id, JobStatus::Processing, None))
                    .await
                    .unwrap();
                job.id
            }));
        }
        for h in handles {
            let id = h.await.unwrap();
            let job = tracker.run_blocking(move |t| t.get(&id)).await.unwrap();
            assert_eq!(job.status, JobStatus::Processing);
        }
        assert_eq!(tracker.run_blocking(|t| t.list()).await.unwrap().len(), 8);

        let err = tracker
            .run_blocking(|t| t.get("missing"))
            .await
            .unwrap_err();
        assert!(matches!(err, RagError::JobNotFound(_)));
    }

    #[test]
    fn list_is_oldest_first() {
        let (_tmp, tracker) = tracker();
        let a = tracker.create("a.txt").unwrap();
        let b = tracker.create("b.txt").unwrap();
        let listed = tracker.list().unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed[0].created_at <= listed[1].created_at);
        let ids: Vec<&str> = listed.iter().map(|j| j.id.as_str()).collect();
        assert!(ids.contains(&a.id.as_str()));
        assert!(ids.contains(&b.id.as_str()));
    }
}
