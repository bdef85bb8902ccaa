use crate::models::{ExecutionId, ExecutionStatus};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// In-process view of what the worker pool is doing right now.
#[derive(Clone, Default)]
pub struct JobStatus {
    inner: Arc<JobStatusData>,
}

#[derive(Default)]
struct JobStatusData {
    active: DashMap<ExecutionId, DateTime<Utc>>,
    peak_running: AtomicUsize,
    completed: AtomicUsize,
    last_outcome: Mutex<Option<(ExecutionId, ExecutionStatus)>>,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusSnapshot {
    pub running: usize,
    pub peak_running: usize,
    pub completed: usize,
    pub active_ids: Vec<String>,
    pub last_outcome: Option<String>,
}

impl JobStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn job_started(&self, id: &ExecutionId) {
        self.inner.active.insert(id.clone(), Utc::now());
        let running = self.inner.active.len();
        self.inner.peak_running.fetch_max(running, Ordering::SeqCst);
    }

    pub fn job_finished(&self, id: &ExecutionId, status: ExecutionStatus) {
        self.inner.active.remove(id);
        self.inner.completed.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut last) = self.inner.last_outcome.lock() {
            *last = Some((id.clone(), status));
        }
    }

    /// Drops a job that was left unfinished, without counting it as completed.
    pub fn job_released(&self, id: &ExecutionId) {
        self.inner.active.remove(id);
    }

    pub fn running(&self) -> usize {
        self.inner.active.len()
    }

    pub fn peak_running(&self) -> usize {
        self.inner.peak_running.load(Ordering::SeqCst)
    }

    pub fn completed(&self) -> usize {
        self.inner.completed.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> JobStatusSnapshot {
        let mut active_ids: Vec<String> = self
            .inner
            .active
            .iter()
            .map(|entry| entry.key().to_string())
            .collect();
        active_ids.sort();
        let last_outcome = self
            .inner
            .last_outcome
            .lock()
            .ok()
            .and_then(|last| last.clone())
            .map(|(id, status)| format!("{} {}", id, status));
        JobStatusSnapshot {
            running: active_ids.len(),
            peak_running: self.peak_running(),
            completed: self.completed(),
            active_ids,
            last_outcome,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracks_running_peak_and_completion() {
        let status = JobStatus::new();
        let first = ExecutionId::generate();
        let second = ExecutionId::generate();

        status.job_started(&first);
        status.job_started(&second);
        status.job_finished(&first, ExecutionStatus::Finished);

        assert_eq!(status.running(), 1);
        assert_eq!(status.peak_running(), 2);
        assert_eq!(status.completed(), 1);

        let snapshot = status.snapshot();
        assert_eq!(snapshot.active_ids, vec![second.to_string()]);
        assert_eq!(
            snapshot.last_outcome,
            Some(format!("{} finished", first))
        );

        status.job_released(&second);
        assert_eq!(status.running(), 0);
        assert_eq!(status.completed(), 1);
    }
}
