//! In-process ingestion job tracker.
//!
//! Every ingestion request gets a job id. Status only moves forward:
//! `queued → started → finished | failed`. An out-of-order transition is
//! refused and logged, never applied.
//!
//! Only the most recent terminal jobs are retained. Once more than the
//! retention limit have finished or failed, the oldest are dropped and
//! their ids report as unknown. Queued and started jobs are never dropped.

use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Started,
    Finished,
    Failed,
}

impl JobStatus {
    fn rank(self) -> u8 {
        match self {
            JobStatus::Queued => 0,
            JobStatus::Started => 1,
            JobStatus::Finished | JobStatus::Failed => 2,
        }
    }

    pub fn is_terminal(self) -> bool {
        self.rank() == 2
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Job {
    #[serde(rename = "jobId")]
    pub job_id: u64,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
}

/// Terminal jobs kept by [`JobTracker::new`].
pub const DEFAULT_RETAINED_JOBS: usize = 1024;

pub struct JobTracker {
    next_id: AtomicU64,
    retained: usize,
    // ids are monotonic, so key order is age order
    jobs: Mutex<BTreeMap<u64, Job>>,
}

impl Default for JobTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl JobTracker {
    pub fn new() -> Self {
        Self::with_retention(DEFAULT_RETAINED_JOBS)
    }

    /// Tracker that keeps at most `retained` terminal jobs.
    pub fn with_retention(retained: usize) -> Self {
        Self {
            next_id: AtomicU64::new(10001),
            retained: retained.max(1),
            jobs: Mutex::new(BTreeMap::new()),
        }
    }

    /// Register a new job in `queued` state and return its id.
    pub fn submit(&self) -> u64 {
        let job_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let job = Job {
            job_id,
            status: JobStatus::Queued,
            output: None,
        };
        self.lock().insert(job_id, job);
        tracing::debug!(job_id, "job queued");
        job_id
    }

    pub fn start(&self, job_id: u64) -> bool {
        self.transition(job_id, JobStatus::Started, None)
    }

    pub fn finish(&self, job_id: u64, output: Value) -> bool {
        self.transition(job_id, JobStatus::Finished, Some(output))
    }

    pub fn fail(&self, job_id: u64, output: Value) -> bool {
        self.transition(job_id, JobStatus::Failed, Some(output))
    }

    pub fn get(&self, job_id: u64) -> Option<Job> {
        self.lock().get(&job_id).cloned()
    }

    fn transition(&self, job_id: u64, to: JobStatus, output: Option<Value>) -> bool {
        let mut jobs = self.lock();
        let Some(job) = jobs.get_mut(&job_id) else {
            tracing::warn!(job_id, "transition on unknown job");
            return false;
        };
        if to.rank() <= job.status.rank() {
            tracing::warn!(job_id, from = ?job.status, to = ?to, "illegal job transition refused");
            return false;
        }
        job.status = to;
        if output.is_some() {
            job.output = output;
        }
        if to.is_terminal() {
            self.evict_oldest_terminal(&mut jobs);
        }
        true
    }

    fn evict_oldest_terminal(&self, jobs: &mut BTreeMap<u64, Job>) {
        let terminal: Vec<u64> = jobs
            .values()
            .filter(|j| j.status.is_terminal())
            .map(|j| j.job_id)
            .collect();
        let excess = terminal.len().saturating_sub(self.retained);
        for job_id in &terminal[..excess] {
            jobs.remove(job_id);
        }
        if excess > 0 {
            tracing::debug!(evicted = excess, "old jobs dropped");
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<u64, Job>> {
        // a poisoned map is still consistent: every write is a single assignment
        self.jobs.lock().unwrap_or_else(|e| e.into_inner())
    }
}
