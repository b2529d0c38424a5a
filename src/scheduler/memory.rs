//! In-memory scheduler for tests

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;

use super::{JobSpec, JobState, SchedulerClient, SchedulerError};

/// Scheduler double with scriptable job states and call counters
pub struct InMemoryScheduler {
    next_id: AtomicU64,
    jobs: DashMap<String, JobState>,
    submitted: Mutex<Vec<JobSpec>>,
    cancelled: Mutex<Vec<String>>,
    fail_submit_at: Mutex<Option<(usize, SchedulerError)>>,
    stall_submit_at: Mutex<Option<(usize, Duration)>>,
    names: DashMap<String, String>,
    unavailable: AtomicBool,
    submit_calls: AtomicUsize,
    query_calls: AtomicUsize,
    cancel_calls: AtomicUsize,
}

impl Default for InMemoryScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryScheduler {
    pub fn new() -> Self {
        Self::starting_at(1000)
    }

    /// Job ids are assigned sequentially from `first_id`
    pub fn starting_at(first_id: u64) -> Self {
        Self {
            next_id: AtomicU64::new(first_id),
            jobs: DashMap::new(),
            submitted: Mutex::new(Vec::new()),
            cancelled: Mutex::new(Vec::new()),
            fail_submit_at: Mutex::new(None),
            stall_submit_at: Mutex::new(None),
            names: DashMap::new(),
            unavailable: AtomicBool::new(false),
            submit_calls: AtomicUsize::new(0),
            query_calls: AtomicUsize::new(0),
            cancel_calls: AtomicUsize::new(0),
        }
    }

    /// Set the state reported for a job (registers unknown ids too)
    pub fn set_state(&self, job_id: &str, state: JobState) {
        self.jobs.insert(job_id.to_string(), state);
    }

    pub fn state(&self, job_id: &str) -> Option<JobState> {
        self.jobs.get(job_id).map(|s| s.clone())
    }

    /// Forget a job entirely; later queries report `Unknown`
    pub fn forget(&self, job_id: &str) {
        self.jobs.remove(job_id);
    }

    /// Make every call fail with `Unavailable`
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Fail the submission with the given 0-based index (counted from now)
    pub fn fail_submit_after(&self, successes: usize, error: SchedulerError) {
        let at = self.submit_calls.load(Ordering::SeqCst) + successes;
        *self.fail_submit_at.lock().unwrap_or_else(|p| p.into_inner()) = Some((at, error));
    }

    /// The submission with the given 0-based index (counted from now) is
    /// accepted, then hangs for `delay` before answering
    pub fn stall_submit_after(&self, successes: usize, delay: Duration) {
        let at = self.submit_calls.load(Ordering::SeqCst) + successes;
        *self.stall_submit_at.lock().unwrap_or_else(|p| p.into_inner()) = Some((at, delay));
    }

    /// Jobs still queued or running
    pub fn live_jobs(&self) -> Vec<String> {
        self.jobs
            .iter()
            .filter(|j| !matches!(j.value(), JobState::Exited { .. }))
            .map(|j| j.key().clone())
            .collect()
    }

    pub fn submitted(&self) -> Vec<JobSpec> {
        self.submitted.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn cancelled(&self) -> Vec<String> {
        self.cancelled.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn submit_calls(&self) -> usize {
        self.submit_calls.load(Ordering::SeqCst)
    }

    pub fn query_calls(&self) -> usize {
        self.query_calls.load(Ordering::SeqCst)
    }

    pub fn cancel_calls(&self) -> usize {
        self.cancel_calls.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> Result<(), SchedulerError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(SchedulerError::Unavailable("scheduler controller unreachable".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl SchedulerClient for InMemoryScheduler {
    async fn submit(&self, job: &JobSpec) -> Result<String, SchedulerError> {
        let call = self.submit_calls.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;

        {
            let mut fail = self.fail_submit_at.lock().unwrap_or_else(|p| p.into_inner());
            if matches!(fail.as_ref(), Some((at, _)) if *at == call) {
                if let Some((_, error)) = fail.take() {
                    return Err(error);
                }
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst).to_string();
        self.jobs.insert(id.clone(), JobState::Queued);
        self.names.insert(job.name.clone(), id.clone());
        self.submitted
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(job.clone());

        let stall = {
            let stall = self.stall_submit_at.lock().unwrap_or_else(|p| p.into_inner());
            (*stall).and_then(|(at, delay)| (at == call).then_some(delay))
        };
        if let Some(delay) = stall {
            tokio::time::sleep(delay).await;
        }
        Ok(id)
    }

    async fn query(&self, job_id: &str) -> Result<JobState, SchedulerError> {
        self.query_calls.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        Ok(self.state(job_id).unwrap_or(JobState::Unknown))
    }

    async fn cancel(&self, job_id: &str) -> Result<(), SchedulerError> {
        self.cancel_calls.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        let mut entry = self
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| SchedulerError::NotFound(job_id.to_string()))?;
        if !matches!(*entry, JobState::Exited { .. }) {
            // scancel'd jobs show up as CANCELLED with signal 15
            *entry = JobState::Exited { code: 143 };
        }
        drop(entry);
        self.cancelled
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(job_id.to_string());
        Ok(())
    }

    async fn cancel_named(&self, name: &str) -> Result<(), SchedulerError> {
        self.check_available()?;
        let Some(job_id) = self.names.get(name).map(|id| id.clone()) else {
            return Ok(());
        };
        match self.cancel(&job_id).await {
            Err(SchedulerError::NotFound(_)) => Ok(()),
            other => other,
        }
    }
}
