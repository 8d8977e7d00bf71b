//! Client-side tracking of analysis jobs being waited on.
//!
//! The server-side job row is authoritative; the tracker only remembers which
//! books a client is currently polling. Every way out of a poll releases the
//! entry, so a failed or timed-out job never leaves a book stuck "in progress".
use crate::model::{AnalysisJob, AnalysisStatus};
use anyhow::Result;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackedJob {
    pub job_id: i64,
    pub since: Instant,
}

#[derive(Debug, Clone)]
pub enum PollOutcome {
    Completed(AnalysisJob),
    Failed(AnalysisJob),
    TimedOut,
}

#[derive(Debug, Clone, Default)]
pub struct JobTracker {
    inner: Arc<Mutex<HashMap<i64, TrackedJob>>>,
}

/// Removes the tracking entry when dropped.
struct Release<'a> {
    tracker: &'a JobTracker,
    book_id: i64,
}

impl Drop for Release<'_> {
    fn drop(&mut self) {
        self.tracker.untrack(self.book_id);
    }
}

impl JobTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&self, book_id: i64, job_id: i64) {
        if let Ok(mut map) = self.inner.lock() {
            map.insert(
                book_id,
                TrackedJob {
                    job_id,
                    since: Instant::now(),
                },
            );
        }
    }

    pub fn untrack(&self, book_id: i64) {
        if let Ok(mut map) = self.inner.lock() {
            map.remove(&book_id);
        }
    }

    pub fn get(&self, book_id: i64) -> Option<TrackedJob> {
        self.inner.lock().ok().and_then(|m| m.get(&book_id).copied())
    }

    pub fn is_tracking(&self, book_id: i64) -> bool {
        self.get(book_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Poll `fetch` every `interval` until the tracked job reaches a terminal
    /// state or `timeout` elapses. A fetch error ends the poll with that error.
    pub async fn poll_until_terminal<F, Fut>(
        &self,
        book_id: i64,
        job_id: i64,
        interval: Duration,
        timeout: Duration,
        mut fetch: F,
    ) -> Result<PollOutcome>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Option<AnalysisJob>>>,
    {
        self.track(book_id, job_id);
        let _release = Release {
            tracker: self,
            book_id,
        };
        let deadline = Instant::now() + timeout;
        loop {
            match fetch().await? {
                Some(job) if job.id == job_id => match job.status {
                    AnalysisStatus::Completed => return Ok(PollOutcome::Completed(job)),
                    AnalysisStatus::Failed => return Ok(PollOutcome::Failed(job)),
                    status => debug!(book_id, job_id, status = status.as_str(), "still waiting"),
                },
                Some(job) => {
                    warn!(book_id, job_id, latest = job.id, "a newer job replaced the tracked one");
                    return Ok(PollOutcome::Failed(job));
                }
                None => debug!(book_id, job_id, "job not visible yet"),
            }
            if Instant::now() + interval > deadline {
                return Ok(PollOutcome::TimedOut);
            }
            tokio::time::sleep(interval).await;
        }
    }
}
