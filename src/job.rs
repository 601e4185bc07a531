use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::protocol::flags;
use crate::protocol::packet::Packet;

/// Lifecycle of a tracked job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    /// Queued for delivery, not yet picked up by an exchange.
    Waiting,
    /// The task packet was handed to a transport toward the client.
    Accepted,
    /// Result fragments are arriving.
    Receiving,
    Completed,
    Error,
}

/// Callback invoked (serialized, off the exchange path) on every status
/// change of a job.
pub type UpdateFn = Box<dyn Fn(&Job) + Send + Sync>;

/// A server-issued promise correlated by a 16-bit id. Resolves when a
/// matching result packet arrives, the session migrates, or the session
/// closes.
pub struct Job {
    pub id: u16,
    /// Packet id of the task that created this job.
    pub kind: u8,
    inner: Mutex<JobState>,
    update: Mutex<Option<UpdateFn>>,
    done: CancellationToken,
}

struct JobState {
    status: JobStatus,
    start: Instant,
    started_at: DateTime<Utc>,
    complete: Option<Instant>,
    frags_total: u16,
    frags_current: u16,
    result: Option<Packet>,
    error: Option<String>,
}

impl Job {
    pub(crate) fn new(id: u16, kind: u8, parent: &CancellationToken) -> Arc<Self> {
        Arc::new(Job {
            id,
            kind,
            inner: Mutex::new(JobState {
                status: JobStatus::Waiting,
                start: Instant::now(),
                started_at: Utc::now(),
                complete: None,
                frags_total: 0,
                frags_current: 0,
                result: None,
                error: None,
            }),
            update: Mutex::new(None),
            done: parent.child_token(),
        })
    }

    pub fn status(&self) -> JobStatus {
        self.inner.lock().unwrap().status
    }

    pub fn is_done(&self) -> bool {
        matches!(self.status(), JobStatus::Completed | JobStatus::Error)
    }

    pub fn is_error(&self) -> bool {
        self.status() == JobStatus::Error
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.inner.lock().unwrap().started_at
    }

    /// Wall time between creation and completion, if completed.
    pub fn elapsed(&self) -> Option<std::time::Duration> {
        let s = self.inner.lock().unwrap();
        s.complete.map(|c| c.duration_since(s.start))
    }

    /// Result fragment progress as `(current, total)`; zeros until the
    /// first fragment arrives.
    pub fn progress(&self) -> (u16, u16) {
        let s = self.inner.lock().unwrap();
        (s.frags_current, s.frags_total)
    }

    /// The result packet, present once the job completed without error.
    pub fn result(&self) -> Option<Packet> {
        self.inner.lock().unwrap().result.clone()
    }

    pub fn error(&self) -> Option<String> {
        self.inner.lock().unwrap().error.clone()
    }

    /// Register the status-change callback. Replaces any previous one.
    pub fn on_update<F: Fn(&Job) + Send + Sync + 'static>(&self, f: F) {
        *self.update.lock().unwrap() = Some(Box::new(f));
    }

    /// Block until the job resolves or its session goes away.
    pub async fn wait(&self) {
        self.done.cancelled().await;
    }

    /// Cancellation handle; a child of the owning session's token.
    pub fn token(&self) -> &CancellationToken {
        &self.done
    }

    pub(crate) fn run_update(&self) {
        if let Some(f) = &*self.update.lock().unwrap() {
            f(self);
        }
    }

    pub(crate) fn mark_accepted(&self) -> bool {
        let mut s = self.inner.lock().unwrap();
        if s.status != JobStatus::Waiting {
            return false;
        }
        s.status = JobStatus::Accepted;
        true
    }

    /// Record fragment progress; the first fragment moves the job to
    /// `Receiving`.
    pub(crate) fn mark_receiving(&self, current: u16, total: u16) {
        let mut s = self.inner.lock().unwrap();
        if s.frags_total == 0 {
            s.status = JobStatus::Receiving;
        }
        s.frags_total = total;
        s.frags_current = current;
    }

    /// Resolve the job with the supplied packet. An `ERROR` flag turns the
    /// payload into the error string.
    pub(crate) fn resolve(&self, p: Packet) {
        let mut s = self.inner.lock().unwrap();
        s.complete = Some(Instant::now());
        if p.flags.contains(flags::ERROR) {
            s.error = Some(p.error_message());
            s.status = JobStatus::Error;
        } else {
            s.status = JobStatus::Completed;
            s.result = Some(p);
        }
        drop(s);
        self.done.cancel();
    }

    /// Resolve the job as failed without a result packet (session close or
    /// migration).
    pub(crate) fn abort(&self, reason: &str) {
        let mut s = self.inner.lock().unwrap();
        if matches!(s.status, JobStatus::Completed | JobStatus::Error) {
            return;
        }
        s.complete = Some(Instant::now());
        s.status = JobStatus::Error;
        s.error = Some(reason.to_string());
        drop(s);
        self.done.cancel();
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> Arc<Job> {
        Job::new(42, 0x80, &CancellationToken::new())
    }

    #[test]
    fn accept_only_from_waiting() {
        let j = job();
        assert!(j.mark_accepted());
        assert!(!j.mark_accepted());
        assert_eq!(j.status(), JobStatus::Accepted);
    }

    #[test]
    fn first_fragment_moves_to_receiving() {
        let j = job();
        j.mark_receiving(1, 4);
        assert_eq!(j.status(), JobStatus::Receiving);
        assert_eq!(j.progress(), (1, 4));
        j.mark_receiving(2, 4);
        assert_eq!(j.progress(), (2, 4));
    }

    #[tokio::test]
    async fn resolve_completes_and_signals() {
        let j = job();
        let mut p = Packet::with_job(crate::protocol::ids::RESULT, 42);
        p.payload = vec![1, 2, 3];
        j.resolve(p);
        assert_eq!(j.status(), JobStatus::Completed);
        assert_eq!(j.result().unwrap().payload, vec![1, 2, 3]);
        j.wait().await;
    }

    #[tokio::test]
    async fn error_flag_resolves_to_error_string() {
        let j = job();
        let mut p = Packet::with_job(crate::protocol::ids::RESULT, 42);
        p.flags.set(flags::ERROR);
        p.payload = b"no such path".to_vec();
        j.resolve(p);
        assert_eq!(j.status(), JobStatus::Error);
        assert_eq!(j.error().unwrap(), "no such path");
        assert!(j.result().is_none());
    }

    #[test]
    fn abort_is_idempotent_after_resolve() {
        let j = job();
        j.resolve(Packet::with_job(crate::protocol::ids::RESULT, 42));
        j.abort("closed");
        assert_eq!(j.status(), JobStatus::Completed);
    }
}
