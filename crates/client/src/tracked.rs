//! Shared job views and the client-wide handle table.
//!
//! A [`TrackedJob`] is the one live copy of a [`Job`]: the session that owns
//! the job mutates it, callers read snapshots of it. Each mutation yields a
//! [`JobEvent`] that is forwarded to the job's listener after the lock is
//! released.
//!
//! [`JobTable`] is the flattened handle → job view across all sessions. Lock
//! order is always table before job; no code holds a job lock while touching
//! the table.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use protocol::{ClientError, Job, JobEvent, JobHandle, JobState, SessionId};
use tokio::sync::mpsc;

/// Shared handle to one submitted job.
#[derive(Clone)]
pub struct TrackedJob {
    inner: Arc<Mutex<Job>>,
    listener: mpsc::UnboundedSender<JobEvent>,
}

impl TrackedJob {
    /// Wraps `job` and returns the receiving end of its event stream.
    pub fn new(job: Job) -> (Self, mpsc::UnboundedReceiver<JobEvent>) {
        let (listener, events) = mpsc::unbounded_channel();
        let tracked = Self {
            inner: Arc::new(Mutex::new(job)),
            listener,
        };
        (tracked, events)
    }

    fn lock(&self) -> MutexGuard<'_, Job> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns a copy of the job as it is now.
    pub fn snapshot(&self) -> Job {
        self.lock().clone()
    }

    pub fn handle(&self) -> Option<JobHandle> {
        self.lock().handle().cloned()
    }

    pub fn session(&self) -> Option<SessionId> {
        self.lock().session().cloned()
    }

    pub fn state(&self) -> JobState {
        self.lock().state()
    }

    pub fn is_background(&self) -> bool {
        self.lock().is_background()
    }

    /// Returns `true` if both values refer to the same job.
    pub fn same_job(&self, other: &TrackedJob) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Runs `f` with exclusive access to the job without emitting an event.
    pub(crate) fn with_job<R>(&self, f: impl FnOnce(&mut Job) -> R) -> R {
        f(&mut self.lock())
    }

    /// Applies one state transition and notifies the listener of its event.
    pub(crate) fn transition(
        &self,
        f: impl FnOnce(&mut Job) -> Result<JobEvent, ClientError>,
    ) -> Result<(), ClientError> {
        let event = f(&mut self.lock())?;
        self.notify(event);
        Ok(())
    }

    /// Closes the job; returns `false` if it was already closed.
    pub(crate) fn close(&self) -> bool {
        let event = self.lock().close();
        match event {
            Some(event) => {
                self.notify(event);
                true
            }
            None => false,
        }
    }

    fn notify(&self, event: JobEvent) {
        // The submitter may have stopped listening; the job state is still updated.
        let _ = self.listener.send(event);
    }
}

impl std::fmt::Debug for TrackedJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("TrackedJob").field(&*self.lock()).finish()
    }
}

/// Client-wide table of jobs whose handle is known.
///
/// Keyed by handle. A server may hand out the same handle for several
/// submissions sharing a unique id, so each entry holds every job that
/// received it, in acknowledgement order.
#[derive(Clone, Default)]
pub struct JobTable {
    inner: Arc<Mutex<HashMap<JobHandle, Vec<TrackedJob>>>>,
}

impl JobTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<JobHandle, Vec<TrackedJob>>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Inserts `job` under `handle`. Inserting the same job twice is a no-op.
    pub(crate) fn insert(&self, handle: JobHandle, job: TrackedJob) {
        let mut table = self.lock();
        let entry = table.entry(handle).or_default();
        if !entry.iter().any(|existing| existing.same_job(&job)) {
            entry.push(job);
        }
    }

    /// Returns every job registered under `handle`.
    pub fn get(&self, handle: &JobHandle) -> Vec<TrackedJob> {
        self.lock().get(handle).cloned().unwrap_or_default()
    }

    /// Removes one job from `handle`'s entry; returns whether it was present.
    pub(crate) fn remove(&self, handle: &JobHandle, job: &TrackedJob) -> bool {
        let mut table = self.lock();
        let Some(entry) = table.get_mut(handle) else {
            return false;
        };
        let before = entry.len();
        entry.retain(|existing| !existing.same_job(job));
        let removed = entry.len() != before;
        if entry.is_empty() {
            table.remove(handle);
        }
        removed
    }

    /// Removes and returns every job attributed to `session`.
    pub(crate) fn drain_session(&self, session: &SessionId) -> Vec<TrackedJob> {
        let mut table = self.lock();
        let mut drained = Vec::new();
        table.retain(|_, jobs| {
            let (owned, others): (Vec<_>, Vec<_>) = std::mem::take(jobs)
                .into_iter()
                .partition(|job| job.session().as_ref() == Some(session));
            drained.extend(owned);
            *jobs = others;
            !jobs.is_empty()
        });
        drained
    }

    /// Removes and returns every job.
    pub(crate) fn drain(&self) -> Vec<TrackedJob> {
        self.lock().drain().flat_map(|(_, jobs)| jobs).collect()
    }

    /// Number of live jobs.
    pub fn len(&self) -> usize {
        self.lock().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn handles(&self) -> Vec<JobHandle> {
        self.lock().keys().cloned().collect()
    }
}

impl std::fmt::Debug for JobTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobTable").field("jobs", &self.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::JobSpec;

    fn job_on(session: &str, handle: &str) -> (TrackedJob, mpsc::UnboundedReceiver<JobEvent>) {
        let mut job = Job::new(JobSpec::new("reverse", "hello")).unwrap();
        job.mark_pending(SessionId::new(session).unwrap()).unwrap();
        job.mark_created(JobHandle::new(handle).unwrap()).unwrap();
        TrackedJob::new(job)
    }

    #[test]
    fn transitions_notify_the_listener() {
        let (job, mut events) = job_on("a:1", "H:1");
        job.transition(|j| j.complete(b"olleh".to_vec())).unwrap();
        assert_eq!(events.try_recv().unwrap(), JobEvent::Complete(b"olleh".to_vec()));
        assert!(job.transition(|j| j.complete(Vec::new())).is_err());
        assert!(events.try_recv().is_err());
        assert!(job.close());
        assert!(!job.close());
        assert_eq!(events.try_recv().unwrap(), JobEvent::Closed);
    }

    #[test]
    fn table_keeps_jobs_sharing_a_handle() {
        let table = JobTable::new();
        let handle = JobHandle::new("H:1").unwrap();
        let (first, _e1) = job_on("a:1", "H:1");
        let (second, _e2) = job_on("a:1", "H:1");
        table.insert(handle.clone(), first.clone());
        table.insert(handle.clone(), second.clone());
        table.insert(handle.clone(), first.clone());
        assert_eq!(table.len(), 2);

        assert!(table.remove(&handle, &first));
        assert!(!table.remove(&handle, &first));
        assert_eq!(table.get(&handle).len(), 1);
        assert!(table.remove(&handle, &second));
        assert!(table.is_empty());
    }

    #[test]
    fn drain_session_only_takes_that_sessions_jobs() {
        let table = JobTable::new();
        let (a, _ea) = job_on("a:1", "H:1");
        let (b, _eb) = job_on("b:1", "H:2");
        table.insert(JobHandle::new("H:1").unwrap(), a.clone());
        table.insert(JobHandle::new("H:2").unwrap(), b);

        let drained = table.drain_session(&SessionId::new("a:1").unwrap());
        assert_eq!(drained.len(), 1);
        assert!(drained[0].same_job(&a));
        assert_eq!(table.handles(), vec![JobHandle::new("H:2").unwrap()]);
        assert_eq!(table.drain().len(), 1);
        assert!(table.is_empty());
    }
}
