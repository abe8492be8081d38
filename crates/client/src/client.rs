//! Client facade over one or more job-server sessions.
//!
//! The [`Client`] owns the sessions, the shared handle table and the
//! load-balancing strategy. It never touches a socket itself: every request is
//! routed to the session that owns the job.

use std::sync::Arc;

use protocol::{
    AddressSessionIds, ClientConfig, ClientError, ClientId, Job, JobEvent, JobFailure, JobHandle,
    JobSpec, LoadBalancer, ServerSlot, SessionIdScheme,
};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, Instrument};

use crate::events::ClientEvent;
use crate::session::{SessionHandle, SessionOptions};
use crate::tracked::{JobTable, TrackedJob};
use crate::transport::{Connector, TcpConnector};

const EVENT_BUFFER: usize = 256;

/// A submission that did not produce an acknowledged job.
///
/// `job` is the job as it stood when the submission failed, with no handle;
/// it is `None` when the specification itself was rejected.
#[derive(Debug, Error)]
#[error("job submission failed: {source}")]
pub struct SubmitError {
    pub job: Option<Box<Job>>,
    pub source: ClientError,
}

/// A job the server has acknowledged, plus its event stream.
#[derive(Debug)]
pub struct SubmittedJob {
    job: TrackedJob,
    handle: JobHandle,
    events: mpsc::UnboundedReceiver<JobEvent>,
}

impl SubmittedJob {
    pub fn job(&self) -> &TrackedJob {
        &self.job
    }

    pub fn handle(&self) -> &JobHandle {
        &self.handle
    }

    /// Next lifecycle event, in the order the session applied them.
    ///
    /// Returns `None` once the job has been dropped by every owner.
    pub async fn next_event(&mut self) -> Option<JobEvent> {
        self.events.recv().await
    }

    /// Waits until the job completes, fails or is closed.
    ///
    /// Background jobs never complete from the client's point of view; for
    /// them this only returns once the job is closed or its session fails.
    pub async fn wait_for_result(&mut self) -> Result<Vec<u8>, JobFailure> {
        while let Some(event) = self.events.recv().await {
            match event {
                JobEvent::Complete(result) => return Ok(result),
                JobEvent::Failed(failure) => return Err(failure),
                JobEvent::Closed => break,
                _ => {}
            }
        }
        Err(JobFailure::Client(ClientError::JobState {
            handle: Some(self.handle.clone()),
            message: "job was closed before it finished".to_string(),
        }))
    }

    pub fn into_parts(self) -> (TrackedJob, mpsc::UnboundedReceiver<JobEvent>) {
        (self.job, self.events)
    }
}

/// Builder for [`Client`] with injectable ports.
pub struct ClientBuilder {
    config: ClientConfig,
    connector: Arc<dyn Connector>,
    load_balancer: Option<Arc<dyn LoadBalancer>>,
    session_ids: Arc<dyn SessionIdScheme>,
}

impl ClientBuilder {
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = connector;
        self
    }

    /// Overrides the strategy selected by `config.load_balancing`.
    pub fn load_balancer(mut self, load_balancer: Arc<dyn LoadBalancer>) -> Self {
        self.load_balancer = Some(load_balancer);
        self
    }

    pub fn session_ids(mut self, session_ids: Arc<dyn SessionIdScheme>) -> Self {
        self.session_ids = session_ids;
        self
    }

    /// Validates the configuration and spawns one disconnected session per
    /// server. Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// [`ClientError::Configuration`] for anything
    /// [`ClientConfig::resolve`] rejects. No socket is opened.
    pub fn build(self) -> Result<Client, ClientError> {
        let resolved = self.config.resolve(self.session_ids.as_ref())?;

        let id = ClientId::new_random();
        let span = tracing::info_span!("gearman_client", client_id = %id);
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let table = JobTable::new();
        let options = SessionOptions::from(&self.config);
        let balancer = self
            .load_balancer
            .unwrap_or_else(|| self.config.load_balancing.build());

        let sessions: Vec<SessionHandle> = span.in_scope(|| {
            resolved
                .into_iter()
                .map(|(session_id, address)| {
                    SessionHandle::spawn(
                        session_id,
                        address,
                        Arc::clone(&self.connector),
                        table.clone(),
                        events.clone(),
                        options,
                    )
                })
                .collect()
        });
        info!(parent: &span, sessions = sessions.len(), "Client created");

        Ok(Client {
            id,
            sessions,
            table,
            balancer,
            events,
            span,
        })
    }
}

/// Submits jobs to a set of job servers and tracks them until they finish.
pub struct Client {
    id: ClientId,
    sessions: Vec<SessionHandle>,
    table: JobTable,
    balancer: Arc<dyn LoadBalancer>,
    events: broadcast::Sender<ClientEvent>,
    span: tracing::Span,
}

impl Client {
    /// Builds a client over TCP with the configured defaults.
    ///
    /// # Errors
    ///
    /// See [`ClientBuilder::build`].
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        Self::builder(config).build()
    }

    pub fn builder(config: ClientConfig) -> ClientBuilder {
        ClientBuilder {
            config,
            connector: Arc::new(TcpConnector),
            load_balancer: None,
            session_ids: Arc::new(AddressSessionIds),
        }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn sessions(&self) -> &[SessionHandle] {
        &self.sessions
    }

    /// Registers a listener for client-level notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    /// Jobs currently known under `handle`.
    pub fn jobs(&self, handle: &JobHandle) -> Vec<TrackedJob> {
        self.table.get(handle)
    }

    /// Number of jobs in the handle table.
    pub fn job_count(&self) -> usize {
        self.table.len()
    }

    /// Validates `spec`, picks a session, connects it if needed and submits.
    ///
    /// Resolves once the server has acknowledged the job with a handle.
    ///
    /// # Errors
    ///
    /// - [`ClientError::Configuration`] for an invalid spec or a load
    ///   balancer that picks no session, before any I/O.
    /// - [`ClientError::Connection`] or [`ClientError::Protocol`] if the
    ///   session fails before the acknowledgement arrives.
    pub async fn submit_job(&self, spec: JobSpec) -> Result<SubmittedJob, SubmitError> {
        self.submit(spec).instrument(self.span.clone()).await
    }

    async fn submit(&self, spec: JobSpec) -> Result<SubmittedJob, SubmitError> {
        let job = Job::new(spec).map_err(|source| SubmitError { job: None, source })?;
        let session = match self.choose_session() {
            Ok(session) => session,
            Err(source) => {
                return Err(SubmitError {
                    job: Some(Box::new(job)),
                    source,
                })
            }
        };
        debug!(session_id = %session.id(), function = %job.function(), "Submitting job");

        let (tracked, events) = TrackedJob::new(job);
        let failed = |source: ClientError| SubmitError {
            job: Some(Box::new(tracked.snapshot())),
            source,
        };

        session.connect().await.map_err(failed)?;
        let pending = session.submit(tracked.clone()).await.map_err(failed)?;
        let handle = pending.created().await.map_err(failed)?;

        Ok(SubmittedJob {
            job: tracked,
            handle,
            events,
        })
    }

    fn choose_session(&self) -> Result<&SessionHandle, ClientError> {
        let slots: Vec<ServerSlot> = self.sessions.iter().map(SessionHandle::slot).collect();
        self.balancer
            .choose(&slots)
            .and_then(|index| self.sessions.get(index))
            .ok_or_else(|| {
                ClientError::configuration(format!(
                    "load balancer chose no session among {}",
                    slots.len()
                ))
            })
    }

    /// Requests a status snapshot for a background job.
    ///
    /// The answer arrives as a [`JobEvent::Status`] on the job's stream.
    ///
    /// # Errors
    ///
    /// [`ClientError::JobState`] without I/O for a foreground job or one not
    /// yet assigned to a session; [`ClientError::Connection`] if the owning
    /// session cannot write.
    pub async fn get_status(&self, job: &TrackedJob) -> Result<(), ClientError> {
        let snapshot = job.snapshot();
        if !snapshot.is_background() {
            return Err(ClientError::JobState {
                handle: snapshot.handle().cloned(),
                message: "status can only be requested for background jobs".to_string(),
            });
        }
        let Some(session_id) = snapshot.session() else {
            return Err(ClientError::JobState {
                handle: None,
                message: "job has not been submitted to a session".to_string(),
            });
        };
        let session = self
            .sessions
            .iter()
            .find(|s| s.id() == session_id)
            .ok_or_else(|| {
                ClientError::configuration(format!("job refers to unknown session {session_id}"))
            })?;

        session
            .send_status_request(job)
            .instrument(self.span.clone())
            .await
    }

    /// Drops `job` client-side. The server is not told.
    ///
    /// Returns `false` if it was already closed.
    pub fn close_job(&self, job: &TrackedJob) -> bool {
        if let Some(handle) = job.handle() {
            self.table.remove(&handle, job);
        }
        job.close()
    }

    /// Disconnects every session, then closes every job left in the table.
    ///
    /// Outstanding work is discarded even if a server later completes it.
    pub async fn end(&self) {
        for session in &self.sessions {
            session.disconnect().instrument(self.span.clone()).await;
        }
        let closed = self
            .table
            .drain()
            .into_iter()
            .filter(|job| job.close())
            .count();
        info!(parent: &self.span, closed, "Client ended");
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.id)
            .field("sessions", &self.sessions)
            .field("jobs", &self.table.len())
            .finish()
    }
}
