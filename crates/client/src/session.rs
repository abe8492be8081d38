//! Job-server session: one connection to one server.
//!
//! Each session is a tokio task that owns its socket and its pending-created
//! queue. Callers talk to it through a cloneable [`SessionHandle`]; every
//! request becomes a command on one ordered channel, and the task interleaves
//! those commands with packets read from the socket.
//!
//! ## Correlation
//!
//! `JOB_CREATED` carries the new handle but nothing identifying which
//! submission it answers. The server acknowledges submissions on a connection
//! in the order it read them, and the task writes a submission and appends it
//! to the pending queue as one step, so the oldest pending entry is always the
//! one being acknowledged. Every later packet names its handle and is resolved
//! through the shared [`JobTable`].
//!
//! ## Failure
//!
//! A socket error, EOF or protocol violation fails every pending job and every
//! table job owned by the session, then leaves the session `Disconnected`
//! (I/O) or `Error` (protocol). Nothing is retried here.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use protocol::{
    ClientConfig, ClientError, Job, JobEvent, JobFailure, JobHandle, Magic, Packet, PacketType,
    Progress, ProtocolError, ServerAddress, ServerSlot, SessionId, StatusSnapshot,
    DEFAULT_MAX_PACKET_SIZE,
};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_util::codec::Framed;
use tracing::{debug, error, info, warn, Instrument};

use crate::codec::{CodecError, PacketCodec};
use crate::events::ClientEvent;
use crate::tracked::{JobTable, TrackedJob};
use crate::transport::{BoxedTransport, Connector};

const COMMAND_BUFFER: usize = 64;

/// Connection lifecycle of a session.
///
/// `Error` is a sink: once a server has sent invalid protocol the session
/// refuses to reconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// Per-session tunables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOptions {
    /// Upper bound on establishing the connection.
    pub connect_timeout: Duration,
    /// Largest argument section accepted from the server.
    pub max_packet_size: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
        }
    }
}

impl From<&ClientConfig> for SessionOptions {
    fn from(config: &ClientConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout(),
            max_packet_size: config.max_packet_size,
        }
    }
}

type Reply<T> = oneshot::Sender<Result<T, ClientError>>;

enum Command {
    Connect {
        reply: Reply<()>,
    },
    Submit {
        job: TrackedJob,
        sent: Reply<usize>,
        created: Reply<JobHandle>,
    },
    Send {
        packet: Packet,
        reply: Reply<()>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Cloneable handle to a running session task.
///
/// The task stops when the last handle is dropped, failing whatever it still
/// had pending.
#[derive(Clone)]
pub struct SessionHandle {
    id: SessionId,
    address: ServerAddress,
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<ConnectionState>,
}

impl SessionHandle {
    /// Spawns the session task in the `Disconnected` state.
    ///
    /// Must be called from within a Tokio runtime. The task's tracing span is
    /// a child of the caller's current span.
    pub fn spawn(
        id: SessionId,
        address: ServerAddress,
        connector: Arc<dyn Connector>,
        table: JobTable,
        events: broadcast::Sender<ClientEvent>,
        options: SessionOptions,
    ) -> Self {
        let (commands_tx, commands) = mpsc::channel(COMMAND_BUFFER);
        let (state_tx, state) = watch::channel(ConnectionState::Disconnected);
        let span = tracing::info_span!("job_server_session", session_id = %id, address = %address);

        let actor = SessionActor {
            id: id.clone(),
            address: address.clone(),
            connector,
            table,
            events,
            options,
            commands,
            state: ConnectionState::Disconnected,
            state_tx,
            sink_error: None,
            framed: None,
            pending: VecDeque::new(),
        };
        tokio::spawn(actor.run().instrument(span));

        Self {
            id,
            address,
            commands: commands_tx,
            state,
        }
    }

    /// Identifier used in logs, events and job snapshots.
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Job server this session connects to.
    pub fn address(&self) -> &ServerAddress {
        &self.address
    }

    /// Latest published connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// What a load balancer sees of this session.
    pub fn slot(&self) -> ServerSlot {
        ServerSlot {
            id: self.id.clone(),
            address: self.address.clone(),
            connected: self.is_connected(),
        }
    }

    fn stopped(&self) -> ClientError {
        ClientError::connection(&self.id, "session task has stopped")
    }

    async fn request<T>(
        &self,
        command: Command,
        reply: oneshot::Receiver<Result<T, ClientError>>,
    ) -> Result<T, ClientError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| self.stopped())?;
        reply.await.map_err(|_| self.stopped())?
    }

    /// Opens the connection. Resolves immediately if already connected.
    ///
    /// # Errors
    ///
    /// [`ClientError::Connection`] if the connect fails or times out;
    /// the stored protocol error if the session is in the `Error` state.
    pub async fn connect(&self) -> Result<(), ClientError> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::Connect { reply }, rx).await
    }

    /// Writes `job`'s submit packet and queues it for acknowledgement.
    ///
    /// Resolves once the bytes are written, which says nothing about whether
    /// the server accepted the job; await [`PendingCreation::created`] for
    /// that. The session does not connect on its own.
    ///
    /// # Errors
    ///
    /// [`ClientError::Connection`] if the session is not connected or the
    /// write fails; [`ClientError::JobState`] if the job was already submitted.
    pub async fn submit(&self, job: TrackedJob) -> Result<PendingCreation, ClientError> {
        let (sent, sent_rx) = oneshot::channel();
        let (created, created_rx) = oneshot::channel();
        let queue_depth = self
            .request(Command::Submit { job, sent, created }, sent_rx)
            .await?;
        Ok(PendingCreation {
            session: self.id.clone(),
            queue_depth,
            created: created_rx,
        })
    }

    /// Writes an arbitrary request packet, resolving once it is written.
    ///
    /// # Errors
    ///
    /// [`ClientError::Connection`] if not connected or the write fails.
    pub async fn send(&self, packet: Packet) -> Result<(), ClientError> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::Send { packet, reply }, rx).await
    }

    /// Asks the server for a `STATUS_RES` about `job`. The reply updates the
    /// job through the table like any other handle-addressed packet.
    ///
    /// # Errors
    ///
    /// [`ClientError::JobState`] if the job has no handle yet, without I/O;
    /// otherwise as [`Self::send`].
    pub async fn send_status_request(&self, job: &TrackedJob) -> Result<(), ClientError> {
        let packet = job.with_job(|j| j.status_request_packet())?;
        self.send(packet).await
    }

    /// Closes the connection. Jobs still awaiting acknowledgement fail with a
    /// connection error; jobs already in the table are left to the caller.
    pub async fn disconnect(&self) {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::Disconnect { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("state", &self.state())
            .finish()
    }
}

/// A written submission awaiting its `JOB_CREATED`.
#[derive(Debug)]
pub struct PendingCreation {
    session: SessionId,
    queue_depth: usize,
    created: oneshot::Receiver<Result<JobHandle, ClientError>>,
}

impl PendingCreation {
    /// Jobs awaiting acknowledgement on the session right after this write,
    /// this one included.
    pub fn queue_depth(&self) -> usize {
        self.queue_depth
    }

    /// Resolves with the server-assigned handle, or the error that failed
    /// the session first.
    pub async fn created(self) -> Result<JobHandle, ClientError> {
        let Self {
            session, created, ..
        } = self;
        created.await.unwrap_or_else(|_| {
            Err(ClientError::connection(
                &session,
                "session stopped before the job was acknowledged",
            ))
        })
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

struct PendingJob {
    job: TrackedJob,
    created: Reply<JobHandle>,
}

enum Input {
    Command(Option<Command>),
    Frame(Option<Result<Packet, CodecError>>),
}

struct SessionActor {
    id: SessionId,
    address: ServerAddress,
    connector: Arc<dyn Connector>,
    table: JobTable,
    events: broadcast::Sender<ClientEvent>,
    options: SessionOptions,
    commands: mpsc::Receiver<Command>,
    state: ConnectionState,
    state_tx: watch::Sender<ConnectionState>,
    sink_error: Option<ClientError>,
    framed: Option<Framed<BoxedTransport, PacketCodec>>,
    pending: VecDeque<PendingJob>,
}

async fn next_frame(
    framed: &mut Option<Framed<BoxedTransport, PacketCodec>>,
) -> Option<Result<Packet, CodecError>> {
    match framed {
        Some(framed) => framed.next().await,
        None => std::future::pending().await,
    }
}

impl SessionActor {
    async fn run(mut self) {
        debug!("Session started");
        loop {
            let input = tokio::select! {
                command = self.commands.recv() => Input::Command(command),
                frame = next_frame(&mut self.framed) => Input::Frame(frame),
            };
            match input {
                Input::Command(Some(command)) => self.handle_command(command).await,
                Input::Command(None) => break,
                Input::Frame(frame) => self.handle_frame(frame),
            }
        }

        self.framed = None;
        self.fail_pending(&ClientError::connection(&self.id, "session stopped"));
        debug!("Session stopped");
    }

    fn set_state(&mut self, state: ConnectionState) {
        self.state = state;
        self.state_tx.send_replace(state);
    }

    fn emit(&self, event: ClientEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect { reply } => {
                let result = self.connect().await;
                let _ = reply.send(result);
            }
            Command::Submit { job, sent, created } => self.submit(job, sent, created).await,
            Command::Send { packet, reply } => {
                let kind = packet.kind();
                let result = self.write(packet).await;
                if result.is_ok() {
                    debug!(packet = %kind, "Sent request");
                }
                let _ = reply.send(result);
            }
            Command::Disconnect { reply } => {
                self.disconnect();
                let _ = reply.send(());
            }
        }
    }

    async fn connect(&mut self) -> Result<(), ClientError> {
        match self.state {
            ConnectionState::Connected => return Ok(()),
            ConnectionState::Error => {
                return Err(self
                    .sink_error
                    .clone()
                    .unwrap_or_else(|| ClientError::connection(&self.id, "session is unusable")));
            }
            ConnectionState::Disconnected | ConnectionState::Connecting => {}
        }

        self.set_state(ConnectionState::Connecting);
        debug!("Connecting to job server");
        let attempt = tokio::time::timeout(
            self.options.connect_timeout,
            self.connector.connect(&self.address),
        )
        .await;

        let stream = match attempt {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                self.set_state(ConnectionState::Disconnected);
                warn!(error = %e, "Connection to job server failed");
                return Err(ClientError::connection(&self.id, e.to_string()));
            }
            Err(_) => {
                self.set_state(ConnectionState::Disconnected);
                warn!(timeout = ?self.options.connect_timeout, "Connection to job server timed out");
                return Err(ClientError::connection(
                    &self.id,
                    format!("connect timed out after {:?}", self.options.connect_timeout),
                ));
            }
        };

        self.framed = Some(Framed::new(stream, PacketCodec::new(self.options.max_packet_size)));
        self.set_state(ConnectionState::Connected);
        info!("Connected to job server");
        self.emit(ClientEvent::Connected {
            session: self.id.clone(),
        });
        Ok(())
    }

    async fn submit(&mut self, job: TrackedJob, sent: Reply<usize>, created: Reply<JobHandle>) {
        let prepared = if self.framed.is_none() {
            Err(ClientError::connection(&self.id, "not connected"))
        } else {
            let session = self.id.clone();
            job.with_job(|j| {
                j.mark_pending(session.clone())?;
                j.submit_packet()
                    .map_err(|source| ClientError::Protocol { session, source })
            })
        };
        let packet = match prepared {
            Ok(packet) => packet,
            Err(error) => {
                let _ = created.send(Err(error.clone()));
                let _ = sent.send(Err(error));
                return;
            }
        };

        let kind = packet.kind();
        if let Err(error) = self.write(packet).await {
            let _ = job.transition(|j| j.fail(JobFailure::Client(error.clone())));
            let _ = created.send(Err(error.clone()));
            let _ = sent.send(Err(error));
            return;
        }

        // Written and queued without yielding in between.
        self.pending.push_back(PendingJob { job, created });
        let depth = self.pending.len();
        debug!(packet = %kind, pending = depth, "Submitted job");
        self.emit(ClientEvent::Submitted {
            session: self.id.clone(),
            pending: depth,
        });
        let _ = sent.send(Ok(depth));
    }

    async fn write(&mut self, packet: Packet) -> Result<(), ClientError> {
        let Some(framed) = self.framed.as_mut() else {
            return Err(ClientError::connection(&self.id, "not connected"));
        };
        match framed.send(packet).await {
            Ok(()) => Ok(()),
            Err(e) => {
                let error = self.codec_error(e);
                self.fail_session(error.clone());
                Err(error)
            }
        }
    }

    fn disconnect(&mut self) {
        if self.framed.take().is_some() {
            info!("Disconnected from job server");
        }
        self.fail_pending(&ClientError::connection(&self.id, "disconnected by client"));
        if self.state != ConnectionState::Error {
            self.set_state(ConnectionState::Disconnected);
        }
    }

    fn codec_error(&self, error: CodecError) -> ClientError {
        match error {
            CodecError::Io(e) => ClientError::connection(&self.id, e.to_string()),
            CodecError::Protocol(source) => ClientError::Protocol {
                session: self.id.clone(),
                source,
            },
        }
    }

    // -----------------------------------------------------------------------
    // Failure
    // -----------------------------------------------------------------------

    fn fail_pending(&mut self, error: &ClientError) {
        for PendingJob { job, created } in self.pending.drain(..) {
            let _ = job.transition(|j| j.fail(JobFailure::Client(error.clone())));
            let _ = created.send(Err(error.clone()));
        }
    }

    fn fail_session(&mut self, error: ClientError) {
        let next = match error {
            ClientError::Protocol { .. } => ConnectionState::Error,
            _ => ConnectionState::Disconnected,
        };
        if next == ConnectionState::Error {
            self.sink_error = Some(error.clone());
        }
        // Published before the peer or any waiter can observe the failure.
        self.set_state(next);
        self.framed = None;

        let pending = self.pending.len();
        self.fail_pending(&error);
        let owned = self.table.drain_session(&self.id);
        let owned_count = owned.len();
        for job in owned {
            let _ = job.transition(|j| j.fail(JobFailure::Client(error.clone())));
        }

        error!(error = %error, pending, owned = owned_count, "Job server session failed");
        self.emit(ClientEvent::Error {
            session: self.id.clone(),
            error,
        });
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    fn handle_frame(&mut self, frame: Option<Result<Packet, CodecError>>) {
        let result = match frame {
            None => Err(ClientError::connection(&self.id, "connection closed by job server")),
            Some(Err(e)) => Err(self.codec_error(e)),
            Some(Ok(packet)) => self.dispatch(packet).map_err(|source| ClientError::Protocol {
                session: self.id.clone(),
                source,
            }),
        };
        if let Err(error) = result {
            self.fail_session(error);
        }
    }

    fn dispatch(&mut self, packet: Packet) -> Result<(), ProtocolError> {
        if packet.magic() != Magic::Response {
            return Err(ProtocolError::UnexpectedPacket {
                detail: format!("{} sent with request magic", packet.kind()),
            });
        }

        match packet.kind() {
            PacketType::JobCreated => self.job_created(&packet),
            PacketType::WorkStatus => {
                let progress = Progress::new(number_arg(&packet, 1)?, number_arg(&packet, 2)?);
                self.update_jobs(&packet, |job| job.apply_progress(progress))
            }
            PacketType::StatusRes => {
                let snapshot = StatusSnapshot {
                    known: number_arg(&packet, 1)? != 0,
                    running: number_arg(&packet, 2)? != 0,
                    progress: Progress::new(number_arg(&packet, 3)?, number_arg(&packet, 4)?),
                };
                self.update_jobs(&packet, |job| job.apply_status(snapshot))
            }
            PacketType::WorkData => {
                let data = payload_arg(&packet, 1);
                self.update_jobs(&packet, |job| job.apply_data(data.clone()))
            }
            PacketType::WorkWarning => {
                let message = payload_arg(&packet, 1);
                self.update_jobs(&packet, |job| job.apply_warning(message.clone()))
            }
            PacketType::WorkComplete => {
                let result = payload_arg(&packet, 1);
                self.finish_jobs(&packet, |job| job.complete(result.clone()))
            }
            PacketType::WorkFail => self.finish_jobs(&packet, |job| job.fail(JobFailure::WorkFailed)),
            PacketType::WorkException => {
                let data = payload_arg(&packet, 1);
                self.finish_jobs(&packet, |job| job.fail(JobFailure::Exception(data.clone())))
            }
            PacketType::Error => {
                let error = ClientError::Server {
                    session: self.id.clone(),
                    code: text_arg(&packet, 0),
                    message: text_arg(&packet, 1),
                };
                warn!(error = %error, "Job server reported an error");
                self.emit(ClientEvent::Error {
                    session: self.id.clone(),
                    error,
                });
                Ok(())
            }
            PacketType::EchoRes => {
                debug!(bytes = payload_arg(&packet, 0).len(), "Echo response");
                Ok(())
            }
            other => Err(ProtocolError::UnexpectedPacket {
                detail: format!("{other} is not sent to clients"),
            }),
        }
    }

    fn job_created(&mut self, packet: &Packet) -> Result<(), ProtocolError> {
        let handle = handle_arg(packet)?;
        let Some(PendingJob { job, created }) = self.pending.pop_front() else {
            return Err(ProtocolError::UnexpectedPacket {
                detail: format!("JOB_CREATED for {handle} with no submission awaiting one"),
            });
        };

        match job.transition(|j| j.mark_created(handle.clone())) {
            Ok(()) => {
                self.table.insert(handle.clone(), job);
                debug!(handle = %handle, pending = self.pending.len(), "Job created");
                let _ = created.send(Ok(handle));
            }
            Err(error) => {
                // Closed by the caller while waiting; the server's copy is orphaned.
                warn!(handle = %handle, error = %error, "Acknowledged job could not take its handle");
                let _ = created.send(Err(error));
            }
        }
        Ok(())
    }

    /// Applies `apply` to every table job under the packet's handle.
    ///
    /// Unknown handles and illegal transitions are logged and dropped.
    fn update_jobs(
        &self,
        packet: &Packet,
        apply: impl Fn(&mut Job) -> Result<JobEvent, ClientError>,
    ) -> Result<(), ProtocolError> {
        self.apply_to_jobs(packet, apply, false)
    }

    /// Like [`Self::update_jobs`] for packets that end a job. Foreground jobs
    /// leave the table before their listener hears about it.
    fn finish_jobs(
        &self,
        packet: &Packet,
        apply: impl Fn(&mut Job) -> Result<JobEvent, ClientError>,
    ) -> Result<(), ProtocolError> {
        self.apply_to_jobs(packet, apply, true)
    }

    fn apply_to_jobs(
        &self,
        packet: &Packet,
        apply: impl Fn(&mut Job) -> Result<JobEvent, ClientError>,
        finishing: bool,
    ) -> Result<(), ProtocolError> {
        let handle = handle_arg(packet)?;
        let jobs = self.table.get(&handle);
        if jobs.is_empty() {
            debug!(handle = %handle, packet = %packet.kind(), "Dropping packet for unknown job handle");
        }

        for job in jobs {
            if finishing && !job.is_background() {
                self.table.remove(&handle, &job);
            }
            if let Err(error) = job.transition(&apply) {
                warn!(handle = %handle, packet = %packet.kind(), error = %error, "Ignoring packet");
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Argument helpers
// ---------------------------------------------------------------------------

fn malformed(packet: &Packet, detail: impl Into<String>) -> ProtocolError {
    ProtocolError::MalformedArgument {
        packet: packet.kind().name(),
        detail: detail.into(),
    }
}

fn handle_arg(packet: &Packet) -> Result<JobHandle, ProtocolError> {
    packet
        .arg(0)
        .and_then(JobHandle::from_wire)
        .ok_or_else(|| malformed(packet, "missing or invalid job handle"))
}

fn number_arg(packet: &Packet, index: usize) -> Result<u64, ProtocolError> {
    let raw = packet.arg(index).unwrap_or_default();
    std::str::from_utf8(raw)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .ok_or_else(|| malformed(packet, format!("argument {index} is not a number")))
}

fn payload_arg(packet: &Packet, index: usize) -> Vec<u8> {
    packet.arg(index).map(<[u8]>::to_vec).unwrap_or_default()
}

fn text_arg(packet: &Packet, index: usize) -> String {
    String::from_utf8_lossy(packet.arg(index).unwrap_or_default()).into_owned()
}
