//! Job value type and lifecycle state machine.
//!
//! A [`Job`] is built from a caller-supplied [`JobSpec`] and then driven
//! through its states by the session that owns it. Every transition method
//! returns the [`JobEvent`] it produces, or a [`ClientError::JobState`] when
//! the transition is illegal from the current state; the session logs and
//! drops those instead of treating them as fatal.
//!
//! ```text
//! foreground: New -> PendingCreation -> Created -> Running -> Complete | Failed
//! background: New -> PendingCreation -> Created -> Acknowledged
//! any state  -> Closed   (client-side abandonment)
//! ```

use serde::{Deserialize, Serialize};

use crate::{
    ClientError, FunctionName, JobHandle, Packet, PacketType, Priority, Progress, ProtocolError,
    SessionId, StatusSnapshot, Timestamp, UniqueId,
};

// ---------------------------------------------------------------------------
// Specification
// ---------------------------------------------------------------------------

/// What the caller wants run. Validated into a [`Job`] by [`Job::new`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    /// Registered worker function name.
    pub function: String,
    /// Opaque input handed to the worker.
    #[serde(default)]
    pub payload: Vec<u8>,
    /// Optional uniqueness token; empty is treated as absent.
    #[serde(default)]
    pub unique: Option<String>,
    #[serde(default)]
    pub priority: Priority,
    /// Submit without waiting for the result; status must be polled.
    #[serde(default)]
    pub background: bool,
}

impl JobSpec {
    /// Creates a normal-priority foreground spec.
    pub fn new(function: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            function: function.into(),
            payload: payload.into(),
            ..Self::default()
        }
    }

    /// Sets the queue priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the uniqueness token the server coalesces on.
    pub fn with_unique(mut self, unique: impl Into<String>) -> Self {
        self.unique = Some(unique.into());
        self
    }

    /// Marks the job as background.
    pub fn background(mut self) -> Self {
        self.background = true;
        self
    }
}

// ---------------------------------------------------------------------------
// State and events
// ---------------------------------------------------------------------------

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Built but not yet written to any server.
    New,
    /// Written; waiting in a session's pending-created queue.
    PendingCreation,
    /// Handle assigned by the server.
    Created,
    /// A worker reported status or data.
    Running,
    /// `WORK_COMPLETE` received.
    Complete,
    /// `WORK_FAIL`, `WORK_EXCEPTION`, or the owning session failed.
    Failed,
    /// Background job accepted by the server; only status polling follows.
    Acknowledged,
    /// Abandoned on the client side.
    Closed,
}

impl JobState {
    /// Returns `true` if no further server packet can change the job.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Complete | JobState::Failed | JobState::Closed)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            JobState::New => "new",
            JobState::PendingCreation => "pending_creation",
            JobState::Created => "created",
            JobState::Running => "running",
            JobState::Complete => "complete",
            JobState::Failed => "failed",
            JobState::Acknowledged => "acknowledged",
            JobState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Why a job ended in [`JobState::Failed`].
#[derive(Debug, Clone, PartialEq)]
pub enum JobFailure {
    /// The worker reported `WORK_FAIL`.
    WorkFailed,
    /// The worker raised an exception (`WORK_EXCEPTION`) with this payload.
    Exception(Vec<u8>),
    /// The client side failed the job (e.g. its session dropped).
    Client(ClientError),
}

impl std::fmt::Display for JobFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobFailure::WorkFailed => write!(f, "worker reported failure"),
            JobFailure::Exception(data) => {
                write!(f, "worker exception: {}", String::from_utf8_lossy(data))
            }
            JobFailure::Client(err) => write!(f, "{err}"),
        }
    }
}

/// Observable change in a job's lifecycle, delivered to the job's listener.
#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    /// The server acknowledged the submission and assigned a handle.
    Created { handle: JobHandle },
    /// `WORK_STATUS` progress update.
    Progress(Progress),
    /// `STATUS_RES` answer to an explicit status query.
    Status(StatusSnapshot),
    /// Partial result chunk (`WORK_DATA`).
    Data(Vec<u8>),
    /// Warning text (`WORK_WARNING`); state is unchanged.
    Warning(Vec<u8>),
    /// Whole result (`WORK_COMPLETE`), streamed chunks included.
    Complete(Vec<u8>),
    /// Terminal failure, from the worker or the client side.
    Failed(JobFailure),
    /// Closed on the client side; nothing further will be delivered.
    Closed,
}

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// One unit of submitted work and its evolving lifecycle.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    function: FunctionName,
    payload: Vec<u8>,
    unique: Option<UniqueId>,
    priority: Priority,
    background: bool,
    handle: Option<JobHandle>,
    session: Option<SessionId>,
    state: JobState,
    progress: Progress,
    status: Option<StatusSnapshot>,
    result: Option<Vec<u8>>,
    warnings: Vec<Vec<u8>>,
    failure: Option<JobFailure>,
    submitted_at: Option<Timestamp>,
    finished_at: Option<Timestamp>,
}

impl Job {
    /// Validates a spec into a job in [`JobState::New`].
    ///
    /// # Errors
    ///
    /// [`ClientError::Configuration`] if the function name is empty, or the
    /// function name or unique token contains a NUL byte (they travel as
    /// NUL-delimited packet arguments).
    pub fn new(spec: JobSpec) -> Result<Self, ClientError> {
        if spec.function.contains('\0') {
            return Err(ClientError::configuration("function name contains a NUL byte"));
        }
        let function = FunctionName::new(spec.function)
            .ok_or_else(|| ClientError::configuration("function name is empty"))?;
        if spec.unique.as_deref().is_some_and(|u| u.contains('\0')) {
            return Err(ClientError::configuration("unique id contains a NUL byte"));
        }
        let unique = spec.unique.and_then(UniqueId::new);

        Ok(Self {
            function,
            payload: spec.payload,
            unique,
            priority: spec.priority,
            background: spec.background,
            handle: None,
            session: None,
            state: JobState::New,
            progress: Progress::default(),
            status: None,
            result: None,
            warnings: Vec::new(),
            failure: None,
            submitted_at: None,
            finished_at: None,
        })
    }

    /// Registered function name.
    pub fn function(&self) -> &FunctionName {
        &self.function
    }

    /// Input handed to the worker.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Uniqueness token, if any.
    pub fn unique(&self) -> Option<&UniqueId> {
        self.unique.as_ref()
    }

    /// Requested queue priority.
    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// Whether the job was submitted as background.
    pub fn is_background(&self) -> bool {
        self.background
    }

    /// Server-assigned handle; `None` until creation is acknowledged.
    pub fn handle(&self) -> Option<&JobHandle> {
        self.handle.as_ref()
    }

    /// Session the job was written to; `None` until submitted.
    pub fn session(&self) -> Option<&SessionId> {
        self.session.as_ref()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> JobState {
        self.state
    }

    /// Latest reported progress.
    pub fn progress(&self) -> Progress {
        self.progress
    }

    /// Last `STATUS_RES` snapshot, if the job was ever polled.
    pub fn status(&self) -> Option<StatusSnapshot> {
        self.status
    }

    /// Result bytes received so far: `WORK_DATA` chunks, then the
    /// `WORK_COMPLETE` payload. `None` until any arrive.
    pub fn result(&self) -> Option<&[u8]> {
        self.result.as_deref()
    }

    /// Every `WORK_WARNING` message, oldest first.
    pub fn warnings(&self) -> &[Vec<u8>] {
        &self.warnings
    }

    /// Why the job failed, once it has.
    pub fn failure(&self) -> Option<&JobFailure> {
        self.failure.as_ref()
    }

    /// When the job was written to a session.
    pub fn submitted_at(&self) -> Option<Timestamp> {
        self.submitted_at
    }

    /// When the job reached a terminal state.
    pub fn finished_at(&self) -> Option<Timestamp> {
        self.finished_at
    }

    // -----------------------------------------------------------------------
    // Wire packets
    // -----------------------------------------------------------------------

    /// Builds the `SUBMIT_JOB*` packet for this job's background flag and priority.
    pub fn submit_packet(&self) -> Result<Packet, ProtocolError> {
        let unique = self
            .unique
            .as_ref()
            .map(|u| u.as_bytes().to_vec())
            .unwrap_or_default();
        Packet::request(
            PacketType::submit(self.background, self.priority),
            vec![self.function.as_bytes().to_vec(), unique, self.payload.clone()],
        )
    }

    /// Builds the `GET_STATUS` packet for this job.
    ///
    /// # Errors
    ///
    /// [`ClientError::JobState`] if the job has no handle yet.
    pub fn status_request_packet(&self) -> Result<Packet, ClientError> {
        let handle = self.handle.as_ref().ok_or_else(|| self.state_error("job has no handle yet"))?;
        Packet::request(PacketType::GetStatus, vec![handle.as_bytes().to_vec()]).map_err(|source| {
            ClientError::JobState {
                handle: Some(handle.clone()),
                message: source.to_string(),
            }
        })
    }

    // -----------------------------------------------------------------------
    // Transitions
    // -----------------------------------------------------------------------

    fn state_error(&self, message: impl Into<String>) -> ClientError {
        ClientError::JobState {
            handle: self.handle.clone(),
            message: message.into(),
        }
    }

    fn illegal(&self, transition: &str) -> ClientError {
        self.state_error(format!("cannot {transition} a job in state {}", self.state))
    }

    /// Records that the job was written to `session` and awaits its handle.
    pub fn mark_pending(&mut self, session: SessionId) -> Result<(), ClientError> {
        if self.state != JobState::New {
            return Err(self.illegal("submit"));
        }
        self.session = Some(session);
        self.state = JobState::PendingCreation;
        self.submitted_at = Some(Timestamp::now());
        Ok(())
    }

    /// Assigns the server handle from `JOB_CREATED`.
    ///
    /// Foreground jobs become [`JobState::Created`]; background jobs go on to
    /// [`JobState::Acknowledged`] since nothing but polled status will follow.
    pub fn mark_created(&mut self, handle: JobHandle) -> Result<JobEvent, ClientError> {
        if self.state != JobState::PendingCreation || self.handle.is_some() {
            return Err(self.illegal("assign a handle to"));
        }
        self.handle = Some(handle.clone());
        self.state = if self.background {
            JobState::Acknowledged
        } else {
            JobState::Created
        };
        Ok(JobEvent::Created { handle })
    }

    /// Applies a `WORK_STATUS` progress report.
    pub fn apply_progress(&mut self, progress: Progress) -> Result<JobEvent, ClientError> {
        if self.state.is_terminal() || self.handle.is_none() {
            return Err(self.illegal("report progress for"));
        }
        self.progress = progress;
        if !self.background {
            self.state = JobState::Running;
        }
        Ok(JobEvent::Progress(progress))
    }

    /// Applies a `STATUS_RES` snapshot. State is left as it is.
    pub fn apply_status(&mut self, snapshot: StatusSnapshot) -> Result<JobEvent, ClientError> {
        if self.state.is_terminal() || self.handle.is_none() {
            return Err(self.illegal("record status for"));
        }
        self.status = Some(snapshot);
        self.progress = snapshot.progress;
        Ok(JobEvent::Status(snapshot))
    }

    /// Appends a `WORK_DATA` chunk to the result.
    pub fn apply_data(&mut self, chunk: Vec<u8>) -> Result<JobEvent, ClientError> {
        if self.background || !matches!(self.state, JobState::Created | JobState::Running) {
            return Err(self.illegal("deliver data to"));
        }
        self.result.get_or_insert_with(Vec::new).extend_from_slice(&chunk);
        self.state = JobState::Running;
        Ok(JobEvent::Data(chunk))
    }

    /// Appends a `WORK_WARNING` message to the warning log.
    pub fn apply_warning(&mut self, message: Vec<u8>) -> Result<JobEvent, ClientError> {
        if self.state.is_terminal() || self.handle.is_none() {
            return Err(self.illegal("warn"));
        }
        self.warnings.push(message.clone());
        Ok(JobEvent::Warning(message))
    }

    /// Applies `WORK_COMPLETE`, whose payload follows any streamed chunks.
    ///
    /// The event carries the whole result, chunks included.
    pub fn complete(&mut self, tail: Vec<u8>) -> Result<JobEvent, ClientError> {
        if self.background || !matches!(self.state, JobState::Created | JobState::Running) {
            return Err(self.illegal("complete"));
        }
        let result = self.result.get_or_insert_with(Vec::new);
        result.extend_from_slice(&tail);
        let result = result.clone();
        self.state = JobState::Complete;
        self.finished_at = Some(Timestamp::now());
        Ok(JobEvent::Complete(result))
    }

    /// Fails the job from any non-terminal state that has reached a server.
    pub fn fail(&mut self, failure: JobFailure) -> Result<JobEvent, ClientError> {
        if self.state.is_terminal() || self.state == JobState::New {
            return Err(self.illegal("fail"));
        }
        self.state = JobState::Failed;
        self.failure = Some(failure.clone());
        self.finished_at = Some(Timestamp::now());
        Ok(JobEvent::Failed(failure))
    }

    /// Forcibly abandons the job on the client side.
    ///
    /// Valid from every state. Returns `None` if the job was already closed.
    /// The server is not told.
    pub fn close(&mut self) -> Option<JobEvent> {
        if self.state == JobState::Closed {
            return None;
        }
        self.state = JobState::Closed;
        if self.finished_at.is_none() {
            self.finished_at = Some(Timestamp::now());
        }
        Some(JobEvent::Closed)
    }
}

impl std::fmt::Display for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Job({}, {}", self.function, self.state)?;
        if let Some(handle) = &self.handle {
            write!(f, ", {handle}")?;
        }
        if self.background {
            write!(f, ", background")?;
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> SessionId {
        SessionId::new("a.example:4730").unwrap()
    }

    fn handle(raw: &str) -> JobHandle {
        JobHandle::new(raw).unwrap()
    }

    fn created(spec: JobSpec) -> Job {
        let mut job = Job::new(spec).unwrap();
        job.mark_pending(session()).unwrap();
        job.mark_created(handle("H:1")).unwrap();
        job
    }

    #[test]
    fn validation_rejects_bad_specs() {
        assert!(matches!(
            Job::new(JobSpec::new("", "x")),
            Err(ClientError::Configuration { .. })
        ));
        assert!(matches!(
            Job::new(JobSpec::new("rev\0erse", "x")),
            Err(ClientError::Configuration { .. })
        ));
        assert!(matches!(
            Job::new(JobSpec::new("reverse", "x").with_unique("a\0b")),
            Err(ClientError::Configuration { .. })
        ));
        let job = Job::new(JobSpec::new("reverse", "x").with_unique("")).unwrap();
        assert!(job.unique().is_none());
        assert_eq!(job.state(), JobState::New);
    }

    #[test]
    fn foreground_lifecycle_runs_to_completion() {
        let mut job = created(JobSpec::new("reverse", "hello"));
        assert_eq!(job.state(), JobState::Created);
        assert_eq!(job.session(), Some(&session()));

        job.apply_progress(Progress::new(1, 2)).unwrap();
        assert_eq!(job.state(), JobState::Running);
        job.apply_warning(b"slow".to_vec()).unwrap();
        assert_eq!(job.state(), JobState::Running);
        assert_eq!(job.warnings(), &[b"slow".to_vec()]);

        let event = job.complete(b"olleh".to_vec()).unwrap();
        assert_eq!(event, JobEvent::Complete(b"olleh".to_vec()));
        assert_eq!(job.state(), JobState::Complete);
        assert_eq!(job.result(), Some(&b"olleh"[..]));
        assert!(job.finished_at().is_some());
        assert!(job.apply_warning(b"late".to_vec()).is_err());
    }

    #[test]
    fn work_data_chunks_accumulate_into_the_result() {
        let mut job = created(JobSpec::new("reverse", "hello"));
        assert!(job.result().is_none());

        assert_eq!(job.apply_data(b"ol".to_vec()).unwrap(), JobEvent::Data(b"ol".to_vec()));
        job.apply_data(b"l".to_vec()).unwrap();
        assert_eq!(job.state(), JobState::Running);
        assert_eq!(job.result(), Some(&b"oll"[..]));

        let event = job.complete(b"eh".to_vec()).unwrap();
        assert_eq!(event, JobEvent::Complete(b"olleh".to_vec()));
        assert_eq!(job.result(), Some(&b"olleh"[..]));
        assert!(job.apply_data(b"late".to_vec()).is_err());
        assert_eq!(job.result(), Some(&b"olleh"[..]));
    }

    #[test]
    fn background_jobs_are_acknowledged_and_never_complete() {
        let mut job = created(JobSpec::new("reverse", "hello").background());
        assert_eq!(job.state(), JobState::Acknowledged);
        assert_eq!(job.handle(), Some(&handle("H:1")));
        assert!(job.complete(Vec::new()).is_err());

        let snapshot = StatusSnapshot {
            known: true,
            running: true,
            progress: Progress::new(3, 10),
        };
        job.apply_status(snapshot).unwrap();
        assert_eq!(job.state(), JobState::Acknowledged);
        assert_eq!(job.status(), Some(snapshot));
        assert_eq!(job.progress(), Progress::new(3, 10));
    }

    #[test]
    fn handle_is_assigned_once() {
        let mut job = created(JobSpec::new("reverse", "hello"));
        assert!(job.mark_created(handle("H:2")).is_err());
        assert_eq!(job.handle(), Some(&handle("H:1")));
    }

    #[test]
    fn session_is_assigned_once() {
        let mut job = Job::new(JobSpec::new("reverse", "hello")).unwrap();
        job.mark_pending(session()).unwrap();
        assert!(job.mark_pending(SessionId::new("b.example:4730").unwrap()).is_err());
        assert_eq!(job.session(), Some(&session()));
    }

    #[test]
    fn close_is_valid_from_any_state_once() {
        let mut job = Job::new(JobSpec::new("reverse", "hello")).unwrap();
        assert_eq!(job.close(), Some(JobEvent::Closed));
        assert_eq!(job.close(), None);
        assert_eq!(job.state(), JobState::Closed);

        let mut job = created(JobSpec::new("reverse", "hello"));
        job.fail(JobFailure::WorkFailed).unwrap();
        assert_eq!(job.close(), Some(JobEvent::Closed));
    }

    #[test]
    fn pending_jobs_can_fail_but_new_jobs_cannot() {
        let mut job = Job::new(JobSpec::new("reverse", "hello")).unwrap();
        assert!(job.fail(JobFailure::WorkFailed).is_err());
        job.mark_pending(session()).unwrap();
        let err = ClientError::connection(&session(), "reset");
        job.fail(JobFailure::Client(err.clone())).unwrap();
        assert_eq!(job.failure(), Some(&JobFailure::Client(err)));
        assert!(job.handle().is_none());
    }

    #[test]
    fn packets_reflect_job_options() {
        let job = Job::new(
            JobSpec::new("reverse", "hello")
                .with_priority(Priority::High)
                .with_unique("u-1")
                .background(),
        )
        .unwrap();
        let packet = job.submit_packet().unwrap();
        assert_eq!(packet.kind(), PacketType::SubmitJobHighBg);
        assert_eq!(
            packet.args(),
            &[b"reverse".to_vec(), b"u-1".to_vec(), b"hello".to_vec()]
        );
        assert!(matches!(
            job.status_request_packet(),
            Err(ClientError::JobState { handle: None, .. })
        ));

        let job = created(JobSpec::new("reverse", "hello").background());
        let packet = job.status_request_packet().unwrap();
        assert_eq!(packet.kind(), PacketType::GetStatus);
        assert_eq!(packet.arg(0), Some(&b"H:1"[..]));
    }
}
