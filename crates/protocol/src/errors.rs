//! Error and retry-policy types for the client domain.
//!
//! [`ProtocolError`] covers everything the packet codec can reject.
//! [`ClientError`] is what callers observe: every failure of a submission,
//! status query or session is delivered as one of its variants, through the
//! same channel the success would have used.
//!
//! [`RetryPolicy`] is a cross-cutting concern: sessions never retry on their
//! own, so each error tells the caller whether trying again makes sense.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{JobHandle, SessionId};

// ---------------------------------------------------------------------------
// Retry semantics
// ---------------------------------------------------------------------------

/// Whether an error condition is safe to retry and, if so, after what delay.
///
/// - `Retryable` errors: connection refused, reset or timed out.
/// - `NonRetryable` errors: invalid configuration, protocol violations, illegal
///   job state transitions, errors reported by the server itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RetryPolicy {
    /// The operation may be retried.
    Retryable {
        /// Minimum back-off before the next attempt. `None` means retry
        /// immediately or apply the caller's own back-off schedule.
        after: Option<Duration>,
    },
    /// The operation must not be retried without changing something first.
    NonRetryable,
}

// ---------------------------------------------------------------------------
// Codec errors
// ---------------------------------------------------------------------------

/// Reasons a byte stream or packet is not valid protocol.
///
/// A session that decodes one of these is unusable from then on.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// The first four header bytes are neither `\0REQ` nor `\0RES`.
    #[error("bad magic tag {found:?}")]
    BadMagic {
        /// The four bytes that were read.
        found: [u8; 4],
    },

    /// The header names a packet type this client does not know.
    #[error("unknown packet type {code}")]
    UnknownPacketType {
        /// Numeric type code from the header.
        code: u32,
    },

    /// The declared argument section exceeds the configured maximum.
    #[error("packet of {size} bytes exceeds the {max} byte limit")]
    PacketTooLarge {
        /// Declared argument-section length.
        size: usize,
        /// Configured maximum.
        max: usize,
    },

    /// The number of arguments does not match the packet type.
    #[error("{packet} expects {expected} argument(s), found {found}")]
    ArgumentCount {
        /// Packet type name.
        packet: &'static str,
        /// Arity of the packet type.
        expected: usize,
        /// Arguments supplied or decoded.
        found: usize,
    },

    /// A non-final argument contains a NUL byte and would split on the wire.
    #[error("{packet} argument {index} contains a NUL byte")]
    EmbeddedNul {
        /// Packet type name.
        packet: &'static str,
        /// Zero-based argument position.
        index: usize,
    },

    /// An argument could not be interpreted (bad handle, non-numeric progress).
    #[error("malformed {packet} argument: {detail}")]
    MalformedArgument {
        /// Packet type name.
        packet: &'static str,
        /// What was wrong with it.
        detail: String,
    },

    /// A well-formed packet arrived that makes no sense in the session's state
    /// (a request-direction packet from the server, an acknowledgement with
    /// nothing awaiting one).
    #[error("unexpected packet: {detail}")]
    UnexpectedPacket {
        /// What was unexpected.
        detail: String,
    },
}

// ---------------------------------------------------------------------------
// Client-visible errors
// ---------------------------------------------------------------------------

/// Errors delivered to callers of the client, its sessions and its jobs.
///
/// `Clone` because a single session failure is fanned out to every job the
/// session owned.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ClientError {
    /// Construction options or a job specification are invalid.
    ///
    /// Always produced synchronously, before any socket is touched.
    #[error("Configuration error: {message}")]
    Configuration {
        /// Description of the configuration problem.
        message: String,
    },

    /// Establishing or keeping the connection to a job server failed.
    #[error("Connection error on {session}: {message}")]
    Connection {
        /// Session that failed.
        session: SessionId,
        /// Description of the socket failure.
        message: String,
    },

    /// The server sent bytes that are not valid protocol.
    #[error("Protocol error on {session}: {source}")]
    Protocol {
        /// Session that received the bad data.
        session: SessionId,
        /// What the codec rejected.
        #[source]
        source: ProtocolError,
    },

    /// The operation is not valid for the job in its current state.
    ///
    /// Produced synchronously; no I/O is performed.
    #[error("Job state error: {message}")]
    JobState {
        /// Handle of the job, if it has one.
        handle: Option<JobHandle>,
        /// Description of the violated precondition.
        message: String,
    },

    /// The server answered with a generic `ERROR` packet.
    #[error("Server error {code} on {session}: {message}")]
    Server {
        /// Session that received the packet.
        session: SessionId,
        /// Server-defined error code.
        code: String,
        /// Server-provided description.
        message: String,
    },
}

impl ClientError {
    /// Shorthand for a [`ClientError::Configuration`].
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Shorthand for a [`ClientError::Connection`].
    pub fn connection(session: &SessionId, message: impl Into<String>) -> Self {
        Self::Connection {
            session: session.clone(),
            message: message.into(),
        }
    }

    /// Returns whether the caller may retry the failed operation.
    pub fn retry_policy(&self) -> RetryPolicy {
        match self {
            ClientError::Connection { .. } => RetryPolicy::Retryable { after: None },
            ClientError::Configuration { .. }
            | ClientError::Protocol { .. }
            | ClientError::JobState { .. }
            | ClientError::Server { .. } => RetryPolicy::NonRetryable,
        }
    }
}
