//! Client-level lifecycle notifications.
//!
//! Delivered over a `tokio::sync::broadcast` channel obtained from
//! [`crate::Client::subscribe`]. Per-job notifications travel separately, as
//! [`protocol::JobEvent`]s on each job's own channel.

use protocol::{ClientError, SessionId};

/// Notification raised by a client's sessions.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// A session opened its connection.
    Connected { session: SessionId },
    /// A submission was written; `pending` jobs now await acknowledgement on
    /// that session.
    Submitted { session: SessionId, pending: usize },
    /// A session failed or the server reported an error.
    Error { session: SessionId, error: ClientError },
}
