//! Port traits for choosing a session per submission and naming sessions.
//!
//! Both are placeholders in the simplest deployments (one server, first
//! session, `host:port` ids) and are injected into the client so callers can
//! supply their own strategy.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::{ServerAddress, SessionId};

/// What a [`LoadBalancer`] sees of one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSlot {
    pub id: SessionId,
    pub address: ServerAddress,
    /// Whether the session currently has an open connection.
    pub connected: bool,
}

/// Selects the session that receives the next submission.
///
/// Invoked exactly once per submission with every configured session, in
/// configuration order. Returning `None` or an out-of-range index fails the
/// submission with a configuration error.
pub trait LoadBalancer: Send + Sync {
    fn choose(&self, candidates: &[ServerSlot]) -> Option<usize>;
}

/// Always picks the first configured session.
#[derive(Debug, Clone, Copy, Default)]
pub struct FirstServer;

impl LoadBalancer for FirstServer {
    fn choose(&self, candidates: &[ServerSlot]) -> Option<usize> {
        if candidates.is_empty() {
            None
        } else {
            Some(0)
        }
    }
}

/// Cycles through the configured sessions in order.
#[derive(Debug, Default)]
pub struct RoundRobin {
    next: AtomicUsize,
}

impl LoadBalancer for RoundRobin {
    fn choose(&self, candidates: &[ServerSlot]) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }
        Some(self.next.fetch_add(1, Ordering::Relaxed) % candidates.len())
    }
}

/// Derives the identifier of the session for the `index`-th configured server.
///
/// Identifiers must be unique within a client; the client rejects a
/// configuration whose derived ids collide.
pub trait SessionIdScheme: Send + Sync {
    fn derive(&self, index: usize, address: &ServerAddress) -> Option<SessionId>;
}

/// Names each session `host:port`.
#[derive(Debug, Clone, Copy, Default)]
pub struct AddressSessionIds;

impl SessionIdScheme for AddressSessionIds {
    fn derive(&self, _index: usize, address: &ServerAddress) -> Option<SessionId> {
        SessionId::new(address.to_string())
    }
}
