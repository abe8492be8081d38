//! Newtype domain identifiers.
//!
//! Every identity in the client is a distinct newtype wrapping a primitive, so a
//! server-assigned [`JobHandle`] can never be passed where a client-derived
//! [`SessionId`] is expected even though both are strings on the wire.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Macro for String-wrapped newtypes.
// Generates: struct, new() returning Option<Self>, as_str(), as_bytes(), Display.
// ---------------------------------------------------------------------------
macro_rules! string_id {
    (
        $(#[$attr:meta])*
        $name:ident
    ) => {
        $(#[$attr])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(String);

        impl $name {
            /// Creates a new identifier, returning `None` if the value is empty.
            pub fn new(value: impl Into<String>) -> Option<Self> {
                let v = value.into();
                if v.is_empty() { None } else { Some(Self(v)) }
            }

            /// Returns the identifier as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Returns the identifier as raw bytes, as written on the wire.
            pub fn as_bytes(&self) -> &[u8] {
                self.0.as_bytes()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

// ---------------------------------------------------------------------------
// Identifiers: server-assigned
// ---------------------------------------------------------------------------

string_id! {
    /// Opaque job identifier assigned by the job server in `JOB_CREATED`.
    ///
    /// Every later status, progress and result packet for the job carries it.
    /// Once assigned to a job it never changes.
    JobHandle
}

impl JobHandle {
    /// Parses a handle from a packet argument.
    ///
    /// Returns `None` if the bytes are empty or not valid UTF-8.
    pub fn from_wire(bytes: &[u8]) -> Option<Self> {
        std::str::from_utf8(bytes).ok().and_then(Self::new)
    }
}

// ---------------------------------------------------------------------------
// Identifiers: caller-supplied
// ---------------------------------------------------------------------------

string_id! {
    /// Name of the function a worker registered and the job should run
    /// (e.g. `"reverse"`).
    FunctionName
}

string_id! {
    /// Client-chosen uniqueness token. Jobs submitted with the same token
    /// for the same function are coalesced by the server.
    UniqueId
}

// ---------------------------------------------------------------------------
// Identifiers: client-derived
// ---------------------------------------------------------------------------

string_id! {
    /// Identifies one job-server session within a client.
    ///
    /// Derived by a [`crate::SessionIdScheme`]; unique per client.
    SessionId
}

/// Identifies one client instance.
///
/// Generated fresh for every client; attached to its tracing span so the
/// activity of several clients in one process can be told apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientId(Uuid);

impl ClientId {
    /// Generates a new random client identifier.
    pub fn new_random() -> Self {
        Self(Uuid::new_v4())
    }

    /// Returns the underlying [`Uuid`].
    pub fn as_uuid(self) -> Uuid {
        self.0
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
