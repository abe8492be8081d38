//! Core domain of the Gearman job-server client.
//!
//! This crate contains the packet codec, the job lifecycle state machine, the
//! typed client configuration and the port traits the infrastructure crate
//! plugs into. It never touches a socket: the `client` crate supplies the
//! transport and the event loop, this crate decides what bytes mean.
//!
//! ## Architectural Layer
//!
//! **Business logic + port definitions.** No I/O dependencies. Decoding is a
//! pure function over a byte buffer so it can be driven by any read loop.
//!
//! ## Module Layout
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`identifiers`] | Newtype identifiers (`JobHandle`, `SessionId`, etc.) |
//! | [`types`] | Value types (`Priority`, `ServerAddress`, `Progress`, etc.) |
//! | [`errors`] | `ProtocolError`, `ClientError` and `RetryPolicy` |
//! | [`packet`] | Wire header, packet types, `encode`/`decode` |
//! | [`job`] | `JobSpec`, `Job` and its state machine, `JobEvent` |
//! | [`balancing`] | `LoadBalancer` and `SessionIdScheme` ports with defaults |
//! | [`config`] | `ClientConfig` and its validation |

pub mod balancing;
pub mod config;
pub mod errors;
pub mod identifiers;
pub mod job;
pub mod packet;
pub mod types;

// Re-export everything at the crate root for ergonomic usage by downstream crates.
pub use balancing::{
    AddressSessionIds, FirstServer, LoadBalancer, RoundRobin, ServerSlot, SessionIdScheme,
};
pub use config::{ClientConfig, LoadBalancing};
pub use errors::{ClientError, ProtocolError, RetryPolicy};
pub use identifiers::{ClientId, FunctionName, JobHandle, SessionId, UniqueId};
pub use job::{Job, JobEvent, JobFailure, JobSpec, JobState};
pub use packet::{decode, encode, Decoded, Magic, Packet, PacketType, DEFAULT_MAX_PACKET_SIZE, HEADER_LEN};
pub use types::{
    Priority, Progress, ServerAddress, StatusSnapshot, Timestamp, DEFAULT_HOST, DEFAULT_PORT,
};
