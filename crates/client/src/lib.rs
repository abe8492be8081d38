//! Gearman client infrastructure.
//!
//! Implements the socket side of the [`protocol`] crate:
//!
//! - [`SessionHandle`]: one tokio task per job server, owning the framed
//!   socket and the pending-created queue that correlates `JOB_CREATED`
//!   packets with submissions.
//! - [`Client`]: the facade callers use. Picks a session per submission via a
//!   [`protocol::LoadBalancer`], connects it on demand and keeps the
//!   handle → job table shared by every session.
//!
//! ## Architectural Layer
//!
//! **Infrastructure.** Sockets, framing and task scheduling live here. Packet
//! meaning and job state transitions stay in [`protocol`].
//!
//! ## Module Layout
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`transport`] | `Connector` port and the TCP implementation |
//! | [`codec`] | `tokio_util` framing over `protocol::decode` |
//! | [`tracked`] | `TrackedJob` shared job view and `JobTable` |
//! | [`events`] | `ClientEvent` notifications |
//! | [`session`] | Session task and `SessionHandle` |
//! | [`client`] | `Client`, its builder and submission results |

pub mod client;
pub mod codec;
pub mod events;
pub mod session;
pub mod tracked;
pub mod transport;

pub use client::{Client, ClientBuilder, SubmitError, SubmittedJob};
pub use codec::{CodecError, PacketCodec};
pub use events::ClientEvent;
pub use session::{ConnectionState, PendingCreation, SessionHandle, SessionOptions};
pub use tracked::{JobTable, TrackedJob};
pub use transport::{BoxedTransport, Connector, TcpConnector, Transport};
