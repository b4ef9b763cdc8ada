//! Connection to the control server.
//!
//! - **Protocol**: dot-terminated line messages, see [`protocol`]
//! - **Session**: [`Session`] connects, announces the host, dispatches
//!   inbound commands to the orchestrator and reconnects after failures
//! - **Heartbeat**: a silent connection is probed with `Ping`; a missing
//!   `Pong` drops it
//! - **Logging**: job and worker log events travel to the control server
//!   while a connection is up

mod connection;
pub mod host;
pub mod logging;
pub mod outbound;
pub mod protocol;

pub use connection::{ConnectionState, Session};
pub use host::HostInfo;
pub use logging::{LogForwarder, RemoteLogLayer};
pub use outbound::OutboundSlot;
