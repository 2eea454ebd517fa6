//! The TCPROS peer protocol: the wire codec for message fields, the key=value
//! connection header exchanged when a peer connection is opened, and the
//! length-prefixed framing that carries serialized messages and service
//! requests / responses over TCP.
//!
//! This crate is transport-only: it knows how bytes are laid out and how a
//! connection starts, but nothing about topics, services or the master. The
//! node layer lives in the `rosbus` crate.

pub mod framing;
pub mod header;
pub mod message;
pub mod wire;

pub use header::ConnectionHeader;
pub use message::{RosMessage, RosService};
