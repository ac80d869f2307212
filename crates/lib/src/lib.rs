//! Client side of the Nix daemon worker protocol.
//!
//! [`Connection`] wraps a pair of byte streams, performs the handshake and
//! exposes operations. The lower layers ([`codec`], [`log`], [`stderr`]) are
//! public for callers that implement further operations themselves.

pub mod client;
pub mod codec;
pub mod error;
pub mod handshake;
pub mod log;
pub mod operation;
pub mod paths;
pub mod protocol;
pub mod stderr;

pub use client::{Connection, ConnectionOptions};
pub use error::{Error, ErrorKind};
pub use operation::{ClientSettings, Opcode, Operation};
pub use protocol::ProtocolVersion;
pub use stderr::{Drained, StderrEvent, StderrMode};
