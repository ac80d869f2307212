//! Nix daemon worker protocol constants
//!
//! # Wire Format
//!
//! Every value is a sequence of 8-byte little-endian words (see
//! [`crate::codec`]). A connection starts with a handshake:
//!
//! ```text
//! client -> CLIENT_MAGIC
//! server -> SERVER_MAGIC, protocol version
//! client -> protocol version, cpu affinity (0), reserve space (0)
//! server -> nix version (string), trust status, STDERR_LAST
//! ```
//!
//! After that, each operation is `opcode || body` from the client, answered
//! by a run of stderr events terminated by `STDERR_LAST` and then the reply.

use std::fmt;

use crate::codec::{Decode, Encode, WireRead, put_int};
use crate::error::Error;

/// Sent by the client to open a connection
pub const CLIENT_MAGIC: u64 = 0x6e697863;

/// Sent by the daemon in answer to [`CLIENT_MAGIC`]
pub const SERVER_MAGIC: u64 = 0x6478696f;

/// Protocol major version spoken by this client
pub const PROTOCOL_MAJOR: u8 = 1;

/// Protocol minor version spoken by this client
pub const PROTOCOL_MINOR: u8 = 37;

/// Stderr event markers. Each starts a frame in the daemon's log stream.
pub mod marker {
    pub const WRITE: u64 = 0x64617416;
    pub const ERROR: u64 = 0x63787470;
    pub const NEXT: u64 = 0x6f6c6d67;
    pub const START_ACTIVITY: u64 = 0x53545254;
    pub const STOP_ACTIVITY: u64 = 0x53544f50;
    pub const RESULT: u64 = 0x52534c54;
    /// Ends a stderr run, no body follows
    pub const LAST: u64 = 0x616c7473;
}

/// A stderr frame marker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Marker {
    Write,
    Next,
    Error,
    StartActivity,
    StopActivity,
    Result,
    Last,
}

impl Marker {
    pub const ALL: [Marker; 7] = [
        Marker::Write,
        Marker::Next,
        Marker::Error,
        Marker::StartActivity,
        Marker::StopActivity,
        Marker::Result,
        Marker::Last,
    ];

    /// Interpret a word as a marker. Any other value is not a marker.
    pub fn from_word(value: u64) -> Option<Self> {
        match value {
            marker::WRITE => Some(Marker::Write),
            marker::NEXT => Some(Marker::Next),
            marker::ERROR => Some(Marker::Error),
            marker::START_ACTIVITY => Some(Marker::StartActivity),
            marker::STOP_ACTIVITY => Some(Marker::StopActivity),
            marker::RESULT => Some(Marker::Result),
            marker::LAST => Some(Marker::Last),
            _ => None,
        }
    }

    pub fn value(self) -> u64 {
        match self {
            Marker::Write => marker::WRITE,
            Marker::Next => marker::NEXT,
            Marker::Error => marker::ERROR,
            Marker::StartActivity => marker::START_ACTIVITY,
            Marker::StopActivity => marker::STOP_ACTIVITY,
            Marker::Result => marker::RESULT,
            Marker::Last => marker::LAST,
        }
    }
}

impl Encode for Marker {
    fn encode_into(&self, out: &mut Vec<u8>) {
        put_int(out, self.value());
    }
}

impl fmt::Display for Marker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Marker::Write => "STDERR_WRITE",
            Marker::Next => "STDERR_NEXT",
            Marker::Error => "STDERR_ERROR",
            Marker::StartActivity => "STDERR_START_ACTIVITY",
            Marker::StopActivity => "STDERR_STOP_ACTIVITY",
            Marker::Result => "STDERR_RESULT",
            Marker::Last => "STDERR_LAST",
        };
        f.write_str(name)
    }
}

/// Protocol version, packed on the wire as `major << 8 | minor`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProtocolVersion {
    pub major: u8,
    pub minor: u8,
}

impl ProtocolVersion {
    pub const fn new(major: u8, minor: u8) -> Self {
        Self { major, minor }
    }

    /// The version this client declares and requires
    pub const fn own() -> Self {
        Self::new(PROTOCOL_MAJOR, PROTOCOL_MINOR)
    }

    pub fn to_word(self) -> u64 {
        (u64::from(self.major) << 8) | u64::from(self.minor)
    }

    /// Unpack a version word. Bits above the major byte are dropped.
    pub fn from_word(value: u64) -> Self {
        Self {
            major: (value >> 8) as u8,
            minor: value as u8,
        }
    }

    /// Unpack a version word, or `None` if any bit above the major byte is set
    pub fn from_exact_word(value: u64) -> Option<Self> {
        (value >> 16 == 0).then(|| Self::from_word(value))
    }
}

impl Encode for ProtocolVersion {
    fn encode_into(&self, out: &mut Vec<u8>) {
        put_int(out, self.to_word());
    }
}

impl Decode for ProtocolVersion {
    fn decode_from<R: std::io::Read + ?Sized>(reader: &mut R) -> Result<Self, Error> {
        Ok(Self::from_word(reader.read_int()?))
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Whether the daemon trusts this client, as reported during the handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustStatus {
    Unspecified,
    Trusted,
    Untrusted,
}

impl TryFrom<u64> for TrustStatus {
    type Error = Error;

    fn try_from(value: u64) -> Result<Self, Error> {
        match value {
            0 => Ok(TrustStatus::Unspecified),
            1 => Ok(TrustStatus::Trusted),
            2 => Ok(TrustStatus::Untrusted),
            tag => Err(Error::UnknownTag {
                what: "trust status",
                tag,
            }),
        }
    }
}

impl fmt::Display for TrustStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrustStatus::Unspecified => write!(f, "unspecified"),
            TrustStatus::Trusted => write!(f, "trusted"),
            TrustStatus::Untrusted => write!(f, "untrusted"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_packing() {
        let v = ProtocolVersion::new(1, 34);
        assert_eq!(v.encode(), vec![34, 1, 0, 0, 0, 0, 0, 0]);
        assert_eq!(ProtocolVersion::own().to_word(), 0x125);
        assert_eq!(ProtocolVersion::from_word(0x125), ProtocolVersion::own());
    }

    #[test]
    fn exact_word_rejects_high_bits() {
        assert_eq!(
            ProtocolVersion::from_exact_word(0x125),
            Some(ProtocolVersion::own())
        );
        assert_eq!(ProtocolVersion::from_exact_word(0x1_0125), None);
        // The lossy form would have matched
        assert_eq!(ProtocolVersion::from_word(0x1_0125), ProtocolVersion::own());
    }

    #[test]
    fn version_decode() {
        let (v, used) = ProtocolVersion::decode(&[36, 1, 0, 0, 0, 0, 0, 0]).unwrap();
        assert_eq!(v, ProtocolVersion::new(1, 36));
        assert_eq!(used, 8);
        assert_eq!(v.to_string(), "1.36");
    }

    #[test]
    fn markers_roundtrip_through_words() {
        for m in Marker::ALL {
            assert_eq!(Marker::from_word(m.value()), Some(m));
        }
        assert_eq!(Marker::from_word(1), None);
        assert_eq!(Marker::from_word(0), None);
    }

    #[test]
    fn trust_status_values() {
        assert_eq!(TrustStatus::try_from(0).unwrap(), TrustStatus::Unspecified);
        assert_eq!(TrustStatus::try_from(1).unwrap(), TrustStatus::Trusted);
        assert_eq!(TrustStatus::try_from(2).unwrap(), TrustStatus::Untrusted);
        assert!(matches!(
            TrustStatus::try_from(3),
            Err(Error::UnknownTag { tag: 3, .. })
        ));
    }
}
