//! Connection handshake
//!
//! Runs once per connection, strictly in order:
//!
//! ```text
//! Init -> SentClientMagic -> ReceivedServerMagic -> ReceivedServerVersion
//!      -> SentClientVersion -> SentLegacyFields -> ReceivedPeerVersionString
//!      -> ReceivedTrustStatus -> ReceivedStderrMarker -> Established
//! ```
//!
//! Any failure aborts the handshake and is reported as [`Error::Handshake`];
//! there is no resuming or version negotiation.

use std::io::{Read, Write};

use tracing::debug;

use crate::codec::{WireRead, WireWrite};
use crate::error::{Context, Error};
use crate::protocol::{CLIENT_MAGIC, ProtocolVersion, SERVER_MAGIC, TrustStatus, marker};

/// Handshake progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Init,
    SentClientMagic,
    ReceivedServerMagic,
    ReceivedServerVersion,
    SentClientVersion,
    SentLegacyFields,
    ReceivedPeerVersionString,
    ReceivedTrustStatus,
    ReceivedStderrMarker,
    Established,
}

/// What the daemon told us about itself
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    /// Negotiated protocol version (always equal to ours)
    pub protocol: ProtocolVersion,
    /// Human-readable Nix version of the daemon, e.g. `"2.18.0"`
    pub nix_version: String,
    pub trust: TrustStatus,
}

pub struct Handshake {
    state: HandshakeState,
    peer: PeerInfo,
}

impl Handshake {
    pub fn new() -> Self {
        Self {
            state: HandshakeState::Init,
            peer: PeerInfo {
                protocol: ProtocolVersion::own(),
                nix_version: String::new(),
                trust: TrustStatus::Unspecified,
            },
        }
    }

    /// Drive the handshake to completion
    pub fn run<R, W>(reader: &mut R, writer: &mut W) -> Result<PeerInfo, Error>
    where
        R: Read + ?Sized,
        W: Write + ?Sized,
    {
        let mut handshake = Self::new();
        while handshake.step(reader, writer)? != HandshakeState::Established {}
        Ok(handshake.peer)
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Perform the single transition out of the current state
    pub fn step<R, W>(&mut self, reader: &mut R, writer: &mut W) -> Result<HandshakeState, Error>
    where
        R: Read + ?Sized,
        W: Write + ?Sized,
    {
        let next = self
            .transition(reader, writer)
            .map_err(|e| Error::Handshake(Box::new(e)))?;
        debug!(from = ?self.state, to = ?next, "Handshake step");
        self.state = next;
        Ok(next)
    }

    fn transition<R, W>(&mut self, reader: &mut R, writer: &mut W) -> Result<HandshakeState, Error>
    where
        R: Read + ?Sized,
        W: Write + ?Sized,
    {
        use HandshakeState::*;

        let next = match self.state {
            Init => {
                writer.write_int(CLIENT_MAGIC).context("writing client magic")?;
                writer.flush().context("writing client magic")?;
                SentClientMagic
            }
            SentClientMagic => {
                let got = reader.read_int().context("reading server magic")?;
                if got != SERVER_MAGIC {
                    return Err(Error::MagicMismatch {
                        got,
                        want: SERVER_MAGIC,
                    });
                }
                ReceivedServerMagic
            }
            ReceivedServerMagic => {
                let server = reader.read_int().context("reading server protocol version")?;
                let client = ProtocolVersion::own();
                if server != client.to_word() {
                    return Err(Error::VersionMismatch { server, client });
                }
                self.peer.protocol = client;
                ReceivedServerVersion
            }
            ReceivedServerVersion => {
                writer
                    .write_int(ProtocolVersion::own().to_word())
                    .context("writing client protocol version")?;
                SentClientVersion
            }
            SentClientVersion => {
                // Obsolete CPU affinity and reserve-space fields
                writer.write_int(0).context("writing cpu affinity")?;
                writer.write_int(0).context("writing reserved field")?;
                writer.flush().context("writing reserved field")?;
                SentLegacyFields
            }
            SentLegacyFields => {
                self.peer.nix_version = reader.read_string().context("reading daemon version")?;
                ReceivedPeerVersionString
            }
            ReceivedPeerVersionString => {
                let raw = reader.read_int().context("reading trust status")?;
                let trust = TrustStatus::try_from(raw).context("reading trust status")?;
                if trust == TrustStatus::Untrusted {
                    return Err(Error::Untrusted);
                }
                self.peer.trust = trust;
                ReceivedTrustStatus
            }
            ReceivedTrustStatus => {
                let got = reader.read_int().context("reading stderr marker")?;
                if got != marker::LAST {
                    return Err(Error::UnexpectedMarker {
                        got,
                        want: marker::LAST,
                    });
                }
                ReceivedStderrMarker
            }
            ReceivedStderrMarker | Established => Established,
        };
        Ok(next)
    }
}

impl Default for Handshake {
    fn default() -> Self {
        Self::new()
    }
}
