use std::collections::VecDeque;
use std::io::{self, Read, Write};

use serde::Deserialize;
use tracing::{debug, info};

use crate::codec::{Decode, Encode, WireRead, WireWrite};
use crate::error::{Context, Error};
use crate::handshake::{Handshake, PeerInfo};
use crate::operation::{ClientSettings, Operation};
use crate::stderr::{Drained, StderrMode, drain};

/// Knobs for a [`Connection`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ConnectionOptions {
    pub stderr_mode: StderrMode,
}

/// Reader that replays bytes pushed back by the demultiplexer before
/// reading further from the stream
struct Rewind<R> {
    pending: VecDeque<u8>,
    inner: R,
}

impl<R> Rewind<R> {
    fn new(inner: R) -> Self {
        Self {
            pending: VecDeque::new(),
            inner,
        }
    }

    fn unread(&mut self, bytes: &[u8]) {
        for &b in bytes.iter().rev() {
            self.pending.push_front(b);
        }
    }
}

impl<R: Read> Read for Rewind<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pending.is_empty() {
            self.inner.read(buf)
        } else {
            self.pending.read(buf)
        }
    }
}

/// A handshaken connection to a daemon.
///
/// `R` and `W` are the two halves of the transport, `L` receives one
/// rendered line per log event. Operations must be issued one at a time.
pub struct Connection<R, W, L> {
    reader: Rewind<R>,
    writer: W,
    log: L,
    options: ConnectionOptions,
    peer: PeerInfo,
}

impl<R: Read, W: Write, L: Write> Connection<R, W, L> {
    /// Perform the handshake with default options
    pub fn new(reader: R, writer: W, log: L) -> Result<Self, Error> {
        Self::with_options(reader, writer, log, ConnectionOptions::default())
    }

    pub fn with_options(
        reader: R,
        mut writer: W,
        log: L,
        options: ConnectionOptions,
    ) -> Result<Self, Error> {
        let mut reader = Rewind::new(reader);
        let peer = Handshake::run(&mut reader, &mut writer).context("performing handshake")?;
        info!(
            version = %peer.nix_version,
            protocol = %peer.protocol,
            trust = %peer.trust,
            "Connected to daemon"
        );
        Ok(Self {
            reader,
            writer,
            log,
            options,
            peer,
        })
    }

    /// Version string the daemon announced during the handshake
    pub fn peer_version(&self) -> &str {
        &self.peer.nix_version
    }

    pub fn peer(&self) -> &PeerInfo {
        &self.peer
    }

    pub fn options(&self) -> &ConnectionOptions {
        &self.options
    }

    /// Send a request and flush it
    pub fn write_operation(&mut self, op: &Operation) -> Result<(), Error> {
        debug!(opcode = %op.opcode(), "Sending operation");
        self.writer
            .write_value(op)
            .context(format!("writing {}", op.opcode().name()))?;
        self.writer.flush().context("flushing request")?;
        Ok(())
    }

    /// Write an encoded value without flushing
    pub fn write_framed<T: Encode + ?Sized>(&mut self, value: &T) -> Result<(), Error> {
        self.writer.write_value(value)
    }

    pub fn flush(&mut self) -> Result<(), Error> {
        Ok(self.writer.flush()?)
    }

    pub fn read_int(&mut self) -> Result<u64, Error> {
        self.reader.read_int()
    }

    pub fn read_bool(&mut self) -> Result<bool, Error> {
        self.reader.read_bool()
    }

    pub fn read_bytes(&mut self) -> Result<Vec<u8>, Error> {
        self.reader.read_bytes()
    }

    pub fn read_string(&mut self) -> Result<String, Error> {
        self.reader.read_string()
    }

    /// Decode one value of a reply
    pub fn read_value<T: Decode>(&mut self) -> Result<T, Error> {
        T::decode_from(&mut self.reader)
    }

    /// Drain the log events that precede a reply.
    ///
    /// Reply bytes the demultiplexer consumed are pushed back, so the reply is
    /// read with the ordinary `read_*` helpers afterwards. A failed run pushes
    /// nothing back: undecoded bytes are log frames, not reply. If the error
    /// is not [fatal](Error::is_fatal) the reply is next on the stream.
    pub fn process_stderr(&mut self) -> Result<Drained, Error> {
        let drained = drain(&mut self.reader, &mut self.log, self.options.stderr_mode)?;
        self.reader.unread(&drained.leftover);
        Ok(drained)
    }

    /// Ask the daemon whether `path` is a valid store path
    pub fn is_valid_path(&mut self, path: &str) -> Result<bool, Error> {
        self.write_operation(&Operation::IsValidPath { path: path.into() })?;
        self.process_stderr().context("checking path validity")?;
        self.read_bool().context("reading path validity")
    }

    /// Push client settings to the daemon
    pub fn set_options(&mut self, settings: &ClientSettings) -> Result<(), Error> {
        self.write_operation(&Operation::SetOptions(settings.clone()))?;
        self.process_stderr().context("setting options")?;
        Ok(())
    }

    /// Tear down the connection, returning the transport and log sink.
    /// Bytes pushed back but never read are dropped.
    pub fn into_parts(self) -> (R, W, L) {
        (self.reader.inner, self.writer, self.log)
    }
}
