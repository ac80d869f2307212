//! Error type shared by every layer of the protocol engine.
//!
//! Failures are a flat set of kinds plus wrapping variants. [`Error::Context`]
//! links record which field or stage failed, [`Error::Handshake`] marks a
//! connection that was never established, and [`Error::Stderr`] carries the
//! partial progress of an interrupted stderr run. Callers branch on
//! [`Error::kind`], which looks through all of them.

use std::borrow::Cow;
use std::io;
use std::string::FromUtf8Error;

use thiserror::Error;

use crate::operation::Opcode;
use crate::protocol::ProtocolVersion;

/// Errors from encoding, decoding, handshaking or transport
#[derive(Debug, Error)]
pub enum Error {
    #[error("truncated input: needed {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },
    #[error("invalid UTF-8 in string field: {0}")]
    InvalidUtf8(#[from] FromUtf8Error),
    #[error("unknown {what} tag: {tag:#x}")]
    UnknownTag { what: &'static str, tag: u64 },
    #[error("unexpected server magic: got {got:#x}, want {want:#x}")]
    MagicMismatch { got: u64, want: u64 },
    #[error(
        "protocol version mismatch: server is {}, client is {client}",
        describe_version(.server)
    )]
    VersionMismatch {
        /// Version word exactly as the server sent it
        server: u64,
        client: ProtocolVersion,
    },
    #[error("connection is untrusted")]
    Untrusted,
    #[error("unexpected marker: got {got:#x}, want {want:#x}")]
    UnexpectedMarker { got: u64, want: u64 },
    #[error("no body type registered for operation {0}")]
    UnsupportedOperation(Opcode),
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),
    #[error("{context}: {source}")]
    Context {
        context: Cow<'static, str>,
        source: Box<Error>,
    },
    #[error("handshake failed: {0}")]
    Handshake(Box<Error>),
    #[error("stderr processing stopped after {emitted} events: {source}")]
    Stderr {
        emitted: usize,
        /// Captured frames from the failing one onward. Never part of the reply.
        undecoded: Vec<u8>,
        /// Whether the stream sits at the start of the reply
        resumable: bool,
        source: Box<Error>,
    },
}

/// Coarse classification of an [`Error`], independent of context links
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Truncated,
    InvalidUtf8,
    UnknownTag,
    MagicMismatch,
    VersionMismatch,
    Untrusted,
    UnexpectedMarker,
    UnsupportedOperation,
    Transport,
}

impl Error {
    /// Kind of the innermost error, skipping context and stderr wrappers
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Truncated { .. } => ErrorKind::Truncated,
            Error::InvalidUtf8(_) => ErrorKind::InvalidUtf8,
            Error::UnknownTag { .. } => ErrorKind::UnknownTag,
            Error::MagicMismatch { .. } => ErrorKind::MagicMismatch,
            Error::VersionMismatch { .. } => ErrorKind::VersionMismatch,
            Error::Untrusted => ErrorKind::Untrusted,
            Error::UnexpectedMarker { .. } => ErrorKind::UnexpectedMarker,
            Error::UnsupportedOperation(_) => ErrorKind::UnsupportedOperation,
            Error::Transport(_) => ErrorKind::Transport,
            Error::Context { source, .. } | Error::Stderr { source, .. } => source.kind(),
            Error::Handshake(source) => source.kind(),
        }
    }

    /// Whether the connection can no longer be used after this error.
    ///
    /// Any handshake failure, transport error, or stderr run that left the
    /// stream away from a reply boundary is fatal. Other decode errors are
    /// scoped to the call that produced them.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::Handshake(_) | Error::Stderr { resumable: false, .. } => true,
            Error::Context { source, .. } | Error::Stderr { source, .. } => source.is_fatal(),
            _ => matches!(
                self.kind(),
                ErrorKind::MagicMismatch
                    | ErrorKind::VersionMismatch
                    | ErrorKind::Untrusted
                    | ErrorKind::UnexpectedMarker
                    | ErrorKind::Transport
            ),
        }
    }

    /// Captured stderr bytes an interrupted run did not decode, if any
    pub fn undecoded(&self) -> Option<&[u8]> {
        match self {
            Error::Stderr { undecoded, .. } if !undecoded.is_empty() => Some(undecoded.as_slice()),
            Error::Stderr { source, .. }
            | Error::Context { source, .. }
            | Error::Handshake(source) => source.undecoded(),
            _ => None,
        }
    }

    /// Context messages from outermost to innermost
    pub fn contexts(&self) -> Vec<&str> {
        let mut out = Vec::new();
        let mut cur = self;
        loop {
            match cur {
                Error::Context { context, source } => {
                    out.push(context.as_ref());
                    cur = source;
                }
                Error::Stderr { source, .. } | Error::Handshake(source) => cur = source,
                _ => return out,
            }
        }
    }

    /// Wrap this error in a context link
    pub fn with_context(self, context: impl Into<Cow<'static, str>>) -> Self {
        Error::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    pub(crate) fn truncated(needed: usize, available: usize) -> Self {
        Error::Truncated { needed, available }
    }
}

/// Render a version word as `major.minor` when it packs cleanly, raw otherwise
fn describe_version(word: &u64) -> String {
    match ProtocolVersion::from_exact_word(*word) {
        Some(v) => v.to_string(),
        None => format!("{word:#x}"),
    }
}

/// Attach a context link to the error of a `Result`
pub trait Context<T> {
    fn context(self, context: impl Into<Cow<'static, str>>) -> Result<T, Error>;
}

impl<T, E: Into<Error>> Context<T> for Result<T, E> {
    fn context(self, context: impl Into<Cow<'static, str>>) -> Result<T, Error> {
        self.map_err(|e| e.into().with_context(context))
    }
}
