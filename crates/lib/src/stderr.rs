//! Stderr demultiplexer
//!
//! After every request the daemon interleaves log frames with the reply. A
//! run is a sequence of `marker || body` frames ending either at
//! `STDERR_LAST` or at the first word that is not a marker, which is the
//! start of the reply. That word belongs to the caller and is handed back as
//! leftover.
//!
//! Two strategies are available, see [`StderrMode`].
//!
//! A failed run is reported as [`Error::Stderr`]. The stream can only be
//! reused if the run was `resumable`: compat mode captured through a
//! `STDERR_LAST` and the failure was in decoding the captured bytes, so the
//! reader already sits at the start of the reply. Strict mode stops in the
//! middle of a frame, so its failures never are.

use std::fmt;
use std::io::{Read, Write};

use serde::Deserialize;
use tracing::{debug, warn};

use crate::codec::{
    Decode, Encode, WORD, WireRead, encode_int, put_int, put_string, read_word_or_eof,
};
use crate::error::{Context, Error, ErrorKind};
use crate::log::{ActivityResult, ActivityStart, ErrorReport};
use crate::protocol::{Marker, marker};

/// How a stderr run is read off the stream
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StderrMode {
    /// Capture whole words up to the first `STDERR_LAST`, then decode the
    /// captured bytes. A body word that happens to equal `STDERR_LAST` ends
    /// the capture early.
    #[default]
    Compat,
    /// Decode each frame straight from the stream, skipping bodies by their
    /// declared lengths.
    Strict,
}

/// A decoded log frame
#[derive(Debug, Clone, PartialEq)]
pub enum StderrEvent {
    Write(String),
    Next(String),
    Error(ErrorReport),
    StartActivity(ActivityStart),
    StopActivity(u64),
    Result(ActivityResult),
}

impl StderrEvent {
    pub fn marker(&self) -> Marker {
        match self {
            StderrEvent::Write(_) => Marker::Write,
            StderrEvent::Next(_) => Marker::Next,
            StderrEvent::Error(_) => Marker::Error,
            StderrEvent::StartActivity(_) => Marker::StartActivity,
            StderrEvent::StopActivity(_) => Marker::StopActivity,
            StderrEvent::Result(_) => Marker::Result,
        }
    }

    /// Read the body that follows `marker`. `None` for `STDERR_LAST`.
    pub fn read_body<R: Read + ?Sized>(marker: Marker, reader: &mut R) -> Result<Option<Self>, Error> {
        let event = match marker {
            Marker::Last => return Ok(None),
            Marker::Write => StderrEvent::Write(reader.read_string()?),
            Marker::Next => StderrEvent::Next(reader.read_string()?),
            Marker::Error => StderrEvent::Error(ErrorReport::decode_from(reader)?),
            Marker::StartActivity => StderrEvent::StartActivity(ActivityStart::decode_from(reader)?),
            Marker::StopActivity => StderrEvent::StopActivity(reader.read_int()?),
            Marker::Result => StderrEvent::Result(ActivityResult::decode_from(reader)?),
        };
        Ok(Some(event))
    }
}

impl Encode for StderrEvent {
    fn encode_into(&self, out: &mut Vec<u8>) {
        self.marker().encode_into(out);
        match self {
            StderrEvent::Write(s) | StderrEvent::Next(s) => put_string(out, s),
            StderrEvent::Error(report) => report.encode_into(out),
            StderrEvent::StartActivity(start) => start.encode_into(out),
            StderrEvent::StopActivity(id) => put_int(out, *id),
            StderrEvent::Result(result) => result.encode_into(out),
        }
    }
}

impl fmt::Display for StderrEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StderrEvent::Write(s) | StderrEvent::Next(s) => f.write_str(s.trim_end_matches('\n')),
            StderrEvent::Error(report) => write!(f, "{report}"),
            StderrEvent::StartActivity(start) => write!(f, "{start}"),
            StderrEvent::StopActivity(id) => write!(f, "activity {id} stopped"),
            StderrEvent::Result(result) => write!(f, "{result}"),
        }
    }
}

/// One step of a stderr run
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Event(StderrEvent),
    Last,
    /// A non-marker word: the first word of the reply
    Reply([u8; WORD]),
}

impl Frame {
    pub fn read<R: Read + ?Sized>(reader: &mut R) -> Result<Self, Error> {
        let word = reader.read_word().context("reading stderr marker")?;
        let Some(marker) = Marker::from_word(u64::from_le_bytes(word)) else {
            return Ok(Frame::Reply(word));
        };
        match StderrEvent::read_body(marker, reader).context(format!("reading {marker} body"))? {
            Some(event) => Ok(Frame::Event(event)),
            None => Ok(Frame::Last),
        }
    }
}

/// Outcome of a completed stderr run
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Drained {
    /// Events written to the sink
    pub events: usize,
    /// Reply bytes consumed from the stream while looking for a marker
    pub leftover: Vec<u8>,
}

/// Reads one stderr run, rendering each event as a line on `sink`
pub struct Demultiplexer<'a, L: Write + ?Sized> {
    sink: &'a mut L,
    mode: StderrMode,
    emitted: usize,
}

impl<'a, L: Write + ?Sized> Demultiplexer<'a, L> {
    pub fn new(sink: &'a mut L, mode: StderrMode) -> Self {
        Self {
            sink,
            mode,
            emitted: 0,
        }
    }

    /// Consume frames until the run ends.
    ///
    /// On failure the returned [`Error::Stderr`] records how many events were
    /// emitted and, in compat mode, the captured bytes that were not decoded.
    pub fn run<R: Read + ?Sized>(mut self, reader: &mut R) -> Result<Drained, Error> {
        let drained = match self.mode {
            StderrMode::Compat => {
                let captured =
                    capture_until_last(reader).map_err(|e| self.partial(e, &[], false))?;
                let ended_at_last = captured.ends_with(&encode_int(marker::LAST));
                self.replay(&captured, ended_at_last)?
            }
            StderrMode::Strict => self.stream(reader)?,
        };
        debug!(
            events = drained.events,
            leftover = drained.leftover.len(),
            "Stderr run finished"
        );
        Ok(drained)
    }

    fn replay(&mut self, captured: &[u8], ended_at_last: bool) -> Result<Drained, Error> {
        let mut rest = captured;
        loop {
            let frame_start = rest;
            match Frame::read(&mut rest) {
                Ok(Frame::Last) => return Ok(self.finish(Vec::new())),
                Ok(Frame::Reply(_)) => return Ok(self.finish(frame_start.to_vec())),
                Ok(Frame::Event(event)) => {
                    if let Err(e) = self.emit(&event) {
                        return Err(self.partial(e, rest, ended_at_last));
                    }
                }
                Err(e) => {
                    // Running out of captured bytes means the stream ended or
                    // the capture stopped at a STDERR_LAST inside a body
                    let resumable = ended_at_last && e.kind() != ErrorKind::Truncated;
                    return Err(self.partial(e, frame_start, resumable));
                }
            }
        }
    }

    fn stream<R: Read + ?Sized>(&mut self, reader: &mut R) -> Result<Drained, Error> {
        loop {
            match Frame::read(reader) {
                Ok(Frame::Last) => return Ok(self.finish(Vec::new())),
                Ok(Frame::Reply(word)) => return Ok(self.finish(word.to_vec())),
                Ok(Frame::Event(event)) => {
                    if let Err(e) = self.emit(&event) {
                        return Err(self.partial(e, &[], false));
                    }
                }
                Err(e) => return Err(self.partial(e, &[], false)),
            }
        }
    }

    fn emit(&mut self, event: &StderrEvent) -> Result<(), Error> {
        debug!(marker = %event.marker(), "Stderr event");
        writeln!(self.sink, "{event}").context("writing log line")?;
        self.emitted += 1;
        Ok(())
    }

    fn finish(&self, leftover: Vec<u8>) -> Drained {
        Drained {
            events: self.emitted,
            leftover,
        }
    }

    fn partial(&self, source: Error, undecoded: &[u8], resumable: bool) -> Error {
        warn!(
            emitted = self.emitted,
            resumable, "Stderr run interrupted: {source}"
        );
        Error::Stderr {
            emitted: self.emitted,
            undecoded: undecoded.to_vec(),
            resumable,
            source: Box::new(source),
        }
    }
}

/// Collect whole words up to and including the first `STDERR_LAST`, or to
/// a clean end of stream.
pub fn capture_until_last<R: Read + ?Sized>(reader: &mut R) -> Result<Vec<u8>, Error> {
    let mut captured = Vec::new();
    while let Some(word) = read_word_or_eof(reader).context("capturing stderr")? {
        captured.extend_from_slice(&word);
        if u64::from_le_bytes(word) == marker::LAST {
            break;
        }
    }
    Ok(captured)
}

/// Drain one stderr run from `reader`
pub fn drain<R, L>(reader: &mut R, sink: &mut L, mode: StderrMode) -> Result<Drained, Error>
where
    R: Read + ?Sized,
    L: Write + ?Sized,
{
    Demultiplexer::new(sink, mode).run(reader)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{decode_bool, encode_buf, encode_int};
    use crate::error::ErrorKind;
    use crate::log::{LoggerField, LoggerFields, TraceEntry};
    use std::io::Cursor;

    const MODES: [StderrMode; 2] = [StderrMode::Compat, StderrMode::Strict];

    fn last() -> Vec<u8> {
        Marker::Last.encode()
    }

    fn run(raw: Vec<u8>, mode: StderrMode) -> (Result<Drained, Error>, String, Cursor<Vec<u8>>) {
        let mut reader = Cursor::new(raw);
        let mut sink: Vec<u8> = Vec::new();
        let res = drain(&mut reader, &mut sink, mode);
        (res, String::from_utf8(sink).unwrap(), reader)
    }

    fn all_events() -> Vec<StderrEvent> {
        vec![
            StderrEvent::Write("building\n".into()),
            StderrEvent::Next("copying path\n".into()),
            StderrEvent::StartActivity(ActivityStart {
                id: 12,
                level: 3,
                kind: 105,
                message: "building '/nix/store/abc-hello.drv'".into(),
                fields: LoggerFields::new(vec![
                    LoggerField::String("/nix/store/abc-hello.drv".into()),
                    LoggerField::Int(1),
                ]),
                parent: 0,
            }),
            StderrEvent::Result(ActivityResult {
                id: 12,
                kind: 101,
                fields: LoggerFields::new(vec![LoggerField::String("log line".into())]),
            }),
            StderrEvent::StopActivity(12),
            StderrEvent::Error(ErrorReport {
                kind: "Error".into(),
                level: 0,
                name: "Error".into(),
                message: "builder failed".into(),
                has_position: 0,
                traces: vec![TraceEntry {
                    position: 0,
                    message: "while building".into(),
                }],
            }),
        ]
    }

    #[test]
    fn single_write_then_last() {
        for mode in MODES {
            let mut raw = StderrEvent::Write("hello".into()).encode();
            raw.extend(last());
            let (res, log, _) = run(raw, mode);
            let drained = res.unwrap();
            assert_eq!(drained.events, 1);
            assert!(drained.leftover.is_empty());
            assert_eq!(log, "hello\n");
        }
    }

    #[test]
    fn reply_word_is_handed_back() {
        for mode in MODES {
            let mut raw = StderrEvent::Write("hi".into()).encode();
            raw.extend_from_slice(&encode_int(1));
            let (res, log, _) = run(raw, mode);
            let drained = res.unwrap();
            assert_eq!(drained.events, 1);
            assert_eq!(drained.leftover, encode_int(1));
            assert!(decode_bool(&drained.leftover).unwrap());
            assert_eq!(log, "hi\n");
        }
    }

    #[test]
    fn reply_after_last_stays_on_stream() {
        for mode in MODES {
            let mut raw = last();
            raw.extend_from_slice(&encode_int(1));
            let (res, log, mut reader) = run(raw, mode);
            let drained = res.unwrap();
            assert_eq!(drained, Drained::default());
            assert!(log.is_empty());
            assert!(reader.read_bool().unwrap());
        }
    }

    #[test]
    fn every_event_kind() {
        for mode in MODES {
            let mut raw = Vec::new();
            for event in all_events() {
                event.encode_into(&mut raw);
            }
            raw.extend(last());

            let (res, log, _) = run(raw, mode);
            assert_eq!(res.unwrap().events, 6);
            let lines: Vec<&str> = log.lines().collect();
            assert_eq!(lines[0], "building");
            assert_eq!(lines[1], "copying path");
            assert!(lines[2].starts_with("activity 12 started"));
            assert!(lines[3].starts_with("activity 12 result (type 101)"));
            assert_eq!(lines[4], "activity 12 stopped");
            assert!(lines[5].contains("builder failed"));
            assert_eq!(lines[6], "  trace: while building");
        }
    }

    #[test]
    fn frames_decode_back_to_events() {
        let mut raw = Vec::new();
        for event in all_events() {
            event.encode_into(&mut raw);
        }
        raw.extend(last());

        let mut reader = &raw[..];
        for expected in all_events() {
            assert_eq!(Frame::read(&mut reader).unwrap(), Frame::Event(expected));
        }
        assert_eq!(Frame::read(&mut reader).unwrap(), Frame::Last);
        assert!(reader.is_empty());
    }

    #[test]
    fn bad_body_reports_partial_progress() {
        let mut raw = StderrEvent::Write("one".into()).encode();
        let bad_start = raw.len();
        raw.extend(Marker::Error.encode());
        raw.extend(encode_buf(&[0xff, 0xfe]));
        raw.extend(last());

        raw.extend_from_slice(&encode_int(1));

        let (res, log, mut reader) = run(raw.clone(), StderrMode::Compat);
        let err = res.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidUtf8);
        assert!(matches!(err, Error::Stderr { emitted: 1, resumable: true, .. }));
        assert_eq!(err.undecoded(), Some(&raw[bad_start..raw.len() - WORD]));
        assert_eq!(err.contexts(), vec!["reading STDERR_ERROR body", "reading kind"]);
        assert!(!err.is_fatal());
        assert_eq!(log, "one\n");
        // Capture went through STDERR_LAST, so the reply is next on the stream
        assert!(reader.read_bool().unwrap());
    }

    #[test]
    fn bad_body_in_strict_mode_is_fatal() {
        let mut raw = StderrEvent::Write("one".into()).encode();
        raw.extend(Marker::Error.encode());
        raw.extend(encode_buf(&[0xff, 0xfe]));
        raw.extend(last());
        raw.extend_from_slice(&encode_int(1));

        let (res, log, _) = run(raw, StderrMode::Strict);
        let err = res.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidUtf8);
        assert!(matches!(err, Error::Stderr { emitted: 1, resumable: false, .. }));
        assert_eq!(err.undecoded(), None);
        assert!(err.is_fatal());
        assert_eq!(log, "one\n");
    }

    #[test]
    fn end_of_stream_without_last() {
        for mode in MODES {
            let raw = StderrEvent::Write("a".into()).encode();
            let (res, log, _) = run(raw, mode);
            let err = res.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Truncated);
            assert!(matches!(err, Error::Stderr { emitted: 1, .. }));
            assert_eq!(err.undecoded(), None);
            assert!(err.is_fatal());
            assert_eq!(log, "a\n");
        }
    }

    #[test]
    fn empty_stream() {
        for mode in MODES {
            let (res, _, _) = run(Vec::new(), mode);
            let err = res.unwrap_err();
            assert!(matches!(
                err,
                Error::Stderr {
                    emitted: 0,
                    ref source,
                    ..
                } if source.kind() == ErrorKind::Truncated
            ));
            assert!(err.is_fatal());
        }
    }

    #[test]
    fn partial_word_at_end_of_capture() {
        let mut raw = StderrEvent::Write("a".into()).encode();
        raw.extend_from_slice(&[1, 2, 3]);
        let (res, log, _) = run(raw, StderrMode::Compat);
        let err = res.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Truncated);
        assert_eq!(err.contexts(), vec!["capturing stderr"]);
        assert!(matches!(err, Error::Stderr { emitted: 0, .. }));
        assert!(err.is_fatal());
        assert!(log.is_empty());
    }

    #[test]
    fn last_inside_body_stops_compat_early() {
        // A write payload whose aligned bytes spell STDERR_LAST
        let payload = String::from_utf8(encode_int(marker::LAST).to_vec()).unwrap();
        let mut raw = StderrEvent::Write(payload).encode();
        raw.extend(last());
        raw.extend_from_slice(&encode_int(1));

        let (res, _, _) = run(raw.clone(), StderrMode::Compat);
        let err = res.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Truncated);
        assert!(matches!(err, Error::Stderr { emitted: 1, .. }));
        assert!(err.is_fatal());

        let (res, _, mut reader) = run(raw, StderrMode::Strict);
        assert_eq!(res.unwrap().events, 1);
        assert!(reader.read_bool().unwrap());
    }

    #[test]
    fn failing_sink() {
        struct Closed;
        impl Write for Closed {
            fn write(&mut self, _: &[u8]) -> std::io::Result<usize> {
                Err(std::io::ErrorKind::BrokenPipe.into())
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        let mut raw = StderrEvent::Write("x".into()).encode();
        raw.extend(last());
        let err = drain(&mut &raw[..], &mut Closed, StderrMode::Strict).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport);
        assert!(matches!(err, Error::Stderr { emitted: 0, .. }));
    }

    #[test]
    fn mode_from_config_string() {
        #[derive(Deserialize)]
        struct Wrap {
            mode: StderrMode,
        }
        let w: Wrap = toml::from_str("mode = \"strict\"").unwrap();
        assert_eq!(w.mode, StderrMode::Strict);
        assert_eq!(StderrMode::default(), StderrMode::Compat);
    }
}
