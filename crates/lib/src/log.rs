//! Structured records carried by stderr events
//!
//! Records are fixed sequences of primitives. Lists inside them carry an
//! explicit count ahead of their entries; only the outer event stream is
//! terminated by a marker.

use std::fmt;
use std::io::Read;

use serde::{Deserialize, Serialize};

use crate::codec::{Decode, Encode, WireRead, put_int, put_string};
use crate::error::{Context, Error};

/// Daemon log levels, shared by error reports, activities and client settings
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verbosity {
    #[default]
    Error,
    Warn,
    Notice,
    Info,
    Talkative,
    Chatty,
    Debug,
    Vomit,
}

impl Verbosity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verbosity::Error => "error",
            Verbosity::Warn => "warn",
            Verbosity::Notice => "notice",
            Verbosity::Info => "info",
            Verbosity::Talkative => "talkative",
            Verbosity::Chatty => "chatty",
            Verbosity::Debug => "debug",
            Verbosity::Vomit => "vomit",
        }
    }
}

impl From<Verbosity> for u64 {
    fn from(v: Verbosity) -> u64 {
        v as u64
    }
}

impl TryFrom<u64> for Verbosity {
    type Error = Error;

    fn try_from(value: u64) -> Result<Self, Error> {
        Ok(match value {
            0 => Verbosity::Error,
            1 => Verbosity::Warn,
            2 => Verbosity::Notice,
            3 => Verbosity::Info,
            4 => Verbosity::Talkative,
            5 => Verbosity::Chatty,
            6 => Verbosity::Debug,
            7 => Verbosity::Vomit,
            tag => {
                return Err(Error::UnknownTag {
                    what: "verbosity",
                    tag,
                });
            }
        })
    }
}

impl Encode for Verbosity {
    fn encode_into(&self, out: &mut Vec<u8>) {
        put_int(out, u64::from(*self));
    }
}

impl Decode for Verbosity {
    fn decode_from<R: Read + ?Sized>(reader: &mut R) -> Result<Self, Error> {
        Verbosity::try_from(reader.read_int()?)
    }
}

impl fmt::Display for Verbosity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Render a raw level word, by name when it is a known verbosity
struct Level(u64);

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match Verbosity::try_from(self.0) {
            Ok(v) => write!(f, "{v}"),
            Err(_) => write!(f, "level {}", self.0),
        }
    }
}

const FIELD_INT: u64 = 0;
const FIELD_STRING: u64 = 1;

/// A typed field attached to an activity or result
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoggerField {
    Int(u64),
    String(String),
}

impl Encode for LoggerField {
    fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            LoggerField::Int(v) => {
                put_int(out, FIELD_INT);
                put_int(out, *v);
            }
            LoggerField::String(s) => {
                put_int(out, FIELD_STRING);
                put_string(out, s);
            }
        }
    }
}

impl Decode for LoggerField {
    fn decode_from<R: Read + ?Sized>(reader: &mut R) -> Result<Self, Error> {
        match reader.read_int().context("reading field tag")? {
            FIELD_INT => Ok(LoggerField::Int(reader.read_int()?)),
            FIELD_STRING => Ok(LoggerField::String(reader.read_string()?)),
            tag => Err(Error::UnknownTag {
                what: "logger field",
                tag,
            }),
        }
    }
}

impl fmt::Display for LoggerField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoggerField::Int(v) => write!(f, "{v}"),
            LoggerField::String(s) => write!(f, "{s:?}"),
        }
    }
}

/// An ordered list of logger fields
///
/// Inside activity records the list is count-prefixed ([`Encode`]/[`Decode`]).
/// [`LoggerFields::decode_window`] reads the bare form, where the enclosing
/// record bounds the bytes and fields are taken until they run out.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoggerFields(pub Vec<LoggerField>);

impl LoggerFields {
    pub fn new(fields: Vec<LoggerField>) -> Self {
        Self(fields)
    }

    pub fn iter(&self) -> impl Iterator<Item = &LoggerField> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Encode the fields back to back, without a count
    pub fn encode_window(&self, out: &mut Vec<u8>) {
        for field in &self.0 {
            field.encode_into(out);
        }
    }

    /// Decode fields greedily until `window` is exhausted
    pub fn decode_window(window: &[u8]) -> Result<Self, Error> {
        let mut rest = window;
        let mut fields = Vec::new();
        while !rest.is_empty() {
            let field = LoggerField::decode_from(&mut rest)
                .context(format!("reading field {}", fields.len()))?;
            fields.push(field);
        }
        Ok(Self(fields))
    }
}

impl Encode for LoggerFields {
    fn encode_into(&self, out: &mut Vec<u8>) {
        put_int(out, self.0.len() as u64);
        self.encode_window(out);
    }
}

impl Decode for LoggerFields {
    fn decode_from<R: Read + ?Sized>(reader: &mut R) -> Result<Self, Error> {
        let count = reader.read_int().context("reading field count")?;
        let mut fields = Vec::new();
        for i in 0..count {
            fields.push(LoggerField::decode_from(reader).context(format!("reading field {i}"))?);
        }
        Ok(Self(fields))
    }
}

impl fmt::Display for LoggerFields {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, field) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{field}")?;
        }
        f.write_str("]")
    }
}

/// One frame of an error's backtrace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceEntry {
    pub position: u64,
    pub message: String,
}

impl Encode for TraceEntry {
    fn encode_into(&self, out: &mut Vec<u8>) {
        put_int(out, self.position);
        put_string(out, &self.message);
    }
}

impl Decode for TraceEntry {
    fn decode_from<R: Read + ?Sized>(reader: &mut R) -> Result<Self, Error> {
        Ok(Self {
            position: reader.read_int().context("reading position")?,
            message: reader.read_string().context("reading message")?,
        })
    }
}

/// An error reported by the daemon through `STDERR_ERROR`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorReport {
    /// Error type, normally `"Error"`
    pub kind: String,
    pub level: u64,
    pub name: String,
    pub message: String,
    /// Always zero from current daemons
    pub has_position: u64,
    pub traces: Vec<TraceEntry>,
}

impl Encode for ErrorReport {
    fn encode_into(&self, out: &mut Vec<u8>) {
        put_string(out, &self.kind);
        put_int(out, self.level);
        put_string(out, &self.name);
        put_string(out, &self.message);
        put_int(out, self.has_position);
        put_int(out, self.traces.len() as u64);
        for trace in &self.traces {
            trace.encode_into(out);
        }
    }
}

impl Decode for ErrorReport {
    fn decode_from<R: Read + ?Sized>(reader: &mut R) -> Result<Self, Error> {
        let kind = reader.read_string().context("reading kind")?;
        let level = reader.read_int().context("reading level")?;
        let name = reader.read_string().context("reading name")?;
        let message = reader.read_string().context("reading message")?;
        let has_position = reader.read_int().context("reading position flag")?;
        let count = reader.read_int().context("reading trace count")?;

        let mut traces = Vec::new();
        for i in 0..count {
            traces.push(TraceEntry::decode_from(reader).context(format!("reading trace {i}"))?);
        }

        Ok(Self {
            kind,
            level,
            name,
            message,
            has_position,
            traces,
        })
    }
}

impl fmt::Display for ErrorReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.kind, Level(self.level))?;
        if !self.name.is_empty() {
            write!(f, " {}", self.name)?;
        }
        write!(f, ": {}", self.message.trim_end())?;
        for trace in &self.traces {
            write!(f, "\n  trace: {}", trace.message.trim_end())?;
        }
        Ok(())
    }
}

/// Start of a daemon activity (`STDERR_START_ACTIVITY`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityStart {
    pub id: u64,
    pub level: u64,
    pub kind: u64,
    /// Empty when the activity has no description
    pub message: String,
    pub fields: LoggerFields,
    pub parent: u64,
}

impl Encode for ActivityStart {
    fn encode_into(&self, out: &mut Vec<u8>) {
        put_int(out, self.id);
        put_int(out, self.level);
        put_int(out, self.kind);
        put_string(out, &self.message);
        self.fields.encode_into(out);
        put_int(out, self.parent);
    }
}

impl Decode for ActivityStart {
    fn decode_from<R: Read + ?Sized>(reader: &mut R) -> Result<Self, Error> {
        Ok(Self {
            id: reader.read_int().context("reading activity id")?,
            level: reader.read_int().context("reading level")?,
            kind: reader.read_int().context("reading activity type")?,
            message: reader.read_string().context("reading message")?,
            fields: LoggerFields::decode_from(reader).context("reading fields")?,
            parent: reader.read_int().context("reading parent")?,
        })
    }
}

impl fmt::Display for ActivityStart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "activity {} started (type {}, {}",
            self.id,
            self.kind,
            Level(self.level)
        )?;
        if self.parent != 0 {
            write!(f, ", parent {}", self.parent)?;
        }
        f.write_str(")")?;
        if !self.message.is_empty() {
            write!(f, ": {}", self.message)?;
        }
        if !self.fields.is_empty() {
            write!(f, " {}", self.fields)?;
        }
        Ok(())
    }
}

/// Result reported by a running activity (`STDERR_RESULT`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityResult {
    pub id: u64,
    pub kind: u64,
    pub fields: LoggerFields,
}

impl Encode for ActivityResult {
    fn encode_into(&self, out: &mut Vec<u8>) {
        put_int(out, self.id);
        put_int(out, self.kind);
        self.fields.encode_into(out);
    }
}

impl Decode for ActivityResult {
    fn decode_from<R: Read + ?Sized>(reader: &mut R) -> Result<Self, Error> {
        Ok(Self {
            id: reader.read_int().context("reading activity id")?,
            kind: reader.read_int().context("reading result type")?,
            fields: LoggerFields::decode_from(reader).context("reading fields")?,
        })
    }
}

impl fmt::Display for ActivityResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "activity {} result (type {}) {}",
            self.id, self.kind, self.fields
        )
    }
}
