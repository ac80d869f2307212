//! Operation framing
//!
//! A request is `opcode || body`. The body's shape is fixed by the opcode, so
//! every operation kind is a variant of [`Operation`] carrying its typed body.
//! New operations are added as variants; the framing itself never changes.

use std::collections::BTreeMap;
use std::fmt;
use std::io::Read;

use serde::Deserialize;

use crate::codec::{Decode, Encode, WireRead, put_bool, put_int, put_string};
use crate::error::{Context, Error};
use crate::log::Verbosity;

macro_rules! opcodes {
    ($($name:ident = $value:expr),* $(,)?) => {
        /// Operation codes understood by the daemon
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum Opcode {
            $($name = $value),*
        }

        impl Opcode {
            pub const ALL: &'static [Opcode] = &[$(Opcode::$name),*];

            pub fn name(&self) -> &'static str {
                match self {
                    $(Opcode::$name => stringify!($name)),*
                }
            }
        }

        impl TryFrom<u64> for Opcode {
            type Error = Error;

            fn try_from(value: u64) -> Result<Self, Error> {
                match value {
                    $(v if v == $value => Ok(Opcode::$name),)*
                    tag => Err(Error::UnknownTag { what: "opcode", tag }),
                }
            }
        }
    };
}

opcodes! {
    IsValidPath = 1,
    QueryReferrers = 6,
    AddToStore = 7,
    BuildPaths = 9,
    EnsurePath = 10,
    AddTempRoot = 11,
    FindRoots = 14,
    SetOptions = 19,
    CollectGarbage = 20,
    QueryAllValidPaths = 23,
    QueryPathInfo = 26,
    QueryPathFromHashPart = 29,
    QueryValidPaths = 31,
    QuerySubstitutablePaths = 32,
    QueryValidDerivers = 33,
    OptimiseStore = 34,
    VerifyStore = 35,
    BuildDerivation = 36,
    AddSignatures = 37,
    NarFromPath = 38,
    AddToStoreNar = 39,
    QueryMissing = 40,
    QueryDerivationOutputMap = 41,
    RegisterDrvOutput = 42,
    QueryRealisation = 43,
    AddMultipleToStore = 44,
    AddBuildLog = 45,
    BuildPathsWithResults = 46,
}

impl From<Opcode> for u64 {
    fn from(op: Opcode) -> u64 {
        op as u64
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), u64::from(*self))
    }
}

impl Encode for Opcode {
    fn encode_into(&self, out: &mut Vec<u8>) {
        put_int(out, u64::from(*self));
    }
}

impl Decode for Opcode {
    fn decode_from<R: Read + ?Sized>(reader: &mut R) -> Result<Self, Error> {
        Opcode::try_from(reader.read_int()?)
    }
}

/// A request to the daemon
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    /// Ask whether a store path is valid. Reply: bool.
    IsValidPath { path: String },

    /// Push client settings to the daemon. Reply: none beyond the stderr run.
    SetOptions(ClientSettings),
}

impl Operation {
    pub fn opcode(&self) -> Opcode {
        match self {
            Operation::IsValidPath { .. } => Opcode::IsValidPath,
            Operation::SetOptions(_) => Opcode::SetOptions,
        }
    }

    fn encode_body(&self, out: &mut Vec<u8>) {
        match self {
            Operation::IsValidPath { path } => put_string(out, path),
            Operation::SetOptions(settings) => settings.encode_into(out),
        }
    }
}

impl Encode for Operation {
    fn encode_into(&self, out: &mut Vec<u8>) {
        self.opcode().encode_into(out);
        self.encode_body(out);
    }
}

impl Decode for Operation {
    fn decode_from<R: Read + ?Sized>(reader: &mut R) -> Result<Self, Error> {
        let opcode = Opcode::decode_from(reader).context("reading opcode")?;
        match opcode {
            Opcode::IsValidPath => Ok(Operation::IsValidPath {
                path: reader.read_string().context("reading store path")?,
            }),
            Opcode::SetOptions => Ok(Operation::SetOptions(
                ClientSettings::decode_from(reader).context("reading settings")?,
            )),
            other => Err(Error::UnsupportedOperation(other)),
        }
    }
}

/// Body of [`Opcode::SetOptions`]
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    pub keep_failed: bool,
    pub keep_going: bool,
    pub try_fallback: bool,
    pub verbosity: Verbosity,
    pub max_build_jobs: u64,
    pub max_silent_time: u64,
    pub build_verbosity: Verbosity,
    pub build_cores: u64,
    pub use_substitutes: bool,
    /// Additional `name = value` overrides, sent sorted by name
    pub overrides: BTreeMap<String, String>,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            keep_failed: false,
            keep_going: false,
            try_fallback: false,
            verbosity: Verbosity::Error,
            max_build_jobs: 1,
            max_silent_time: 0,
            build_verbosity: Verbosity::Error,
            build_cores: 0,
            use_substitutes: true,
            overrides: BTreeMap::new(),
        }
    }
}

// Obsolete slots the daemon still reads.
const USE_BUILD_HOOK: bool = true;
const LOG_TYPE: u64 = 0;
const PRINT_BUILD_TRACE: u64 = 0;

impl Encode for ClientSettings {
    fn encode_into(&self, out: &mut Vec<u8>) {
        put_bool(out, self.keep_failed);
        put_bool(out, self.keep_going);
        put_bool(out, self.try_fallback);
        self.verbosity.encode_into(out);
        put_int(out, self.max_build_jobs);
        put_int(out, self.max_silent_time);
        put_bool(out, USE_BUILD_HOOK);
        self.build_verbosity.encode_into(out);
        put_int(out, LOG_TYPE);
        put_int(out, PRINT_BUILD_TRACE);
        put_int(out, self.build_cores);
        put_bool(out, self.use_substitutes);
        put_int(out, self.overrides.len() as u64);
        for (name, value) in &self.overrides {
            put_string(out, name);
            put_string(out, value);
        }
    }
}

impl Decode for ClientSettings {
    fn decode_from<R: Read + ?Sized>(reader: &mut R) -> Result<Self, Error> {
        let keep_failed = reader.read_bool()?;
        let keep_going = reader.read_bool()?;
        let try_fallback = reader.read_bool()?;
        let verbosity = Verbosity::decode_from(reader).context("reading verbosity")?;
        let max_build_jobs = reader.read_int()?;
        let max_silent_time = reader.read_int()?;
        let _use_build_hook = reader.read_bool()?;
        let build_verbosity = Verbosity::decode_from(reader).context("reading build verbosity")?;
        let _log_type = reader.read_int()?;
        let _print_build_trace = reader.read_int()?;
        let build_cores = reader.read_int()?;
        let use_substitutes = reader.read_bool()?;

        let count = reader.read_int().context("reading override count")?;
        let mut overrides = BTreeMap::new();
        for i in 0..count {
            let name = reader
                .read_string()
                .context(format!("reading override {i} name"))?;
            let value = reader
                .read_string()
                .context(format!("reading override {i} value"))?;
            overrides.insert(name, value);
        }

        Ok(Self {
            keep_failed,
            keep_going,
            try_fallback,
            verbosity,
            max_build_jobs,
            max_silent_time,
            build_verbosity,
            build_cores,
            use_substitutes,
            overrides,
        })
    }
}
