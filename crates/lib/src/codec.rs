//! Primitive wire codec
//!
//! The daemon protocol is built from four primitives:
//!
//! - int: `u64`, always 8 bytes, little-endian
//! - buf: int length prefix, payload, zero padding up to the next multiple of 8
//! - bool: an int, `0` is false and anything else is true
//! - string: a buf holding UTF-8
//!
//! Slice functions (`decode_*`) only look at the bytes that carry meaning and
//! ignore anything after them. Stream helpers ([`WireRead`]) consume the full
//! wire size including padding, so a cursor always lands on the next word.

use std::io::{self, Read, Write};

use crate::error::Error;

/// Size of one wire word
pub const WORD: usize = 8;

/// Encode an int
pub fn encode_int(value: u64) -> [u8; WORD] {
    value.to_le_bytes()
}

/// Decode an int from the first 8 bytes of `raw`. Trailing bytes are ignored.
pub fn decode_int(raw: &[u8]) -> Result<u64, Error> {
    let word: [u8; WORD] = raw
        .get(..WORD)
        .and_then(|w| w.try_into().ok())
        .ok_or_else(|| Error::truncated(WORD, raw.len()))?;
    Ok(u64::from_le_bytes(word))
}

/// Number of zero bytes that follow a payload of `len` bytes
pub fn padding(len: usize) -> usize {
    (WORD - len % WORD) % WORD
}

/// Wire size of a buf with a payload of `len` bytes, prefix and padding included
pub fn buf_wire_size(len: usize) -> usize {
    WORD + len + padding(len)
}

/// Encode a buf
pub fn encode_buf(bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(buf_wire_size(bytes.len()));
    put_buf(&mut out, bytes);
    out
}

/// Decode a buf into its declared length and payload.
///
/// Exactly `declared_len` bytes after the prefix are returned. Padding is
/// neither checked nor required; callers walking a larger stream advance by
/// [`buf_wire_size`].
pub fn decode_buf(raw: &[u8]) -> Result<(u64, &[u8]), Error> {
    let declared = decode_int(raw)?;
    let len = usize::try_from(declared).unwrap_or(usize::MAX);
    let payload = raw[WORD..]
        .get(..len)
        .ok_or_else(|| Error::truncated(WORD.saturating_add(len), raw.len()))?;
    Ok((declared, payload))
}

pub fn encode_bool(value: bool) -> [u8; WORD] {
    encode_int(u64::from(value))
}

pub fn decode_bool(raw: &[u8]) -> Result<bool, Error> {
    Ok(decode_int(raw)? != 0)
}

pub fn encode_string(value: &str) -> Vec<u8> {
    encode_buf(value.as_bytes())
}

pub fn decode_string(raw: &[u8]) -> Result<String, Error> {
    let (_, payload) = decode_buf(raw)?;
    Ok(String::from_utf8(payload.to_vec())?)
}

pub(crate) fn put_int(out: &mut Vec<u8>, value: u64) {
    out.extend_from_slice(&encode_int(value));
}

pub(crate) fn put_bool(out: &mut Vec<u8>, value: bool) {
    put_int(out, u64::from(value));
}

pub(crate) fn put_buf(out: &mut Vec<u8>, bytes: &[u8]) {
    put_int(out, bytes.len() as u64);
    out.extend_from_slice(bytes);
    out.resize(out.len() + padding(bytes.len()), 0);
}

pub(crate) fn put_string(out: &mut Vec<u8>, value: &str) {
    put_buf(out, value.as_bytes());
}

/// Values that serialize themselves into the wire format
pub trait Encode {
    fn encode_into(&self, out: &mut Vec<u8>);

    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode_into(&mut out);
        out
    }

    /// Bytes occupied on the wire, padding included
    fn wire_size(&self) -> usize {
        self.encode().len()
    }
}

/// Values that deserialize themselves from the wire format
pub trait Decode: Sized {
    fn decode_from<R: Read + ?Sized>(reader: &mut R) -> Result<Self, Error>;

    /// Decode from a slice, returning the value and the bytes consumed
    fn decode(raw: &[u8]) -> Result<(Self, usize), Error> {
        let mut cursor = raw;
        let value = Self::decode_from(&mut cursor)?;
        Ok((value, raw.len() - cursor.len()))
    }
}

impl Encode for u64 {
    fn encode_into(&self, out: &mut Vec<u8>) {
        put_int(out, *self);
    }

    fn wire_size(&self) -> usize {
        WORD
    }
}

impl Decode for u64 {
    fn decode_from<R: Read + ?Sized>(reader: &mut R) -> Result<Self, Error> {
        reader.read_int()
    }
}

impl Encode for bool {
    fn encode_into(&self, out: &mut Vec<u8>) {
        put_bool(out, *self);
    }

    fn wire_size(&self) -> usize {
        WORD
    }
}

impl Decode for bool {
    fn decode_from<R: Read + ?Sized>(reader: &mut R) -> Result<Self, Error> {
        reader.read_bool()
    }
}

impl Encode for String {
    fn encode_into(&self, out: &mut Vec<u8>) {
        put_string(out, self);
    }

    fn wire_size(&self) -> usize {
        buf_wire_size(self.len())
    }
}

impl Decode for String {
    fn decode_from<R: Read + ?Sized>(reader: &mut R) -> Result<Self, Error> {
        reader.read_string()
    }
}

/// Fill `buf` completely, reporting a short read as [`Error::Truncated`]
fn fill<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> Result<usize, Error> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(filled)
}

/// Read one word, or `None` if the stream ended cleanly on a word boundary
pub(crate) fn read_word_or_eof<R: Read + ?Sized>(
    reader: &mut R,
) -> Result<Option<[u8; WORD]>, Error> {
    let mut word = [0u8; WORD];
    match fill(reader, &mut word)? {
        0 => Ok(None),
        WORD => Ok(Some(word)),
        n => Err(Error::truncated(WORD, n)),
    }
}

/// Primitive reads on top of any byte stream
pub trait WireRead: Read {
    fn read_word(&mut self) -> Result<[u8; WORD], Error> {
        let mut word = [0u8; WORD];
        let n = fill(self, &mut word)?;
        if n < WORD {
            return Err(Error::truncated(WORD, n));
        }
        Ok(word)
    }

    fn read_int(&mut self) -> Result<u64, Error> {
        Ok(u64::from_le_bytes(self.read_word()?))
    }

    fn read_bool(&mut self) -> Result<bool, Error> {
        Ok(self.read_int()? != 0)
    }

    /// Read a buf payload and skip its padding
    fn read_bytes(&mut self) -> Result<Vec<u8>, Error> {
        let declared = self.read_int()?;
        let mut payload = Vec::new();
        Read::take(&mut *self, declared).read_to_end(&mut payload)?;
        let len = payload.len();
        if (len as u64) < declared {
            return Err(Error::truncated(
                usize::try_from(declared).unwrap_or(usize::MAX),
                len,
            ));
        }

        let mut pad = [0u8; WORD];
        let pad = &mut pad[..padding(len)];
        let n = fill(self, pad)?;
        if n < pad.len() {
            return Err(Error::truncated(pad.len(), n));
        }
        Ok(payload)
    }

    fn read_string(&mut self) -> Result<String, Error> {
        Ok(String::from_utf8(self.read_bytes()?)?)
    }
}

impl<R: Read + ?Sized> WireRead for R {}

/// Primitive writes on top of any byte sink
pub trait WireWrite: Write {
    fn write_int(&mut self, value: u64) -> Result<(), Error> {
        self.write_all(&encode_int(value))?;
        Ok(())
    }

    fn write_bool(&mut self, value: bool) -> Result<(), Error> {
        self.write_int(u64::from(value))
    }

    fn write_buf(&mut self, bytes: &[u8]) -> Result<(), Error> {
        self.write_all(&encode_buf(bytes))?;
        Ok(())
    }

    fn write_string(&mut self, value: &str) -> Result<(), Error> {
        self.write_buf(value.as_bytes())
    }

    /// Encode a value and write it in one call
    fn write_value<T: Encode + ?Sized>(&mut self, value: &T) -> Result<(), Error> {
        self.write_all(&value.encode())?;
        Ok(())
    }
}

impl<W: Write + ?Sized> WireWrite for W {}
