//! Channel-request payload codec.
//!
//! SSH channel requests carry a type-specific payload built from RFC 4251
//! primitives (`uint32`, `boolean`, `string`).  The router treats payloads as
//! opaque bytes everywhere except in two places: the `env` request, whose
//! key/value pair carries the routing variable, and the adapters that have to
//! turn a frame back into a typed call on the SSH library.  Everything here
//! parses untrusted network input, so every length is checked before it is
//! used to slice.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Why an `env` payload (or any other payload) failed to decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EnvDecodeError {
    /// A length field, or the bytes it announces, run past the end of input.
    #[error("payload too short")]
    TooShort,
    /// The pair was well formed but bytes were left over.
    #[error("payload invalid: trailing bytes")]
    Invalid,
}

// ---------------------------------------------------------------------------
// env payload
// ---------------------------------------------------------------------------

/// Decode the `string key, string value` payload of an `env` request.
///
/// The input must be consumed exactly.  Lengths are unsigned 32-bit, so a
/// "negative" length cannot be expressed on the wire; a length larger than
/// what remains is reported as [`EnvDecodeError::TooShort`].
///
/// On the server side `russh` parses env requests itself and drops the
/// connection when one is malformed or not UTF-8, so payloads reaching this
/// function there were re-encoded by [`encode_env_payload`].
pub fn decode_env_payload(payload: &[u8]) -> Result<(&[u8], &[u8]), EnvDecodeError> {
    let mut reader = Reader::new(payload);
    let key = reader.string()?;
    let value = reader.string()?;
    reader.finish()?;
    Ok((key, value))
}

/// Inverse of [`decode_env_payload`].
pub fn encode_env_payload(key: &[u8], value: &[u8]) -> Bytes {
    let mut writer = Writer::new();
    writer.put_string(key);
    writer.put_string(value);
    writer.finish()
}

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

/// Bounds-checked cursor over a request payload.
#[derive(Debug, Clone)]
pub struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    pub fn u32(&mut self) -> Result<u32, EnvDecodeError> {
        let (head, rest) = self.split(4)?;
        self.buf = rest;
        Ok(u32::from_be_bytes([head[0], head[1], head[2], head[3]]))
    }

    pub fn u8(&mut self) -> Result<u8, EnvDecodeError> {
        let (head, rest) = self.split(1)?;
        self.buf = rest;
        Ok(head[0])
    }

    /// An RFC 4251 boolean: any non-zero byte is true.
    pub fn bool(&mut self) -> Result<bool, EnvDecodeError> {
        Ok(self.u8()? != 0)
    }

    /// A `uint32` length followed by that many bytes.
    pub fn string(&mut self) -> Result<&'a [u8], EnvDecodeError> {
        let len = self.u32()?;
        let len = usize::try_from(len).map_err(|_| EnvDecodeError::TooShort)?;
        let (head, rest) = self.split(len)?;
        self.buf = rest;
        Ok(head)
    }

    /// A string that must be valid UTF-8.  Invalid UTF-8 is reported as
    /// [`EnvDecodeError::Invalid`].
    pub fn utf8(&mut self) -> Result<&'a str, EnvDecodeError> {
        let raw = self.string()?;
        std::str::from_utf8(raw).map_err(|_| EnvDecodeError::Invalid)
    }

    /// Succeeds only when the whole payload has been consumed.
    pub fn finish(self) -> Result<(), EnvDecodeError> {
        if self.buf.is_empty() {
            Ok(())
        } else {
            Err(EnvDecodeError::Invalid)
        }
    }

    fn split(&self, n: usize) -> Result<(&'a [u8], &'a [u8]), EnvDecodeError> {
        if self.buf.len() < n {
            return Err(EnvDecodeError::TooShort);
        }
        Ok(self.buf.split_at(n))
    }
}

// ---------------------------------------------------------------------------
// Writer
// ---------------------------------------------------------------------------

/// Builder for request payloads.
#[derive(Debug, Default)]
pub struct Writer {
    buf: BytesMut,
}

impl Writer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_u32(&mut self, v: u32) -> &mut Self {
        self.buf.put_u32(v);
        self
    }

    pub fn put_u8(&mut self, v: u8) -> &mut Self {
        self.buf.put_u8(v);
        self
    }

    pub fn put_bool(&mut self, v: bool) -> &mut Self {
        self.buf.put_u8(u8::from(v));
        self
    }

    /// Write a length-prefixed string.
    ///
    /// # Panics
    ///
    /// Panics if `s` is longer than `u32::MAX` bytes, which no SSH packet can
    /// carry in the first place.
    pub fn put_string(&mut self, s: &[u8]) -> &mut Self {
        let len = u32::try_from(s.len()).expect("SSH string longer than u32::MAX");
        self.buf.put_u32(len);
        self.buf.put_slice(s);
        self
    }

    pub fn finish(&mut self) -> Bytes {
        std::mem::take(&mut self.buf).freeze()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
