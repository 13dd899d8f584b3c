//! Low-level CAPI wire encoding primitives
//!
//! CAPI messages are compact, unaligned little-endian byte streams. The
//! reader keeps an explicit cursor and fails closed on short input; the
//! message buffer comes straight from the adapter and is never trusted.

use bytes::{BufMut, Bytes, BytesMut};

use crate::{Error, Result};

/// Escape value in a one-octet struct length introducing a two-octet length.
const STRUCT_LEN_ESCAPE: u8 = 0xff;

/// Cursor over a received message buffer. Every accessor checks the
/// remaining length and returns `Error::Protocol` instead of reading
/// out of bounds.
pub struct CapiReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> CapiReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn u8(&mut self) -> Result<u8> {
        let b = self.take(1)?;
        Ok(b[0])
    }

    pub fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.remaining() < len {
            return Err(Error::protocol(format!(
                "short read: need {} octets, {} left",
                len,
                self.remaining()
            )));
        }
        let out = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    /// Read a length-prefixed CAPI struct and return its content.
    ///
    /// A first octet of 0xff escapes to a two-octet length for long
    /// fields (used by DTMF digit lists and long number elements).
    pub fn capi_struct(&mut self) -> Result<&'a [u8]> {
        let first = self.u8()?;
        let len = if first == STRUCT_LEN_ESCAPE {
            self.u16()? as usize
        } else {
            first as usize
        };
        self.take(len)
    }

    /// Remaining bytes without advancing, for trailing payloads.
    pub fn rest(&mut self) -> &'a [u8] {
        let out = &self.buf[self.pos..];
        self.pos = self.buf.len();
        out
    }
}

/// Growable encoder for outbound messages.
pub struct CapiWriter {
    buf: BytesMut,
}

impl CapiWriter {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(64),
        }
    }

    pub fn u8(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    pub fn u16(&mut self, v: u16) {
        self.buf.put_u16_le(v);
    }

    pub fn u32(&mut self, v: u32) {
        self.buf.put_u32_le(v);
    }

    pub fn raw(&mut self, v: &[u8]) {
        self.buf.put_slice(v);
    }

    /// Write a length-prefixed CAPI struct, escaping to a two-octet
    /// length when the content does not fit the one-octet form.
    pub fn capi_struct(&mut self, content: &[u8]) {
        if content.len() < STRUCT_LEN_ESCAPE as usize {
            self.buf.put_u8(content.len() as u8);
        } else {
            debug_assert!(content.len() <= u16::MAX as usize);
            self.buf.put_u8(STRUCT_LEN_ESCAPE);
            self.buf.put_u16_le(content.len() as u16);
        }
        self.buf.put_slice(content);
    }

    /// Empty struct placeholder (single zero octet).
    pub fn empty_struct(&mut self) {
        self.buf.put_u8(0);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn freeze(self) -> Bytes {
        self.buf.freeze()
    }
}

impl Default for CapiWriter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_round_trip() {
        let mut w = CapiWriter::new();
        w.u8(0x42);
        w.u16(0xbeef);
        w.u32(0x00010203);
        let buf = w.freeze();

        let mut r = CapiReader::new(&buf);
        assert_eq!(r.u8().unwrap(), 0x42);
        assert_eq!(r.u16().unwrap(), 0xbeef);
        assert_eq!(r.u32().unwrap(), 0x00010203);
        assert!(r.is_empty());
    }

    #[test]
    fn test_short_struct_round_trip() {
        let mut w = CapiWriter::new();
        w.capi_struct(b"\x80\x344321");
        let buf = w.freeze();

        let mut r = CapiReader::new(&buf);
        assert_eq!(r.capi_struct().unwrap(), b"\x80\x344321");
    }

    #[test]
    fn test_escaped_struct_round_trip() {
        let long = vec![0xaau8; 300];
        let mut w = CapiWriter::new();
        w.capi_struct(&long);
        let buf = w.freeze();
        // escape octet + two length octets + content
        assert_eq!(buf.len(), 3 + 300);
        assert_eq!(buf[0], 0xff);

        let mut r = CapiReader::new(&buf);
        assert_eq!(r.capi_struct().unwrap(), &long[..]);
    }

    #[test]
    fn test_truncated_struct_fails_closed() {
        // claims 10 octets of content, delivers 3
        let buf = [10u8, 1, 2, 3];
        let mut r = CapiReader::new(&buf);
        assert!(r.capi_struct().is_err());
    }

    #[test]
    fn test_truncated_integer_fails_closed() {
        let buf = [0x01u8];
        let mut r = CapiReader::new(&buf);
        assert!(r.u16().is_err());
        let mut r = CapiReader::new(&buf);
        assert!(r.u32().is_err());
    }
}
