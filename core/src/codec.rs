//! Wire primitives shared by every payload codec.
//!
//! Bitmessage uses Bitcoin-style variable-length integers with the tag
//! bytes 0xFD/0xFE/0xFF, but all multi-byte values are big-endian
//! (network byte order). Encoding and decoding are strict inverses; a
//! declared length that would overrun the input is a parse error, never
//! a panic.

use crate::error::{CoreError, CoreResult};

/// Hard upper bound on any message payload (1,600,003 bytes).
pub const MAX_PAYLOAD_SIZE: usize = 1_600_003;

/// Appends a varint to `buf`: 1, 3, 5 or 9 bytes.
pub fn put_var_int(buf: &mut Vec<u8>, value: u64) {
    if value < 0xFD {
        buf.push(value as u8);
    } else if value <= 0xFFFF {
        buf.push(0xFD);
        buf.extend_from_slice(&(value as u16).to_be_bytes());
    } else if value <= 0xFFFF_FFFF {
        buf.push(0xFE);
        buf.extend_from_slice(&(value as u32).to_be_bytes());
    } else {
        buf.push(0xFF);
        buf.extend_from_slice(&value.to_be_bytes());
    }
}

/// Appends varint(len) followed by the raw bytes.
pub fn put_var_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    put_var_int(buf, bytes.len() as u64);
    buf.extend_from_slice(bytes);
}

/// Appends a var_str: varint(len) followed by UTF-8 bytes.
pub fn put_var_str(buf: &mut Vec<u8>, s: &str) {
    put_var_bytes(buf, s.as_bytes());
}

/// Appends a varint-prefixed list of varints (e.g. the streams list of
/// a version message).
pub fn put_var_int_list(buf: &mut Vec<u8>, values: &[u64]) {
    put_var_int(buf, values.len() as u64);
    for v in values {
        put_var_int(buf, *v);
    }
}

pub fn put_u16(buf: &mut Vec<u8>, value: u16) {
    buf.extend_from_slice(&value.to_be_bytes());
}

pub fn put_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_be_bytes());
}

pub fn put_u64(buf: &mut Vec<u8>, value: u64) {
    buf.extend_from_slice(&value.to_be_bytes());
}

pub fn put_i64(buf: &mut Vec<u8>, value: i64) {
    buf.extend_from_slice(&value.to_be_bytes());
}

/// Byte-length of `value` once varint-encoded.
pub fn var_int_len(value: u64) -> usize {
    match value {
        0..=0xFC => 1,
        0xFD..=0xFFFF => 3,
        0x1_0000..=0xFFFF_FFFF => 5,
        _ => 9,
    }
}

/// Cursor over a received byte buffer.
///
/// Every accessor checks the remaining length before touching the
/// input and fails with [`CoreError::Parse`] on overrun.
pub struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Position in the underlying buffer, in bytes.
    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn bytes(&mut self, n: usize) -> CoreResult<&'a [u8]> {
        if self.remaining() < n {
            return Err(CoreError::parse(format!(
                "need {} bytes, {} remaining",
                n,
                self.remaining()
            )));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn array<const N: usize>(&mut self) -> CoreResult<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.bytes(N)?);
        Ok(out)
    }

    pub fn u8(&mut self) -> CoreResult<u8> {
        Ok(self.bytes(1)?[0])
    }

    pub fn u16(&mut self) -> CoreResult<u16> {
        Ok(u16::from_be_bytes(self.array()?))
    }

    pub fn u32(&mut self) -> CoreResult<u32> {
        Ok(u32::from_be_bytes(self.array()?))
    }

    pub fn u64(&mut self) -> CoreResult<u64> {
        Ok(u64::from_be_bytes(self.array()?))
    }

    pub fn i64(&mut self) -> CoreResult<i64> {
        Ok(i64::from_be_bytes(self.array()?))
    }

    pub fn var_int(&mut self) -> CoreResult<u64> {
        match self.u8()? {
            tag @ 0..=0xFC => Ok(tag as u64),
            0xFD => Ok(self.u16()? as u64),
            0xFE => Ok(self.u32()? as u64),
            0xFF => self.u64(),
        }
    }

    /// Varint-prefixed byte string. `max` bounds the declared length so a
    /// hostile peer cannot make us trust a bogus allocation size.
    pub fn var_bytes(&mut self, max: usize) -> CoreResult<Vec<u8>> {
        let len = self.var_int()?;
        if len > max as u64 {
            return Err(CoreError::parse(format!(
                "declared length {} exceeds limit {}",
                len, max
            )));
        }
        Ok(self.bytes(len as usize)?.to_vec())
    }

    pub fn var_str(&mut self, max: usize) -> CoreResult<String> {
        let bytes = self.var_bytes(max)?;
        String::from_utf8(bytes).map_err(|_| CoreError::parse("var_str is not valid UTF-8"))
    }

    pub fn var_int_list(&mut self, max: usize) -> CoreResult<Vec<u64>> {
        let count = self.var_int()?;
        if count > max as u64 {
            return Err(CoreError::parse(format!(
                "declared count {} exceeds limit {}",
                count, max
            )));
        }
        let mut out = Vec::with_capacity(count as usize);
        for _ in 0..count {
            out.push(self.var_int()?);
        }
        Ok(out)
    }

    /// Consumes and returns everything that is left.
    pub fn take_rest(&mut self) -> &'a [u8] {
        let out = &self.buf[self.pos..];
        self.pos = self.buf.len();
        out
    }

    /// Fails unless the whole input was consumed; payload codecs call
    /// this so trailing garbage is rejected rather than ignored.
    pub fn finish(&self) -> CoreResult<()> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(CoreError::parse(format!(
                "{} trailing bytes after payload",
                self.remaining()
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn var_int_round_trip_and_lengths() {
        let cases: &[(u64, usize)] = &[
            (0, 1),
            (252, 1),
            (253, 3),
            (0xFFFF, 3),
            (0x1_0000, 5),
            (0xFFFF_FFFF, 5),
            (0x1_0000_0000, 9),
            (u64::MAX, 9),
        ];
        for &(value, expected_len) in cases {
            let mut buf = Vec::new();
            put_var_int(&mut buf, value);
            assert_eq!(buf.len(), expected_len, "encoded length of {}", value);
            assert_eq!(var_int_len(value), expected_len);

            let mut dec = Decoder::new(&buf);
            assert_eq!(dec.var_int().unwrap(), value);
            assert!(dec.is_empty());
        }
    }

    #[test]
    fn var_int_tag_bytes() {
        let mut buf = Vec::new();
        put_var_int(&mut buf, 253);
        assert_eq!(buf, vec![0xFD, 0x00, 0xFD]);

        buf.clear();
        put_var_int(&mut buf, 0x1_0000);
        assert_eq!(buf, vec![0xFE, 0x00, 0x01, 0x00, 0x00]);

        buf.clear();
        put_var_int(&mut buf, 0x1_0000_0000);
        assert_eq!(buf[0], 0xFF);
        assert_eq!(buf.len(), 9);
    }

    #[test]
    fn truncated_var_int_is_parse_error() {
        // 0xFD announces two more bytes but only one follows.
        let mut dec = Decoder::new(&[0xFD, 0x01]);
        assert!(matches!(dec.var_int(), Err(CoreError::Parse(_))));
    }

    #[test]
    fn var_bytes_overrun_is_parse_error() {
        let mut buf = Vec::new();
        put_var_int(&mut buf, 10);
        buf.extend_from_slice(&[1, 2, 3]); // three bytes, ten promised
        let mut dec = Decoder::new(&buf);
        assert!(matches!(dec.var_bytes(1024), Err(CoreError::Parse(_))));
    }

    #[test]
    fn var_bytes_respects_limit() {
        let mut buf = Vec::new();
        put_var_bytes(&mut buf, &[0u8; 64]);
        let mut dec = Decoder::new(&buf);
        assert!(dec.var_bytes(32).is_err());
    }

    #[test]
    fn var_str_round_trip() {
        let mut buf = Vec::new();
        put_var_str(&mut buf, "/bitmessage-rust:0.1/");
        let mut dec = Decoder::new(&buf);
        assert_eq!(dec.var_str(256).unwrap(), "/bitmessage-rust:0.1/");
    }

    #[test]
    fn var_int_list_round_trip() {
        let mut buf = Vec::new();
        put_var_int_list(&mut buf, &[1, 2, 0xFFFF]);
        let mut dec = Decoder::new(&buf);
        assert_eq!(dec.var_int_list(16).unwrap(), vec![1, 2, 0xFFFF]);
    }

    #[test]
    fn finish_rejects_trailing_bytes() {
        let mut dec = Decoder::new(&[0x01, 0x02]);
        dec.u8().unwrap();
        assert!(dec.finish().is_err());
        dec.u8().unwrap();
        assert!(dec.finish().is_ok());
    }
}
