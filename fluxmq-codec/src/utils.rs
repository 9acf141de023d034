use std::{io::Cursor, num::NonZeroU16, num::NonZeroU32};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use bytestring::ByteString;

use crate::error::{DecodeError, EncodeError};

macro_rules! ensure {
    ($cond:expr, $e:expr) => {
        if !($cond) {
            return Err($e);
        }
    };
    ($cond:expr, $fmt:expr, $($arg:tt)+) => {
        if !($cond) {
            return Err($fmt, $($arg)+);
        }
    };
}

macro_rules! prim_enum {
    (
        $( #[$enum_attr:meta] )*
        pub enum $name:ident {
            $(
                $( #[$enum_item_attr:meta] )*
                $var:ident=$val:expr
            ),+
        }) => {
        $( #[$enum_attr] )*
        #[repr(u8)]
        #[derive(Debug, Eq, PartialEq, Copy, Clone)]
        pub enum $name {
            $(
                $( #[$enum_item_attr] )*
                $var = $val
            ),+
        }
        impl std::convert::TryFrom<u8> for $name {
            type Error = $crate::error::DecodeError;
            fn try_from(v: u8) -> Result<Self, Self::Error> {
                match v {
                    $($val => Ok($name::$var)),+
                    ,_ => Err($crate::error::DecodeError::MalformedPacket)
                }
            }
        }
    };
}

pub(crate) trait Decode: Sized {
    fn decode(src: &mut Bytes) -> Result<Self, DecodeError>;
}

impl Decode for bool {
    fn decode(src: &mut Bytes) -> Result<Self, DecodeError> {
        ensure!(src.has_remaining(), DecodeError::InvalidLength);
        let v = src.get_u8();
        ensure!(v <= 0x1, DecodeError::MalformedPacket);
        Ok(v == 0x1)
    }
}

impl Decode for u16 {
    fn decode(src: &mut Bytes) -> Result<Self, DecodeError> {
        ensure!(src.remaining() >= 2, DecodeError::InvalidLength);
        Ok(src.get_u16())
    }
}

impl Decode for u32 {
    fn decode(src: &mut Bytes) -> Result<Self, DecodeError> {
        ensure!(src.remaining() >= 4, DecodeError::InvalidLength);
        Ok(src.get_u32())
    }
}

impl Decode for NonZeroU16 {
    fn decode(src: &mut Bytes) -> Result<Self, DecodeError> {
        NonZeroU16::new(u16::decode(src)?).ok_or(DecodeError::MalformedPacket)
    }
}

impl Decode for NonZeroU32 {
    fn decode(src: &mut Bytes) -> Result<Self, DecodeError> {
        NonZeroU32::new(u32::decode(src)?).ok_or(DecodeError::MalformedPacket)
    }
}

impl Decode for Bytes {
    fn decode(src: &mut Bytes) -> Result<Self, DecodeError> {
        let len = u16::decode(src)? as usize;
        ensure!(src.remaining() >= len, DecodeError::InvalidLength);
        Ok(src.split_to(len))
    }
}

impl Decode for ByteString {
    fn decode(src: &mut Bytes) -> Result<Self, DecodeError> {
        let raw = Bytes::decode(src)?;
        validate_utf8(raw.as_ref())?;
        ByteString::try_from(raw).map_err(|_| DecodeError::MalformedUtf8)
    }
}

/// Strict wire-string validation. Beyond structural UTF-8 (overlong forms,
/// surrogates, truncated sequences, code points past U+10FFFF) this rejects
/// NUL, the C0 and C1 control ranges, and the Unicode noncharacters
/// U+FDD0..=U+FDEF and U+xFFFE/U+xFFFF of every plane.
pub(crate) fn validate_utf8(buf: &[u8]) -> Result<(), DecodeError> {
    let mut i = 0;
    while i < buf.len() {
        let lead = buf[i];
        let (len, mut cp) = match lead {
            0x00..=0x7F => (1, lead as u32),
            0xC2..=0xDF => (2, (lead & 0x1F) as u32),
            0xE0..=0xEF => (3, (lead & 0x0F) as u32),
            0xF0..=0xF4 => (4, (lead & 0x07) as u32),
            // 0x80..=0xC1 covers stray continuation bytes and the
            // overlong leads 0xC0/0xC1; 0xF5..=0xFF is past U+10FFFF
            _ => return Err(DecodeError::MalformedUtf8),
        };
        ensure!(i + len <= buf.len(), DecodeError::MalformedUtf8);
        for &cont in &buf[i + 1..i + len] {
            ensure!(cont & 0xC0 == 0x80, DecodeError::MalformedUtf8);
            cp = (cp << 6) | (cont & 0x3F) as u32;
        }
        match len {
            3 => ensure!(cp >= 0x800, DecodeError::MalformedUtf8),
            4 => ensure!((0x1_0000..=0x10_FFFF).contains(&cp), DecodeError::MalformedUtf8),
            _ => {}
        }
        // UTF-16 surrogates must not appear in UTF-8
        ensure!(!(0xD800..=0xDFFF).contains(&cp), DecodeError::MalformedUtf8);
        // NUL and the C0/C1 control ranges
        ensure!(cp != 0, DecodeError::MalformedUtf8);
        ensure!(!(0x01..=0x1F).contains(&cp), DecodeError::MalformedUtf8);
        ensure!(!(0x7F..=0x9F).contains(&cp), DecodeError::MalformedUtf8);
        // Noncharacters
        ensure!(!(0xFDD0..=0xFDEF).contains(&cp), DecodeError::MalformedUtf8);
        ensure!(cp & 0xFFFF != 0xFFFE && cp & 0xFFFF != 0xFFFF, DecodeError::MalformedUtf8);
        i += len;
    }
    Ok(())
}

/// Reads the length prefix of a property block and splits it off so the
/// block can be parsed against its own remaining counter.
pub(crate) fn take_properties(src: &mut Bytes) -> Result<Bytes, DecodeError> {
    let prop_len = decode_variable_length_cursor(src)?;
    ensure!(src.remaining() >= prop_len as usize, DecodeError::InvalidLength);

    Ok(src.split_to(prop_len as usize))
}

/// Non-consuming variant for peeking at a partially buffered header.
/// `Ok(None)` means more bytes are needed.
pub(crate) fn decode_variable_length(src: &[u8]) -> Result<Option<(u32, usize)>, DecodeError> {
    let mut cur = Cursor::new(src);
    match decode_variable_length_cursor(&mut cur) {
        Ok(len) => Ok(Some((len, cur.position() as usize))),
        Err(DecodeError::InvalidLength) => Ok(None),
        Err(e) => Err(e),
    }
}

pub(crate) fn decode_variable_length_cursor<B: Buf>(src: &mut B) -> Result<u32, DecodeError> {
    let mut shift: u32 = 0;
    let mut len: u32 = 0;
    loop {
        ensure!(src.has_remaining(), DecodeError::InvalidLength);
        let val = src.get_u8();
        // a terminal zero digit past the first byte is an overlong encoding
        ensure!(shift == 0 || val != 0, DecodeError::MalformedPacket);
        len += ((val & 0x7F) as u32) << shift;
        if val & 0x80 == 0 {
            return Ok(len);
        }
        // a 4th digit may not carry the continuation bit
        ensure!(shift < 21, DecodeError::MalformedPacket);
        shift += 7;
    }
}

/// Number of varint digits needed for `len`.
pub(crate) const fn var_int_len(len: u32) -> u32 {
    const MAP: [u32; 33] = [
        5, 5, 5, 5, 4, 4, 4, 4, 4, 4, 4, 3, 3, 3, 3, 3, 3, 3, 2, 2, 2, 2, 2, 2, 2, 1, 1, 1, 1, 1,
        1, 1, 1,
    ];
    MAP[len.leading_zeros() as usize]
}

pub(crate) fn write_variable_length(len: u32, dst: &mut BytesMut) -> Result<(), EncodeError> {
    match len {
        0..=127 => dst.put_u8(len as u8),
        128..=16_383 => dst.put_slice(&[((len & 0x7F) | 0x80) as u8, (len >> 7) as u8]),
        16_384..=2_097_151 => dst.put_slice(&[
            ((len & 0x7F) | 0x80) as u8,
            (((len >> 7) & 0x7F) | 0x80) as u8,
            (len >> 14) as u8,
        ]),
        2_097_152..=268_435_455 => dst.put_slice(&[
            ((len & 0x7F) | 0x80) as u8,
            (((len >> 7) & 0x7F) | 0x80) as u8,
            (((len >> 14) & 0x7F) | 0x80) as u8,
            (len >> 21) as u8,
        ]),
        _ => return Err(EncodeError::InvalidLength),
    }
    Ok(())
}

pub(crate) trait Encode {
    fn encoded_size(&self) -> usize;

    fn encode(&self, buf: &mut BytesMut) -> Result<(), EncodeError>;
}

impl<T: Encode> Encode for Option<T> {
    fn encoded_size(&self) -> usize {
        self.as_ref().map(|v| v.encoded_size()).unwrap_or_default()
    }
    fn encode(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        if let Some(v) = self {
            v.encode(buf)?;
        }
        Ok(())
    }
}

impl Encode for bool {
    fn encoded_size(&self) -> usize {
        1
    }
    fn encode(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        buf.put_u8(u8::from(*self));
        Ok(())
    }
}

impl Encode for u16 {
    fn encoded_size(&self) -> usize {
        2
    }
    fn encode(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        buf.put_u16(*self);
        Ok(())
    }
}

impl Encode for NonZeroU16 {
    fn encoded_size(&self) -> usize {
        2
    }
    fn encode(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        self.get().encode(buf)
    }
}

impl Encode for u32 {
    fn encoded_size(&self) -> usize {
        4
    }
    fn encode(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        buf.put_u32(*self);
        Ok(())
    }
}

impl Encode for NonZeroU32 {
    fn encoded_size(&self) -> usize {
        4
    }
    fn encode(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        self.get().encode(buf)
    }
}

impl Encode for Bytes {
    fn encoded_size(&self) -> usize {
        2 + self.len()
    }
    fn encode(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        self.as_ref().encode(buf)
    }
}

impl Encode for ByteString {
    fn encoded_size(&self) -> usize {
        2 + self.len()
    }
    fn encode(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        self.as_bytes().as_ref().encode(buf)
    }
}

impl Encode for (ByteString, ByteString) {
    fn encoded_size(&self) -> usize {
        self.0.encoded_size() + self.1.encoded_size()
    }
    fn encode(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        self.0.encode(buf)?;
        self.1.encode(buf)
    }
}

impl Encode for &[u8] {
    fn encoded_size(&self) -> usize {
        2 + self.len()
    }
    fn encode(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        let len = u16::try_from(self.len()).map_err(|_| EncodeError::InvalidLength)?;
        buf.put_u16(len);
        buf.extend_from_slice(self);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_variable_length() {
        fn assert_variable_length<B: AsRef<[u8]> + 'static>(bytes: B, res: (u32, usize)) {
            assert_eq!(decode_variable_length(bytes.as_ref()).unwrap(), Some(res));
        }

        assert_variable_length(b"\x00", (0, 1));
        assert_variable_length(b"\x7f", (127, 1));
        assert_variable_length(b"\x7f\x7f", (127, 1));
        assert_variable_length(b"\x80\x01", (128, 2));
        assert_variable_length(b"\xff\x7f", (16383, 2));
        assert_variable_length(b"\x80\x80\x01", (16384, 3));
        assert_variable_length(b"\xff\xff\x7f", (2_097_151, 3));
        assert_variable_length(b"\x80\x80\x80\x01", (2_097_152, 4));
        assert_variable_length(b"\xff\xff\xff\x7f", (268_435_455, 4));

        // truncated: continuation bit set but no further bytes yet
        assert_eq!(decode_variable_length(b"\xff\xff\xff").unwrap(), None);

        // a 4th continuation byte is malformed, not "need more data"
        assert_eq!(
            decode_variable_length(b"\xff\xff\xff\x80\x01"),
            Err(DecodeError::MalformedPacket)
        );
        assert_eq!(
            decode_variable_length(b"\xff\xff\xff\xff\xff\xff"),
            Err(DecodeError::MalformedPacket)
        );
    }

    #[test]
    fn test_overlong_variable_length_rejected() {
        // a trailing zero digit after the first byte encodes a value that
        // fits in fewer bytes and must be treated as malformed
        assert_eq!(decode_variable_length(b"\x80\x00"), Err(DecodeError::MalformedPacket));
        assert_eq!(decode_variable_length(b"\xff\x80\x00"), Err(DecodeError::MalformedPacket));
        assert_eq!(
            decode_variable_length(b"\x80\x80\x80\x00"),
            Err(DecodeError::MalformedPacket)
        );

        // zero digits under a continuation bit are fine mid-stream
        assert_eq!(decode_variable_length(b"\x80\x80\x01").unwrap(), Some((16_384, 3)));
        // and a single zero byte is the minimal encoding of 0
        assert_eq!(decode_variable_length(b"\x00").unwrap(), Some((0, 1)));
    }

    #[test]
    fn test_encode_variable_length() {
        let mut v = BytesMut::new();

        write_variable_length(123, &mut v).unwrap();
        assert_eq!(v, [123].as_ref());

        v.clear();
        write_variable_length(129, &mut v).unwrap();
        assert_eq!(v, b"\x81\x01".as_ref());

        v.clear();
        write_variable_length(16_383, &mut v).unwrap();
        assert_eq!(v, b"\xff\x7f".as_ref());

        v.clear();
        write_variable_length(2_097_151, &mut v).unwrap();
        assert_eq!(v, b"\xff\xff\x7f".as_ref());

        v.clear();
        write_variable_length(268_435_455, &mut v).unwrap();
        assert_eq!(v, b"\xff\xff\xff\x7f".as_ref());

        v.clear();
        assert!(write_variable_length(268_435_456, &mut v).is_err());
    }

    #[test]
    fn test_var_int_len() {
        assert_eq!(var_int_len(0), 1);
        assert_eq!(var_int_len(127), 1);
        assert_eq!(var_int_len(128), 2);
        assert_eq!(var_int_len(16_383), 2);
        assert_eq!(var_int_len(16_384), 3);
        assert_eq!(var_int_len(2_097_151), 3);
        assert_eq!(var_int_len(2_097_152), 4);
        assert_eq!(var_int_len(268_435_455), 4);
    }

    #[test]
    fn test_validate_utf8() {
        assert!(validate_utf8(b"").is_ok());
        assert!(validate_utf8("sport/tennis/player1".as_bytes()).is_ok());
        assert!(validate_utf8("temperatur/\u{00fc}bersicht".as_bytes()).is_ok());
        assert!(validate_utf8("\u{4e2d}\u{6587}".as_bytes()).is_ok());
        assert!(validate_utf8("\u{1f600}".as_bytes()).is_ok());

        // embedded NUL and control characters
        assert!(validate_utf8(b"a\x00b").is_err());
        assert!(validate_utf8(b"a\x01b").is_err());
        assert!(validate_utf8(b"a\x1fb").is_err());
        assert!(validate_utf8(b"a\x7fb").is_err());
        assert!(validate_utf8("a\u{0085}b".as_bytes()).is_err());
        assert!(validate_utf8("a\u{009f}b".as_bytes()).is_err());

        // overlong encodings
        assert!(validate_utf8(b"\xc0\x80").is_err());
        assert!(validate_utf8(b"\xc1\xbf").is_err());
        assert!(validate_utf8(b"\xe0\x80\xaf").is_err());
        assert!(validate_utf8(b"\xf0\x80\x80\xaf").is_err());

        // surrogates U+D800..U+DFFF
        assert!(validate_utf8(b"\xed\xa0\x80").is_err());
        assert!(validate_utf8(b"\xed\xbf\xbf").is_err());

        // noncharacters
        assert!(validate_utf8("\u{fdd0}".as_bytes()).is_err());
        assert!(validate_utf8("\u{fdef}".as_bytes()).is_err());
        assert!(validate_utf8(b"\xef\xbf\xbe").is_err()); // U+FFFE
        assert!(validate_utf8(b"\xef\xbf\xbf").is_err()); // U+FFFF
        assert!(validate_utf8(b"\xf0\x9f\xbf\xbf").is_err()); // U+1FFFF

        // truncated and stray continuation bytes
        assert!(validate_utf8(b"\xe4\xb8").is_err());
        assert!(validate_utf8(b"\x80").is_err());

        // beyond U+10FFFF
        assert!(validate_utf8(b"\xf4\x90\x80\x80").is_err());
        assert!(validate_utf8(b"\xf5\x80\x80\x80").is_err());
    }
}
