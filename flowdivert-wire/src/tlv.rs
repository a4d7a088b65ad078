//! # Type-Length-Value Records
//!
//! All structured fields on the control channel are TLV records:
//!
//! ```text
//! +------+--------------+-------------------+
//! | type | length (BE)  | value             |
//! | u8   | u32          | `length` bytes    |
//! +------+--------------+-------------------+
//! ```
//!
//! No padding, no alignment. The length field is supplied by the provider
//! and is never trusted: every read checks the declared length against the
//! bytes actually remaining before touching the value.

#![forbid(unsafe_code)]

use crate::error::{Error, Result};
use bytes::BufMut;

/// Size of a record header (type byte + 32-bit length).
pub const TLV_HEADER_LEN: usize = 5;

/// Record type values. These are a private contract with the provider.
pub mod types {
    pub const ERROR_CODE: u8 = 5;
    pub const HOW: u8 = 7;
    pub const READ_COUNT: u8 = 8;
    pub const SPACE_AVAILABLE: u8 = 9;
    pub const CTL_UNIT: u8 = 10;
    pub const LOCAL_ADDR: u8 = 11;
    pub const REMOTE_ADDR: u8 = 12;
    pub const OUT_IF_INDEX: u8 = 13;
    pub const TRAFFIC_CLASS: u8 = 14;
    pub const FLOW_ID: u8 = 16;
    pub const TOKEN_KEY: u8 = 17;
    pub const HMAC: u8 = 18;
    pub const KEY_UNIT: u8 = 19;
    pub const LOG_LEVEL: u8 = 20;
    pub const TARGET_HOSTNAME: u8 = 21;
    pub const TARGET_ADDRESS: u8 = 22;
    pub const TARGET_PORT: u8 = 23;
    pub const CDHASH: u8 = 24;
    pub const SIGNING_ID: u8 = 25;
    pub const AGGREGATE_UNIT: u8 = 26;
    pub const PREFIX_COUNT: u8 = 28;
    pub const FLAGS: u8 = 29;
    pub const FLOW_TYPE: u8 = 30;
    pub const APP_DATA: u8 = 31;
    pub const APP_AUDIT_TOKEN: u8 = 32;
    pub const CFIL_ID: u8 = 36;
    pub const DATAGRAM_SIZE: u8 = 37;
    pub const ORDER: u8 = 38;
    pub const FLOW_STATE: u8 = 39;
    pub const IS_FRAGMENT: u8 = 40;
}

/// Append one record to `buf`.
///
/// Fails without writing anything if the buffer cannot take the whole
/// record.
pub fn append<B: BufMut>(buf: &mut B, ty: u8, value: &[u8]) -> Result<()> {
    let len = u32::try_from(value.len()).map_err(|_| Error::ValueTooLarge(value.len()))?;
    let needed = TLV_HEADER_LEN + value.len();
    let remaining = buf.remaining_mut();
    if remaining < needed {
        return Err(Error::BufferFull { needed, remaining });
    }
    buf.put_u8(ty);
    buf.put_u32(len);
    buf.put_slice(value);
    Ok(())
}

/// Append a big-endian `u32` record.
pub fn append_u32<B: BufMut>(buf: &mut B, ty: u8, value: u32) -> Result<()> {
    append(buf, ty, &value.to_be_bytes())
}

/// Read the header of the record at `offset`, if a complete header is present.
fn header_at(buf: &[u8], offset: usize) -> Option<(u8, u32)> {
    let end = offset.checked_add(TLV_HEADER_LEN)?;
    let header = buf.get(offset..end)?;
    let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]);
    Some((header[0], len))
}

/// Locate a record.
///
/// With `match_next` set, returns the record starting exactly at `start`
/// whatever its type; this is how repeated fields are walked one by one.
/// Otherwise scans forward from `start` and returns the offset of the first
/// record of type `ty`, hopping over others by their declared length.
///
/// Returns `None` when the scan runs off the end of the buffer.
pub fn find(buf: &[u8], start: usize, ty: u8, match_next: bool) -> Option<usize> {
    let mut cursor = start;
    loop {
        let (cur_ty, len) = header_at(buf, cursor)?;
        if match_next || cur_ty == ty {
            return Some(cursor);
        }
        cursor = cursor
            .checked_add(TLV_HEADER_LEN)?
            .checked_add(usize::try_from(len).ok()?)?;
    }
}

/// Borrow the value of the record at `offset`, checking its declared length.
pub fn value_at(buf: &[u8], offset: usize) -> Result<(u8, &[u8])> {
    let (ty, declared) = header_at(buf, offset).ok_or(Error::Truncated {
        needed: TLV_HEADER_LEN,
        remaining: buf.len().saturating_sub(offset),
    })?;
    let value_start = offset + TLV_HEADER_LEN;
    let remaining = buf.len() - value_start;
    let len = declared as usize;
    if len > remaining {
        return Err(Error::LengthOverflow {
            ty,
            declared,
            remaining,
        });
    }
    Ok((ty, &buf[value_start..value_start + len]))
}

/// Total encoded size of the record at `offset` (header + value).
pub fn record_len(buf: &[u8], offset: usize) -> Result<usize> {
    let (_, value) = value_at(buf, offset)?;
    Ok(TLV_HEADER_LEN + value.len())
}

/// Copy the value of the first record of type `ty` at or after `offset`.
///
/// `out` is zero-filled first, then receives up to `out.len()` bytes of the
/// value. Returns the declared value length, which may exceed `out.len()`.
pub fn get(buf: &[u8], offset: usize, ty: u8, out: &mut [u8]) -> Result<usize> {
    let at = find(buf, offset, ty, false).ok_or(Error::MissingField(ty))?;
    let (_, value) = value_at(buf, at)?;
    out.fill(0);
    let n = value.len().min(out.len());
    out[..n].copy_from_slice(&value[..n]);
    Ok(value.len())
}

/// Borrow the value of the first record of type `ty` at or after `offset`.
pub fn get_slice(buf: &[u8], offset: usize, ty: u8) -> Result<&[u8]> {
    let at = find(buf, offset, ty, false).ok_or(Error::MissingField(ty))?;
    value_at(buf, at).map(|(_, value)| value)
}

/// Read a big-endian `u32` record.
pub fn get_u32(buf: &[u8], offset: usize, ty: u8) -> Result<u32> {
    let value = get_slice(buf, offset, ty)?;
    be_u32(ty, value)
}

pub(crate) fn be_u32(ty: u8, value: &[u8]) -> Result<u32> {
    let raw: [u8; 4] = value.try_into().map_err(|_| Error::BadValue {
        ty,
        reason: "expected 4 bytes",
    })?;
    Ok(u32::from_be_bytes(raw))
}

/// Iterator over consecutive records in a buffer.
///
/// Yields `(type, value)` pairs. A record whose declared length runs past
/// the end yields one `Err` and ends the iteration.
#[derive(Debug, Clone)]
pub struct Records<'a> {
    buf: &'a [u8],
    offset: usize,
    failed: bool,
}

impl<'a> Records<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self::starting_at(buf, 0)
    }

    pub fn starting_at(buf: &'a [u8], offset: usize) -> Self {
        Self {
            buf,
            offset,
            failed: false,
        }
    }

    /// Offset of the next record to be yielded.
    pub fn offset(&self) -> usize {
        self.offset
    }
}

impl<'a> Iterator for Records<'a> {
    type Item = Result<(u8, &'a [u8])>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.offset >= self.buf.len() {
            return None;
        }
        match value_at(self.buf, self.offset) {
            Ok((ty, value)) => {
                self.offset += TLV_HEADER_LEN + value.len();
                Some(Ok((ty, value)))
            }
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn test_append_layout() {
        let mut buf = BytesMut::new();
        append(&mut buf, types::ERROR_CODE, &[0xAA, 0xBB]).unwrap();
        assert_eq!(&buf[..], &[5, 0, 0, 0, 2, 0xAA, 0xBB]);
    }

    #[test]
    fn test_append_into_fixed_slice_fails_when_full() {
        let mut storage = [0u8; 6];
        let mut slice = &mut storage[..];
        let err = append(&mut slice, types::HOW, &[1, 2]).unwrap_err();
        assert_eq!(
            err,
            Error::BufferFull {
                needed: 7,
                remaining: 6
            }
        );
        assert_eq!(storage, [0u8; 6]);
    }

    #[test]
    fn test_find_skips_other_records() {
        let mut buf = BytesMut::new();
        append(&mut buf, types::HOW, &[0; 3]).unwrap();
        append(&mut buf, types::FLAGS, &[0; 1]).unwrap();
        append_u32(&mut buf, types::ERROR_CODE, 61).unwrap();

        assert_eq!(find(&buf, 0, types::ERROR_CODE, false), Some(14));
        assert_eq!(find(&buf, 0, types::FLAGS, false), Some(8));
        assert_eq!(find(&buf, 0, types::CTL_UNIT, false), None);
    }

    #[test]
    fn test_find_match_next_returns_record_at_offset() {
        let mut buf = BytesMut::new();
        append(&mut buf, types::HOW, &[0; 3]).unwrap();
        append(&mut buf, types::FLAGS, &[0; 1]).unwrap();

        assert_eq!(find(&buf, 8, types::SIGNING_ID, true), Some(8));
        assert_eq!(find(&buf, 14, types::SIGNING_ID, true), None);
    }

    #[test]
    fn test_get_zero_fills_and_truncates() {
        let mut buf = BytesMut::new();
        append(&mut buf, types::APP_DATA, b"abcdef").unwrap();

        let mut small = [0xFFu8; 4];
        assert_eq!(get(&buf, 0, types::APP_DATA, &mut small).unwrap(), 6);
        assert_eq!(&small, b"abcd");

        let mut large = [0xFFu8; 8];
        assert_eq!(get(&buf, 0, types::APP_DATA, &mut large).unwrap(), 6);
        assert_eq!(&large, b"abcdef\0\0");
    }

    #[test]
    fn test_get_rejects_overlong_declared_length() {
        let mut raw = vec![types::APP_DATA, 0xFF, 0xFF, 0xFF, 0xFF];
        raw.extend_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8, 9, 10]);

        let mut out = [0u8; 64];
        let err = get(&raw, 0, types::APP_DATA, &mut out).unwrap_err();
        assert_eq!(
            err,
            Error::LengthOverflow {
                ty: types::APP_DATA,
                declared: u32::MAX,
                remaining: 10
            }
        );
        assert!(out.iter().all(|b| *b == 0));
    }

    #[test]
    fn test_get_u32_requires_four_bytes() {
        let mut buf = BytesMut::new();
        append(&mut buf, types::ERROR_CODE, &[1, 2]).unwrap();
        assert!(matches!(
            get_u32(&buf, 0, types::ERROR_CODE),
            Err(Error::BadValue { .. })
        ));
    }

    #[test]
    fn test_records_iterator_stops_on_overflow() {
        let mut buf = BytesMut::new();
        append(&mut buf, types::HOW, &[1]).unwrap();
        buf.extend_from_slice(&[types::FLAGS, 0, 0, 1, 0]);

        let mut records = Records::new(&buf);
        assert_eq!(records.next().unwrap().unwrap(), (types::HOW, &[1u8][..]));
        assert!(records.next().unwrap().is_err());
        assert!(records.next().is_none());
    }
}
