//! TLV record tests over realistic buffers.

use bytes::BytesMut;
use flowdivert_wire::tlv::{self, types, Records};
use flowdivert_wire::Error;

#[test]
fn test_get_returns_appended_value_for_many_lengths() {
    for len in [0usize, 1, 3, 4, 5, 63, 255, 256, 4096] {
        let value: Vec<u8> = (0..len).map(|i| (i * 31 % 251) as u8).collect();
        let mut buf = BytesMut::new();
        tlv::append(&mut buf, types::HOW, b"x").unwrap();
        tlv::append(&mut buf, types::APP_DATA, &value).unwrap();

        let mut out = vec![0u8; len];
        assert_eq!(tlv::get(&buf, 0, types::APP_DATA, &mut out).unwrap(), len);
        assert_eq!(out, value);
    }
}

#[test]
fn test_repeated_records_walked_with_match_next() {
    let mut buf = BytesMut::new();
    tlv::append_u32(&mut buf, types::PREFIX_COUNT, 1).unwrap();
    for id in ["a", "bb", "ccc"] {
        tlv::append(&mut buf, types::SIGNING_ID, id.as_bytes()).unwrap();
    }

    let mut seen = Vec::new();
    let mut cursor = tlv::find(&buf, 0, types::SIGNING_ID, false);
    while let Some(at) = cursor {
        let (_, value) = tlv::value_at(&buf, at).unwrap();
        seen.push(String::from_utf8(value.to_vec()).unwrap());
        cursor = tlv::find(&buf, at + tlv::record_len(&buf, at).unwrap(), 0, true);
    }
    assert_eq!(seen, vec!["a", "bb", "ccc"]);
}

#[test]
fn test_truncated_header_is_not_a_record() {
    let raw = [types::ERROR_CODE, 0, 0];
    assert_eq!(tlv::find(&raw, 0, types::ERROR_CODE, false), None);
    assert!(matches!(
        tlv::value_at(&raw, 0),
        Err(Error::Truncated { .. })
    ));
}

#[test]
fn test_find_survives_huge_skip_lengths() {
    // A non-matching record whose length would jump far past the end.
    let raw = [types::HOW, 0xFF, 0xFF, 0xFF, 0xF0, 1, 2, 3];
    assert_eq!(tlv::find(&raw, 0, types::ERROR_CODE, false), None);
}

#[test]
fn test_records_offset_tracks_consumption() {
    let mut buf = BytesMut::new();
    tlv::append_u32(&mut buf, types::ERROR_CODE, 0).unwrap();
    tlv::append(&mut buf, types::IS_FRAGMENT, &[1]).unwrap();

    let mut records = Records::new(&buf);
    records.next().unwrap().unwrap();
    assert_eq!(records.offset(), 9);
    records.next().unwrap().unwrap();
    assert_eq!(records.offset(), buf.len());
    assert!(records.next().is_none());
}
