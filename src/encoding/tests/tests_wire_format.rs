//! Byte-level layout of the primitives that checkpoint structures are built from.

use crate::encoding::*;

// ------------------------------------------------------------------------------------------------
// Integers are little-endian
// ------------------------------------------------------------------------------------------------

#[test]
fn u32_is_little_endian() {
    let bytes = encode_to_vec(&0xDEAD_BEEFu32).unwrap();
    assert_eq!(bytes, [0xEF, 0xBE, 0xAD, 0xDE]);
    assert_eq!(decode_from_slice::<u32>(&bytes).unwrap(), (0xDEAD_BEEF, 4));
}

#[test]
fn u64_is_little_endian() {
    let bytes = encode_to_vec(&0x0102_0304_0506_0708u64).unwrap();
    assert_eq!(bytes, [0x08, 0x07, 0x06, 0x05, 0x04, 0x03, 0x02, 0x01]);
}

#[test]
fn i64_extremes_survive() {
    // LSNs are signed; negative values must not be mangled.
    for val in [0i64, 1, -1, i64::MIN, i64::MAX] {
        let bytes = encode_to_vec(&val).unwrap();
        assert_eq!(decode_from_slice::<i64>(&bytes).unwrap(), (val, 8));
    }
}

#[test]
fn bool_rejects_other_bytes() {
    assert_eq!(encode_to_vec(&true).unwrap(), [1]);
    let err = decode_from_slice::<bool>(&[2]).unwrap_err();
    assert!(matches!(err, EncodingError::InvalidBool(2)));
}

// ------------------------------------------------------------------------------------------------
// Length-prefixed bytes and strings
// ------------------------------------------------------------------------------------------------

#[test]
fn bytes_carry_u32_length_prefix() {
    let bytes = encode_to_vec(&vec![10u8, 20, 30]).unwrap();
    assert_eq!(bytes, [3, 0, 0, 0, 10, 20, 30]);

    // A borrowed slice encodes identically to the owned vector.
    let mut buf = Vec::new();
    [10u8, 20, 30].as_slice().encode_to(&mut buf).unwrap();
    assert_eq!(buf, bytes);
}

#[test]
fn str_and_string_share_layout() {
    let owned = encode_to_vec(&String::from("keys")).unwrap();
    let mut borrowed = Vec::new();
    "keys".encode_to(&mut borrowed).unwrap();
    assert_eq!(owned, borrowed);
    assert_eq!(decode_from_slice::<String>(&owned).unwrap().0, "keys");
}

#[test]
fn string_invalid_utf8() {
    let buf = [2, 0, 0, 0, 0xFF, 0xFE];
    let err = decode_from_slice::<String>(&buf).unwrap_err();
    assert!(matches!(err, EncodingError::InvalidUtf8(_)));
}

// ------------------------------------------------------------------------------------------------
// Option<T> and Vec<T>
// ------------------------------------------------------------------------------------------------

#[test]
fn option_tag_layout() {
    assert_eq!(encode_to_vec(&Some(42u32)).unwrap(), [1, 42, 0, 0, 0]);
    assert_eq!(encode_to_vec(&None::<u32>).unwrap(), [0]);

    let err = decode_from_slice::<Option<u32>>(&[5]).unwrap_err();
    assert!(matches!(err, EncodingError::InvalidTag { tag: 5, .. }));
}

#[test]
fn vec_of_strings_roundtrip() {
    let items = vec!["fileid".to_string(), "count".to_string()];
    let mut buf = Vec::new();
    encode_vec(&items, &mut buf).unwrap();
    let (decoded, consumed) = decode_vec::<String>(&buf).unwrap();
    assert_eq!(decoded, items);
    assert_eq!(consumed, buf.len());
}

// ------------------------------------------------------------------------------------------------
// Truncation
// ------------------------------------------------------------------------------------------------

#[test]
fn decode_u32_truncated() {
    match decode_from_slice::<u32>(&[1, 2]).unwrap_err() {
        EncodingError::UnexpectedEof {
            needed: 4,
            available: 2,
        } => {}
        other => panic!("expected UnexpectedEof, got: {other:?}"),
    }
}

#[test]
fn decode_bytes_truncated_payload() {
    match decode_from_slice::<Vec<u8>>(&[10, 0, 0, 0, 1, 2]).unwrap_err() {
        EncodingError::UnexpectedEof { needed: 10, .. } => {}
        other => panic!("expected UnexpectedEof, got: {other:?}"),
    }
}

#[test]
fn decode_exact_rejects_trailing_bytes() {
    let mut bytes = encode_to_vec(&7u32).unwrap();
    assert_eq!(decode_exact::<u32>(&bytes).unwrap(), 7);

    bytes.push(0);
    let err = decode_exact::<u32>(&bytes).unwrap_err();
    assert!(matches!(err, EncodingError::Custom(_)));
}
