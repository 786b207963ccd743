//! When parsing ECU response data from raw bytes,
//! Some functions in here can be useful with data transformation.
//!
//! All field extraction is bounds checked and returns `None` instead of
//! reading past the end of a response.

use automotive_diag::ByteWrapper::Standard;
use automotive_diag::uds::{UdsError, UdsErrorByte};

/// First byte of every UDS / KWP negative response
pub const NEGATIVE_RESPONSE_SID: u8 = 0x7F;

/// Decodes a hex string such as `"220105"` into bytes.
///
/// Returns `None` if the string has an odd length or contains non hex characters
pub fn hex_to_bytes(input: &str) -> Option<Vec<u8>> {
    let raw = input.as_bytes();
    if raw.len() % 2 != 0 {
        return None;
    }
    raw.chunks(2)
        .map(|pair| Some(hex_nibble(pair[0])? << 4 | hex_nibble(pair[1])?))
        .collect()
}

/// Formats bytes as an upper case hex string without separators
pub fn bytes_to_hex(input: &[u8]) -> String {
    let mut res = String::with_capacity(input.len() * 2);
    for b in input {
        res.push_str(&format!("{b:02X}"));
    }
    res
}

pub(crate) fn hex_nibble(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

/// Reads a big endian u16 at `offset`
pub fn be_u16(data: &[u8], offset: usize) -> Option<u16> {
    let b = data.get(offset..offset.checked_add(2)?)?;
    Some(u16::from_be_bytes([b[0], b[1]]))
}

/// Reads a little endian u16 at `offset`
pub fn le_u16(data: &[u8], offset: usize) -> Option<u16> {
    let b = data.get(offset..offset.checked_add(2)?)?;
    Some(u16::from_le_bytes([b[0], b[1]]))
}

/// Reads a big endian i16 at `offset`
pub fn be_i16(data: &[u8], offset: usize) -> Option<i16> {
    be_u16(data, offset).map(|v| v as i16)
}

/// Reads a big endian u32 at `offset`
pub fn be_u32(data: &[u8], offset: usize) -> Option<u32> {
    let b = data.get(offset..offset.checked_add(4)?)?;
    Some(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
}

/// Reads a little endian u32 at `offset`
pub fn le_u32(data: &[u8], offset: usize) -> Option<u32> {
    let b = data.get(offset..offset.checked_add(4)?)?;
    Some(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

/// If `resp` is a negative response (`7F <sid> <nrc>`), returns the rejected
/// service ID and the decoded negative response code
pub fn negative_response(resp: &[u8]) -> Option<(u8, UdsErrorByte)> {
    match resp {
        [NEGATIVE_RESPONSE_SID, sid, nrc, ..] => Some((*sid, UdsErrorByte::from(*nrc))),
        _ => None,
    }
}

/// Checks if the ECU answered with 'request correctly received, response pending'.
/// The real answer will follow on the same ID
pub fn is_response_pending(resp: &[u8]) -> bool {
    matches!(
        negative_response(resp),
        Some((_, Standard(UdsError::RequestCorrectlyReceivedResponsePending)))
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_round_trip() {
        assert_eq!(Some(vec![0x22, 0x01, 0x05]), hex_to_bytes("220105"));
        assert_eq!(Some(vec![0xAB, 0xCD]), hex_to_bytes("abCD"));
        assert_eq!("220105", bytes_to_hex(&[0x22, 0x01, 0x05]));
        assert_eq!(None, hex_to_bytes("2201F"));
        assert_eq!(None, hex_to_bytes("22G1"));
        assert_eq!(Some(vec![]), hex_to_bytes(""));
    }

    #[test]
    fn test_field_extraction_bounds() {
        let d = [0x62, 0x01, 0x05, 0xFF, 0x38];
        assert_eq!(Some(0x0105), be_u16(&d, 1));
        assert_eq!(Some(0x0501), le_u16(&d, 1));
        assert_eq!(Some(-200), be_i16(&d, 3));
        assert_eq!(None, be_u16(&d, 4));
        assert_eq!(Some(0x6201_05FF), be_u32(&d, 0));
        assert_eq!(None, le_u32(&d, 2));
        assert_eq!(None, be_u32(&d, usize::MAX));
    }

    #[test]
    fn test_response_pending() {
        assert!(is_response_pending(&[0x7F, 0x22, 0x78]));
        assert!(!is_response_pending(&[0x7F, 0x22, 0x31]));
        assert!(!is_response_pending(&[0x62, 0x01, 0x05]));
        assert!(negative_response(&[0x7F, 0x22]).is_none());
    }
}
