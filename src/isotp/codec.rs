//! Conversion between raw CAN payloads and ISO-TP segments

use crate::{helpers, queue::Command};

/// Filler used for unused bytes of a transmitted frame
pub const PADDING_BYTE: u8 = 0x00;

/// PCI byte of a 'continue to send' flow control frame
pub const FLOW_CONTROL_CTS: u8 = 0x30;

/// Error produced when building a request frame
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    /// The request is not a valid hex string
    #[error("request '{0}' is not valid hex")]
    InvalidHex(String),
    /// The request does not fit into a single frame
    #[error("request is {len} bytes, single frame limit is {max}")]
    RequestTooLong {
        /// Payload length of the request
        len: usize,
        /// Maximum payload for the chosen layout
        max: usize,
    },
    /// Empty request
    #[error("request is empty")]
    EmptyRequest,
}

/// One ISO-TP segment carried by a CAN frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsoTpSegment<'a> {
    /// Complete message in one frame
    Single {
        /// Declared payload length
        len: u8,
        /// Payload, already cut to `len`
        payload: &'a [u8],
    },
    /// First frame of a segmented message
    First {
        /// Declared length of the whole message
        total_len: u16,
        /// Bytes carried by the first frame
        payload: &'a [u8],
    },
    /// Continuation of a segmented message
    Consecutive {
        /// Sequence number (0-15)
        index: u8,
        /// Bytes carried by the frame, possibly padded
        payload: &'a [u8],
    },
    /// Anything the engine does not understand (Flow control, reserved PCI types, truncated
    /// frames)
    Unknown,
}

/// Decodes the ISO-TP header of a frame payload.
///
/// `leading_offset` is the number of vehicle specific bytes in front of the PCI byte (0 or 1).
/// This function never panics. Malformed input maps to [IsoTpSegment::Unknown]
pub fn decode_segment(payload: &[u8], leading_offset: usize) -> IsoTpSegment<'_> {
    let Some(body) = payload.get(leading_offset..) else {
        return IsoTpSegment::Unknown;
    };
    let Some((&pci, rest)) = body.split_first() else {
        return IsoTpSegment::Unknown;
    };
    match pci >> 4 {
        0x0 => {
            let len = pci & 0x0F;
            match rest.get(..len as usize) {
                Some(payload) if len != 0 => IsoTpSegment::Single { len, payload },
                _ => IsoTpSegment::Unknown,
            }
        }
        0x1 => match rest.split_first() {
            Some((&len_low, payload)) => IsoTpSegment::First {
                total_len: ((pci as u16 & 0x0F) << 8) | len_low as u16,
                payload,
            },
            None => IsoTpSegment::Unknown,
        },
        0x2 => IsoTpSegment::Consecutive {
            index: pci & 0x0F,
            payload: rest,
        },
        _ => IsoTpSegment::Unknown,
    }
}

/// Builds the single frame carrying `cmd`.
///
/// Layout is `[leading_char?, len, payload..]`, zero padded to 8 bytes.
pub fn encode_request(cmd: &Command, leading_char: Option<u8>) -> Result<[u8; 8], FrameError> {
    let payload = helpers::hex_to_bytes(cmd.request())
        .ok_or_else(|| FrameError::InvalidHex(cmd.request().to_string()))?;
    encode_single_frame(&payload, leading_char)
}

/// Builds a single frame from raw bytes. See [encode_request]
pub fn encode_single_frame(
    payload: &[u8],
    leading_char: Option<u8>,
) -> Result<[u8; 8], FrameError> {
    if payload.is_empty() {
        return Err(FrameError::EmptyRequest);
    }
    let header = usize::from(leading_char.is_some());
    let max = 7 - header;
    if payload.len() > max {
        return Err(FrameError::RequestTooLong {
            len: payload.len(),
            max,
        });
    }
    let mut tx = [PADDING_BYTE; 8];
    if let Some(c) = leading_char {
        tx[0] = c;
    }
    tx[header] = payload.len() as u8;
    tx[header + 1..header + 1 + payload.len()].copy_from_slice(payload);
    Ok(tx)
}

/// Builds the `0x30` continue to send flow control frame
pub fn encode_flow_control(
    block_size: u8,
    separation_ms: u8,
    leading_char: Option<u8>,
) -> [u8; 8] {
    let mut tx = [PADDING_BYTE; 8];
    let header = match leading_char {
        Some(c) => {
            tx[0] = c;
            1
        }
        None => 0,
    };
    tx[header] = FLOW_CONTROL_CTS;
    tx[header + 1] = block_size;
    tx[header + 2] = separation_ms;
    tx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_never_panics() {
        // Every 0-3 byte combination plus every PCI byte with both offsets
        for pci in 0..=0xFFu8 {
            for len in 0..=8usize {
                let mut buf = vec![0xAAu8; len];
                if let Some(b) = buf.first_mut() {
                    *b = pci;
                }
                let _ = decode_segment(&buf, 0);
                let _ = decode_segment(&buf, 1);
                let _ = decode_segment(&buf, 9);
            }
        }
    }

    #[test]
    fn test_decode_single() {
        let seg = decode_segment(&[0x03, 0x62, 0x01, 0x05, 0, 0, 0, 0], 0);
        assert_eq!(
            IsoTpSegment::Single {
                len: 3,
                payload: &[0x62, 0x01, 0x05]
            },
            seg
        );
        // Length claims more than the frame carries
        assert_eq!(IsoTpSegment::Unknown, decode_segment(&[0x07, 0x62, 0x01], 0));
        assert_eq!(IsoTpSegment::Unknown, decode_segment(&[0x00, 0x62], 0));
    }

    #[test]
    fn test_decode_first_and_consecutive() {
        let seg = decode_segment(&[0x10, 0x14, 1, 2, 3, 4, 5, 6], 0);
        assert_eq!(
            IsoTpSegment::First {
                total_len: 20,
                payload: &[1, 2, 3, 4, 5, 6]
            },
            seg
        );
        let seg = decode_segment(&[0x1F, 0xFF, 1], 0);
        assert!(matches!(seg, IsoTpSegment::First { total_len: 4095, .. }));
        let seg = decode_segment(&[0x2A, 9, 9], 0);
        assert_eq!(
            IsoTpSegment::Consecutive {
                index: 0x0A,
                payload: &[9, 9]
            },
            seg
        );
        assert_eq!(IsoTpSegment::Unknown, decode_segment(&[0x10], 0));
        assert_eq!(IsoTpSegment::Unknown, decode_segment(&[0x30, 0, 0], 0));
    }

    #[test]
    fn test_decode_with_leading_char() {
        let seg = decode_segment(&[0xF1, 0x02, 0x50, 0x03], 1);
        assert_eq!(
            IsoTpSegment::Single {
                len: 2,
                payload: &[0x50, 0x03]
            },
            seg
        );
        assert_eq!(IsoTpSegment::Unknown, decode_segment(&[0xF1], 1));
    }

    #[test]
    fn test_single_frame_round_trip() {
        for req in ["22", "220105", "2101", "22B00201", "1A80AABBCC"] {
            let cmd = Command::new(0xC6, req);
            let bytes = helpers::hex_to_bytes(req).unwrap();

            let tx = encode_request(&cmd, None).unwrap();
            match decode_segment(&tx, 0) {
                IsoTpSegment::Single { payload, .. } => assert_eq!(bytes.as_slice(), payload),
                other => panic!("Unexpected segment {other:?}"),
            }

            let tx = encode_request(&cmd, Some(cmd.start_char())).unwrap();
            assert_eq!(0xC6, tx[0]);
            match decode_segment(&tx, 1) {
                IsoTpSegment::Single { payload, .. } => assert_eq!(bytes.as_slice(), payload),
                other => panic!("Unexpected segment {other:?}"),
            }
        }
    }

    #[test]
    fn test_encode_request_layout() {
        let tx = encode_request(&Command::new(0, "220105"), None).unwrap();
        assert_eq!([0x03, 0x22, 0x01, 0x05, 0, 0, 0, 0], tx);
        assert_eq!(
            Err(FrameError::InvalidHex("ATZ".into())),
            encode_request(&Command::new(0, "ATZ"), None)
        );
        assert_eq!(
            Err(FrameError::RequestTooLong { len: 7, max: 6 }),
            encode_single_frame(&[0; 7], Some(0xAA))
        );
        assert_eq!(Err(FrameError::EmptyRequest), encode_single_frame(&[], None));
    }

    #[test]
    fn test_flow_control_layout() {
        assert_eq!([0x30, 0x08, 0x14, 0, 0, 0, 0, 0], encode_flow_control(8, 20, None));
        assert_eq!([0xC6, 0x30, 0, 0, 0, 0, 0, 0], encode_flow_control(0, 0, Some(0xC6)));
    }
}
