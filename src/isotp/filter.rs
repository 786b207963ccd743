//! Arbitration ID filtering of received frames
//!
//! Several ECUs usually share the diagnostic bus and happily answer on overlapping IDs.
//! Only frames from the ECU addressed by the current request are handed to the reassembler,
//! plus whatever the vehicle profile explicitly allows.

use super::{
    codec::{IsoTpSegment, decode_segment},
    reassembler::ReassemblyError,
};
use crate::{channel::RawFrame, helpers::NEGATIVE_RESPONSE_SID};

/// Standard offset between a request ID and its response ID (0x7E0 -> 0x7E8)
pub const DEFAULT_RESPONSE_OFFSET: u32 = 8;

/// 11bit functional (broadcast) OBD request ID
pub const OBD_FUNCTIONAL_ID: u32 = 0x7DF;

const OBD_RESPONSE_IDS: std::ops::RangeInclusive<u32> = 0x7E8..=0x7EF;

const NORMAL_FIXED_MASK: u32 = 0x1FFF_0000;
const NORMAL_FIXED_PHYSICAL: u32 = 0x18DA_0000;

/// An exception to the response ID rule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AllowedResponse {
    /// Only applies while this target is selected. `None` applies to every target
    pub target: Option<u32>,
    /// ID the frame may arrive on
    pub rx_id: u32,
    /// Only accept negative responses (`7F ..`) from this ID
    pub negative_only: bool,
}

/// Per vehicle response filter
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ResponseFilter {
    /// Added to an 11bit request ID to get the response ID
    pub response_offset: u32,
    /// Extra IDs accepted on top of the expected response ID
    pub allow_list: Vec<AllowedResponse>,
}

impl Default for ResponseFilter {
    fn default() -> Self {
        Self {
            response_offset: DEFAULT_RESPONSE_OFFSET,
            allow_list: Vec::new(),
        }
    }
}

impl ResponseFilter {
    /// Adds an exception to the filter
    pub fn allow(mut self, entry: AllowedResponse) -> Self {
        self.allow_list.push(entry);
        self
    }

    /// ID the ECU addressed by `target` answers on.
    ///
    /// 29bit IDs using normal fixed addressing (`18DA<ecu><tester>`) answer with source and
    /// target swapped, everything else answers on `target + response_offset`
    pub fn expected_id(&self, target: u32) -> u32 {
        if target & NORMAL_FIXED_MASK == NORMAL_FIXED_PHYSICAL {
            let ecu = (target >> 8) & 0xFF;
            let tester = target & 0xFF;
            NORMAL_FIXED_PHYSICAL | (tester << 8) | ecu
        } else {
            target.wrapping_add(self.response_offset)
        }
    }

    /// Checks if `frame` may be handed to the reassembler while `target` is selected
    pub fn accepts(&self, target: u32, frame: &RawFrame, leading_offset: usize) -> bool {
        if frame.id() == self.expected_id(target) {
            return true;
        }
        // Every emission related ECU may answer a functional request
        if target == OBD_FUNCTIONAL_ID && OBD_RESPONSE_IDS.contains(&frame.id()) {
            return true;
        }
        self.allow_list.iter().any(|e| {
            e.rx_id == frame.id()
                && e.target.is_none_or(|t| t == target)
                && (!e.negative_only || is_negative_frame(frame, leading_offset))
        })
    }
}

impl ResponseFilter {
    /// Same as [ResponseFilter::accepts], reporting rejected frames as
    /// [ReassemblyError::FilteredFrame]
    pub fn check(
        &self,
        target: u32,
        frame: &RawFrame,
        leading_offset: usize,
    ) -> Result<(), ReassemblyError> {
        if self.accepts(target, frame, leading_offset) {
            Ok(())
        } else {
            Err(ReassemblyError::FilteredFrame { id: frame.id() })
        }
    }

    /// ID flow control for a message arriving on `rx_id` is sent to. A functional request
    /// is answered by one physical ECU, which expects flow control on its own request ID
    pub fn flow_control_id(&self, target: u32, rx_id: u32) -> u32 {
        if target == OBD_FUNCTIONAL_ID && OBD_RESPONSE_IDS.contains(&rx_id) {
            rx_id.wrapping_sub(self.response_offset)
        } else {
            target
        }
    }
}

fn is_negative_frame(frame: &RawFrame, leading_offset: usize) -> bool {
    matches!(
        decode_segment(frame.data(), leading_offset),
        IsoTpSegment::Single { payload: [NEGATIVE_RESPONSE_SID, ..], .. }
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expected_id() {
        let f = ResponseFilter::default();
        assert_eq!(0x7EC, f.expected_id(0x7E4));
        assert_eq!(0x7BB, f.expected_id(0x7B3));
        assert_eq!(0x18DAF1DA, f.expected_id(0x18DADAF1));
    }

    #[test]
    fn test_foreign_frames_rejected() {
        let f = ResponseFilter::default();
        assert!(f.accepts(0x7E4, &RawFrame::new(0x7EC, &[0x02, 0x61, 0x01], false), 0));
        assert!(!f.accepts(0x7E4, &RawFrame::new(0x7EA, &[0x02, 0x61, 0x01], false), 0));
        assert!(!f.accepts(0x7E4, &RawFrame::new(0x7E4, &[0x02, 0x21, 0x01], false), 0));
        assert_eq!(
            Err(ReassemblyError::FilteredFrame { id: 0x7EA }),
            f.check(0x7E4, &RawFrame::new(0x7EA, &[0x02, 0x61, 0x01], false), 0)
        );
    }

    #[test]
    fn test_functional_request() {
        let f = ResponseFilter::default();
        assert!(f.accepts(0x7DF, &RawFrame::new(0x7E8, &[0x03, 0x41, 0x0D, 0x20], false), 0));
        assert!(f.accepts(0x7DF, &RawFrame::new(0x7EB, &[0x03, 0x41, 0x0D, 0x20], false), 0));
        assert!(!f.accepts(0x7DF, &RawFrame::new(0x7F0, &[0x03, 0x41, 0x0D, 0x20], false), 0));

        assert_eq!(0x7E0, f.flow_control_id(0x7DF, 0x7E8));
        assert_eq!(0x7E1, f.flow_control_id(0x7DF, 0x7E9));
        assert_eq!(0x7E4, f.flow_control_id(0x7E4, 0x7EC));
        assert_eq!(0x18DADAF1, f.flow_control_id(0x18DADAF1, 0x18DAF1DA));
    }

    #[test]
    fn test_allow_list() {
        let f = ResponseFilter::default()
            .allow(AllowedResponse {
                target: Some(0x7DF),
                rx_id: 0x7EA,
                negative_only: false,
            })
            .allow(AllowedResponse {
                target: None,
                rx_id: 0x7E9,
                negative_only: true,
            });
        let vin = RawFrame::new(0x7EA, &[0x10, 0x14, 0x49, 0x02, 0x01, 0x4B, 0x4D, 0x48], false);
        assert!(f.accepts(0x7DF, &vin, 0));
        assert!(!f.accepts(0x7E4, &vin, 0));

        let nrc = RawFrame::new(0x7E9, &[0x03, 0x7F, 0x22, 0x31], false);
        let positive = RawFrame::new(0x7E9, &[0x03, 0x62, 0x01, 0x01], false);
        assert!(f.accepts(0x7E4, &nrc, 0));
        assert!(!f.accepts(0x7E4, &positive, 0));
    }
}
