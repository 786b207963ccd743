//! Reassembly of segmented ISO-TP responses

use log::{debug, warn};

use super::codec::IsoTpSegment;

/// Largest response the reassembler accepts by default
pub const DEFAULT_MAX_MESSAGE_LEN: usize = 512;

/// Largest length a classic ISO-TP first frame can declare (12 bits)
pub const ISO_TP_MAX_LEN: usize = 0x0FFF;

/// Reason a multi frame reception was abandoned or a frame rejected
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReassemblyError {
    /// First frame declared a length above the configured ceiling
    #[error("declared length of {declared} bytes exceeds the {limit} byte limit")]
    Overflow {
        /// Length from the first frame
        declared: u16,
        /// Configured ceiling
        limit: usize,
    },
    /// A consecutive frame arrived out of order
    #[error("expected consecutive frame {expected:X}, received {received:X}")]
    SequenceMismatch {
        /// Sequence number that should have arrived
        expected: u8,
        /// Sequence number that did arrive
        received: u8,
    },
    /// Frame came from an arbitration ID the current request does not expect
    #[error("frame from ID 0x{id:X} was filtered")]
    FilteredFrame {
        /// CAN ID of the frame
        id: u32,
    },
}

/// Result of feeding one segment into the [MessageReassembler]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReassemblyOutcome {
    /// Segment accepted, more consecutive frames are expected
    NeedMore,
    /// Caller must send a flow control frame, then keep polling
    NeedFlowControl,
    /// Message finished
    Complete(Vec<u8>),
    /// Segment ignored (No reception in progress, duplicate, or unknown frame type)
    Discarded,
    /// Reception abandoned
    Error(ReassemblyError),
}

#[derive(Debug, Clone)]
struct ReassemblyState {
    expected_total: u16,
    // (ring index, bytes) in arrival order. The first frame is ring index 0
    rows: Vec<(u8, Vec<u8>)>,
    remaining: i16,
    next_index: u8,
    frames_since_fc: u8,
}

impl ReassemblyState {
    fn last_index(&self) -> u8 {
        self.next_index.wrapping_sub(1) & 0x0F
    }

    fn concat(self) -> Vec<u8> {
        let mut res = Vec::with_capacity(self.expected_total as usize);
        for (_, row) in self.rows {
            res.extend_from_slice(&row);
        }
        res
    }
}

/// State machine rebuilding one response out of ISO-TP segments.
///
/// After a message completes, every further segment is discarded until [MessageReassembler::reset]
/// is called for the next request. This keeps a repeated tail of frames from being glued onto
/// a second copy of the message.
#[derive(Debug, Clone)]
pub struct MessageReassembler {
    state: Option<ReassemblyState>,
    finished: bool,
    max_len: usize,
    block_size: u8,
}

impl Default for MessageReassembler {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MESSAGE_LEN, 0)
    }
}

impl MessageReassembler {
    /// Creates a reassembler.
    ///
    /// ## Parameters
    /// * max_len - Largest message accepted, longer first frames are rejected as
    ///   [ReassemblyError::Overflow]. Capped at [ISO_TP_MAX_LEN]
    /// * block_size - Block size announced in our flow control frames. 0 means the sender
    ///   never waits
    pub fn new(max_len: usize, block_size: u8) -> Self {
        Self {
            state: None,
            finished: false,
            max_len: max_len.min(ISO_TP_MAX_LEN),
            block_size,
        }
    }

    /// Clears any partial message. Called for every new request, on timeout and on suspend
    pub fn reset(&mut self) {
        if let Some(s) = self.state.take() {
            debug!(
                "Dropping partial message, {} of {} bytes missing",
                s.remaining, s.expected_total
            );
        }
        self.finished = false;
    }

    /// True while a multi frame message is being received
    pub fn is_receiving(&self) -> bool {
        self.state.is_some()
    }

    /// Bytes still missing from the message in progress
    pub fn remaining(&self) -> Option<i16> {
        self.state.as_ref().map(|s| s.remaining)
    }

    /// Feeds a decoded segment
    pub fn on_segment(&mut self, seg: IsoTpSegment<'_>) -> ReassemblyOutcome {
        if self.finished {
            debug!("Message already complete, discarding {seg:02X?}");
            return ReassemblyOutcome::Discarded;
        }
        match seg {
            IsoTpSegment::Single { payload, .. } => {
                if self.state.is_some() {
                    warn!("Single frame during multi frame reception, discarding");
                    return ReassemblyOutcome::Discarded;
                }
                self.finished = true;
                ReassemblyOutcome::Complete(payload.to_vec())
            }
            IsoTpSegment::First { total_len, payload } => self.on_first(total_len, payload),
            IsoTpSegment::Consecutive { index, payload } => self.on_consecutive(index, payload),
            IsoTpSegment::Unknown => ReassemblyOutcome::Discarded,
        }
    }

    fn on_first(&mut self, total_len: u16, payload: &[u8]) -> ReassemblyOutcome {
        if self.state.take().is_some() {
            warn!("New first frame before previous message completed, restarting");
        }
        if total_len as usize > self.max_len {
            warn!(
                "First frame declares {total_len} bytes, limit is {}",
                self.max_len
            );
            return ReassemblyOutcome::Error(ReassemblyError::Overflow {
                declared: total_len,
                limit: self.max_len,
            });
        }
        if total_len == 0 {
            return ReassemblyOutcome::Discarded;
        }
        if total_len as usize <= payload.len() {
            // Should have been a single frame, but the data is all here
            self.finished = true;
            return ReassemblyOutcome::Complete(payload[..total_len as usize].to_vec());
        }
        self.state = Some(ReassemblyState {
            expected_total: total_len,
            rows: vec![(0, payload.to_vec())],
            remaining: total_len as i16 - payload.len() as i16,
            next_index: 1,
            frames_since_fc: 0,
        });
        ReassemblyOutcome::NeedFlowControl
    }

    fn on_consecutive(&mut self, index: u8, payload: &[u8]) -> ReassemblyOutcome {
        let Some(state) = self.state.as_mut() else {
            debug!("Consecutive frame {index:X} with no reception in progress, discarding");
            return ReassemblyOutcome::Discarded;
        };
        if index != state.next_index {
            if index == state.last_index() {
                debug!("Duplicate consecutive frame {index:X}, discarding");
                return ReassemblyOutcome::Discarded;
            }
            let expected = state.next_index;
            self.state = None;
            return ReassemblyOutcome::Error(ReassemblyError::SequenceMismatch {
                expected,
                received: index,
            });
        }
        // Trailing padding of the last frame is cut here
        let take = payload.len().min(state.remaining.max(0) as usize);
        state.rows.push((index, payload[..take].to_vec()));
        state.remaining -= take as i16;
        state.next_index = (state.next_index + 1) & 0x0F;
        state.frames_since_fc = state.frames_since_fc.saturating_add(1);

        if state.remaining <= 0 {
            self.finished = true;
            return match self.state.take() {
                Some(s) => ReassemblyOutcome::Complete(s.concat()),
                None => ReassemblyOutcome::Discarded,
            };
        }
        if self.block_size != 0 && state.frames_since_fc >= self.block_size {
            state.frames_since_fc = 0;
            return ReassemblyOutcome::NeedFlowControl;
        }
        ReassemblyOutcome::NeedMore
    }
}
