//! Simulated CAN link for unit testing the engine without a vehicle
//!
//! [SimulatedLink] behaves like an ECU answering scripted requests. Multi frame responses
//! are held back until the engine sends a flow control frame, the same way a real ECU does.
//! Clones share the same state, so a test can keep a handle while the engine owns the link.

use std::{
    collections::VecDeque,
    sync::{Arc, PoisonError, RwLock, RwLockWriteGuard},
};

use crate::{
    channel::{LinkDriver, LinkError, LinkMode, LinkResult, RawFrame},
    isotp::{codec::FLOW_CONTROL_CTS, filter::DEFAULT_RESPONSE_OFFSET},
    sink::ResponseSink,
};

#[derive(Debug, Clone)]
struct ScriptEntry {
    tx_id: u32,
    request_prefix: Vec<u8>,
    rx_id: u32,
    frames: Vec<RawFrame>,
}

#[derive(Debug)]
struct SimState {
    script: Vec<ScriptEntry>,
    rx_queue: VecDeque<RawFrame>,
    // (request ID, response ID, frames waiting for flow control)
    held: Vec<(u32, u32, VecDeque<RawFrame>)>,
    sent: Vec<RawFrame>,
    mode: LinkMode,
    is_open: bool,
    open_calls: usize,
    open_failures: usize,
    send_failures: usize,
    leading_offset: usize,
}

impl Default for SimState {
    fn default() -> Self {
        Self {
            script: Vec::new(),
            rx_queue: VecDeque::new(),
            held: Vec::new(),
            sent: Vec::new(),
            mode: LinkMode::Sleep,
            is_open: false,
            open_calls: 0,
            open_failures: 0,
            send_failures: 0,
            leading_offset: 0,
        }
    }
}

/// Scripted ECU on a simulated bus
#[derive(Debug, Clone, Default)]
pub struct SimulatedLink {
    state: Arc<RwLock<SimState>>,
}

impl SimulatedLink {
    /// Creates a link with an empty script
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> RwLockWriteGuard<'_, SimState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Answers every frame sent to `tx_id` starting with `request_prefix` with `payload`,
    /// segmented into ISO-TP frames on `rx_id`
    pub fn add_response(&self, tx_id: u32, request_prefix: &[u8], rx_id: u32, payload: &[u8]) {
        let frames = segment_response(rx_id, payload, None);
        self.add_raw_response(tx_id, request_prefix, rx_id, frames);
    }

    /// Same as [SimulatedLink::add_response] with prebuilt response frames. Everything after
    /// the first frame is held until flow control is received
    pub fn add_raw_response(
        &self,
        tx_id: u32,
        request_prefix: &[u8],
        rx_id: u32,
        frames: Vec<RawFrame>,
    ) {
        self.state().script.push(ScriptEntry {
            tx_id,
            request_prefix: request_prefix.to_vec(),
            rx_id,
            frames,
        });
    }

    /// Vehicle sends one extra byte in front of the ISO-TP header
    pub fn set_additional_start_char(&self, enabled: bool) {
        self.state().leading_offset = usize::from(enabled);
    }

    /// Removes every scripted response and pending frame
    pub fn clear(&self) {
        let mut s = self.state();
        s.script.clear();
        s.rx_queue.clear();
        s.held.clear();
    }

    /// Places an unsolicited frame on the bus
    pub fn push_frame(&self, frame: RawFrame) {
        self.state().rx_queue.push_back(frame);
    }

    /// Every frame sent by the engine so far, flow control included
    pub fn sent_frames(&self) -> Vec<RawFrame> {
        self.state().sent.clone()
    }

    /// Number of [LinkDriver::open] calls
    pub fn open_calls(&self) -> usize {
        self.state().open_calls
    }

    /// Makes the next `count` open attempts fail
    pub fn fail_next_opens(&self, count: usize) {
        self.state().open_failures = count;
    }

    /// Makes the next `count` transmissions fail
    pub fn fail_next_sends(&self, count: usize) {
        self.state().send_failures = count;
    }

    /// Current controller mode
    pub fn mode(&self) -> LinkMode {
        self.state().mode
    }

    /// True between a successful open and close
    pub fn is_open(&self) -> bool {
        self.state().is_open
    }
}

impl LinkDriver for SimulatedLink {
    fn open(&mut self) -> LinkResult<()> {
        let mut s = self.state();
        s.open_calls += 1;
        if s.open_failures > 0 {
            s.open_failures -= 1;
            return Err(LinkError::InitFailed("simulated controller did not respond".into()));
        }
        s.is_open = true;
        s.mode = LinkMode::Normal;
        Ok(())
    }

    fn close(&mut self) -> LinkResult<()> {
        let mut s = self.state();
        s.is_open = false;
        s.mode = LinkMode::Sleep;
        s.rx_queue.clear();
        s.held.clear();
        Ok(())
    }

    fn send_frame(&mut self, id: u32, extended: bool, data: [u8; 8]) -> LinkResult<()> {
        let mut s = self.state();
        if !s.is_open || s.mode == LinkMode::Sleep {
            return Err(LinkError::NotOpen);
        }
        if s.send_failures > 0 {
            s.send_failures -= 1;
            return Err(LinkError::NotAcknowledged);
        }
        s.sent.push(RawFrame::new(id, &data, extended));

        if data.get(s.leading_offset) == Some(&FLOW_CONTROL_CTS) {
            // After a functional request the ECU expects flow control on its physical ID
            let physical = |rx: u32| rx.wrapping_sub(DEFAULT_RESPONSE_OFFSET);
            if let Some(idx) = s
                .held
                .iter()
                .position(|(tx, rx, _)| *tx == id || physical(*rx) == id)
            {
                let (_, _, frames) = s.held.remove(idx);
                s.rx_queue.extend(frames);
            }
            return Ok(());
        }

        let matched = s
            .script
            .iter()
            .find(|e| e.tx_id == id && data.starts_with(&e.request_prefix))
            .cloned();
        if let Some(entry) = matched {
            let mut frames: VecDeque<RawFrame> = entry.frames.into_iter().collect();
            if let Some(first) = frames.pop_front() {
                s.rx_queue.push_back(first);
            }
            if !frames.is_empty() {
                log::trace!(
                    "Holding {} frames from {:X} until flow control",
                    frames.len(),
                    entry.rx_id
                );
                s.held.push((id, entry.rx_id, frames));
            }
        }
        Ok(())
    }

    fn poll_frame(&mut self) -> Option<RawFrame> {
        self.state().rx_queue.pop_front()
    }

    fn set_mode(&mut self, mode: LinkMode) -> LinkResult<()> {
        self.state().mode = mode;
        Ok(())
    }
}

/// Splits `payload` into the ISO-TP frames an ECU would answer with
///
/// ## Parameters
/// * rx_id - ID the ECU answers on
/// * payload - Complete response
/// * leading_char - Optional vehicle specific byte in front of every PCI byte
pub fn segment_response(rx_id: u32, payload: &[u8], leading_char: Option<u8>) -> Vec<RawFrame> {
    let extended = rx_id > crate::channel::CAN_MAX_STANDARD_ID;
    let lead: Vec<u8> = leading_char.into_iter().collect();
    let sf_max = 7 - lead.len();
    let mut frames = Vec::new();
    if payload.len() <= sf_max {
        let mut data = lead.clone();
        data.push(payload.len() as u8);
        data.extend_from_slice(payload);
        frames.push(RawFrame::new(rx_id, &data, extended));
        return frames;
    }
    let ff_len = 6 - lead.len();
    let mut data = lead.clone();
    data.push(0x10 | ((payload.len() >> 8) as u8 & 0x0F));
    data.push(payload.len() as u8);
    data.extend_from_slice(&payload[..ff_len]);
    frames.push(RawFrame::new(rx_id, &data, extended));

    let cf_len = 7 - lead.len();
    for (i, chunk) in payload[ff_len..].chunks(cf_len).enumerate() {
        let mut data = lead.clone();
        data.push(0x20 | ((i + 1) % 16) as u8);
        data.extend_from_slice(chunk);
        frames.push(RawFrame::new(rx_id, &data, extended));
    }
    frames
}

/// Sink remembering everything it was given
#[derive(Debug, Clone, Default)]
pub struct RecordingSink {
    /// `(target, command, payload)` of every response
    pub responses: Vec<(String, String, Vec<u8>)>,
    /// `(command, raw_id, raw_bytes)` of every filtered frame
    pub filtered: Vec<(String, String, String)>,
    /// Reported loop counters
    pub loops: Vec<u64>,
}

impl ResponseSink for RecordingSink {
    fn on_response(&mut self, target: &str, command: &str, payload: &[u8]) {
        self.responses
            .push((target.to_string(), command.to_string(), payload.to_vec()));
    }

    fn on_filtered_frame(&mut self, command: &str, raw_id: &str, raw_bytes: &str) {
        self.filtered
            .push((command.to_string(), raw_id.to_string(), raw_bytes.to_string()));
    }

    fn on_loop_completed(&mut self, loop_counter: u64) {
        self.loops.push(loop_counter);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_response() {
        let frames = segment_response(0x7EC, &[0x61, 0x01], None);
        assert_eq!(1, frames.len());
        assert_eq!(&[0x02, 0x61, 0x01], frames[0].data());

        let payload: Vec<u8> = (0..20).collect();
        let frames = segment_response(0x7EC, &payload, None);
        assert_eq!(3, frames.len());
        assert_eq!(&[0x10, 20, 0, 1, 2, 3, 4, 5], frames[0].data());
        assert_eq!(0x21, frames[1].data()[0]);
        assert_eq!(&[0x22, 13, 14, 15, 16, 17, 18, 19], frames[2].data());

        let frames = segment_response(0x7EC, &payload, Some(0xAB));
        assert_eq!(&[0xAB, 0x10, 20, 0, 1, 2, 3, 4], frames[0].data());
        assert_eq!(&[0xAB, 0x21, 5, 6, 7, 8, 9, 10], frames[1].data());
    }

    #[test]
    fn test_held_until_flow_control() {
        let mut link = SimulatedLink::new();
        link.open().unwrap();
        link.add_response(0x7E4, &[0x02, 0x21, 0x01], 0x7EC, &[0x55; 20]);
        link.send_frame(0x7E4, false, [0x02, 0x21, 0x01, 0, 0, 0, 0, 0]).unwrap();
        assert_eq!(0x10, link.poll_frame().unwrap().data()[0]);
        assert!(link.poll_frame().is_none());
        link.send_frame(0x7E4, false, [0x30, 0, 0, 0, 0, 0, 0, 0]).unwrap();
        assert_eq!(0x21, link.poll_frame().unwrap().data()[0]);
        assert_eq!(0x22, link.poll_frame().unwrap().data()[0]);
        assert_eq!(2, link.sent_frames().len());
    }

    #[test]
    fn test_closed_link_rejects_frames() {
        let mut link = SimulatedLink::new();
        assert!(matches!(
            link.send_frame(0x7E4, false, [0; 8]),
            Err(LinkError::NotOpen)
        ));
        link.fail_next_opens(1);
        assert!(link.open().is_err());
        assert!(link.open().is_ok());
        assert_eq!(2, link.open_calls());
        assert_eq!(LinkMode::Normal, link.mode());
    }
}
