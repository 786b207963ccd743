//! Destination of decoded responses

use std::sync::mpsc;

/// Receives the completed responses of the engine, in transmission order
pub trait ResponseSink {
    /// A complete response to `command`, sent to the ECU selected by `target`
    fn on_response(&mut self, target: &str, command: &str, payload: &[u8]);

    /// A frame was dropped by the arbitration ID filter. Diagnostics only
    ///
    /// ## Parameters
    /// * command - Request in flight when the frame arrived
    /// * raw_id - CAN ID of the frame as hex
    /// * raw_bytes - Frame payload as hex
    fn on_filtered_frame(&mut self, _command: &str, _raw_id: &str, _raw_bytes: &str) {}

    /// The command queue wrapped around to its loop start. Used for periodic snapshots
    fn on_loop_completed(&mut self, _loop_counter: u64) {}
}

impl<T: ResponseSink + ?Sized> ResponseSink for Box<T> {
    fn on_response(&mut self, target: &str, command: &str, payload: &[u8]) {
        (**self).on_response(target, command, payload)
    }

    fn on_filtered_frame(&mut self, command: &str, raw_id: &str, raw_bytes: &str) {
        (**self).on_filtered_frame(command, raw_id, raw_bytes)
    }

    fn on_loop_completed(&mut self, loop_counter: u64) {
        (**self).on_loop_completed(loop_counter)
    }
}

/// Event produced by a [ChannelSink]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseEvent {
    /// See [ResponseSink::on_response]
    Response {
        /// Header command selecting the ECU
        target: String,
        /// Request
        command: String,
        /// Merged response bytes
        payload: Vec<u8>,
    },
    /// See [ResponseSink::on_filtered_frame]
    Filtered {
        /// Request in flight
        command: String,
        /// CAN ID as hex
        raw_id: String,
        /// Payload as hex
        raw_bytes: String,
    },
    /// See [ResponseSink::on_loop_completed]
    LoopCompleted(u64),
}

/// Forwards everything over a channel, so the engine can run on its own thread
/// while the UI decodes the responses
#[derive(Debug, Clone)]
pub struct ChannelSink {
    sender: mpsc::Sender<ResponseEvent>,
    forward_filtered: bool,
}

impl ChannelSink {
    /// Creates a sink and the receiving end of its channel
    pub fn new() -> (Self, mpsc::Receiver<ResponseEvent>) {
        let (sender, receiver) = mpsc::channel();
        (
            Self {
                sender,
                forward_filtered: false,
            },
            receiver,
        )
    }

    /// Also forward [ResponseEvent::Filtered] events
    pub fn with_filtered_frames(mut self) -> Self {
        self.forward_filtered = true;
        self
    }

    fn send(&self, e: ResponseEvent) {
        if self.sender.send(e).is_err() {
            log::debug!("Response receiver dropped");
        }
    }
}

impl ResponseSink for ChannelSink {
    fn on_response(&mut self, target: &str, command: &str, payload: &[u8]) {
        self.send(ResponseEvent::Response {
            target: target.to_string(),
            command: command.to_string(),
            payload: payload.to_vec(),
        });
    }

    fn on_filtered_frame(&mut self, command: &str, raw_id: &str, raw_bytes: &str) {
        if self.forward_filtered {
            self.send(ResponseEvent::Filtered {
                command: command.to_string(),
                raw_id: raw_id.to_string(),
                raw_bytes: raw_bytes.to_string(),
            });
        }
    }

    fn on_loop_completed(&mut self, loop_counter: u64) {
        self.send(ResponseEvent::LoopCompleted(loop_counter));
    }
}
