//! Per command request / response cycle
//!
//! The [Scheduler] owns all protocol state. It is driven by repeatedly calling
//! [Scheduler::tick] with the current time, never blocks, and never sleeps. Every per command
//! failure (timeouts, malformed responses, unencodable requests) is recovered by moving on to the
//! next command, so one unanswered PID can never stall the dashboard.

use std::time::Instant;

use log::{debug, trace, warn};

use crate::{
    channel::{CAN_MAX_STANDARD_ID, LinkDriver, LinkError, RawFrame},
    config::SchedulerConfig,
    helpers,
    isotp::{
        FrameError, IsoTpSegment, MessageReassembler, ReassemblyError, ReassemblyOutcome,
        ResponseFilter, decode_segment, encode_flow_control, encode_request,
    },
    optimizer::Optimizer,
    queue::{ATSH_PREFIX, Command, CommandQueue},
    sink::ResponseSink,
};

/// Scheduler result
pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// Errors reported by [Scheduler::tick]. The queue has already moved on to the next command
/// when one of these is returned
#[derive(Debug, Clone, thiserror::Error)]
pub enum SchedulerError {
    /// No command could be sent during a whole lap of the queue
    #[error("no command was sent during a whole lap of the queue")]
    AllCommandsSkipped,
    /// The ECU did not answer in time
    #[error("no response to '{command}' within {timeout_ms} ms")]
    Timeout {
        /// Request that went unanswered
        command: String,
        /// Configured RX timeout
        timeout_ms: u32,
    },
    /// Link driver failure
    #[error("link driver error")]
    Link(
        #[from]
        #[source]
        LinkError,
    ),
    /// The request could not be encoded into a frame
    #[error("cannot encode request '{command}'")]
    Frame {
        /// Offending request
        command: String,
        /// Encoding error
        #[source]
        source: FrameError,
    },
    /// The response could not be reassembled
    #[error("response to '{command}' abandoned")]
    Reassembly {
        /// Request in flight
        command: String,
        /// Reassembly error
        #[source]
        source: ReassemblyError,
    },
}

/// State of the current request
#[derive(Debug, Copy, Clone, PartialEq, Eq, strum_macros::Display)]
pub enum SchedulerState {
    /// Ready to send the next command
    Idle,
    /// Request sent, nothing accepted yet
    Sent,
    /// Multi frame response in progress
    Receiving,
}

/// What a successful [Scheduler::tick] did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickEvent {
    /// Nothing may be sent right now (paused, suspended or inter command delay)
    Gated,
    /// A request was transmitted
    Sent {
        /// The request
        command: String,
    },
    /// Waiting for (more of) the response
    Waiting,
    /// A flow control frame was sent for a multi frame response
    FlowControlSent,
    /// A response was handed to the [ResponseSink]
    Delivered {
        /// The request
        command: String,
        /// Length of the merged response
        len: usize,
    },
}

/// Diagnostic counters
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Requests transmitted
    pub requests_sent: u64,
    /// Responses delivered to the sink
    pub responses: u64,
    /// Requests that timed out
    pub timeouts: u64,
    /// Frames dropped by the arbitration ID filter
    pub filtered_frames: u64,
    /// Segments ignored by the reassembler
    pub discarded_segments: u64,
    /// Abandoned multi frame responses
    pub reassembly_errors: u64,
    /// Commands skipped by the optimizer
    pub skipped_commands: u64,
    /// Transient replies ignored
    pub transient_replies: u64,
    /// Flow control frames sent
    pub flow_control_sent: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Target {
    header: String,
    id: u32,
    extended: bool,
}

impl Target {
    fn new(id: u32) -> Self {
        Self {
            header: format!("{ATSH_PREFIX}{id:03X}"),
            id,
            extended: id > CAN_MAX_STANDARD_ID,
        }
    }
}

/// Walks the command queue, sending one request at a time and collecting its response
#[derive(Debug)]
pub struct Scheduler<L, O, S> {
    link: L,
    optimizer: O,
    sink: S,
    queue: CommandQueue,
    reassembler: MessageReassembler,
    filter: ResponseFilter,
    cfg: SchedulerConfig,
    state: SchedulerState,
    target: Target,
    in_flight: Option<Command>,
    // ECU a segmented response is being received from
    rx_lock: Option<u32>,
    last_data_sent: Option<Instant>,
    last_response: Option<Instant>,
    transient_waits: u8,
    paused: bool,
    suspended: bool,
    stats: SchedulerStats,
}

impl<L: LinkDriver, O: Optimizer, S: ResponseSink> Scheduler<L, O, S> {
    /// Creates a new scheduler
    pub fn new(
        link: L,
        optimizer: O,
        sink: S,
        queue: CommandQueue,
        filter: ResponseFilter,
        cfg: SchedulerConfig,
    ) -> Self {
        Self {
            link,
            optimizer,
            sink,
            queue,
            reassembler: MessageReassembler::new(cfg.max_message_len, cfg.flow_control.block_size),
            filter,
            target: Target::new(cfg.default_target_id),
            cfg,
            state: SchedulerState::Idle,
            in_flight: None,
            rx_lock: None,
            last_data_sent: None,
            last_response: None,
            transient_waits: 0,
            paused: false,
            suspended: false,
            stats: SchedulerStats::default(),
        }
    }

    /// Runs one step of the request / response cycle
    pub fn tick(&mut self, now: Instant) -> SchedulerResult<TickEvent> {
        if self.suspended {
            return Ok(TickEvent::Gated);
        }
        match self.state {
            SchedulerState::Idle => self.try_send(now),
            SchedulerState::Sent | SchedulerState::Receiving => self.receive(now),
        }
    }

    fn send_gated(&self, now: Instant) -> bool {
        if self.paused {
            return true;
        }
        match self.last_data_sent {
            Some(last) => now.saturating_duration_since(last) < self.cfg.delay_between_commands(),
            None => false,
        }
    }

    fn try_send(&mut self, now: Instant) -> SchedulerResult<TickEvent> {
        if self.send_gated(now) {
            return Ok(TickEvent::Gated);
        }
        // At most one lap, in case every command is skipped
        for _ in 0..self.queue.len() {
            let cmd = self.queue.current().clone();
            if !self.optimizer.allowed(&self.target.header, cmd.request(), now) {
                trace!("Optimizer skipped {}", cmd.request());
                self.stats.skipped_commands += 1;
                self.advance_queue();
                continue;
            }
            if cmd.is_target_header() {
                match cmd.target_header() {
                    Some(id) => {
                        debug!("Target set to {:X} by {}", id, cmd.request());
                        self.target = Target {
                            header: cmd.request().to_string(),
                            id,
                            extended: id > CAN_MAX_STANDARD_ID,
                        };
                    }
                    None => warn!("Malformed header command '{}', target unchanged", cmd.request()),
                }
                self.advance_queue();
                continue;
            }
            if cmd.is_at_command() {
                trace!("{} has no meaning on raw CAN, skipping", cmd.request());
                self.advance_queue();
                continue;
            }
            return self.transmit(cmd, now);
        }
        warn!("No command sent during a whole lap of {} commands", self.queue.len());
        Err(SchedulerError::AllCommandsSkipped)
    }

    fn transmit(&mut self, cmd: Command, now: Instant) -> SchedulerResult<TickEvent> {
        let leading = self.leading_char(&cmd);
        let data = match encode_request(&cmd, leading) {
            Ok(d) => d,
            Err(source) => {
                warn!("Cannot encode '{}': {source}", cmd.request());
                self.advance_queue();
                return Err(SchedulerError::Frame {
                    command: cmd.request().to_string(),
                    source,
                });
            }
        };
        self.flush_stale_frames();
        self.reset_reception();
        self.last_data_sent = Some(now);

        debug!("Tx {} -> {:02X?}", self.target.header, data);
        if let Err(e) = self.link.send_frame(self.target.id, self.target.extended, data) {
            warn!("Sending '{}' failed: {e}", cmd.request());
            self.advance_queue();
            return Err(e.into());
        }
        self.optimizer.on_sent(&self.target.header, cmd.request(), now);
        self.stats.requests_sent += 1;
        self.transient_waits = 0;
        self.state = SchedulerState::Sent;
        let command = cmd.request().to_string();
        self.in_flight = Some(cmd);
        Ok(TickEvent::Sent { command })
    }

    fn receive(&mut self, now: Instant) -> SchedulerResult<TickEvent> {
        let offset = self.cfg.leading_offset();
        for _ in 0..self.cfg.max_frames_per_tick {
            let Some(frame) = self.link.poll_frame() else {
                break;
            };
            if let Err(e) = self.filter.check(self.target.id, &frame, offset) {
                self.on_filtered(&frame, e);
                continue;
            }
            // Once a first frame arrived, other ECUs answering the same request are ignored
            if self.rx_lock.is_some_and(|id| id != frame.id()) {
                self.on_filtered(&frame, ReassemblyError::FilteredFrame { id: frame.id() });
                continue;
            }
            let seg = decode_segment(frame.data(), offset);
            if seg == IsoTpSegment::Unknown {
                debug!("Unknown ISO-TP frame {frame:?}, ignoring");
            }
            match self.reassembler.on_segment(seg) {
                ReassemblyOutcome::NeedMore => self.state = SchedulerState::Receiving,
                ReassemblyOutcome::NeedFlowControl => {
                    self.state = SchedulerState::Receiving;
                    self.rx_lock = Some(frame.id());
                    self.send_flow_control(frame.id())?;
                    // Give the ECU time to act on it
                    return Ok(TickEvent::FlowControlSent);
                }
                ReassemblyOutcome::Discarded => self.stats.discarded_segments += 1,
                ReassemblyOutcome::Complete(payload) => {
                    if self.is_transient(&payload) {
                        self.on_transient(now);
                        continue;
                    }
                    return Ok(self.deliver(payload, now));
                }
                ReassemblyOutcome::Error(source) => {
                    self.stats.reassembly_errors += 1;
                    let command = self.in_flight_request();
                    warn!("Response to '{command}' abandoned: {source}");
                    self.finish_command();
                    return Err(SchedulerError::Reassembly { command, source });
                }
            }
        }

        let timed_out = self
            .last_data_sent
            .is_some_and(|sent| now.saturating_duration_since(sent) > self.cfg.rx_timeout());
        if timed_out {
            self.stats.timeouts += 1;
            let command = self.in_flight_request();
            debug!("No response to '{command}' within {} ms", self.cfg.rx_timeout_ms);
            self.finish_command();
            return Err(SchedulerError::Timeout {
                command,
                timeout_ms: self.cfg.rx_timeout_ms,
            });
        }
        Ok(TickEvent::Waiting)
    }

    fn send_flow_control(&mut self, rx_id: u32) -> SchedulerResult<()> {
        let fc = &self.cfg.flow_control;
        let leading = match &self.in_flight {
            Some(cmd) => self.leading_char(cmd),
            None => None,
        };
        let data = encode_flow_control(fc.block_size, fc.separation_ms, leading);
        let id = self.filter.flow_control_id(self.target.id, rx_id);
        trace!("Flow control {id:X} -> {data:02X?}");
        if let Err(e) = self.link.send_frame(id, self.target.extended, data) {
            warn!("Sending flow control failed: {e}");
            self.finish_command();
            return Err(e.into());
        }
        self.stats.flow_control_sent += 1;
        Ok(())
    }

    fn is_transient(&self, payload: &[u8]) -> bool {
        match &self.in_flight {
            Some(cmd) => self
                .optimizer
                .is_transient(&self.target.header, cmd.request(), payload),
            None => false,
        }
    }

    fn on_transient(&mut self, now: Instant) {
        self.stats.transient_replies += 1;
        self.reset_reception();
        self.state = SchedulerState::Sent;
        if self.transient_waits < self.cfg.max_transient_waits {
            self.transient_waits += 1;
            debug!(
                "Transient reply to '{}', waiting for the real one",
                self.in_flight_request()
            );
            self.last_data_sent = Some(now);
        }
    }

    fn deliver(&mut self, payload: Vec<u8>, now: Instant) -> TickEvent {
        let command = self.in_flight_request();
        debug!("Rx {} {command} <- {:02X?}", self.target.header, payload);
        self.sink.on_response(&self.target.header, &command, &payload);
        self.stats.responses += 1;
        self.last_response = Some(now);
        self.finish_command();
        TickEvent::Delivered {
            command,
            len: payload.len(),
        }
    }

    fn on_filtered(&mut self, frame: &RawFrame, reason: ReassemblyError) {
        self.stats.filtered_frames += 1;
        let command = self.in_flight_request();
        trace!("{reason} {frame:?} while waiting for '{command}'");
        self.sink.on_filtered_frame(
            &command,
            &frame.id_hex(),
            &helpers::bytes_to_hex(frame.data()),
        );
    }

    // Frames left over from an earlier request must not be read as the answer to the next one
    fn flush_stale_frames(&mut self) {
        for _ in 0..self.cfg.max_frames_per_tick {
            match self.link.poll_frame() {
                Some(f) => trace!("Dropping stale {f:?}"),
                None => break,
            }
        }
    }

    fn reset_reception(&mut self) {
        self.reassembler.reset();
        self.rx_lock = None;
    }

    fn finish_command(&mut self) {
        self.reset_reception();
        self.in_flight = None;
        self.state = SchedulerState::Idle;
        self.advance_queue();
    }

    fn advance_queue(&mut self) {
        let r = self.queue.advance();
        if r.wrapped {
            trace!("Command queue lap {} complete", self.queue.loop_counter());
            self.sink.on_loop_completed(self.queue.loop_counter());
        }
    }

    fn leading_char(&self, cmd: &Command) -> Option<u8> {
        self.cfg
            .additional_start_char
            .then_some(cmd.start_char())
    }

    fn in_flight_request(&self) -> String {
        self.in_flight
            .as_ref()
            .map(|c| c.request().to_string())
            .unwrap_or_default()
    }

    /// Stops all transmissions and drops any partial response. The command in flight is
    /// sent again after [Scheduler::resume]
    pub fn suspend(&mut self) {
        if let Some(cmd) = self.in_flight.take() {
            debug!("Suspending with '{}' in flight", cmd.request());
        }
        self.reset_reception();
        self.state = SchedulerState::Idle;
        self.suspended = true;
    }

    /// Re-enables transmissions after [Scheduler::suspend]
    pub fn resume(&mut self) {
        self.suspended = false;
        self.last_data_sent = None;
    }

    /// Drops the request in flight without advancing. Used after the link was reopened
    pub fn reset_in_flight(&mut self) {
        self.reset_reception();
        self.in_flight = None;
        self.state = SchedulerState::Idle;
        self.last_data_sent = None;
    }

    /// Holds back new requests. A request already in flight still completes
    pub fn set_paused(&mut self, paused: bool) {
        self.paused = paused;
    }

    /// True while paused
    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// True while suspended
    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    /// Replaces the command queue, e.g. after the vehicle type changed
    pub fn replace_queue(&mut self, queue: CommandQueue) {
        self.reset_in_flight();
        self.target = Target::new(self.cfg.default_target_id);
        self.queue = queue;
    }

    /// Current request state
    pub fn state(&self) -> SchedulerState {
        self.state
    }

    /// The command queue
    pub fn queue(&self) -> &CommandQueue {
        &self.queue
    }

    /// Header command of the selected ECU
    pub fn target_header(&self) -> &str {
        &self.target.header
    }

    /// Arbitration ID requests are sent to
    pub fn target_id(&self) -> u32 {
        self.target.id
    }

    /// Time of the last delivered response
    pub fn last_response(&self) -> Option<Instant> {
        self.last_response
    }

    /// Diagnostic counters
    pub fn stats(&self) -> &SchedulerStats {
        &self.stats
    }

    /// Active configuration
    pub fn config(&self) -> &SchedulerConfig {
        &self.cfg
    }

    /// The link driver
    pub fn link(&self) -> &L {
        &self.link
    }

    /// The link driver, mutably
    pub fn link_mut(&mut self) -> &mut L {
        &mut self.link
    }

    /// The response sink
    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// The optimizer, mutably
    pub fn optimizer_mut(&mut self) -> &mut O {
        &mut self.optimizer
    }
}
