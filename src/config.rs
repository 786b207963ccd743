//! Engine configuration
//!
//! All timings are stored as integer milliseconds, the same way vehicle profiles
//! describe them, with [Duration] accessors for the engine.

use std::time::Duration;

use crate::{
    isotp::{ResponseFilter, reassembler::DEFAULT_MAX_MESSAGE_LEN},
    queue::{Command, CommandQueue, QueueError},
};

/// Flow control parameters announced to the ECU after a first frame
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FlowControlSettings {
    /// Consecutive frames the ECU may send before waiting for the next flow control. 0 = no limit
    pub block_size: u8,
    /// Minimum separation time between consecutive frames (In milliseconds)
    pub separation_ms: u8,
}

/// Per command scheduling options
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SchedulerConfig {
    /// Time to wait for a complete response before moving on
    pub rx_timeout_ms: u32,
    /// Cooldown between two requests. Some ECUs drop requests sent back to back
    pub delay_between_commands_ms: u32,
    /// Flow control we answer first frames with
    pub flow_control: FlowControlSettings,
    /// Vehicle sends and receives one extra byte in front of the ISO-TP header
    pub additional_start_char: bool,
    /// Responses declaring a longer length are dropped
    pub max_message_len: usize,
    /// How often a single command may extend its RX window because of a transient reply
    pub max_transient_waits: u8,
    /// Upper bound of frames consumed by a single tick
    pub max_frames_per_tick: usize,
    /// Target used until the first `ATSH` command (OBD functional address)
    pub default_target_id: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            rx_timeout_ms: 500,
            delay_between_commands_ms: 0,
            flow_control: FlowControlSettings::default(),
            additional_start_char: false,
            max_message_len: DEFAULT_MAX_MESSAGE_LEN,
            max_transient_waits: 3,
            max_frames_per_tick: 32,
            default_target_id: 0x7DF,
        }
    }
}

impl SchedulerConfig {
    /// RX timeout as a [Duration]
    pub fn rx_timeout(&self) -> Duration {
        Duration::from_millis(self.rx_timeout_ms as u64)
    }

    /// Inter command delay as a [Duration]
    pub fn delay_between_commands(&self) -> Duration {
        Duration::from_millis(self.delay_between_commands_ms as u64)
    }

    /// Number of bytes in front of the ISO-TP PCI byte
    pub fn leading_offset(&self) -> usize {
        usize::from(self.additional_start_char)
    }
}

/// Connection watchdog options
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ConnectionConfig {
    /// Reconnect budget. Reset by every explicit connect
    pub connect_attempts: u8,
    /// Reconnect if no response completed for this long
    pub silence_window_ms: u32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_attempts: 3,
            silence_window_ms: 5000,
        }
    }
}

impl ConnectionConfig {
    /// Silence window as a [Duration]
    pub fn silence_window(&self) -> Duration {
        Duration::from_millis(self.silence_window_ms as u64)
    }
}

/// Everything the engine needs to know about one vehicle
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct VehicleProfile {
    /// Name for logging
    pub name: String,
    /// Command table in transmission order
    pub commands: Vec<Command>,
    /// First command of the repeating region
    pub loop_from: usize,
    /// Scheduling options
    pub scheduler: SchedulerConfig,
    /// Watchdog options
    pub connection: ConnectionConfig,
    /// Response ID filter
    pub filter: ResponseFilter,
}

impl VehicleProfile {
    /// Creates a profile with default timings
    pub fn new(name: &str, table: &[(u8, &str)], loop_from: usize) -> Self {
        Self {
            name: name.to_string(),
            commands: table.iter().map(|e| Command::from(*e)).collect(),
            loop_from,
            scheduler: SchedulerConfig::default(),
            connection: ConnectionConfig::default(),
            filter: ResponseFilter::default(),
        }
    }

    /// Builds a fresh command queue for this vehicle
    pub fn build_queue(&self) -> Result<CommandQueue, QueueError> {
        CommandQueue::new(self.commands.clone(), self.loop_from)
    }
}
