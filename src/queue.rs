//! The per vehicle command list the engine walks through

use std::fmt;

/// Prefix of the ELM327 'set header' command selecting the target ECU
pub const ATSH_PREFIX: &str = "ATSH";

/// Prefix shared by all ELM327 control commands
pub const AT_PREFIX: &str = "AT";

/// Error building a [CommandQueue]
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    /// The vehicle supplied no commands
    #[error("command table is empty")]
    Empty,
    /// The loop start index is past the end of the table
    #[error("loop_from {loop_from} is out of range for {len} commands")]
    LoopFromOutOfRange {
        /// Requested loop start
        loop_from: usize,
        /// Number of commands
        len: usize,
    },
}

/// A single entry of a vehicle command table
#[derive(Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Command {
    start_char: u8,
    request: String,
}

impl Command {
    /// Creates a new command
    ///
    /// ## Parameters
    /// * start_char - Vehicle specific byte some ECUs expect before the ISO-TP length
    /// * request - AT command or hex encoded service + PID (e.g. `"220105"`)
    pub fn new(start_char: u8, request: &str) -> Self {
        Self {
            start_char,
            request: request.to_string(),
        }
    }

    /// Vehicle specific leading byte
    pub fn start_char(&self) -> u8 {
        self.start_char
    }

    /// The request string
    pub fn request(&self) -> &str {
        &self.request
    }

    /// True for any ELM327 style control command
    pub fn is_at_command(&self) -> bool {
        self.request
            .get(..AT_PREFIX.len())
            .is_some_and(|p| p.eq_ignore_ascii_case(AT_PREFIX))
    }

    /// If this is `ATSH<id>`, returns the target arbitration ID.
    ///
    /// Returns `None` for other commands and for malformed headers
    pub fn target_header(&self) -> Option<u32> {
        let prefix = self.request.get(..ATSH_PREFIX.len())?;
        if !prefix.eq_ignore_ascii_case(ATSH_PREFIX) {
            return None;
        }
        let hex = self.request[ATSH_PREFIX.len()..].trim();
        if hex.is_empty() || hex.len() > 8 {
            return None;
        }
        u32::from_str_radix(hex, 16).ok()
    }

    /// True if this is an `ATSH` command, even a malformed one
    pub fn is_target_header(&self) -> bool {
        self.request
            .get(..ATSH_PREFIX.len())
            .is_some_and(|p| p.eq_ignore_ascii_case(ATSH_PREFIX))
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Command({:02X}, {})", self.start_char, self.request)
    }
}

impl From<(u8, &str)> for Command {
    fn from((start_char, request): (u8, &str)) -> Self {
        Self::new(start_char, request)
    }
}

/// Result of [CommandQueue::advance]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct AdvanceResult {
    /// Index of the new current command
    pub new_index: usize,
    /// True if the queue wrapped back to `loop_from`
    pub wrapped: bool,
}

/// Cyclic command list.
///
/// Commands before `loop_from` run once after startup (adapter initialisation), the rest
/// repeat for as long as the session runs. The queue has no mutation API besides
/// [CommandQueue::advance]. Switching vehicles builds a new queue.
#[derive(Debug, Clone)]
pub struct CommandQueue {
    commands: Vec<Command>,
    loop_from: usize,
    current_index: usize,
    loop_counter: u64,
}

impl CommandQueue {
    /// Creates a queue starting at index 0
    pub fn new(commands: Vec<Command>, loop_from: usize) -> Result<Self, QueueError> {
        if commands.is_empty() {
            return Err(QueueError::Empty);
        }
        if loop_from >= commands.len() {
            return Err(QueueError::LoopFromOutOfRange {
                loop_from,
                len: commands.len(),
            });
        }
        Ok(Self {
            commands,
            loop_from,
            current_index: 0,
            loop_counter: 0,
        })
    }

    /// Builds a queue out of a static `(start_char, request)` table
    pub fn from_table(table: &[(u8, &str)], loop_from: usize) -> Result<Self, QueueError> {
        Self::new(table.iter().map(|e| Command::from(*e)).collect(), loop_from)
    }

    /// Command at the current position
    pub fn current(&self) -> &Command {
        &self.commands[self.current_index]
    }

    /// Moves to the next command, wrapping to `loop_from` at the end of the table
    pub fn advance(&mut self) -> AdvanceResult {
        self.current_index += 1;
        let wrapped = self.current_index >= self.commands.len();
        if wrapped {
            self.current_index = self.loop_from;
            self.loop_counter += 1;
        }
        AdvanceResult {
            new_index: self.current_index,
            wrapped,
        }
    }

    /// Current position
    pub fn current_index(&self) -> usize {
        self.current_index
    }

    /// First index of the repeating region
    pub fn loop_from(&self) -> usize {
        self.loop_from
    }

    /// Number of completed laps
    pub fn loop_counter(&self) -> u64 {
        self.loop_counter
    }

    /// Number of commands
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Always false, an empty queue cannot be built
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// All commands in transmission order
    pub fn commands(&self) -> &[Command] {
        &self.commands
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scenario_queue() -> CommandQueue {
        let table = [(0, "ATZ"), (0, "ATSH7E4"), (0, "2101"), (0, "2102")];
        CommandQueue::from_table(&table, 1).unwrap()
    }

    #[test]
    fn test_scenario_walk() {
        let mut q = scenario_queue();
        assert_eq!("ATZ", q.current().request());
        for _ in 0..3 {
            assert!(!q.advance().wrapped);
        }
        assert_eq!("2102", q.current().request());
        let r = q.advance();
        assert!(r.wrapped);
        assert_eq!(1, r.new_index);
        assert_eq!("ATSH7E4", q.current().request());
        assert_eq!(1, q.loop_counter());
    }

    #[test]
    fn test_one_lap_wraps_once() {
        let mut q = scenario_queue();
        q.advance();
        assert_eq!(q.loop_from(), q.current_index());
        let laps = q.loop_counter();
        let mut wraps = 0;
        for _ in 0..(q.len() - q.loop_from()) {
            if q.advance().wrapped {
                wraps += 1;
            }
        }
        assert_eq!(1, wraps);
        assert_eq!(q.loop_from(), q.current_index());
        assert_eq!(laps + 1, q.loop_counter());
    }

    #[test]
    fn test_never_wraps_to_zero() {
        let mut q = scenario_queue();
        for _ in 0..50 {
            q.advance();
            assert!(q.current_index() >= q.loop_from());
            assert!(q.current_index() < q.len());
        }
    }

    #[test]
    fn test_invalid_tables() {
        assert_eq!(QueueError::Empty, CommandQueue::new(vec![], 0).unwrap_err());
        assert_eq!(
            QueueError::LoopFromOutOfRange { loop_from: 2, len: 2 },
            CommandQueue::from_table(&[(0, "ATZ"), (0, "2101")], 2).unwrap_err()
        );
    }

    #[test]
    fn test_command_classification() {
        assert_eq!(Some(0x7E4), Command::new(0, "ATSH7E4").target_header());
        assert_eq!(Some(0x7E4), Command::new(0, "atsh7e4").target_header());
        assert_eq!(Some(0x18DADAF1), Command::new(0, "ATSH18DADAF1").target_header());
        assert_eq!(None, Command::new(0, "ATSHXYZ").target_header());
        assert!(Command::new(0, "ATSHXYZ").is_target_header());
        assert_eq!(None, Command::new(0, "220105").target_header());
        assert!(Command::new(0, "ATZ").is_at_command());
        assert!(!Command::new(0, "220105").is_at_command());
        assert!(!Command::new(0, "A").is_at_command());
    }
}
