//! Module for the physical link between the engine and the vehicle CAN bus
//!
//! The engine never talks to hardware directly. Everything goes through a [LinkDriver],
//! which is implemented once per adapter type (MCP2515 style controllers, SLCAN dongles,
//! SocketCAN interfaces, or the [crate::hardware::simulation] link used for testing)

use std::{fmt, sync::Arc};

/// Link driver result
pub type LinkResult<T> = Result<T, LinkError>;

/// Largest payload a classic CAN frame can carry
pub const CAN_MAX_DLC: usize = 8;

/// Highest 11bit (standard) CAN identifier
pub const CAN_MAX_STANDARD_ID: u32 = 0x7FF;

/// Highest 29bit (extended) CAN identifier
pub const CAN_MAX_EXTENDED_ID: u32 = 0x1FFF_FFFF;

#[derive(Debug, Clone, thiserror::Error)]
/// Error produced by a link driver
pub enum LinkError {
    /// Underlying IO Error with the adapter
    #[error("IO error")]
    IOError(
        #[from]
        #[source]
        Arc<std::io::Error>,
    ),
    /// The adapter has not been opened, or was closed
    #[error("link is not open")]
    NotOpen,
    /// The adapter's transmit buffer is full
    #[error("link transmit buffer is full")]
    BufferFull,
    /// The adapter rejected the frame or command
    #[error("link rejected the request")]
    NotAcknowledged,
    /// The requested mode or configuration is not supported by the adapter
    #[error("unsupported link request")]
    UnsupportedRequest,
    /// The CAN identifier does not fit in the requested addressing mode
    #[error("invalid CAN identifier 0x{0:08X}")]
    InvalidId(u32),
    /// Controller initialisation failed
    #[error("link initialisation failed: {0}")]
    InitFailed(String),
    /// Other adapter specific error
    #[error("link error: {0}")]
    Other(String),
}

impl From<std::io::Error> for LinkError {
    fn from(value: std::io::Error) -> Self {
        Self::IOError(Arc::new(value))
    }
}

/// Operating mode of the CAN controller
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, strum_macros::Display)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum LinkMode {
    /// Controller is active on the bus
    Normal,
    /// Controller is in low power mode. Frames must not be sent
    Sleep,
}

/// A raw classic CAN frame as seen on the bus
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct RawFrame {
    id: u32,
    extended: bool,
    dlc: u8,
    data: [u8; CAN_MAX_DLC],
}

impl RawFrame {
    /// Creates a new frame. Anything past 8 bytes of `data` is dropped
    pub fn new(id: u32, data: &[u8], extended: bool) -> Self {
        let dlc = data.len().min(CAN_MAX_DLC);
        let mut buf = [0u8; CAN_MAX_DLC];
        buf[..dlc].copy_from_slice(&data[..dlc]);
        Self {
            id,
            extended,
            dlc: dlc as u8,
            data: buf,
        }
    }

    /// CAN identifier of the frame
    pub fn id(&self) -> u32 {
        self.id
    }

    /// True if the frame uses 29bit addressing
    pub fn is_extended(&self) -> bool {
        self.extended
    }

    /// Payload of the frame (Up to 8 bytes)
    pub fn data(&self) -> &[u8] {
        &self.data[..self.dlc as usize]
    }

    /// Returns the identifier formatted the same way the dashboard logs it
    pub fn id_hex(&self) -> String {
        if self.extended {
            format!("{:08X}", self.id)
        } else {
            format!("{:03X}", self.id)
        }
    }
}

impl fmt::Debug for RawFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RawFrame {{ id: {}, data: {:02X?} }}", self.id_hex(), self.data())
    }
}

/// Abstraction over the physical CAN controller.
///
/// Implementations must never block in [LinkDriver::poll_frame]: the engine calls it from a
/// cooperative loop and expects `None` immediately when nothing was received.
pub trait LinkDriver {
    /// Opens and initialises the controller. Called on every (re)connect attempt.
    /// The default implementation simply switches the controller to [LinkMode::Normal]
    fn open(&mut self) -> LinkResult<()> {
        self.set_mode(LinkMode::Normal)
    }

    /// Releases the controller
    fn close(&mut self) -> LinkResult<()> {
        Ok(())
    }

    /// Transmits a single 8 byte CAN frame
    ///
    /// ## Parameters
    /// * id - Arbitration ID to send the frame with
    /// * extended - Use 29bit addressing
    /// * data - Frame payload
    fn send_frame(&mut self, id: u32, extended: bool, data: [u8; 8]) -> LinkResult<()>;

    /// Returns the next received frame, or `None` if the receive buffer is empty
    fn poll_frame(&mut self) -> Option<RawFrame>;

    /// Switches the controller between normal and sleep mode
    fn set_mode(&mut self, mode: LinkMode) -> LinkResult<()>;
}

impl<T: LinkDriver + ?Sized> LinkDriver for Box<T> {
    fn open(&mut self) -> LinkResult<()> {
        (**self).open()
    }

    fn close(&mut self) -> LinkResult<()> {
        (**self).close()
    }

    fn send_frame(&mut self, id: u32, extended: bool, data: [u8; 8]) -> LinkResult<()> {
        (**self).send_frame(id, extended, data)
    }

    fn poll_frame(&mut self) -> Option<RawFrame> {
        (**self).poll_frame()
    }

    fn set_mode(&mut self, mode: LinkMode) -> LinkResult<()> {
        (**self).set_mode(mode)
    }
}
