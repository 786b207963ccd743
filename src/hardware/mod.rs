//! [crate::channel::LinkDriver] implementations for common CAN adapters
//!
//! * [simulation] - Scripted in memory bus, always available
//! * `slcan` - Lawicel / SLCAN serial adapters (feature `slcan`)
//! * `socketcan` - Linux SocketCAN interfaces (feature `socketcan`, Linux only)

pub mod simulation;

#[cfg(feature = "slcan")]
pub mod slcan;

#[cfg(all(feature = "socketcan", target_os = "linux"))]
pub mod socketcan;
