//! Software ISO-TP (ISO15765-2) layer
//!
//! The dashboard only ever sends single frame requests, but responses such as cell voltage
//! tables are spread over dozens of consecutive frames. This module contains the pieces needed
//! to receive those:
//! * [codec] - Frame payload <-> [IsoTpSegment] conversion
//! * [reassembler] - Rebuilds a full response and decides when flow control is needed
//! * [filter] - Drops frames from ECUs other than the one being queried

pub mod codec;
pub mod filter;
pub mod reassembler;

pub use codec::{FrameError, IsoTpSegment, decode_segment, encode_flow_control, encode_request};
pub use filter::{AllowedResponse, ResponseFilter};
pub use reassembler::{MessageReassembler, ReassemblyError, ReassemblyOutcome};
