#![warn(
    missing_docs,
    missing_debug_implementations,
    trivial_numeric_casts,
    //unstable_features,
    //unused_imports,
    unused_import_braces,
    unused_qualifications,
    clippy::uninlined_format_args
)]

//! A crate which polls the diagnostic CAN bus of a vehicle for live data, the way a
//! dashboard does it: a fixed per vehicle list of UDS / OBD2 requests is sent over and
//! over again, and every response is handed to the application for decoding.
//!
//! ## Structure
//!
//! ### Transport (ISO15765-2 / ISO-TP)
//! Requests always fit in a single frame, but responses such as battery cell tables are
//! spread over many consecutive frames. [isotp] decodes raw frames, reassembles the
//! complete response, answers with flow control, and drops frames from ECUs other than the
//! one being queried.
//!
//! ### Command queue and scheduler
//! A [queue::CommandQueue] holds the vehicle's command table. Commands in front of
//! `loop_from` run once (adapter initialisation), the rest repeat forever. The
//! [scheduler::Scheduler] walks the queue one request at a time, asking an
//! [optimizer::Optimizer] whether each command is worth sending right now, and hands every
//! response to a [sink::ResponseSink].
//!
//! ### Connection lifecycle
//! [connection::ConnectionLifecycle] connects the adapter, suspends it when the vehicle
//! goes to sleep, and reconnects if the ECUs go silent. The number of reconnects is
//! bounded. Once exhausted the engine reports a persistent fault instead of retrying forever.
//!
//! Everything is driven by calling `tick()` with the current time. Nothing blocks, so the
//! engine can run inside an existing loop, or on its own thread with [runner::EngineRunner].
//!
//! ## Hardware support
//!
//! Any adapter implementing [channel::LinkDriver] can be used. This crate ships with
//!
//! ### SocketCAN (Linux only)
//! Raw CAN sockets, for USB-CAN adapters and `vcan` interfaces
//!
//! ### SLCAN
//! Lawicel style serial adapters (CANable, Teensy firmwares)
//!
//! ### Simulation
//! A scripted ECU used for testing
//!

pub mod channel;
pub mod config;
pub mod connection;
pub mod hardware;
pub mod helpers;
pub mod isotp;
pub mod optimizer;
pub mod queue;
pub mod runner;
pub mod scheduler;
pub mod sink;

pub use channel::{LinkDriver, LinkError, LinkMode, RawFrame};
pub use config::{ConnectionConfig, FlowControlSettings, SchedulerConfig, VehicleProfile};
pub use connection::{ConnectionError, ConnectionLifecycle, ConnectionState, ControlHandle};
pub use optimizer::{AllowAll, Optimizer};
pub use queue::{Command, CommandQueue, QueueError};
pub use runner::EngineRunner;
pub use scheduler::{Scheduler, SchedulerError, SchedulerStats, TickEvent};
pub use sink::{ChannelSink, ResponseEvent, ResponseSink};

/// Engine result
pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Clone, Debug, thiserror::Error)]
/// Any error produced by the engine
pub enum EngineError {
    /// Error with the physical link
    #[error("Link error")]
    Link(
        #[from]
        #[source]
        LinkError,
    ),
    /// A request could not be encoded
    #[error("Frame encoding error")]
    Frame(
        #[from]
        #[source]
        isotp::FrameError,
    ),
    /// A response could not be reassembled
    #[error("ISO-TP reassembly error")]
    Reassembly(
        #[from]
        #[source]
        isotp::ReassemblyError,
    ),
    /// The command table is invalid
    #[error("Invalid command table")]
    Queue(
        #[from]
        #[source]
        QueueError,
    ),
    /// Per command error, already recovered by the scheduler
    #[error("Scheduler error")]
    Scheduler(
        #[from]
        #[source]
        SchedulerError,
    ),
    /// Connection error
    #[error("Connection error")]
    Connection(
        #[from]
        #[source]
        ConnectionError,
    ),
}

impl EngineError {
    /// True for errors that need user attention. Everything else is recovered automatically
    pub fn is_persistent(&self) -> bool {
        matches!(
            self,
            EngineError::Connection(ConnectionError::Faulted) | EngineError::Queue(_)
        )
    }
}

/// Builds a [ConnectionLifecycle] for `profile`
///
/// ## Parameters
/// * profile - Vehicle command table, timings and response filter
/// * link - Adapter
/// * optimizer - Decides which commands are sent each lap. Use [AllowAll] to send everything
/// * sink - Receives the responses
pub fn build_engine<L, O, S>(
    profile: &VehicleProfile,
    link: L,
    optimizer: O,
    sink: S,
) -> EngineResult<ConnectionLifecycle<L, O, S>>
where
    L: LinkDriver,
    O: Optimizer,
    S: ResponseSink,
{
    let queue = profile.build_queue()?;
    log::debug!(
        "Building engine for {} ({} commands, loop from {})",
        profile.name,
        queue.len(),
        queue.loop_from()
    );
    let scheduler = Scheduler::new(
        link,
        optimizer,
        sink,
        queue,
        profile.filter.clone(),
        profile.scheduler,
    );
    Ok(ConnectionLifecycle::new(scheduler, profile.connection))
}
