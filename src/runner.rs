//! Runs the engine on its own thread
//!
//! The UI thread keeps the [ControlHandle] and the receiving end of a
//! [crate::sink::ChannelSink]. Nothing else is shared with the engine thread.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};

use log::{debug, error, info, warn};

use crate::{
    EngineError,
    channel::LinkDriver,
    connection::{ConnectionError, ConnectionLifecycle, ControlHandle},
    optimizer::Optimizer,
    scheduler::SchedulerError,
    sink::ResponseSink,
};

/// Default pause between two ticks
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Handle to an engine running on a background thread. The thread stops when this is dropped
#[derive(Debug)]
pub struct EngineRunner<L, O, S> {
    running: Arc<AtomicBool>,
    control: ControlHandle,
    handle: Option<JoinHandle<ConnectionLifecycle<L, O, S>>>,
}

impl<L, O, S> EngineRunner<L, O, S>
where
    L: LinkDriver + Send + 'static,
    O: Optimizer + Send + 'static,
    S: ResponseSink + Send + 'static,
{
    /// Connects and starts ticking `lifecycle` on a new thread
    ///
    /// ## Parameters
    /// * lifecycle - The engine to run
    /// * poll_interval - Sleep between two ticks
    pub fn spawn(mut lifecycle: ConnectionLifecycle<L, O, S>, poll_interval: Duration) -> Self {
        let running = Arc::new(AtomicBool::new(true));
        let running_t = running.clone();
        let control = lifecycle.control_handle();

        let handle = std::thread::spawn(move || {
            info!("Engine thread started");
            if let Err(e) = lifecycle.connect(Instant::now()) {
                warn!("Initial connect failed, watchdog will retry: {e}");
            }
            let mut faulted = false;
            while running_t.load(Ordering::Relaxed) {
                match lifecycle.tick(Instant::now()) {
                    Ok(_) => faulted = false,
                    Err(EngineError::Connection(ConnectionError::Faulted)) => {
                        // Report once, then wait for a reconnect request
                        if !faulted {
                            error!("Engine faulted, waiting for reconnect");
                            faulted = true;
                        }
                    }
                    Err(EngineError::Scheduler(SchedulerError::AllCommandsSkipped)) => {
                        debug!("Every command skipped this lap");
                    }
                    Err(e) => debug!("Tick error: {e}"),
                }
                std::thread::sleep(poll_interval);
            }
            if let Err(e) = lifecycle.disconnect() {
                warn!("Disconnect on shutdown failed: {e}");
            }
            info!("Engine thread stopped");
            lifecycle
        });

        Self {
            running,
            control,
            handle: Some(handle),
        }
    }

    /// Handle for pausing, suspending and reconnecting the engine
    pub fn control_handle(&self) -> ControlHandle {
        self.control.clone()
    }

    /// True until the engine thread was asked to stop
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Stops the engine thread and returns the engine. Returns `None` if the thread panicked
    pub fn stop(mut self) -> Option<ConnectionLifecycle<L, O, S>> {
        self.running.store(false, Ordering::Relaxed);
        self.handle.take().and_then(|h| h.join().ok())
    }
}

impl<L, O, S> Drop for EngineRunner<L, O, S> {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{ConnectionConfig, SchedulerConfig},
        connection::ConnectionState,
        hardware::simulation::SimulatedLink,
        isotp::ResponseFilter,
        optimizer::AllowAll,
        queue::CommandQueue,
        scheduler::Scheduler,
        sink::{ChannelSink, ResponseEvent},
    };

    #[test]
    fn test_runner_delivers_and_stops() {
        let _ = env_logger::try_init();
        let link = SimulatedLink::new();
        link.add_response(0x7E4, &[0x02, 0x21, 0x01], 0x7EC, &[0x61, 0x01, 0x55]);
        let (sink, rx) = ChannelSink::new();
        let scheduler = Scheduler::new(
            link.clone(),
            AllowAll,
            sink,
            CommandQueue::from_table(&[(0, "ATSH7E4"), (0, "2101")], 0).unwrap(),
            ResponseFilter::default(),
            SchedulerConfig::default(),
        );
        let runner = EngineRunner::spawn(
            ConnectionLifecycle::new(scheduler, ConnectionConfig::default()),
            DEFAULT_POLL_INTERVAL,
        );
        let ev = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(
            ResponseEvent::Response {
                target: "ATSH7E4".into(),
                command: "2101".into(),
                payload: vec![0x61, 0x01, 0x55]
            },
            ev
        );
        assert!(runner.is_running());

        let lifecycle = runner.stop().unwrap();
        assert_eq!(ConnectionState::Disconnected, lifecycle.state());
        assert!(!link.is_open());
    }
}
