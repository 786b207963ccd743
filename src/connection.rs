//! Connection lifecycle of the engine
//!
//! [ConnectionLifecycle] wraps a [Scheduler] with the connection states of the adapter, the
//! 'no response for a while, reconnect' watchdog and a bounded retry budget. Once the budget
//! is used up the connection is [ConnectionState::Faulted] and stays that way until
//! [ConnectionLifecycle::reconnect] is called, so the UI can show a persistent error.
//!
//! Other threads interact with a running engine only through a [ControlHandle].

use std::{
    sync::{
        Arc,
        atomic::{AtomicU8, Ordering},
    },
    time::Instant,
};

use log::{debug, error, info, warn};

use crate::{
    EngineError, EngineResult,
    channel::{LinkDriver, LinkError, LinkMode},
    config::ConnectionConfig,
    optimizer::Optimizer,
    scheduler::{Scheduler, SchedulerError, TickEvent},
    sink::ResponseSink,
};

/// Connection result
pub type ConnectionResult<T> = Result<T, ConnectionError>;

/// Connection level errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConnectionError {
    /// The retry budget is exhausted. Only [ConnectionLifecycle::reconnect] recovers from this
    #[error("connection faulted, reconnect budget exhausted")]
    Faulted,
    /// Operation not possible in the current state
    #[error("cannot {operation} while {state}")]
    InvalidState {
        /// Current state
        state: ConnectionState,
        /// Requested operation
        operation: &'static str,
    },
    /// Link driver failure
    #[error("link driver error")]
    Link(
        #[from]
        #[source]
        LinkError,
    ),
}

/// Connection state
#[derive(Debug, Copy, Clone, PartialEq, Eq, strum_macros::Display)]
pub enum ConnectionState {
    /// Adapter closed
    Disconnected,
    /// Waiting for the adapter to initialise
    Connecting,
    /// Polling
    Ready,
    /// Adapter in sleep mode, nothing may be sent
    Suspended,
    /// Retry budget exhausted
    Faulted,
}

/// Result of [ConnectionLifecycle::watchdog]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum WatchdogOutcome {
    /// Nothing to do
    Quiet,
    /// Silence detected, the adapter was reopened
    Reconnected,
    /// Silence detected, reopening failed but attempts remain
    ReconnectFailed,
    /// The last attempt failed
    Faulted,
}

bitflags::bitflags! {
    /// Requests posted by other threads through a [ControlHandle]
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct ControlFlags: u8 {
        /// Hold back new requests
        const PAUSE = 0b0000_0001;
        /// Continue sending requests
        const UNPAUSE = 0b0000_0010;
        /// Put the adapter to sleep
        const SUSPEND = 0b0000_0100;
        /// Wake the adapter up
        const RESUME = 0b0000_1000;
        /// Close the adapter
        const DISCONNECT = 0b0001_0000;
        /// Reset the retry budget and reconnect
        const RECONNECT = 0b0010_0000;
    }
}

/// Thread safe handle posting [ControlFlags] to a [ConnectionLifecycle]. Requests are
/// applied at the start of the next tick.
///
/// A request cancels an opposite one that is still pending, so when the UI asks for
/// `resume` then `suspend` within one tick, the engine stays asleep.
#[derive(Debug, Clone, Default)]
pub struct ControlHandle(Arc<AtomicU8>);

impl ControlHandle {
    fn post(&self, flags: ControlFlags, cancels: ControlFlags) {
        // The closure never returns None, so this cannot fail
        let _ = self
            .0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |pending| {
                Some((pending & !cancels.bits()) | flags.bits())
            });
    }

    fn take(&self) -> ControlFlags {
        ControlFlags::from_bits_truncate(self.0.swap(0, Ordering::AcqRel))
    }

    /// Requests a pause (e.g. while the settings menu is open)
    pub fn pause(&self) {
        self.post(ControlFlags::PAUSE, ControlFlags::UNPAUSE)
    }

    /// Ends a pause
    pub fn unpause(&self) {
        self.post(ControlFlags::UNPAUSE, ControlFlags::PAUSE)
    }

    /// Requests sleep mode
    pub fn suspend(&self) {
        self.post(ControlFlags::SUSPEND, ControlFlags::RESUME)
    }

    /// Requests wake up from sleep mode
    pub fn resume(&self) {
        self.post(ControlFlags::RESUME, ControlFlags::SUSPEND)
    }

    /// Requests the adapter to be closed
    pub fn disconnect(&self) {
        self.post(
            ControlFlags::DISCONNECT,
            ControlFlags::RECONNECT | ControlFlags::SUSPEND | ControlFlags::RESUME,
        )
    }

    /// Requests a fresh connection with a full retry budget
    pub fn reconnect(&self) {
        self.post(
            ControlFlags::RECONNECT,
            ControlFlags::DISCONNECT | ControlFlags::SUSPEND | ControlFlags::RESUME,
        )
    }

    /// Requests not yet applied
    pub fn pending(&self) -> ControlFlags {
        ControlFlags::from_bits_truncate(self.0.load(Ordering::Acquire))
    }
}

/// Owns the [Scheduler] and manages the adapter connection around it
#[derive(Debug)]
pub struct ConnectionLifecycle<L, O, S> {
    scheduler: Scheduler<L, O, S>,
    cfg: ConnectionConfig,
    state: ConnectionState,
    connect_attempts: u8,
    last_activity: Option<Instant>,
    control: ControlHandle,
}

impl<L: LinkDriver, O: Optimizer, S: ResponseSink> ConnectionLifecycle<L, O, S> {
    /// Creates a disconnected lifecycle
    pub fn new(scheduler: Scheduler<L, O, S>, cfg: ConnectionConfig) -> Self {
        Self {
            scheduler,
            connect_attempts: cfg.connect_attempts,
            cfg,
            state: ConnectionState::Disconnected,
            last_activity: None,
            control: ControlHandle::default(),
        }
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            info!("Connection {} -> {}", self.state, state);
            self.state = state;
        }
    }

    /// Opens the adapter with a full retry budget. A failed first attempt leaves the
    /// connection in [ConnectionState::Connecting] for the watchdog to retry
    pub fn connect(&mut self, now: Instant) -> ConnectionResult<()> {
        match self.state {
            ConnectionState::Faulted | ConnectionState::Suspended => {
                return Err(ConnectionError::InvalidState {
                    state: self.state,
                    operation: "connect",
                });
            }
            ConnectionState::Ready => return Ok(()),
            _ => {}
        }
        self.connect_attempts = self.cfg.connect_attempts;
        self.set_state(ConnectionState::Connecting);
        self.open_link(now).map_err(|e| {
            warn!("Initial connect failed: {e}");
            ConnectionError::Link(e)
        })
    }

    fn open_link(&mut self, now: Instant) -> Result<(), LinkError> {
        self.last_activity = Some(now);
        self.scheduler.reset_in_flight();
        self.scheduler.link_mut().open()?;
        self.set_state(ConnectionState::Ready);
        Ok(())
    }

    /// Reconnects if nothing was received for the configured silence window, consuming one
    /// attempt of the retry budget. No-op while paused, and unless [ConnectionState::Ready] or
    /// [ConnectionState::Connecting]
    pub fn watchdog(&mut self, now: Instant) -> WatchdogOutcome {
        if !matches!(
            self.state,
            ConnectionState::Ready | ConnectionState::Connecting
        ) {
            return WatchdogOutcome::Quiet;
        }
        // Nothing is sent while paused, so nothing can be answered either
        if self.scheduler.is_paused() {
            return WatchdogOutcome::Quiet;
        }
        let silent = self
            .last_activity
            .is_none_or(|t| now.saturating_duration_since(t) > self.cfg.silence_window());
        if !silent {
            return WatchdogOutcome::Quiet;
        }
        if self.connect_attempts == 0 {
            self.fault();
            return WatchdogOutcome::Faulted;
        }
        self.connect_attempts -= 1;
        warn!(
            "No response for {} ms, reconnecting ({} attempts left)",
            self.cfg.silence_window_ms, self.connect_attempts
        );
        self.set_state(ConnectionState::Connecting);
        if let Err(e) = self.scheduler.link_mut().close() {
            debug!("Closing link before reconnect failed: {e}");
        }
        match self.open_link(now) {
            Ok(()) => WatchdogOutcome::Reconnected,
            Err(e) if self.connect_attempts == 0 => {
                warn!("Reconnect failed: {e}");
                self.fault();
                WatchdogOutcome::Faulted
            }
            Err(e) => {
                warn!("Reconnect failed: {e}");
                WatchdogOutcome::ReconnectFailed
            }
        }
    }

    fn fault(&mut self) {
        error!("Giving up on the adapter, reconnect budget exhausted");
        self.scheduler.reset_in_flight();
        self.set_state(ConnectionState::Faulted);
    }

    /// Puts the adapter to sleep. Any partial response is dropped
    pub fn suspend(&mut self) -> ConnectionResult<()> {
        match self.state {
            ConnectionState::Suspended => return Ok(()),
            ConnectionState::Ready => {}
            state => {
                return Err(ConnectionError::InvalidState {
                    state,
                    operation: "suspend",
                });
            }
        }
        self.scheduler.suspend();
        self.set_state(ConnectionState::Suspended);
        self.scheduler.link_mut().set_mode(LinkMode::Sleep)?;
        Ok(())
    }

    /// Wakes the adapter up after [ConnectionLifecycle::suspend]
    pub fn resume(&mut self, now: Instant) -> ConnectionResult<()> {
        match self.state {
            ConnectionState::Ready => return Ok(()),
            ConnectionState::Suspended => {}
            state => {
                return Err(ConnectionError::InvalidState {
                    state,
                    operation: "resume",
                });
            }
        }
        self.scheduler.link_mut().set_mode(LinkMode::Normal)?;
        self.scheduler.resume();
        // Time spent asleep does not count as silence
        self.last_activity = Some(now);
        self.set_state(ConnectionState::Ready);
        Ok(())
    }

    /// Holds back new requests, e.g. while a settings menu is open. A request already in
    /// flight still completes
    pub fn pause(&mut self) {
        self.scheduler.set_paused(true);
    }

    /// Ends [ConnectionLifecycle::pause]
    pub fn unpause(&mut self, now: Instant) {
        if self.scheduler.is_paused() {
            self.scheduler.set_paused(false);
            // Time spent paused does not count as silence
            self.last_activity = Some(now);
        }
    }

    /// Closes the adapter
    pub fn disconnect(&mut self) -> ConnectionResult<()> {
        if self.state == ConnectionState::Disconnected {
            return Ok(());
        }
        self.scheduler.reset_in_flight();
        self.set_state(ConnectionState::Disconnected);
        self.scheduler.link_mut().close()?;
        Ok(())
    }

    /// Closes the adapter and connects again with a full retry budget. This is the only way
    /// out of [ConnectionState::Faulted]
    pub fn reconnect(&mut self, now: Instant) -> ConnectionResult<()> {
        if self.scheduler.is_suspended() {
            self.scheduler.resume();
        }
        if let Err(e) = self.disconnect() {
            debug!("Closing link before reconnect failed: {e}");
        }
        self.connect(now)
    }

    fn apply_control(&mut self, now: Instant) -> ConnectionResult<()> {
        let flags = self.control.take();
        if flags.is_empty() {
            return Ok(());
        }
        debug!("Control requests {flags:?}");
        if flags.contains(ControlFlags::PAUSE) {
            self.pause();
        }
        if flags.contains(ControlFlags::UNPAUSE) {
            self.unpause(now);
        }
        if flags.contains(ControlFlags::DISCONNECT) {
            self.disconnect()?;
        }
        if flags.contains(ControlFlags::RECONNECT) {
            self.reconnect(now)?;
        }
        if flags.contains(ControlFlags::SUSPEND) {
            self.suspend()?;
        }
        if flags.contains(ControlFlags::RESUME) {
            self.resume(now)?;
        }
        Ok(())
    }

    /// Runs one step of the engine: applies control requests, runs the watchdog and, if
    /// connected, ticks the scheduler.
    ///
    /// Per command errors from the scheduler are returned for logging, the queue has already
    /// moved on when they are. [ConnectionError::Faulted] is returned on every tick while faulted
    pub fn tick(&mut self, now: Instant) -> EngineResult<TickEvent> {
        if let Err(e) = self.apply_control(now) {
            warn!("Control request failed: {e}");
        }
        if self.watchdog(now) == WatchdogOutcome::Faulted || self.state == ConnectionState::Faulted
        {
            return Err(ConnectionError::Faulted.into());
        }
        if self.state != ConnectionState::Ready {
            return Ok(TickEvent::Gated);
        }
        let res = self.scheduler.tick(now);
        if let Some(t) = self.scheduler.last_response() {
            if self.last_activity.is_none_or(|a| t > a) {
                self.last_activity = Some(t);
            }
        }
        match res {
            Ok(ev) => Ok(ev),
            Err(SchedulerError::Link(e)) => {
                debug!("Link error during tick, leaving it to the watchdog: {e}");
                Err(EngineError::Scheduler(SchedulerError::Link(e)))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Handle for other threads
    pub fn control_handle(&self) -> ControlHandle {
        self.control.clone()
    }

    /// Current state
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Reconnect attempts left
    pub fn connect_attempts(&self) -> u8 {
        self.connect_attempts
    }

    /// The wrapped scheduler
    pub fn scheduler(&self) -> &Scheduler<L, O, S> {
        &self.scheduler
    }

    /// The wrapped scheduler, mutably
    pub fn scheduler_mut(&mut self) -> &mut Scheduler<L, O, S> {
        &mut self.scheduler
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        config::SchedulerConfig,
        hardware::simulation::{RecordingSink, SimulatedLink},
        isotp::ResponseFilter,
        optimizer::AllowAll,
        queue::CommandQueue,
    };

    type TestLifecycle = ConnectionLifecycle<SimulatedLink, AllowAll, RecordingSink>;

    fn lifecycle(link: &SimulatedLink) -> TestLifecycle {
        let scheduler = Scheduler::new(
            link.clone(),
            AllowAll,
            RecordingSink::default(),
            CommandQueue::from_table(&[(0, "ATSH7E4"), (0, "2101")], 0).unwrap(),
            ResponseFilter::default(),
            SchedulerConfig::default(),
        );
        ConnectionLifecycle::new(scheduler, ConnectionConfig::default())
    }

    #[test]
    fn test_connect() {
        let _ = env_logger::try_init();
        let link = SimulatedLink::new();
        let mut c = lifecycle(&link);
        assert_eq!(ConnectionState::Disconnected, c.state());
        c.connect(Instant::now()).unwrap();
        assert_eq!(ConnectionState::Ready, c.state());
        assert_eq!(3, c.connect_attempts());
        assert!(link.is_open());
    }

    #[test]
    fn test_failed_connect_keeps_budget() {
        let link = SimulatedLink::new();
        link.fail_next_opens(1);
        let mut c = lifecycle(&link);
        let t0 = Instant::now();
        assert!(matches!(c.connect(t0), Err(ConnectionError::Link(_))));
        assert_eq!(ConnectionState::Connecting, c.state());
        assert_eq!(3, c.connect_attempts());

        assert_eq!(WatchdogOutcome::Quiet, c.watchdog(t0 + Duration::from_secs(1)));
        assert_eq!(
            WatchdogOutcome::Reconnected,
            c.watchdog(t0 + Duration::from_millis(5001))
        );
        assert_eq!(ConnectionState::Ready, c.state());
        assert_eq!(2, c.connect_attempts());
    }

    #[test]
    fn test_budget_exhaustion_faults() {
        let _ = env_logger::try_init();
        let link = SimulatedLink::new();
        let mut c = lifecycle(&link);
        let mut now = Instant::now();
        c.connect(now).unwrap();
        link.fail_next_opens(usize::MAX);

        let step = Duration::from_millis(5001);
        now += step;
        assert_eq!(WatchdogOutcome::ReconnectFailed, c.watchdog(now));
        now += step;
        assert_eq!(WatchdogOutcome::ReconnectFailed, c.watchdog(now));
        now += step;
        assert_eq!(WatchdogOutcome::Faulted, c.watchdog(now));
        assert_eq!(ConnectionState::Faulted, c.state());
        assert_eq!(0, c.connect_attempts());
        assert_eq!(4, link.open_calls());

        now += step;
        assert_eq!(WatchdogOutcome::Quiet, c.watchdog(now));
        assert_eq!(4, link.open_calls());
        assert!(matches!(
            c.tick(now),
            Err(EngineError::Connection(ConnectionError::Faulted))
        ));
        assert!(matches!(
            c.connect(now),
            Err(ConnectionError::InvalidState { .. })
        ));

        link.fail_next_opens(0);
        c.reconnect(now).unwrap();
        assert_eq!(ConnectionState::Ready, c.state());
        assert_eq!(3, c.connect_attempts());
    }

    #[test]
    fn test_responses_keep_watchdog_quiet() {
        let link = SimulatedLink::new();
        link.add_response(0x7E4, &[0x02, 0x21, 0x01], 0x7EC, &[0x61, 0x01]);
        let mut c = lifecycle(&link);
        let mut now = Instant::now();
        c.connect(now).unwrap();
        for _ in 0..40 {
            now += Duration::from_millis(250);
            c.tick(now).unwrap();
        }
        assert_eq!(1, link.open_calls());
        assert_eq!(3, c.connect_attempts());
        assert!(c.scheduler().sink().responses.len() >= 19);
    }

    #[test]
    fn test_suspend_resume() {
        let link = SimulatedLink::new();
        let mut c = lifecycle(&link);
        let t0 = Instant::now();
        c.connect(t0).unwrap();
        c.tick(t0).unwrap();
        let sent = link.sent_frames().len();

        c.suspend().unwrap();
        assert_eq!(ConnectionState::Suspended, c.state());
        assert_eq!(LinkMode::Sleep, link.mode());
        // A long sleep is not silence
        let later = t0 + Duration::from_secs(60);
        assert_eq!(TickEvent::Gated, c.tick(later).unwrap());
        assert_eq!(sent, link.sent_frames().len());
        assert_eq!(1, link.open_calls());

        c.resume(later).unwrap();
        assert_eq!(ConnectionState::Ready, c.state());
        assert_eq!(LinkMode::Normal, link.mode());
        assert!(matches!(c.tick(later).unwrap(), TickEvent::Sent { .. }));
        assert_eq!(3, c.connect_attempts());
    }

    #[test]
    fn test_invalid_transitions() {
        let link = SimulatedLink::new();
        let mut c = lifecycle(&link);
        assert!(matches!(
            c.suspend(),
            Err(ConnectionError::InvalidState {
                state: ConnectionState::Disconnected,
                ..
            })
        ));
        assert!(c.resume(Instant::now()).is_err());
    }

    #[test]
    fn test_control_handle() {
        let link = SimulatedLink::new();
        let mut c = lifecycle(&link);
        let t0 = Instant::now();
        c.connect(t0).unwrap();
        let handle = c.control_handle();

        handle.pause();
        assert_eq!(ControlFlags::PAUSE, handle.pending());
        assert_eq!(TickEvent::Gated, c.tick(t0).unwrap());
        assert!(c.scheduler().is_paused());
        assert!(handle.pending().is_empty());

        handle.unpause();
        handle.suspend();
        c.tick(t0).unwrap();
        assert_eq!(ConnectionState::Suspended, c.state());
        assert!(!c.scheduler().is_paused());

        handle.resume();
        assert!(matches!(c.tick(t0).unwrap(), TickEvent::Sent { .. }));

        handle.disconnect();
        assert_eq!(TickEvent::Gated, c.tick(t0).unwrap());
        assert_eq!(ConnectionState::Disconnected, c.state());
        assert!(!link.is_open());

        handle.reconnect();
        c.tick(t0).unwrap();
        assert_eq!(ConnectionState::Ready, c.state());
    }

    #[test]
    fn test_pause_keeps_retry_budget() {
        let link = SimulatedLink::new();
        let mut c = lifecycle(&link);
        let step = Duration::from_millis(10);
        let mut now = Instant::now();
        c.connect(now).unwrap();
        for _ in 0..10 {
            now += step;
            c.tick(now).unwrap();
        }
        let handle = c.control_handle();
        handle.pause();

        // 25 seconds in a settings menu
        for _ in 0..2500 {
            now += step;
            let _ = c.tick(now);
        }
        assert_eq!(ConnectionState::Ready, c.state());
        assert_eq!(3, c.connect_attempts());
        assert_eq!(1, link.open_calls());

        handle.unpause();
        now += step;
        assert!(matches!(c.tick(now).unwrap(), TickEvent::Sent { .. }));
        // Silence is measured from the end of the pause
        assert_eq!(WatchdogOutcome::Quiet, c.watchdog(now + Duration::from_secs(4)));
        assert_eq!(3, c.connect_attempts());
    }

    #[test]
    fn test_latest_control_request_wins() {
        let link = SimulatedLink::new();
        let mut c = lifecycle(&link);
        let t0 = Instant::now();
        c.connect(t0).unwrap();
        let handle = c.control_handle();
        handle.suspend();
        assert_eq!(TickEvent::Gated, c.tick(t0).unwrap());
        assert_eq!(ConnectionState::Suspended, c.state());

        handle.resume();
        handle.suspend();
        assert_eq!(ControlFlags::SUSPEND, handle.pending());
        assert_eq!(TickEvent::Gated, c.tick(t0).unwrap());
        assert_eq!(ConnectionState::Suspended, c.state());
        assert_eq!(LinkMode::Sleep, link.mode());
        assert!(link.sent_frames().is_empty());

        handle.resume();
        handle.unpause();
        handle.pause();
        assert_eq!(ControlFlags::RESUME | ControlFlags::PAUSE, handle.pending());
        assert_eq!(TickEvent::Gated, c.tick(t0).unwrap());
        assert_eq!(ConnectionState::Ready, c.state());
        assert!(c.scheduler().is_paused());
        assert!(link.sent_frames().is_empty());

        handle.pause();
        handle.unpause();
        assert_eq!(ControlFlags::UNPAUSE, handle.pending());
        assert!(matches!(c.tick(t0).unwrap(), TickEvent::Sent { .. }));

        handle.reconnect();
        handle.disconnect();
        assert_eq!(ControlFlags::DISCONNECT, handle.pending());
        c.tick(t0).unwrap();
        assert_eq!(ConnectionState::Disconnected, c.state());
    }
}
