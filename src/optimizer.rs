//! Vehicle plugins deciding which queued commands are worth sending
//!
//! Polling every PID on every lap wastes bus time. A vehicle can rate limit slow changing
//! values (tyre pressures, VIN) and skip data nobody is looking at (cell voltages while the
//! cell screen is closed).

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
    time::{Duration, Instant},
};

use crate::helpers;

/// Decides whether a queued command is transmitted this cycle
pub trait Optimizer {
    /// Returns false to skip `command` for this lap
    ///
    /// ## Parameters
    /// * target - Header command currently selecting the ECU (e.g. `"ATSH7E4"`)
    /// * command - The queued request
    /// * now - Current time of the engine
    fn allowed(&self, target: &str, command: &str, now: Instant) -> bool;

    /// Called after `command` was transmitted
    fn on_sent(&mut self, _target: &str, _command: &str, _now: Instant) {}

    /// Returns true if `payload` is a placeholder reply (ECU still booting, response pending)
    /// that should be ignored while waiting for the real answer.
    ///
    /// The default recognises the UDS 'response pending' negative response
    fn is_transient(&self, _target: &str, _command: &str, payload: &[u8]) -> bool {
        helpers::is_response_pending(payload)
    }
}

impl<F> Optimizer for F
where
    F: Fn(&str, &str, Instant) -> bool,
{
    fn allowed(&self, target: &str, command: &str, now: Instant) -> bool {
        self(target, command, now)
    }
}

/// Optimizer that sends everything
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AllowAll;

impl Optimizer for AllowAll {
    fn allowed(&self, _target: &str, _command: &str, _now: Instant) -> bool {
        true
    }
}

/// Minimum time between two transmissions of the same command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntervalRule {
    /// Header the rule applies to. `None` matches any header
    pub target: Option<String>,
    /// Request the rule applies to
    pub command: String,
    /// Minimum time between transmissions
    pub min_interval: Duration,
}

/// Per PID rate limiting, e.g. 'tyre pressures at most every 30 seconds'
#[derive(Debug, Clone, Default)]
pub struct IntervalOptimizer {
    rules: Vec<IntervalRule>,
    last_sent: HashMap<(String, String), Instant>,
}

impl IntervalOptimizer {
    /// Creates an optimizer with no rules
    pub fn new() -> Self {
        Self::default()
    }

    /// Limits `command` (optionally only under `target`) to one transmission per `min_interval`
    pub fn limit(mut self, target: Option<&str>, command: &str, min_interval: Duration) -> Self {
        self.rules.push(IntervalRule {
            target: target.map(str::to_string),
            command: command.to_string(),
            min_interval,
        });
        self
    }

    fn rule_for(&self, target: &str, command: &str) -> Option<&IntervalRule> {
        self.rules
            .iter()
            .find(|r| r.command == command && r.target.as_deref().is_none_or(|t| t == target))
    }
}

impl Optimizer for IntervalOptimizer {
    fn allowed(&self, target: &str, command: &str, now: Instant) -> bool {
        let Some(rule) = self.rule_for(target, command) else {
            return true;
        };
        match self.last_sent.get(&(target.to_string(), command.to_string())) {
            Some(last) => now.saturating_duration_since(*last) >= rule.min_interval,
            None => true,
        }
    }

    fn on_sent(&mut self, target: &str, command: &str, now: Instant) {
        if self.rule_for(target, command).is_some() {
            self.last_sent
                .insert((target.to_string(), command.to_string()), now);
        }
    }
}

/// Screen context shared between the UI thread and a [ContextGate]
#[derive(Debug, Clone, Default)]
pub struct ScreenContext(Arc<AtomicU32>);

impl ScreenContext {
    /// Creates a context showing `screen`
    pub fn new(screen: u32) -> Self {
        Self(Arc::new(AtomicU32::new(screen)))
    }

    /// Called by the UI whenever the displayed screen changes
    pub fn set(&self, screen: u32) {
        self.0.store(screen, Ordering::Relaxed);
    }

    /// Currently displayed screen
    pub fn get(&self) -> u32 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Skips commands whose data is only shown on specific screens
#[derive(Debug, Clone)]
pub struct ContextGate {
    context: ScreenContext,
    rules: Vec<(String, String, Vec<u32>)>,
}

impl ContextGate {
    /// Creates a gate reading the given screen context
    pub fn new(context: ScreenContext) -> Self {
        Self {
            context,
            rules: Vec::new(),
        }
    }

    /// Only send `command` under `target` while one of `screens` is displayed
    pub fn only_on(mut self, target: &str, command: &str, screens: &[u32]) -> Self {
        self.rules
            .push((target.to_string(), command.to_string(), screens.to_vec()));
        self
    }
}

impl Optimizer for ContextGate {
    fn allowed(&self, target: &str, command: &str, _now: Instant) -> bool {
        let screen = self.context.get();
        self.rules
            .iter()
            .filter(|(t, c, _)| t == target && c == command)
            .all(|(_, _, screens)| screens.contains(&screen))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interval_optimizer() {
        let mut o =
            IntervalOptimizer::new().limit(Some("ATSH7A0"), "22C00B", Duration::from_secs(30));
        let t0 = Instant::now();
        assert!(o.allowed("ATSH7A0", "22C00B", t0));
        o.on_sent("ATSH7A0", "22C00B", t0);
        assert!(!o.allowed("ATSH7A0", "22C00B", t0 + Duration::from_secs(10)));
        assert!(o.allowed("ATSH7A0", "22C00B", t0 + Duration::from_secs(30)));
        // Same request under another header is unaffected
        assert!(o.allowed("ATSH7E4", "22C00B", t0 + Duration::from_secs(1)));
        assert!(o.allowed("ATSH7A0", "220100", t0 + Duration::from_secs(1)));
    }

    #[test]
    fn test_context_gate() {
        let ctx = ScreenContext::new(1);
        let gate = ContextGate::new(ctx.clone()).only_on("ATSH7E4", "220102", &[5, 6]);
        let now = Instant::now();
        assert!(!gate.allowed("ATSH7E4", "220102", now));
        assert!(gate.allowed("ATSH7E4", "220101", now));
        ctx.set(6);
        assert!(gate.allowed("ATSH7E4", "220102", now));
    }

    #[test]
    fn test_closure_optimizer() {
        let o = |_t: &str, c: &str, _n: Instant| c != "2180";
        assert!(o.allowed("ATSH7E4", "2101", Instant::now()));
        assert!(!Optimizer::allowed(&o, "ATSH7E4", "2180", Instant::now()));
        assert!(o.is_transient("ATSH7E4", "2101", &[0x7F, 0x21, 0x78]));
    }
}
