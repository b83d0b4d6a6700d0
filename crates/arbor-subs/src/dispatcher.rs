// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Update dispatcher: decides when staged subscriptions are drained.
//!
//! `Idle → Staging → Draining → Idle`. The first staged subscription starts a
//! short debounce window. When it closes the dispatcher drains unless the
//! process is busy, in which case it keeps extending a slower window while the
//! event rate stays above the escalation rate. Past the ceiling it drains no
//! matter what.
//!
//! [`plan_next`] is the whole policy and is a pure function of the load seen;
//! [`Dispatcher`] only keeps the clock and counters around it.
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

// ---------------------------------------------------------------------------
// DispatcherConfig
// ---------------------------------------------------------------------------

/// Debounce tuning.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DispatcherConfig {
    /// Debounce after the first staged subscription.
    pub initial_window: Duration,
    /// First slow window once the process counts as busy.
    pub slow_window: Duration,
    /// Events since the last drain at which the process counts as busy.
    pub busy_threshold: u64,
    /// Events per millisecond above which a slow window is extended.
    pub escalation_rate: u64,
    /// Factor applied to the slow window on each extension.
    pub growth: f64,
    /// Longest a staged subscription waits.
    pub ceiling: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            initial_window: Duration::from_millis(10),
            slow_window: Duration::from_secs(1),
            busy_threshold: 1000,
            escalation_rate: 3,
            growth: 1.1,
            ceiling: Duration::from_secs(10),
        }
    }
}

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

/// Outcome of a closed window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Next {
    /// Drain now.
    Drain,
    /// Wait this long and check again.
    Extend(Duration),
}

/// Decides what follows a window that just closed.
///
/// `window` is `None` for the initial debounce window; `events` counts the
/// events since the last drain for the initial window and the events inside
/// the window otherwise. `elapsed` is the time since staging began.
pub fn plan_next(config: &DispatcherConfig, elapsed: Duration, window: Option<Duration>, events: u64) -> Next {
    if elapsed >= config.ceiling {
        return Next::Drain;
    }
    match window {
        None if events < config.busy_threshold => Next::Drain,
        None => Next::Extend(config.slow_window),
        Some(window) => {
            let budget = u128::from(config.escalation_rate) * window.as_millis().max(1);
            if u128::from(events) > budget {
                let grown = Duration::try_from_secs_f64(window.as_secs_f64() * config.growth)
                    .unwrap_or(config.ceiling);
                Next::Extend(grown)
            } else {
                Next::Drain
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// Dispatcher state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Nothing staged.
    Idle,
    /// Waiting for `deadline`.
    Staging {
        /// First staging since the last drain.
        since: Instant,
        /// When the current window closes.
        deadline: Instant,
        /// Current slow window; `None` during the initial window.
        window: Option<Duration>,
        /// Event counter when the current window opened.
        seen: u64,
    },
    /// The owner is re-executing staged subscriptions.
    Draining,
}

/// What the owner should do after a window closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Sleep until the new deadline.
    Wait(Instant),
    /// Drain staged subscriptions.
    Drain,
}

/// Timer state machine around [`plan_next`].
#[derive(Debug)]
pub struct Dispatcher {
    config: DispatcherConfig,
    phase: Phase,
    incoming: u64,
}

impl Dispatcher {
    /// Idle dispatcher.
    #[must_use]
    pub fn new(config: DispatcherConfig) -> Self {
        Self {
            config,
            phase: Phase::Idle,
            incoming: 0,
        }
    }

    /// Tuning in use.
    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Current phase.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Deadline of the open window, if staging.
    pub fn deadline(&self) -> Option<Instant> {
        match self.phase {
            Phase::Staging { deadline, .. } => Some(deadline),
            Phase::Idle | Phase::Draining => None,
        }
    }

    /// Counts incoming change events.
    pub fn record(&mut self, events: u64) {
        self.incoming = self.incoming.saturating_add(events);
    }

    /// Events counted since the last drain.
    pub fn incoming(&self) -> u64 {
        self.incoming
    }

    /// Notes that something was staged. Opens the initial window when idle
    /// and returns its deadline.
    pub fn stage(&mut self, now: Instant) -> Option<Instant> {
        if self.phase != Phase::Idle {
            return None;
        }
        let deadline = now + self.config.initial_window;
        self.phase = Phase::Staging {
            since: now,
            deadline,
            window: None,
            seen: self.incoming,
        };
        Some(deadline)
    }

    /// Called when the deadline passed.
    pub fn poll(&mut self, now: Instant) -> Decision {
        let Phase::Staging {
            since,
            deadline,
            window,
            seen,
        } = self.phase
        else {
            return Decision::Drain;
        };
        if now < deadline {
            return Decision::Wait(deadline);
        }
        let elapsed = now.saturating_duration_since(since);
        let events = match window {
            None => self.incoming,
            Some(_) => self.incoming.saturating_sub(seen),
        };
        match plan_next(&self.config, elapsed, window, events) {
            Next::Drain => {
                self.phase = Phase::Draining;
                Decision::Drain
            }
            Next::Extend(next) => {
                let deadline = (now + next).min(since + self.config.ceiling);
                debug!(window_ms = next.as_millis(), events, "update dispatch delayed under load");
                self.phase = Phase::Staging {
                    since,
                    deadline,
                    window: Some(next),
                    seen: self.incoming,
                };
                Decision::Wait(deadline)
            }
        }
    }

    /// Returns to idle after a drain and resets the event counter.
    pub fn finish(&mut self) {
        self.phase = Phase::Idle;
        self.incoming = 0;
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::panic)]
    use super::*;

    #[test]
    fn quiet_processes_drain_after_the_initial_window() {
        let config = DispatcherConfig::default();
        assert_eq!(plan_next(&config, Duration::from_millis(10), None, 5), Next::Drain);
    }

    #[test]
    fn busy_processes_switch_to_the_slow_window() {
        let config = DispatcherConfig::default();
        assert_eq!(
            plan_next(&config, Duration::from_millis(10), None, 1000),
            Next::Extend(Duration::from_secs(1))
        );
    }

    #[test]
    fn slow_windows_grow_while_the_rate_stays_high() {
        let config = DispatcherConfig::default();
        let window = Duration::from_secs(1);
        let Next::Extend(next) = plan_next(&config, Duration::from_secs(1), Some(window), 3001) else {
            panic!("expected an extension");
        };
        assert_eq!(next.as_millis(), 1100);
        assert_eq!(plan_next(&config, Duration::from_secs(1), Some(window), 3000), Next::Drain);
    }

    #[test]
    fn the_ceiling_always_drains() {
        let config = DispatcherConfig::default();
        assert_eq!(
            plan_next(&config, Duration::from_secs(10), Some(Duration::from_secs(2)), u64::MAX),
            Next::Drain
        );
    }

    #[test]
    fn staging_only_opens_one_window() {
        let mut dispatcher = Dispatcher::new(DispatcherConfig::default());
        let now = Instant::now();
        assert_eq!(dispatcher.stage(now), Some(now + Duration::from_millis(10)));
        assert_eq!(dispatcher.stage(now + Duration::from_millis(1)), None);
        assert_eq!(dispatcher.poll(now + Duration::from_millis(5)), Decision::Wait(now + Duration::from_millis(10)));
        assert_eq!(dispatcher.poll(now + Duration::from_millis(10)), Decision::Drain);
        assert_eq!(dispatcher.phase(), Phase::Draining);
        dispatcher.finish();
        assert_eq!(dispatcher.phase(), Phase::Idle);
    }

    #[test]
    fn extensions_never_pass_the_ceiling() {
        let config = DispatcherConfig {
            ceiling: Duration::from_millis(1500),
            ..DispatcherConfig::default()
        };
        let mut dispatcher = Dispatcher::new(config);
        let start = Instant::now();
        dispatcher.record(5000);
        dispatcher.stage(start);
        let Decision::Wait(first) = dispatcher.poll(start + config.initial_window) else {
            panic!("busy process should wait");
        };
        dispatcher.record(1_000_000);
        let Decision::Wait(second) = dispatcher.poll(first) else {
            panic!("rate above threshold should wait");
        };
        assert_eq!(second, start + config.ceiling);
        assert_eq!(dispatcher.poll(second), Decision::Drain);
    }
}
