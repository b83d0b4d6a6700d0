// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
#![allow(missing_docs)]
//! Debounce escalation under synthetic load.

use std::time::Duration;

use arbor_subs::dispatcher::{Decision, Dispatcher, DispatcherConfig};
use proptest::prelude::*;
use tokio::time::Instant;

// Runs one staging cycle with `rate` events per millisecond arriving
// continuously. Returns how long after staging the drain fired.
fn drain_delay(config: DispatcherConfig, backlog: u64, rate: u64) -> Duration {
    let mut dispatcher = Dispatcher::new(config);
    let start = Instant::now();
    dispatcher.record(backlog);
    let mut now = start;
    let Some(mut deadline) = dispatcher.stage(start) else {
        return Duration::MAX;
    };
    loop {
        let elapsed_ms = u64::try_from(deadline.duration_since(now).as_millis()).unwrap_or(u64::MAX);
        dispatcher.record(rate.saturating_mul(elapsed_ms));
        now = deadline;
        match dispatcher.poll(now) {
            Decision::Drain => return now.duration_since(start),
            Decision::Wait(next) => deadline = next,
        }
    }
}

proptest! {
    #[test]
    fn overload_delays_the_drain_but_never_past_the_ceiling(rate in 4u64..10_000, backlog in 1000u64..100_000) {
        let config = DispatcherConfig::default();
        let delay = drain_delay(config, backlog, rate);
        prop_assert!(delay > config.initial_window);
        prop_assert!(delay <= config.ceiling);
    }

    #[test]
    fn quiet_load_drains_after_the_initial_window(rate in 0u64..3, backlog in 0u64..900) {
        let config = DispatcherConfig::default();
        prop_assert_eq!(drain_delay(config, backlog, rate), config.initial_window);
    }

    #[test]
    fn any_ceiling_bounds_the_delay(ceiling_ms in 20u64..20_000, rate in 0u64..1000) {
        let config = DispatcherConfig {
            ceiling: Duration::from_millis(ceiling_ms),
            ..DispatcherConfig::default()
        };
        let delay = drain_delay(config, 5000, rate);
        prop_assert!(delay <= config.ceiling);
    }
}
