//! Streak-based health heuristics evaluated once per tick.
//!
//! Each heuristic must hold for [`STREAK_TO_FIRE`] consecutive ticks before
//! it fires. Firing logs a warning, records the time and resets the streak,
//! so a persistent condition fires once every three ticks rather than on
//! every tick.

use std::fmt;

use tracing::warn;

use super::circuit_breaker::BreakerState;

pub const STREAK_TO_FIRE: u32 = 3;

const LEAK_FREE_RATIO: f64 = 0.01;
const SKEW_FREE_RATIO: f64 = 0.90;
const SKEW_ACQUIRED_RATIO: f64 = 0.10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatchdogFlag {
    /// Permits exhausted while nothing runs.
    PermitLeak,
    /// Plenty of free permits but the cycle acquires a small fraction of
    /// what is ready.
    CapacitySkew,
    /// Ready work and no acquisitions while the store is healthy.
    ZeroProgress,
    /// The store breaker is not closed.
    StoreStall,
}

impl WatchdogFlag {
    pub const ALL: [WatchdogFlag; 4] = [
        WatchdogFlag::PermitLeak,
        WatchdogFlag::CapacitySkew,
        WatchdogFlag::ZeroProgress,
        WatchdogFlag::StoreStall,
    ];

    pub fn label(self) -> &'static str {
        match self {
            WatchdogFlag::PermitLeak => "permit_leak",
            WatchdogFlag::CapacitySkew => "capacity_skew",
            WatchdogFlag::ZeroProgress => "zero_progress",
            WatchdogFlag::StoreStall => "store_stall",
        }
    }

    fn index(self) -> usize {
        match self {
            WatchdogFlag::PermitLeak => 0,
            WatchdogFlag::CapacitySkew => 1,
            WatchdogFlag::ZeroProgress => 2,
            WatchdogFlag::StoreStall => 3,
        }
    }
}

impl fmt::Display for WatchdogFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Observations for one tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WatchdogInputs {
    /// Configured maximum permits; 0 when unbounded.
    pub max_permits: usize,
    /// Free permits; `None` when unbounded.
    pub available_permits: Option<usize>,
    pub pool_active: usize,
    /// Locally runnable ready entries from the last diagnostics sample.
    pub ready: usize,
    pub acquired: usize,
    /// Free slots at cycle start; `None` when unbounded.
    pub capacity: Option<usize>,
    pub store_breaker: BreakerState,
    pub degraded: bool,
}

impl WatchdogInputs {
    fn free_ratio(&self) -> f64 {
        match self.available_permits {
            Some(available) if self.max_permits > 0 => available as f64 / self.max_permits as f64,
            _ => 1.0,
        }
    }

    fn store_stall(&self) -> bool {
        self.store_breaker != BreakerState::Closed
    }

    /// Conditions that hold this tick, before streaks are applied.
    pub fn conditions(&self) -> Vec<WatchdogFlag> {
        let free = self.free_ratio();
        let stall = self.store_stall();
        let mut raised = Vec::new();

        if self.max_permits > 0 && free < LEAK_FREE_RATIO && self.pool_active == 0 && self.ready > 0
        {
            raised.push(WatchdogFlag::PermitLeak);
        }

        let denominator = self.capacity.unwrap_or(self.ready);
        if self.ready > 0 && free > SKEW_FREE_RATIO && denominator > 0 {
            let acquired_ratio = self.acquired as f64 / denominator as f64;
            if acquired_ratio < SKEW_ACQUIRED_RATIO {
                raised.push(WatchdogFlag::CapacitySkew);
            }
        }

        if self.ready > 0 && self.acquired == 0 && !stall {
            raised.push(WatchdogFlag::ZeroProgress);
        }
        if stall {
            raised.push(WatchdogFlag::StoreStall);
        }
        raised
    }

    fn starving(&self) -> bool {
        self.available_permits == Some(0) && self.pool_active == 0 && self.degraded
    }
}

#[derive(Debug, Default)]
pub struct Watchdog {
    streaks: [u32; 4],
    last_fired_ms: [Option<i64>; 4],
    starvation_streak: u32,
}

impl Watchdog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies one tick of observations. Returns the flags that fired.
    pub fn evaluate(&mut self, inputs: &WatchdogInputs, now_ms: i64) -> Vec<WatchdogFlag> {
        let raised = inputs.conditions();
        let mut fired = Vec::new();

        for flag in WatchdogFlag::ALL {
            let i = flag.index();
            if !raised.contains(&flag) {
                self.streaks[i] = 0;
                continue;
            }
            self.streaks[i] += 1;
            if self.streaks[i] >= STREAK_TO_FIRE {
                self.streaks[i] = 0;
                self.last_fired_ms[i] = Some(now_ms);
                fired.push(flag);
                warn!(
                    watchdog = flag.label(),
                    ready = inputs.ready,
                    acquired = inputs.acquired,
                    available_permits = ?inputs.available_permits,
                    max_permits = inputs.max_permits,
                    pool_active = inputs.pool_active,
                    store_breaker = %inputs.store_breaker,
                    "Scheduler watchdog fired"
                );
            }
        }

        if inputs.starving() {
            self.starvation_streak += 1;
        } else {
            self.starvation_streak = 0;
        }
        fired
    }

    pub fn streak(&self, flag: WatchdogFlag) -> u32 {
        self.streaks[flag.index()]
    }

    pub fn last_fired_ms(&self, flag: WatchdogFlag) -> Option<i64> {
        self.last_fired_ms[flag.index()]
    }

    pub fn is_starving(&self) -> bool {
        self.starvation_streak >= STREAK_TO_FIRE
    }

    /// `flag=<seconds since last fire>s` for every flag that has fired,
    /// or `none`.
    pub fn summary(&self, now_ms: i64) -> String {
        let fired: Vec<String> = WatchdogFlag::ALL
            .iter()
            .filter_map(|flag| {
                self.last_fired_ms(*flag)
                    .map(|at| format!("{}={}s", flag, (now_ms - at).max(0) / 1000))
            })
            .collect();
        if fired.is_empty() {
            "none".to_string()
        } else {
            fired.join(",")
        }
    }
}
