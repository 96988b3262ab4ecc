//! Adaptive boost state machine
//!
//! Pure bookkeeping for worker counts and the adaptive block timeout. The
//! pool keeps one [`BoostState`] behind its mutex and asks it what to do
//! whenever a push stays blocked for a full `block_timeout`.
//!
//! # State Machine
//!
//! ```text
//! ┌──────┐  blocked past timeout  ┌─────────┐  a boost expires  ┌──────────┐
//! │ Idle │ ─────────────────────► │ Boosted │ ────────────────► │ Decaying │
//! └──────┘                        └─────────┘                   └──────────┘
//!     ▲                                ▲      blocked again          │
//!     │                                └─────────────────────────────┤
//!     │                 last boost expires                           │
//!     └──────────────────────────────────────────────────────────────┘
//! ```

use std::time::Duration;

use serde::Serialize;

use super::WorkerPoolConfig;

/// Observable boost phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BoostPhase {
    /// No boost active
    Idle,
    /// At least one boost active and none expired since the last escalation
    Boosted,
    /// Boosts are expiring and the block timeout is coming back down
    Decaying,
}

impl std::fmt::Display for BoostPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Boosted => write!(f, "boosted"),
            Self::Decaying => write!(f, "decaying"),
        }
    }
}

/// Outcome of a blocked push
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoostDecision {
    /// Spawn `workers` extra workers for `lifetime`
    Boost { workers: usize, lifetime: Duration },
    /// Boosting is not configured
    Disabled,
    /// Another pusher already escalated past the observed timeout
    AlreadyEscalated,
    /// The worker cap leaves no room for more workers
    AtCapacity,
}

/// Worker counts and adaptive timeouts of one pool
#[derive(Debug, Clone)]
pub struct BoostState {
    block_timeout: Duration,
    base_block_timeout: Duration,
    peak_block_timeout: Duration,
    boost_timeout: Duration,
    boost_workers: usize,
    max_workers: Option<usize>,
    workers: usize,
    active_boosts: usize,
}

impl BoostState {
    /// Create the initial state from pool configuration
    pub fn new(config: &WorkerPoolConfig) -> Self {
        Self {
            block_timeout: config.block_timeout,
            base_block_timeout: config.block_timeout,
            peak_block_timeout: config.block_timeout,
            boost_timeout: config.boost_timeout,
            boost_workers: config.boost_workers,
            max_workers: config.max_workers,
            workers: 0,
            active_boosts: 0,
        }
    }

    /// Both timeouts are set
    pub fn is_enabled(&self) -> bool {
        !self.block_timeout.is_zero() && !self.boost_timeout.is_zero()
    }

    /// Current workers do not exceed the cap (or there is none)
    pub fn within_limit(&self) -> bool {
        self.max_workers.map_or(true, |max| self.workers <= max)
    }

    /// Whether a push should use the boost-aware path
    pub fn should_boost_on_push(&self) -> bool {
        self.is_enabled() && self.within_limit()
    }

    /// Decide what to do after a push stayed blocked for `observed`
    ///
    /// On [`BoostDecision::Boost`] the block timeout has been doubled and the
    /// new workers are already counted.
    pub fn on_blocked(&mut self, observed: Duration) -> BoostDecision {
        if !self.is_enabled() {
            return BoostDecision::Disabled;
        }
        if self.block_timeout > observed {
            return BoostDecision::AlreadyEscalated;
        }

        let room = match self.max_workers {
            Some(max) => max.saturating_sub(self.workers),
            None => usize::MAX,
        };
        let workers = self.boost_workers.min(room);
        if workers == 0 {
            return BoostDecision::AtCapacity;
        }

        self.block_timeout = self.block_timeout.saturating_mul(2);
        self.peak_block_timeout = self.peak_block_timeout.max(self.block_timeout);
        self.workers += workers;
        self.active_boosts += 1;

        BoostDecision::Boost {
            workers,
            lifetime: self.boost_timeout,
        }
    }

    /// A boost reached the end of its lifetime
    pub fn on_boost_expired(&mut self) {
        self.active_boosts = self.active_boosts.saturating_sub(1);
        self.block_timeout = (self.block_timeout / 2).max(self.base_block_timeout);
        if self.active_boosts == 0 {
            self.peak_block_timeout = self.block_timeout;
        }
    }

    /// Count workers started outside a boost
    pub fn workers_started(&mut self, count: usize) {
        self.workers += count;
    }

    /// Count one worker that exited
    pub fn worker_stopped(&mut self) {
        self.workers = self.workers.saturating_sub(1);
    }

    /// Current phase
    pub fn phase(&self) -> BoostPhase {
        if self.active_boosts == 0 {
            BoostPhase::Idle
        } else if self.block_timeout >= self.peak_block_timeout {
            BoostPhase::Boosted
        } else {
            BoostPhase::Decaying
        }
    }

    /// Get the current block timeout
    pub fn block_timeout(&self) -> Duration {
        self.block_timeout
    }

    /// Get the boost lifetime
    pub fn boost_timeout(&self) -> Duration {
        self.boost_timeout
    }

    /// Get the number of workers added per boost
    pub fn boost_workers(&self) -> usize {
        self.boost_workers
    }

    /// Get the worker cap
    pub fn max_workers(&self) -> Option<usize> {
        self.max_workers
    }

    /// Get the number of live workers
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Get the number of boosts that have not expired
    pub fn active_boosts(&self) -> usize {
        self.active_boosts
    }

    /// Change the worker cap
    pub fn set_max_workers(&mut self, max_workers: Option<usize>) {
        self.max_workers = max_workers;
    }

    /// Change boost size, worker cap and boost lifetime together
    pub fn set_managed_settings(
        &mut self,
        boost_workers: usize,
        max_workers: Option<usize>,
        boost_timeout: Duration,
    ) {
        self.boost_workers = boost_workers;
        self.max_workers = max_workers;
        self.boost_timeout = boost_timeout;
    }
}
