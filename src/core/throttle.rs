use serde::{Deserialize, Serialize};

/// Throttle tuning, resolved into a per-restoration limit at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleConfig {
    /// Fixed cap on outstanding restore RPCs. `Some(0)` means unbounded.
    /// When `None`, the per-tserver value is used instead.
    pub max_concurrent_rpcs: Option<u64>,
    /// Outstanding RPCs allowed per live tablet server.
    pub max_concurrent_rpcs_per_tserver: u64,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            max_concurrent_rpcs: None,
            max_concurrent_rpcs_per_tserver: 1,
        }
    }
}

impl ThrottleConfig {
    /// Resolves the limit given the number of live tablet servers.
    ///
    /// Unknown membership falls back to the bare per-tserver value. A result
    /// of 0 means unbounded.
    /// Configured cap; 0 is unbounded.
    pub fn limit(&self, live_tservers: Option<usize>) -> u64 {
        if let Some(fixed) = self.max_concurrent_rpcs {
            return fixed;
        }
        match live_tservers {
            Some(count) if count > 0 => self
                .max_concurrent_rpcs_per_tserver
                .saturating_mul(count as u64),
            _ => self.max_concurrent_rpcs_per_tserver,
        }
    }
}

/// Bounds in-flight restore RPCs of one restoration. Local only; reset on
/// restart.
#[derive(Debug, Clone, Default)]
pub struct Throttler {
    limit: u64,
    in_flight: u64,
}

impl Throttler {
    /// `limit == 0` never refuses.
    pub fn new(limit: u64) -> Self {
        Self { limit, in_flight: 0 }
    }

    /// Takes one slot if available.
    pub fn try_acquire(&mut self) -> bool {
        let next = self.in_flight + 1;
        if self.limit != 0 && next > self.limit {
            return false;
        }
        self.in_flight = next;
        true
    }

    /// Returns one slot taken by [`Throttler::try_acquire`].
    pub fn release(&mut self) {
        if self.in_flight == 0 {
            tracing::warn!(limit = self.limit, "throttle release without matching acquire");
            return;
        }
        self.in_flight -= 1;
    }

    /// Slots currently held.
    pub fn in_flight(&self) -> u64 {
        self.in_flight
    }

    /// Configured slot cap; zero means unbounded.
    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// True when no cap applies.
    pub fn is_unbounded(&self) -> bool {
        self.limit == 0
    }
}
