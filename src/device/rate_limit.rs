use std::{
    collections::HashMap,
    sync::{Mutex, PoisonError},
};

use crate::types::{CommandKind, RateLimitConfig};

/// Per-command-kind send throttle
///
/// A command is accepted when at least `min_interval_ms` has passed since the last
/// accepted command of the same kind. The first command of each kind is always
/// accepted. Timestamps are caller-supplied so the simulation clock drives throttling.
#[derive(Debug)]
pub struct RateLimiter {
    min_interval_ms: u64,
    last_accepted: Mutex<HashMap<CommandKind, u64>>,
}

impl RateLimiter {
    /// Create a limiter with the configured interval
    #[must_use]
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            min_interval_ms: config.min_interval_ms,
            last_accepted: Mutex::new(HashMap::new()),
        }
    }

    /// Record a send of `kind` at `now_ms` if the window allows it
    ///
    /// Returns `false` without recording anything when the previous accepted send of
    /// the same kind is too recent.
    pub fn try_acquire(&self, kind: CommandKind, now_ms: u64) -> bool {
        let mut last_accepted = self
            .last_accepted
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(&last) = last_accepted.get(&kind) {
            if now_ms.saturating_sub(last) < self.min_interval_ms {
                return false;
            }
        }
        last_accepted.insert(kind, now_ms);
        true
    }
}
