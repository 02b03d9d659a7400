//! Decaying per-address failure counters for download abuse throttling.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Failures at or above this count get a rate-limited response.
pub const FAILURE_THRESHOLD: u32 = 5;

/// A counter untouched for this long reads as zero.
const DECAY_WINDOW: Duration = Duration::from_secs(120);

#[derive(Debug)]
struct FailureWindow {
    fail_count: u32,
    last_activity: Instant,
}

impl FailureWindow {
    fn decayed(&self) -> bool {
        self.last_activity.elapsed() > DECAY_WINDOW
    }
}

/// Table of failure counters keyed by client address.
#[derive(Debug, Default)]
pub struct AbuseLedger {
    counters: Mutex<HashMap<IpAddr, FailureWindow>>,
}

impl AbuseLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one failed lookup from `address`. A counter past its decay
    /// window restarts from zero before the increment.
    pub fn record_failure(&self, address: IpAddr) {
        let mut counters = self.counters.lock().expect("abuse ledger lock poisoned");
        let window = counters.entry(address).or_insert(FailureWindow {
            fail_count: 0,
            last_activity: Instant::now(),
        });
        if window.decayed() {
            window.fail_count = 0;
        }
        window.fail_count += 1;
        window.last_activity = Instant::now();
    }

    /// Current effective count for `address`; read-only, decay-aware.
    pub fn current_count(&self, address: IpAddr) -> u32 {
        let counters = self.counters.lock().expect("abuse ledger lock poisoned");
        match counters.get(&address) {
            Some(window) if !window.decayed() => window.fail_count,
            _ => 0,
        }
    }

    /// Drop every counter that has decayed to zero.
    pub fn compact(&self) {
        let mut counters = self.counters.lock().expect("abuse ledger lock poisoned");
        counters.retain(|_, window| !window.decayed());
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.counters.lock().unwrap().len()
    }
}
