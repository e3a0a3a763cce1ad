//! Network-adjusted time.
//!
//! Every scheduling decision reads time through [`TimeSource`]. The live node
//! uses [`NetworkClock`]: local wall clock plus an offset learned from the
//! first completed peer handshake and never changed afterwards.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Instant;

use chrono::Utc;

/// A source of unix-millisecond timestamps.
pub trait TimeSource: Send + Sync {
    fn current_time_millis(&self) -> i64;
}

/// Wall clock adjusted by a set-once network offset.
#[derive(Debug)]
pub struct NetworkClock {
    offset: AtomicI64,
    initialized: AtomicBool,
    started: Instant,
}

impl NetworkClock {
    pub fn new() -> Self {
        Self {
            offset: AtomicI64::new(0),
            initialized: AtomicBool::new(false),
            started: Instant::now(),
        }
    }

    /// Install the network offset. Only the first call has an effect;
    /// returns whether this call installed it.
    pub fn set_offset_once(&self, offset_millis: i64) -> bool {
        if self
            .initialized
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.offset.store(offset_millis, Ordering::Release);
            true
        } else {
            false
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    pub fn offset_millis(&self) -> i64 {
        self.offset.load(Ordering::Acquire)
    }

    /// Unadjusted local time.
    pub fn local_time_millis(&self) -> i64 {
        Utc::now().timestamp_millis()
    }

    pub fn uptime(&self) -> std::time::Duration {
        self.started.elapsed()
    }
}

impl Default for NetworkClock {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource for NetworkClock {
    fn current_time_millis(&self) -> i64 {
        self.local_time_millis() + self.offset_millis()
    }
}

/// Manually driven clock for tests and simulations.
#[derive(Debug, Default)]
pub struct MockClock {
    now: AtomicI64,
}

impl MockClock {
    pub fn new(start_millis: i64) -> Self {
        Self {
            now: AtomicI64::new(start_millis),
        }
    }

    pub fn set(&self, millis: i64) {
        self.now.store(millis, Ordering::SeqCst);
    }

    /// Roll the clock forward.
    pub fn advance(&self, millis: i64) {
        self.now.fetch_add(millis, Ordering::SeqCst);
    }
}

impl TimeSource for MockClock {
    fn current_time_millis(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}
