// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Time sources and the periodic timer driving statistics reporting.

use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

pub trait Clock: Send + Sync {
    /// Monotonic time in milliseconds.
    fn time_in_ms(&self) -> i64;
}

/// Wall clock backed by [`Instant`], starting at zero on creation.
#[derive(Debug, Clone)]
pub struct RealTimeClock {
    start: Instant,
}

impl RealTimeClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Default for RealTimeClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for RealTimeClock {
    fn time_in_ms(&self) -> i64 {
        self.start.elapsed().as_millis() as i64
    }
}

/// Manually advanced clock.
#[derive(Debug, Default)]
pub struct SimulatedClock {
    now_ms: AtomicI64,
}

impl SimulatedClock {
    pub fn new(start_ms: i64) -> Self {
        Self {
            now_ms: AtomicI64::new(start_ms),
        }
    }

    pub fn advance_time_ms(&self, delta_ms: i64) {
        self.now_ms.fetch_add(delta_ms, Ordering::SeqCst);
    }
}

impl Clock for SimulatedClock {
    fn time_in_ms(&self) -> i64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

/// Fires once every `period_ms`. The owner polls [`ProcessTimer::time_until_process`] and calls
/// [`ProcessTimer::processed`] once it handled an elapsed period.
pub struct ProcessTimer {
    period_ms: i64,
    latest_ms: i64,
    clock: Arc<dyn Clock>,
}

impl ProcessTimer {
    pub fn new(period_ms: i64, clock: Arc<dyn Clock>) -> Self {
        let latest_ms = clock.time_in_ms();
        Self {
            period_ms,
            latest_ms,
            clock,
        }
    }

    pub fn period(&self) -> i64 {
        self.period_ms
    }

    pub fn time_until_process(&self) -> i64 {
        let elapsed = self.clock.time_in_ms() - self.latest_ms;
        (self.period_ms - elapsed).max(0)
    }

    pub fn processed(&mut self) {
        self.latest_ms = self.clock.time_in_ms();
    }
}
