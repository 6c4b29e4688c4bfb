// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

/// Seconds of target bitrate the bucket may hold before frames get dropped.
const ACCUMULATOR_WINDOW_S: f64 = 0.5;

/// Leaky bucket deciding whether incoming frames must be skipped to stay within the target
/// bitrate. Encoded frames fill the bucket, every incoming frame drains one frame interval worth
/// of the target bitrate.
#[derive(Debug, Clone)]
pub struct FrameDropper {
    enabled: bool,
    /// Bits currently in the bucket.
    accumulator: f64,
    accumulator_max: f64,
    target_bps: f64,
}

impl Default for FrameDropper {
    fn default() -> Self {
        Self {
            enabled: true,
            accumulator: 0.0,
            accumulator_max: 0.0,
            target_bps: 0.0,
        }
    }
}

impl FrameDropper {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn reset(&mut self) {
        self.accumulator = 0.0;
        self.accumulator_max = 0.0;
        self.target_bps = 0.0;
    }

    pub fn enable(&mut self, enable: bool) {
        self.enabled = enable;
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_rates(&mut self, target_bps: u32) {
        self.target_bps = f64::from(target_bps);
        self.accumulator_max = self.target_bps * ACCUMULATOR_WINDOW_S;
    }

    /// Accounts for an encoded frame of `size_bytes`.
    pub fn fill(&mut self, size_bytes: usize) {
        if !self.enabled {
            return;
        }
        self.accumulator += (size_bytes * 8) as f64;
    }

    /// Drains one frame interval at `input_frame_rate`.
    pub fn leak(&mut self, input_frame_rate: u32) {
        if !self.enabled || input_frame_rate == 0 {
            return;
        }
        let drained = self.target_bps / f64::from(input_frame_rate);
        self.accumulator = (self.accumulator - drained).max(0.0);
    }

    pub fn drop_frame(&self) -> bool {
        self.enabled && self.target_bps > 0.0 && self.accumulator > self.accumulator_max
    }

    pub fn accumulator_bits(&self) -> f64 {
        self.accumulator
    }
}
