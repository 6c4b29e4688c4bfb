// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Rate control consulted by [`crate::sender::VideoSender`].
//!
//! The sender treats rate control as an oracle behind [`RateController`]. [`MediaOptimization`]
//! is the implementation used by default: it clamps the network target to the codec limits,
//! estimates the incoming frame rate, runs a [`FrameDropper`] and keeps send statistics.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::clock::Clock;
use crate::encoder::EncodedImage;

pub mod frame_dropper;

pub use frame_dropper::FrameDropper;

/// Maximum number of incoming frame timestamps kept for frame rate estimation.
const FRAME_COUNT_HISTORY_SIZE: usize = 90;
/// Incoming frames older than this do not count towards the frame rate estimate.
const FRAME_HISTORY_WIN_MS: i64 = 2000;
/// Window used for the sent bitrate and frame rate statistics.
const BITRATE_AVERAGE_WIN_MS: i64 = 1000;

/// Codec sizing handed to the rate controller on every codec registration.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct EncodingData {
    /// Bits per second, zero when unbounded.
    pub max_bitrate: u32,
    /// Bits per second.
    pub start_bitrate: u32,
    pub width: u32,
    pub height: u32,
    pub max_framerate: u32,
    pub num_temporal_layers: u8,
    pub max_payload_size: usize,
}

pub trait RateController: Send {
    /// Resets the controller for a newly registered codec.
    fn set_encoding_data(&mut self, data: EncodingData);

    /// Feeds network feedback and returns the bitrate the encoder should target.
    fn set_target_rates(&mut self, target_bitrate: u32, loss_rate: u8, rtt: i64) -> u32;

    /// Estimated frame rate of the incoming frames, zero while unknown.
    fn input_frame_rate(&mut self) -> u32;

    /// Called once per incoming frame. Returns true if the frame must not be encoded.
    fn drop_frame(&mut self) -> bool;

    fn enable_frame_dropper(&mut self, enable: bool);

    /// Accounts for encoder output.
    fn update_with_encoded_data(&mut self, image: &EncodedImage);

    fn sent_bitrate(&mut self) -> u32;

    fn sent_frame_rate(&mut self) -> u32;
}

#[derive(Copy, Clone, Debug)]
struct EncodedFrameSample {
    size_bytes: usize,
    timestamp: u32,
    time_complete_ms: i64,
}

pub struct MediaOptimization {
    clock: Arc<dyn Clock>,
    encoding: EncodingData,
    target_bitrate: u32,
    loss_rate: u8,
    rtt: i64,
    frame_dropper: FrameDropper,
    incoming_frame_times: VecDeque<i64>,
    encoded_frame_samples: VecDeque<EncodedFrameSample>,
}

impl MediaOptimization {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            encoding: Default::default(),
            target_bitrate: 0,
            loss_rate: 0,
            rtt: 0,
            frame_dropper: FrameDropper::new(),
            incoming_frame_times: Default::default(),
            encoded_frame_samples: Default::default(),
        }
    }

    pub fn reset(&mut self) {
        self.incoming_frame_times.clear();
        self.encoded_frame_samples.clear();
        self.frame_dropper.reset();
        self.target_bitrate = 0;
        self.loss_rate = 0;
        self.rtt = 0;
    }

    pub fn frame_dropper_enabled(&self) -> bool {
        self.frame_dropper.enabled()
    }

    pub fn target_bitrate(&self) -> u32 {
        self.target_bitrate
    }

    pub fn loss_rate(&self) -> u8 {
        self.loss_rate
    }

    pub fn rtt(&self) -> i64 {
        self.rtt
    }

    fn purge_old_frame_times(&mut self, now_ms: i64) {
        while let Some(&oldest) = self.incoming_frame_times.front() {
            if now_ms - oldest <= FRAME_HISTORY_WIN_MS {
                break;
            }
            self.incoming_frame_times.pop_front();
        }
    }

    fn purge_old_encoded_samples(&mut self, now_ms: i64) {
        while let Some(oldest) = self.encoded_frame_samples.front() {
            if now_ms - oldest.time_complete_ms < BITRATE_AVERAGE_WIN_MS {
                break;
            }
            self.encoded_frame_samples.pop_front();
        }
    }

    fn update_incoming_frame_rate(&mut self) {
        let now_ms = self.clock.time_in_ms();
        self.incoming_frame_times.push_back(now_ms);
        if self.incoming_frame_times.len() > FRAME_COUNT_HISTORY_SIZE {
            self.incoming_frame_times.pop_front();
        }
    }
}

impl RateController for MediaOptimization {
    fn set_encoding_data(&mut self, data: EncodingData) {
        log::debug!(
            "encoding data: max bitrate {} start bitrate {} {}x{}@{} layers {} payload {}",
            data.max_bitrate,
            data.start_bitrate,
            data.width,
            data.height,
            data.max_framerate,
            data.num_temporal_layers,
            data.max_payload_size
        );

        self.reset();
        self.encoding = data;
        self.target_bitrate = data.start_bitrate;
        self.frame_dropper.set_rates(data.start_bitrate);
    }

    fn set_target_rates(&mut self, target_bitrate: u32, loss_rate: u8, rtt: i64) -> u32 {
        let target = match self.encoding.max_bitrate {
            0 => target_bitrate,
            max => target_bitrate.min(max),
        };

        self.target_bitrate = target;
        self.loss_rate = loss_rate;
        self.rtt = rtt;
        self.frame_dropper.set_rates(target);

        target
    }

    fn input_frame_rate(&mut self) -> u32 {
        let now_ms = self.clock.time_in_ms();
        self.purge_old_frame_times(now_ms);

        let (Some(&oldest), Some(&newest)) = (
            self.incoming_frame_times.front(),
            self.incoming_frame_times.back(),
        ) else {
            return 0;
        };

        let span_ms = newest - oldest;
        if span_ms <= 0 {
            return 0;
        }

        let intervals = (self.incoming_frame_times.len() - 1) as i64;
        ((intervals * 1000 + span_ms / 2) / span_ms) as u32
    }

    fn drop_frame(&mut self) -> bool {
        self.update_incoming_frame_rate();
        let input_frame_rate = self.input_frame_rate();
        self.frame_dropper.leak(input_frame_rate);

        self.frame_dropper.drop_frame()
    }

    fn enable_frame_dropper(&mut self, enable: bool) {
        self.frame_dropper.enable(enable);
    }

    fn update_with_encoded_data(&mut self, image: &EncodedImage) {
        let now_ms = self.clock.time_in_ms();
        self.purge_old_encoded_samples(now_ms);
        self.encoded_frame_samples.push_back(EncodedFrameSample {
            size_bytes: image.size(),
            timestamp: image.timestamp,
            time_complete_ms: now_ms,
        });
        self.frame_dropper.fill(image.size());
    }

    fn sent_bitrate(&mut self) -> u32 {
        let now_ms = self.clock.time_in_ms();
        self.purge_old_encoded_samples(now_ms);

        let bytes: usize = self.encoded_frame_samples.iter().map(|s| s.size_bytes).sum();
        (bytes as u64 * 8 * 1000 / BITRATE_AVERAGE_WIN_MS as u64) as u32
    }

    fn sent_frame_rate(&mut self) -> u32 {
        let now_ms = self.clock.time_in_ms();
        self.purge_old_encoded_samples(now_ms);

        // Simulcast streams of the same frame share the timestamp.
        let mut frames = 0;
        let mut last_timestamp = None;
        for sample in &self.encoded_frame_samples {
            if last_timestamp != Some(sample.timestamp) {
                frames += 1;
                last_timestamp = Some(sample.timestamp);
            }
        }

        (frames as i64 * 1000 / BITRATE_AVERAGE_WIN_MS) as u32
    }
}
