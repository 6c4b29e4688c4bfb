// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Adaptive video sending.
//!
//! [`sender::VideoSender`] sits between an application producing frames, a video encoder and
//! the network feedback loop. It decides which frames get encoded, keeps the encoder's bitrate
//! and frame rate in line with what the network reports, and makes sure every stream gets a key
//! frame after codec switches and explicit requests.

pub mod backend;
pub mod clock;
pub mod codec;
pub mod codec_database;
pub mod encoder;
pub mod image_processing;
pub mod media_opt;
pub mod sender;
pub mod video_frame;

pub use codec::VideoCodec;
pub use sender::VideoSender;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}
