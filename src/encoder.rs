// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The encoder capability surface driven by [`crate::sender::VideoSender`].
//!
//! Encoders come in two flavors. Frame driven encoders receive every raw frame through
//! [`VideoEncoder::encode`]. Internal source encoders capture their own input (eg. from a
//! hardware pipeline) and never see a frame, so parameter changes and key frame requests have to
//! be pushed to them proactively. Independently of that, an encoder may or may not be able to
//! read [`crate::video_frame::FrameBuffer::Native`] frames.

use std::sync::Arc;
use std::sync::Mutex;

use bytes::Bytes;
use thiserror::Error;

use crate::codec::VideoCodec;
use crate::codec::VideoCodecType;
use crate::video_frame::VideoFrame;

/// Status codes an encoder may report. The numeric values are stable and propagated to the
/// caller untouched, see [`EncodeError::code`].
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum EncodeError {
    #[error("encoder error")]
    Error,
    #[error("encoder level exceeded")]
    LevelExceeded,
    #[error("encoder out of memory")]
    Memory,
    #[error("invalid encoder parameter")]
    ErrParameter,
    #[error("invalid frame size")]
    ErrSize,
    #[error("encoder timed out")]
    Timeout,
    #[error("encoder not initialized")]
    Uninitialized,
    #[error("encoder requested fallback to software")]
    FallbackSoftware,
    #[error("encoder does not support the operation")]
    Unsupported,
    #[error("encoder returned status {0}")]
    Other(i32),
}

impl EncodeError {
    /// Negative status code of this error.
    pub fn code(&self) -> i32 {
        match self {
            EncodeError::Error => -1,
            EncodeError::LevelExceeded => -2,
            EncodeError::Memory => -3,
            EncodeError::ErrParameter => -4,
            EncodeError::ErrSize => -5,
            EncodeError::Timeout => -6,
            EncodeError::Uninitialized => -7,
            EncodeError::FallbackSoftware => -13,
            EncodeError::Unsupported => -15,
            EncodeError::Other(code) => *code,
        }
    }

    /// Maps a raw status code back to an error. Non negative codes are successes.
    pub fn from_code(code: i32) -> Option<Self> {
        let err = match code {
            code if code >= 0 => return None,
            -1 => EncodeError::Error,
            -2 => EncodeError::LevelExceeded,
            -3 => EncodeError::Memory,
            -4 => EncodeError::ErrParameter,
            -5 => EncodeError::ErrSize,
            -6 => EncodeError::Timeout,
            -7 => EncodeError::Uninitialized,
            -13 => EncodeError::FallbackSoftware,
            -15 => EncodeError::Unsupported,
            other => EncodeError::Other(other),
        };
        Some(err)
    }
}

pub type EncodeResult<T> = Result<T, EncodeError>;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum FrameType {
    /// Self contained frame, decodable without any earlier frame.
    #[default]
    Key,
    Delta,
}

/// Rate parameters handed to the encoder. Replaced as a whole, never patched field by field.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct EncoderParameters {
    /// Bits per second.
    pub target_bitrate: u32,
    /// Fraction of lost packets, scaled to 0..=255.
    pub loss_rate: u8,
    /// Round trip time in milliseconds.
    pub rtt: i64,
    /// Frames per second. Zero means no estimate is available yet.
    pub input_frame_rate: u32,
}

/// Side information the application passes along with a frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CodecSpecificInfo {
    Vp8 {
        picture_id: Option<u16>,
        simulcast_idx: u8,
        temporal_idx: Option<u8>,
        non_reference: bool,
    },
    Vp9 {
        picture_id: Option<u16>,
        spatial_idx: Option<u8>,
        temporal_idx: Option<u8>,
    },
    H264 {
        simulcast_idx: u8,
    },
    Generic {
        simulcast_idx: u8,
    },
}

impl CodecSpecificInfo {
    pub fn codec_type(&self) -> VideoCodecType {
        match self {
            CodecSpecificInfo::Vp8 { .. } => VideoCodecType::Vp8,
            CodecSpecificInfo::Vp9 { .. } => VideoCodecType::Vp9,
            CodecSpecificInfo::H264 { .. } => VideoCodecType::H264,
            CodecSpecificInfo::Generic { .. } => VideoCodecType::Generic,
        }
    }
}

/// Encoder output for a single stream.
#[derive(Clone, Debug)]
pub struct EncodedImage {
    pub bitstream: Bytes,
    pub frame_type: FrameType,
    /// RTP timestamp of the source frame.
    pub timestamp: u32,
    pub encoded_width: u32,
    pub encoded_height: u32,
    pub simulcast_idx: usize,
}

impl EncodedImage {
    pub fn size(&self) -> usize {
        self.bitstream.len()
    }
}

/// Sink for [`EncodedImage`]s produced by an encoder.
pub trait EncodedImageCallback: Send + Sync {
    fn on_encoded_image(&self, image: &EncodedImage);
}

/// Capabilities the coordinator caches whenever the active encoder changes.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct EncoderCapabilities {
    pub has_internal_source: bool,
    pub supports_native_buffer: bool,
}

/// Video encoder interface.
pub trait VideoEncoder: Send {
    /// (Re)initializes the encoder for `codec`.
    fn init_encode(
        &mut self,
        codec: &VideoCodec,
        number_of_cores: u32,
        max_payload_size: usize,
    ) -> EncodeResult<()>;

    /// Sets where encoded output goes. Called before [`VideoEncoder::init_encode`].
    fn register_encode_complete_callback(&mut self, callback: Arc<dyn EncodedImageCallback>);

    /// Frees the resources acquired in [`VideoEncoder::init_encode`].
    fn release(&mut self) -> EncodeResult<()> {
        Ok(())
    }

    /// Encodes `frame`. `frame_types` holds the requested frame type of every simulcast stream.
    fn encode(
        &mut self,
        frame: &VideoFrame,
        codec_specific_info: Option<&CodecSpecificInfo>,
        frame_types: &[FrameType],
    ) -> EncodeResult<()>;

    /// Informs the encoder that a frame was skipped by the frame dropper.
    fn on_dropped_frame(&mut self) {}

    fn set_parameters(&mut self, params: &EncoderParameters) -> EncodeResult<()>;

    /// Last parameters applied with [`VideoEncoder::set_parameters`].
    fn parameters(&self) -> EncoderParameters;

    /// Asks an internal source encoder to produce a frame of the given types right away.
    fn request_frame(&mut self, _frame_types: &[FrameType]) -> EncodeResult<()> {
        Err(EncodeError::Unsupported)
    }

    fn internal_source(&self) -> bool {
        false
    }

    fn supports_native_buffer(&self) -> bool {
        false
    }

    fn implementation_name(&self) -> &str {
        "unknown"
    }
}

/// Encoder shared between the codec registry and the coordinator. The coordinator only locks it
/// while holding its own encoder lock.
pub type SharedEncoder = Arc<Mutex<dyn VideoEncoder>>;

pub fn shared<E: VideoEncoder + 'static>(encoder: E) -> SharedEncoder {
    Arc::new(Mutex::new(encoder))
}
