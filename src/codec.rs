// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Codec descriptors accepted by [`crate::sender::VideoSender::register_codec`].

use std::str::FromStr;

use enumn::N;

use crate::Resolution;

/// Maximum number of simulcast streams a single send codec may carry.
pub const MAX_SIMULCAST_STREAMS: u8 = 4;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, N)]
#[repr(u8)]
pub enum VideoCodecType {
    Vp8 = 0,
    Vp9 = 1,
    H264 = 2,
    #[default]
    Generic = 3,
}

impl FromStr for VideoCodecType {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "vp8" | "VP8" => Ok(VideoCodecType::Vp8),
            "vp9" | "VP9" => Ok(VideoCodecType::Vp9),
            "h264" | "H264" => Ok(VideoCodecType::H264),
            "generic" | "GENERIC" => Ok(VideoCodecType::Generic),
            _ => Err("unrecognized codec. Valid values: vp8, vp9, h264, generic"),
        }
    }
}

/// Content hint of the encoded stream.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, N)]
#[repr(u8)]
pub enum VideoCodecMode {
    #[default]
    RealtimeVideo = 0,
    Screensharing = 1,
}

impl FromStr for VideoCodecMode {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "realtime" | "video" => Ok(VideoCodecMode::RealtimeVideo),
            "screenshare" | "screensharing" => Ok(VideoCodecMode::Screensharing),
            _ => Err("unrecognized codec mode. Valid values: realtime, screenshare"),
        }
    }
}

/// Codec specific part of [`VideoCodec`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum CodecSpecific {
    Vp8 {
        number_of_temporal_layers: u8,
        denoising_on: bool,
    },
    Vp9 {
        number_of_temporal_layers: u8,
        number_of_spatial_layers: u8,
    },
    H264 {
        key_frame_interval: u32,
    },
    #[default]
    Generic,
}

/// Send codec configuration. Bitrates are in kbps.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VideoCodec {
    pub codec_type: VideoCodecType,
    pub pl_name: String,
    pub pl_type: u8,
    pub width: u32,
    pub height: u32,
    pub start_bitrate: u32,
    pub max_bitrate: u32,
    pub min_bitrate: u32,
    pub max_framerate: u32,
    /// Zero is accepted and treated as a single stream.
    pub number_of_simulcast_streams: u8,
    pub mode: VideoCodecMode,
    pub codec_specific: CodecSpecific,
}

impl Default for VideoCodec {
    fn default() -> Self {
        Self {
            codec_type: VideoCodecType::Generic,
            pl_name: String::from("generic"),
            pl_type: 96,
            width: 320,
            height: 240,
            start_bitrate: 300,
            max_bitrate: 2000,
            min_bitrate: 30,
            max_framerate: 30,
            number_of_simulcast_streams: 0,
            mode: VideoCodecMode::RealtimeVideo,
            codec_specific: CodecSpecific::Generic,
        }
    }
}

impl VideoCodec {
    pub fn resolution(&self) -> Resolution {
        Resolution {
            width: self.width,
            height: self.height,
        }
    }

    /// Number of entries the per-stream frame type schedule needs for this codec.
    pub fn stream_count(&self) -> usize {
        usize::from(self.number_of_simulcast_streams.max(1))
    }

    /// Temporal layer count used for rate control. Codecs without temporal scalability report a
    /// single layer.
    pub fn temporal_layers(&self) -> u8 {
        match self.codec_specific {
            CodecSpecific::Vp8 {
                number_of_temporal_layers,
                ..
            }
            | CodecSpecific::Vp9 {
                number_of_temporal_layers,
                ..
            } => number_of_temporal_layers.max(1),
            CodecSpecific::H264 { .. } | CodecSpecific::Generic => 1,
        }
    }

    /// Checks the settings an encoder cannot be configured without.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.width == 0 || self.height == 0 {
            return Err("resolution must not be empty");
        }
        if self.max_framerate == 0 {
            return Err("max framerate must not be zero");
        }
        if self.number_of_simulcast_streams > MAX_SIMULCAST_STREAMS {
            return Err("too many simulcast streams");
        }
        if self.max_bitrate > 0 && self.min_bitrate > self.max_bitrate {
            return Err("min bitrate exceeds max bitrate");
        }

        Ok(())
    }

    /// Start bitrate clamped into the configured bounds.
    pub fn effective_start_bitrate(&self) -> u32 {
        let start = self.start_bitrate.max(self.min_bitrate);
        match self.max_bitrate {
            0 => start,
            max => start.min(max),
        }
    }

    /// True if the frame dropper must stay off for this codec: screen content already relies on
    /// temporal layering for rate adaptation.
    pub fn disables_frame_dropper(&self) -> bool {
        self.temporal_layers() > 1 && self.mode == VideoCodecMode::Screensharing
    }
}
