// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Raw frames submitted to [`crate::sender::VideoSender::submit_frame`].

use std::fmt::Debug;
use std::sync::Arc;

use bytes::Bytes;

use crate::image_processing::i420_frame_size;
use crate::image_processing::nv12_to_i420;
use crate::Resolution;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum VideoRotation {
    #[default]
    Rotation0,
    Rotation90,
    Rotation180,
    Rotation270,
}

/// Tightly packed I420 frame data: the Y plane followed by the U and V planes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct I420Buffer {
    resolution: Resolution,
    data: Bytes,
}

impl I420Buffer {
    /// Wraps `data`, which must hold at least a full I420 frame of `resolution`.
    pub fn new(resolution: Resolution, data: Bytes) -> Option<Self> {
        let needed = i420_frame_size(resolution.width as usize, resolution.height as usize);
        if data.len() < needed {
            return None;
        }

        Some(Self { resolution, data })
    }

    /// Mid-gray frame, mostly useful for synthetic sources.
    pub fn gray(resolution: Resolution) -> Self {
        let size = i420_frame_size(resolution.width as usize, resolution.height as usize);
        Self {
            resolution,
            data: Bytes::from(vec![0x80; size]),
        }
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }
}

/// A frame living in platform memory (DMA buffer, GPU texture, capture device memory...) that
/// software encoders cannot read directly.
pub trait NativeBuffer: Send + Sync + Debug {
    fn resolution(&self) -> Resolution;

    /// Produces a CPU readable copy of the frame.
    fn to_i420(&self) -> anyhow::Result<I420Buffer>;
}

/// NV12 frame mapped from a native allocation, with arbitrary plane strides and offsets.
#[derive(Debug)]
pub struct MappedNv12Buffer {
    resolution: Resolution,
    data: Bytes,
    strides: [usize; 2],
    offsets: [usize; 2],
}

impl MappedNv12Buffer {
    pub fn new(
        resolution: Resolution,
        data: Bytes,
        strides: [usize; 2],
        offsets: [usize; 2],
    ) -> Self {
        Self {
            resolution,
            data,
            strides,
            offsets,
        }
    }
}

impl NativeBuffer for MappedNv12Buffer {
    fn resolution(&self) -> Resolution {
        self.resolution
    }

    fn to_i420(&self) -> anyhow::Result<I420Buffer> {
        let width = self.resolution.width as usize;
        let height = self.resolution.height as usize;
        let mut dst = vec![0u8; i420_frame_size(width, height)];

        nv12_to_i420(
            &self.data,
            &mut dst,
            width,
            height,
            self.strides,
            self.offsets,
        )?;

        Ok(I420Buffer {
            resolution: self.resolution,
            data: Bytes::from(dst),
        })
    }
}

#[derive(Clone, Debug)]
pub enum FrameBuffer {
    I420(I420Buffer),
    Native(Arc<dyn NativeBuffer>),
}

impl FrameBuffer {
    pub fn resolution(&self) -> Resolution {
        match self {
            FrameBuffer::I420(buffer) => buffer.resolution(),
            FrameBuffer::Native(buffer) => buffer.resolution(),
        }
    }

    pub fn is_native(&self) -> bool {
        matches!(self, FrameBuffer::Native(_))
    }
}

#[derive(Clone, Debug)]
pub struct VideoFrame {
    pub buffer: FrameBuffer,
    /// RTP timestamp, 90 kHz.
    pub timestamp: u32,
    pub render_time_ms: i64,
    pub rotation: VideoRotation,
}

impl VideoFrame {
    pub fn new(buffer: FrameBuffer, timestamp: u32, render_time_ms: i64) -> Self {
        Self {
            buffer,
            timestamp,
            render_time_ms,
            rotation: VideoRotation::Rotation0,
        }
    }

    pub fn width(&self) -> u32 {
        self.buffer.resolution().width
    }

    pub fn height(&self) -> u32 {
        self.buffer.resolution().height
    }

    /// Returns a copy of this frame backed by CPU memory, keeping timing and rotation.
    pub fn to_i420(&self) -> anyhow::Result<VideoFrame> {
        let buffer = match &self.buffer {
            FrameBuffer::I420(buffer) => buffer.clone(),
            FrameBuffer::Native(buffer) => buffer.to_i420()?,
        };

        Ok(VideoFrame {
            buffer: FrameBuffer::I420(buffer),
            timestamp: self.timestamp,
            render_time_ms: self.render_time_ms,
            rotation: self.rotation,
        })
    }
}
