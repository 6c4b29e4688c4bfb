// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! This file contains a dummy encoder whose only purpose is to let the sender run so we can test
//! it in isolation. It records every call it receives and produces fixed size bitstreams.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;

use bytes::Bytes;

use crate::codec::VideoCodec;
use crate::encoder::CodecSpecificInfo;
use crate::encoder::EncodeError;
use crate::encoder::EncodeResult;
use crate::encoder::EncodedImage;
use crate::encoder::EncodedImageCallback;
use crate::encoder::EncoderParameters;
use crate::encoder::FrameType;
use crate::encoder::VideoEncoder;
use crate::video_frame::VideoFrame;

/// Size in bytes of every delta frame the dummy encoder emits. Key frames are four times larger.
pub const DUMMY_DELTA_FRAME_SIZE: usize = 1000;

/// One [`VideoEncoder::encode`] call as seen by the dummy encoder.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncodeCall {
    pub timestamp: u32,
    pub width: u32,
    pub height: u32,
    pub native: bool,
    pub frame_types: Vec<FrameType>,
    pub codec_specific_info: Option<CodecSpecificInfo>,
}

/// Recorded calls plus knobs that tests flip after the encoder was handed over.
#[derive(Default)]
pub struct DummyEncoderState {
    pub init_count: usize,
    pub release_count: usize,
    pub encode_calls: Vec<EncodeCall>,
    pub dropped_frames: usize,
    pub applied_parameters: Vec<EncoderParameters>,
    pub frame_requests: Vec<Vec<FrameType>>,

    pub fail_init: Option<EncodeError>,
    pub fail_encode: Option<EncodeError>,
    pub fail_request_frame: Option<EncodeError>,
    /// Invoked in the middle of every encode call, before output is delivered.
    pub on_encode: Option<Box<dyn FnMut() + Send>>,
}

/// Cloneable view on a [`DummyEncoder`]'s state.
#[derive(Clone, Default)]
pub struct DummyHandle(Arc<Mutex<DummyEncoderState>>);

impl DummyHandle {
    pub fn state(&self) -> MutexGuard<'_, DummyEncoderState> {
        self.0.lock().unwrap()
    }

    pub fn encode_count(&self) -> usize {
        self.state().encode_calls.len()
    }

    pub fn last_encode(&self) -> Option<EncodeCall> {
        self.state().encode_calls.last().cloned()
    }
}

pub struct DummyEncoder {
    handle: DummyHandle,
    internal_source: bool,
    supports_native_buffer: bool,
    codec: Option<VideoCodec>,
    params: EncoderParameters,
    callback: Option<Arc<dyn EncodedImageCallback>>,
}

impl DummyEncoder {
    pub fn new(internal_source: bool, supports_native_buffer: bool) -> (Self, DummyHandle) {
        let handle = DummyHandle::default();
        let encoder = Self {
            handle: handle.clone(),
            internal_source,
            supports_native_buffer,
            codec: None,
            params: Default::default(),
            callback: None,
        };

        (encoder, handle)
    }

    /// Frame driven encoder reading CPU frames only.
    pub fn frame_driven() -> (Self, DummyHandle) {
        Self::new(false, false)
    }

    fn deliver(&self, timestamp: u32, frame_types: &[FrameType]) {
        let (Some(callback), Some(codec)) = (&self.callback, &self.codec) else {
            return;
        };

        for (simulcast_idx, frame_type) in frame_types.iter().enumerate() {
            let size = match frame_type {
                FrameType::Key => 4 * DUMMY_DELTA_FRAME_SIZE,
                FrameType::Delta => DUMMY_DELTA_FRAME_SIZE,
            };
            callback.on_encoded_image(&EncodedImage {
                bitstream: Bytes::from(vec![0u8; size]),
                frame_type: *frame_type,
                timestamp,
                encoded_width: codec.width,
                encoded_height: codec.height,
                simulcast_idx,
            });
        }
    }
}

impl VideoEncoder for DummyEncoder {
    fn init_encode(
        &mut self,
        codec: &VideoCodec,
        _number_of_cores: u32,
        _max_payload_size: usize,
    ) -> EncodeResult<()> {
        let mut state = self.handle.state();
        state.init_count += 1;
        if let Some(err) = state.fail_init {
            return Err(err);
        }

        self.codec = Some(codec.clone());
        Ok(())
    }

    fn register_encode_complete_callback(&mut self, callback: Arc<dyn EncodedImageCallback>) {
        self.callback = Some(callback);
    }

    fn release(&mut self) -> EncodeResult<()> {
        self.handle.state().release_count += 1;
        self.codec = None;
        Ok(())
    }

    fn encode(
        &mut self,
        frame: &VideoFrame,
        codec_specific_info: Option<&CodecSpecificInfo>,
        frame_types: &[FrameType],
    ) -> EncodeResult<()> {
        // Take the hook out so it may call back into the sender without holding our state.
        let hook = self.handle.state().on_encode.take();
        if let Some(mut hook) = hook {
            hook();
            self.handle.state().on_encode = Some(hook);
        }

        let failure = {
            let mut state = self.handle.state();
            state.encode_calls.push(EncodeCall {
                timestamp: frame.timestamp,
                width: frame.width(),
                height: frame.height(),
                native: frame.buffer.is_native(),
                frame_types: frame_types.to_vec(),
                codec_specific_info: codec_specific_info.cloned(),
            });
            state.fail_encode
        };

        if let Some(err) = failure {
            return Err(err);
        }

        self.deliver(frame.timestamp, frame_types);
        Ok(())
    }

    fn on_dropped_frame(&mut self) {
        self.handle.state().dropped_frames += 1;
    }

    fn set_parameters(&mut self, params: &EncoderParameters) -> EncodeResult<()> {
        self.handle.state().applied_parameters.push(*params);
        self.params = *params;
        Ok(())
    }

    fn parameters(&self) -> EncoderParameters {
        self.params
    }

    fn request_frame(&mut self, frame_types: &[FrameType]) -> EncodeResult<()> {
        if !self.internal_source {
            return Err(EncodeError::Unsupported);
        }

        let failure = {
            let mut state = self.handle.state();
            state.frame_requests.push(frame_types.to_vec());
            state.fail_request_frame
        };
        if let Some(err) = failure {
            return Err(err);
        }

        self.deliver(0, frame_types);
        Ok(())
    }

    fn internal_source(&self) -> bool {
        self.internal_source
    }

    fn supports_native_buffer(&self) -> bool {
        self.supports_native_buffer
    }

    fn implementation_name(&self) -> &str {
        "dummy"
    }
}
