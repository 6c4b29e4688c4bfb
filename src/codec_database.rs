// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Lookup of the encoder instance serving a send codec.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;

use crate::codec::VideoCodec;
use crate::codec::VideoCodecType;
use crate::encoder::EncodeError;
use crate::encoder::EncodedImageCallback;
use crate::encoder::EncoderCapabilities;
use crate::encoder::SharedEncoder;

#[derive(Debug, Error)]
pub enum CodecDatabaseError {
    #[error("invalid codec settings: {0}")]
    InvalidCodec(&'static str),
    #[error("no encoder available for {codec_type:?} with payload type {pl_type}")]
    NoEncoder {
        codec_type: VideoCodecType,
        pl_type: u8,
    },
    #[error("failed to initialize encoder")]
    InitFailed(#[source] EncodeError),
    #[error("no external encoder registered for payload type {0}")]
    UnknownPayloadType(u8),
}

/// An encoder instance together with the capabilities the sender caches for it.
#[derive(Clone)]
pub struct EncoderHandle {
    pub encoder: SharedEncoder,
    pub capabilities: EncoderCapabilities,
}

/// Maps codec descriptors to encoder instances.
pub trait CodecRegistry: Send {
    /// Finds or builds the encoder for `codec` and initializes it, routing its output to
    /// `callback`. On failure the registry may have dropped the encoder it held before, check
    /// [`CodecRegistry::encoder`].
    fn set_send_codec(
        &mut self,
        codec: &VideoCodec,
        number_of_cores: u32,
        max_payload_size: usize,
        callback: Arc<dyn EncodedImageCallback>,
    ) -> Result<EncoderHandle, CodecDatabaseError>;

    /// The encoder currently serving the send codec, if any.
    fn encoder(&self) -> Option<EncoderHandle>;

    /// Makes `encoder` serve `payload_type`, replacing any previous registration.
    fn register_external_encoder(
        &mut self,
        encoder: SharedEncoder,
        payload_type: u8,
        internal_source: bool,
    );

    /// Removes the external encoder of `payload_type`. Returns true if it was serving the send
    /// codec, in which case the registry no longer holds an encoder.
    fn deregister_external_encoder(&mut self, payload_type: u8)
        -> Result<bool, CodecDatabaseError>;

    fn matches_current_resolution(&self, width: u32, height: u32) -> bool;
}

pub type EncoderFactory = Box<dyn Fn() -> SharedEncoder + Send>;

struct ExternalEncoder {
    encoder: SharedEncoder,
    internal_source: bool,
}

struct ActiveEncoder {
    handle: EncoderHandle,
    /// Payload type if the encoder was registered externally.
    external_payload_type: Option<u8>,
}

/// [`CodecRegistry`] building encoders from per codec type factories, or handing out encoders
/// registered by the application for a payload type. External encoders win over factories.
#[derive(Default)]
pub struct CodecDatabase {
    factories: HashMap<VideoCodecType, EncoderFactory>,
    external_encoders: HashMap<u8, ExternalEncoder>,
    send_codec: Option<VideoCodec>,
    number_of_cores: u32,
    max_payload_size: usize,
    active: Option<ActiveEncoder>,
    /// Set when the external encoder of the active payload type changed.
    pending_encoder_reset: bool,
}

impl CodecDatabase {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn register_encoder_factory(
        &mut self,
        codec_type: VideoCodecType,
        factory: impl Fn() -> SharedEncoder + Send + 'static,
    ) {
        self.factories.insert(codec_type, Box::new(factory));
    }

    pub fn send_codec(&self) -> Option<&VideoCodec> {
        self.send_codec.as_ref()
    }

    fn requires_encoder_reset(
        &self,
        codec: &VideoCodec,
        number_of_cores: u32,
        max_payload_size: usize,
    ) -> bool {
        self.pending_encoder_reset
            || self.send_codec.as_ref() != Some(codec)
            || self.number_of_cores != number_of_cores
            || self.max_payload_size != max_payload_size
    }

    fn release_active(&mut self) {
        if let Some(active) = self.active.take() {
            if let Err(err) = active.handle.encoder.lock().unwrap().release() {
                log::warn!("failed to release encoder: {}", err);
            }
        }
        self.pending_encoder_reset = false;
    }
}

impl CodecRegistry for CodecDatabase {
    fn set_send_codec(
        &mut self,
        codec: &VideoCodec,
        number_of_cores: u32,
        max_payload_size: usize,
        callback: Arc<dyn EncodedImageCallback>,
    ) -> Result<EncoderHandle, CodecDatabaseError> {
        codec.validate().map_err(CodecDatabaseError::InvalidCodec)?;

        let mut codec = codec.clone();
        codec.start_bitrate = codec.effective_start_bitrate();

        if let Some(active) = &self.active {
            if !self.requires_encoder_reset(&codec, number_of_cores, max_payload_size) {
                log::debug!("send codec unchanged, keeping encoder");
                return Ok(active.handle.clone());
            }
        }

        self.release_active();
        self.send_codec = None;

        let (encoder, external_payload_type, internal_source) =
            match self.external_encoders.get(&codec.pl_type) {
                Some(external) => (
                    Arc::clone(&external.encoder),
                    Some(codec.pl_type),
                    Some(external.internal_source),
                ),
                None => match self.factories.get(&codec.codec_type) {
                    Some(factory) => (factory(), None, None),
                    None => {
                        return Err(CodecDatabaseError::NoEncoder {
                            codec_type: codec.codec_type,
                            pl_type: codec.pl_type,
                        })
                    }
                },
            };

        let capabilities = {
            let mut locked = encoder.lock().unwrap();
            locked.register_encode_complete_callback(callback);
            locked
                .init_encode(&codec, number_of_cores, max_payload_size)
                .map_err(|err| {
                    log::error!(
                        "failed to initialize encoder {} for {}: {}",
                        locked.implementation_name(),
                        codec.pl_name,
                        err
                    );
                    CodecDatabaseError::InitFailed(err)
                })?;

            EncoderCapabilities {
                has_internal_source: internal_source.unwrap_or_else(|| locked.internal_source()),
                supports_native_buffer: locked.supports_native_buffer(),
            }
        };

        let handle = EncoderHandle {
            encoder,
            capabilities,
        };
        self.active = Some(ActiveEncoder {
            handle: handle.clone(),
            external_payload_type,
        });
        self.send_codec = Some(codec);
        self.number_of_cores = number_of_cores;
        self.max_payload_size = max_payload_size;

        Ok(handle)
    }

    fn encoder(&self) -> Option<EncoderHandle> {
        self.active.as_ref().map(|active| active.handle.clone())
    }

    fn register_external_encoder(
        &mut self,
        encoder: SharedEncoder,
        payload_type: u8,
        internal_source: bool,
    ) {
        let serves_send_codec = self
            .send_codec
            .as_ref()
            .map_or(false, |codec| codec.pl_type == payload_type);
        if serves_send_codec {
            self.pending_encoder_reset = true;
        }

        self.external_encoders.insert(
            payload_type,
            ExternalEncoder {
                encoder,
                internal_source,
            },
        );
    }

    fn deregister_external_encoder(
        &mut self,
        payload_type: u8,
    ) -> Result<bool, CodecDatabaseError> {
        if self.external_encoders.remove(&payload_type).is_none() {
            return Err(CodecDatabaseError::UnknownPayloadType(payload_type));
        }

        let was_send_codec = self
            .active
            .as_ref()
            .map_or(false, |active| active.external_payload_type == Some(payload_type));
        if was_send_codec {
            self.release_active();
            self.send_codec = None;
        }

        Ok(was_send_codec)
    }

    fn matches_current_resolution(&self, width: u32, height: u32) -> bool {
        self.send_codec
            .as_ref()
            .map_or(false, |codec| codec.width == width && codec.height == height)
    }
}
