// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Coordination of application frames, codec changes and network feedback into encode calls.
//!
//! [`VideoSender`] is called from several threads at once. One owning thread registers codecs
//! and attaches or detaches encoders, any thread may submit frames, feed channel parameters or
//! request key frames. State is split between two locks:
//!
//! * the encoder lock guards the active [`EncoderSlot`] and every call into the encoder,
//! * the parameters lock guards the [`EncoderParameters`], the [`FrameTypeSchedule`] and the
//!   cached internal source capability.
//!
//! When both are needed the encoder lock is always taken first. The rate controller, the cached
//! codec, the statistics timer and the encoder's own mutex are leaves: nothing else is acquired
//! while holding them, and the encoder's mutex is only taken under the encoder lock.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::RwLock;

use thiserror::Error;

use crate::clock::Clock;
use crate::clock::ProcessTimer;
use crate::codec::VideoCodec;
use crate::codec_database::CodecDatabase;
use crate::codec_database::CodecDatabaseError;
use crate::codec_database::CodecRegistry;
use crate::codec_database::EncoderHandle;
use crate::encoder::CodecSpecificInfo;
use crate::encoder::EncodeError;
use crate::encoder::EncodeResult;
use crate::encoder::EncodedImage;
use crate::encoder::EncodedImageCallback;
use crate::encoder::EncoderParameters;
use crate::encoder::FrameType;
use crate::encoder::SharedEncoder;
use crate::encoder::VideoEncoder;
use crate::media_opt::EncodingData;
use crate::media_opt::MediaOptimization;
use crate::media_opt::RateController;
use crate::video_frame::VideoFrame;
use crate::Resolution;

pub mod frame_types;

pub use frame_types::FrameTypeSchedule;
pub use frame_types::StreamIndexError;

#[derive(Debug, Error)]
pub enum ParameterError {
    #[error("invalid codec settings: {0}")]
    InvalidCodec(&'static str),
    #[error("frame resolution {actual:?} does not match the codec resolution {expected:?}")]
    ResolutionMismatch {
        expected: Option<Resolution>,
        actual: Resolution,
    },
    #[error("failed to convert native frame")]
    ConversionFailed(#[source] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum SenderError {
    #[error("no encoder is active")]
    Uninitialized,
    #[error(transparent)]
    Parameter(#[from] ParameterError),
    #[error("codec error")]
    Codec(#[source] CodecDatabaseError),
    #[error(transparent)]
    Index(#[from] StreamIndexError),
    #[error(transparent)]
    Encoder(#[from] EncodeError),
}

impl From<CodecDatabaseError> for SenderError {
    fn from(err: CodecDatabaseError) -> Self {
        match err {
            CodecDatabaseError::InvalidCodec(reason) => {
                SenderError::Parameter(ParameterError::InvalidCodec(reason))
            }
            err => SenderError::Codec(err),
        }
    }
}

impl SenderError {
    /// Negative status code of this error. Encoder failures keep the encoder's own code.
    pub fn code(&self) -> i32 {
        match self {
            SenderError::Index(_) => -1,
            SenderError::Parameter(_) => -4,
            SenderError::Codec(_) => -6,
            SenderError::Uninitialized => -7,
            SenderError::Encoder(err) => err.code(),
        }
    }
}

pub type SenderResult<T> = Result<T, SenderError>;

/// Periodic send statistics sink.
pub trait SendStatisticsCallback: Send {
    fn send_statistics(&mut self, bitrate: u32, frame_rate: u32);
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SenderOptions {
    /// Period of [`SendStatisticsCallback::send_statistics`] calls.
    pub stats_interval_ms: i64,
    /// Explicit frame dropper setting to apply on construction, `None` keeps the rate
    /// controller's default.
    pub frame_dropper_enabled: Option<bool>,
}

impl Default for SenderOptions {
    fn default() -> Self {
        Self {
            stats_interval_ms: 1000,
            frame_dropper_enabled: None,
        }
    }
}

/// Collaborators a [`VideoSender`] delegates to.
pub struct SenderCollaborators {
    pub registry: Box<dyn CodecRegistry>,
    pub rate_controller: Box<dyn RateController>,
    /// Receives every encoded image after the rate controller accounted for it.
    pub post_encode_callback: Option<Arc<dyn EncodedImageCallback>>,
    pub send_stats_callback: Option<Box<dyn SendStatisticsCallback>>,
}

impl SenderCollaborators {
    /// [`CodecDatabase`] and [`MediaOptimization`], without callbacks.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            registry: Box::new(CodecDatabase::new()),
            rate_controller: Box::new(MediaOptimization::new(clock)),
            post_encode_callback: None,
            send_stats_callback: None,
        }
    }
}

/// The active encoder and the capabilities cached when it was installed.
struct EncoderSlot {
    encoder: SharedEncoder,
    has_internal_source: bool,
    supports_native_buffer: bool,
}

impl From<EncoderHandle> for EncoderSlot {
    fn from(handle: EncoderHandle) -> Self {
        Self {
            encoder: handle.encoder,
            has_internal_source: handle.capabilities.has_internal_source,
            supports_native_buffer: handle.capabilities.supports_native_buffer,
        }
    }
}

/// State behind the encoder lock.
struct EncoderState {
    slot: Option<EncoderSlot>,
    registry: Box<dyn CodecRegistry>,
    /// Last explicit frame dropper request.
    frame_dropper_enabled: Option<bool>,
}

/// State behind the parameters lock.
#[derive(Clone)]
struct ParamsState {
    encoder_params: EncoderParameters,
    next_frame_types: FrameTypeSchedule,
    encoder_has_internal_source: bool,
}

/// Accounts encoder output in the rate controller before passing it on.
struct EncodedFrameCallback {
    rate_controller: Arc<Mutex<Box<dyn RateController>>>,
    post_encode_callback: Option<Arc<dyn EncodedImageCallback>>,
}

impl EncodedImageCallback for EncodedFrameCallback {
    fn on_encoded_image(&self, image: &EncodedImage) {
        self.rate_controller
            .lock()
            .unwrap()
            .update_with_encoded_data(image);

        if let Some(callback) = &self.post_encode_callback {
            callback.on_encoded_image(image);
        }
    }
}

pub struct VideoSender {
    rate_controller: Arc<Mutex<Box<dyn RateController>>>,
    encoded_frame_callback: Arc<EncodedFrameCallback>,
    send_stats_callback: Option<Mutex<Box<dyn SendStatisticsCallback>>>,
    send_stats_timer: Mutex<ProcessTimer>,
    /// Last successfully registered codec, readable without contending with encode calls.
    current_codec: RwLock<Option<VideoCodec>>,
    encoder_lock: Mutex<EncoderState>,
    params_lock: Mutex<ParamsState>,
}

impl VideoSender {
    pub fn new(
        clock: Arc<dyn Clock>,
        options: SenderOptions,
        collaborators: SenderCollaborators,
    ) -> Self {
        let SenderCollaborators {
            registry,
            mut rate_controller,
            post_encode_callback,
            send_stats_callback,
        } = collaborators;

        if let Some(enable) = options.frame_dropper_enabled {
            rate_controller.enable_frame_dropper(enable);
        }

        let rate_controller = Arc::new(Mutex::new(rate_controller));
        let encoded_frame_callback = Arc::new(EncodedFrameCallback {
            rate_controller: Arc::clone(&rate_controller),
            post_encode_callback,
        });

        Self {
            rate_controller,
            encoded_frame_callback,
            send_stats_callback: send_stats_callback.map(Mutex::new),
            send_stats_timer: Mutex::new(ProcessTimer::new(options.stats_interval_ms, clock)),
            current_codec: RwLock::new(None),
            encoder_lock: Mutex::new(EncoderState {
                slot: None,
                registry,
                frame_dropper_enabled: options.frame_dropper_enabled,
            }),
            params_lock: Mutex::new(ParamsState {
                encoder_params: Default::default(),
                next_frame_types: FrameTypeSchedule::new(),
                encoder_has_internal_source: false,
            }),
        }
    }

    /// Makes `codec` the send codec. Must not race with itself or with
    /// [`VideoSender::attach_encoder`]/[`VideoSender::detach_encoder`].
    ///
    /// On success every stream gets a key frame request. On failure the sender keeps whatever
    /// encoder the registry still holds, which may be none.
    pub fn register_codec(
        &self,
        codec: &VideoCodec,
        number_of_cores: u32,
        max_payload_size: usize,
    ) -> SenderResult<()> {
        let mut encoder_state = self.encoder_lock.lock().unwrap();
        codec.validate().map_err(ParameterError::InvalidCodec)?;

        let callback: Arc<dyn EncodedImageCallback> = self.encoded_frame_callback.clone();
        let result =
            encoder_state
                .registry
                .set_send_codec(codec, number_of_cores, max_payload_size, callback);

        let handle = match result {
            Ok(handle) => handle,
            Err(err) => {
                log::error!(
                    "failed to set send codec {} (payload type {}): {}",
                    codec.pl_name,
                    codec.pl_type,
                    err
                );

                // Never hold on to an instance the registry may have dropped.
                encoder_state.slot = encoder_state.registry.encoder().map(EncoderSlot::from);
                let has_internal_source = encoder_state
                    .slot
                    .as_ref()
                    .map_or(false, |slot| slot.has_internal_source);
                self.params_lock.lock().unwrap().encoder_has_internal_source =
                    has_internal_source;

                return Err(err.into());
            }
        };

        let slot = EncoderSlot::from(handle);
        let has_internal_source = slot.has_internal_source;
        encoder_state.slot = Some(slot);
        *self.current_codec.write().unwrap() = Some(codec.clone());

        let num_layers = codec.temporal_layers();
        {
            let mut rate_controller = self.rate_controller.lock().unwrap();
            // Without an explicit request the dropper is on.
            let enable = !codec.disables_frame_dropper()
                && encoder_state.frame_dropper_enabled.unwrap_or(true);
            rate_controller.enable_frame_dropper(enable);
        }

        {
            let mut params = self.params_lock.lock().unwrap();
            params.next_frame_types.reset(codec.stream_count());
            params.encoder_has_internal_source = has_internal_source;
        }

        log::debug!(
            "send codec {}: max bitrate {} start bitrate {} max frame rate {} max payload size {}",
            codec.pl_name,
            codec.max_bitrate,
            codec.start_bitrate,
            codec.max_framerate,
            max_payload_size
        );
        self.rate_controller
            .lock()
            .unwrap()
            .set_encoding_data(EncodingData {
                max_bitrate: codec.max_bitrate.saturating_mul(1000),
                start_bitrate: codec.effective_start_bitrate().saturating_mul(1000),
                width: codec.width,
                height: codec.height,
                max_framerate: codec.max_framerate,
                num_temporal_layers: num_layers,
                max_payload_size,
            });

        Ok(())
    }

    /// Installs an application supplied encoder serving `payload_type`. It becomes active with
    /// the next [`VideoSender::register_codec`] for that payload type.
    pub fn attach_encoder(&self, encoder: SharedEncoder, payload_type: u8, internal_source: bool) {
        let mut encoder_state = self.encoder_lock.lock().unwrap();
        encoder_state
            .registry
            .register_external_encoder(encoder, payload_type, internal_source);
    }

    /// Removes the encoder attached for `payload_type`. If it was active the sender is left
    /// without an encoder until the next registration.
    pub fn detach_encoder(&self, payload_type: u8) -> SenderResult<()> {
        let mut encoder_state = self.encoder_lock.lock().unwrap();
        let was_send_codec = encoder_state
            .registry
            .deregister_external_encoder(payload_type)?;

        if was_send_codec {
            let mut params = self.params_lock.lock().unwrap();
            encoder_state.slot = None;
            params.encoder_has_internal_source = false;
        }

        Ok(())
    }

    /// Feeds network feedback. `target_bitrate` is in bits per second, `rtt` in milliseconds.
    pub fn on_channel_parameters(
        &self,
        target_bitrate: u32,
        loss_rate: u8,
        rtt: i64,
    ) -> SenderResult<()> {
        let (target_rate, input_frame_rate) = {
            let mut rate_controller = self.rate_controller.lock().unwrap();
            let target_rate = rate_controller.set_target_rates(target_bitrate, loss_rate, rtt);
            (target_rate, rate_controller.input_frame_rate())
        };

        let encoder_params = EncoderParameters {
            target_bitrate: target_rate,
            loss_rate,
            rtt,
            input_frame_rate,
        };
        let encoder_has_internal_source = {
            let mut params = self.params_lock.lock().unwrap();
            params.encoder_params = encoder_params;
            params.encoder_has_internal_source
        };

        // Internal source encoders never see a frame, tell them now.
        if encoder_has_internal_source {
            let encoder_state = self.encoder_lock.lock().unwrap();
            if let Some(slot) = &encoder_state.slot {
                let mut encoder = slot.encoder.lock().unwrap();
                self.apply_parameters(&mut *encoder, encoder_params, encoder_has_internal_source)?;
            }
        }

        Ok(())
    }

    /// Pushes `params` into `encoder`. Must be called with the encoder lock held.
    fn apply_parameters(
        &self,
        encoder: &mut dyn VideoEncoder,
        mut params: EncoderParameters,
        has_internal_source: bool,
    ) -> EncodeResult<()> {
        // A zero target for a frame driven encoder means the network is down or the pacer is
        // full. Callers stop submitting frames instead, encoders are never handed a zero rate.
        if !has_internal_source && params.target_bitrate == 0 {
            return Ok(());
        }

        if params.input_frame_rate == 0 {
            params.input_frame_rate = self
                .current_codec
                .read()
                .unwrap()
                .as_ref()
                .map_or(0, |codec| codec.max_framerate);
        }

        encoder.set_parameters(&params)
    }

    /// Encodes `frame`, unless the rate controller decides to drop it. Frame driven encoders
    /// get nothing while the target bitrate is zero.
    pub fn submit_frame(
        &self,
        frame: &VideoFrame,
        codec_specific_info: Option<&CodecSpecificInfo>,
    ) -> SenderResult<()> {
        let snapshot = self.params_lock.lock().unwrap().clone();
        self.encode_with_snapshot(frame, codec_specific_info, snapshot)
    }

    /// Second half of [`VideoSender::submit_frame`], run on a copy of the parameters state taken
    /// without the encoder lock.
    fn encode_with_snapshot(
        &self,
        frame: &VideoFrame,
        codec_specific_info: Option<&CodecSpecificInfo>,
        mut snapshot: ParamsState,
    ) -> SenderResult<()> {
        let encoder_state = self.encoder_lock.lock().unwrap();
        {
            // A registration may have landed since the copy was taken. It cannot happen again
            // while we hold the encoder lock.
            let params = self.params_lock.lock().unwrap();
            if params.next_frame_types.generation() != snapshot.next_frame_types.generation() {
                snapshot = params.clone();
            }
        }
        let ParamsState {
            encoder_params,
            next_frame_types,
            encoder_has_internal_source,
        } = snapshot;

        let Some(slot) = &encoder_state.slot else {
            return Err(SenderError::Uninitialized);
        };
        let mut encoder = slot.encoder.lock().unwrap();

        if let Err(err) =
            self.apply_parameters(&mut *encoder, encoder_params, encoder_has_internal_source)
        {
            log::warn!("failed to set encoder parameters: {}", err);
        }

        // The rate controller sees every frame, even the ones we cannot send.
        let drop_frame = self.rate_controller.lock().unwrap().drop_frame();
        if !encoder_has_internal_source && encoder_params.target_bitrate == 0 {
            log::trace!("no target bitrate, dropping frame {}", frame.timestamp);
            encoder.on_dropped_frame();
            return Ok(());
        }
        if drop_frame {
            log::trace!(
                "drop frame: target bitrate {} loss rate {} rtt {} input frame rate {}",
                encoder_params.target_bitrate,
                encoder_params.loss_rate,
                encoder_params.rtt,
                encoder_params.input_frame_rate
            );
            encoder.on_dropped_frame();
            return Ok(());
        }

        if !encoder_state
            .registry
            .matches_current_resolution(frame.width(), frame.height())
        {
            log::error!("incoming frame doesn't match set resolution, dropping");
            return Err(ParameterError::ResolutionMismatch {
                expected: self.send_codec().map(|codec| codec.resolution()),
                actual: frame.buffer.resolution(),
            }
            .into());
        }

        let converted;
        let frame = if frame.buffer.is_native() && !slot.supports_native_buffer {
            converted = frame.to_i420().map_err(|err| {
                log::error!("frame conversion failed, dropping frame: {:#}", err);
                ParameterError::ConversionFailed(err)
            })?;
            &converted
        } else {
            frame
        };

        let result = encoder.encode(frame, codec_specific_info, next_frame_types.as_slice());
        drop(encoder);
        if let Err(err) = result {
            log::error!("failed to encode frame, error code: {}", err.code());
            return Err(err.into());
        }

        self.params_lock
            .lock()
            .unwrap()
            .next_frame_types
            .clear_satisfied(&next_frame_types);

        Ok(())
    }

    /// Requests a key frame on stream `stream_index`.
    ///
    /// Frame driven encoders get it with the next submitted frame. Internal source encoders are
    /// asked for a frame right away, and the request is considered served if they accept.
    pub fn request_keyframe(&self, stream_index: usize) -> SenderResult<()> {
        {
            let mut params = self.params_lock.lock().unwrap();
            params.next_frame_types.request_key_frame(stream_index)?;
            if !params.encoder_has_internal_source {
                return Ok(());
            }
        }

        // The parameters lock was dropped to respect the lock order, check again.
        let encoder_state = self.encoder_lock.lock().unwrap();
        let requested = {
            let params = self.params_lock.lock().unwrap();
            params.next_frame_types.check_index(stream_index)?;
            params.next_frame_types.clone()
        };

        let Some(slot) = &encoder_state.slot else {
            return Ok(());
        };
        if !slot.has_internal_source {
            return Ok(());
        }

        // The encoder may deliver output synchronously, and output callbacks may call back into
        // the sender, so the parameters lock is not held here.
        let result = slot
            .encoder
            .lock()
            .unwrap()
            .request_frame(requested.as_slice());
        if let Err(err) = result {
            log::warn!(
                "key frame request for stream {} failed, keeping it pending: {}",
                stream_index,
                err
            );
            return Ok(());
        }

        let mut params = self.params_lock.lock().unwrap();
        if params.next_frame_types.generation() == requested.generation() {
            params
                .next_frame_types
                .set(stream_index, FrameType::Delta)?;
        }

        Ok(())
    }

    /// Sets the frame dropper on or off. The setting is reapplied on every codec registration
    /// unless the codec requires the dropper to stay off.
    pub fn enable_frame_dropper(&self, enable: bool) {
        let mut encoder_state = self.encoder_lock.lock().unwrap();
        encoder_state.frame_dropper_enabled = Some(enable);
        self.rate_controller
            .lock()
            .unwrap()
            .enable_frame_dropper(enable);
    }

    /// Periodic housekeeping. Reports send statistics once per interval and refreshes the input
    /// frame rate estimate. Returns the milliseconds until the next call is due.
    pub fn tick(&self) -> i64 {
        let report_due = {
            let mut timer = self.send_stats_timer.lock().unwrap();
            let due = timer.time_until_process() == 0;
            if due {
                timer.processed();
            }
            due
        };

        if report_due {
            if let Some(callback) = &self.send_stats_callback {
                let (bitrate, frame_rate) = {
                    let mut rate_controller = self.rate_controller.lock().unwrap();
                    (rate_controller.sent_bitrate(), rate_controller.sent_frame_rate())
                };
                callback
                    .lock()
                    .unwrap()
                    .send_statistics(bitrate, frame_rate);
            }
        }

        let input_frame_rate = self.rate_controller.lock().unwrap().input_frame_rate();
        self.params_lock
            .lock()
            .unwrap()
            .encoder_params
            .input_frame_rate = input_frame_rate;

        self.time_until_next_process()
    }

    pub fn time_until_next_process(&self) -> i64 {
        self.send_stats_timer.lock().unwrap().time_until_process()
    }

    /// Target bitrate last applied to the active encoder.
    pub fn bitrate(&self) -> SenderResult<u32> {
        let encoder_state = self.encoder_lock.lock().unwrap();
        let slot = encoder_state
            .slot
            .as_ref()
            .ok_or(SenderError::Uninitialized)?;
        let bitrate = slot.encoder.lock().unwrap().parameters().target_bitrate;
        Ok(bitrate)
    }

    /// Input frame rate last applied to the active encoder.
    pub fn frame_rate(&self) -> SenderResult<u32> {
        let encoder_state = self.encoder_lock.lock().unwrap();
        let slot = encoder_state
            .slot
            .as_ref()
            .ok_or(SenderError::Uninitialized)?;
        let frame_rate = slot.encoder.lock().unwrap().parameters().input_frame_rate;
        Ok(frame_rate)
    }

    pub fn send_codec(&self) -> Option<VideoCodec> {
        self.current_codec.read().unwrap().clone()
    }

    /// Snapshot of the pending frame type per stream.
    pub fn schedule(&self) -> Vec<FrameType> {
        self.params_lock
            .lock()
            .unwrap()
            .next_frame_types
            .as_slice()
            .to_vec()
    }

    pub fn encoder_parameters(&self) -> EncoderParameters {
        self.params_lock.lock().unwrap().encoder_params
    }

    pub fn has_encoder(&self) -> bool {
        self.encoder_lock.lock().unwrap().slot.is_some()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::sync::Weak;
    use std::thread;
    use std::time::Duration;

    use bytes::Bytes;

    use super::*;
    use crate::backend::dummy::DummyEncoder;
    use crate::backend::dummy::DummyHandle;
    use crate::clock::SimulatedClock;
    use crate::codec::CodecSpecific;
    use crate::codec::VideoCodecMode;
    use crate::codec::VideoCodecType;
    use crate::encoder::shared;
    use crate::video_frame::FrameBuffer;
    use crate::video_frame::I420Buffer;
    use crate::video_frame::MappedNv12Buffer;

    const VP8_PAYLOAD_TYPE: u8 = 100;
    const EXTERNAL_PAYLOAD_TYPE: u8 = 101;

    #[derive(Default)]
    struct RateState {
        drop_frames: bool,
        input_frame_rate: u32,
        sent_bitrate: u32,
        sent_frame_rate: u32,
        dropper_enabled: Option<bool>,
        encoding_data: Option<EncodingData>,
        encoded_images: usize,
    }

    /// Rate controller whose decisions are scripted by the test.
    #[derive(Clone, Default)]
    struct ScriptedRateController(Arc<Mutex<RateState>>);

    impl ScriptedRateController {
        fn state(&self) -> std::sync::MutexGuard<'_, RateState> {
            self.0.lock().unwrap()
        }
    }

    impl RateController for ScriptedRateController {
        fn set_encoding_data(&mut self, data: EncodingData) {
            self.state().encoding_data = Some(data);
        }

        fn set_target_rates(&mut self, target_bitrate: u32, _loss_rate: u8, _rtt: i64) -> u32 {
            target_bitrate
        }

        fn input_frame_rate(&mut self) -> u32 {
            self.state().input_frame_rate
        }

        fn drop_frame(&mut self) -> bool {
            self.state().drop_frames
        }

        fn enable_frame_dropper(&mut self, enable: bool) {
            self.state().dropper_enabled = Some(enable);
        }

        fn update_with_encoded_data(&mut self, _image: &EncodedImage) {
            self.state().encoded_images += 1;
        }

        fn sent_bitrate(&mut self) -> u32 {
            self.state().sent_bitrate
        }

        fn sent_frame_rate(&mut self) -> u32 {
            self.state().sent_frame_rate
        }
    }

    struct StatsRecorder(Arc<Mutex<Vec<(u32, u32)>>>);

    impl SendStatisticsCallback for StatsRecorder {
        fn send_statistics(&mut self, bitrate: u32, frame_rate: u32) {
            self.0.lock().unwrap().push((bitrate, frame_rate));
        }
    }

    struct ImageCounter(Mutex<Vec<usize>>);

    impl EncodedImageCallback for ImageCounter {
        fn on_encoded_image(&self, image: &EncodedImage) {
            self.0.lock().unwrap().push(image.simulcast_idx);
        }
    }

    /// Reads sender state from inside the encoder output path.
    struct ReentrantObserver {
        sender: Mutex<Weak<VideoSender>>,
        schedules: Mutex<Vec<Vec<FrameType>>>,
    }

    impl EncodedImageCallback for ReentrantObserver {
        fn on_encoded_image(&self, _image: &EncodedImage) {
            let sender = self.sender.lock().unwrap().upgrade();
            if let Some(sender) = sender {
                let schedule = sender.schedule();
                let _ = sender.encoder_parameters();
                self.schedules.lock().unwrap().push(schedule);
            }
        }
    }

    struct Fixture {
        sender: Arc<VideoSender>,
        clock: Arc<SimulatedClock>,
        rate: ScriptedRateController,
        created: Arc<Mutex<Vec<DummyHandle>>>,
    }

    impl Fixture {
        fn new() -> Self {
            Self::with_collaborators(|_| {})
        }

        fn with_collaborators(customize: impl FnOnce(&mut SenderCollaborators)) -> Self {
            let clock = Arc::new(SimulatedClock::new(100_000));
            let rate = ScriptedRateController::default();
            let created = Arc::new(Mutex::new(Vec::new()));

            let mut database = CodecDatabase::new();
            let registry = Arc::clone(&created);
            database.register_encoder_factory(VideoCodecType::Vp8, move || {
                let (encoder, handle) = DummyEncoder::frame_driven();
                registry.lock().unwrap().push(handle);
                shared(encoder)
            });

            let mut collaborators = SenderCollaborators {
                registry: Box::new(database),
                rate_controller: Box::new(rate.clone()),
                post_encode_callback: None,
                send_stats_callback: None,
            };
            customize(&mut collaborators);

            let sender = VideoSender::new(clock.clone(), Default::default(), collaborators);

            Self {
                sender: Arc::new(sender),
                clock,
                rate,
                created,
            }
        }

        /// Handle of the most recently built factory encoder.
        fn encoder(&self) -> DummyHandle {
            self.created.lock().unwrap().last().cloned().unwrap()
        }
    }

    fn vp8(streams: u8) -> VideoCodec {
        VideoCodec {
            codec_type: VideoCodecType::Vp8,
            pl_name: String::from("VP8"),
            pl_type: VP8_PAYLOAD_TYPE,
            number_of_simulcast_streams: streams,
            codec_specific: CodecSpecific::Vp8 {
                number_of_temporal_layers: 1,
                denoising_on: false,
            },
            ..Default::default()
        }
    }

    fn external(codec: VideoCodec) -> VideoCodec {
        VideoCodec {
            pl_type: EXTERNAL_PAYLOAD_TYPE,
            ..codec
        }
    }

    fn frame(timestamp: u32, width: u32, height: u32) -> VideoFrame {
        let buffer = I420Buffer::gray(Resolution { width, height });
        VideoFrame::new(FrameBuffer::I420(buffer), timestamp, 0)
    }

    fn nv12_frame(timestamp: u32, data: Bytes) -> VideoFrame {
        let native = MappedNv12Buffer::new(
            Resolution {
                width: 320,
                height: 240,
            },
            data,
            [320, 320],
            [0, 320 * 240],
        );
        VideoFrame::new(FrameBuffer::Native(Arc::new(native)), timestamp, 0)
    }

    use crate::encoder::FrameType::Delta;
    use crate::encoder::FrameType::Key;

    #[test]
    fn test_register_codec() {
        let fixture = Fixture::new();
        let sender = &fixture.sender;
        assert!(!sender.has_encoder());

        sender.register_codec(&vp8(2), 1, 1200).unwrap();

        assert!(sender.has_encoder());
        assert_eq!(sender.schedule(), vec![Key, Key]);
        assert_eq!(sender.send_codec(), Some(vp8(2)));
        assert_eq!(fixture.encoder().state().init_count, 1);
        assert_eq!(
            fixture.rate.state().encoding_data,
            Some(EncodingData {
                max_bitrate: 2_000_000,
                start_bitrate: 300_000,
                width: 320,
                height: 240,
                max_framerate: 30,
                num_temporal_layers: 1,
                max_payload_size: 1200,
            })
        );
        assert_eq!(fixture.rate.state().dropper_enabled, Some(true));
    }

    #[test]
    fn test_zero_simulcast_streams_is_one_stream() {
        let fixture = Fixture::new();
        fixture.sender.register_codec(&vp8(0), 1, 1200).unwrap();
        assert_eq!(fixture.sender.schedule(), vec![Key]);
    }

    #[test]
    fn test_simulcast_keyframe_requests() {
        let fixture = Fixture::new();
        let sender = &fixture.sender;
        sender.register_codec(&vp8(2), 1, 1200).unwrap();
        sender.on_channel_parameters(500_000, 0, 20).unwrap();

        sender.submit_frame(&frame(0, 320, 240), None).unwrap();
        let encoder = fixture.encoder();
        assert_eq!(encoder.last_encode().unwrap().frame_types, vec![Key, Key]);
        assert_eq!(sender.schedule(), vec![Delta, Delta]);

        sender.request_keyframe(1).unwrap();
        assert_eq!(sender.schedule(), vec![Delta, Key]);

        sender.submit_frame(&frame(3000, 320, 240), None).unwrap();
        assert_eq!(encoder.last_encode().unwrap().frame_types, vec![Delta, Key]);
        assert_eq!(sender.schedule(), vec![Delta, Delta]);
        assert_eq!(encoder.encode_count(), 2);
    }

    #[test]
    fn test_encoded_images_reach_rate_controller_and_callback() {
        let images = Arc::new(ImageCounter(Mutex::new(Vec::new())));
        let post_encode: Arc<dyn EncodedImageCallback> = images.clone();
        let fixture = Fixture::with_collaborators(|collaborators| {
            collaborators.post_encode_callback = Some(post_encode);
        });
        let sender = &fixture.sender;
        sender.register_codec(&vp8(2), 1, 1200).unwrap();
        sender.on_channel_parameters(500_000, 0, 20).unwrap();

        sender.submit_frame(&frame(0, 320, 240), None).unwrap();

        assert_eq!(fixture.rate.state().encoded_images, 2);
        assert_eq!(*images.0.lock().unwrap(), vec![0, 1]);
    }

    #[test]
    fn test_zero_bitrate_never_encodes() {
        let fixture = Fixture::new();
        let sender = &fixture.sender;
        sender.register_codec(&vp8(1), 1, 1200).unwrap();

        // No feedback yet, then an explicit zero.
        sender.submit_frame(&frame(0, 320, 240), None).unwrap();
        sender.on_channel_parameters(0, 0, 20).unwrap();
        sender.submit_frame(&frame(3000, 320, 240), None).unwrap();

        let encoder = fixture.encoder();
        let state = encoder.state();
        assert!(state.encode_calls.is_empty());
        assert!(state.applied_parameters.is_empty());
        assert_eq!(state.dropped_frames, 2);
        drop(state);
        assert_eq!(sender.schedule(), vec![Key]);
    }

    #[test]
    fn test_parameters_applied_with_frame_rate_fallback() {
        let fixture = Fixture::new();
        let sender = &fixture.sender;
        sender.register_codec(&vp8(1), 1, 1200).unwrap();
        sender.on_channel_parameters(400_000, 5, 60).unwrap();

        // Frame driven encoders only see parameters with a frame.
        assert!(fixture.encoder().state().applied_parameters.is_empty());

        sender.submit_frame(&frame(0, 320, 240), None).unwrap();
        assert_eq!(
            fixture.encoder().state().applied_parameters,
            vec![EncoderParameters {
                target_bitrate: 400_000,
                loss_rate: 5,
                rtt: 60,
                input_frame_rate: 30,
            }]
        );
        assert_eq!(sender.bitrate().unwrap(), 400_000);
        assert_eq!(sender.frame_rate().unwrap(), 30);

        // The snapshot keeps the raw estimate, only the applied copy is substituted.
        assert_eq!(sender.encoder_parameters().input_frame_rate, 0);
    }

    #[test]
    fn test_dropped_frame() {
        let fixture = Fixture::new();
        let sender = &fixture.sender;
        sender.register_codec(&vp8(1), 1, 1200).unwrap();
        sender.on_channel_parameters(400_000, 0, 0).unwrap();
        fixture.rate.state().drop_frames = true;

        sender.submit_frame(&frame(0, 320, 240), None).unwrap();

        let encoder = fixture.encoder();
        assert_eq!(encoder.encode_count(), 0);
        assert_eq!(encoder.state().dropped_frames, 1);
        assert_eq!(encoder.state().applied_parameters.len(), 1);
        assert_eq!(sender.schedule(), vec![Key]);
    }

    #[test]
    fn test_internal_source_keyframe_request() {
        let fixture = Fixture::new();
        let sender = &fixture.sender;
        let (encoder, handle) = DummyEncoder::new(true, false);
        sender.attach_encoder(shared(encoder), EXTERNAL_PAYLOAD_TYPE, true);
        sender.register_codec(&external(vp8(1)), 1, 1200).unwrap();
        assert_eq!(sender.schedule(), vec![Key]);

        sender.request_keyframe(0).unwrap();

        assert_eq!(handle.state().frame_requests, vec![vec![Key]]);
        assert_eq!(handle.encode_count(), 0);
        assert_eq!(sender.schedule(), vec![Delta]);
    }

    #[test]
    fn test_output_callback_reenters_during_keyframe_request() {
        let observer = Arc::new(ReentrantObserver {
            sender: Mutex::new(Weak::new()),
            schedules: Mutex::new(Vec::new()),
        });
        let post_encode: Arc<dyn EncodedImageCallback> = observer.clone();
        let fixture = Fixture::with_collaborators(|collaborators| {
            collaborators.post_encode_callback = Some(post_encode);
        });
        *observer.sender.lock().unwrap() = Arc::downgrade(&fixture.sender);
        let (encoder, handle) = DummyEncoder::new(true, false);
        fixture
            .sender
            .attach_encoder(shared(encoder), EXTERNAL_PAYLOAD_TYPE, true);
        fixture
            .sender
            .register_codec(&external(vp8(2)), 1, 1200)
            .unwrap();

        let (done_tx, done_rx) = mpsc::channel();
        let sender = Arc::clone(&fixture.sender);
        thread::spawn(move || {
            let result = sender.request_keyframe(1).map_err(|err| err.code());
            let _ = done_tx.send(result);
        });

        let result = done_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("key frame request did not return");
        assert_eq!(result, Ok(()));
        assert_eq!(handle.state().frame_requests, vec![vec![Key, Key]]);
        // One output image per stream, both delivered before the request was marked served.
        assert_eq!(
            *observer.schedules.lock().unwrap(),
            vec![vec![Key, Key], vec![Key, Key]]
        );
        assert_eq!(fixture.sender.schedule(), vec![Key, Delta]);
    }

    #[test]
    fn test_encode_after_codec_switch_uses_current_schedule() {
        let fixture = Fixture::new();
        let sender = &fixture.sender;
        sender.register_codec(&vp8(1), 1, 1200).unwrap();
        sender.on_channel_parameters(400_000, 0, 0).unwrap();
        let snapshot = sender.params_lock.lock().unwrap().clone();

        // The codec switches between the copy and the encode.
        sender.register_codec(&vp8(2), 1, 1200).unwrap();
        sender
            .encode_with_snapshot(&frame(0, 320, 240), None, snapshot)
            .unwrap();

        let call = fixture.encoder().last_encode().unwrap();
        assert_eq!(call.frame_types, vec![Key, Key]);
        assert_eq!(sender.schedule(), vec![Delta, Delta]);
        assert_eq!(sender.bitrate().unwrap(), 400_000);
    }

    #[test]
    fn test_internal_source_keyframe_request_failure_stays_pending() {
        let fixture = Fixture::new();
        let sender = &fixture.sender;
        let (encoder, handle) = DummyEncoder::new(true, false);
        handle.state().fail_request_frame = Some(EncodeError::Error);
        sender.attach_encoder(shared(encoder), EXTERNAL_PAYLOAD_TYPE, true);
        sender.register_codec(&external(vp8(2)), 1, 1200).unwrap();

        sender.request_keyframe(1).unwrap();

        assert_eq!(handle.state().frame_requests.len(), 1);
        assert_eq!(sender.schedule(), vec![Key, Key]);
    }

    #[test]
    fn test_internal_source_receives_parameters_immediately() {
        let fixture = Fixture::new();
        let sender = &fixture.sender;
        let (encoder, handle) = DummyEncoder::new(true, false);
        sender.attach_encoder(shared(encoder), EXTERNAL_PAYLOAD_TYPE, true);
        sender.register_codec(&external(vp8(1)), 1, 1200).unwrap();
        fixture.rate.state().input_frame_rate = 24;

        sender.on_channel_parameters(0, 10, 30).unwrap();

        assert_eq!(
            handle.state().applied_parameters,
            vec![EncoderParameters {
                target_bitrate: 0,
                loss_rate: 10,
                rtt: 30,
                input_frame_rate: 24,
            }]
        );
    }

    #[test]
    fn test_resolution_mismatch() {
        let fixture = Fixture::new();
        let sender = &fixture.sender;
        sender.register_codec(&vp8(1), 1, 1200).unwrap();
        sender.on_channel_parameters(400_000, 0, 0).unwrap();

        let err = sender.submit_frame(&frame(0, 640, 480), None).unwrap_err();

        assert!(matches!(
            err,
            SenderError::Parameter(ParameterError::ResolutionMismatch { .. })
        ));
        assert_eq!(err.code(), -4);
        assert_eq!(fixture.encoder().encode_count(), 0);
        assert_eq!(sender.schedule(), vec![Key]);
    }

    #[test]
    fn test_reregistration_resets_schedule() {
        let fixture = Fixture::new();
        let sender = &fixture.sender;
        let codec_a = vp8(2);
        let codec_b = VideoCodec {
            number_of_simulcast_streams: 3,
            ..vp8(0)
        };
        sender.on_channel_parameters(400_000, 0, 0).unwrap();

        sender.register_codec(&codec_a, 1, 1200).unwrap();
        assert_eq!(sender.schedule(), vec![Key, Key]);
        sender.submit_frame(&frame(0, 320, 240), None).unwrap();
        assert_eq!(sender.schedule(), vec![Delta, Delta]);

        sender.register_codec(&codec_b, 1, 1200).unwrap();
        assert_eq!(sender.schedule(), vec![Key, Key, Key]);
        sender.submit_frame(&frame(3000, 320, 240), None).unwrap();
        assert_eq!(sender.schedule(), vec![Delta, Delta, Delta]);

        sender.register_codec(&codec_a, 1, 1200).unwrap();
        assert_eq!(sender.schedule(), vec![Key, Key]);

        let created = fixture.created.lock().unwrap();
        assert_eq!(created.len(), 3);
        assert_eq!(created[0].state().release_count, 1);
        assert_eq!(created[1].state().release_count, 1);
    }

    #[test]
    fn test_same_codec_keeps_encoder() {
        let fixture = Fixture::new();
        let sender = &fixture.sender;
        sender.on_channel_parameters(400_000, 0, 0).unwrap();
        sender.register_codec(&vp8(1), 1, 1200).unwrap();
        sender.submit_frame(&frame(0, 320, 240), None).unwrap();

        sender.register_codec(&vp8(1), 1, 1200).unwrap();

        // Same instance, but every stream still gets a key frame.
        assert_eq!(fixture.created.lock().unwrap().len(), 1);
        assert_eq!(sender.schedule(), vec![Key]);
    }

    #[test]
    fn test_keyframe_request_is_idempotent() {
        let fixture = Fixture::new();
        let sender = &fixture.sender;
        sender.register_codec(&vp8(2), 1, 1200).unwrap();
        sender.on_channel_parameters(400_000, 0, 0).unwrap();
        sender.submit_frame(&frame(0, 320, 240), None).unwrap();

        sender.request_keyframe(0).unwrap();
        let once = sender.schedule();
        sender.request_keyframe(0).unwrap();

        assert_eq!(sender.schedule(), once);
        assert_eq!(once, vec![Key, Delta]);
    }

    #[test]
    fn test_keyframe_request_out_of_range() {
        let fixture = Fixture::new();
        let sender = &fixture.sender;
        sender.register_codec(&vp8(2), 1, 1200).unwrap();

        let err = sender.request_keyframe(2).unwrap_err();

        assert!(matches!(
            err,
            SenderError::Index(StreamIndexError { index: 2, len: 2 })
        ));
        assert_eq!(err.code(), -1);
        assert_eq!(sender.schedule(), vec![Key, Key]);
    }

    #[test]
    fn test_keyframe_request_during_encode_survives() {
        let fixture = Fixture::new();
        let sender = &fixture.sender;
        sender.register_codec(&vp8(1), 1, 1200).unwrap();
        sender.on_channel_parameters(400_000, 0, 0).unwrap();
        sender.submit_frame(&frame(0, 320, 240), None).unwrap();
        assert_eq!(sender.schedule(), vec![Delta]);

        let encoder = fixture.encoder();
        let weak: Weak<VideoSender> = Arc::downgrade(sender);
        encoder.state().on_encode = Some(Box::new(move || {
            if let Some(sender) = weak.upgrade() {
                sender.request_keyframe(0).unwrap();
            }
        }));

        sender.submit_frame(&frame(3000, 320, 240), None).unwrap();
        assert_eq!(encoder.last_encode().unwrap().frame_types, vec![Delta]);
        assert_eq!(sender.schedule(), vec![Key]);

        encoder.state().on_encode = None;
        sender.submit_frame(&frame(6000, 320, 240), None).unwrap();
        assert_eq!(encoder.last_encode().unwrap().frame_types, vec![Key]);
        assert_eq!(sender.schedule(), vec![Delta]);
    }

    #[test]
    fn test_encode_failure_keeps_schedule() {
        let fixture = Fixture::new();
        let sender = &fixture.sender;
        sender.register_codec(&vp8(2), 1, 1200).unwrap();
        sender.on_channel_parameters(400_000, 0, 0).unwrap();
        let encoder = fixture.encoder();
        encoder.state().fail_encode = Some(EncodeError::FallbackSoftware);

        let err = sender.submit_frame(&frame(0, 320, 240), None).unwrap_err();
        assert!(matches!(
            err,
            SenderError::Encoder(EncodeError::FallbackSoftware)
        ));
        assert_eq!(err.code(), -13);
        assert_eq!(sender.schedule(), vec![Key, Key]);

        encoder.state().fail_encode = None;
        sender.submit_frame(&frame(3000, 320, 240), None).unwrap();
        assert_eq!(encoder.last_encode().unwrap().frame_types, vec![Key, Key]);
        assert_eq!(sender.schedule(), vec![Delta, Delta]);
    }

    #[test]
    fn test_codec_specific_info_is_forwarded() {
        let fixture = Fixture::new();
        let sender = &fixture.sender;
        sender.register_codec(&vp8(1), 1, 1200).unwrap();
        sender.on_channel_parameters(400_000, 0, 0).unwrap();
        let info = CodecSpecificInfo::Vp8 {
            picture_id: Some(7),
            simulcast_idx: 0,
            temporal_idx: Some(0),
            non_reference: false,
        };

        sender.submit_frame(&frame(0, 320, 240), Some(&info)).unwrap();

        assert_eq!(
            fixture.encoder().last_encode().unwrap().codec_specific_info,
            Some(info)
        );
    }

    #[test]
    fn test_native_frame_converted_for_cpu_encoder() {
        let fixture = Fixture::new();
        let sender = &fixture.sender;
        sender.register_codec(&vp8(1), 1, 1200).unwrap();
        sender.on_channel_parameters(400_000, 0, 0).unwrap();
        let data = Bytes::from(vec![128u8; 320 * 240 * 3 / 2]);

        sender.submit_frame(&nv12_frame(0, data), None).unwrap();

        let call = fixture.encoder().last_encode().unwrap();
        assert!(!call.native);
        assert_eq!((call.width, call.height), (320, 240));
    }

    #[test]
    fn test_native_frame_conversion_failure() {
        let fixture = Fixture::new();
        let sender = &fixture.sender;
        sender.register_codec(&vp8(1), 1, 1200).unwrap();
        sender.on_channel_parameters(400_000, 0, 0).unwrap();

        let err = sender
            .submit_frame(&nv12_frame(0, Bytes::from_static(&[0; 16])), None)
            .unwrap_err();

        assert!(matches!(
            err,
            SenderError::Parameter(ParameterError::ConversionFailed(_))
        ));
        assert_eq!(err.code(), -4);
        assert_eq!(fixture.encoder().encode_count(), 0);
        assert_eq!(sender.schedule(), vec![Key]);
    }

    #[test]
    fn test_native_frame_passed_to_native_encoder() {
        let fixture = Fixture::new();
        let sender = &fixture.sender;
        let (encoder, handle) = DummyEncoder::new(false, true);
        sender.attach_encoder(shared(encoder), EXTERNAL_PAYLOAD_TYPE, false);
        sender.register_codec(&external(vp8(1)), 1, 1200).unwrap();
        sender.on_channel_parameters(400_000, 0, 0).unwrap();

        // Too short to convert, but never converted.
        sender
            .submit_frame(&nv12_frame(0, Bytes::from_static(&[0; 16])), None)
            .unwrap();

        assert!(handle.last_encode().unwrap().native);
    }

    #[test]
    fn test_frame_dropper_policy() {
        let fixture = Fixture::new();
        let sender = &fixture.sender;
        let screenshare = VideoCodec {
            mode: VideoCodecMode::Screensharing,
            codec_specific: CodecSpecific::Vp8 {
                number_of_temporal_layers: 2,
                denoising_on: false,
            },
            ..vp8(1)
        };

        sender.enable_frame_dropper(true);
        assert_eq!(fixture.rate.state().dropper_enabled, Some(true));

        sender.register_codec(&screenshare, 1, 1200).unwrap();
        assert_eq!(fixture.rate.state().dropper_enabled, Some(false));
        assert_eq!(
            fixture.rate.state().encoding_data.unwrap().num_temporal_layers,
            2
        );

        sender.register_codec(&vp8(1), 1, 1200).unwrap();
        assert_eq!(fixture.rate.state().dropper_enabled, Some(true));

        sender.enable_frame_dropper(false);
        sender.register_codec(&vp8(2), 1, 1200).unwrap();
        assert_eq!(fixture.rate.state().dropper_enabled, Some(false));
    }

    #[test]
    fn test_frame_dropper_option() {
        let clock = Arc::new(SimulatedClock::new(0));
        let rate = ScriptedRateController::default();
        let collaborators = SenderCollaborators {
            registry: Box::new(CodecDatabase::new()),
            rate_controller: Box::new(rate.clone()),
            post_encode_callback: None,
            send_stats_callback: None,
        };
        let options = SenderOptions {
            frame_dropper_enabled: Some(false),
            ..Default::default()
        };

        let _sender = VideoSender::new(clock, options, collaborators);

        assert_eq!(rate.state().dropper_enabled, Some(false));
    }

    #[test]
    fn test_detach_active_encoder() {
        let fixture = Fixture::new();
        let sender = &fixture.sender;
        let (encoder, handle) = DummyEncoder::new(true, false);
        sender.attach_encoder(shared(encoder), EXTERNAL_PAYLOAD_TYPE, true);
        sender.register_codec(&external(vp8(1)), 1, 1200).unwrap();
        assert!(sender.has_encoder());

        sender.detach_encoder(EXTERNAL_PAYLOAD_TYPE).unwrap();

        assert!(!sender.has_encoder());
        assert_eq!(handle.state().release_count, 1);
        let err = sender.submit_frame(&frame(0, 320, 240), None).unwrap_err();
        assert!(matches!(err, SenderError::Uninitialized));
        assert_eq!(err.code(), -7);
        assert!(matches!(sender.bitrate(), Err(SenderError::Uninitialized)));

        // Nothing to escalate to anymore, the request just waits.
        sender.request_keyframe(0).unwrap();
        assert!(handle.state().frame_requests.is_empty());

        let err = sender.detach_encoder(EXTERNAL_PAYLOAD_TYPE).unwrap_err();
        assert!(matches!(
            err,
            SenderError::Codec(CodecDatabaseError::UnknownPayloadType(EXTERNAL_PAYLOAD_TYPE))
        ));
        assert_eq!(err.code(), -6);
    }

    #[test]
    fn test_detach_inactive_encoder_keeps_slot() {
        let fixture = Fixture::new();
        let sender = &fixture.sender;
        let (encoder, _handle) = DummyEncoder::new(false, false);
        sender.attach_encoder(shared(encoder), EXTERNAL_PAYLOAD_TYPE, false);
        sender.register_codec(&vp8(1), 1, 1200).unwrap();

        sender.detach_encoder(EXTERNAL_PAYLOAD_TYPE).unwrap();

        assert!(sender.has_encoder());
    }

    #[test]
    fn test_registration_failures() {
        let fixture = Fixture::new();
        let sender = &fixture.sender;
        sender.register_codec(&vp8(1), 1, 1200).unwrap();
        sender.on_channel_parameters(400_000, 0, 0).unwrap();

        // Rejected settings leave the current encoder in place.
        let invalid = VideoCodec {
            width: 0,
            ..vp8(1)
        };
        let err = sender.register_codec(&invalid, 1, 1200).unwrap_err();
        assert!(matches!(
            err,
            SenderError::Parameter(ParameterError::InvalidCodec(_))
        ));
        sender.submit_frame(&frame(0, 320, 240), None).unwrap();
        assert_eq!(sender.send_codec(), Some(vp8(1)));

        // A codec nobody can build invalidates the previous instance.
        let h264 = VideoCodec {
            codec_type: VideoCodecType::H264,
            pl_name: String::from("H264"),
            pl_type: 107,
            codec_specific: CodecSpecific::H264 {
                key_frame_interval: 3000,
            },
            ..Default::default()
        };
        let err = sender.register_codec(&h264, 1, 1200).unwrap_err();
        assert!(matches!(
            err,
            SenderError::Codec(CodecDatabaseError::NoEncoder { .. })
        ));
        assert!(!sender.has_encoder());
        assert_eq!(fixture.encoder().state().release_count, 1);
        assert!(matches!(
            sender.submit_frame(&frame(3000, 320, 240), None),
            Err(SenderError::Uninitialized)
        ));

        // Init failures surface the encoder's error.
        let (encoder, handle) = DummyEncoder::frame_driven();
        handle.state().fail_init = Some(EncodeError::Memory);
        sender.attach_encoder(shared(encoder), EXTERNAL_PAYLOAD_TYPE, false);
        let err = sender.register_codec(&external(vp8(1)), 1, 1200).unwrap_err();
        assert!(matches!(
            err,
            SenderError::Codec(CodecDatabaseError::InitFailed(EncodeError::Memory))
        ));
        assert!(!sender.has_encoder());
    }

    #[test]
    fn test_tick_reports_statistics() {
        let stats = Arc::new(Mutex::new(Vec::new()));
        let recorder = StatsRecorder(Arc::clone(&stats));
        let fixture = Fixture::with_collaborators(|collaborators| {
            collaborators.send_stats_callback = Some(Box::new(recorder));
        });
        let sender = &fixture.sender;
        {
            let mut rate = fixture.rate.state();
            rate.sent_bitrate = 250_000;
            rate.sent_frame_rate = 15;
            rate.input_frame_rate = 25;
        }

        assert_eq!(sender.tick(), 1000);
        assert!(stats.lock().unwrap().is_empty());
        assert_eq!(sender.encoder_parameters().input_frame_rate, 25);

        fixture.clock.advance_time_ms(400);
        assert_eq!(sender.time_until_next_process(), 600);

        fixture.clock.advance_time_ms(600);
        assert_eq!(sender.tick(), 1000);
        assert_eq!(*stats.lock().unwrap(), vec![(250_000, 15)]);

        // Late ticks still report once.
        fixture.clock.advance_time_ms(2500);
        assert_eq!(sender.tick(), 1000);
        assert_eq!(stats.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_tick_without_statistics_sink() {
        let fixture = Fixture::new();
        fixture.rate.state().input_frame_rate = 12;
        fixture.clock.advance_time_ms(5000);

        assert_eq!(fixture.sender.tick(), 1000);
        assert_eq!(fixture.sender.encoder_parameters().input_frame_rate, 12);
    }

    #[test]
    fn test_with_media_optimization() {
        let clock = Arc::new(SimulatedClock::new(0));
        let mut collaborators = SenderCollaborators::new(clock.clone());
        let (encoder, handle) = DummyEncoder::frame_driven();
        collaborators
            .registry
            .register_external_encoder(shared(encoder), VP8_PAYLOAD_TYPE, false);
        let sender = VideoSender::new(clock.clone(), Default::default(), collaborators);
        sender.register_codec(&vp8(1), 1, 1200).unwrap();
        sender.on_channel_parameters(5_000_000, 0, 0).unwrap();

        for i in 0..30u32 {
            sender.submit_frame(&frame(i * 3000, 320, 240), None).unwrap();
            clock.advance_time_ms(33);
            sender.tick();
        }

        // Clamped to the codec maximum.
        assert_eq!(sender.bitrate().unwrap(), 2_000_000);
        assert_eq!(handle.encode_count(), 30);
        assert_eq!(sender.encoder_parameters().input_frame_rate, 30);
    }

    #[test]
    fn test_concurrent_entry_points() {
        let fixture = Fixture::new();
        let sender = Arc::clone(&fixture.sender);
        let (encoder, _handle) = DummyEncoder::new(true, false);
        sender.attach_encoder(shared(encoder), EXTERNAL_PAYLOAD_TYPE, true);
        sender.register_codec(&vp8(2), 1, 1200).unwrap();

        let mut workers = Vec::new();

        let submitter = Arc::clone(&sender);
        workers.push(thread::spawn(move || {
            for i in 0..300u32 {
                let _ = submitter.submit_frame(&frame(i * 3000, 320, 240), None);
            }
        }));

        let requester = Arc::clone(&sender);
        workers.push(thread::spawn(move || {
            for i in 0..300usize {
                let _ = requester.request_keyframe(i % 3);
            }
        }));

        let feedback = Arc::clone(&sender);
        workers.push(thread::spawn(move || {
            for i in 0..300u32 {
                let _ = feedback.on_channel_parameters((i % 4) * 100_000, 0, 20);
                feedback.tick();
                let _ = feedback.bitrate();
            }
        }));

        // Owning thread switches between frame driven and internal source encoders.
        let codecs = [vp8(2), external(vp8(1)), vp8(3)];
        for i in 0..150usize {
            sender.register_codec(&codecs[i % 3], 1, 1200).unwrap();
            sender.enable_frame_dropper(i % 2 == 0);
        }

        for worker in workers {
            worker.join().unwrap();
        }

        assert_eq!(sender.schedule().len(), codecs[149 % 3].stream_count());
    }
}
