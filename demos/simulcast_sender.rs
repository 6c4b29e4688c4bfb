// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Drives a [`VideoSender`] with synthetic frames and a scripted network, printing what the
//! encoder gets to see.

use std::sync::Arc;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use argh::FromArgs;

use cros_video_sender::backend::dummy::DummyEncoder;
use cros_video_sender::backend::dummy::DummyHandle;
use cros_video_sender::clock::Clock;
use cros_video_sender::clock::RealTimeClock;
use cros_video_sender::clock::SimulatedClock;
use cros_video_sender::codec::CodecSpecific;
use cros_video_sender::codec::VideoCodecMode;
use cros_video_sender::codec::VideoCodecType;
use cros_video_sender::codec_database::CodecDatabase;
use cros_video_sender::encoder::shared;
use cros_video_sender::encoder::FrameType;
use cros_video_sender::media_opt::MediaOptimization;
use cros_video_sender::sender::SendStatisticsCallback;
use cros_video_sender::sender::SenderCollaborators;
use cros_video_sender::sender::SenderOptions;
use cros_video_sender::video_frame::FrameBuffer;
use cros_video_sender::video_frame::I420Buffer;
use cros_video_sender::video_frame::VideoFrame;
use cros_video_sender::VideoCodec;
use cros_video_sender::VideoSender;

/// Simulcast sender simulation
#[derive(Debug, FromArgs)]
struct Args {
    /// codec to register
    #[argh(option, default = "VideoCodecType::Vp8")]
    codec: VideoCodecType,

    /// content mode (realtime or screenshare)
    #[argh(option, default = "VideoCodecMode::RealtimeVideo")]
    mode: VideoCodecMode,

    /// frame width
    #[argh(option, default = "640")]
    width: u32,

    /// frame height
    #[argh(option, default = "360")]
    height: u32,

    /// number of simulcast streams
    #[argh(option, default = "2")]
    streams: u8,

    /// number of temporal layers
    #[argh(option, default = "1")]
    temporal_layers: u8,

    /// frames per second
    #[argh(option, default = "30")]
    framerate: u32,

    /// number of frames to submit
    #[argh(option, default = "300")]
    count: u32,

    /// network target bitrate in bits per second
    #[argh(option, default = "800000")]
    bitrate: u32,

    /// request a key frame on the last stream every this many frames, 0 to disable
    #[argh(option, default = "90")]
    keyframe_interval: u32,

    /// disable the frame dropper
    #[argh(switch)]
    no_frame_dropper: bool,

    /// pace frames with the wall clock instead of simulating time
    #[argh(switch)]
    realtime: bool,
}

struct LogStatistics;

impl SendStatisticsCallback for LogStatistics {
    fn send_statistics(&mut self, bitrate: u32, frame_rate: u32) {
        log::info!("sent {} bps at {} fps", bitrate, frame_rate);
    }
}

fn codec_from_args(args: &Args) -> VideoCodec {
    let codec_specific = match args.codec {
        VideoCodecType::Vp8 => CodecSpecific::Vp8 {
            number_of_temporal_layers: args.temporal_layers,
            denoising_on: true,
        },
        VideoCodecType::Vp9 => CodecSpecific::Vp9 {
            number_of_temporal_layers: args.temporal_layers,
            number_of_spatial_layers: 1,
        },
        VideoCodecType::H264 => CodecSpecific::H264 {
            key_frame_interval: 3000,
        },
        VideoCodecType::Generic => CodecSpecific::Generic,
    };

    VideoCodec {
        codec_type: args.codec,
        pl_name: format!("{:?}", args.codec),
        width: args.width,
        height: args.height,
        max_framerate: args.framerate,
        number_of_simulcast_streams: args.streams,
        mode: args.mode,
        codec_specific,
        ..Default::default()
    }
}

fn main() {
    env_logger::init();

    let args: Args = argh::from_env();
    let codec = codec_from_args(&args);

    let simulated = Arc::new(SimulatedClock::new(0));
    let clock: Arc<dyn Clock> = if args.realtime {
        Arc::new(RealTimeClock::new())
    } else {
        simulated.clone()
    };
    let created: Arc<Mutex<Vec<DummyHandle>>> = Default::default();

    let mut database = CodecDatabase::new();
    let registry = Arc::clone(&created);
    database.register_encoder_factory(args.codec, move || {
        let (encoder, handle) = DummyEncoder::frame_driven();
        registry.lock().unwrap().push(handle);
        shared(encoder)
    });

    let collaborators = SenderCollaborators {
        registry: Box::new(database),
        rate_controller: Box::new(MediaOptimization::new(clock.clone())),
        post_encode_callback: None,
        send_stats_callback: Some(Box::new(LogStatistics)),
    };
    let options = SenderOptions {
        frame_dropper_enabled: Some(!args.no_frame_dropper),
        ..Default::default()
    };
    let sender = VideoSender::new(clock.clone(), options, collaborators);

    if let Err(err) = sender.register_codec(&codec, 2, 1200) {
        log::error!("failed to register codec: {}", err);
        std::process::exit(1);
    }

    let frame_interval_ms = i64::from(1000 / args.framerate.max(1));
    let rtp_step = 90_000 / args.framerate.max(1);
    let buffer = I420Buffer::gray(codec.resolution());
    let last_stream = codec.stream_count() - 1;

    for i in 0..args.count {
        // The network halves its estimate for the middle third of the run.
        let bitrate = if (args.count / 3..2 * args.count / 3).contains(&i) {
            args.bitrate / 2
        } else {
            args.bitrate
        };
        if let Err(err) = sender.on_channel_parameters(bitrate, 0, 50) {
            log::warn!("failed to apply channel parameters: {}", err);
        }

        if args.keyframe_interval > 0 && i > 0 && i % args.keyframe_interval == 0 {
            if let Err(err) = sender.request_keyframe(last_stream) {
                log::warn!("key frame request failed: {}", err);
            }
        }

        let frame = VideoFrame::new(
            FrameBuffer::I420(buffer.clone()),
            i.wrapping_mul(rtp_step),
            clock.time_in_ms(),
        );
        if let Err(err) = sender.submit_frame(&frame, None) {
            log::error!("failed to submit frame {}: error code {}", i, err.code());
        }

        if args.realtime {
            thread::sleep(Duration::from_millis(frame_interval_ms as u64));
        } else {
            simulated.advance_time_ms(frame_interval_ms);
        }
        sender.tick();
    }

    let created = created.lock().unwrap();
    let Some(encoder) = created.last() else {
        return;
    };
    let state = encoder.state();
    let key_frames: usize = state
        .encode_calls
        .iter()
        .map(|call| call.frame_types.iter().filter(|t| **t == FrameType::Key).count())
        .sum();

    println!(
        "submitted {} frames: {} encoded, {} dropped, {} key frames over {} streams",
        args.count,
        state.encode_calls.len(),
        state.dropped_frames,
        key_frames,
        codec.stream_count()
    );
    if let Ok(bitrate) = sender.bitrate() {
        println!("final encoder target: {} bps", bitrate);
    }
}
