#![no_main]

use std::sync::Arc;

use cros_video_sender::backend::dummy::DummyEncoder;
use cros_video_sender::clock::SimulatedClock;
use cros_video_sender::codec::VideoCodecType;
use cros_video_sender::codec_database::CodecDatabase;
use cros_video_sender::encoder::shared;
use cros_video_sender::encoder::EncodeError;
use cros_video_sender::media_opt::MediaOptimization;
use cros_video_sender::sender::SenderCollaborators;
use cros_video_sender::video_frame::FrameBuffer;
use cros_video_sender::video_frame::I420Buffer;
use cros_video_sender::video_frame::VideoFrame;
use cros_video_sender::Resolution;
use cros_video_sender::VideoCodec;
use cros_video_sender::VideoSender;
use libfuzzer_sys::fuzz_target;

const EXTERNAL_PAYLOAD_TYPE: u8 = 120;

fn codec(data: &[u8]) -> VideoCodec {
    let byte = |i: usize| data.get(i).copied().unwrap_or(0);

    VideoCodec {
        codec_type: VideoCodecType::n(byte(0) % 4).unwrap_or_default(),
        pl_type: if byte(1) % 2 == 0 { 96 } else { EXTERNAL_PAYLOAD_TYPE },
        width: 16 * u32::from(byte(2) % 4),
        height: 16 * u32::from(byte(3) % 4),
        max_framerate: u32::from(byte(4) % 61),
        number_of_simulcast_streams: byte(5) % 6,
        ..Default::default()
    }
}

fuzz_target!(|data: &[u8]| {
    let clock = Arc::new(SimulatedClock::new(0));

    let mut database = CodecDatabase::new();
    for codec_type in [VideoCodecType::Vp8, VideoCodecType::Vp9, VideoCodecType::H264] {
        database.register_encoder_factory(codec_type, || shared(DummyEncoder::frame_driven().0));
    }
    let collaborators = SenderCollaborators {
        registry: Box::new(database),
        rate_controller: Box::new(MediaOptimization::new(clock.clone())),
        post_encode_callback: None,
        send_stats_callback: None,
    };
    let sender = VideoSender::new(clock.clone(), Default::default(), collaborators);

    let mut registered: Option<VideoCodec> = None;
    let mut timestamp = 0u32;

    for op in data.chunks(8) {
        let arg = op.get(1).copied().unwrap_or(0);

        match op[0] % 8 {
            0 => {
                let codec = codec(&op[1..]);
                if sender.register_codec(&codec, 1, 1200).is_ok() {
                    registered = Some(codec);
                }
            }
            1 => {
                let (encoder, handle) = DummyEncoder::new(arg % 2 == 0, arg % 3 == 0);
                if arg % 5 == 0 {
                    handle.state().fail_encode = EncodeError::from_code(-i32::from(arg % 16));
                }
                sender.attach_encoder(shared(encoder), EXTERNAL_PAYLOAD_TYPE, arg % 2 == 0);
            }
            2 => {
                // Detaching never touches the schedule.
                let _ = sender.detach_encoder(EXTERNAL_PAYLOAD_TYPE);
            }
            3 => {
                let _ = sender.on_channel_parameters(u32::from(arg) * 10_000, arg, i64::from(arg));
            }
            4 => {
                let _ = sender.request_keyframe(usize::from(arg % 6));
            }
            5 | 6 => {
                let resolution = registered
                    .as_ref()
                    .filter(|_| arg % 7 != 0)
                    .map_or(Resolution::default(), |codec| codec.resolution());
                let buffer = FrameBuffer::I420(I420Buffer::gray(resolution));
                let frame = VideoFrame::new(buffer, timestamp, 0);
                timestamp = timestamp.wrapping_add(3000);
                let _ = sender.submit_frame(&frame, None);
            }
            _ => {
                clock.advance_time_ms(i64::from(arg));
                sender.tick();
            }
        }

        if let Some(codec) = &registered {
            assert_eq!(sender.schedule().len(), codec.stream_count());
        }
    }
});
