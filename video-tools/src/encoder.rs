use std::io::Write;
use std::sync::{Mutex, PoisonError};

use ffmpeg_next::codec::packet::Packet;
use ffmpeg_next::format::Pixel;
use ffmpeg_next::frame::Video;
use ffmpeg_next::{Error, Rational};

use crate::bitrate::Bitrate;
use crate::codec::CodecCapabilities;
use crate::error::{EncodingError, InitStage, Result};

/// Keyframe interval used when the frame rate is unknown or invalid.
pub const DEFAULT_KEYFRAME_INTERVAL: u32 = 25;

/// Number of frames between forced keyframes: one second's worth.
pub fn keyframe_interval(frame_rate: Rational) -> u32 {
    if frame_rate.denominator() <= 0 || frame_rate.numerator() <= 0 {
        return DEFAULT_KEYFRAME_INTERVAL;
    }
    let fps = frame_rate.numerator() as f64 / frame_rate.denominator() as f64;
    (fps.round() as u32).max(1)
}

/// Codec private options that must be accepted for a live, low-latency
/// stream. Keyed by encoder name.
fn required_options(codec_name: &str) -> &'static [(&'static str, &'static str)] {
    match codec_name {
        "libx264" | "libx264rgb" => &[
            ("preset", "ultrafast"),
            ("tune", "zerolatency"),
            // Scene cuts would break the fixed keyframe cadence.
            ("sc_threshold", "0"),
        ],
        _ => &[],
    }
}

/// Push/pull surface of an opened codec.
pub trait EncoderBackend: Send {
    fn push_frame(&mut self, frame: &Video) -> std::result::Result<(), Error>;

    /// Fills `packet` with the next output packet. `EAGAIN` and `Eof` mean
    /// that nothing is ready.
    fn pull_packet(&mut self, packet: &mut Packet) -> std::result::Result<(), Error>;
}

impl EncoderBackend for ffmpeg_next::encoder::video::Encoder {
    fn push_frame(&mut self, frame: &Video) -> std::result::Result<(), Error> {
        ffmpeg_next::encoder::Encoder::send_frame(&mut **self, frame)
    }

    fn pull_packet(&mut self, packet: &mut Packet) -> std::result::Result<(), Error> {
        ffmpeg_next::encoder::Encoder::receive_packet(&mut **self, packet)
    }
}

#[derive(Debug, Clone)]
pub struct EncoderSettings {
    pub width: u32,
    pub height: u32,
    pub pixel_format: Pixel,
    /// `None` leaves rate control to the codec's constant quality mode.
    pub bitrate: Option<Bitrate>,
    pub frame_rate: Rational,
}

struct EncoderState {
    backend: Option<Box<dyn EncoderBackend>>,
    packet: Packet,
    frame_index: i64,
}

/// Encodes frames and writes the resulting elementary stream packets to a
/// sink.
pub struct VideoEncoder {
    state: Mutex<EncoderState>,
}

impl VideoEncoder {
    pub fn new(codec: &CodecCapabilities, settings: &EncoderSettings) -> Result<Self> {
        let ptr = unsafe { ffmpeg_next::ffi::avcodec_alloc_context3(codec.codec().as_ptr()) };
        if ptr.is_null() {
            return Err(EncodingError::init(
                InitStage::AllocContext,
                Error::Other {
                    errno: ffmpeg_next::util::error::ENOMEM,
                },
            ));
        }
        let context = unsafe { ffmpeg_next::codec::Context::wrap(ptr, None) };
        let mut encoder = context
            .encoder()
            .video()
            .map_err(|e| EncodingError::init(InitStage::AllocContext, e))?;

        let frame_rate = if settings.frame_rate.numerator() > 0
            && settings.frame_rate.denominator() > 0
        {
            settings.frame_rate.reduce()
        } else {
            Rational::new(DEFAULT_KEYFRAME_INTERVAL as i32, 1)
        };
        let gop = keyframe_interval(settings.frame_rate);

        encoder.set_width(settings.width);
        encoder.set_height(settings.height);
        encoder.set_format(settings.pixel_format);
        encoder.set_frame_rate(Some(frame_rate));
        encoder.set_time_base(frame_rate.invert());
        encoder.set_gop(gop);
        encoder.set_max_b_frames(0);
        if let Some(bitrate) = settings.bitrate {
            encoder.set_bit_rate(bitrate.bits_per_second() as usize);
        }

        for &(key, value) in required_options(codec.name()) {
            set_option(&mut encoder, key, value)?;
        }

        let encoder = encoder
            .open_as(codec.codec())
            .map_err(|e| EncodingError::init(InitStage::Open, e))?;
        log::info!(
            "encoder opened: {} {}x{} {:?}, rate {}, gop {}, bitrate {}",
            codec.name(),
            settings.width,
            settings.height,
            settings.pixel_format,
            frame_rate,
            gop,
            settings
                .bitrate
                .map(|b| b.to_string())
                .unwrap_or_else(|| "auto".to_string()),
        );

        Ok(Self::from_backend(Box::new(encoder)))
    }

    pub fn from_backend(backend: Box<dyn EncoderBackend>) -> Self {
        Self {
            state: Mutex::new(EncoderState {
                backend: Some(backend),
                packet: Packet::empty(),
                frame_index: 0,
            }),
        }
    }

    /// Sends `frame` to the codec and writes every packet it emits in
    /// response to `sink`, in order. Returns the number of packets written,
    /// which may be zero while the codec is buffering.
    ///
    /// The frame's pts is restamped from the encoder's own frame counter.
    pub fn encode(&self, frame: &mut Video, sink: &mut dyn Write) -> Result<usize> {
        let mut guard = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let state = &mut *guard;
        let backend = state
            .backend
            .as_mut()
            .ok_or(EncodingError::Disposed("VideoEncoder"))?;

        frame.set_pts(Some(state.frame_index));
        state.frame_index += 1;
        backend.push_frame(frame).map_err(EncodingError::encode)?;

        let mut written = 0;
        loop {
            match backend.pull_packet(&mut state.packet) {
                Ok(()) => {
                    let result = match state.packet.data() {
                        Some(data) => sink.write_all(data),
                        None => Ok(()),
                    };
                    unsafe { ffmpeg_next::ffi::av_packet_unref(state.packet.as_mut_ptr()) };
                    result?;
                    written += 1;
                }
                Err(Error::Other { errno }) if errno == ffmpeg_next::util::error::EAGAIN => {
                    break;
                }
                Err(Error::Eof) => break,
                Err(e) => return Err(EncodingError::encode(e)),
            }
        }
        Ok(written)
    }

    pub fn is_disposed(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .backend
            .is_none()
    }

    /// Releases the codec context and packet buffer. Waits for an in-flight
    /// [`encode`](Self::encode) to finish first.
    pub fn dispose(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.backend.take().is_some() {
            state.packet = Packet::empty();
        }
    }
}

fn set_option(
    encoder: &mut ffmpeg_next::encoder::video::Video,
    key: &'static str,
    value: &str,
) -> Result<()> {
    let stage = InitStage::SetOption(key);
    let c_key = std::ffi::CString::new(key)
        .map_err(|_| EncodingError::init(stage, Error::InvalidData))?;
    let c_value = std::ffi::CString::new(value)
        .map_err(|_| EncodingError::init(stage, Error::InvalidData))?;
    let rc = unsafe {
        ffmpeg_next::ffi::av_opt_set(
            encoder.as_mut_ptr() as *mut std::ffi::c_void,
            c_key.as_ptr(),
            c_value.as_ptr(),
            ffmpeg_next::ffi::AV_OPT_SEARCH_CHILDREN as i32,
        )
    };
    if rc < 0 {
        return Err(EncodingError::init(stage, Error::from(rc)));
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod test_util {
    use std::collections::VecDeque;
    use std::io::Write;
    use std::sync::{Arc, Mutex};

    use super::*;

    /// Records every `write` call as a separate chunk.
    #[derive(Clone, Default)]
    pub struct RecordingSink {
        pub writes: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    impl RecordingSink {
        pub fn chunks(&self) -> Vec<Vec<u8>> {
            self.writes.lock().unwrap().clone()
        }

        pub fn len(&self) -> usize {
            self.writes.lock().unwrap().len()
        }
    }

    impl Write for RecordingSink {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.writes.lock().unwrap().push(buf.to_vec());
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    /// Emits one packet per frame, containing the frame's pts as a byte.
    /// Frames whose push index is listed in `fail_on` are rejected.
    #[derive(Default)]
    pub struct EchoBackend {
        pub pushed: usize,
        pub fail_on: Vec<usize>,
        pub ready: VecDeque<u8>,
    }

    impl EchoBackend {
        pub fn failing_on(fail_on: Vec<usize>) -> Self {
            Self {
                fail_on,
                ..Default::default()
            }
        }
    }

    impl EncoderBackend for EchoBackend {
        fn push_frame(&mut self, frame: &Video) -> std::result::Result<(), Error> {
            let index = self.pushed;
            self.pushed += 1;
            if self.fail_on.contains(&index) {
                return Err(Error::InvalidData);
            }
            self.ready.push_back(frame.pts().unwrap_or(0) as u8);
            Ok(())
        }

        fn pull_packet(&mut self, packet: &mut Packet) -> std::result::Result<(), Error> {
            match self.ready.pop_front() {
                Some(b) => {
                    *packet = Packet::copy(&[b]);
                    Ok(())
                }
                None => Err(Error::Other {
                    errno: ffmpeg_next::util::error::EAGAIN,
                }),
            }
        }
    }
}
