use std::io::Write;
use std::sync::{Mutex, PoisonError};

use ffmpeg_next::Rational;
use ffmpeg_next::format::Pixel;
use ffmpeg_next::frame::Video;

use crate::bitrate::Bitrate;
use crate::codec::CodecCapabilities;
use crate::converter::FrameConverter;
use crate::encoder::{EncoderSettings, VideoEncoder};
use crate::error::{EncodingError, InitStage, Result};
use crate::frame::FrameGeometry;

/// What a pipeline is built for. Fixed for the pipeline's lifetime.
#[derive(Debug, Clone)]
pub struct PipelineParams {
    pub geometry: FrameGeometry,
    pub bitrate: Option<Bitrate>,
    pub frame_rate: Rational,
}

struct Stages {
    converter: Option<FrameConverter>,
    encoder: VideoEncoder,
}

/// Optional pixel format conversion followed by encoding.
pub struct EncodingPipeline {
    geometry: FrameGeometry,
    target_format: Pixel,
    stages: Mutex<Option<Stages>>,
}

impl EncodingPipeline {
    pub fn new(codec_name: &str, params: &PipelineParams) -> Result<Self> {
        let codec = CodecCapabilities::find(codec_name)?;
        Self::with_codec(&codec, params)
    }

    pub fn with_codec(codec: &CodecCapabilities, params: &PipelineParams) -> Result<Self> {
        let source = params.geometry;
        let converter = match codec.conversion_target(source.format) {
            None => None,
            Some(format) => {
                log::info!(
                    "[{:?}] pixel format is not supported by {}, converting to {:?}",
                    source.format,
                    codec.name(),
                    format
                );
                let converter =
                    FrameConverter::with_format(source, format).map_err(|e| match e {
                        EncodingError::Conversion(source) => {
                            EncodingError::init(InitStage::Converter, source)
                        }
                        other => other,
                    })?;
                Some(converter)
            }
        };
        let target_format = converter
            .as_ref()
            .map(|c| c.target().format)
            .unwrap_or(source.format);

        // On failure the converter is dropped here, releasing its context
        // and buffer.
        let encoder = VideoEncoder::new(
            codec,
            &EncoderSettings {
                width: source.width,
                height: source.height,
                pixel_format: target_format,
                bitrate: params.bitrate,
                frame_rate: params.frame_rate,
            },
        )?;

        Ok(Self::from_parts(source, converter, encoder))
    }

    /// Assembles a pipeline from already built stages. `converter`, when
    /// present, must accept frames of `geometry`.
    pub fn from_parts(
        geometry: FrameGeometry,
        converter: Option<FrameConverter>,
        encoder: VideoEncoder,
    ) -> Self {
        let target_format = converter
            .as_ref()
            .map(|c| c.target().format)
            .unwrap_or(geometry.format);
        Self {
            geometry,
            target_format,
            stages: Mutex::new(Some(Stages { converter, encoder })),
        }
    }

    pub fn geometry(&self) -> FrameGeometry {
        self.geometry
    }

    /// Pixel format the encoder receives.
    pub fn target_format(&self) -> Pixel {
        self.target_format
    }

    pub fn has_converter(&self) -> bool {
        self.geometry.format != self.target_format
    }

    /// Converts (if needed) and encodes `frame`, writing packets to `sink`.
    /// Frames of a different geometry than the pipeline's are rejected.
    pub fn encode(&self, frame: &mut Video, sink: &mut dyn Write) -> Result<usize> {
        let guard = self.stages.lock().unwrap_or_else(PoisonError::into_inner);
        let stages = guard
            .as_ref()
            .ok_or(EncodingError::Disposed("EncodingPipeline"))?;

        if !self.geometry.matches(frame) {
            return Err(EncodingError::GeometryMismatch {
                expected: self.geometry,
                actual: FrameGeometry::of(frame),
            });
        }

        match &stages.converter {
            Some(converter) => {
                let mut converted = converter.convert(frame)?;
                stages.encoder.encode(converted.frame_mut(), sink)
            }
            None => stages.encoder.encode(frame, sink),
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.stages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    pub fn dispose(&self) {
        let mut guard = self.stages.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(stages) = guard.take() {
            stages.encoder.dispose();
            if let Some(converter) = stages.converter {
                converter.dispose();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::test_util::{EchoBackend, RecordingSink};
    use crate::frame::test_util::pattern_frame;

    fn params(format: Pixel) -> PipelineParams {
        PipelineParams {
            geometry: FrameGeometry::new(64, 48, format),
            bitrate: None,
            frame_rate: Rational::new(30, 1),
        }
    }

    fn mpeg4() -> Option<CodecCapabilities> {
        crate::init().unwrap();
        match CodecCapabilities::find("mpeg4") {
            Ok(caps) => Some(caps),
            Err(e) => {
                eprintln!("skip: {}", e);
                None
            }
        }
    }

    fn echo_pipeline(geometry: FrameGeometry, converter: Option<FrameConverter>) -> EncodingPipeline {
        EncodingPipeline::from_parts(
            geometry,
            converter,
            VideoEncoder::from_backend(Box::new(EchoBackend::default())),
        )
    }

    #[test]
    fn test_unknown_codec_fails() {
        crate::init().unwrap();
        let err = EncodingPipeline::new("no-such-encoder", &params(Pixel::YUV420P))
            .err()
            .unwrap();
        assert!(matches!(err, EncodingError::CodecNotFound(_)));
    }

    #[test]
    fn test_native_format_has_no_converter() -> anyhow::Result<()> {
        let Some(codec) = mpeg4() else { return Ok(()) };
        let pipeline = EncodingPipeline::with_codec(&codec, &params(Pixel::YUV420P))?;
        assert!(!pipeline.has_converter());
        assert_eq!(pipeline.target_format(), Pixel::YUV420P);
        Ok(())
    }

    #[test]
    fn test_unsupported_format_gets_converter() -> anyhow::Result<()> {
        let Some(codec) = mpeg4() else { return Ok(()) };
        let pipeline = EncodingPipeline::with_codec(&codec, &params(Pixel::RGB24))?;
        assert!(pipeline.has_converter());
        assert!(codec.is_format_supported(pipeline.target_format()));

        let mut sink = RecordingSink::default();
        let mut packets = 0;
        for i in 0..5 {
            packets += pipeline.encode(&mut pattern_frame(64, 48, Pixel::RGB24, i), &mut sink)?;
        }
        assert!(packets > 0);
        Ok(())
    }

    #[test]
    fn test_encoder_failure_after_converter_is_reported() {
        let Some(codec) = mpeg4() else { return };
        // MPEG-4 part 2 caps the time base denominator at 65535.
        let params = PipelineParams {
            frame_rate: Rational::new(100_000, 1),
            ..params(Pixel::RGB24)
        };
        let err = EncodingPipeline::with_codec(&codec, &params).err().unwrap();
        assert!(matches!(
            err,
            EncodingError::EncoderInit {
                stage: InitStage::Open,
                ..
            }
        ));
    }

    #[test]
    fn test_converts_before_encoding() -> anyhow::Result<()> {
        let geometry = FrameGeometry::new(32, 24, Pixel::RGB24);
        let converter = FrameConverter::with_format(geometry, Pixel::YUV420P)?;
        let pipeline = echo_pipeline(geometry, Some(converter));
        assert!(pipeline.has_converter());

        let mut sink = RecordingSink::default();
        for i in 0..3 {
            pipeline.encode(&mut pattern_frame(32, 24, Pixel::RGB24, i), &mut sink)?;
        }
        assert_eq!(sink.chunks(), vec![vec![0], vec![1], vec![2]]);
        Ok(())
    }

    #[test]
    fn test_rejects_geometry_drift() -> anyhow::Result<()> {
        let geometry = FrameGeometry::new(32, 24, Pixel::YUV420P);
        let pipeline = echo_pipeline(geometry, None);
        let mut sink = RecordingSink::default();

        let err = pipeline
            .encode(&mut pattern_frame(64, 48, Pixel::YUV420P, 0), &mut sink)
            .unwrap_err();
        assert!(matches!(
            err,
            EncodingError::GeometryMismatch { expected, .. } if expected == geometry
        ));
        assert!(!err.is_fatal());

        pipeline.encode(&mut pattern_frame(32, 24, Pixel::YUV420P, 0), &mut sink)?;
        assert_eq!(sink.len(), 1);
        Ok(())
    }

    #[test]
    fn test_dispose_is_idempotent() {
        let geometry = FrameGeometry::new(32, 24, Pixel::YUV420P);
        let pipeline = echo_pipeline(geometry, None);
        pipeline.dispose();
        pipeline.dispose();
        assert!(pipeline.is_disposed());

        let err = pipeline
            .encode(
                &mut pattern_frame(32, 24, Pixel::YUV420P, 0),
                &mut RecordingSink::default(),
            )
            .unwrap_err();
        assert!(matches!(err, EncodingError::Disposed("EncodingPipeline")));
    }
}
