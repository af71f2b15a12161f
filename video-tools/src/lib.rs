use ffmpeg_next::util::log::Level;

/// Registers FFmpeg components and aligns FFmpeg's own log output with the
/// `log` crate's maximum level. Call once at startup; later calls are
/// harmless.
pub fn init() -> anyhow::Result<()> {
    ffmpeg_next::init().map_err(|e| anyhow::anyhow!("ffmpeg_next init: {}", e))?;
    let level = match log::max_level() {
        log::LevelFilter::Off => Level::Quiet,
        log::LevelFilter::Error => Level::Error,
        log::LevelFilter::Warn => Level::Warning,
        log::LevelFilter::Info => Level::Info,
        log::LevelFilter::Debug => Level::Verbose,
        log::LevelFilter::Trace => Level::Debug,
    };
    ffmpeg_next::util::log::set_level(level);
    Ok(())
}

pub mod backoff;
pub mod bitrate;
pub mod codec;
pub mod converter;
pub mod encoder;
pub mod error;
pub mod frame;
pub mod frame_rate;
pub mod pipeline;
pub mod pool;
pub mod worker;

pub use bitrate::{Bitrate, BitrateMeter};
pub use codec::CodecCapabilities;
pub use converter::{FrameConverter, ScaleBackend};
pub use encoder::{EncoderBackend, EncoderSettings, VideoEncoder};
pub use error::{EncodingError, InitStage, Result};
pub use frame::FrameGeometry;
pub use frame_rate::FrameRateCollector;
pub use pipeline::{EncodingPipeline, PipelineParams};
pub use worker::{EncodingWorker, WorkerConfig, WorkerStats};
