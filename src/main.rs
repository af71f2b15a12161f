use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use ffmpeg_next::format::Pixel;
use ffmpeg_next::frame::Video;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use video_tools::{Bitrate, BitrateMeter, EncodingWorker, FrameGeometry, WorkerConfig};

mod config;

fn init_logging() {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .filter_module("ffmpeg_next", log::LevelFilter::Info)
        .filter_module("video_tools", log::LevelFilter::Debug)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();
    video_tools::init()?;
    let config = config::config();

    let format: Pixel = config
        .pixel_format()
        .parse()
        .map_err(|_| anyhow::anyhow!("unknown pixel format '{}'", config.pixel_format()))?;
    let geometry = FrameGeometry::new(config.width(), config.height(), format);
    let bitrate = config.bitrate().map(Bitrate::try_from).transpose()?;

    let file = std::fs::File::create(config.output())?;
    let meter = BitrateMeter::new(file, Duration::from_millis(config.sample_period_ms()))?;
    let mut speed = meter.subscribe();

    let worker = Arc::new(EncodingWorker::new(WorkerConfig {
        codec: config.codec().to_string(),
        bitrate,
        ..Default::default()
    })?);
    let mut errors = worker.subscribe_errors();
    worker.set_output(Some(Box::new(meter)));
    log::info!(
        "transmitting {} at {} fps to {}",
        geometry,
        config.fps(),
        config.output()
    );

    let cancel = CancellationToken::new();
    let producer = start_producer(worker.clone(), geometry, config.fps(), cancel.clone())?;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                break;
            },
            _ = tokio::signal::ctrl_c() => {
                cancel.cancel();
            },
            Ok(()) = speed.changed() => {
                let bytes = *speed.borrow_and_update();
                log::info!("output: {}", Bitrate::new(bytes * 8));
            },
            error = errors.recv() => match error {
                Ok(e) if e.is_fatal() => {
                    log::error!("encoding stopped: {}", e);
                    cancel.cancel();
                }
                Ok(e) => log::warn!("frame lost: {}", e),
                Err(RecvError::Lagged(n)) => log::warn!("{} encoding errors not shown", n),
                Err(RecvError::Closed) => cancel.cancel(),
            },
        }
    }

    tokio::task::spawn_blocking(move || producer.join())
        .await?
        .map_err(|_| anyhow::anyhow!("frame producer panicked"))?;
    worker.dispose();
    let stats = worker.stats();
    log::info!(
        "fed {} frames, encoded {}, dropped {}, {} errors",
        stats.frames_fed,
        stats.frames_encoded,
        stats.frames_dropped,
        stats.errors
    );
    Ok(())
}

/// Feeds synthetic frames at `fps` from a plain thread, the way a capture
/// or decode thread would.
fn start_producer(
    worker: Arc<EncodingWorker>,
    geometry: FrameGeometry,
    fps: u32,
    cancel: CancellationToken,
) -> anyhow::Result<JoinHandle<()>> {
    let mut frame = geometry.alloc()?;
    let interval = Duration::from_secs(1) / fps;
    let handle = std::thread::Builder::new()
        .name("frame producer".to_string())
        .spawn(move || {
            let start = Instant::now();
            let mut index: u32 = 0;
            while !cancel.is_cancelled() {
                fill_pattern(&mut frame, index);
                frame.set_pts(Some(index as i64));
                if let Err(e) = worker.feed(&frame) {
                    log::error!("feed error: {}", e);
                    break;
                }
                index = index.wrapping_add(1);
                let next = start + interval * index;
                if let Some(wait) = next.checked_duration_since(Instant::now()) {
                    std::thread::sleep(wait);
                }
            }
        })?;
    Ok(handle)
}

/// Moving diagonal bands, so consecutive frames differ.
fn fill_pattern(frame: &mut Video, index: u32) {
    for plane in 0..frame.planes() {
        let stride = frame.stride(plane);
        let rows = frame.plane_height(plane) as usize;
        let data = frame.data_mut(plane);
        for row in 0..rows {
            let line = &mut data[row * stride..(row + 1) * stride];
            for (x, px) in line.iter_mut().enumerate() {
                *px = (x + row + index as usize * 2 + plane * 64) as u8;
            }
        }
    }
}
