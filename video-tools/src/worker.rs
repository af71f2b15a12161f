use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{Receiver, SyncSender, TryRecvError, TrySendError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use ffmpeg_next::Rational;
use ffmpeg_next::frame::Video;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::backoff::SpinBackoff;
use crate::bitrate::Bitrate;
use crate::error::{EncodingError, Result};
use crate::frame::{FrameGeometry, copy_frame};
use crate::frame_rate::{FrameRateCollector, MAX_WINDOW};
use crate::pipeline::{EncodingPipeline, PipelineParams};
use crate::pool::FramePool;

pub const POOL_SIZE: usize = 10;
pub const FRAME_QUEUE_BOUND: usize = 32;
pub const FRAME_RATE_WINDOW: u32 = 15;
pub const MAX_BACKOFF: Duration = Duration::from_millis(1);

const ERROR_CHANNEL_CAPACITY: usize = 64;
const DROP_LOG_INTERVAL: u64 = 120;

pub type Sink = Box<dyn Write + Send>;
pub type ErrorReceiver = broadcast::Receiver<Arc<EncodingError>>;
pub type PipelineFactory = Box<dyn FnMut(&PipelineParams) -> Result<EncodingPipeline> + Send>;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub codec: String,
    /// `None` lets the codec pick its quality mode.
    pub bitrate: Option<Bitrate>,
    pub pool_size: usize,
    pub queue_bound: usize,
    pub frame_rate_window: u32,
    pub max_backoff: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            codec: "libx264".to_string(),
            bitrate: None,
            pool_size: POOL_SIZE,
            queue_bound: FRAME_QUEUE_BOUND,
            frame_rate_window: FRAME_RATE_WINDOW,
            max_backoff: MAX_BACKOFF,
        }
    }
}

impl WorkerConfig {
    fn validate(&self) -> Result<()> {
        if self.pool_size == 0 || self.queue_bound == 0 {
            return Err(EncodingError::InvalidArgument(format!(
                "pool size ({}) and queue bound ({}) must be positive",
                self.pool_size, self.queue_bound
            )));
        }
        if !(2..=MAX_WINDOW).contains(&self.frame_rate_window) {
            return Err(EncodingError::InvalidArgument(format!(
                "frame rate window must be in 2..={}, got {}",
                MAX_WINDOW, self.frame_rate_window
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WorkerStats {
    pub frames_fed: u64,
    pub frames_encoded: u64,
    /// Frames discarded without reaching the codec: queue full, frame rate
    /// not known yet, or no output set.
    pub frames_dropped: u64,
    pub errors: u64,
    pub pipelines_built: u64,
    pub converter_in_use: bool,
}

#[derive(Default)]
struct Counters {
    fed: AtomicU64,
    encoded: AtomicU64,
    dropped: AtomicU64,
    errors: AtomicU64,
    pipelines_built: AtomicU64,
    converter_in_use: AtomicBool,
}

impl Counters {
    fn snapshot(&self) -> WorkerStats {
        WorkerStats {
            frames_fed: self.fed.load(Ordering::Relaxed),
            frames_encoded: self.encoded.load(Ordering::Relaxed),
            frames_dropped: self.dropped.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            pipelines_built: self.pipelines_built.load(Ordering::Relaxed),
            converter_in_use: self.converter_in_use.load(Ordering::Relaxed),
        }
    }
}

struct QueuedFrame {
    frame: Video,
    frame_rate: Option<Rational>,
}

/// Accepts frames from any thread and encodes them on a dedicated one.
///
/// [`feed`](Self::feed) copies the caller's frame into a pooled buffer and
/// queues it; it never blocks on encoding. The encoding pipeline is built
/// from the first frame that arrives once the input frame rate is known
/// and is kept for the worker's lifetime. Errors are published on
/// [`subscribe_errors`](Self::subscribe_errors): a pipeline that cannot be
/// built stops the worker, per-frame failures do not.
pub struct EncodingWorker {
    tx: SyncSender<QueuedFrame>,
    pool: Arc<FramePool>,
    output: Arc<Mutex<Option<Sink>>>,
    collector: Mutex<Option<FrameRateCollector>>,
    frame_rate_window: u32,
    errors: broadcast::Sender<Arc<EncodingError>>,
    counters: Arc<Counters>,
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl EncodingWorker {
    pub fn new(config: WorkerConfig) -> Result<Self> {
        let codec = config.codec.clone();
        Self::with_factory(
            config,
            Box::new(move |params: &PipelineParams| EncodingPipeline::new(&codec, params)),
        )
    }

    /// Like [`new`](Self::new), with pipelines built by `factory` instead of
    /// looked up by codec name.
    pub fn with_factory(config: WorkerConfig, factory: PipelineFactory) -> Result<Self> {
        config.validate()?;

        let (tx, rx) = std::sync::mpsc::sync_channel(config.queue_bound);
        let (errors, _) = broadcast::channel(ERROR_CHANNEL_CAPACITY);
        let pool = Arc::new(FramePool::new(config.pool_size));
        let output = Arc::new(Mutex::new(None));
        let counters = Arc::new(Counters::default());
        let cancel = CancellationToken::new();

        let worker_loop = WorkerLoop {
            rx,
            pool: pool.clone(),
            output: output.clone(),
            errors: errors.clone(),
            counters: counters.clone(),
            cancel: cancel.clone(),
            factory,
            bitrate: config.bitrate,
            frame_rate: None,
            pipeline: None,
            backoff: SpinBackoff::new(config.max_backoff),
        };
        let handle = std::thread::Builder::new()
            .name("encoding worker".to_string())
            .spawn(move || worker_loop.run())?;

        log::info!(
            "encoding worker created: codec {}, bitrate {}",
            config.codec,
            config
                .bitrate
                .map(|b| b.to_string())
                .unwrap_or_else(|| "auto".to_string())
        );

        Ok(Self {
            tx,
            pool,
            output,
            collector: Mutex::new(None),
            frame_rate_window: config.frame_rate_window,
            errors,
            counters,
            cancel,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Queues a copy of `frame` for encoding. The caller keeps ownership of
    /// `frame` and may reuse it as soon as this returns.
    ///
    /// A full queue drops the frame and still returns `Ok`.
    pub fn feed(&self, frame: &Video) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(EncodingError::Disposed("EncodingWorker"));
        }
        self.counters.fed.fetch_add(1, Ordering::Relaxed);

        let frame_rate = {
            let mut collector = self
                .collector
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let collector =
                collector.get_or_insert_with(|| FrameRateCollector::new(self.frame_rate_window));
            collector.frame_received();
            collector.frame_rate()
        };

        let mut copy = self.pool.take(FrameGeometry::of(frame))?;
        if let Err(e) = copy_frame(frame, &mut copy) {
            self.pool.give_back(copy);
            return Err(e);
        }

        match self.tx.try_send(QueuedFrame {
            frame: copy,
            frame_rate,
        }) {
            Ok(()) => {}
            Err(TrySendError::Full(queued)) => {
                let dropped = self.counters.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped % DROP_LOG_INTERVAL == 1 {
                    log::debug!("encoding queue full, frame dropped ({} so far)", dropped);
                }
                self.pool.give_back(queued.frame);
            }
            Err(TrySendError::Disconnected(queued)) => {
                log::debug!("encoding worker has stopped, frame discarded");
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                self.pool.give_back(queued.frame);
            }
        }
        Ok(())
    }

    /// Replaces the sink encoded packets are written to. Frames processed
    /// while no sink is set are dropped.
    pub fn set_output(&self, sink: Option<Sink>) {
        *self.output.lock().unwrap_or_else(PoisonError::into_inner) = sink;
    }

    pub fn subscribe_errors(&self) -> ErrorReceiver {
        self.errors.subscribe()
    }

    pub fn stats(&self) -> WorkerStats {
        self.counters.snapshot()
    }

    /// Buffers currently held for reuse.
    pub fn pooled_frames(&self) -> usize {
        self.pool.len()
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// Stops the worker thread and waits for it, then frees every buffer the
    /// worker holds. An encode already in progress completes first. Calling
    /// it again is a no-op.
    pub fn dispose(&self) {
        self.cancel.cancel();
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.thread().id() == std::thread::current().id() {
                log::warn!("encoding worker disposed from its own thread, not joining");
            } else if handle.join().is_err() {
                log::error!("encoding worker thread panicked");
            }
            self.pool.clear();
            log::info!("encoding worker disposed");
        }
    }
}

impl Drop for EncodingWorker {
    fn drop(&mut self) {
        self.dispose();
    }
}

struct WorkerLoop {
    rx: Receiver<QueuedFrame>,
    pool: Arc<FramePool>,
    output: Arc<Mutex<Option<Sink>>>,
    errors: broadcast::Sender<Arc<EncodingError>>,
    counters: Arc<Counters>,
    cancel: CancellationToken,
    factory: PipelineFactory,
    bitrate: Option<Bitrate>,
    frame_rate: Option<Rational>,
    pipeline: Option<EncodingPipeline>,
    backoff: SpinBackoff,
}

impl WorkerLoop {
    fn run(mut self) {
        log::debug!("encoding worker started");
        while !self.cancel.is_cancelled() {
            let queued = match self.rx.try_recv() {
                Ok(queued) => queued,
                Err(TryRecvError::Empty) => {
                    self.backoff.snooze();
                    continue;
                }
                Err(TryRecvError::Disconnected) => break,
            };
            self.backoff.reset();

            if queued.frame_rate.is_some() {
                self.frame_rate = queued.frame_rate;
            }
            if let Err(e) = self.process(queued.frame) {
                log::error!("can't create encoding pipeline: {}", e);
                self.report(e);
                break;
            }
        }

        if let Some(pipeline) = self.pipeline.take() {
            pipeline.dispose();
        }
        // Frames still queued are freed along with the receiver.
        log::debug!("encoding worker stopped");
    }

    /// Encodes one frame. Only a failure to build the pipeline is returned;
    /// encoding failures are reported and the loop goes on.
    fn process(&mut self, mut frame: Video) -> Result<()> {
        let Some(frame_rate) = self.frame_rate else {
            self.discard(frame);
            return Ok(());
        };

        let output = self.output.clone();
        let mut output = output.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(sink) = output.as_mut() else {
            log::warn!("no output set, frame skipped");
            self.discard(frame);
            return Ok(());
        };

        if self.pipeline.is_none() {
            let params = PipelineParams {
                geometry: FrameGeometry::of(&frame),
                bitrate: self.bitrate,
                frame_rate,
            };
            let pipeline = match (self.factory)(&params) {
                Ok(pipeline) => pipeline,
                Err(e) => {
                    self.pool.give_back(frame);
                    return Err(e);
                }
            };
            log::info!(
                "encoding pipeline built for {} at {} fps, target format {:?}",
                params.geometry,
                frame_rate,
                pipeline.target_format()
            );
            self.counters.pipelines_built.fetch_add(1, Ordering::Relaxed);
            self.counters
                .converter_in_use
                .store(pipeline.has_converter(), Ordering::Relaxed);
            self.pipeline = Some(pipeline);
        }

        if let Some(pipeline) = &self.pipeline {
            match pipeline.encode(&mut frame, sink.as_mut()) {
                Ok(_) => {
                    self.counters.encoded.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    log::warn!("frame not encoded: {}", e);
                    self.report(e);
                }
            }
        }
        drop(output);
        self.pool.give_back(frame);
        Ok(())
    }

    fn discard(&self, frame: Video) {
        self.counters.dropped.fetch_add(1, Ordering::Relaxed);
        self.pool.give_back(frame);
    }

    fn report(&self, error: EncodingError) {
        self.counters.errors.fetch_add(1, Ordering::Relaxed);
        // No subscribers is fine.
        let _ = self.errors.send(Arc::new(error));
    }
}

#[cfg(test)]
#[path = "worker_test.rs"]
mod worker_test;
