//! Bitrate values and write-speed metering for output sinks.

use std::fmt::{Display, Formatter};
use std::io::{Seek, SeekFrom, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::{EncodingError, Result};

/// Target bitrate, bits per second.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Bitrate(u64);

impl Bitrate {
    pub const fn new(bits_per_second: u64) -> Self {
        Self(bits_per_second)
    }

    pub const fn bits_per_second(&self) -> u64 {
        self.0
    }
}

impl TryFrom<i64> for Bitrate {
    type Error = EncodingError;

    fn try_from(value: i64) -> Result<Self> {
        u64::try_from(value).map(Bitrate).map_err(|_| {
            EncodingError::InvalidArgument(format!(
                "bitrate must be greater or equal to zero, got {value}"
            ))
        })
    }
}

impl Display for Bitrate {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let bps = self.0;
        if bps == 0 {
            write!(f, "0")
        } else if bps > 1_000_000 {
            write!(f, "{} Mbit/sec", grouped(bps as f64 / 1e6, 1))
        } else if bps > 1_000 {
            write!(f, "{} Kbit/sec", grouped(bps as f64 / 1e3, 0))
        } else {
            write!(f, "{} bit/sec", bps)
        }
    }
}

/// Formats a non-negative value with `decimals` digits and comma-separated
/// thousands.
fn grouped(value: f64, decimals: usize) -> String {
    let text = format!("{:.*}", decimals, value);
    let (int, frac) = match text.split_once('.') {
        Some((int, frac)) => (int, Some(frac)),
        None => (text.as_str(), None),
    };
    let mut out = String::with_capacity(text.len() + int.len() / 3);
    for (i, c) in int.chars().enumerate() {
        if i > 0 && (int.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    if let Some(frac) = frac {
        out.push('.');
        out.push_str(frac);
    }
    out
}

/// Shortest sampling period accepted by [`BitrateMeter`].
pub const MIN_SAMPLE_PERIOD: Duration = Duration::from_millis(500);

/// Write-through proxy that samples how many bytes per second pass through
/// it. Samples are published on a watch channel and only when they change.
pub struct BitrateMeter<W> {
    inner: W,
    written: Arc<AtomicU64>,
    speed: watch::Receiver<u64>,
    cancel: CancellationToken,
}

impl<W> BitrateMeter<W> {
    /// Starts the sampling task on the current Tokio runtime. Fails when
    /// called outside of one.
    pub fn new(inner: W, period: Duration) -> Result<Self> {
        if period < MIN_SAMPLE_PERIOD {
            return Err(EncodingError::InvalidArgument(format!(
                "sample period must be at least {:?}, got {:?}",
                MIN_SAMPLE_PERIOD, period
            )));
        }

        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            EncodingError::InvalidArgument(
                "bitrate meter needs a running Tokio runtime".to_string(),
            )
        })?;

        let written = Arc::new(AtomicU64::new(0));
        let (tx, rx) = watch::channel(0u64);
        let cancel = CancellationToken::new();

        let written_clone = written.clone();
        let cancel_clone = cancel.clone();
        runtime.spawn(async move {
            let mut last = tokio::time::Instant::now();
            let mut interval = tokio::time::interval_at(last + period, period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel_clone.cancelled() => break,
                    now = interval.tick() => {
                        let bytes = written_clone.swap(0, Ordering::Relaxed);
                        let speed = bytes_per_second(bytes, now.duration_since(last));
                        last = now;
                        tx.send_if_modified(|current| {
                            if *current == speed {
                                return false;
                            }
                            *current = speed;
                            true
                        });
                    }
                }
            }
        });

        Ok(Self {
            inner,
            written,
            speed: rx,
            cancel,
        })
    }

    /// Last sampled write speed, bytes per second.
    pub fn write_speed(&self) -> u64 {
        *self.speed.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.speed.clone()
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    /// Stops sampling. The sink itself stays usable.
    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

impl<W> Drop for BitrateMeter<W> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn bytes_per_second(bytes: u64, elapsed: Duration) -> u64 {
    let ms = elapsed.as_secs_f64() * 1000.0;
    if ms <= 0.0 {
        return 0;
    }
    // f64::round rounds half away from zero.
    (bytes as f64 * 1000.0 / ms).round() as u64
}

impl<W: Write> Write for BitrateMeter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.written.fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

impl<W: Seek> Seek for BitrateMeter<W> {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.inner.seek(pos)
    }
}
