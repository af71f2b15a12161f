use std::sync::{Mutex, PoisonError};

use ffmpeg_next::frame::Video;

use crate::error::Result;
use crate::frame::FrameGeometry;

/// Bounded cache of reusable frame buffers.
///
/// A buffer is either held here or owned by exactly one caller; handing one
/// out moves it. Buffers returned while the pool is full are freed.
pub struct FramePool {
    capacity: usize,
    frames: Mutex<Vec<Video>>,
}

impl FramePool {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            frames: Mutex::new(Vec::with_capacity(capacity)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.frames.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Hands out a pooled buffer of `geometry`, or allocates a new one.
    /// Pooled buffers of another geometry are freed on the way.
    pub fn take(&self, geometry: FrameGeometry) -> Result<Video> {
        let pooled = {
            let mut frames = self.frames.lock().unwrap_or_else(PoisonError::into_inner);
            let mut found = None;
            while let Some(frame) = frames.pop() {
                if geometry.matches(&frame) {
                    found = Some(frame);
                    break;
                }
            }
            found
        };
        match pooled {
            Some(frame) => Ok(frame),
            None => {
                log::trace!("frame allocated: {}", geometry);
                geometry.alloc()
            }
        }
    }

    /// Returns a buffer for reuse. Returns `false` when the pool was full
    /// and the buffer was freed instead.
    pub fn give_back(&self, frame: Video) -> bool {
        let mut frames = self.frames.lock().unwrap_or_else(PoisonError::into_inner);
        if frames.len() < self.capacity {
            frames.push(frame);
            true
        } else {
            log::trace!("frame freed: pool full");
            false
        }
    }

    pub fn clear(&self) {
        self.frames
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use ffmpeg_next::format::Pixel;

    use super::*;

    const GEOMETRY: FrameGeometry = FrameGeometry {
        width: 32,
        height: 24,
        format: Pixel::YUV420P,
    };

    #[test]
    fn test_reuses_buffers() -> anyhow::Result<()> {
        let pool = FramePool::new(2);
        let frame = pool.take(GEOMETRY)?;
        let ptr = frame.data(0).as_ptr();
        assert!(pool.give_back(frame));
        assert_eq!(pool.len(), 1);

        let again = pool.take(GEOMETRY)?;
        assert_eq!(again.data(0).as_ptr(), ptr);
        assert!(pool.is_empty());
        Ok(())
    }

    #[test]
    fn test_never_exceeds_capacity() -> anyhow::Result<()> {
        let pool = FramePool::new(3);
        let taken = (0..8)
            .map(|_| pool.take(GEOMETRY))
            .collect::<Result<Vec<_>>>()?;
        let kept = taken
            .into_iter()
            .map(|f| pool.give_back(f))
            .filter(|&kept| kept)
            .count();
        assert_eq!(kept, 3);
        assert_eq!(pool.len(), 3);
        Ok(())
    }

    #[test]
    fn test_checked_out_buffers_are_distinct() -> anyhow::Result<()> {
        let pool = FramePool::new(4);
        for _ in 0..4 {
            pool.give_back(pool.take(GEOMETRY)?);
        }
        let mut out = Vec::new();
        for _ in 0..6 {
            out.push(pool.take(GEOMETRY)?);
        }
        let mut ptrs: Vec<_> = out.iter().map(|f| f.data(0).as_ptr()).collect();
        ptrs.sort();
        ptrs.dedup();
        assert_eq!(ptrs.len(), 6);
        Ok(())
    }

    #[test]
    fn test_mismatched_buffers_are_dropped() -> anyhow::Result<()> {
        let pool = FramePool::new(4);
        pool.give_back(pool.take(GEOMETRY)?);
        let other = FrameGeometry::new(64, 48, Pixel::YUV420P);
        let frame = pool.take(other)?;
        assert!(other.matches(&frame));
        assert!(pool.is_empty());
        Ok(())
    }
}
