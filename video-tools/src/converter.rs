use std::ops::Deref;
use std::sync::{Mutex, MutexGuard, PoisonError};

use ffmpeg_next::format::Pixel;
use ffmpeg_next::frame::Video;
use ffmpeg_next::software::scaling::{Context, flag::Flags};

use crate::error::{EncodingError, Result};
use crate::frame::FrameGeometry;

/// The scale operation behind a [`FrameConverter`].
pub trait ScaleBackend: Send {
    fn scale(&mut self, src: &Video, dst: &mut Video) -> std::result::Result<(), ffmpeg_next::Error>;
}

struct Scaler {
    context: Context,
}

// The scaling context is only ever touched under the converter's lock.
unsafe impl Send for Scaler {}

impl Scaler {
    fn bicubic(source: FrameGeometry, target: FrameGeometry) -> Result<Self> {
        let context = Context::get(
            source.format,
            source.width,
            source.height,
            target.format,
            target.width,
            target.height,
            Flags::BICUBIC,
        )
        .map_err(EncodingError::Conversion)?;
        Ok(Self { context })
    }
}

impl ScaleBackend for Scaler {
    fn scale(&mut self, src: &Video, dst: &mut Video) -> std::result::Result<(), ffmpeg_next::Error> {
        self.context.run(src, dst)
    }
}

struct ConverterState {
    scaler: Option<Box<dyn ScaleBackend>>,
    result: Video,
}

/// Converts frames of one fixed geometry into another, writing every result
/// into the same destination buffer.
pub struct FrameConverter {
    source: FrameGeometry,
    target: FrameGeometry,
    state: Mutex<ConverterState>,
}

impl FrameConverter {
    pub fn new(source: FrameGeometry, target: FrameGeometry) -> Result<Self> {
        let scaler = Scaler::bicubic(source, target)?;
        Self::from_backend(source, target, Box::new(scaler))
    }

    /// Builds a converter around an already created scale operation for
    /// `source` to `target`.
    pub fn from_backend(
        source: FrameGeometry,
        target: FrameGeometry,
        scaler: Box<dyn ScaleBackend>,
    ) -> Result<Self> {
        let result = target.alloc()?;
        Ok(Self {
            source,
            target,
            state: Mutex::new(ConverterState {
                scaler: Some(scaler),
                result,
            }),
        })
    }

    /// Pixel format conversion at the source resolution.
    pub fn with_format(source: FrameGeometry, format: Pixel) -> Result<Self> {
        Self::new(source, FrameGeometry { format, ..source })
    }

    pub fn source(&self) -> FrameGeometry {
        self.source
    }

    pub fn target(&self) -> FrameGeometry {
        self.target
    }

    /// Converts `src` and returns the shared result buffer, carrying the
    /// source's pts and properties. The buffer stays locked while the guard
    /// is alive, so the next conversion waits for it to be dropped.
    pub fn convert(&self, src: &Video) -> Result<Converted<'_>> {
        let mut guard = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let state = &mut *guard;
        let scaler = state
            .scaler
            .as_mut()
            .ok_or(EncodingError::Disposed("FrameConverter"))?;

        scaler
            .scale(src, &mut state.result)
            .map_err(EncodingError::Conversion)?;
        let rc = unsafe {
            ffmpeg_next::ffi::av_frame_copy_props(state.result.as_mut_ptr(), src.as_ptr())
        };
        if rc < 0 {
            return Err(EncodingError::Conversion(ffmpeg_next::Error::from(rc)));
        }
        Ok(Converted { guard })
    }

    pub fn is_disposed(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .scaler
            .is_none()
    }

    /// Frees the scaling context and the result buffer. Further conversions
    /// fail with [`EncodingError::Disposed`].
    pub fn dispose(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.scaler.take().is_some() {
            state.result = Video::empty();
        }
    }
}

/// Borrow of a [`FrameConverter`]'s result buffer.
pub struct Converted<'a> {
    guard: MutexGuard<'a, ConverterState>,
}

impl Converted<'_> {
    pub fn frame_mut(&mut self) -> &mut Video {
        &mut self.guard.result
    }
}

impl Deref for Converted<'_> {
    type Target = Video;

    fn deref(&self) -> &Video {
        &self.guard.result
    }
}
