use std::fmt::{Display, Formatter};

use ffmpeg_next::format::Pixel;
use ffmpeg_next::frame::Video;

use crate::error::{EncodingError, Result};

/// The parts of a frame a pipeline is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameGeometry {
    pub width: u32,
    pub height: u32,
    pub format: Pixel,
}

impl FrameGeometry {
    pub fn new(width: u32, height: u32, format: Pixel) -> Self {
        Self {
            width,
            height,
            format,
        }
    }

    pub fn of(frame: &Video) -> Self {
        Self {
            width: frame.width(),
            height: frame.height(),
            format: frame.format(),
        }
    }

    pub fn matches(&self, frame: &Video) -> bool {
        *self == Self::of(frame)
    }

    /// Allocates a frame with a fresh, 32-byte aligned buffer of this geometry.
    pub fn alloc(&self) -> Result<Video> {
        if self.width == 0 || self.height == 0 {
            return Err(EncodingError::InvalidArgument(format!(
                "invalid video size {}x{}",
                self.width, self.height
            )));
        }
        if self.format == Pixel::None {
            return Err(EncodingError::InvalidArgument(
                "invalid pixel format for video frame".to_string(),
            ));
        }
        Ok(Video::new(self.format, self.width, self.height))
    }
}

impl Display for FrameGeometry {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{} {:?}", self.width, self.height, self.format)
    }
}

/// Deep-copies pixel data and properties (pts, flags, side data) from `src`
/// into `dst`. Both frames must share the same geometry.
pub fn copy_frame(src: &Video, dst: &mut Video) -> Result<()> {
    let rc = unsafe { ffmpeg_next::ffi::av_frame_copy(dst.as_mut_ptr(), src.as_ptr()) };
    if rc < 0 {
        return Err(EncodingError::frame_copy(rc));
    }
    let rc = unsafe { ffmpeg_next::ffi::av_frame_copy_props(dst.as_mut_ptr(), src.as_ptr()) };
    if rc < 0 {
        return Err(EncodingError::frame_copy(rc));
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod test_util {
    use super::*;

    /// A frame of the given geometry filled with a gradient that depends on `seed`.
    pub fn pattern_frame(width: u32, height: u32, format: Pixel, seed: u8) -> Video {
        let mut frame = Video::new(format, width, height);
        for plane in 0..frame.planes() {
            for (i, b) in frame.data_mut(plane).iter_mut().enumerate() {
                *b = (i as u8).wrapping_add(seed);
            }
        }
        frame
    }
}

#[cfg(test)]
mod tests {
    use super::test_util::pattern_frame;
    use super::*;

    #[test]
    fn test_geometry_of_frame() {
        let frame = Video::new(Pixel::YUV420P, 64, 48);
        let geometry = FrameGeometry::of(&frame);
        assert_eq!(geometry, FrameGeometry::new(64, 48, Pixel::YUV420P));
        assert!(geometry.matches(&frame));
        assert!(!FrameGeometry::new(32, 48, Pixel::YUV420P).matches(&frame));
        assert_eq!(geometry.to_string(), "64x48 YUV420P");
    }

    #[test]
    fn test_alloc_rejects_empty_geometry() {
        assert!(FrameGeometry::new(0, 48, Pixel::YUV420P).alloc().is_err());
        assert!(FrameGeometry::new(64, 48, Pixel::None).alloc().is_err());
        let frame = FrameGeometry::new(64, 48, Pixel::RGB24).alloc().unwrap();
        assert_eq!(frame.format(), Pixel::RGB24);
    }

    #[test]
    fn test_copy_frame_copies_data_and_pts() -> anyhow::Result<()> {
        let mut src = pattern_frame(64, 48, Pixel::YUV420P, 7);
        src.set_pts(Some(1234));
        let mut dst = FrameGeometry::of(&src).alloc()?;
        copy_frame(&src, &mut dst)?;
        assert_eq!(dst.pts(), Some(1234));
        // Only the visible part of each luma row is copied; padding may differ.
        let width = src.width() as usize;
        for row in 0..src.height() as usize {
            let s = &src.data(0)[row * src.stride(0)..][..width];
            let d = &dst.data(0)[row * dst.stride(0)..][..width];
            assert_eq!(s, d, "row {row}");
        }
        Ok(())
    }

    #[test]
    fn test_copy_frame_rejects_mismatched_buffer() {
        let src = pattern_frame(64, 48, Pixel::YUV420P, 0);
        let mut dst = Video::new(Pixel::YUV420P, 32, 24);
        let err = copy_frame(&src, &mut dst).unwrap_err();
        assert!(matches!(err, EncodingError::FrameCopy { code, .. } if code < 0));
    }
}
