//! Encoder lookup and pixel format negotiation.

use ffmpeg_next::Codec;
use ffmpeg_next::format::Pixel;

use crate::error::{EncodingError, Result};

/// A resolved encoder and the pixel formats it accepts.
#[derive(Clone)]
pub struct CodecCapabilities {
    name: String,
    codec: Codec,
    formats: Vec<Pixel>,
}

impl CodecCapabilities {
    pub fn find(name: &str) -> Result<Self> {
        let codec = ffmpeg_next::encoder::find_by_name(name)
            .ok_or_else(|| EncodingError::CodecNotFound(name.to_string()))?;
        let formats: Vec<Pixel> = codec
            .video()
            .map_err(|_| EncodingError::CodecNotFound(name.to_string()))?
            .formats()
            .map(|it| it.collect())
            .unwrap_or_default();
        if formats.is_empty() {
            return Err(EncodingError::NoPixelFormats(name.to_string()));
        }

        Ok(Self {
            name: name.to_string(),
            codec,
            formats,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn codec(&self) -> Codec {
        self.codec
    }

    pub fn formats(&self) -> &[Pixel] {
        &self.formats
    }

    pub fn is_format_supported(&self, format: Pixel) -> bool {
        self.formats.contains(&format)
    }

    /// The supported format that loses the least information when
    /// converting from `source`.
    pub fn best_format_for(&self, source: Pixel) -> Pixel {
        let mut list: Vec<ffmpeg_next::ffi::AVPixelFormat> =
            self.formats.iter().map(|&f| f.into()).collect();
        list.push(ffmpeg_next::ffi::AVPixelFormat::AV_PIX_FMT_NONE);

        let best = unsafe {
            ffmpeg_next::ffi::avcodec_find_best_pix_fmt_of_list(
                list.as_ptr(),
                source.into(),
                0,
                std::ptr::null_mut(),
            )
        };
        match Pixel::from(best) {
            Pixel::None => self.formats[0],
            best => best,
        }
    }

    /// The format frames must be in when handed to the encoder, or `None`
    /// when `source` can be encoded as is.
    pub fn conversion_target(&self, source: Pixel) -> Option<Pixel> {
        if self.is_format_supported(source) {
            None
        } else {
            Some(self.best_format_for(source))
        }
    }
}

unsafe impl Send for CodecCapabilities {}
unsafe impl Sync for CodecCapabilities {}
