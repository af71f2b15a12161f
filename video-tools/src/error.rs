use crate::frame::FrameGeometry;

/// Steps of encoder construction that can fail with a native status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitStage {
    AllocContext,
    SetOption(&'static str),
    Open,
    Converter,
}

impl std::fmt::Display for InitStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InitStage::AllocContext => write!(f, "allocate codec context"),
            InitStage::SetOption(name) => write!(f, "set option '{}'", name),
            InitStage::Open => write!(f, "open codec"),
            InitStage::Converter => write!(f, "initialize the conversion context"),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum EncodingError {
    #[error("codec '{0}' not found")]
    CodecNotFound(String),
    #[error("codec '{0}' does not advertise any pixel format")]
    NoPixelFormats(String),
    #[error("can't {stage}: {source} (code {code})")]
    EncoderInit {
        stage: InitStage,
        code: i32,
        source: ffmpeg_next::Error,
    },
    #[error("error during encoding: {source} (code {code})")]
    Encode {
        code: i32,
        source: ffmpeg_next::Error,
    },
    #[error("could not scale the frame: {0}")]
    Conversion(#[source] ffmpeg_next::Error),
    #[error("can't copy frame: {source} (code {code})")]
    FrameCopy {
        code: i32,
        source: ffmpeg_next::Error,
    },
    #[error("frame {actual} does not match pipeline geometry {expected}")]
    GeometryMismatch {
        expected: FrameGeometry,
        actual: FrameGeometry,
    },
    #[error("{0} is disposed")]
    Disposed(&'static str),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl EncodingError {
    pub(crate) fn init(stage: InitStage, source: ffmpeg_next::Error) -> Self {
        EncodingError::EncoderInit {
            stage,
            code: i32::from(source),
            source,
        }
    }

    pub(crate) fn encode(source: ffmpeg_next::Error) -> Self {
        EncodingError::Encode {
            code: i32::from(source),
            source,
        }
    }

    pub(crate) fn frame_copy(code: i32) -> Self {
        EncodingError::FrameCopy {
            code,
            source: ffmpeg_next::Error::from(code),
        }
    }

    /// Errors raised while building a pipeline. They end the worker that hit
    /// them; every other error only costs the frame being processed.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EncodingError::CodecNotFound(_)
                | EncodingError::NoPixelFormats(_)
                | EncodingError::EncoderInit { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, EncodingError>;
