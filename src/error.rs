//! Error types for capture operations.

use std::fmt;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::decoder::DecoderError;
use crate::frame::FrameError;
use crate::traits::FourCC;

/// Device setup step that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupStage {
    /// Setting width, height and pixel format.
    Format,
    /// Setting the frame rate.
    Fps,
    /// Requesting and mapping the buffer set.
    Allocate,
    /// Handing the buffer set to the device.
    Queue,
    /// Turning the stream on.
    StreamOn,
    /// Creating the hardware decoder.
    Decoder,
    /// Spawning the capture loop thread.
    Worker,
}

impl fmt::Display for SetupStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stage = match self {
            Self::Format => "set format",
            Self::Fps => "set fps",
            Self::Allocate => "allocate buffers",
            Self::Queue => "queue buffers",
            Self::StreamOn => "stream on",
            Self::Decoder => "create decoder",
            Self::Worker => "start capture loop",
        };
        f.write_str(stage)
    }
}

/// Error type for capture operations.
#[derive(Debug, Error)]
pub enum CaptureError {
    /// The device node could not be opened or queried.
    #[error("failed to open {}: {source}", path.display())]
    DeviceOpen {
        /// Device node path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// A structural setup step failed; the device is unusable.
    #[error("device setup failed ({stage}): {source}")]
    Setup {
        /// The step that failed.
        stage: SetupStage,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// Compressed frames arrived with hardware acceleration disabled.
    #[error("software decoding of {0} camera source is not supported")]
    UnsupportedDecode(FourCC),

    /// A frame buffer could not be built or converted.
    #[error(transparent)]
    Frame(#[from] FrameError),

    /// The decoder rejected a request.
    #[error(transparent)]
    Decoder(#[from] DecoderError),

    /// No frame has been captured yet.
    #[error("no frame captured yet")]
    NoFrame,
}

impl CaptureError {
    pub(crate) fn setup(stage: SetupStage) -> impl FnOnce(io::Error) -> Self {
        move |source| Self::Setup { stage, source }
    }

    /// Whether the error leaves the capturer unusable.
    ///
    /// Fatal errors are the ones the capture front end answers with process
    /// termination by default.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::DeviceOpen { .. } | Self::Setup { .. } | Self::UnsupportedDecode(_)
        )
    }
}

/// Result type for capture operations.
pub type Result<T> = std::result::Result<T, CaptureError>;
