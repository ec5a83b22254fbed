//! Asynchronous decoding of compressed camera buffers.
//!
//! The capture loop never waits for a decode. Buffers are copied out of the
//! device mapping into an [`EncodedBuffer`], submitted with a completion
//! callback, and decoded on the decoder's own thread. Completions run on that
//! thread in submission order.

use std::io;
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

use crate::frame::I420Buffer;
use crate::traits::{FourCC, RawBuffer, BUF_FLAG_KEYFRAME};

/// Error type for decoder operations.
#[derive(Debug, Error)]
pub enum DecoderError {
    /// No decoder backend exists for the source format.
    #[error("no decoder available for {0}")]
    Unavailable(FourCC),

    /// The decoder thread is gone.
    #[error("decoder has shut down")]
    Closed,

    /// One buffer could not be decoded.
    #[error("failed to decode frame {sequence}: {reason}")]
    DecodeFailed {
        /// Sequence number of the failing buffer.
        sequence: u32,
        /// Backend diagnostic.
        reason: String,
    },

    /// The decoder thread could not be started.
    #[error("failed to start decoder thread: {0}")]
    Spawn(#[source] io::Error),
}

/// A compressed buffer copied out of device memory.
#[derive(Debug, Clone)]
pub struct EncodedBuffer {
    /// Compressed payload.
    pub data: Bytes,
    /// Raw `V4L2_BUF_FLAG_*` bits of the source buffer.
    pub flags: u32,
    /// Driver capture timestamp.
    pub timestamp: Duration,
    /// Driver frame sequence number.
    pub sequence: u32,
}

impl EncodedBuffer {
    /// Copy a dequeued buffer so it can outlive its re-queue.
    #[must_use]
    pub fn copy_from(raw: &RawBuffer<'_>) -> Self {
        Self {
            data: Bytes::copy_from_slice(raw.data),
            flags: raw.flags,
            timestamp: raw.timestamp,
            sequence: raw.sequence,
        }
    }

    /// Whether the source buffer was flagged as a keyframe.
    #[must_use]
    pub const fn is_keyframe(&self) -> bool {
        self.flags & BUF_FLAG_KEYFRAME != 0
    }
}

/// A decoder's output, owned by whoever receives it.
#[derive(Debug, Clone)]
pub struct DecodedBuffer {
    /// Decoded pixels in the decoder's target format.
    pub data: Bytes,
    /// Capture timestamp carried over from the encoded buffer.
    pub timestamp: Duration,
    /// Sequence number carried over from the encoded buffer.
    pub sequence: u32,
}

/// Completion callback for one submitted buffer.
pub type DecodeCallback = Box<dyn FnOnce(DecodedBuffer) + Send>;

/// A decoder accepting buffers asynchronously.
pub trait HardwareDecoder: Send {
    /// Queue `encoded` for decoding. `on_decoded` runs later, possibly on
    /// another thread, once a picture comes out.
    fn submit(&mut self, encoded: EncodedBuffer, on_decoded: DecodeCallback)
        -> Result<(), DecoderError>;
}

/// Constructs decoders for a capture configuration.
pub trait DecoderFactory: Send + Sync {
    /// Create a decoder for `width` x `height` frames in `source` format.
    fn create(
        &self,
        width: u32,
        height: u32,
        source: FourCC,
        use_hardware: bool,
    ) -> Result<Box<dyn HardwareDecoder>, DecoderError>;
}

/// Synchronous decoding step run on a [`ThreadedDecoder`]'s thread.
pub trait DecodeBackend: Send + 'static {
    /// Decode one buffer. `Ok(None)` means the backend needs more input
    /// before it can emit a picture.
    fn decode(&mut self, encoded: &EncodedBuffer) -> Result<Option<DecodedBuffer>, DecoderError>;
}

struct Job {
    encoded: EncodedBuffer,
    on_decoded: DecodeCallback,
}

/// Runs a [`DecodeBackend`] on a dedicated thread fed by a FIFO channel.
pub struct ThreadedDecoder {
    jobs: Option<mpsc::Sender<Job>>,
    handle: Option<JoinHandle<()>>,
}

impl ThreadedDecoder {
    /// Start the decoder thread.
    pub fn spawn<B: DecodeBackend>(name: &str, mut backend: B) -> Result<Self, DecoderError> {
        let (jobs, queue) = mpsc::channel::<Job>();
        let handle = thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || {
                for job in queue {
                    match backend.decode(&job.encoded) {
                        Ok(Some(decoded)) => (job.on_decoded)(decoded),
                        Ok(None) => trace!(sequence = job.encoded.sequence, "decoder needs more input"),
                        Err(err) => warn!(%err, "decode failed"),
                    }
                }
                debug!("decoder thread exited");
            })
            .map_err(DecoderError::Spawn)?;

        Ok(Self {
            jobs: Some(jobs),
            handle: Some(handle),
        })
    }
}

impl HardwareDecoder for ThreadedDecoder {
    fn submit(
        &mut self,
        encoded: EncodedBuffer,
        on_decoded: DecodeCallback,
    ) -> Result<(), DecoderError> {
        let jobs = self.jobs.as_ref().ok_or(DecoderError::Closed)?;
        jobs.send(Job {
            encoded,
            on_decoded,
        })
        .map_err(|_| DecoderError::Closed)
    }
}

impl Drop for ThreadedDecoder {
    fn drop(&mut self) {
        // Closing the channel lets the thread drain what was already submitted.
        drop(self.jobs.take());
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("decoder thread panicked");
            }
        }
    }
}

/// Decodes Motion JPEG into `YU12`.
pub struct MjpegBackend {
    width: u32,
    height: u32,
}

impl MjpegBackend {
    /// Backend expecting `width` x `height` pictures.
    #[must_use]
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl DecodeBackend for MjpegBackend {
    fn decode(&mut self, encoded: &EncodedBuffer) -> Result<Option<DecodedBuffer>, DecoderError> {
        let failed = |reason: String| DecoderError::DecodeFailed {
            sequence: encoded.sequence,
            reason,
        };

        let image = image::load_from_memory_with_format(&encoded.data, image::ImageFormat::Jpeg)
            .map_err(|err| failed(err.to_string()))?
            .to_rgb8();
        let (width, height) = image.dimensions();
        if (width, height) != (self.width, self.height) {
            return Err(failed(format!(
                "decoded {width}x{height}, expected {}x{}",
                self.width, self.height
            )));
        }

        let i420 = I420Buffer::from_rgb24(width, height, image.as_raw())
            .map_err(|err| failed(err.to_string()))?;

        Ok(Some(DecodedBuffer {
            data: Bytes::from(i420.into_bytes()),
            timestamp: encoded.timestamp,
            sequence: encoded.sequence,
        }))
    }
}

/// Decoder factory backed by the backends in this crate.
///
/// Motion JPEG decodes on a [`ThreadedDecoder`]; other formats have no
/// backend here and report [`DecoderError::Unavailable`].
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultDecoderFactory;

impl DecoderFactory for DefaultDecoderFactory {
    fn create(
        &self,
        width: u32,
        height: u32,
        source: FourCC,
        use_hardware: bool,
    ) -> Result<Box<dyn HardwareDecoder>, DecoderError> {
        match source {
            FourCC::MJPG => {
                info!(width, height, use_hardware, "starting MJPEG decoder");
                let decoder = ThreadedDecoder::spawn("mjpeg-decoder", MjpegBackend::new(width, height))?;
                Ok(Box::new(decoder))
            }
            other => Err(DecoderError::Unavailable(other)),
        }
    }
}
