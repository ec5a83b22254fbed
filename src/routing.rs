//! Dispatch of dequeued buffers to the decoder or straight to a frame buffer.

use std::sync::{Arc, Weak};

use tracing::{debug, error, warn};

use crate::decoder::{DecodedBuffer, EncodedBuffer, HardwareDecoder};
use crate::error::CaptureError;
use crate::frame::FrameBuffer;
use crate::state::CaptureState;
use crate::traits::{FourCC, RawBuffer};

/// Pixel format the decoder produces.
pub const DECODE_FORMAT: FourCC = FourCC::YU12;

/// What happens to a dequeued buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Hardware acceleration on a compressed stream: decode asynchronously.
    Decode,
    /// Raw pixels: build the frame buffer from the device bytes.
    Direct,
    /// Compressed stream without hardware acceleration.
    Unsupported,
}

impl Route {
    /// Pick the route for a capture configuration.
    #[must_use]
    pub fn select(hw_accel: bool, format: FourCC) -> Self {
        match (hw_accel, format.is_compressed()) {
            (true, true) => Self::Decode,
            (_, false) => Self::Direct,
            (false, true) => Self::Unsupported,
        }
    }
}

pub(crate) struct Router {
    route: Route,
    format: FourCC,
    decoder: Option<Box<dyn HardwareDecoder>>,
    state: Arc<CaptureState>,
}

impl Router {
    pub(crate) fn new(
        hw_accel: bool,
        format: FourCC,
        decoder: Option<Box<dyn HardwareDecoder>>,
        state: Arc<CaptureState>,
    ) -> Self {
        Self {
            route: Route::select(hw_accel, format),
            format,
            decoder,
            state,
        }
    }

    /// Turn one dequeued buffer into a frame and hand it to the raw observers.
    ///
    /// Only [`Route::Unsupported`] returns an error. Frame and decode failures
    /// are logged and the buffer still counts as handled.
    pub(crate) fn route(&mut self, raw: &RawBuffer<'_>) -> Result<(), CaptureError> {
        match self.route {
            Route::Decode => self.submit(raw),
            Route::Direct => self.publish_direct(raw),
            Route::Unsupported => return Err(CaptureError::UnsupportedDecode(self.format)),
        }

        self.state.publish_raw(raw);
        Ok(())
    }

    fn submit(&mut self, raw: &RawBuffer<'_>) {
        if raw.is_keyframe() {
            self.state.latch_keyframe();
        }

        let Some(decoder) = self.decoder.as_mut() else {
            error!(sequence = raw.sequence, "no decoder for compressed buffer");
            return;
        };

        let state = Arc::downgrade(&self.state);
        let on_decoded = Box::new(move |decoded: DecodedBuffer| publish_decoded(&state, decoded));
        if let Err(err) = decoder.submit(EncodedBuffer::copy_from(raw), on_decoded) {
            warn!(%err, sequence = raw.sequence, "decoder rejected buffer");
        }
    }

    fn publish_direct(&self, raw: &RawBuffer<'_>) {
        let (width, height) = self.state.resolution();
        match FrameBuffer::from_raw(width, height, raw, self.format) {
            Ok(frame) => self.state.publish_frame(frame),
            Err(err) => warn!(%err, sequence = raw.sequence, "dropping frame"),
        }
    }
}

fn publish_decoded(state: &Weak<CaptureState>, decoded: DecodedBuffer) {
    let Some(state) = state.upgrade().filter(|state| !state.is_closing()) else {
        debug!(sequence = decoded.sequence, "decode completed after teardown");
        return;
    };

    let (width, height) = state.resolution();
    match FrameBuffer::from_decoded(width, height, decoded, DECODE_FORMAT) {
        Ok(frame) => state.publish_frame(frame),
        Err(err) => warn!(%err, "dropping decoded frame"),
    }
}
