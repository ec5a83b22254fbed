//! State shared between the capturer, its capture loop and decoder callbacks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tracing::info;

use crate::frame::FrameBuffer;
use crate::traits::RawBuffer;

/// Observer of finished frame buffers.
pub type FrameObserver = Box<dyn Fn(&Arc<FrameBuffer>) + Send + Sync>;

/// Observer of untouched device buffers.
///
/// The buffer is only valid for the duration of the call.
pub type RawObserver = Box<dyn Fn(&RawBuffer<'_>) + Send + Sync>;

#[derive(Default)]
pub(crate) struct CaptureState {
    current: Mutex<Option<Arc<FrameBuffer>>>,
    frame_observers: RwLock<Vec<FrameObserver>>,
    raw_observers: RwLock<Vec<RawObserver>>,
    resolution: RwLock<(u32, u32)>,
    has_first_keyframe: AtomicBool,
    closing: AtomicBool,
}

impl CaptureState {
    pub(crate) fn new(width: u32, height: u32) -> Self {
        Self {
            resolution: RwLock::new((width, height)),
            ..Self::default()
        }
    }

    pub(crate) fn resolution(&self) -> (u32, u32) {
        *self.resolution.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn set_resolution(&self, width: u32, height: u32) {
        *self.resolution.write().unwrap_or_else(PoisonError::into_inner) = (width, height);
    }

    pub(crate) fn current(&self) -> Option<Arc<FrameBuffer>> {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the current frame and notify frame observers.
    pub(crate) fn publish_frame(&self, frame: FrameBuffer) {
        let frame = Arc::new(frame);
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&frame));

        let observers = self
            .frame_observers
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        for observer in observers.iter() {
            observer(&frame);
        }
    }

    pub(crate) fn publish_raw(&self, raw: &RawBuffer<'_>) {
        let observers = self
            .raw_observers
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        for observer in observers.iter() {
            observer(raw);
        }
    }

    pub(crate) fn add_frame_observer(&self, observer: FrameObserver) {
        self.frame_observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(observer);
    }

    pub(crate) fn add_raw_observer(&self, observer: RawObserver) {
        self.raw_observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(observer);
    }

    pub(crate) fn has_first_keyframe(&self) -> bool {
        self.has_first_keyframe.load(Ordering::Acquire)
    }

    /// Latch the first-keyframe flag. Returns `true` only for the call that
    /// flipped it.
    pub(crate) fn latch_keyframe(&self) -> bool {
        let first = !self.has_first_keyframe.swap(true, Ordering::AcqRel);
        if first {
            info!("first keyframe received");
        }
        first
    }

    pub(crate) fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    pub(crate) fn close(&self) {
        self.closing.store(true, Ordering::Release);
    }
}
