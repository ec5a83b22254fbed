//! The background capture loop.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, info, trace, warn};

use crate::error::CaptureError;
use crate::routing::Router;
use crate::traits::{CaptureDevice, Readiness};

/// Longest a single iteration waits for a filled buffer.
pub const READY_TIMEOUT: Duration = Duration::from_millis(200);

/// Called when the capture loop hits an error it cannot continue from.
pub type FatalHandler = Arc<dyn Fn(&CaptureError) + Send + Sync>;

/// Device shared by the capture loop and the capturer's mutators.
///
/// The loop holds the lock for a whole iteration and takes it again right
/// away, so it steps aside between iterations while anyone else is waiting.
pub(crate) struct SharedDevice<D> {
    device: Mutex<D>,
    waiting: AtomicUsize,
}

impl<D> SharedDevice<D> {
    pub(crate) fn new(device: D) -> Self {
        Self {
            device: Mutex::new(device),
            waiting: AtomicUsize::new(0),
        }
    }

    /// Lock from outside the capture loop.
    pub(crate) fn lock(&self) -> MutexGuard<'_, D> {
        self.waiting.fetch_add(1, Ordering::AcqRel);
        let guard = self.device.lock().unwrap_or_else(PoisonError::into_inner);
        self.waiting.fetch_sub(1, Ordering::AcqRel);
        guard
    }

    fn lock_for_iteration(&self) -> MutexGuard<'_, D> {
        while self.waiting.load(Ordering::Acquire) > 0 {
            thread::yield_now();
        }
        self.device.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Result of one capture iteration.
#[derive(Debug)]
pub(crate) enum Iteration {
    /// The readiness wait itself failed.
    WaitFailed,
    /// No buffer became ready in time.
    TimedOut,
    /// The device refused to hand out a buffer.
    DequeueFailed,
    /// Buffer `index` was routed but could not be queued back.
    QueueFailed(usize),
    /// Buffer `index` was routed and queued back.
    Captured(usize),
    /// Routing hit an unrecoverable condition; the buffer was queued back.
    Fatal(CaptureError),
}

/// Wait for, route and re-queue one buffer.
pub(crate) fn capture_once<D: CaptureDevice + ?Sized>(
    device: &mut D,
    router: &mut Router,
) -> Iteration {
    match device.wait_ready(READY_TIMEOUT) {
        Err(err) => {
            error!(%err, "wait for capture buffer failed");
            return Iteration::WaitFailed;
        }
        Ok(Readiness::TimedOut) => {
            debug!("capture timeout");
            return Iteration::TimedOut;
        }
        Ok(Readiness::Ready) => {}
    }

    let raw = match device.dequeue() {
        Ok(raw) => raw,
        Err(err) => {
            warn!(%err, "dequeue failed");
            return Iteration::DequeueFailed;
        }
    };
    let index = raw.index;
    let routed = router.route(&raw);

    if let Err(err) = device.queue(index) {
        warn!(%err, index, "re-queue failed");
        return match routed {
            Err(fatal) => Iteration::Fatal(fatal),
            Ok(()) => Iteration::QueueFailed(index),
        };
    }

    match routed {
        Err(fatal) => Iteration::Fatal(fatal),
        Ok(()) => Iteration::Captured(index),
    }
}

/// Owns the capture loop thread.
///
/// Dropping the worker asks the loop to stop after its current iteration and
/// joins the thread.
pub(crate) struct CaptureWorker {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl CaptureWorker {
    pub(crate) fn spawn<D: CaptureDevice + 'static>(
        device: Arc<SharedDevice<D>>,
        mut router: Router,
        on_fatal: FatalHandler,
    ) -> io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let stopped = Arc::clone(&stop);

        let handle = thread::Builder::new()
            .name("v4l2-capture".to_owned())
            .spawn(move || {
                info!("capture loop started");
                while !stopped.load(Ordering::Acquire) {
                    let outcome = {
                        let mut device = device.lock_for_iteration();
                        capture_once(&mut *device, &mut router)
                    };
                    match outcome {
                        Iteration::Fatal(err) => {
                            error!(%err, "capture loop cannot continue");
                            on_fatal(&err);
                            break;
                        }
                        Iteration::Captured(index) => trace!(index, "buffer captured"),
                        Iteration::QueueFailed(index) => {
                            debug!(index, "buffer stays with the application");
                        }
                        Iteration::WaitFailed | Iteration::TimedOut | Iteration::DequeueFailed => {}
                    }
                }
                // The router owns the decoder; dropping it here drains pending decodes.
                drop(router);
                info!("capture loop stopped");
            })?;

        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    pub(crate) fn is_running(&self) -> bool {
        self.handle
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }
}

impl Drop for CaptureWorker {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("capture loop panicked");
            }
        }
    }
}
