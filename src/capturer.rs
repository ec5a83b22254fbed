//! The capturer: device configuration, capture start and teardown.
//!
//! A [`Capturer`] owns one opened device. Construction runs the fixed setup
//! sequence (encode controls for H.264 sources, frame rate, rotation,
//! resolution, bitrate override) and starts the background capture loop.
//! Frames end up in a single shared slot read by [`Capturer::get_i420_frame`]
//! and are pushed to any registered observers.
//!
//! Setup failures are returned as [`CaptureError::Setup`]; the caller decides
//! whether to exit. Once capture runs, the only unrecoverable condition is a
//! compressed stream without hardware acceleration, which goes to the fatal
//! handler.

use std::path::PathBuf;
use std::sync::{Arc, MutexGuard};

use tracing::{debug, error, info, warn};

use crate::controls::{BITRATE_OVERRIDE, CID_ROTATE, H264_ENCODE_CONTROLS};
use crate::decoder::{DecoderFactory, DefaultDecoderFactory};
use crate::device::{device_path, V4L2Device};
use crate::error::{CaptureError, Result, SetupStage};
use crate::frame::{FrameBuffer, I420Buffer};
use crate::routing::{Router, DECODE_FORMAT};
use crate::state::{CaptureState, FrameObserver, RawObserver};
use crate::traits::{CaptureDevice, DeviceEnumerator, Format, FourCC, RawBuffer};
use crate::worker::{CaptureWorker, FatalHandler, SharedDevice};

/// Number of buffers in the mmap buffer set.
pub const BUFFER_COUNT: u32 = 3;

/// Capture configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapturerConfig {
    /// Camera number; the device node is `/dev/video<camera_id>`.
    pub camera_id: u32,
    /// Requested frame width.
    pub width: u32,
    /// Requested frame height.
    pub height: u32,
    /// Requested frame rate.
    pub fps: u32,
    /// Rotation in degrees.
    pub rotation: i32,
    /// Pixel format the device should deliver. Compressed formats need
    /// `hw_accel`.
    pub format: FourCC,
    /// Decode compressed streams with a hardware decoder.
    pub hw_accel: bool,
}

impl Default for CapturerConfig {
    fn default() -> Self {
        Self {
            camera_id: 0,
            width: 640,
            height: 480,
            fps: 30,
            rotation: 0,
            format: FourCC::YUYV,
            hw_accel: false,
        }
    }
}

impl CapturerConfig {
    /// Device node for this configuration.
    #[must_use]
    pub fn device_path(&self) -> PathBuf {
        device_path(self.camera_id)
    }
}

/// Logs the error and exits the process with status 1.
fn exit_on_fatal(err: &CaptureError) {
    error!(%err, "fatal capture error, exiting");
    std::process::exit(1);
}

/// Collects everything a [`Capturer`] needs before the device is touched.
pub struct CapturerBuilder {
    config: CapturerConfig,
    decoders: Arc<dyn DecoderFactory>,
    frame_observers: Vec<FrameObserver>,
    raw_observers: Vec<RawObserver>,
    on_fatal: FatalHandler,
}

impl CapturerBuilder {
    /// Start from `config` with the built-in decoders and the exiting fatal
    /// handler.
    #[must_use]
    pub fn new(config: CapturerConfig) -> Self {
        Self {
            config,
            decoders: Arc::new(DefaultDecoderFactory),
            frame_observers: Vec::new(),
            raw_observers: Vec::new(),
            on_fatal: Arc::new(exit_on_fatal),
        }
    }

    /// Use `factory` to create the decoder for accelerated compressed capture.
    #[must_use]
    pub fn decoders(mut self, factory: Arc<dyn DecoderFactory>) -> Self {
        self.decoders = factory;
        self
    }

    /// Observe every published frame buffer.
    #[must_use]
    pub fn on_frame<F>(mut self, observer: F) -> Self
    where
        F: Fn(&Arc<FrameBuffer>) + Send + Sync + 'static,
    {
        self.frame_observers.push(Box::new(observer));
        self
    }

    /// Observe every dequeued device buffer before it is queued back.
    #[must_use]
    pub fn on_raw<F>(mut self, observer: F) -> Self
    where
        F: Fn(&RawBuffer<'_>) + Send + Sync + 'static,
    {
        self.raw_observers.push(Box::new(observer));
        self
    }

    /// Replace the fatal handler run when the capture loop cannot continue.
    #[must_use]
    pub fn on_fatal<F>(mut self, handler: F) -> Self
    where
        F: Fn(&CaptureError) + Send + Sync + 'static,
    {
        self.on_fatal = Arc::new(handler);
        self
    }

    /// Open the configured V4L2 device and start capturing.
    pub fn open(self) -> Result<Capturer<V4L2Device>> {
        let device = V4L2Device::open(self.config.camera_id)?;
        self.build_with(device)
    }

    /// Configure `device` and start capturing.
    pub fn build_with<D: CaptureDevice + 'static>(self, device: D) -> Result<Capturer<D>> {
        let config = self.config;
        let state = Arc::new(CaptureState::new(config.width, config.height));
        for observer in self.frame_observers {
            state.add_frame_observer(observer);
        }
        for observer in self.raw_observers {
            state.add_raw_observer(observer);
        }

        let mut capturer = Capturer {
            device: Arc::new(SharedDevice::new(device)),
            state,
            config,
            fps: config.fps,
            format: config.format,
            decoders: self.decoders,
            on_fatal: self.on_fatal,
            worker: None,
            allocated: false,
            streaming: false,
        };

        info!(
            camera = config.camera_id,
            width = config.width,
            height = config.height,
            fps = config.fps,
            format = %config.format,
            hw_accel = config.hw_accel,
            "configuring capturer"
        );

        if config.format == FourCC::H264 {
            for control in &H264_ENCODE_CONTROLS {
                debug!(control = control.name, value = control.value, "encode control");
                capturer.set_controls(control.id, control.value);
            }
        }

        capturer
            .set_fps(config.fps)?
            .set_rotation(config.rotation)
            .set_resolution(config.width, config.height)?
            .set_controls(BITRATE_OVERRIDE.id, BITRATE_OVERRIDE.value)
            .start_capture()?;

        Ok(capturer)
    }
}

/// Owns one capture device and its capture loop.
///
/// Dropping the capturer stops and joins the loop before the stream is
/// turned off and the buffers are released.
pub struct Capturer<D: CaptureDevice + 'static = V4L2Device> {
    device: Arc<SharedDevice<D>>,
    state: Arc<CaptureState>,
    config: CapturerConfig,
    fps: u32,
    format: FourCC,
    decoders: Arc<dyn DecoderFactory>,
    on_fatal: FatalHandler,
    worker: Option<CaptureWorker>,
    allocated: bool,
    streaming: bool,
}

impl Capturer<V4L2Device> {
    /// Open `/dev/video<camera_id>` and start capturing with the default
    /// decoders and fatal handler.
    pub fn create(config: CapturerConfig) -> Result<Self> {
        CapturerBuilder::new(config).open()
    }
}

impl<D: CaptureDevice + 'static> Capturer<D> {
    fn device(&self) -> MutexGuard<'_, D> {
        self.device.lock()
    }

    /// Store the resolution and request the matching device format.
    pub fn set_resolution(&mut self, width: u32, height: u32) -> Result<&mut Self> {
        info!(width, height, "resolution");
        self.state.set_resolution(width, height);

        let requested = Format::new(width, height, self.format);
        let actual = self
            .device()
            .set_format(&requested)
            .map_err(CaptureError::setup(SetupStage::Format))?;
        if actual.fourcc != self.format {
            return Err(CaptureError::Setup {
                stage: SetupStage::Format,
                source: std::io::Error::new(
                    std::io::ErrorKind::Unsupported,
                    format!("driver delivers {} instead of {}", actual.fourcc, self.format),
                ),
            });
        }
        if actual.width != width || actual.height != height {
            warn!(
                width = actual.width,
                height = actual.height,
                "driver adjusted the requested resolution"
            );
        }
        Ok(self)
    }

    /// Store the frame rate and apply it to the device.
    pub fn set_fps(&mut self, fps: u32) -> Result<&mut Self> {
        self.fps = fps;
        let actual = self
            .device()
            .set_fps(fps)
            .map_err(CaptureError::setup(SetupStage::Fps))?;
        info!(fps, actual, "frame rate");
        Ok(self)
    }

    /// Apply a rotation in degrees. Failures are logged.
    pub fn set_rotation(&mut self, angle: i32) -> &mut Self {
        debug!(angle, "rotation");
        if let Err(err) = self.device().set_control(CID_ROTATE, i64::from(angle)) {
            warn!(%err, angle, "rotation not applied");
        }
        self
    }

    /// Write one device control. Failures are logged.
    pub fn set_controls(&mut self, id: u32, value: i64) -> &mut Self {
        if let Err(err) = self.device().set_control(id, value) {
            warn!(%err, id = format_args!("{id:#010x}"), value, "control not applied");
        }
        self
    }

    /// Allocate and queue the buffer set, start streaming, create the decoder
    /// when capture is accelerated and compressed, then start the capture
    /// loop. Does nothing if the loop already runs.
    pub fn start_capture(&mut self) -> Result<&mut Self> {
        if self.worker.is_some() {
            warn!("capture already started");
            return Ok(self);
        }

        {
            let mut device = self.device.lock();
            let granted = device
                .allocate_buffers(BUFFER_COUNT)
                .map_err(CaptureError::setup(SetupStage::Allocate))?;
            self.allocated = true;
            device
                .queue_buffers()
                .map_err(CaptureError::setup(SetupStage::Queue))?;
            device
                .stream_on()
                .map_err(CaptureError::setup(SetupStage::StreamOn))?;
            self.streaming = true;
            debug!(buffers = granted, "streaming");
        }

        let decoder = if self.is_dma_capture() {
            let (width, height) = self.state.resolution();
            let decoder = self
                .decoders
                .create(width, height, self.format, self.config.hw_accel)
                .map_err(|err| CaptureError::Setup {
                    stage: SetupStage::Decoder,
                    source: std::io::Error::other(err),
                })?;
            info!(width, height, source = %self.format, output = %DECODE_FORMAT, "decoder ready");
            Some(decoder)
        } else {
            None
        };

        let router = Router::new(
            self.config.hw_accel,
            self.format,
            decoder,
            Arc::clone(&self.state),
        );
        let worker = CaptureWorker::spawn(
            Arc::clone(&self.device),
            router,
            Arc::clone(&self.on_fatal),
        )
        .map_err(CaptureError::setup(SetupStage::Worker))?;
        self.worker = Some(worker);
        Ok(self)
    }

    /// The current frame converted to I420.
    pub fn get_i420_frame(&self) -> Result<I420Buffer> {
        let frame = self.state.current().ok_or(CaptureError::NoFrame)?;
        Ok(frame.to_i420()?)
    }

    /// The current frame as published.
    #[must_use]
    pub fn current_frame(&self) -> Option<Arc<FrameBuffer>> {
        self.state.current()
    }

    /// Whether the device's bus info equals `unique_name`. An empty bus info
    /// never matches.
    #[must_use]
    pub fn check_matching_device(&self, unique_name: &str) -> bool {
        match self.device().capabilities() {
            Ok(caps) => caps.matches_bus(unique_name),
            Err(err) => {
                warn!(%err, "capability query failed");
                false
            }
        }
    }

    /// Index of the first enumerated device that is this capturer's device.
    pub fn get_camera_index<E: DeviceEnumerator + ?Sized>(&self, devices: &E) -> Option<usize> {
        (0..devices.device_count()).find(|&index| {
            devices.device_info(index).is_some_and(|info| {
                let matched = self.check_matching_device(&info.unique_name);
                if matched {
                    debug!(index, name = %info.name, unique_name = %info.unique_name, "matched device");
                }
                matched
            })
        })
    }

    /// Register a frame observer on a running capturer.
    pub fn on_frame<F>(&self, observer: F)
    where
        F: Fn(&Arc<FrameBuffer>) + Send + Sync + 'static,
    {
        self.state.add_frame_observer(Box::new(observer));
    }

    /// Register a raw buffer observer on a running capturer.
    pub fn on_raw<F>(&self, observer: F)
    where
        F: Fn(&RawBuffer<'_>) + Send + Sync + 'static,
    {
        self.state.add_raw_observer(Box::new(observer));
    }

    /// Last requested frame rate.
    #[must_use]
    pub const fn fps(&self) -> u32 {
        self.fps
    }

    /// Last requested width.
    #[must_use]
    pub fn width(&self) -> u32 {
        self.state.resolution().0
    }

    /// Last requested height.
    #[must_use]
    pub fn height(&self) -> u32 {
        self.state.resolution().1
    }

    /// Pixel format delivered by the device.
    #[must_use]
    pub const fn format(&self) -> FourCC {
        self.format
    }

    /// Whether compressed buffers go to the hardware decoder.
    #[must_use]
    pub fn is_dma_capture(&self) -> bool {
        self.config.hw_accel && self.format.is_compressed()
    }

    /// The configuration the capturer was built with.
    #[must_use]
    pub const fn config(&self) -> &CapturerConfig {
        &self.config
    }

    /// Whether a keyframe has reached the decoder.
    #[must_use]
    pub fn has_first_keyframe(&self) -> bool {
        self.state.has_first_keyframe()
    }

    /// Whether the capture loop is still running.
    #[must_use]
    pub fn is_capturing(&self) -> bool {
        self.worker.as_ref().is_some_and(CaptureWorker::is_running)
    }
}

impl<D: CaptureDevice + 'static> Drop for Capturer<D> {
    fn drop(&mut self) {
        self.state.close();
        // Joins the loop; the decoder is dropped with the router on that thread.
        drop(self.worker.take());

        let mut device = self.device.lock();
        if self.streaming {
            if let Err(err) = device.stream_off() {
                warn!(%err, "stream off failed");
            }
        }
        if self.allocated {
            if let Err(err) = device.deallocate_buffers() {
                warn!(%err, "buffer release failed");
            }
        }
        info!("capturer closed");
    }
}
