//! V4L2 device implementation using the v4l crate.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, warn};
use v4l::control::{Control, Value};
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::Device;

use crate::error::{CaptureError, Result};
use crate::mmap::{self, MmapBuffers};
use crate::traits::{
    CaptureDevice, DeviceCapabilities, DeviceEnumerator, DeviceInfo, Format, FourCC, RawBuffer,
    Readiness,
};

/// Prefix of capture device nodes; device `N` lives at `/dev/videoN`.
pub const DEVICE_PATH_PREFIX: &str = "/dev/video";

/// Path of the device node for camera `id`.
#[must_use]
pub fn device_path(id: u32) -> PathBuf {
    PathBuf::from(format!("{DEVICE_PATH_PREFIX}{id}"))
}

/// V4L2 device implementation wrapping the v4l crate.
pub struct V4L2Device {
    buffers: Option<MmapBuffers>,
    device: Device,
    path: PathBuf,
}

impl V4L2Device {
    /// Open a V4L2 device by index (e.g., 0 for /dev/video0).
    pub fn open(index: u32) -> Result<Self> {
        Self::with_path(device_path(index))
    }

    /// Open a V4L2 device node.
    pub fn with_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let open_failed = |source| CaptureError::DeviceOpen {
            path: path.clone(),
            source,
        };

        let device = Device::with_path(&path).map_err(open_failed)?;
        let caps = device.query_caps().map_err(open_failed)?;
        debug!(path = %path.display(), card = %caps.card, driver = %caps.driver, "opened device");
        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            warn!(path = %path.display(), "device does not report video capture");
        }

        Ok(Self {
            buffers: None,
            device,
            path,
        })
    }

    /// Device node path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn buffers(&self) -> io::Result<&MmapBuffers> {
        self.buffers.as_ref().ok_or_else(buffers_not_allocated)
    }
}

fn buffers_not_allocated() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "buffers not allocated")
}

impl CaptureDevice for V4L2Device {
    fn capabilities(&self) -> io::Result<DeviceCapabilities> {
        let caps = self.device.query_caps()?;
        Ok(DeviceCapabilities {
            driver: caps.driver,
            card: caps.card,
            bus_info: caps.bus,
            can_capture: caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE),
            can_stream: caps.capabilities.contains(v4l::capability::Flags::STREAMING),
        })
    }

    fn set_format(&mut self, format: &Format) -> io::Result<Format> {
        let mut fmt = self.device.format()?;

        fmt.width = format.width;
        fmt.height = format.height;
        fmt.fourcc = format.fourcc.into();

        let fmt = self.device.set_format(&fmt)?;

        Ok(Format {
            width: fmt.width,
            height: fmt.height,
            fourcc: FourCC::from(fmt.fourcc),
            stride: fmt.stride,
            size: fmt.size,
        })
    }

    fn set_fps(&mut self, fps: u32) -> io::Result<u32> {
        let params = self.device.set_params(&Parameters::with_fps(fps))?;
        let interval = params.interval;
        Ok(interval
            .denominator
            .checked_div(interval.numerator)
            .unwrap_or(fps))
    }

    fn set_control(&mut self, id: u32, value: i64) -> io::Result<()> {
        self.device.set_control(Control {
            id,
            value: Value::Integer(value),
        })
    }

    fn allocate_buffers(&mut self, count: u32) -> io::Result<u32> {
        // The previous set must be unmapped before the driver hands out a new one.
        self.buffers = None;
        let buffers = MmapBuffers::allocate(self.device.handle(), count)?;
        let granted = u32::try_from(buffers.len()).unwrap_or(u32::MAX);
        self.buffers = Some(buffers);
        Ok(granted)
    }

    fn queue_buffers(&mut self) -> io::Result<()> {
        let buffers = self.buffers()?;
        (0..buffers.len()).try_for_each(|index| buffers.queue(index))
    }

    fn stream_on(&mut self) -> io::Result<()> {
        self.buffers()?.stream_on()
    }

    fn stream_off(&mut self) -> io::Result<()> {
        self.buffers()?.stream_off()
    }

    fn deallocate_buffers(&mut self) -> io::Result<()> {
        match self.buffers.take() {
            Some(mut buffers) => buffers.release(),
            None => Ok(()),
        }
    }

    fn wait_ready(&mut self, timeout: Duration) -> io::Result<Readiness> {
        mmap::wait_readable(&self.device.handle(), timeout)
    }

    fn dequeue(&mut self) -> io::Result<RawBuffer<'_>> {
        let buffers = self.buffers()?;
        let dequeued = buffers.dequeue()?;
        let data = buffers
            .payload(dequeued.index, dequeued.bytes_used)
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("driver returned unknown buffer {}", dequeued.index),
                )
            })?;

        Ok(RawBuffer {
            index: dequeued.index,
            data,
            flags: dequeued.flags,
            timestamp: dequeued.timestamp,
            sequence: dequeued.sequence,
        })
    }

    fn queue(&mut self, index: usize) -> io::Result<()> {
        self.buffers()?.queue(index)
    }
}

/// Capture devices found under `/dev/video*`.
#[derive(Debug, Clone, Default)]
pub struct V4L2Enumerator {
    devices: Vec<DeviceInfo>,
}

impl V4L2Enumerator {
    /// Query every video node the system exposes. Nodes that cannot be
    /// opened are skipped.
    #[must_use]
    pub fn scan() -> Self {
        let mut nodes = v4l::context::enum_devices();
        nodes.sort_by_key(v4l::context::Node::index);

        let devices = nodes
            .iter()
            .filter_map(|node| {
                let device = Device::with_path(node.path()).ok()?;
                let caps = device.query_caps().ok()?;
                Some(DeviceInfo {
                    name: caps.card,
                    unique_name: caps.bus,
                })
            })
            .collect();

        Self { devices }
    }
}

impl DeviceEnumerator for V4L2Enumerator {
    fn device_count(&self) -> usize {
        self.devices.len()
    }

    fn device_info(&self, index: usize) -> Option<DeviceInfo> {
        self.devices.get(index).cloned()
    }
}
