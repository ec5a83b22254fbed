//! Core traits and types for the V4L2 capture abstraction.

use std::fmt;
use std::io;
use std::str::FromStr;
use std::time::Duration;

/// Pixel format representation (e.g., YUYV, MJPG, H264).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FourCC(pub [u8; 4]);

impl FourCC {
    /// Create a new `FourCC` from a 4-byte array.
    #[must_use]
    pub const fn new(code: &[u8; 4]) -> Self {
        Self(*code)
    }

    /// YUYV pixel format (4:2:2 packed).
    pub const YUYV: Self = Self::new(b"YUYV");
    /// MJPEG pixel format (Motion JPEG).
    pub const MJPG: Self = Self::new(b"MJPG");
    /// H.264 elementary stream.
    pub const H264: Self = Self::new(b"H264");
    /// Planar YUV 4:2:0 (I420), `V4L2_PIX_FMT_YUV420`.
    pub const YU12: Self = Self::new(b"YU12");
    /// Semi-planar YUV 4:2:0 with interleaved UV.
    pub const NV12: Self = Self::new(b"NV12");
    /// RGB3 pixel format (24-bit RGB).
    pub const RGB3: Self = Self::new(b"RGB3");

    /// Whether frames in this format need a decoder before they are pixels.
    #[must_use]
    pub fn is_compressed(self) -> bool {
        self == Self::MJPG || self == Self::H264
    }

    /// Size in bytes of one `width` x `height` image, or `None` for
    /// compressed formats whose size varies per frame.
    #[must_use]
    pub fn frame_size(self, width: u32, height: u32) -> Option<usize> {
        let pixels = (width as usize).saturating_mul(height as usize);
        let chroma = (width.div_ceil(2) as usize).saturating_mul(height.div_ceil(2) as usize);
        match self {
            Self::YU12 | Self::NV12 => Some(pixels.saturating_add(chroma.saturating_mul(2))),
            Self::YUYV => Some(
                (width.div_ceil(2) as usize)
                    .saturating_mul(4)
                    .saturating_mul(height as usize),
            ),
            Self::RGB3 => Some(pixels.saturating_mul(3)),
            _ => None,
        }
    }
}

impl fmt::Display for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{}", char::from(byte))?;
        }
        Ok(())
    }
}

/// Error returned when a string is not a four character code.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid fourcc {0:?}: expected exactly four ASCII characters")]
pub struct ParseFourCCError(String);

impl FromStr for FourCC {
    type Err = ParseFourCCError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let code: [u8; 4] = s
            .as_bytes()
            .try_into()
            .map_err(|_| ParseFourCCError(s.to_owned()))?;
        if !code.iter().all(u8::is_ascii_graphic) {
            return Err(ParseFourCCError(s.to_owned()));
        }
        Ok(Self(code))
    }
}

impl From<v4l::FourCC> for FourCC {
    fn from(fourcc: v4l::FourCC) -> Self {
        Self(fourcc.repr)
    }
}

impl From<FourCC> for v4l::FourCC {
    fn from(fourcc: FourCC) -> Self {
        Self::new(&fourcc.0)
    }
}

/// Video format specification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Format {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Pixel format.
    pub fourcc: FourCC,
    /// Bytes per line (stride) of the first plane.
    pub stride: u32,
    /// Total frame size in bytes (an upper bound for compressed formats).
    pub size: u32,
}

impl Format {
    /// Create a new format specification.
    #[must_use]
    pub fn new(width: u32, height: u32, fourcc: FourCC) -> Self {
        let stride = match fourcc {
            FourCC::YUYV => width.saturating_mul(2),
            FourCC::RGB3 => width.saturating_mul(3),
            _ => width,
        };
        let size = fourcc.frame_size(width, height).map_or_else(
            || width.saturating_mul(height).saturating_mul(2),
            |size| u32::try_from(size).unwrap_or(u32::MAX),
        );
        Self {
            width,
            height,
            fourcc,
            stride,
            size,
        }
    }
}

/// Device capability flags.
#[derive(Debug, Clone, Default)]
pub struct DeviceCapabilities {
    /// Driver name.
    pub driver: String,
    /// Card/device name.
    pub card: String,
    /// Bus information.
    pub bus_info: String,
    /// Whether the device can capture video.
    pub can_capture: bool,
    /// Whether the device supports streaming.
    pub can_stream: bool,
}

impl DeviceCapabilities {
    /// Whether this device sits at the bus location `unique_name`.
    ///
    /// A device reporting no bus information never matches.
    #[must_use]
    pub fn matches_bus(&self, unique_name: &str) -> bool {
        !self.bus_info.is_empty() && self.bus_info == unique_name
    }
}

/// `V4L2_BUF_FLAG_KEYFRAME`.
pub const BUF_FLAG_KEYFRAME: u32 = 0x0000_0008;

/// One dequeued device buffer.
///
/// `data` points into the kernel-mapped region of buffer `index`. It is only
/// valid until that buffer is queued back, which the borrow on the device
/// enforces.
#[derive(Debug, Clone, Copy)]
pub struct RawBuffer<'a> {
    /// Index of the buffer within the device's buffer set.
    pub index: usize,
    /// Used bytes of the buffer.
    pub data: &'a [u8],
    /// Raw `V4L2_BUF_FLAG_*` bits.
    pub flags: u32,
    /// Driver capture timestamp.
    pub timestamp: Duration,
    /// Driver frame sequence number.
    pub sequence: u32,
}

impl RawBuffer<'_> {
    /// Number of payload bytes the driver filled in.
    #[must_use]
    pub const fn bytes_used(&self) -> usize {
        self.data.len()
    }

    /// Whether the driver flagged this buffer as a keyframe.
    #[must_use]
    pub const fn is_keyframe(&self) -> bool {
        self.flags & BUF_FLAG_KEYFRAME != 0
    }
}

/// Outcome of a bounded wait for a filled buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// At least one buffer can be dequeued without blocking.
    Ready,
    /// The timeout elapsed first.
    TimedOut,
}

/// Abstraction over an opened capture device and its mmap buffer set.
///
/// Every call talks to the device synchronously. Errors are the raw I/O
/// failures of the underlying ioctl; callers decide how fatal they are.
pub trait CaptureDevice: Send {
    /// Query device capabilities.
    fn capabilities(&self) -> io::Result<DeviceCapabilities>;

    /// Set capture format. Returns the actual format set by the driver.
    fn set_format(&mut self, format: &Format) -> io::Result<Format>;

    /// Set the frame rate. Returns the rate the driver settled on.
    fn set_fps(&mut self, fps: u32) -> io::Result<u32>;

    /// Write one control value.
    fn set_control(&mut self, id: u32, value: i64) -> io::Result<()>;

    /// Request and map `count` buffers. Returns the number granted.
    fn allocate_buffers(&mut self, count: u32) -> io::Result<u32>;

    /// Hand every allocated buffer to the device.
    fn queue_buffers(&mut self) -> io::Result<()>;

    /// Start streaming.
    fn stream_on(&mut self) -> io::Result<()>;

    /// Stop streaming; all buffers return to the application.
    fn stream_off(&mut self) -> io::Result<()>;

    /// Release the buffer set.
    fn deallocate_buffers(&mut self) -> io::Result<()>;

    /// Block until a buffer is ready or `timeout` elapses.
    fn wait_ready(&mut self, timeout: Duration) -> io::Result<Readiness>;

    /// Take one filled buffer from the device.
    fn dequeue(&mut self) -> io::Result<RawBuffer<'_>>;

    /// Give buffer `index` back to the device for refilling.
    fn queue(&mut self, index: usize) -> io::Result<()>;
}

/// Name and bus identity of one enumerated device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Human readable device name.
    pub name: String,
    /// Unique identity, the V4L2 bus info.
    pub unique_name: String,
}

/// Read-only list of capture devices known to the platform.
pub trait DeviceEnumerator {
    /// Number of devices.
    fn device_count(&self) -> usize;

    /// Name and identity of device `index`, if it can be queried.
    fn device_info(&self, index: usize) -> Option<DeviceInfo>;
}

impl DeviceEnumerator for [DeviceInfo] {
    fn device_count(&self) -> usize {
        self.len()
    }

    fn device_info(&self, index: usize) -> Option<DeviceInfo> {
        self.get(index).cloned()
    }
}
