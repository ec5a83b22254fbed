//! Mock device and decoder for testing without hardware.
//!
//! Both mocks write every collaborator call into a shared [`Journal`] so
//! tests can assert on call order across the device, the decoder and the
//! observers.

use std::collections::VecDeque;
use std::io;
use std::mem;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::decoder::{
    DecodeCallback, DecodedBuffer, DecoderError, DecoderFactory, EncodedBuffer, HardwareDecoder,
};
use crate::routing::DECODE_FORMAT;
use crate::traits::{
    CaptureDevice, DeviceCapabilities, Format, FourCC, RawBuffer, Readiness, BUF_FLAG_KEYFRAME,
};

/// One recorded collaborator call or publication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Format { width: u32, height: u32, fourcc: FourCC },
    Fps(u32),
    Control { id: u32, value: i64 },
    Allocate(u32),
    QueueBuffers,
    StreamOn,
    StreamOff,
    Deallocate,
    Wait,
    Dequeue(usize),
    DequeueFailed,
    Queue(usize),
    DecoderCreated { width: u32, height: u32, source: FourCC },
    DecoderSubmit(u32),
    FramePublished(u32),
    RawPublished(usize),
    Fatal(String),
}

/// Shared, ordered log of events.
#[derive(Debug, Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<Event>>>);

impl Journal {
    pub fn record(&self, event: Event) {
        self.0.lock().expect("journal lock").push(event);
    }

    pub fn events(&self) -> Vec<Event> {
        self.0.lock().expect("journal lock").clone()
    }

    pub fn clear(&self) {
        self.0.lock().expect("journal lock").clear();
    }

    pub fn count(&self, event: &Event) -> usize {
        self.events().iter().filter(|recorded| *recorded == event).count()
    }

    /// Poll until `condition` holds or two seconds pass.
    pub fn wait_for<F: Fn(&[Event]) -> bool>(&self, condition: F) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if condition(&self.events()) {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        condition(&self.events())
    }
}

/// Scripted outcome of one capture iteration.
#[derive(Debug, Clone)]
pub enum Step {
    /// A buffer is ready with this payload.
    Frame(Vec<u8>),
    /// A buffer flagged as keyframe is ready with this payload.
    Keyframe(Vec<u8>),
    /// The readiness wait times out.
    Timeout,
    /// The readiness wait fails.
    WaitError,
    /// The device reports readiness but dequeue fails.
    DequeueError,
}

/// Mock device for testing without hardware.
pub struct MockDevice {
    journal: Journal,
    capabilities: DeviceCapabilities,
    format: Format,
    steps: VecDeque<Step>,
    repeat: Option<Step>,
    ready: Option<Step>,
    buffers: Vec<Vec<u8>>,
    with_device: VecDeque<usize>,
    streaming: bool,
    sequence: u32,
    substitute: Option<FourCC>,
    failing_fps: bool,
    failing_queue: bool,
    failing_controls: Vec<u32>,
}

impl MockDevice {
    /// Create a new mock device with default settings.
    pub fn new(journal: Journal) -> Self {
        Self {
            journal,
            capabilities: DeviceCapabilities {
                driver: "mock".to_owned(),
                card: "Mock Camera".to_owned(),
                bus_info: "mock:0".to_owned(),
                can_capture: true,
                can_stream: true,
            },
            format: Format::new(640, 480, FourCC::YUYV),
            steps: VecDeque::new(),
            repeat: None,
            ready: None,
            buffers: Vec::new(),
            with_device: VecDeque::new(),
            streaming: false,
            sequence: 0,
            substitute: None,
            failing_fps: false,
            failing_queue: false,
            failing_controls: Vec::new(),
        }
    }

    /// Script the capture iterations. Once exhausted every wait times out.
    #[must_use]
    pub fn with_steps(mut self, steps: Vec<Step>) -> Self {
        self.steps = steps.into();
        self
    }

    /// Once the script is exhausted, produce `step` every millisecond.
    #[must_use]
    pub fn repeating(mut self, step: Step) -> Self {
        self.repeat = Some(step);
        self
    }

    /// Set the capabilities for this mock device.
    #[must_use]
    pub fn with_capabilities(mut self, capabilities: DeviceCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Accept every format request but deliver `fourcc` instead.
    #[must_use]
    pub fn substituting(mut self, fourcc: FourCC) -> Self {
        self.substitute = Some(fourcc);
        self
    }

    /// Reject every frame rate change.
    #[must_use]
    pub fn failing_fps(mut self) -> Self {
        self.failing_fps = true;
        self
    }

    /// Reject every single-buffer queue.
    #[must_use]
    pub fn failing_queue(mut self) -> Self {
        self.failing_queue = true;
        self
    }

    /// Reject writes to control `id`.
    #[must_use]
    pub fn failing_control(mut self, id: u32) -> Self {
        self.failing_controls.push(id);
        self
    }

    /// Whether buffer `index` is queued with the device.
    pub fn owns(&self, index: usize) -> bool {
        self.with_device.contains(&index)
    }

    /// Whether the device owns every allocated buffer.
    pub fn all_buffers_with_device(&self) -> bool {
        self.with_device.len() == self.buffers.len()
    }
}

impl CaptureDevice for MockDevice {
    fn capabilities(&self) -> io::Result<DeviceCapabilities> {
        Ok(self.capabilities.clone())
    }

    fn set_format(&mut self, format: &Format) -> io::Result<Format> {
        self.journal.record(Event::Format {
            width: format.width,
            height: format.height,
            fourcc: format.fourcc,
        });
        self.format = match self.substitute {
            Some(fourcc) => Format::new(format.width, format.height, fourcc),
            None => format.clone(),
        };
        Ok(self.format.clone())
    }

    fn set_fps(&mut self, fps: u32) -> io::Result<u32> {
        self.journal.record(Event::Fps(fps));
        if self.failing_fps {
            return Err(io::Error::from(io::ErrorKind::InvalidInput));
        }
        Ok(fps)
    }

    fn set_control(&mut self, id: u32, value: i64) -> io::Result<()> {
        self.journal.record(Event::Control { id, value });
        if self.failing_controls.contains(&id) {
            return Err(io::Error::from(io::ErrorKind::InvalidInput));
        }
        Ok(())
    }

    fn allocate_buffers(&mut self, count: u32) -> io::Result<u32> {
        self.journal.record(Event::Allocate(count));
        self.buffers = vec![Vec::new(); count as usize];
        Ok(count)
    }

    fn queue_buffers(&mut self) -> io::Result<()> {
        self.journal.record(Event::QueueBuffers);
        self.with_device = (0..self.buffers.len()).collect();
        Ok(())
    }

    fn stream_on(&mut self) -> io::Result<()> {
        self.journal.record(Event::StreamOn);
        self.streaming = true;
        Ok(())
    }

    fn stream_off(&mut self) -> io::Result<()> {
        self.journal.record(Event::StreamOff);
        self.streaming = false;
        self.with_device.clear();
        Ok(())
    }

    fn deallocate_buffers(&mut self) -> io::Result<()> {
        self.journal.record(Event::Deallocate);
        self.buffers.clear();
        Ok(())
    }

    fn wait_ready(&mut self, _timeout: Duration) -> io::Result<Readiness> {
        self.journal.record(Event::Wait);
        if !self.streaming {
            return Err(io::Error::from(io::ErrorKind::NotConnected));
        }

        let step = self.steps.pop_front().or_else(|| {
            let repeat = self.repeat.clone()?;
            thread::sleep(Duration::from_millis(1));
            Some(repeat)
        });
        match step {
            None => {
                thread::sleep(Duration::from_millis(1));
                Ok(Readiness::TimedOut)
            }
            Some(Step::Timeout) => Ok(Readiness::TimedOut),
            Some(Step::WaitError) => Err(io::Error::other("select failed")),
            Some(step) => {
                self.ready = Some(step);
                Ok(Readiness::Ready)
            }
        }
    }

    fn dequeue(&mut self) -> io::Result<RawBuffer<'_>> {
        let (payload, flags) = match self.ready.take() {
            Some(Step::Frame(payload)) => (payload, 0),
            Some(Step::Keyframe(payload)) => (payload, BUF_FLAG_KEYFRAME),
            _ => {
                self.journal.record(Event::DequeueFailed);
                return Err(io::Error::from(io::ErrorKind::WouldBlock));
            }
        };
        let Some(index) = self.with_device.pop_front() else {
            self.journal.record(Event::DequeueFailed);
            return Err(io::Error::from(io::ErrorKind::WouldBlock));
        };

        self.journal.record(Event::Dequeue(index));
        let sequence = self.sequence;
        self.sequence += 1;

        let buffer = self
            .buffers
            .get_mut(index)
            .ok_or_else(|| io::Error::from(io::ErrorKind::InvalidData))?;
        *buffer = payload;

        Ok(RawBuffer {
            index,
            data: buffer.as_slice(),
            flags,
            timestamp: Duration::from_millis(u64::from(sequence) * 33), // ~30fps
            sequence,
        })
    }

    fn queue(&mut self, index: usize) -> io::Result<()> {
        self.journal.record(Event::Queue(index));
        if self.failing_queue || index >= self.buffers.len() || self.with_device.contains(&index) {
            return Err(io::Error::from(io::ErrorKind::InvalidInput));
        }
        self.with_device.push_back(index);
        Ok(())
    }
}

/// Decode callbacks held back until a test releases them.
#[derive(Clone, Default)]
pub struct PendingDecodes(Arc<Mutex<Vec<(u32, DecodeCallback)>>>);

impl PendingDecodes {
    /// Run every held callback with a zeroed picture of `len` bytes.
    pub fn complete_all(&self, len: usize) {
        let pending = mem::take(&mut *self.0.lock().expect("pending lock"));
        for (sequence, on_decoded) in pending {
            on_decoded(DecodedBuffer {
                data: Bytes::from(vec![0; len]),
                timestamp: Duration::ZERO,
                sequence,
            });
        }
    }

    pub fn len(&self) -> usize {
        self.0.lock().expect("pending lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Decoder that either completes inline or holds completions back.
pub struct MockDecoder {
    journal: Journal,
    output_len: Option<usize>,
    pending: PendingDecodes,
}

impl MockDecoder {
    /// Complete every submission inline with `output_len` zero bytes.
    pub fn immediate(journal: Journal, output_len: usize) -> Self {
        Self {
            journal,
            output_len: Some(output_len),
            pending: PendingDecodes::default(),
        }
    }

    /// Hold every completion until [`PendingDecodes::complete_all`].
    pub fn deferred(journal: Journal) -> Self {
        Self {
            journal,
            output_len: None,
            pending: PendingDecodes::default(),
        }
    }

    pub fn pending(&self) -> PendingDecodes {
        self.pending.clone()
    }
}

impl HardwareDecoder for MockDecoder {
    fn submit(
        &mut self,
        encoded: EncodedBuffer,
        on_decoded: DecodeCallback,
    ) -> Result<(), DecoderError> {
        self.journal.record(Event::DecoderSubmit(encoded.sequence));
        match self.output_len {
            Some(len) => on_decoded(DecodedBuffer {
                data: Bytes::from(vec![0; len]),
                timestamp: encoded.timestamp,
                sequence: encoded.sequence,
            }),
            None => self
                .pending
                .0
                .lock()
                .expect("pending lock")
                .push((encoded.sequence, on_decoded)),
        }
        Ok(())
    }
}

/// Factory journaling decoder construction.
#[derive(Clone, Default)]
pub struct MockDecoderFactory {
    journal: Journal,
    deferred: Option<PendingDecodes>,
    unavailable: bool,
}

impl MockDecoderFactory {
    /// Decoders complete inline with a correctly sized picture.
    pub fn new(journal: Journal) -> Self {
        Self {
            journal,
            ..Self::default()
        }
    }

    /// Decoders hold completions in the returned queue.
    pub fn deferred(journal: Journal) -> (Self, PendingDecodes) {
        let pending = PendingDecodes::default();
        let factory = Self {
            journal,
            deferred: Some(pending.clone()),
            unavailable: false,
        };
        (factory, pending)
    }

    /// Every construction fails.
    pub fn unavailable(journal: Journal) -> Self {
        Self {
            journal,
            deferred: None,
            unavailable: true,
        }
    }
}

impl DecoderFactory for MockDecoderFactory {
    fn create(
        &self,
        width: u32,
        height: u32,
        source: FourCC,
        _use_hardware: bool,
    ) -> Result<Box<dyn HardwareDecoder>, DecoderError> {
        self.journal.record(Event::DecoderCreated {
            width,
            height,
            source,
        });
        if self.unavailable {
            return Err(DecoderError::Unavailable(source));
        }

        let decoder = match &self.deferred {
            Some(pending) => MockDecoder {
                journal: self.journal.clone(),
                output_len: None,
                pending: pending.clone(),
            },
            None => MockDecoder::immediate(
                self.journal.clone(),
                DECODE_FORMAT.frame_size(width, height).unwrap_or_default(),
            ),
        };
        Ok(Box::new(decoder))
    }
}

/// Test pattern types for mock frame generation.
#[derive(Debug, Clone, Copy)]
pub enum TestPattern {
    /// SMPTE color bars pattern.
    ColorBars,
    /// Horizontal gradient from dark to light.
    Gradient,
    /// Solid color with specified Y, U, V values.
    Solid(u8, u8, u8),
}

/// YUV values of the 8 color bars: White, Yellow, Cyan, Green, Magenta, Red, Blue, Black.
const BARS: [(u8, u8, u8); 8] = [
    (235, 128, 128),
    (210, 16, 146),
    (170, 166, 16),
    (145, 54, 34),
    (106, 202, 222),
    (81, 90, 240),
    (41, 240, 110),
    (16, 128, 128),
];

fn pattern_at(pattern: TestPattern, x: u32, width: u32) -> (u8, u8, u8) {
    match pattern {
        TestPattern::ColorBars => {
            let bar_width = (width / 8).max(1);
            BARS[((x / bar_width) as usize).min(7)]
        }
        #[allow(clippy::cast_possible_truncation)]
        TestPattern::Gradient => (((x * 255) / width) as u8, 128, 128),
        TestPattern::Solid(y, u, v) => (y, u, v),
    }
}

/// Generate one frame of `pattern` in `format` (YUYV or YU12).
pub fn generate_test_frame(format: &Format, pattern: TestPattern) -> Vec<u8> {
    let (width, height) = (format.width, format.height);
    match format.fourcc {
        FourCC::YU12 => {
            let row: Vec<(u8, u8, u8)> = (0..width).map(|x| pattern_at(pattern, x, width)).collect();
            let chroma_row: Vec<(u8, u8, u8)> = row.iter().step_by(2).copied().collect();
            let mut data = Vec::new();
            for _ in 0..height {
                data.extend(row.iter().map(|px| px.0));
            }
            for _ in 0..height.div_ceil(2) {
                data.extend(chroma_row.iter().map(|px| px.1));
            }
            for _ in 0..height.div_ceil(2) {
                data.extend(chroma_row.iter().map(|px| px.2));
            }
            data
        }
        _ => {
            let mut data = Vec::new();
            for _ in 0..height {
                for x in (0..width).step_by(2) {
                    let (y, u, v) = pattern_at(pattern, x, width);
                    data.extend_from_slice(&[y, u, y, v]);
                }
            }
            data
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_device_creation() {
        let device = MockDevice::new(Journal::default());
        let caps = device.capabilities().expect("capabilities");
        assert_eq!(caps.driver, "mock");
        assert!(caps.can_capture);
        assert!(caps.can_stream);
    }

    #[test]
    fn test_mock_buffer_ownership() {
        let journal = Journal::default();
        let mut device = MockDevice::new(journal).with_steps(vec![Step::Frame(vec![1, 2, 3])]);
        device.allocate_buffers(3).expect("allocate");
        device.queue_buffers().expect("queue buffers");
        device.stream_on().expect("stream on");

        assert_eq!(device.wait_ready(Duration::ZERO).expect("wait"), Readiness::Ready);
        let raw = device.dequeue().expect("dequeue");
        assert_eq!(raw.index, 0);
        assert_eq!(raw.data, &[1, 2, 3]);
        assert!(!device.owns(0));
        assert!(!device.all_buffers_with_device());

        assert!(device.queue(1).is_err(), "buffer 1 is still owned by the device");
        device.queue(0).expect("queue");
        assert!(device.owns(0));
        assert!(device.all_buffers_with_device());
    }

    #[test]
    fn test_color_bars_pattern() {
        let format = Format::new(640, 480, FourCC::YUYV);
        let data = generate_test_frame(&format, TestPattern::ColorBars);

        assert_eq!(data.len(), (640 * 480 * 2) as usize);
        // First bar should be white (Y=235)
        assert_eq!(data.first(), Some(&235));
    }

    #[test]
    fn test_planar_pattern_size() {
        let format = Format::new(64, 48, FourCC::YU12);
        let data = generate_test_frame(&format, TestPattern::Solid(128, 64, 192));

        assert_eq!(data.len(), 64 * 48 * 3 / 2);
        assert_eq!(data.first(), Some(&128));
        assert_eq!(data.get(64 * 48), Some(&64));
        assert_eq!(data.last(), Some(&192));
    }
}
