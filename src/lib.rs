//! V4L2-Capturer: the capture front end of a V4L2 camera pipeline.
//!
//! A [`Capturer`] opens a V4L2 device, negotiates format, frame rate and
//! controls, runs a background loop over the device's mmap buffer set, and
//! turns each dequeued buffer into a frame, either directly for raw pixel
//! formats or through an asynchronous decoder for compressed ones. The
//! device and decoder sit behind traits so the whole pipeline can be driven
//! by mocks in tests.

pub mod capturer;
pub mod controls;
pub mod decoder;
pub mod device;
pub mod error;
pub mod frame;
pub mod routing;
pub mod traits;
pub mod validation;
pub mod worker;

mod mmap;
mod state;

#[cfg(test)]
pub mod mock;

pub use capturer::{Capturer, CapturerBuilder, CapturerConfig};
pub use decoder::{DecoderFactory, DefaultDecoderFactory, HardwareDecoder};
pub use device::{V4L2Device, V4L2Enumerator};
pub use error::{CaptureError, Result, SetupStage};
pub use frame::{FrameBuffer, I420Buffer};
pub use state::{FrameObserver, RawObserver};
pub use traits::{
    CaptureDevice, DeviceCapabilities, DeviceEnumerator, DeviceInfo, Format, FourCC, RawBuffer,
};
