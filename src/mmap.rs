//! Memory-mapped capture buffers driven by explicit `VIDIOC_QBUF` /
//! `VIDIOC_DQBUF` calls.
//!
//! A buffer belongs to the driver from [`MmapBuffers::queue`] until
//! [`MmapBuffers::dequeue`] returns its index. Its payload is only read while
//! it belongs to the application.

#![allow(unsafe_code)]

use std::os::raw::c_void;
use std::sync::Arc;
use std::time::Duration;
use std::{io, mem, ptr, slice};

use tracing::{debug, warn};
use v4l::buffer::Type;
use v4l::device::Handle;
use v4l::memory::Memory;
use v4l::timestamp::Timestamp;
use v4l::v4l2::{self, vidioc};
use v4l::v4l_sys::{v4l2_buffer, v4l2_requestbuffers};

use crate::traits::Readiness;

const BUF_TYPE: Type = Type::VideoCapture;

/// What `VIDIOC_DQBUF` reported for one buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Dequeued {
    pub index: usize,
    pub bytes_used: usize,
    pub flags: u32,
    pub timestamp: Duration,
    pub sequence: u32,
}

/// The driver's buffer set, mapped into this process.
pub(crate) struct MmapBuffers {
    handle: Arc<Handle>,
    regions: Vec<&'static [u8]>,
}

fn buffer_desc() -> v4l2_buffer {
    v4l2_buffer {
        type_: BUF_TYPE as u32,
        memory: Memory::Mmap as u32,
        // SAFETY: v4l2_buffer is a plain C struct; all-zero is a valid value.
        ..unsafe { mem::zeroed() }
    }
}

fn request_desc(count: u32) -> v4l2_requestbuffers {
    v4l2_requestbuffers {
        count,
        type_: BUF_TYPE as u32,
        memory: Memory::Mmap as u32,
        // SAFETY: v4l2_requestbuffers is a plain C struct; all-zero is valid.
        ..unsafe { mem::zeroed() }
    }
}

fn ioctl<T>(handle: &Handle, request: vidioc::_IOC_TYPE, arg: &mut T) -> io::Result<()> {
    // SAFETY: `arg` is the argument struct `request` expects and outlives
    // the call.
    unsafe { v4l2::ioctl(handle.fd(), request, ptr::from_mut(arg).cast::<c_void>()) }
}

fn stream_type() -> u32 {
    BUF_TYPE as u32
}

impl MmapBuffers {
    /// Request `count` buffers from the driver and map every buffer it
    /// grants.
    pub(crate) fn allocate(handle: Arc<Handle>, count: u32) -> io::Result<Self> {
        let mut request = request_desc(count);
        ioctl(&handle, vidioc::VIDIOC_REQBUFS, &mut request)?;

        // Dropping `buffers` on an error unmaps whatever was mapped so far.
        let mut buffers = Self {
            handle,
            regions: Vec::with_capacity(request.count as usize),
        };
        for index in 0..request.count {
            let mut desc = v4l2_buffer {
                index,
                ..buffer_desc()
            };
            ioctl(&buffers.handle, vidioc::VIDIOC_QUERYBUF, &mut desc)?;

            let length = desc.length as usize;
            // SAFETY: QUERYBUF on an mmap buffer fills the `offset` member.
            let offset = libc::off_t::try_from(unsafe { desc.m.offset })
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "mmap offset out of range"))?;
            // SAFETY: maps a driver buffer of `length` bytes at the offset the
            // driver reported for it.
            let region = unsafe {
                v4l2::mmap(
                    ptr::null_mut(),
                    length,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_SHARED,
                    buffers.handle.fd(),
                    offset,
                )?
            };
            // SAFETY: the mapping is `length` bytes long and stays mapped until
            // `release`, which drops the slice first.
            buffers
                .regions
                .push(unsafe { slice::from_raw_parts(region.cast::<u8>(), length) });
        }

        debug!(requested = count, granted = buffers.regions.len(), "mapped capture buffers");
        Ok(buffers)
    }

    /// Number of mapped buffers.
    pub(crate) fn len(&self) -> usize {
        self.regions.len()
    }

    /// Hand buffer `index` to the driver.
    pub(crate) fn queue(&self, index: usize) -> io::Result<()> {
        if index >= self.regions.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("no capture buffer {index}"),
            ));
        }
        let mut desc = v4l2_buffer {
            index: u32::try_from(index).map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?,
            ..buffer_desc()
        };
        ioctl(&self.handle, vidioc::VIDIOC_QBUF, &mut desc)
    }

    /// Take the next filled buffer from the driver.
    pub(crate) fn dequeue(&self) -> io::Result<Dequeued> {
        let mut desc = buffer_desc();
        ioctl(&self.handle, vidioc::VIDIOC_DQBUF, &mut desc)?;

        let timestamp = Timestamp::from(desc.timestamp);
        // Safe conversions: V4L2 timestamps are always non-negative in practice
        #[allow(clippy::cast_sign_loss)]
        let secs = timestamp.sec.max(0) as u64;
        #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
        let nanos = (timestamp.usec.max(0) as u32).saturating_mul(1000);

        Ok(Dequeued {
            index: desc.index as usize,
            bytes_used: desc.bytesused as usize,
            flags: desc.flags,
            timestamp: Duration::new(secs, nanos),
            sequence: desc.sequence,
        })
    }

    /// The first `bytes_used` bytes of buffer `index`.
    pub(crate) fn payload(&self, index: usize, bytes_used: usize) -> Option<&[u8]> {
        let region = self.regions.get(index)?;
        Some(region.get(..bytes_used).unwrap_or(region))
    }

    pub(crate) fn stream_on(&self) -> io::Result<()> {
        let mut kind = stream_type();
        ioctl(&self.handle, vidioc::VIDIOC_STREAMON, &mut kind)
    }

    /// Stop streaming; the driver gives every queued buffer back.
    pub(crate) fn stream_off(&self) -> io::Result<()> {
        let mut kind = stream_type();
        ioctl(&self.handle, vidioc::VIDIOC_STREAMOFF, &mut kind)
    }

    /// Unmap every buffer and free the driver's buffer set.
    pub(crate) fn release(&mut self) -> io::Result<()> {
        for region in self.regions.drain(..) {
            // SAFETY: `region` came from `v4l2::mmap` with this length and no
            // other reference to it remains.
            unsafe { v4l2::munmap(region.as_ptr().cast_mut().cast::<c_void>(), region.len())? };
        }
        let mut request = request_desc(0);
        ioctl(&self.handle, vidioc::VIDIOC_REQBUFS, &mut request)
    }
}

impl Drop for MmapBuffers {
    fn drop(&mut self) {
        if self.regions.is_empty() {
            return;
        }
        // The driver refuses to free buffers while streaming.
        if let Err(err) = self.stream_off() {
            debug!(%err, "stream off before buffer release failed");
        }
        if let Err(err) = self.release() {
            warn!(%err, "capture buffer release failed");
        }
    }
}

/// Wait up to `timeout` for the device to have a filled buffer.
///
/// `POLLERR` without `POLLIN` means the driver has nothing it could fill,
/// for example no buffer is queued or streaming is off.
pub(crate) fn wait_readable(handle: &Handle, timeout: Duration) -> io::Result<Readiness> {
    let mut fd = libc::pollfd {
        fd: handle.fd(),
        events: libc::POLLIN,
        revents: 0,
    };
    let timeout_ms = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX);
    // SAFETY: one valid pollfd that outlives the call.
    match unsafe { libc::poll(&mut fd, 1, timeout_ms) } {
        -1 => Err(io::Error::last_os_error()),
        0 => Ok(Readiness::TimedOut),
        _ => readiness(fd.revents),
    }
}

fn readiness(revents: i16) -> io::Result<Readiness> {
    if revents & libc::POLLIN != 0 {
        return Ok(Readiness::Ready);
    }
    if revents & libc::POLLNVAL != 0 {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "device descriptor is not open (POLLNVAL)"));
    }
    if revents & libc::POLLHUP != 0 {
        return Err(io::Error::new(io::ErrorKind::BrokenPipe, "device hung up (POLLHUP)"));
    }
    if revents & libc::POLLERR != 0 {
        return Err(io::Error::other("no buffer queued for capture (POLLERR)"));
    }
    Ok(Readiness::TimedOut)
}
