//! Open instances of an emulated device.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::abi::{
    BufferDesc, Capability, FmtDesc, FrameSizeEnum, InputDesc, Priority, RequestBuffers,
    V4l2Format, BUF_TYPE_VIDEO_CAPTURE,
};
use crate::completion::EventCounter;
use crate::device::Device;
use crate::error::{Error, Result};
use crate::format::FourCC;
use crate::ioctl::{self, Ioctl, IoctlArg};
use crate::memory::Protection;

/// Identity of an open handle; also serves as the ownership token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HandleId(pub(crate) u64);

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One open instance of an emulated device.
///
/// Every handle carries its own priority, non-blocking flag and event
/// counter. Dropping a handle closes it.
pub struct Handle {
    device: Arc<Device>,
    id: HandleId,
    events: Arc<EventCounter>,
    closed: AtomicBool,
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("device", &self.device.index())
            .field("id", &self.id)
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl Handle {
    pub(crate) const fn new(device: Arc<Device>, id: HandleId, events: Arc<EventCounter>) -> Self {
        Self {
            device,
            id,
            events,
            closed: AtomicBool::new(false),
        }
    }

    /// Handle identity.
    pub const fn id(&self) -> HandleId {
        self.id
    }

    /// Device this handle was opened on.
    pub const fn device(&self) -> &Arc<Device> {
        &self.device
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::BadFileDescriptor(-1));
        }
        Ok(())
    }

    /// Service a raw request code with an optional argument.
    pub fn ioctl(&self, request: u64, arg: Option<&mut IoctlArg>) -> Result<()> {
        self.check_open()?;
        let ioctl = Ioctl::decode(request, arg)?;
        ioctl::dispatch(&self.device, self.id, ioctl)
    }

    /// Service an already typed command.
    pub fn dispatch(&self, ioctl: Ioctl<'_>) -> Result<()> {
        self.check_open()?;
        ioctl::dispatch(&self.device, self.id, ioctl)
    }

    /// Map the buffer at `offset` and return its address.
    pub fn mmap(&self, length: usize, prot: Protection, offset: u64) -> Result<usize> {
        self.check_open()?;
        self.device.mmap(self.id, length, prot, offset)
    }

    /// Unmap a mapping created through this device.
    pub fn munmap(&self, addr: usize, length: usize) -> Result<()> {
        self.device.munmap(addr, length)
    }

    /// Wait up to `timeout` for a completed buffer. Returns readiness.
    pub fn poll(&self, timeout: Duration) -> bool {
        !self.closed.load(Ordering::SeqCst) && self.events.wait(timeout)
    }

    /// Whether a completed buffer is pending for this handle.
    pub fn is_readable(&self) -> bool {
        self.events.is_readable()
    }

    /// Switch between blocking and non-blocking dequeue.
    pub fn set_nonblocking(&self, nonblocking: bool) -> Result<()> {
        self.check_open()?;
        self.device.set_nonblocking(self.id, nonblocking)
    }

    /// Close the handle. Closing twice is a no-op.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(handle = %self.id, "closing handle");
        self.device.close(self.id);
    }

    /// `VIDIOC_QUERYCAP`.
    pub fn query_cap(&self) -> Result<Capability> {
        let mut cap = Capability::default();
        self.dispatch(Ioctl::QueryCap(&mut cap))?;
        Ok(cap)
    }

    /// `VIDIOC_ENUM_FMT` for `index`.
    pub fn enum_format(&self, index: u32) -> Result<FmtDesc> {
        let mut desc = FmtDesc {
            index,
            type_: BUF_TYPE_VIDEO_CAPTURE,
            ..FmtDesc::default()
        };
        self.dispatch(Ioctl::EnumFmt(&mut desc))?;
        Ok(desc)
    }

    /// `VIDIOC_G_FMT`.
    pub fn format(&self) -> Result<V4l2Format> {
        let mut fmt = V4l2Format {
            type_: BUF_TYPE_VIDEO_CAPTURE,
            ..V4l2Format::default()
        };
        self.dispatch(Ioctl::GetFmt(&mut fmt))?;
        Ok(fmt)
    }

    /// `VIDIOC_S_FMT`; returns the applied format.
    pub fn set_format(&self, mut fmt: V4l2Format) -> Result<V4l2Format> {
        self.dispatch(Ioctl::SetFmt(&mut fmt))?;
        Ok(fmt)
    }

    /// `VIDIOC_TRY_FMT`; returns the negotiated format.
    pub fn try_format(&self, mut fmt: V4l2Format) -> Result<V4l2Format> {
        self.dispatch(Ioctl::TryFmt(&mut fmt))?;
        Ok(fmt)
    }

    /// `VIDIOC_ENUM_FRAMESIZES`.
    pub fn enum_frame_size(&self, pixel_format: FourCC, index: u32) -> Result<FrameSizeEnum> {
        let mut size = FrameSizeEnum {
            index,
            pixel_format,
            ..FrameSizeEnum::default()
        };
        self.dispatch(Ioctl::EnumFrameSizes(&mut size))?;
        Ok(size)
    }

    /// `VIDIOC_G_PRIORITY`.
    pub fn priority(&self) -> Result<Priority> {
        let mut value = 0;
        self.dispatch(Ioctl::GetPriority(&mut value))?;
        Priority::try_from(value).map_err(|_| Error::InvalidArgument("priority out of range"))
    }

    /// `VIDIOC_S_PRIORITY`.
    pub fn set_priority(&self, priority: Priority) -> Result<()> {
        let mut value = priority as u32;
        self.dispatch(Ioctl::SetPriority(&mut value))
    }

    /// `VIDIOC_ENUMINPUT`.
    pub fn enum_input(&self, index: u32) -> Result<InputDesc> {
        let mut input = InputDesc {
            index,
            ..InputDesc::default()
        };
        self.dispatch(Ioctl::EnumInput(&mut input))?;
        Ok(input)
    }

    /// `VIDIOC_REQBUFS` for MMAP capture buffers; returns the granted count.
    pub fn request_buffers(&self, count: u32) -> Result<u32> {
        let mut req = RequestBuffers::mmap(count);
        self.dispatch(Ioctl::ReqBufs(&mut req))?;
        Ok(req.count)
    }

    /// `VIDIOC_QUERYBUF`.
    pub fn query_buffer(&self, index: u32) -> Result<BufferDesc> {
        let mut buf = BufferDesc::mmap(index);
        self.dispatch(Ioctl::QueryBuf(&mut buf))?;
        Ok(buf)
    }

    /// `VIDIOC_QBUF`; returns the buffer with its updated flags.
    pub fn queue_buffer(&self, index: u32) -> Result<BufferDesc> {
        let mut buf = BufferDesc::mmap(index);
        self.dispatch(Ioctl::QBuf(&mut buf))?;
        Ok(buf)
    }

    /// `VIDIOC_DQBUF`.
    pub fn dequeue_buffer(&self) -> Result<BufferDesc> {
        let mut buf = BufferDesc::mmap(0);
        self.dispatch(Ioctl::DqBuf(&mut buf))?;
        Ok(buf)
    }

    /// `VIDIOC_STREAMON`.
    pub fn stream_on(&self) -> Result<()> {
        let mut type_ = BUF_TYPE_VIDEO_CAPTURE;
        self.dispatch(Ioctl::StreamOn(&mut type_))
    }

    /// `VIDIOC_STREAMOFF`.
    pub fn stream_off(&self) -> Result<()> {
        let mut type_ = BUF_TYPE_VIDEO_CAPTURE;
        self.dispatch(Ioctl::StreamOff(&mut type_))
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        self.close();
    }
}
