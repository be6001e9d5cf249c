//! Numeric constants and argument structures of the emulated V4L2 ABI.
//!
//! Only the subset needed to expose a single mmap capture device is modelled.
//! Structures mirror the kernel layouts field by field but are plain Rust
//! values; callers fill them and pass them through [`crate::ioctl::IoctlArg`].

use bitflags::bitflags;

use crate::format::{FourCC, PixFormat};

/// `V4L2_BUF_TYPE_VIDEO_CAPTURE`.
pub const BUF_TYPE_VIDEO_CAPTURE: u32 = 1;
/// `V4L2_MEMORY_MMAP`.
pub const MEMORY_MMAP: u32 = 1;

/// `V4L2_FIELD_NONE`.
pub const FIELD_NONE: u32 = 1;
/// `V4L2_COLORSPACE_SRGB`.
pub const COLORSPACE_SRGB: u32 = 8;
/// `V4L2_PIX_FMT_PRIV_MAGIC`, marks the extended pix format fields as valid.
pub const PIX_FMT_PRIV_MAGIC: u32 = 0xfeed_cafe;
/// `V4L2_YCBCR_ENC_DEFAULT`.
pub const YCBCR_ENC_DEFAULT: u32 = 0;
/// `V4L2_QUANTIZATION_DEFAULT`.
pub const QUANTIZATION_DEFAULT: u32 = 0;
/// `V4L2_XFER_FUNC_DEFAULT`.
pub const XFER_FUNC_DEFAULT: u32 = 0;

/// `V4L2_FMT_FLAG_COMPRESSED`.
pub const FMT_FLAG_COMPRESSED: u32 = 0x0001;
/// `V4L2_FRMSIZE_TYPE_DISCRETE`.
pub const FRMSIZE_TYPE_DISCRETE: u32 = 1;
/// `V4L2_INPUT_TYPE_CAMERA`.
pub const INPUT_TYPE_CAMERA: u32 = 2;
/// `V4L2_BUF_CAP_SUPPORTS_MMAP`.
pub const BUF_CAP_SUPPORTS_MMAP: u32 = 0x0000_0001;

/// Encode a kernel version the way `KERNEL_VERSION()` does.
pub const fn kernel_version(major: u8, minor: u8, patch: u8) -> u32 {
    ((major as u32) << 16) | ((minor as u32) << 8) | patch as u32
}

bitflags! {
    /// `V4L2_CAP_*` values carried by [`Capability`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct CapabilityFlags: u32 {
        /// Single-planar video capture.
        const VIDEO_CAPTURE = 0x0000_0001;
        /// Extended pix format fields are supported.
        const EXT_PIX_FORMAT = 0x0020_0000;
        /// Streaming I/O.
        const STREAMING = 0x0400_0000;
        /// `device_caps` is filled in.
        const DEVICE_CAPS = 0x8000_0000;
    }
}

bitflags! {
    /// `V4L2_BUF_FLAG_*` values carried by [`BufferDesc::flags`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct BufferFlags: u32 {
        /// Buffer is mapped into the application address space.
        const MAPPED = 0x0000_0001;
        /// Buffer is queued for capture.
        const QUEUED = 0x0000_0002;
        /// Buffer holds a completed frame.
        const DONE = 0x0000_0004;
        /// Capture of this buffer failed.
        const ERROR = 0x0000_0040;
        /// Timestamps come from the monotonic clock.
        const TIMESTAMP_MONOTONIC = 0x0000_2000;
    }
}

/// `enum v4l2_priority`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u32)]
pub enum Priority {
    /// No priority requested.
    #[default]
    Unset = 0,
    /// Background (lowest) priority.
    Background = 1,
    /// Interactive priority, the kernel default for new file handles.
    Interactive = 2,
    /// Exclusive recording priority.
    Record = 3,
}

impl TryFrom<u32> for Priority {
    type Error = u32;

    fn try_from(value: u32) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Unset),
            1 => Ok(Self::Background),
            2 => Ok(Self::Interactive),
            3 => Ok(Self::Record),
            other => Err(other),
        }
    }
}

/// `struct v4l2_capability`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capability {
    /// Driver name.
    pub driver: String,
    /// Card (camera) name.
    pub card: String,
    /// Bus information.
    pub bus_info: String,
    /// Kernel version encoded with [`kernel_version`].
    pub version: u32,
    /// Capabilities of the physical device as a whole.
    pub capabilities: CapabilityFlags,
    /// Capabilities of this device node.
    pub device_caps: CapabilityFlags,
}

/// `struct v4l2_fmtdesc`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FmtDesc {
    /// Format index to enumerate.
    pub index: u32,
    /// Buffer type.
    pub type_: u32,
    /// `V4L2_FMT_FLAG_*`.
    pub flags: u32,
    /// Human readable description.
    pub description: String,
    /// Pixel format.
    pub pixelformat: FourCC,
}

/// `struct v4l2_frmsizeenum` restricted to discrete sizes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrameSizeEnum {
    /// Size index to enumerate.
    pub index: u32,
    /// Pixel format whose sizes are enumerated.
    pub pixel_format: FourCC,
    /// `V4L2_FRMSIZE_TYPE_*`.
    pub type_: u32,
    /// Discrete width.
    pub width: u32,
    /// Discrete height.
    pub height: u32,
}

/// `struct v4l2_format` restricted to the single-planar pix member.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct V4l2Format {
    /// Buffer type.
    pub type_: u32,
    /// Single-planar pixel format.
    pub pix: PixFormat,
}

impl V4l2Format {
    /// Capture format request with the given pixel format and size.
    pub fn capture(pixelformat: FourCC, width: u32, height: u32) -> Self {
        Self {
            type_: BUF_TYPE_VIDEO_CAPTURE,
            pix: PixFormat {
                width,
                height,
                pixelformat,
                ..PixFormat::default()
            },
        }
    }
}

/// `struct v4l2_input`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InputDesc {
    /// Input index.
    pub index: u32,
    /// Input name.
    pub name: String,
    /// `V4L2_INPUT_TYPE_*`.
    pub type_: u32,
}

/// `struct v4l2_requestbuffers`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestBuffers {
    /// Requested count on input, granted count on output.
    pub count: u32,
    /// Buffer type.
    pub type_: u32,
    /// Memory type.
    pub memory: u32,
    /// `V4L2_BUF_CAP_*`.
    pub capabilities: u32,
}

impl RequestBuffers {
    /// MMAP capture buffer request.
    pub const fn mmap(count: u32) -> Self {
        Self {
            count,
            type_: BUF_TYPE_VIDEO_CAPTURE,
            memory: MEMORY_MMAP,
            capabilities: 0,
        }
    }
}

/// Buffer timestamp with the `struct timeval` split.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Timeval {
    /// Seconds.
    pub sec: i64,
    /// Microseconds.
    pub usec: i64,
}

impl Timeval {
    /// Split a nanosecond timestamp.
    #[allow(clippy::cast_possible_wrap)]
    pub const fn from_nanos(nanos: u64) -> Self {
        Self {
            sec: (nanos / 1_000_000_000) as i64,
            usec: ((nanos % 1_000_000_000) / 1_000) as i64,
        }
    }
}

/// `struct v4l2_buffer` for single-planar MMAP buffers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BufferDesc {
    /// Buffer index.
    pub index: u32,
    /// Buffer type.
    pub type_: u32,
    /// Bytes of payload in the buffer.
    pub bytesused: u32,
    /// Buffer state flags.
    pub flags: BufferFlags,
    /// Field order.
    pub field: u32,
    /// Capture timestamp.
    pub timestamp: Timeval,
    /// Frame sequence number.
    pub sequence: u32,
    /// Memory type.
    pub memory: u32,
    /// Offset to pass to mmap.
    pub offset: u32,
    /// Buffer length in bytes.
    pub length: u32,
}

impl BufferDesc {
    /// MMAP capture buffer descriptor for `index`.
    pub const fn mmap(index: u32) -> Self {
        Self {
            index,
            type_: BUF_TYPE_VIDEO_CAPTURE,
            bytesused: 0,
            flags: BufferFlags::empty(),
            field: 0,
            timestamp: Timeval { sec: 0, usec: 0 },
            sequence: 0,
            memory: MEMORY_MMAP,
            offset: 0,
            length: 0,
        }
    }
}
