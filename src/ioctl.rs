//! Request code validation and routing.
//!
//! A raw request code plus an optional argument is decoded into a typed
//! [`Ioctl`] and routed to the matching handler under the device lock.
//! Validation follows the kernel ABI order: a missing argument for a code
//! with the write direction is `EFAULT` before an unsupported code is
//! `ENOTTY`, and a missing argument for a read-only code is `EFAULT` after it.

use tracing::debug;

use crate::abi::{
    BufferDesc, Capability, FmtDesc, FrameSizeEnum, InputDesc, RequestBuffers, V4l2Format,
};
use crate::device::Device;
use crate::error::{Error, Result};
use crate::handle::HandleId;

const IOC_NRBITS: u64 = 8;
const IOC_TYPEBITS: u64 = 8;
const IOC_SIZEBITS: u64 = 14;
const IOC_NRSHIFT: u64 = 0;
const IOC_TYPESHIFT: u64 = IOC_NRSHIFT + IOC_NRBITS;
const IOC_SIZESHIFT: u64 = IOC_TYPESHIFT + IOC_TYPEBITS;
const IOC_DIRSHIFT: u64 = IOC_SIZESHIFT + IOC_SIZEBITS;

/// `'V'`, the V4L2 ioctl type.
const IOC_TYPE_V4L2: u64 = 0x56;

/// Caller writes the argument.
const IOC_WRITE: u64 = 1;
/// Caller reads the argument back.
const IOC_READ: u64 = 2;

const fn ioc(dir: u64, nr: u64, size: u64) -> u64 {
    (dir << IOC_DIRSHIFT)
        | (size << IOC_SIZESHIFT)
        | (IOC_TYPE_V4L2 << IOC_TYPESHIFT)
        | (nr << IOC_NRSHIFT)
}

const fn ior(nr: u64, size: u64) -> u64 {
    ioc(IOC_READ, nr, size)
}

const fn iow(nr: u64, size: u64) -> u64 {
    ioc(IOC_WRITE, nr, size)
}

const fn iowr(nr: u64, size: u64) -> u64 {
    ioc(IOC_READ | IOC_WRITE, nr, size)
}

/// `VIDIOC_QUERYCAP`.
pub const VIDIOC_QUERYCAP: u64 = ior(0, 104);
/// `VIDIOC_ENUM_FMT`.
pub const VIDIOC_ENUM_FMT: u64 = iowr(2, 64);
/// `VIDIOC_G_FMT`.
pub const VIDIOC_G_FMT: u64 = iowr(4, 208);
/// `VIDIOC_S_FMT`.
pub const VIDIOC_S_FMT: u64 = iowr(5, 208);
/// `VIDIOC_REQBUFS`.
pub const VIDIOC_REQBUFS: u64 = iowr(8, 20);
/// `VIDIOC_QUERYBUF`.
pub const VIDIOC_QUERYBUF: u64 = iowr(9, 88);
/// `VIDIOC_QBUF`.
pub const VIDIOC_QBUF: u64 = iowr(15, 88);
/// `VIDIOC_DQBUF`.
pub const VIDIOC_DQBUF: u64 = iowr(17, 88);
/// `VIDIOC_STREAMON`.
pub const VIDIOC_STREAMON: u64 = iow(18, 4);
/// `VIDIOC_STREAMOFF`.
pub const VIDIOC_STREAMOFF: u64 = iow(19, 4);
/// `VIDIOC_ENUMINPUT`.
pub const VIDIOC_ENUMINPUT: u64 = iowr(26, 80);
/// `VIDIOC_G_INPUT`.
pub const VIDIOC_G_INPUT: u64 = ior(38, 4);
/// `VIDIOC_S_INPUT`.
pub const VIDIOC_S_INPUT: u64 = iowr(39, 4);
/// `VIDIOC_TRY_FMT`.
pub const VIDIOC_TRY_FMT: u64 = iowr(64, 208);
/// `VIDIOC_G_PRIORITY`.
pub const VIDIOC_G_PRIORITY: u64 = ior(67, 4);
/// `VIDIOC_S_PRIORITY`.
pub const VIDIOC_S_PRIORITY: u64 = iow(68, 4);
/// `VIDIOC_ENUM_FRAMESIZES`.
pub const VIDIOC_ENUM_FRAMESIZES: u64 = iowr(74, 44);

const SUPPORTED: [u64; 17] = [
    VIDIOC_QUERYCAP,
    VIDIOC_ENUM_FRAMESIZES,
    VIDIOC_ENUM_FMT,
    VIDIOC_G_FMT,
    VIDIOC_S_FMT,
    VIDIOC_TRY_FMT,
    VIDIOC_G_PRIORITY,
    VIDIOC_S_PRIORITY,
    VIDIOC_ENUMINPUT,
    VIDIOC_G_INPUT,
    VIDIOC_S_INPUT,
    VIDIOC_REQBUFS,
    VIDIOC_QUERYBUF,
    VIDIOC_QBUF,
    VIDIOC_DQBUF,
    VIDIOC_STREAMON,
    VIDIOC_STREAMOFF,
];

/// Owned ioctl argument, the memory a raw request code points at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IoctlArg {
    /// `struct v4l2_capability`.
    Capability(Capability),
    /// `struct v4l2_frmsizeenum`.
    FrameSize(FrameSizeEnum),
    /// `struct v4l2_fmtdesc`.
    FmtDesc(FmtDesc),
    /// `struct v4l2_format`.
    Format(V4l2Format),
    /// `struct v4l2_input`.
    Input(InputDesc),
    /// `struct v4l2_requestbuffers`.
    RequestBuffers(RequestBuffers),
    /// `struct v4l2_buffer`.
    Buffer(BufferDesc),
    /// Plain integer: priority, input index or buffer type.
    Int(u32),
}

/// A decoded request with its typed argument.
#[derive(Debug)]
pub enum Ioctl<'a> {
    /// `VIDIOC_QUERYCAP`.
    QueryCap(&'a mut Capability),
    /// `VIDIOC_ENUM_FRAMESIZES`.
    EnumFrameSizes(&'a mut FrameSizeEnum),
    /// `VIDIOC_ENUM_FMT`.
    EnumFmt(&'a mut FmtDesc),
    /// `VIDIOC_G_FMT`.
    GetFmt(&'a mut V4l2Format),
    /// `VIDIOC_S_FMT`.
    SetFmt(&'a mut V4l2Format),
    /// `VIDIOC_TRY_FMT`.
    TryFmt(&'a mut V4l2Format),
    /// `VIDIOC_G_PRIORITY`.
    GetPriority(&'a mut u32),
    /// `VIDIOC_S_PRIORITY`.
    SetPriority(&'a mut u32),
    /// `VIDIOC_ENUMINPUT`.
    EnumInput(&'a mut InputDesc),
    /// `VIDIOC_G_INPUT`.
    GetInput(&'a mut u32),
    /// `VIDIOC_S_INPUT`.
    SetInput(&'a mut u32),
    /// `VIDIOC_REQBUFS`.
    ReqBufs(&'a mut RequestBuffers),
    /// `VIDIOC_QUERYBUF`.
    QueryBuf(&'a mut BufferDesc),
    /// `VIDIOC_QBUF`.
    QBuf(&'a mut BufferDesc),
    /// `VIDIOC_DQBUF`.
    DqBuf(&'a mut BufferDesc),
    /// `VIDIOC_STREAMON`.
    StreamOn(&'a mut u32),
    /// `VIDIOC_STREAMOFF`.
    StreamOff(&'a mut u32),
}

impl<'a> Ioctl<'a> {
    /// Validate `request` and `arg` and pair them into a typed command.
    pub fn decode(request: u64, arg: Option<&'a mut IoctlArg>) -> Result<Self> {
        // Only the low 32 bits of a request code are significant.
        let code = request & 0xffff_ffff;
        let dir = code >> IOC_DIRSHIFT;

        if arg.is_none() && dir & IOC_WRITE != 0 {
            return Err(Error::BadAddress);
        }
        if !SUPPORTED.contains(&code) {
            return Err(Error::NotSupported(request));
        }
        let Some(arg) = arg else {
            return Err(Error::BadAddress);
        };

        let ioctl = match (code, arg) {
            (VIDIOC_QUERYCAP, IoctlArg::Capability(cap)) => Self::QueryCap(cap),
            (VIDIOC_ENUM_FRAMESIZES, IoctlArg::FrameSize(size)) => Self::EnumFrameSizes(size),
            (VIDIOC_ENUM_FMT, IoctlArg::FmtDesc(desc)) => Self::EnumFmt(desc),
            (VIDIOC_G_FMT, IoctlArg::Format(fmt)) => Self::GetFmt(fmt),
            (VIDIOC_S_FMT, IoctlArg::Format(fmt)) => Self::SetFmt(fmt),
            (VIDIOC_TRY_FMT, IoctlArg::Format(fmt)) => Self::TryFmt(fmt),
            (VIDIOC_G_PRIORITY, IoctlArg::Int(value)) => Self::GetPriority(value),
            (VIDIOC_S_PRIORITY, IoctlArg::Int(value)) => Self::SetPriority(value),
            (VIDIOC_ENUMINPUT, IoctlArg::Input(input)) => Self::EnumInput(input),
            (VIDIOC_G_INPUT, IoctlArg::Int(value)) => Self::GetInput(value),
            (VIDIOC_S_INPUT, IoctlArg::Int(value)) => Self::SetInput(value),
            (VIDIOC_REQBUFS, IoctlArg::RequestBuffers(req)) => Self::ReqBufs(req),
            (VIDIOC_QUERYBUF, IoctlArg::Buffer(buf)) => Self::QueryBuf(buf),
            (VIDIOC_QBUF, IoctlArg::Buffer(buf)) => Self::QBuf(buf),
            (VIDIOC_DQBUF, IoctlArg::Buffer(buf)) => Self::DqBuf(buf),
            (VIDIOC_STREAMON, IoctlArg::Int(value)) => Self::StreamOn(value),
            (VIDIOC_STREAMOFF, IoctlArg::Int(value)) => Self::StreamOff(value),
            _ => return Err(Error::InvalidArgument("argument does not match request")),
        };
        Ok(ioctl)
    }

    /// Request code of this command.
    pub const fn request(&self) -> u64 {
        match self {
            Self::QueryCap(_) => VIDIOC_QUERYCAP,
            Self::EnumFrameSizes(_) => VIDIOC_ENUM_FRAMESIZES,
            Self::EnumFmt(_) => VIDIOC_ENUM_FMT,
            Self::GetFmt(_) => VIDIOC_G_FMT,
            Self::SetFmt(_) => VIDIOC_S_FMT,
            Self::TryFmt(_) => VIDIOC_TRY_FMT,
            Self::GetPriority(_) => VIDIOC_G_PRIORITY,
            Self::SetPriority(_) => VIDIOC_S_PRIORITY,
            Self::EnumInput(_) => VIDIOC_ENUMINPUT,
            Self::GetInput(_) => VIDIOC_G_INPUT,
            Self::SetInput(_) => VIDIOC_S_INPUT,
            Self::ReqBufs(_) => VIDIOC_REQBUFS,
            Self::QueryBuf(_) => VIDIOC_QUERYBUF,
            Self::QBuf(_) => VIDIOC_QBUF,
            Self::DqBuf(_) => VIDIOC_DQBUF,
            Self::StreamOn(_) => VIDIOC_STREAMON,
            Self::StreamOff(_) => VIDIOC_STREAMOFF,
        }
    }
}

/// Run `ioctl` for handle `id` with the device lock held.
pub fn dispatch(device: &Device, id: HandleId, ioctl: Ioctl<'_>) -> Result<()> {
    let request = ioctl.request();
    let mut state = device.lock_state();

    let result = match ioctl {
        Ioctl::QueryCap(arg) => state.vidioc_querycap(id, arg),
        Ioctl::EnumFrameSizes(arg) => state.vidioc_enum_framesizes(id, arg),
        Ioctl::EnumFmt(arg) => state.vidioc_enum_fmt(id, arg),
        Ioctl::GetFmt(arg) => state.vidioc_g_fmt(id, arg),
        Ioctl::SetFmt(arg) => state.vidioc_s_fmt(id, arg),
        Ioctl::TryFmt(arg) => state.vidioc_try_fmt(id, arg),
        Ioctl::GetPriority(arg) => state.vidioc_g_priority(id, arg),
        Ioctl::SetPriority(arg) => state.vidioc_s_priority(id, arg),
        Ioctl::EnumInput(arg) => state.vidioc_enuminput(id, arg),
        Ioctl::GetInput(arg) => state.vidioc_g_input(id, arg),
        Ioctl::SetInput(arg) => state.vidioc_s_input(id, arg),
        Ioctl::ReqBufs(arg) => state.vidioc_reqbufs(id, arg),
        Ioctl::QueryBuf(arg) => state.vidioc_querybuf(id, arg),
        Ioctl::QBuf(arg) => state.vidioc_qbuf(id, arg),
        Ioctl::DqBuf(arg) => device.dequeue(state, id, arg),
        Ioctl::StreamOn(arg) => state.vidioc_streamon(id, arg),
        Ioctl::StreamOff(arg) => state.vidioc_streamoff(id, arg),
    };

    if let Err(err) = &result {
        debug!(
            handle = %id,
            request = %format_args!("{request:#010x}"),
            errno = err.errno(),
            error = %err,
            "ioctl failed"
        );
    }
    result
}
