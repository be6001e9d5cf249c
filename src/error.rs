//! Error type shared by the device state machine, the dispatcher and the backends.
//!
//! Every variant maps onto the errno value the emulated V4L2 ABI reports for
//! the same condition, see [`Error::errno`].

use thiserror::Error;

/// Result type for emulated device operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for emulated device operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// Malformed or out-of-range input, wrong buffer or memory type.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    /// Arbitration conflict, live mappings, or an active stream.
    #[error("device busy: {0}")]
    Busy(&'static str),
    /// An internal lookup by index or address failed.
    #[error("no such entry: {0}")]
    NoSuchEntry(&'static str),
    /// Non-blocking dequeue with no completed buffer at the cursor.
    #[error("no buffer ready")]
    WouldBlock,
    /// The handle lost the right to perform the operation while it was in flight.
    #[error("operation not permitted: {0}")]
    NotPermitted(&'static str),
    /// Request code outside the supported ioctl set.
    #[error("unsupported ioctl {0:#010x}")]
    NotSupported(u64),
    /// Missing argument for an ioctl that reads or writes one.
    #[error("bad address")]
    BadAddress,
    /// Descriptor unknown to the registry.
    #[error("bad file descriptor {0}")]
    BadFileDescriptor(i32),
    /// Path that does not name an emulated device.
    #[error("no emulated device at {0}")]
    UnknownDevice(String),
    /// The camera backend reported a failure.
    #[error("backend error ({errno}): {message}")]
    Backend {
        /// errno reported to the caller.
        errno: i32,
        /// Backend diagnostic.
        message: String,
    },
}

impl Error {
    /// Build a backend error from an errno and a diagnostic.
    pub fn backend(errno: i32, message: impl Into<String>) -> Self {
        Self::Backend {
            errno,
            message: message.into(),
        }
    }

    /// errno value reported at the ABI boundary.
    pub const fn errno(&self) -> i32 {
        match self {
            Self::InvalidArgument(_) | Self::NoSuchEntry(_) => libc::EINVAL,
            Self::Busy(_) => libc::EBUSY,
            Self::WouldBlock => libc::EAGAIN,
            Self::NotPermitted(_) => libc::EPERM,
            Self::NotSupported(_) => libc::ENOTTY,
            Self::BadAddress => libc::EFAULT,
            Self::BadFileDescriptor(_) => libc::EBADF,
            Self::UnknownDevice(_) => libc::ENOENT,
            Self::Backend { errno, .. } => *errno,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        let errno = err.raw_os_error().unwrap_or(libc::EIO);
        // The camera stack reports EACCES when it is held by another client.
        let errno = if errno == libc::EACCES {
            libc::EBUSY
        } else {
            errno
        };
        Self::backend(errno, err.to_string())
    }
}
