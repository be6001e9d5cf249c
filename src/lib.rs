//! v4l2-compat: V4L2 capture device emulation on top of a pluggable camera backend.
//!
//! An application talks to an emulated `/dev/videoN` through the usual
//! open/ioctl/mmap/poll sequence; the crate services the calls against a
//! [`CameraBackend`] instead of a kernel driver. The layers, bottom-up:
//!
//! - [`backend`]: the camera seam, with a test-pattern camera and a
//!   `v4l`-based camera capturing from a real device.
//! - [`completion`]: finished buffers flowing back from backend threads.
//! - [`device`]: the per-camera state machine (format, buffers, ownership,
//!   priority, streaming).
//! - [`ioctl`]: request codes and the dispatcher.
//! - [`manager`]: descriptors, duplicates and mappings across devices.

pub mod abi;
pub mod backend;
pub mod completion;
pub mod device;
pub mod error;
pub mod format;
pub mod handle;
pub mod ioctl;
pub mod manager;
pub mod memory;

#[cfg(test)]
pub mod mock;

pub use backend::virtual_camera::{TestPattern, VirtualCameraConfig, VirtualSource};
pub use backend::v4l2::V4l2Source;
pub use backend::{CameraBackend, CameraSource};
pub use device::{Device, DeviceConfig};
pub use error::{Error, Result};
pub use format::{FourCC, PixelFormat, Size};
pub use handle::Handle;
pub use ioctl::IoctlArg;
pub use manager::CompatManager;
pub use memory::{HeapMapper, MemoryMapper, Protection};
