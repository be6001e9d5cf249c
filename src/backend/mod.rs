//! Camera backend abstraction.
//!
//! The emulated device never talks to a camera directly. It drives a
//! [`CameraBackend`] obtained from a [`CameraSource`]: the source describes a
//! camera and connects to it on first open, the backend configures the
//! stream, owns the frame buffers and reports finished buffers through a
//! registered [`CompletionHandler`].
//!
//! Two backends ship with the crate: [`virtual_camera::VirtualCamera`],
//! which synthesizes test patterns, and [`v4l2::V4l2Camera`], which captures
//! from a kernel video device through the `v4l` crate.

pub mod capture_loop;
pub mod v4l2;
pub mod virtual_camera;

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;

use crate::error::Result;
use crate::format::{PixelFormat, Size, StreamFormats};

pub use capture_loop::{CaptureLoop, LoopAction};

/// Stream configuration reported by a backend after open or configure.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamConfig {
    /// Pixel format the stream will produce.
    pub pixel_format: PixelFormat,
    /// Frame size.
    pub size: Size,
    /// Number of buffers granted.
    pub buffer_count: u32,
    /// Formats and sizes the camera advertises.
    pub formats: StreamFormats,
}

/// Outcome of a capture request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    /// Frame captured.
    Success,
    /// Capture failed; the buffer holds no valid frame.
    Error,
    /// Request cancelled by a stop; carries no frame.
    Cancelled,
}

/// A finished capture request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletedBuffer {
    /// Buffer index.
    pub index: u32,
    /// Bytes of payload written.
    pub bytes_used: u32,
    /// Capture time on the monotonic clock, in nanoseconds.
    pub timestamp_ns: u64,
    /// Frame sequence number.
    pub sequence: u32,
    /// Outcome.
    pub status: FrameStatus,
}

/// Callback invoked from backend threads for every finished buffer.
pub type CompletionHandler = Arc<dyn Fn(CompletedBuffer) + Send + Sync>;

/// Frame buffer memory shared between a backend and the mappings of it.
#[derive(Debug)]
pub struct FrameBuffer {
    data: Mutex<Vec<u8>>,
}

impl FrameBuffer {
    /// Allocate a zeroed buffer of `len` bytes.
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self {
            data: Mutex::new(vec![0; len]),
        }
    }

    /// Buffer length in bytes.
    pub fn len(&self) -> usize {
        self.data.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether the buffer has zero length.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run `f` with mutable access to the payload.
    pub fn write_with<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut data = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut data)
    }

    /// Run `f` with shared access to the payload.
    pub fn read_with<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let data = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        f(&data)
    }

    /// Copy of the payload.
    pub fn to_vec(&self) -> Vec<u8> {
        self.read_with(<[u8]>::to_vec)
    }
}

/// A connected camera.
///
/// Buffer indexes are dense and 0-based. Buffers queued before
/// [`start`](Self::start) are held and submitted when the stream starts.
pub trait CameraBackend: Send {
    /// Camera name, reported as the card name.
    fn name(&self) -> &str;

    /// Acquire the camera and report its initial configuration.
    fn open(&mut self) -> Result<StreamConfig>;

    /// Release the camera. Stops the stream and frees buffers first.
    fn close(&mut self);

    /// Apply a format, size and buffer count. The returned configuration is
    /// authoritative and may differ from the request.
    fn configure(
        &mut self,
        size: Size,
        pixel_format: PixelFormat,
        buffer_count: u32,
    ) -> Result<StreamConfig>;

    /// Allocate `count` frame buffers for the configured stream.
    fn allocate(&mut self, count: u32) -> Result<()>;

    /// Free every frame buffer.
    fn free(&mut self);

    /// Exportable memory of buffer `index`.
    fn buffer(&self, index: u32) -> Option<Arc<FrameBuffer>>;

    /// Submit buffer `index` for capture.
    fn queue(&mut self, index: u32) -> Result<()>;

    /// Start capturing.
    fn start(&mut self) -> Result<()>;

    /// Stop capturing and cancel outstanding submissions.
    fn stop(&mut self);

    /// Whether the stream is running.
    fn is_running(&self) -> bool;

    /// Register the completion callback.
    fn set_completion_handler(&mut self, handler: CompletionHandler);
}

/// Describes a camera and connects to it.
pub trait CameraSource: Send + Sync {
    /// Camera name.
    fn name(&self) -> String;

    /// Create a backend instance for this camera.
    fn connect(&self) -> Result<Box<dyn CameraBackend>>;
}

/// FIFO of buffer indexes submitted for capture, shared with a capture thread.
#[derive(Debug, Default)]
pub struct SubmissionQueue {
    indexes: Mutex<VecDeque<u32>>,
    available: Condvar,
}

impl SubmissionQueue {
    /// Create an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a submission.
    pub fn push(&self, index: u32) {
        self.indexes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(index);
        self.available.notify_one();
    }

    /// Take the oldest submission, waiting up to `timeout` for one.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<u32> {
        let indexes = self.indexes.lock().unwrap_or_else(PoisonError::into_inner);
        let (mut indexes, _) = self
            .available
            .wait_timeout_while(indexes, timeout, |indexes| indexes.is_empty())
            .unwrap_or_else(PoisonError::into_inner);
        indexes.pop_front()
    }

    /// Remove and return every submission.
    pub fn take_all(&self) -> Vec<u32> {
        self.indexes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect()
    }

    /// Number of waiting submissions.
    pub fn len(&self) -> usize {
        self.indexes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether no submission is waiting.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
