//! Scripted camera backend for testing the device state machine.
//!
//! [`MockCamera`] never produces frames on its own. Tests drive it through
//! the [`MockControl`] returned alongside the source: buffers complete only
//! when the test says so, in whatever order and with whatever status it
//! picks.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::backend::{
    CameraBackend, CameraSource, CompletedBuffer, CompletionHandler, FrameBuffer, FrameStatus,
    StreamConfig,
};
use crate::error::{Error, Result};
use crate::format::{self, PixelFormat, Size, StreamFormats};

const MAX_BUFFER_COUNT: u32 = 8;
const FRAME_PERIOD_NS: u64 = 33_333_333;

#[derive(Default)]
struct MockShared {
    handler: Option<CompletionHandler>,
    submitted: Vec<u32>,
    frame_size: u32,
    sequence: u32,
    running: bool,
    acquired: bool,
    opens: u32,
    closes: u32,
    fail_allocate: bool,
    reject_configure: bool,
    zero_size: bool,
}

fn lock(shared: &Mutex<MockShared>) -> MutexGuard<'_, MockShared> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Formats advertised by the mock: YUYV at two sizes, then MJPEG.
pub fn mock_formats() -> StreamFormats {
    StreamFormats::new(vec![
        (
            PixelFormat::YUYV,
            vec![Size::new(640, 480), Size::new(320, 240)],
        ),
        (PixelFormat::MJPEG, vec![Size::new(1280, 720)]),
    ])
}

/// Test-side handle on a [`MockCamera`].
#[derive(Clone)]
pub struct MockControl {
    shared: Arc<Mutex<MockShared>>,
}

impl MockControl {
    /// Complete buffer `index` successfully.
    pub fn complete(&self, index: u32) {
        self.complete_with(index, FrameStatus::Success);
    }

    /// Complete buffer `index` with `status`.
    pub fn complete_with(&self, index: u32, status: FrameStatus) {
        let (handler, completion) = {
            let mut shared = lock(&self.shared);
            shared.submitted.retain(|submitted| *submitted != index);

            let sequence = shared.sequence;
            if status == FrameStatus::Success {
                shared.sequence += 1;
            }
            let completion = CompletedBuffer {
                index,
                bytes_used: shared.frame_size,
                timestamp_ns: u64::from(sequence + 1) * FRAME_PERIOD_NS,
                sequence,
                status,
            };
            (shared.handler.clone(), completion)
        };

        if let Some(handler) = handler {
            handler(completion);
        }
    }

    /// Buffers submitted and not yet completed, in submission order.
    pub fn submitted(&self) -> Vec<u32> {
        lock(&self.shared).submitted.clone()
    }

    /// Whether the stream is running.
    pub fn is_running(&self) -> bool {
        lock(&self.shared).running
    }

    /// Times the camera was opened.
    pub fn opens(&self) -> u32 {
        lock(&self.shared).opens
    }

    /// Times the camera was closed.
    pub fn closes(&self) -> u32 {
        lock(&self.shared).closes
    }

    /// Make the next allocations fail.
    pub fn set_fail_allocate(&self, fail: bool) {
        lock(&self.shared).fail_allocate = fail;
    }

    /// Make the next configurations fail.
    pub fn set_reject_configure(&self, reject: bool) {
        lock(&self.shared).reject_configure = reject;
    }

    /// Make the next configurations grant an empty frame size.
    pub fn set_zero_size(&self, zero: bool) {
        lock(&self.shared).zero_size = zero;
    }
}

/// Source handing out [`MockCamera`] instances that share one control.
pub struct MockSource {
    shared: Arc<Mutex<MockShared>>,
}

impl MockSource {
    /// Create a source and the control driving its cameras.
    pub fn new() -> (Self, MockControl) {
        let shared = Arc::new(Mutex::new(MockShared::default()));
        (
            Self {
                shared: Arc::clone(&shared),
            },
            MockControl { shared },
        )
    }
}

impl CameraSource for MockSource {
    fn name(&self) -> String {
        "Mock Camera".to_owned()
    }

    fn connect(&self) -> Result<Box<dyn CameraBackend>> {
        Ok(Box::new(MockCamera {
            shared: Arc::clone(&self.shared),
            config: StreamConfig::default(),
            buffers: Vec::new(),
        }))
    }
}

/// Camera whose completions are scripted through [`MockControl`].
pub struct MockCamera {
    shared: Arc<Mutex<MockShared>>,
    config: StreamConfig,
    buffers: Vec<Arc<FrameBuffer>>,
}

impl MockCamera {
    fn lock(&self) -> MutexGuard<'_, MockShared> {
        lock(&self.shared)
    }
}

impl CameraBackend for MockCamera {
    fn name(&self) -> &str {
        "Mock Camera"
    }

    fn open(&mut self) -> Result<StreamConfig> {
        let mut shared = self.lock();
        if shared.acquired {
            return Err(Error::Busy("camera already acquired"));
        }
        shared.acquired = true;
        shared.opens += 1;
        drop(shared);

        let formats = mock_formats();
        self.config = StreamConfig {
            pixel_format: PixelFormat::YUYV,
            size: Size::new(640, 480),
            buffer_count: 0,
            formats,
        };
        Ok(self.config.clone())
    }

    fn close(&mut self) {
        self.stop();
        self.free();
        let mut shared = self.lock();
        shared.acquired = false;
        shared.closes += 1;
    }

    fn configure(
        &mut self,
        size: Size,
        pixel_format: PixelFormat,
        buffer_count: u32,
    ) -> Result<StreamConfig> {
        let (reject, zero_size) = {
            let shared = self.lock();
            (shared.reject_configure, shared.zero_size)
        };
        if reject {
            return Err(Error::backend(libc::EIO, "configuration rejected"));
        }

        let formats = &self.config.formats;
        let pixel_format = if formats.contains(pixel_format) {
            pixel_format
        } else {
            formats.pixel_format(0).unwrap_or(PixelFormat::YUYV)
        };
        let sizes = formats.sizes(pixel_format);
        let size = if zero_size {
            Size::default()
        } else if sizes.contains(&size) {
            size
        } else {
            sizes.first().copied().unwrap_or_default()
        };

        self.config.pixel_format = pixel_format;
        self.config.size = size;
        self.config.buffer_count = buffer_count.min(MAX_BUFFER_COUNT);
        Ok(self.config.clone())
    }

    fn allocate(&mut self, count: u32) -> Result<()> {
        let mut shared = self.lock();
        if shared.fail_allocate {
            return Err(Error::backend(libc::ENOMEM, "allocation failed"));
        }

        let fourcc = format::backend_to_v4l2(self.config.pixel_format);
        let frame_size = format::image_size(fourcc, self.config.size.width, self.config.size.height);
        shared.frame_size = frame_size;
        drop(shared);

        let len = usize::try_from(frame_size).unwrap_or_default();
        self.buffers = (0..count).map(|_| Arc::new(FrameBuffer::new(len))).collect();
        Ok(())
    }

    fn free(&mut self) {
        self.buffers.clear();
    }

    fn buffer(&self, index: u32) -> Option<Arc<FrameBuffer>> {
        let index = usize::try_from(index).ok()?;
        self.buffers.get(index).map(Arc::clone)
    }

    fn queue(&mut self, index: u32) -> Result<()> {
        if usize::try_from(index).map_or(true, |index| index >= self.buffers.len()) {
            return Err(Error::InvalidArgument("buffer index out of range"));
        }
        self.lock().submitted.push(index);
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        self.lock().running = true;
        Ok(())
    }

    fn stop(&mut self) {
        let (handler, cancelled) = {
            let mut shared = self.lock();
            shared.running = false;
            (shared.handler.clone(), std::mem::take(&mut shared.submitted))
        };

        if let Some(handler) = handler {
            for index in cancelled {
                handler(CompletedBuffer {
                    index,
                    bytes_used: 0,
                    timestamp_ns: 0,
                    sequence: 0,
                    status: FrameStatus::Cancelled,
                });
            }
        }
    }

    fn is_running(&self) -> bool {
        self.lock().running
    }

    fn set_completion_handler(&mut self, handler: CompletionHandler) {
        self.lock().handler = Some(handler);
    }
}
