//! Synthetic camera producing test patterns without hardware.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use super::{
    CameraBackend, CameraSource, CaptureLoop, CompletedBuffer, CompletionHandler, FrameBuffer,
    FrameStatus, LoopAction, StreamConfig, SubmissionQueue,
};
use crate::error::{Error, Result};
use crate::format::{self, FourCC, PixelFormat, Size, StreamFormats};

/// Buffers granted when the request asks for none.
const DEFAULT_BUFFER_COUNT: u32 = 4;
/// Upper bound on granted buffers.
const MAX_BUFFER_COUNT: u32 = 32;

/// Test pattern types for synthetic frame generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestPattern {
    /// SMPTE color bars pattern.
    ColorBars,
    /// Horizontal gradient from dark to light.
    Gradient,
    /// Solid color with specified Y, U, V values.
    Solid(u8, u8, u8),
}

/// Settings of a virtual camera.
#[derive(Debug, Clone)]
pub struct VirtualCameraConfig {
    /// Camera name, reported as the card name.
    pub name: String,
    /// Pattern written into every frame.
    pub pattern: TestPattern,
    /// Time between frames.
    pub frame_interval: Duration,
    /// Advertised formats and sizes; the first entry is the default.
    pub formats: StreamFormats,
}

impl Default for VirtualCameraConfig {
    fn default() -> Self {
        Self {
            name: "Virtual Camera".to_owned(),
            pattern: TestPattern::ColorBars,
            frame_interval: Duration::from_millis(33),
            formats: StreamFormats::new(vec![
                (
                    PixelFormat::YUYV,
                    vec![
                        Size::new(640, 480),
                        Size::new(1280, 720),
                        Size::new(320, 240),
                    ],
                ),
                (
                    PixelFormat::NV12,
                    vec![Size::new(640, 480), Size::new(320, 240)],
                ),
            ]),
        }
    }
}

impl VirtualCameraConfig {
    /// Set the camera name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the test pattern.
    #[must_use]
    pub const fn with_pattern(mut self, pattern: TestPattern) -> Self {
        self.pattern = pattern;
        self
    }

    /// Set the frame interval.
    #[must_use]
    pub const fn with_frame_interval(mut self, frame_interval: Duration) -> Self {
        self.frame_interval = frame_interval;
        self
    }

    /// Replace the advertised formats.
    #[must_use]
    pub fn with_formats(mut self, formats: StreamFormats) -> Self {
        self.formats = formats;
        self
    }
}

/// Source connecting to a fresh [`VirtualCamera`].
#[derive(Debug, Clone, Default)]
pub struct VirtualSource {
    config: VirtualCameraConfig,
}

impl VirtualSource {
    /// Create a source for the given settings.
    #[must_use]
    pub const fn new(config: VirtualCameraConfig) -> Self {
        Self { config }
    }
}

impl CameraSource for VirtualSource {
    fn name(&self) -> String {
        self.config.name.clone()
    }

    fn connect(&self) -> Result<Box<dyn CameraBackend>> {
        Ok(Box::new(VirtualCamera::new(self.config.clone())))
    }
}

/// In-process camera writing test patterns into submitted buffers.
pub struct VirtualCamera {
    config: VirtualCameraConfig,
    opened: bool,
    stream: StreamConfig,
    buffers: Vec<Arc<FrameBuffer>>,
    submissions: Arc<SubmissionQueue>,
    handler: Option<CompletionHandler>,
    capture: Option<CaptureLoop>,
}

impl VirtualCamera {
    /// Create a closed camera.
    #[must_use]
    pub fn new(config: VirtualCameraConfig) -> Self {
        Self {
            config,
            opened: false,
            stream: StreamConfig::default(),
            buffers: Vec::new(),
            submissions: Arc::new(SubmissionQueue::new()),
            handler: None,
            capture: None,
        }
    }

    fn validate(&self, size: Size, pixel_format: PixelFormat, buffer_count: u32) -> StreamConfig {
        let formats = &self.config.formats;
        let pixel_format = if formats.contains(pixel_format) {
            pixel_format
        } else {
            formats.pixel_format(0).unwrap_or(PixelFormat::INVALID)
        };

        let sizes = formats.sizes(pixel_format);
        let size = if sizes.contains(&size) {
            size
        } else {
            sizes.first().copied().unwrap_or_default()
        };

        let buffer_count = match buffer_count {
            0 => DEFAULT_BUFFER_COUNT,
            count => count.min(MAX_BUFFER_COUNT),
        };

        StreamConfig {
            pixel_format,
            size,
            buffer_count,
            formats: formats.clone(),
        }
    }

    fn cancel_submissions(&self) {
        let cancelled = self.submissions.take_all();
        let Some(handler) = &self.handler else {
            return;
        };
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

impl CameraBackend for VirtualCamera {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn open(&mut self) -> Result<StreamConfig> {
        if self.opened {
            return Err(Error::Busy("camera already acquired"));
        }
        if self.config.formats.is_empty() {
            return Err(Error::InvalidArgument("camera advertises no formats"));
        }

        self.opened = true;
        self.stream = self.validate(Size::default(), PixelFormat::INVALID, 0);
        info!(camera = %self.config.name, "virtual camera opened");
        Ok(self.stream.clone())
    }

    fn close(&mut self) {
        self.stop();
        self.free();
        self.opened = false;
        info!(camera = %self.config.name, "virtual camera closed");
    }

    fn configure(
        &mut self,
        size: Size,
        pixel_format: PixelFormat,
        buffer_count: u32,
    ) -> Result<StreamConfig> {
        if !self.opened {
            return Err(Error::InvalidArgument("camera not open"));
        }
        if self.is_running() {
            return Err(Error::Busy("camera is streaming"));
        }

        self.stream = self.validate(size, pixel_format, buffer_count);
        debug!(
            format = %self.stream.pixel_format.0,
            size = %self.stream.size,
            buffers = self.stream.buffer_count,
            "virtual camera configured"
        );
        Ok(self.stream.clone())
    }

    fn allocate(&mut self, count: u32) -> Result<()> {
        if self.is_running() {
            return Err(Error::Busy("camera is streaming"));
        }

        let fourcc = format::backend_to_v4l2(self.stream.pixel_format);
        let frame_size = format::image_size(fourcc, self.stream.size.width, self.stream.size.height);
        if frame_size == 0 {
            return Err(Error::InvalidArgument("stream has no frame size"));
        }

        let frame_size =
            usize::try_from(frame_size).map_err(|_| Error::backend(libc::ENOMEM, "frame too large"))?;
        self.buffers = (0..count)
            .map(|_| Arc::new(FrameBuffer::new(frame_size)))
            .collect();
        Ok(())
    }

    fn free(&mut self) {
        self.submissions.take_all();
        self.buffers.clear();
    }

    fn buffer(&self, index: u32) -> Option<Arc<FrameBuffer>> {
        let index = usize::try_from(index).ok()?;
        self.buffers.get(index).map(Arc::clone)
    }

    fn queue(&mut self, index: u32) -> Result<()> {
        if self.buffer(index).is_none() {
            return Err(Error::InvalidArgument("buffer index out of range"));
        }
        self.submissions.push(index);
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        if self.capture.is_some() {
            return Ok(());
        }
        if self.buffers.is_empty() {
            return Err(Error::InvalidArgument("no buffers allocated"));
        }

        let worker = PatternWorker {
            buffers: self.buffers.clone(),
            submissions: Arc::clone(&self.submissions),
            handler: self.handler.clone(),
            pattern: self.config.pattern,
            frame_interval: self.config.frame_interval,
            fourcc: format::backend_to_v4l2(self.stream.pixel_format),
            size: self.stream.size,
            sequence: 0,
        };

        let name = format!("{}-capture", self.config.name);
        self.capture = Some(CaptureLoop::start(
            &name,
            move || Ok(worker),
            PatternWorker::step,
        )?);
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(mut capture) = self.capture.take() {
            capture.stop();
        }
        self.cancel_submissions();
    }

    fn is_running(&self) -> bool {
        self.capture.is_some()
    }

    fn set_completion_handler(&mut self, handler: CompletionHandler) {
        self.handler = Some(handler);
    }
}

struct PatternWorker {
    buffers: Vec<Arc<FrameBuffer>>,
    submissions: Arc<SubmissionQueue>,
    handler: Option<CompletionHandler>,
    pattern: TestPattern,
    frame_interval: Duration,
    fourcc: FourCC,
    size: Size,
    sequence: u32,
}

impl PatternWorker {
    const POLL_INTERVAL: Duration = Duration::from_millis(10);

    fn step(&mut self, stop: &AtomicBool) -> LoopAction {
        let Some(index) = self.submissions.pop_timeout(Self::POLL_INTERVAL) else {
            return LoopAction::Continue;
        };

        thread::sleep(self.frame_interval);
        if stop.load(Ordering::SeqCst) {
            self.complete(index, 0, FrameStatus::Cancelled);
            return LoopAction::Stop;
        }

        let Some(buffer) = usize::try_from(index)
            .ok()
            .and_then(|slot| self.buffers.get(slot))
        else {
            self.complete(index, 0, FrameStatus::Error);
            return LoopAction::Continue;
        };

        let bytes_used = buffer.write_with(|data| {
            fill_frame(data, self.fourcc, self.size, self.pattern);
            u32::try_from(data.len()).unwrap_or(u32::MAX)
        });
        self.complete(index, bytes_used, FrameStatus::Success);
        LoopAction::Continue
    }

    fn complete(&mut self, index: u32, bytes_used: u32, status: FrameStatus) {
        let sequence = self.sequence;
        if status != FrameStatus::Cancelled {
            self.sequence = self.sequence.wrapping_add(1);
        }
        if let Some(handler) = &self.handler {
            handler(CompletedBuffer {
                index,
                bytes_used,
                timestamp_ns: monotonic_ns(),
                sequence,
                status,
            });
        }
    }
}

/// Nanoseconds on a process-wide monotonic clock.
fn monotonic_ns() -> u64 {
    static ORIGIN: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
    let origin = ORIGIN.get_or_init(Instant::now);
    u64::try_from(origin.elapsed().as_nanos()).unwrap_or(u64::MAX)
}

/// Write `pattern` into a frame. Only packed YUYV carries the pattern;
/// other layouts are filled with mid gray.
fn fill_frame(data: &mut [u8], fourcc: FourCC, size: Size, pattern: TestPattern) {
    if fourcc != FourCC::YUYV {
        data.fill(128);
        return;
    }

    match pattern {
        TestPattern::ColorBars => generate_color_bars(data, size.width),
        TestPattern::Gradient => generate_gradient(data, size.width),
        TestPattern::Solid(y, u, v) => generate_solid(data, y, u, v),
    }
}

/// YUYV values of the eight SMPTE bars: white, yellow, cyan, green,
/// magenta, red, blue, black.
const COLOR_BARS: [(u8, u8, u8); 8] = [
    (235, 128, 128),
    (210, 16, 146),
    (170, 166, 16),
    (145, 54, 34),
    (106, 202, 222),
    (81, 90, 240),
    (41, 240, 110),
    (16, 128, 128),
];

fn yuyv_rows(data: &mut [u8], width: u32) -> impl Iterator<Item = &mut [u8]> {
    let row_bytes = usize::try_from(width).unwrap_or(0).saturating_mul(2).max(4);
    data.chunks_exact_mut(row_bytes)
}

fn generate_color_bars(data: &mut [u8], width: u32) {
    let bar_width = (width / 8).max(1);

    for row in yuyv_rows(data, width) {
        for (pair, pixel) in (0u32..).zip(row.chunks_exact_mut(4)) {
            let bar = usize::try_from((pair * 2) / bar_width).unwrap_or(7).min(7);
            let (y, u, v) = COLOR_BARS.get(bar).copied().unwrap_or((16, 128, 128));
            pixel.copy_from_slice(&[y, u, y, v]);
        }
    }
}

fn generate_gradient(data: &mut [u8], width: u32) {
    let width = width.max(1);

    for row in yuyv_rows(data, width) {
        for (pair, pixel) in (0u32..).zip(row.chunks_exact_mut(4)) {
            let luma = u8::try_from((pair * 2 * 255) / width).unwrap_or(u8::MAX);
            pixel.copy_from_slice(&[luma, 128, luma, 128]);
        }
    }
}

fn generate_solid(data: &mut [u8], y: u8, u: u8, v: u8) {
    for pixel in data.chunks_exact_mut(4) {
        pixel.copy_from_slice(&[y, u, y, v]);
    }
}
