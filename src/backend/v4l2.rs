//! Backend over a kernel video capture device, built on the `v4l` crate.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};
use v4l::buffer::Type;
use v4l::capability::Flags;
use v4l::framesize::FrameSizeEnum;
use v4l::io::mmap::Stream;
use v4l::io::traits::CaptureStream as V4lCaptureStream;
use v4l::video::Capture;
use v4l::Device;

use super::{
    CameraBackend, CameraSource, CaptureLoop, CompletedBuffer, CompletionHandler, FrameBuffer,
    FrameStatus, LoopAction, StreamConfig, SubmissionQueue,
};
use crate::error::{Error, Result};
use crate::format::{self, FourCC, PixelFormat, Size, StreamFormats};

const DEFAULT_BUFFER_COUNT: u32 = 4;
const MAX_BUFFER_COUNT: u32 = 32;

/// Source for the kernel device `/dev/video<index>`.
#[derive(Debug, Clone)]
pub struct V4l2Source {
    index: usize,
    card: String,
}

impl V4l2Source {
    /// Open the device once to check it can capture and stream.
    pub fn probe(index: usize) -> Result<Self> {
        let device = Device::new(index)?;
        let caps = device.query_caps()?;

        if !caps.capabilities.contains(Flags::VIDEO_CAPTURE) {
            return Err(Error::InvalidArgument("device cannot capture video"));
        }
        if !caps.capabilities.contains(Flags::STREAMING) {
            return Err(Error::InvalidArgument("device does not support streaming"));
        }

        info!(index, driver = %caps.driver, card = %caps.card, "probed capture device");
        Ok(Self {
            index,
            card: caps.card,
        })
    }

    /// Kernel device index.
    pub const fn index(&self) -> usize {
        self.index
    }
}

impl CameraSource for V4l2Source {
    fn name(&self) -> String {
        self.card.clone()
    }

    fn connect(&self) -> Result<Box<dyn CameraBackend>> {
        Ok(Box::new(V4l2Camera::new(self.index, self.card.clone())))
    }
}

/// Camera backed by a kernel capture device.
///
/// Each submitted buffer is filled by copying the next frame the kernel
/// delivers on a capture thread that owns its own mmap stream.
pub struct V4l2Camera {
    index: usize,
    card: String,
    device: Option<Device>,
    stream: StreamConfig,
    buffers: Vec<Arc<FrameBuffer>>,
    submissions: Arc<SubmissionQueue>,
    handler: Option<CompletionHandler>,
    capture: Option<CaptureLoop>,
}

impl V4l2Camera {
    /// Create a closed camera for `/dev/video<index>`.
    #[must_use]
    pub fn new(index: usize, card: String) -> Self {
        Self {
            index,
            card,
            device: None,
            stream: StreamConfig::default(),
            buffers: Vec::new(),
            submissions: Arc::new(SubmissionQueue::new()),
            handler: None,
            capture: None,
        }
    }

    fn device(&self) -> Result<&Device> {
        self.device
            .as_ref()
            .ok_or(Error::InvalidArgument("camera not open"))
    }

    fn current_config(&self, buffer_count: u32) -> Result<StreamConfig> {
        let device = self.device()?;
        let fmt = device.format()?;
        Ok(StreamConfig {
            pixel_format: format::v4l2_to_backend(fmt.fourcc.into()),
            size: Size::new(fmt.width, fmt.height),
            buffer_count,
            formats: self.stream.formats.clone(),
        })
    }

    fn frame_size(&self) -> Result<usize> {
        let fmt = self.device()?.format()?;
        usize::try_from(fmt.size).map_err(|_| Error::backend(libc::ENOMEM, "frame too large"))
    }
}

/// Formats the device advertises that have a backend equivalent, with
/// their discrete frame sizes.
fn enumerate_formats(device: &Device) -> StreamFormats {
    let mut entries = Vec::new();

    for desc in device.enum_formats().unwrap_or_default() {
        let pixel_format = format::v4l2_to_backend(desc.fourcc.into());
        if !pixel_format.is_valid() {
            debug!(fourcc = %FourCC::from(desc.fourcc), "skipping format without backend equivalent");
            continue;
        }

        // Stepwise sizes are not advertised.
        let sizes: Vec<Size> = device
            .enum_framesizes(desc.fourcc)
            .unwrap_or_default()
            .into_iter()
            .filter_map(|framesize| match framesize.size {
                FrameSizeEnum::Discrete(discrete) => {
                    Some(Size::new(discrete.width, discrete.height))
                }
                FrameSizeEnum::Stepwise(_) => None,
            })
            .collect();

        if !sizes.is_empty() {
            entries.push((pixel_format, sizes));
        }
    }

    StreamFormats::new(entries)
}

impl CameraBackend for V4l2Camera {
    fn name(&self) -> &str {
        &self.card
    }

    fn open(&mut self) -> Result<StreamConfig> {
        if self.device.is_some() {
            return Err(Error::Busy("camera already acquired"));
        }

        let device = Device::new(self.index)?;
        self.stream.formats = enumerate_formats(&device);
        self.device = Some(device);

        let config = self.current_config(DEFAULT_BUFFER_COUNT)?;
        info!(index = self.index, card = %self.card, "capture device opened");
        self.stream = config.clone();
        Ok(config)
    }

    fn close(&mut self) {
        self.stop();
        self.free();
        self.device = None;
        info!(index = self.index, "capture device closed");
    }

    fn configure(
        &mut self,
        size: Size,
        pixel_format: PixelFormat,
        buffer_count: u32,
    ) -> Result<StreamConfig> {
        if self.is_running() {
            return Err(Error::Busy("camera is streaming"));
        }

        let device = self.device()?;
        let mut fmt = device.format()?;
        fmt.width = size.width;
        fmt.height = size.height;
        fmt.fourcc = format::backend_to_v4l2(pixel_format).into();
        let fmt = device.set_format(&fmt)?;
        debug!(width = fmt.width, height = fmt.height, fourcc = %fmt.fourcc, "device format set");

        let buffer_count = match buffer_count {
            0 => DEFAULT_BUFFER_COUNT,
            count => count.min(MAX_BUFFER_COUNT),
        };
        self.stream = self.current_config(buffer_count)?;
        Ok(self.stream.clone())
    }

    fn allocate(&mut self, count: u32) -> Result<()> {
        if self.is_running() {
            return Err(Error::Busy("camera is streaming"));
        }

        let frame_size = self.frame_size()?;
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

        let index = self.index;
        let kernel_buffers = u32::try_from(self.buffers.len()).unwrap_or(MAX_BUFFER_COUNT);
        let worker = CopyWorker {
            buffers: self.buffers.clone(),
            submissions: Arc::clone(&self.submissions),
            handler: self.handler.clone(),
        };

        self.capture = Some(CaptureLoop::start(
            &format!("video{index}-capture"),
            move || {
                let device = Device::new(index)?;
                let stream = Stream::with_buffers(&device, Type::VideoCapture, kernel_buffers)?;
                Ok(stream)
            },
            move |stream: &mut Stream<'static>, stop: &AtomicBool| worker.step(stream, stop),
        )?);
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(mut capture) = self.capture.take() {
            capture.stop();
        }

        let cancelled = self.submissions.take_all();
        if let Some(handler) = &self.handler {
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
        self.capture.is_some()
    }

    fn set_completion_handler(&mut self, handler: CompletionHandler) {
        self.handler = Some(handler);
    }
}

struct CopyWorker {
    buffers: Vec<Arc<FrameBuffer>>,
    submissions: Arc<SubmissionQueue>,
    handler: Option<CompletionHandler>,
}

impl CopyWorker {
    const POLL_INTERVAL: Duration = Duration::from_millis(10);

    fn step(&self, stream: &mut Stream<'static>, stop: &AtomicBool) -> LoopAction {
        let Some(index) = self.submissions.pop_timeout(Self::POLL_INTERVAL) else {
            return LoopAction::Continue;
        };

        let completion = match V4lCaptureStream::next(stream) {
            Ok((frame, meta)) => {
                let target = usize::try_from(index)
                    .ok()
                    .and_then(|slot| self.buffers.get(slot));
                let copied = target.map_or(0, |buffer| {
                    buffer.write_with(|data| {
                        let len = data.len().min(frame.len());
                        if let (Some(dst), Some(src)) = (data.get_mut(..len), frame.get(..len)) {
                            dst.copy_from_slice(src);
                        }
                        len
                    })
                });

                // Kernel timestamps are never negative in practice.
                #[allow(clippy::cast_sign_loss)]
                let timestamp_ns = (meta.timestamp.sec.max(0) as u64)
                    .saturating_mul(1_000_000_000)
                    .saturating_add((meta.timestamp.usec.max(0) as u64).saturating_mul(1_000));

                CompletedBuffer {
                    index,
                    bytes_used: u32::try_from(copied).unwrap_or(u32::MAX),
                    timestamp_ns,
                    sequence: meta.sequence,
                    status: if target.is_some() {
                        FrameStatus::Success
                    } else {
                        FrameStatus::Error
                    },
                }
            }
            Err(err) => {
                warn!(index, error = %err, "frame capture failed");
                CompletedBuffer {
                    index,
                    bytes_used: 0,
                    timestamp_ns: 0,
                    sequence: 0,
                    status: if stop.load(Ordering::SeqCst) {
                        FrameStatus::Cancelled
                    } else {
                        FrameStatus::Error
                    },
                }
            }
        };

        if let Some(handler) = &self.handler {
            handler(completion);
        }
        LoopAction::Continue
    }
}
