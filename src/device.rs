//! Emulated V4L2 capture device.
//!
//! [`Device`] holds the state shared by every handle opened on one camera:
//! the negotiated format, the buffer table, the mapping table, the
//! ownership token and the open-handle table. All of it sits behind one
//! mutex; every ioctl handler runs with that mutex held. The only place a
//! caller sleeps is a blocking dequeue, which releases the mutex while it
//! waits on the [`CompletionQueue`].

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, error, info, warn};

use crate::abi::{
    kernel_version, BufferDesc, BufferFlags, Capability, CapabilityFlags, FmtDesc,
    FrameSizeEnum, InputDesc, Priority, RequestBuffers, Timeval, V4l2Format,
    BUF_CAP_SUPPORTS_MMAP, BUF_TYPE_VIDEO_CAPTURE, FIELD_NONE, FMT_FLAG_COMPRESSED,
    FRMSIZE_TYPE_DISCRETE, INPUT_TYPE_CAMERA, MEMORY_MMAP,
};
use crate::backend::{CameraBackend, CameraSource, FrameStatus, StreamConfig};
use crate::completion::{CompletionQueue, EventCounter};
use crate::error::{Error, Result};
use crate::format::{self, PixFormat};
use crate::handle::{Handle, HandleId};
use crate::memory::{MemoryMapper, Protection};

/// Static identity an emulated device reports through `VIDIOC_QUERYCAP`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    /// Driver name.
    pub driver: String,
    /// Kernel version as `(major, minor, patch)`.
    pub version: (u8, u8, u8),
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            driver: "v4l2-compat".to_owned(),
            version: (5, 2, 0),
        }
    }
}

struct FileState {
    priority: Priority,
    nonblocking: bool,
    events: Arc<EventCounter>,
}

/// Outcome of one dequeue attempt.
enum Dequeue {
    Ready,
    Pending { generation: u64, nonblocking: bool },
}

/// State shared by every handle of one device.
pub struct DeviceState {
    capability: Capability,
    refcount: u32,
    backend: Option<Box<dyn CameraBackend>>,
    stream: StreamConfig,
    format: PixFormat,
    sizeimage: u32,
    buffer_count: u32,
    buffers: Vec<BufferDesc>,
    mmaps: BTreeMap<usize, u32>,
    current_buf: u32,
    owner: Option<HandleId>,
    files: BTreeMap<HandleId, FileState>,
    completions: Arc<CompletionQueue>,
    mapper: Arc<dyn MemoryMapper>,
}

const fn validate_buffer_type(type_: u32) -> Result<()> {
    if type_ == BUF_TYPE_VIDEO_CAPTURE {
        Ok(())
    } else {
        Err(Error::InvalidArgument("unsupported buffer type"))
    }
}

const fn validate_memory_type(memory: u32) -> Result<()> {
    if memory == MEMORY_MMAP {
        Ok(())
    } else {
        Err(Error::InvalidArgument("unsupported memory type"))
    }
}

impl DeviceState {
    fn backend_mut(&mut self) -> Result<&mut Box<dyn CameraBackend>> {
        self.backend
            .as_mut()
            .ok_or(Error::InvalidArgument("camera not open"))
    }

    fn is_running(&self) -> bool {
        self.backend.as_ref().is_some_and(|backend| backend.is_running())
    }

    fn file(&self, id: HandleId) -> Result<&FileState> {
        self.files
            .get(&id)
            .ok_or(Error::NotPermitted("handle is closed"))
    }

    /// Highest priority among open handles.
    fn max_priority(&self) -> Priority {
        self.files
            .values()
            .map(|file| file.priority)
            .max()
            .unwrap_or_default()
    }

    fn check_priority(&self, id: HandleId) -> Result<()> {
        if self.file(id)?.priority < self.max_priority() {
            return Err(Error::Busy("a handle holds a higher priority"));
        }
        Ok(())
    }

    fn has_ownership(&self, id: HandleId) -> bool {
        self.owner == Some(id)
    }

    fn owned_by_other(&self, id: HandleId) -> bool {
        self.owner.is_some_and(|owner| owner != id)
    }

    fn acquire(&mut self, id: HandleId) -> Result<()> {
        if self.has_ownership(id) {
            return Ok(());
        }
        if self.owner.is_some() {
            return Err(Error::Busy("device owned by another handle"));
        }

        let events = Arc::clone(&self.file(id)?.events);
        self.completions.bind(events);
        self.owner = Some(id);
        debug!(handle = %id, "ownership acquired");
        Ok(())
    }

    fn release(&mut self, id: HandleId) {
        if !self.has_ownership(id) {
            return;
        }
        self.completions.unbind();
        if let Ok(file) = self.file(id) {
            file.events.reset();
        }
        self.owner = None;
        debug!(handle = %id, "ownership released");
    }

    /// Adopt a backend configuration as the current format.
    fn set_format_from_config(&mut self, config: StreamConfig) {
        let fourcc = format::backend_to_v4l2(config.pixel_format);
        self.format = PixFormat::from_layout(fourcc, config.size);
        self.sizeimage = self.format.sizeimage;
        self.stream = config;
    }

    /// Move pending completions into the buffer table and return the
    /// completion generation observed while draining.
    fn update_buffers(&mut self) -> u64 {
        let (completed, generation) = self.completions.drain();

        for completion in completed {
            let Some(slot) = usize::try_from(completion.index)
                .ok()
                .and_then(|index| self.buffers.get_mut(index))
            else {
                debug!(index = completion.index, "completion for unknown buffer");
                continue;
            };
            if !slot.flags.contains(BufferFlags::QUEUED) {
                debug!(index = completion.index, "completion for buffer that is not queued");
                continue;
            }

            match completion.status {
                FrameStatus::Success => {
                    slot.bytesused = completion.bytes_used;
                    slot.timestamp = Timeval::from_nanos(completion.timestamp_ns);
                    slot.sequence = completion.sequence;
                    slot.field = FIELD_NONE;
                    slot.flags.insert(BufferFlags::DONE);
                }
                FrameStatus::Error => slot.flags.insert(BufferFlags::ERROR),
                FrameStatus::Cancelled => {}
            }
        }

        self.rearm_events();
        generation
    }

    /// Bring the owner's readiness count in line with the buffers that are
    /// ready to dequeue.
    fn rearm_events(&self) {
        let ready = self
            .buffers
            .iter()
            .filter(|slot| slot.flags.intersects(BufferFlags::DONE | BufferFlags::ERROR))
            .count();
        self.completions.rearm(u64::try_from(ready).unwrap_or(u64::MAX));
    }

    fn free_buffers(&mut self) {
        if let Some(backend) = self.backend.as_mut() {
            backend.free();
        }
        self.buffers.clear();
        self.buffer_count = 0;
    }

    fn stream_off_locked(&mut self) {
        if let Some(backend) = self.backend.as_mut() {
            if backend.is_running() {
                backend.stop();
                info!(camera = %self.capability.card, "stream stopped");
            }
        }
        self.completions.discard();
        for buffer in &mut self.buffers {
            buffer
                .flags
                .remove(BufferFlags::QUEUED | BufferFlags::DONE | BufferFlags::ERROR);
        }
        self.rearm_events();
        self.completions.wake_all();
    }

    pub(crate) fn vidioc_querycap(&mut self, id: HandleId, arg: &mut Capability) -> Result<()> {
        debug!(handle = %id, "servicing vidioc_querycap");
        arg.clone_from(&self.capability);
        Ok(())
    }

    pub(crate) fn vidioc_enum_framesizes(
        &mut self,
        id: HandleId,
        arg: &mut FrameSizeEnum,
    ) -> Result<()> {
        debug!(handle = %id, index = arg.index, "servicing vidioc_enum_framesizes");

        let pixel_format = format::v4l2_to_backend(arg.pixel_format);
        let size = usize::try_from(arg.index)
            .ok()
            .and_then(|index| self.stream.formats.sizes(pixel_format).get(index).copied())
            .ok_or(Error::InvalidArgument("frame size index out of range"))?;

        arg.type_ = FRMSIZE_TYPE_DISCRETE;
        arg.width = size.width;
        arg.height = size.height;
        Ok(())
    }

    pub(crate) fn vidioc_enum_fmt(&mut self, id: HandleId, arg: &mut FmtDesc) -> Result<()> {
        debug!(handle = %id, index = arg.index, "servicing vidioc_enum_fmt");
        validate_buffer_type(arg.type_)?;

        let pixel_format = usize::try_from(arg.index)
            .ok()
            .and_then(|index| self.stream.formats.pixel_format(index))
            .ok_or(Error::InvalidArgument("format index out of range"))?;

        let fourcc = format::backend_to_v4l2(pixel_format);
        arg.flags = if format::is_compressed(fourcc) {
            FMT_FLAG_COMPRESSED
        } else {
            0
        };
        format::description(fourcc).clone_into(&mut arg.description);
        arg.pixelformat = fourcc;
        Ok(())
    }

    pub(crate) fn vidioc_g_fmt(&mut self, id: HandleId, arg: &mut V4l2Format) -> Result<()> {
        debug!(handle = %id, "servicing vidioc_g_fmt");
        validate_buffer_type(arg.type_)?;
        arg.pix.clone_from(&self.format);
        Ok(())
    }

    /// Replace the request with the closest advertised format and derive
    /// every layout field.
    fn try_format(&self, arg: &mut V4l2Format) -> Result<()> {
        let formats = &self.stream.formats;

        let mut pixel_format = format::v4l2_to_backend(arg.pix.pixelformat);
        if !formats.contains(pixel_format) {
            pixel_format = formats
                .pixel_format(0)
                .ok_or(Error::InvalidArgument("camera advertises no formats"))?;
        }

        let sizes = formats.sizes(pixel_format);
        let mut size = arg.pix.size();
        if !sizes.contains(&size) {
            size = sizes
                .first()
                .copied()
                .ok_or(Error::InvalidArgument("format advertises no sizes"))?;
        }

        arg.pix = PixFormat::from_layout(format::backend_to_v4l2(pixel_format), size);
        Ok(())
    }

    pub(crate) fn vidioc_s_fmt(&mut self, id: HandleId, arg: &mut V4l2Format) -> Result<()> {
        debug!(handle = %id, "servicing vidioc_s_fmt");
        validate_buffer_type(arg.type_)?;
        self.check_priority(id)?;
        if self.owned_by_other(id) {
            return Err(Error::Busy("device owned by another handle"));
        }

        self.try_format(arg)?;

        let size = arg.pix.size();
        let pixel_format = format::v4l2_to_backend(arg.pix.pixelformat);
        let buffer_count = self.buffer_count;
        let config = self
            .backend_mut()?
            .configure(size, pixel_format, buffer_count)
            .map_err(|err| {
                warn!(handle = %id, error = %err, "camera rejected format");
                Error::InvalidArgument("camera rejected format")
            })?;

        let fourcc = format::backend_to_v4l2(config.pixel_format);
        if format::image_size(fourcc, config.size.width, config.size.height) == 0 {
            return Err(Error::InvalidArgument("format has no frame size"));
        }

        self.set_format_from_config(config);
        arg.pix.clone_from(&self.format);
        self.acquire(id)
    }

    pub(crate) fn vidioc_try_fmt(&mut self, id: HandleId, arg: &mut V4l2Format) -> Result<()> {
        debug!(handle = %id, "servicing vidioc_try_fmt");
        validate_buffer_type(arg.type_)?;
        self.try_format(arg)
    }

    pub(crate) fn vidioc_g_priority(&mut self, id: HandleId, arg: &mut u32) -> Result<()> {
        debug!(handle = %id, "servicing vidioc_g_priority");
        *arg = self.max_priority() as u32;
        Ok(())
    }

    pub(crate) fn vidioc_s_priority(&mut self, id: HandleId, arg: &mut u32) -> Result<()> {
        debug!(handle = %id, priority = *arg, "servicing vidioc_s_priority");

        let priority =
            Priority::try_from(*arg).map_err(|_| Error::InvalidArgument("priority out of range"))?;
        self.check_priority(id)?;

        if let Some(file) = self.files.get_mut(&id) {
            file.priority = priority;
        }
        Ok(())
    }

    pub(crate) fn vidioc_enuminput(&mut self, id: HandleId, arg: &mut InputDesc) -> Result<()> {
        debug!(handle = %id, index = arg.index, "servicing vidioc_enuminput");
        if arg.index != 0 {
            return Err(Error::InvalidArgument("input index out of range"));
        }

        "Camera".clone_into(&mut arg.name);
        arg.type_ = INPUT_TYPE_CAMERA;
        Ok(())
    }

    pub(crate) fn vidioc_g_input(&mut self, id: HandleId, arg: &mut u32) -> Result<()> {
        debug!(handle = %id, "servicing vidioc_g_input");
        *arg = 0;
        Ok(())
    }

    pub(crate) fn vidioc_s_input(&mut self, id: HandleId, arg: &mut u32) -> Result<()> {
        debug!(handle = %id, input = *arg, "servicing vidioc_s_input");
        if *arg != 0 {
            return Err(Error::InvalidArgument("input index out of range"));
        }
        Ok(())
    }

    pub(crate) fn vidioc_reqbufs(&mut self, id: HandleId, arg: &mut RequestBuffers) -> Result<()> {
        debug!(handle = %id, count = arg.count, "servicing vidioc_reqbufs");
        validate_buffer_type(arg.type_)?;
        validate_memory_type(arg.memory)?;
        self.check_priority(id)?;
        if self.owned_by_other(id) {
            return Err(Error::Busy("device owned by another handle"));
        }

        arg.capabilities = BUF_CAP_SUPPORTS_MMAP;

        if !self.mmaps.is_empty() {
            return Err(Error::Busy("buffers are still mapped"));
        }
        if self.is_running() {
            return Err(Error::Busy("stream is running"));
        }

        if arg.count == 0 {
            self.free_buffers();
            self.release(id);
            return Ok(());
        }

        if self.buffer_count > 0 {
            self.free_buffers();
        }

        let size = self.format.size();
        let pixel_format = format::v4l2_to_backend(self.format.pixelformat);
        let requested = arg.count;
        let config = self
            .backend_mut()?
            .configure(size, pixel_format, requested)
            .map_err(|err| {
                warn!(handle = %id, error = %err, "camera rejected buffer configuration");
                Error::InvalidArgument("camera rejected buffer configuration")
            })?;

        let granted = config.buffer_count;
        let fourcc = format::backend_to_v4l2(config.pixel_format);
        if format::image_size(fourcc, config.size.width, config.size.height) == 0 {
            return Err(Error::InvalidArgument("format has no frame size"));
        }
        self.set_format_from_config(config);

        if let Err(err) = self.backend_mut()?.allocate(granted) {
            error!(handle = %id, error = %err, "buffer allocation failed");
            arg.count = 0;
            return Err(err);
        }

        let sizeimage = self.sizeimage;
        self.buffers = (0..granted)
            .map(|index| BufferDesc {
                flags: BufferFlags::TIMESTAMP_MONOTONIC,
                length: sizeimage,
                offset: index.saturating_mul(sizeimage),
                ..BufferDesc::mmap(index)
            })
            .collect();
        self.buffer_count = granted;
        arg.count = granted;

        info!(handle = %id, requested, granted, sizeimage, "buffers allocated");
        self.acquire(id)
    }

    pub(crate) fn vidioc_querybuf(&mut self, id: HandleId, arg: &mut BufferDesc) -> Result<()> {
        debug!(handle = %id, index = arg.index, "servicing vidioc_querybuf");
        validate_buffer_type(arg.type_)?;
        if arg.index >= self.buffer_count {
            return Err(Error::InvalidArgument("buffer index out of range"));
        }

        self.update_buffers();
        let slot = usize::try_from(arg.index)
            .ok()
            .and_then(|index| self.buffers.get(index))
            .ok_or(Error::NoSuchEntry("buffer slot"))?;
        arg.clone_from(slot);
        Ok(())
    }

    pub(crate) fn vidioc_qbuf(&mut self, id: HandleId, arg: &mut BufferDesc) -> Result<()> {
        debug!(handle = %id, index = arg.index, "servicing vidioc_qbuf");

        let slot_index = usize::try_from(arg.index)
            .ok()
            .filter(|_| arg.index < self.buffer_count)
            .ok_or(Error::InvalidArgument("buffer index out of range"))?;
        let queued = self
            .buffers
            .get(slot_index)
            .ok_or(Error::NoSuchEntry("buffer slot"))?
            .flags
            .contains(BufferFlags::QUEUED);
        if queued {
            return Err(Error::InvalidArgument("buffer already queued"));
        }
        if !self.has_ownership(id) {
            return Err(Error::Busy("handle does not own the device"));
        }
        validate_buffer_type(arg.type_)?;
        validate_memory_type(arg.memory)?;

        self.backend_mut()?.queue(arg.index)?;

        let slot = self
            .buffers
            .get_mut(slot_index)
            .ok_or(Error::NoSuchEntry("buffer slot"))?;
        slot.flags.insert(BufferFlags::QUEUED);
        arg.flags = slot.flags;
        Ok(())
    }

    fn try_dequeue(&mut self, id: HandleId, arg: &mut BufferDesc) -> Result<Dequeue> {
        let nonblocking = self.file(id)?.nonblocking;
        if arg.index >= self.buffer_count {
            return Err(Error::InvalidArgument("buffer index out of range"));
        }
        if !self.has_ownership(id) {
            return Err(Error::Busy("handle does not own the device"));
        }
        if !self.is_running() {
            return Err(Error::InvalidArgument("stream is not running"));
        }
        validate_buffer_type(arg.type_)?;
        validate_memory_type(arg.memory)?;

        let generation = self.update_buffers();

        let sizeimage = self.sizeimage;
        let slot = usize::try_from(self.current_buf)
            .ok()
            .and_then(|index| self.buffers.get_mut(index))
            .ok_or(Error::NoSuchEntry("buffer slot"))?;
        if !slot.flags.intersects(BufferFlags::DONE | BufferFlags::ERROR) {
            return Ok(Dequeue::Pending {
                generation,
                nonblocking,
            });
        }

        let mut desc = slot.clone();
        desc.flags.remove(BufferFlags::QUEUED | BufferFlags::DONE);
        desc.length = sizeimage;
        slot.flags
            .remove(BufferFlags::QUEUED | BufferFlags::DONE | BufferFlags::ERROR);
        *arg = desc;

        self.current_buf = (self.current_buf + 1) % self.buffer_count.max(1);

        if let Ok(file) = self.file(id) {
            if !file.events.consume() {
                warn!(handle = %id, "no pending event to consume");
            }
        }
        Ok(Dequeue::Ready)
    }

    pub(crate) fn vidioc_streamon(&mut self, id: HandleId, arg: &mut u32) -> Result<()> {
        debug!(handle = %id, "servicing vidioc_streamon");
        if self.buffer_count == 0 {
            return Err(Error::InvalidArgument("no buffers requested"));
        }
        validate_buffer_type(*arg)?;
        self.check_priority(id)?;
        if !self.has_ownership(id) {
            return Err(Error::Busy("handle does not own the device"));
        }
        if self.is_running() {
            return Ok(());
        }

        self.current_buf = 0;
        self.backend_mut()?.start()?;
        info!(handle = %id, camera = %self.capability.card, "stream started");
        Ok(())
    }

    pub(crate) fn vidioc_streamoff(&mut self, id: HandleId, arg: &mut u32) -> Result<()> {
        debug!(handle = %id, "servicing vidioc_streamoff");
        validate_buffer_type(*arg)?;
        self.check_priority(id)?;
        if self.owned_by_other(id) {
            return Err(Error::Busy("device owned by another handle"));
        }
        self.stream_off_locked();
        Ok(())
    }

    fn mmap(&mut self, id: HandleId, length: usize, prot: Protection, offset: u64) -> Result<usize> {
        debug!(handle = %id, length, offset, "servicing mmap");

        if prot != Protection::READ | Protection::WRITE {
            return Err(Error::InvalidArgument("mapping must be readable and writable"));
        }
        if self.sizeimage == 0 {
            return Err(Error::InvalidArgument("no frame size negotiated"));
        }

        let sizeimage = u64::from(self.sizeimage);
        let index = u32::try_from(offset / sizeimage)
            .ok()
            .filter(|index| *index < self.buffer_count && offset % sizeimage == 0)
            .ok_or(Error::InvalidArgument("offset does not name a buffer"))?;
        if u64::try_from(length).ok() != Some(sizeimage) {
            return Err(Error::InvalidArgument("length must equal the frame size"));
        }

        let buffer = self
            .backend
            .as_ref()
            .and_then(|backend| backend.buffer(index))
            .ok_or(Error::InvalidArgument("buffer cannot be exported"))?;
        let addr = self.mapper.map(&buffer, length, prot)?;

        if let Some(slot) = usize::try_from(index)
            .ok()
            .and_then(|slot| self.buffers.get_mut(slot))
        {
            slot.flags.insert(BufferFlags::MAPPED);
        }
        self.mmaps.insert(addr, index);
        Ok(addr)
    }

    fn munmap(&mut self, addr: usize, length: usize) -> Result<()> {
        debug!(addr, length, "servicing munmap");

        let index = *self
            .mmaps
            .get(&addr)
            .ok_or(Error::InvalidArgument("address is not mapped"))?;
        if u64::try_from(length).ok() != Some(u64::from(self.sizeimage)) {
            return Err(Error::InvalidArgument("length must equal the frame size"));
        }

        if let Err(err) = self.mapper.unmap(addr, length) {
            error!(addr, error = %err, "failed to unmap buffer");
        }

        if let Some(slot) = usize::try_from(index)
            .ok()
            .and_then(|slot| self.buffers.get_mut(slot))
        {
            slot.flags.remove(BufferFlags::MAPPED);
        }
        self.mmaps.remove(&addr);
        Ok(())
    }

    /// Whether `addr` is a live mapping of this device.
    fn is_mapped(&self, addr: usize) -> bool {
        self.mmaps.contains_key(&addr)
    }
}

/// An emulated capture device backed by one camera.
pub struct Device {
    index: u32,
    source: Arc<dyn CameraSource>,
    completions: Arc<CompletionQueue>,
    state: Mutex<DeviceState>,
    next_handle: AtomicU64,
}

impl Device {
    /// Create a device for `source`. The camera is not touched until the
    /// first handle opens.
    pub fn new(
        index: u32,
        source: Arc<dyn CameraSource>,
        mapper: Arc<dyn MemoryMapper>,
        config: &DeviceConfig,
    ) -> Self {
        let (major, minor, patch) = config.version;
        let device_caps = CapabilityFlags::VIDEO_CAPTURE
            | CapabilityFlags::STREAMING
            | CapabilityFlags::EXT_PIX_FORMAT;
        let capability = Capability {
            driver: config.driver.clone(),
            card: source.name(),
            bus_info: format!("{}:{index}", config.driver),
            version: kernel_version(major, minor, patch),
            capabilities: device_caps | CapabilityFlags::DEVICE_CAPS,
            device_caps,
        };

        let completions = Arc::new(CompletionQueue::new());
        Self {
            index,
            source,
            completions: Arc::clone(&completions),
            state: Mutex::new(DeviceState {
                capability,
                refcount: 0,
                backend: None,
                stream: StreamConfig::default(),
                format: PixFormat::default(),
                sizeimage: 0,
                buffer_count: 0,
                buffers: Vec::new(),
                mmaps: BTreeMap::new(),
                current_buf: 0,
                owner: None,
                files: BTreeMap::new(),
                completions,
                mapper,
            }),
            next_handle: AtomicU64::new(1),
        }
    }

    /// Device index, the `N` of `/dev/videoN`.
    pub const fn index(&self) -> u32 {
        self.index
    }

    #[cfg(test)]
    pub(crate) fn completions(&self) -> &CompletionQueue {
        &self.completions
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open a new handle. The first open connects to and opens the camera.
    pub fn open(self: &Arc<Self>, nonblocking: bool) -> Result<Handle> {
        let mut state = self.lock_state();

        if state.refcount == 0 {
            let mut backend = self.source.connect()?;
            backend.set_completion_handler(self.completions.handler());
            let config = backend.open().map_err(|err| {
                error!(device = self.index, error = %err, "failed to open camera");
                err
            })?;

            info!(device = self.index, camera = %backend.name(), "camera opened");
            state.backend = Some(backend);
            state.set_format_from_config(config);
            state.buffers.clear();
            state.buffer_count = 0;
            state.current_buf = 0;
        }

        state.refcount += 1;
        let id = HandleId(self.next_handle.fetch_add(1, Ordering::SeqCst));
        let events = Arc::new(EventCounter::new());
        state.files.insert(
            id,
            FileState {
                priority: Priority::default(),
                nonblocking,
                events: Arc::clone(&events),
            },
        );

        debug!(device = self.index, handle = %id, nonblocking, "handle opened");
        Ok(Handle::new(Arc::clone(self), id, events))
    }

    /// Close handle `id`. Closing the owner stops the stream and releases
    /// ownership; closing the last handle closes the camera.
    pub(crate) fn close(&self, id: HandleId) {
        let mut state = self.lock_state();
        if state.files.remove(&id).is_none() {
            return;
        }

        if state.has_ownership(id) {
            if state.is_running() {
                state.stream_off_locked();
            }
            state.release(id);
        }

        state.refcount = state.refcount.saturating_sub(1);
        if state.refcount == 0 {
            state.free_buffers();
            if let Some(mut backend) = state.backend.take() {
                backend.close();
                info!(device = self.index, camera = %backend.name(), "camera closed");
            }
            self.completions.discard();
        }
        drop(state);

        debug!(device = self.index, handle = %id, "handle closed");
        self.completions.wake_all();
    }

    pub(crate) fn set_nonblocking(&self, id: HandleId, nonblocking: bool) -> Result<()> {
        let mut state = self.lock_state();
        let file = state
            .files
            .get_mut(&id)
            .ok_or(Error::NotPermitted("handle is closed"))?;
        file.nonblocking = nonblocking;
        Ok(())
    }

    /// `VIDIOC_DQBUF`, entered with the device lock held. A blocking handle
    /// gives the lock up while it sleeps until a completion, stop or close,
    /// then validates again.
    pub(crate) fn dequeue<'a>(
        &'a self,
        mut state: MutexGuard<'a, DeviceState>,
        id: HandleId,
        arg: &mut BufferDesc,
    ) -> Result<()> {
        debug!(handle = %id, "servicing vidioc_dqbuf");

        loop {
            match state.try_dequeue(id, arg)? {
                Dequeue::Ready => return Ok(()),
                Dequeue::Pending { nonblocking: true, .. } => return Err(Error::WouldBlock),
                Dequeue::Pending { generation, .. } => {
                    drop(state);
                    self.completions.wait_for_completion(generation);
                    state = self.lock_state();
                }
            }
        }
    }

    pub(crate) fn mmap(
        &self,
        id: HandleId,
        length: usize,
        prot: Protection,
        offset: u64,
    ) -> Result<usize> {
        self.lock_state().mmap(id, length, prot, offset)
    }

    pub(crate) fn munmap(&self, addr: usize, length: usize) -> Result<()> {
        self.lock_state().munmap(addr, length)
    }

    /// Whether `addr` is a live mapping of this device.
    pub fn is_mapped(&self, addr: usize) -> bool {
        self.lock_state().is_mapped(addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    use crate::format::{FourCC, Size};
    use crate::ioctl::Ioctl;
    use crate::memory::HeapMapper;
    use crate::mock::{MockControl, MockSource};

    const FRAME_SIZE: u32 = 640 * 480 * 2;

    fn setup() -> (Arc<Device>, MockControl) {
        let (source, control) = MockSource::new();
        let device = Arc::new(Device::new(
            0,
            Arc::new(source),
            Arc::new(HeapMapper::new()),
            &DeviceConfig::default(),
        ));
        (device, control)
    }

    fn rw() -> Protection {
        Protection::READ | Protection::WRITE
    }

    /// Open a handle owning `count` buffers, all queued, with the stream on.
    fn streaming(device: &Arc<Device>, count: u32, nonblocking: bool) -> Handle {
        let handle = device.open(nonblocking).expect("open should succeed");
        let granted = handle
            .request_buffers(count)
            .expect("reqbufs should succeed");
        assert_eq!(granted, count);
        for index in 0..count {
            handle.queue_buffer(index).expect("qbuf should succeed");
        }
        handle.stream_on().expect("streamon should succeed");
        handle
    }

    fn wait_for_blocked_dequeue(device: &Device) {
        for _ in 0..5000 {
            if device.completions.waiters() > 0 {
                return;
            }
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_querycap_reports_identity() {
        let (device, _control) = setup();
        let handle = device.open(false).expect("open should succeed");

        let cap = handle.query_cap().expect("querycap should succeed");
        assert_eq!(cap.driver, "v4l2-compat");
        assert_eq!(cap.card, "Mock Camera");
        assert_eq!(cap.bus_info, "v4l2-compat:0");
        assert_eq!(cap.version, kernel_version(5, 2, 0));
        assert!(cap.device_caps.contains(
            CapabilityFlags::VIDEO_CAPTURE | CapabilityFlags::STREAMING
        ));
        assert!(!cap.device_caps.contains(CapabilityFlags::DEVICE_CAPS));
        assert_eq!(
            cap.capabilities,
            cap.device_caps | CapabilityFlags::DEVICE_CAPS
        );
    }

    #[test]
    fn test_format_and_buffer_layout() {
        let (device, _control) = setup();
        let handle = device.open(false).expect("open should succeed");

        let fmt = handle
            .set_format(V4l2Format::capture(FourCC::YUYV, 640, 480))
            .expect("s_fmt should succeed");
        assert_eq!(fmt.pix.bytesperline, 1280);
        assert_eq!(fmt.pix.sizeimage, FRAME_SIZE);

        assert_eq!(handle.request_buffers(4).expect("reqbufs should succeed"), 4);
        for index in 0..4 {
            let buf = handle.query_buffer(index).expect("querybuf should succeed");
            assert_eq!(buf.index, index);
            assert_eq!(buf.offset, index * FRAME_SIZE);
            assert_eq!(buf.length, FRAME_SIZE);
            assert_eq!(buf.flags, BufferFlags::TIMESTAMP_MONOTONIC);
        }
        let err = handle.query_buffer(4).expect_err("querybuf should fail");
        assert_eq!(err.errno(), libc::EINVAL);
    }

    #[test]
    fn test_reqbufs_reports_mmap_capability() {
        let (device, _control) = setup();
        let handle = device.open(false).expect("open should succeed");

        let mut req = RequestBuffers::mmap(2);
        handle
            .dispatch(Ioctl::ReqBufs(&mut req))
            .expect("reqbufs should succeed");
        assert_eq!(req.capabilities, BUF_CAP_SUPPORTS_MMAP);

        let mut userptr = RequestBuffers {
            memory: 2,
            ..RequestBuffers::mmap(2)
        };
        let err = handle
            .dispatch(Ioctl::ReqBufs(&mut userptr))
            .expect_err("userptr should be rejected");
        assert_eq!(err.errno(), libc::EINVAL);
    }

    #[test]
    fn test_try_fmt_is_pure_and_idempotent() {
        let (device, _control) = setup();
        let handle = device.open(false).expect("open should succeed");

        let unknown = handle
            .try_format(V4l2Format::capture(FourCC::new(b"XXXX"), 17, 3))
            .expect("try_fmt should succeed");
        assert_eq!(unknown.pix.pixelformat, FourCC::YUYV);
        assert_eq!(unknown.pix.size(), Size::new(640, 480));

        let again = handle
            .try_format(unknown.clone())
            .expect("try_fmt should succeed");
        assert_eq!(again, unknown);

        let mjpeg = handle
            .try_format(V4l2Format::capture(FourCC::MJPG, 1280, 720))
            .expect("try_fmt should succeed");
        assert_eq!(mjpeg.pix.pixelformat, FourCC::MJPG);
        assert_eq!(mjpeg.pix.sizeimage, 1280 * 720 * 2);

        let unsupported_size = handle
            .try_format(V4l2Format::capture(FourCC::YUYV, 1280, 720))
            .expect("try_fmt should succeed");
        assert_eq!(unsupported_size.pix.size(), Size::new(640, 480));

        let current = handle.format().expect("g_fmt should succeed");
        assert_eq!(current.pix.pixelformat, FourCC::YUYV);
        assert_eq!(current.pix.size(), Size::new(640, 480));
    }

    #[test]
    fn test_set_format_switches_size() {
        let (device, _control) = setup();
        let handle = device.open(false).expect("open should succeed");

        handle
            .set_format(V4l2Format::capture(FourCC::YUYV, 320, 240))
            .expect("s_fmt should succeed");
        let current = handle.format().expect("g_fmt should succeed");
        assert_eq!(current.pix.size(), Size::new(320, 240));
        assert_eq!(current.pix.sizeimage, 320 * 240 * 2);
    }

    #[test]
    fn test_rejected_configuration_is_invalid() {
        let (device, control) = setup();
        let handle = device.open(false).expect("open should succeed");

        control.set_reject_configure(true);
        let err = handle
            .set_format(V4l2Format::capture(FourCC::YUYV, 320, 240))
            .expect_err("s_fmt should fail");
        assert_eq!(err.errno(), libc::EINVAL);

        let current = handle.format().expect("g_fmt should succeed");
        assert_eq!(current.pix.size(), Size::new(640, 480));
    }

    #[test]
    fn test_enumeration() {
        let (device, _control) = setup();
        let handle = device.open(false).expect("open should succeed");

        let yuyv = handle.enum_format(0).expect("enum_fmt should succeed");
        assert_eq!(yuyv.pixelformat, FourCC::YUYV);
        assert_eq!(yuyv.flags, 0);
        assert!(!yuyv.description.is_empty());

        let mjpeg = handle.enum_format(1).expect("enum_fmt should succeed");
        assert_eq!(mjpeg.pixelformat, FourCC::MJPG);
        assert_eq!(mjpeg.flags, FMT_FLAG_COMPRESSED);
        assert!(handle.enum_format(2).is_err());

        let size = handle
            .enum_frame_size(FourCC::YUYV, 1)
            .expect("enum_framesizes should succeed");
        assert_eq!(size.type_, FRMSIZE_TYPE_DISCRETE);
        assert_eq!((size.width, size.height), (320, 240));
        assert!(handle.enum_frame_size(FourCC::YUYV, 2).is_err());
        assert!(handle.enum_frame_size(FourCC::new(b"XXXX"), 0).is_err());
    }

    #[test]
    fn test_single_camera_input() {
        let (device, _control) = setup();
        let handle = device.open(false).expect("open should succeed");

        let input = handle.enum_input(0).expect("enuminput should succeed");
        assert_eq!(input.name, "Camera");
        assert_eq!(input.type_, INPUT_TYPE_CAMERA);
        assert_eq!(
            handle.enum_input(1).expect_err("enuminput should fail").errno(),
            libc::EINVAL
        );

        let mut input = 7;
        handle
            .dispatch(Ioctl::GetInput(&mut input))
            .expect("g_input should succeed");
        assert_eq!(input, 0);

        let mut input = 1;
        assert!(handle.dispatch(Ioctl::SetInput(&mut input)).is_err());
        let mut input = 0;
        handle
            .dispatch(Ioctl::SetInput(&mut input))
            .expect("s_input should succeed");
    }

    #[test]
    fn test_dequeue_order_follows_queue_cursor() {
        let (device, control) = setup();
        let handle = streaming(&device, 3, true);
        assert_eq!(control.submitted(), vec![0, 1, 2]);

        control.complete(2);
        control.complete(0);
        control.complete(1);

        let indexes: Vec<u32> = (0..3)
            .map(|_| {
                handle
                    .dequeue_buffer()
                    .expect("dqbuf should succeed")
                    .index
            })
            .collect();
        assert_eq!(indexes, vec![0, 1, 2]);

        let err = handle.dequeue_buffer().expect_err("dqbuf should fail");
        assert_eq!(err, Error::WouldBlock);
    }

    #[test]
    fn test_dequeued_descriptor_carries_completion() {
        let (device, control) = setup();
        let handle = streaming(&device, 2, true);

        control.complete(0);
        let buf = handle.dequeue_buffer().expect("dqbuf should succeed");
        assert_eq!(buf.index, 0);
        assert_eq!(buf.bytesused, FRAME_SIZE);
        assert_eq!(buf.length, FRAME_SIZE);
        assert_eq!(buf.sequence, 0);
        assert_eq!(buf.timestamp, Timeval::from_nanos(33_333_333));
        assert!(!buf.flags.intersects(BufferFlags::QUEUED | BufferFlags::DONE));
        assert!(buf.flags.contains(BufferFlags::TIMESTAMP_MONOTONIC));
        assert_eq!(buf.field, FIELD_NONE);

        let slot = handle.query_buffer(0).expect("querybuf should succeed");
        assert!(!slot.flags.contains(BufferFlags::QUEUED));
        assert_eq!(slot.field, FIELD_NONE);
    }

    #[test]
    fn test_nonblocking_dequeue_then_completion() {
        let (device, control) = setup();
        let handle = streaming(&device, 2, true);

        let err = handle.dequeue_buffer().expect_err("dqbuf should fail");
        assert_eq!(err.errno(), libc::EAGAIN);
        assert!(!handle.is_readable());

        control.complete(0);
        assert!(handle.poll(Duration::ZERO));
        let buf = handle.dequeue_buffer().expect("dqbuf should succeed");
        assert_eq!(buf.index, 0);
        assert!(!handle.is_readable());
    }

    #[test]
    fn test_error_completion_is_reported() {
        let (device, control) = setup();
        let handle = streaming(&device, 2, true);

        control.complete_with(0, FrameStatus::Error);
        let buf = handle.dequeue_buffer().expect("dqbuf should succeed");
        assert_eq!(buf.index, 0);
        assert!(buf.flags.contains(BufferFlags::ERROR));
        assert!(!buf.flags.contains(BufferFlags::DONE));
    }

    #[test]
    fn test_completion_for_unqueued_buffer_is_ignored() {
        let (device, control) = setup();
        let handle = device.open(true).expect("open should succeed");
        handle.request_buffers(2).expect("reqbufs should succeed");
        handle.queue_buffer(0).expect("qbuf should succeed");
        handle.stream_on().expect("streamon should succeed");

        control.complete(1);
        let slot = handle.query_buffer(1).expect("querybuf should succeed");
        assert!(!slot.flags.contains(BufferFlags::DONE));
        assert!(!handle.is_readable());
    }

    #[test]
    fn test_stream_off_clears_readiness() {
        let (device, control) = setup();
        let handle = streaming(&device, 2, true);

        control.complete(0);
        assert!(handle.poll(Duration::ZERO));
        handle.stream_off().expect("streamoff should succeed");
        assert!(!handle.is_readable());

        handle.queue_buffer(0).expect("qbuf should succeed");
        handle.stream_on().expect("streamon should succeed");
        assert!(!handle.poll(Duration::ZERO));
        let err = handle.dequeue_buffer().expect_err("dqbuf should fail");
        assert_eq!(err.errno(), libc::EAGAIN);

        control.complete(0);
        assert!(handle.poll(Duration::ZERO));
        let buf = handle.dequeue_buffer().expect("dqbuf should succeed");
        assert_eq!(buf.index, 0);
        assert!(!handle.is_readable());
    }

    #[test]
    fn test_release_clears_readiness() {
        let (device, control) = setup();
        let handle = device.open(true).expect("open should succeed");
        handle.request_buffers(2).expect("reqbufs should succeed");
        handle.queue_buffer(0).expect("qbuf should succeed");

        // Completed before the stream ever started, never dequeued.
        control.complete(0);
        assert!(handle.is_readable());
        handle.request_buffers(0).expect("reqbufs(0) should succeed");
        assert!(!handle.is_readable());
    }

    #[test]
    fn test_queue_validation() {
        let (device, _control) = setup();
        let handle = device.open(true).expect("open should succeed");
        handle.request_buffers(2).expect("reqbufs should succeed");

        assert!(handle.queue_buffer(2).is_err());
        handle.queue_buffer(0).expect("qbuf should succeed");
        let err = handle.queue_buffer(0).expect_err("second qbuf should fail");
        assert_eq!(err.errno(), libc::EINVAL);
    }

    #[test]
    fn test_stream_on_requires_buffers() {
        let (device, control) = setup();
        let handle = device.open(false).expect("open should succeed");

        let err = handle.stream_on().expect_err("streamon should fail");
        assert_eq!(err.errno(), libc::EINVAL);

        handle.request_buffers(2).expect("reqbufs should succeed");
        handle.stream_on().expect("streamon should succeed");
        handle.stream_on().expect("second streamon should succeed");
        assert!(control.is_running());
    }

    #[test]
    fn test_stream_off_returns_buffers() {
        let (device, control) = setup();
        let handle = streaming(&device, 2, true);

        control.complete(0);
        handle.stream_off().expect("streamoff should succeed");
        assert!(!control.is_running());
        assert!(control.submitted().is_empty());

        for index in 0..2 {
            let slot = handle.query_buffer(index).expect("querybuf should succeed");
            assert!(!slot
                .flags
                .intersects(BufferFlags::QUEUED | BufferFlags::DONE | BufferFlags::ERROR));
        }

        let err = handle.dequeue_buffer().expect_err("dqbuf should fail");
        assert_eq!(err.errno(), libc::EINVAL);
    }

    #[test]
    fn test_blocking_dequeue_wakes_on_completion() {
        let (device, control) = setup();
        let handle = Arc::new(streaming(&device, 2, false));

        let waiter = {
            let handle = Arc::clone(&handle);
            thread::spawn(move || handle.dequeue_buffer())
        };
        wait_for_blocked_dequeue(&device);
        control.complete(0);

        let buf = waiter
            .join()
            .expect("waiter should not panic")
            .expect("dqbuf should succeed");
        assert_eq!(buf.index, 0);
    }

    #[test]
    fn test_blocking_dequeue_wakes_on_stream_off() {
        let (device, _control) = setup();
        let handle = Arc::new(streaming(&device, 2, false));

        let waiter = {
            let handle = Arc::clone(&handle);
            thread::spawn(move || handle.dequeue_buffer())
        };
        wait_for_blocked_dequeue(&device);
        handle.stream_off().expect("streamoff should succeed");

        let err = waiter
            .join()
            .expect("waiter should not panic")
            .expect_err("dqbuf should fail");
        assert_eq!(err.errno(), libc::EINVAL);
    }

    #[test]
    fn test_blocking_dequeue_fails_when_handle_closes() {
        let (device, control) = setup();
        let handle = Arc::new(streaming(&device, 2, false));

        let waiter = {
            let handle = Arc::clone(&handle);
            thread::spawn(move || handle.dequeue_buffer())
        };
        wait_for_blocked_dequeue(&device);
        handle.close();

        let err = waiter
            .join()
            .expect("waiter should not panic")
            .expect_err("dqbuf should fail");
        assert_eq!(err.errno(), libc::EPERM);
        assert!(!control.is_running());
    }

    #[test]
    fn test_ownership_excludes_other_handles() {
        let (device, _control) = setup();
        let owner = device.open(true).expect("open should succeed");
        let other = device.open(true).expect("open should succeed");

        owner.request_buffers(2).expect("reqbufs should succeed");

        let busy = |result: Result<()>| {
            assert_eq!(result.expect_err("should be busy").errno(), libc::EBUSY);
        };
        busy(
            other
                .set_format(V4l2Format::capture(FourCC::YUYV, 320, 240))
                .map(drop),
        );
        busy(other.request_buffers(2).map(drop));
        busy(other.queue_buffer(0).map(drop));
        busy(other.stream_on());
        busy(other.dequeue_buffer().map(drop));

        other
            .try_format(V4l2Format::capture(FourCC::YUYV, 320, 240))
            .expect("try_fmt needs no ownership");
        other.query_buffer(0).expect("querybuf needs no ownership");

        owner.request_buffers(0).expect("reqbufs(0) should succeed");
        other
            .set_format(V4l2Format::capture(FourCC::YUYV, 320, 240))
            .expect("s_fmt should succeed after release");
    }

    #[test]
    fn test_priority_arbitration() {
        let (device, _control) = setup();
        let recorder = device.open(false).expect("open should succeed");
        let viewer = device.open(false).expect("open should succeed");

        assert_eq!(viewer.priority().expect("g_priority"), Priority::Unset);
        recorder
            .set_priority(Priority::Record)
            .expect("s_priority should succeed");
        assert_eq!(viewer.priority().expect("g_priority"), Priority::Record);

        let err = viewer
            .set_format(V4l2Format::capture(FourCC::YUYV, 320, 240))
            .expect_err("s_fmt should fail");
        assert_eq!(err.errno(), libc::EBUSY);
        let err = viewer
            .set_priority(Priority::Interactive)
            .expect_err("s_priority should fail");
        assert_eq!(err.errno(), libc::EBUSY);

        let mut out_of_range = 4;
        let err = recorder
            .dispatch(Ioctl::SetPriority(&mut out_of_range))
            .expect_err("s_priority should fail");
        assert_eq!(err.errno(), libc::EINVAL);

        recorder.close();
        assert_eq!(viewer.priority().expect("g_priority"), Priority::Unset);
        viewer
            .set_format(V4l2Format::capture(FourCC::YUYV, 320, 240))
            .expect("s_fmt should succeed");
    }

    #[test]
    fn test_reqbufs_busy_while_mapped_or_streaming() {
        let (device, _control) = setup();
        let handle = device.open(false).expect("open should succeed");
        handle.request_buffers(2).expect("reqbufs should succeed");

        let addr = handle
            .mmap(FRAME_SIZE as usize, rw(), 0)
            .expect("mmap should succeed");
        let err = handle.request_buffers(0).expect_err("reqbufs should fail");
        assert_eq!(err.errno(), libc::EBUSY);
        handle
            .munmap(addr, FRAME_SIZE as usize)
            .expect("munmap should succeed");

        handle.stream_on().expect("streamon should succeed");
        assert!(handle.request_buffers(0).is_err());
        assert!(handle.request_buffers(3).is_err());
        handle.stream_off().expect("streamoff should succeed");

        handle.request_buffers(0).expect("reqbufs(0) should succeed");
        assert!(handle.query_buffer(0).is_err());
    }

    #[test]
    fn test_allocation_failure() {
        let (device, control) = setup();
        let handle = device.open(false).expect("open should succeed");

        control.set_fail_allocate(true);
        let mut req = RequestBuffers::mmap(2);
        let err = handle
            .dispatch(Ioctl::ReqBufs(&mut req))
            .expect_err("reqbufs should fail");
        assert_eq!(err.errno(), libc::ENOMEM);
        assert_eq!(req.count, 0);

        control.set_fail_allocate(false);
        assert_eq!(handle.request_buffers(2).expect("reqbufs should succeed"), 2);
    }

    #[test]
    fn test_empty_frame_size_leaves_format_unchanged() {
        let (device, control) = setup();
        let handle = device.open(false).expect("open should succeed");
        handle
            .set_format(V4l2Format::capture(FourCC::YUYV, 320, 240))
            .expect("s_fmt should succeed");

        control.set_zero_size(true);
        let err = handle.request_buffers(2).expect_err("reqbufs should fail");
        assert_eq!(err.errno(), libc::EINVAL);

        let current = handle.format().expect("g_fmt should succeed");
        assert_eq!(current.pix.size(), Size::new(320, 240));
        assert_eq!(current.pix.sizeimage, 320 * 240 * 2);
        assert!(handle.query_buffer(0).is_err());
    }

    #[test]
    fn test_dequeue_index_checked_before_ownership() {
        let (device, _control) = setup();
        let owner = device.open(true).expect("open should succeed");
        let other = device.open(true).expect("open should succeed");
        owner.request_buffers(2).expect("reqbufs should succeed");

        let mut buf = BufferDesc::mmap(2);
        let err = other
            .dispatch(Ioctl::DqBuf(&mut buf))
            .expect_err("dqbuf should fail");
        assert_eq!(err.errno(), libc::EINVAL);

        let mut buf = BufferDesc::mmap(1);
        let err = other
            .dispatch(Ioctl::DqBuf(&mut buf))
            .expect_err("dqbuf should fail");
        assert_eq!(err.errno(), libc::EBUSY);
    }

    #[test]
    fn test_mmap_validation() {
        let (device, _control) = setup();
        let handle = device.open(false).expect("open should succeed");
        let length = FRAME_SIZE as usize;

        assert!(handle.mmap(length, rw(), 0).is_err());
        handle.request_buffers(2).expect("reqbufs should succeed");

        assert!(handle.mmap(length, Protection::READ, 0).is_err());
        assert!(handle.mmap(length, rw(), 1).is_err());
        assert!(handle
            .mmap(length, rw(), u64::from(2 * FRAME_SIZE))
            .is_err());
        assert!(handle.mmap(100, rw(), 0).is_err());

        let addr = handle
            .mmap(length, rw(), u64::from(FRAME_SIZE))
            .expect("mmap should succeed");
        assert!(device.is_mapped(addr));
        let slot = handle.query_buffer(1).expect("querybuf should succeed");
        assert!(slot.flags.contains(BufferFlags::MAPPED));

        assert!(handle.munmap(addr, 100).is_err());
        handle.munmap(addr, length).expect("munmap should succeed");
        assert!(!device.is_mapped(addr));
        let slot = handle.query_buffer(1).expect("querybuf should succeed");
        assert!(!slot.flags.contains(BufferFlags::MAPPED));
    }

    #[test]
    fn test_camera_lifecycle_follows_handles() {
        let (device, control) = setup();
        let first = device.open(false).expect("open should succeed");
        let second = device.open(false).expect("open should succeed");
        assert_eq!(control.opens(), 1);

        drop(first);
        assert_eq!(control.closes(), 0);
        drop(second);
        assert_eq!(control.closes(), 1);

        let _again = device.open(false).expect("open should succeed");
        assert_eq!(control.opens(), 2);
    }

    #[test]
    fn test_closing_owner_stops_stream() {
        let (device, control) = setup();
        let owner = streaming(&device, 2, true);
        let other = device.open(true).expect("open should succeed");
        assert!(control.is_running());

        drop(owner);
        assert!(!control.is_running());
        other
            .request_buffers(2)
            .expect("reqbufs should succeed once ownership is released");
    }

    #[test]
    fn test_closed_handle_is_rejected() {
        let (device, _control) = setup();
        let handle = device.open(false).expect("open should succeed");
        handle.close();
        handle.close();

        let err = handle.query_cap().expect_err("querycap should fail");
        assert_eq!(err.errno(), libc::EBADF);
    }
}
