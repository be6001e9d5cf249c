//! Process-wide registry of emulated devices and their descriptors.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::{debug, info};

use crate::backend::CameraSource;
use crate::device::{Device, DeviceConfig};
use crate::error::{Error, Result};
use crate::handle::Handle;
use crate::ioctl::IoctlArg;
use crate::memory::{MemoryMapper, Protection};

/// First descriptor number handed out, clear of the standard streams and
/// of descriptors a small process opens itself.
const FIRST_FD: i32 = 1000;

const DEVICE_PREFIX: &str = "/dev/video";

struct Registry {
    devices: Vec<Arc<Device>>,
    files: BTreeMap<i32, Arc<Handle>>,
    mmaps: BTreeMap<usize, Arc<Device>>,
    next_fd: i32,
}

/// Table of emulated devices, open descriptors and live mappings.
///
/// Descriptors created by [`dup`](Self::dup) share the handle of the
/// descriptor they copy; the handle closes when its last descriptor does.
pub struct CompatManager {
    registry: Mutex<Registry>,
    mapper: Arc<dyn MemoryMapper>,
    config: DeviceConfig,
}

impl CompatManager {
    /// Create an empty registry whose devices map buffers through `mapper`.
    pub fn new(mapper: Arc<dyn MemoryMapper>) -> Self {
        Self::with_config(mapper, DeviceConfig::default())
    }

    /// Create an empty registry with a custom device identity.
    pub fn with_config(mapper: Arc<dyn MemoryMapper>, config: DeviceConfig) -> Self {
        Self {
            registry: Mutex::new(Registry {
                devices: Vec::new(),
                files: BTreeMap::new(),
                mmaps: BTreeMap::new(),
                next_fd: FIRST_FD,
            }),
            mapper,
            config,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a device for `source` and return its index.
    pub fn register(&self, source: Arc<dyn CameraSource>) -> u32 {
        let mut registry = self.lock();
        let index = u32::try_from(registry.devices.len()).unwrap_or(u32::MAX);
        let name = source.name();
        registry.devices.push(Arc::new(Device::new(
            index,
            source,
            Arc::clone(&self.mapper),
            &self.config,
        )));
        info!(index, camera = %name, "registered emulated device");
        index
    }

    /// Number of registered devices.
    pub fn device_count(&self) -> usize {
        self.lock().devices.len()
    }

    /// Device at `index`.
    pub fn device(&self, index: u32) -> Option<Arc<Device>> {
        let index = usize::try_from(index).ok()?;
        self.lock().devices.get(index).map(Arc::clone)
    }

    /// Index of the device named by a `/dev/videoN` path.
    pub fn device_index(&self, path: &str) -> Option<u32> {
        let index: u32 = path.strip_prefix(DEVICE_PREFIX)?.parse().ok()?;
        (usize::try_from(index).ok()? < self.device_count()).then_some(index)
    }

    fn handle(&self, fd: i32) -> Result<Arc<Handle>> {
        self.lock()
            .files
            .get(&fd)
            .map(Arc::clone)
            .ok_or(Error::BadFileDescriptor(fd))
    }

    fn insert(&self, handle: Arc<Handle>) -> i32 {
        let mut registry = self.lock();
        let fd = registry.next_fd;
        registry.next_fd = registry.next_fd.saturating_add(1);
        registry.files.insert(fd, handle);
        fd
    }

    /// Open the device at `path`. `O_NONBLOCK` in `flags` selects
    /// non-blocking dequeue.
    pub fn open(&self, path: &str, flags: i32) -> Result<i32> {
        let index = self
            .device_index(path)
            .ok_or_else(|| Error::UnknownDevice(path.to_owned()))?;
        let device = self
            .device(index)
            .ok_or_else(|| Error::UnknownDevice(path.to_owned()))?;

        let nonblocking = flags & libc::O_NONBLOCK != 0;
        let handle = device.open(nonblocking)?;
        let fd = self.insert(Arc::new(handle));
        debug!(path, fd, nonblocking, "opened emulated device");
        Ok(fd)
    }

    /// Duplicate `fd`; both descriptors share one handle.
    pub fn dup(&self, fd: i32) -> Result<i32> {
        let handle = self.handle(fd)?;
        let new_fd = self.insert(handle);
        debug!(fd, new_fd, "duplicated descriptor");
        Ok(new_fd)
    }

    /// Close `fd`. The handle closes with its last descriptor, even while
    /// another thread is still inside a call on it.
    pub fn close(&self, fd: i32) -> Result<()> {
        let mut registry = self.lock();
        let handle = registry
            .files
            .remove(&fd)
            .ok_or(Error::BadFileDescriptor(fd))?;
        let last = !registry
            .files
            .values()
            .any(|other| Arc::ptr_eq(other, &handle));
        drop(registry);

        debug!(fd, last, "closing descriptor");
        if last {
            handle.close();
        }
        Ok(())
    }

    /// Service an ioctl on `fd`.
    pub fn ioctl(&self, fd: i32, request: u64, arg: Option<&mut IoctlArg>) -> Result<()> {
        // The registry lock is released before the handler runs; a blocking
        // dequeue must not stall other descriptors.
        let handle = self.handle(fd)?;
        handle.ioctl(request, arg)
    }

    /// Map the buffer at `offset` of the device behind `fd`.
    pub fn mmap(&self, fd: i32, length: usize, prot: Protection, offset: u64) -> Result<usize> {
        let handle = self.handle(fd)?;
        let addr = handle.mmap(length, prot, offset)?;
        self.lock().mmaps.insert(addr, Arc::clone(handle.device()));
        Ok(addr)
    }

    /// Unmap a mapping created by [`mmap`](Self::mmap).
    pub fn munmap(&self, addr: usize, length: usize) -> Result<()> {
        let device = self
            .lock()
            .mmaps
            .get(&addr)
            .map(Arc::clone)
            .ok_or(Error::InvalidArgument("address is not mapped"))?;

        device.munmap(addr, length)?;
        self.lock().mmaps.remove(&addr);
        Ok(())
    }

    /// Switch `fd` between blocking and non-blocking dequeue.
    pub fn set_nonblocking(&self, fd: i32, nonblocking: bool) -> Result<()> {
        self.handle(fd)?.set_nonblocking(nonblocking)
    }

    /// Wait up to `timeout` for a completed buffer on `fd`.
    pub fn poll(&self, fd: i32, timeout: Duration) -> Result<bool> {
        Ok(self.handle(fd)?.poll(timeout))
    }
}
