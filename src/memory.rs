//! Memory mapping of frame buffers into the caller's address space.
//!
//! The device only tracks which address belongs to which buffer; producing
//! the address is delegated to a [`MemoryMapper`] supplied by the
//! environment. [`HeapMapper`] is the in-process mapper: addresses are
//! synthetic handles that resolve back to the shared [`FrameBuffer`].

use std::collections::BTreeMap;
use std::io;
use std::sync::{Arc, Mutex, PoisonError};

use bitflags::bitflags;

use crate::backend::FrameBuffer;

bitflags! {
    /// Page protection requested by a mapping (`PROT_*`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Protection: i32 {
        /// Pages may be read.
        const READ = libc::PROT_READ;
        /// Pages may be written.
        const WRITE = libc::PROT_WRITE;
    }
}

/// Maps exported frame buffers and unmaps them again.
pub trait MemoryMapper: Send + Sync {
    /// Map `length` bytes of `buffer` and return the mapped address.
    fn map(&self, buffer: &Arc<FrameBuffer>, length: usize, prot: Protection) -> io::Result<usize>;

    /// Unmap the region starting at `addr`.
    fn unmap(&self, addr: usize, length: usize) -> io::Result<()>;
}

const PAGE_SIZE: usize = 4096;
const BASE_ADDRESS: usize = 0x1000_0000;

struct Region {
    buffer: Arc<FrameBuffer>,
    length: usize,
}

struct Regions {
    next: usize,
    mapped: BTreeMap<usize, Region>,
}

/// In-process mapper handing out page-aligned synthetic addresses.
pub struct HeapMapper {
    regions: Mutex<Regions>,
}

impl Default for HeapMapper {
    fn default() -> Self {
        Self::new()
    }
}

impl HeapMapper {
    /// Create a mapper with no live regions.
    #[must_use]
    pub fn new() -> Self {
        Self {
            regions: Mutex::new(Regions {
                next: BASE_ADDRESS,
                mapped: BTreeMap::new(),
            }),
        }
    }

    /// Buffer mapped at `addr`, if any.
    pub fn region(&self, addr: usize) -> Option<Arc<FrameBuffer>> {
        self.lock()
            .mapped
            .get(&addr)
            .map(|region| Arc::clone(&region.buffer))
    }

    /// Number of live regions.
    pub fn len(&self) -> usize {
        self.lock().mapped.len()
    }

    /// Whether no region is mapped.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Regions> {
        self.regions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl MemoryMapper for HeapMapper {
    fn map(&self, buffer: &Arc<FrameBuffer>, length: usize, prot: Protection) -> io::Result<usize> {
        if prot.is_empty() || length == 0 || length > buffer.len() {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }

        let mut regions = self.lock();
        let addr = regions.next;
        let span = length.div_ceil(PAGE_SIZE).saturating_mul(PAGE_SIZE);
        regions.next = addr
            .checked_add(span)
            .ok_or_else(|| io::Error::from_raw_os_error(libc::ENOMEM))?;
        regions.mapped.insert(
            addr,
            Region {
                buffer: Arc::clone(buffer),
                length,
            },
        );
        Ok(addr)
    }

    fn unmap(&self, addr: usize, length: usize) -> io::Result<()> {
        let mut regions = self.lock();
        match regions.mapped.get(&addr) {
            Some(region) if region.length == length => {
                regions.mapped.remove(&addr);
                Ok(())
            }
            _ => Err(io::Error::from_raw_os_error(libc::EINVAL)),
        }
    }
}
