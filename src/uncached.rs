//! Uncached (bus-addressable) memory handles.
//!
//! Control blocks and GPIO masks live in memory the ARM core does not
//! cache, so every CPU write is immediately visible to the DMA engine.
//! A region is described by both of its addresses: the virtual pointer the
//! CPU writes through and the bus address the DMA controller reads from.
//! Control blocks reference each other by bus address only.

use core::ptr::NonNull;

use crate::errors::{Error, Result};

/// One region of uncached memory obtained from an [`UncachedAllocator`].
///
/// Ownership is affine: the handle is live until passed to
/// [`UncachedAllocator::release`], and is never shared.
#[derive(Debug)]
pub struct UncachedMem {
    size: usize,
    virt: NonNull<u8>,
    bus_addr: u32,
    handle: u32,
}

impl UncachedMem {
    /// Wrap an allocation. `virt` and `bus_addr` must describe the same
    /// `size`-byte region.
    pub fn new(size: usize, virt: NonNull<u8>, bus_addr: u32, handle: u32) -> Self {
        UncachedMem {
            size,
            virt,
            bus_addr,
            handle,
        }
    }

    /// Region size in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// CPU-side pointer to the region.
    pub fn virt(&self) -> NonNull<u8> {
        self.virt
    }

    /// Bus address of the region, as the DMA engine sees it.
    pub fn bus_addr(&self) -> u32 {
        self.bus_addr
    }

    /// Allocator-specific handle (mailbox handle for the default allocator).
    pub fn handle(&self) -> u32 {
        self.handle
    }

    /// Bus address of a byte offset into the region.
    pub fn bus_at(&self, offset: usize) -> Result<u32> {
        if offset > self.size {
            return Err(Error::OutOfMemory);
        }
        Ok(self.bus_addr + offset as u32)
    }
}

/// Source of uncached memory.
///
/// The default implementation is [`crate::mailbox::Mailbox`]. `release`
/// must stay async-signal-safe (no heap use, plain syscalls only): it is
/// called from the termination signal handler.
pub trait UncachedAllocator {
    /// Allocate `size` bytes aligned to `align`.
    fn alloc(&mut self, size: usize, align: usize) -> Result<UncachedMem>;

    /// Return a region to the allocator.
    fn release(&mut self, mem: UncachedMem) -> Result<()>;
}
