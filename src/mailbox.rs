//! VideoCore mailbox allocator.
//!
//! Uncached memory comes from the firmware through the mailbox property
//! interface on `/dev/vcio`: allocate, lock (yielding the bus address),
//! then map the locked region through `/dev/mem` at its physical alias.
//! Allocations use the `DIRECT | COHERENT` flags so the region bypasses
//! the ARM L1 cache.
//!
//! Every call opens the mailbox, performs its transaction and closes it
//! again; the release path is therefore plain `munmap` + two ioctls and
//! safe to run from the termination signal handler.

use crate::errors::{Error, Result};
use crate::mmio;
use crate::uncached::{UncachedAllocator, UncachedMem};

// _IOWR(100, 0, char *)
const IOCTL_MBOX_PROPERTY: libc::c_ulong = (3 << 30)
    | ((core::mem::size_of::<*mut libc::c_void>() as libc::c_ulong) << 16)
    | (100 << 8);

const TAG_ALLOCATE_MEMORY: u32 = 0x3000C;
const TAG_LOCK_MEMORY: u32 = 0x3000D;
const TAG_UNLOCK_MEMORY: u32 = 0x3000E;
const TAG_RELEASE_MEMORY: u32 = 0x3000F;

const RESPONSE_SUCCESS: u32 = 0x8000_0000;

// 0xC alias, uncached.
const MEM_FLAG_DIRECT: u32 = 1 << 2;
// 0x8 alias, non-allocating in L2 but coherent.
const MEM_FLAG_COHERENT: u32 = 2 << 2;
/// The ARM core never holds these pages in L1.
const MEM_FLAG_L1_NONALLOCATING: u32 = MEM_FLAG_DIRECT | MEM_FLAG_COHERENT;

/// Strip the cache-alias bits off a bus address.
const fn bus_to_phys(bus_addr: u32) -> u32 {
    bus_addr & !0xC000_0000
}

/// Uncached-memory allocator backed by the firmware mailbox.
#[derive(Debug, Default, Clone, Copy)]
pub struct Mailbox;

impl Mailbox {
    /// Run one property transaction and return its first response word.
    fn transact(tag: u32, args: &[u32]) -> Result<u32> {
        debug_assert!(args.len() <= 8);

        let fd = unsafe { libc::open(c"/dev/vcio".as_ptr(), 0) };
        if fd < 0 {
            return Err(Error::OutOfMemory);
        }

        // [size, request, tag, buf bytes, req bytes, args.., end tag]
        let mut msg = [0u32; 16];
        msg[0] = ((6 + args.len()) * 4) as u32;
        msg[1] = 0;
        msg[2] = tag;
        msg[3] = (args.len() * 4) as u32;
        msg[4] = (args.len() * 4) as u32;
        msg[5..5 + args.len()].copy_from_slice(args);

        let rc = unsafe { libc::ioctl(fd, IOCTL_MBOX_PROPERTY, msg.as_mut_ptr()) };
        unsafe {
            libc::close(fd);
        }
        if rc < 0 || msg[1] != RESPONSE_SUCCESS {
            return Err(Error::OutOfMemory);
        }
        Ok(msg[5])
    }
}

impl UncachedAllocator for Mailbox {
    fn alloc(&mut self, size: usize, align: usize) -> Result<UncachedMem> {
        let handle = Self::transact(
            TAG_ALLOCATE_MEMORY,
            &[size as u32, align as u32, MEM_FLAG_L1_NONALLOCATING],
        )?;
        if handle == 0 {
            return Err(Error::OutOfMemory);
        }

        let bus_addr = match Self::transact(TAG_LOCK_MEMORY, &[handle]) {
            Ok(addr) if addr != 0 => addr,
            _ => {
                let _ = Self::transact(TAG_RELEASE_MEMORY, &[handle]);
                return Err(Error::OutOfMemory);
            }
        };

        let virt = match mmio::map_phys(bus_to_phys(bus_addr), size) {
            Ok(ptr) => ptr,
            Err(err) => {
                let _ = Self::transact(TAG_UNLOCK_MEMORY, &[handle]);
                let _ = Self::transact(TAG_RELEASE_MEMORY, &[handle]);
                return Err(err);
            }
        };

        log::trace!(
            "mailbox alloc: {size} bytes, handle {handle}, bus {bus_addr:#010x}"
        );
        Ok(UncachedMem::new(size, virt, bus_addr, handle))
    }

    fn release(&mut self, mem: UncachedMem) -> Result<()> {
        unsafe {
            libc::munmap(mem.virt().as_ptr().cast(), mem.size());
        }
        let unlock = Self::transact(TAG_UNLOCK_MEMORY, &[mem.handle()]);
        let free = Self::transact(TAG_RELEASE_MEMORY, &[mem.handle()]);
        unlock.and(free).map(drop)
    }
}
