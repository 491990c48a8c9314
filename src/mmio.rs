//! Memory-mapped peripheral register views.
//!
//! Each peripheral block is modelled as a `#[repr(C)]` struct of
//! [`volatile_register`] cells laid over the page returned by a
//! [`PeripheralMapper`]. The compiler can neither reorder nor elide the
//! accesses; ordering against the DMA engine is established with explicit
//! fences where it matters (see [`crate::pwm`]).

use core::ptr::NonNull;

use volatile_register::{RO, RW, WO};

use crate::errors::{Error, Result};

/// Maps one page of physical peripheral space into the process, shared
/// with the hardware.
///
/// Mappings are process-lifetime: the engine never unmaps them (unmapping
/// from a signal handler would be unsafe and buys nothing).
pub trait PeripheralMapper {
    /// Map the page at `phys_addr` read/write. `phys_addr` must be
    /// page-aligned.
    fn map(&self, phys_addr: u32) -> Result<NonNull<u32>>;
}

/// `/dev/mem` backed mapper. Requires root.
#[derive(Debug, Default, Clone, Copy)]
pub struct DevMem;

impl PeripheralMapper for DevMem {
    fn map(&self, phys_addr: u32) -> Result<NonNull<u32>> {
        map_phys(phys_addr, page_size()).map(|page| page.cast())
    }
}

/// `mmap` a physical range through `/dev/mem`.
pub(crate) fn map_phys(phys_addr: u32, len: usize) -> Result<NonNull<u8>> {
    let fd = unsafe { libc::open(c"/dev/mem".as_ptr(), libc::O_RDWR | libc::O_SYNC) };
    if fd < 0 {
        log::warn!("could not open /dev/mem; running without root?");
        return Err(Error::MapFailed);
    }
    let addr = unsafe {
        libc::mmap(
            core::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            fd,
            phys_addr as libc::off_t,
        )
    };
    unsafe {
        libc::close(fd);
    }
    if addr == libc::MAP_FAILED {
        return Err(Error::MapFailed);
    }
    NonNull::new(addr.cast()).ok_or(Error::MapFailed)
}

pub(crate) fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

/// GPIO block (peripheral base + `0x20_0000`).
#[repr(C)]
pub struct GpioRegisters {
    /// GPFSEL0..5: function select, three bits per pin.
    pub fsel: [RW<u32>; 6],
    _reserved0: u32,
    /// GPSET0..1: writing 1 drives the pin high.
    pub set: [RW<u32>; 2],
    _reserved1: u32,
    /// GPCLR0..1: writing 1 drives the pin low.
    pub clr: [RW<u32>; 2],
    _reserved2: u32,
    /// GPLEV0..1: pin levels.
    pub lev: [RO<u32>; 2],
}

/// One DMA channel's register bank.
///
/// Banks are spaced [`DMA_CHANNEL_STRIDE`] bytes apart from the controller
/// base; the engine only ever touches the bank of the channel it owns.
#[repr(C)]
pub struct DmaChannelRegisters {
    /// Control and status.
    pub cs: RW<u32>,
    /// Bus address of the control block to load.
    pub conblk_ad: RW<u32>,
    /// Transfer information of the loaded CB.
    pub ti: RO<u32>,
    /// Source address of the loaded CB.
    pub source_ad: RO<u32>,
    /// Destination address of the loaded CB.
    pub dest_ad: RO<u32>,
    /// Transfer length of the loaded CB.
    pub txfr_len: RO<u32>,
    /// 2D stride of the loaded CB.
    pub stride: RO<u32>,
    /// Bus address of the next CB.
    pub nextconbk: RO<u32>,
    /// Debug flags.
    pub debug: RW<u32>,
}

/// Byte distance between consecutive DMA channel banks.
pub const DMA_CHANNEL_STRIDE: usize = 0x100;

/// PWM controller block (peripheral base + `0x20_C000`).
#[repr(C)]
pub struct PwmRegisters {
    /// Control.
    pub ctl: RW<u32>,
    /// Status.
    pub sta: RW<u32>,
    /// DMA configuration.
    pub dmac: RW<u32>,
    _reserved0: u32,
    /// Channel 1 range.
    pub rng1: RW<u32>,
    /// Channel 1 data.
    pub dat1: RW<u32>,
    /// FIFO input.
    pub fif1: WO<u32>,
    _reserved1: u32,
    /// Channel 2 range.
    pub rng2: RW<u32>,
    /// Channel 2 data.
    pub dat2: RW<u32>,
}

/// PWM clock manager registers.
///
/// They sit at [`PWM_CLOCK_CTL_OFFSET`] inside the clock-manager page.
#[repr(C)]
pub struct PwmClockRegisters {
    /// Control (password-protected).
    pub ctl: RW<u32>,
    /// Integer/fractional divisor (password-protected).
    pub div: RW<u32>,
}

/// Byte offset of the PWM clock registers inside the clock-manager page.
pub const PWM_CLOCK_CTL_OFFSET: usize = 0xA0;

// DMA CS bits.
pub const DMA_CS_ACTIVE: u32 = 1 << 0;
pub const DMA_CS_END: u32 = 1 << 1;
pub const DMA_CS_WAIT_FOR_OUTSTANDING_WRITES: u32 = 1 << 28;
pub const DMA_CS_ABORT: u32 = 1 << 30;
pub const DMA_CS_RESET: u32 = 1 << 31;

/// Bus priority of panic transactions.
pub const fn dma_cs_panic_priority(priority: u32) -> u32 {
    (priority & 0xF) << 20
}

/// Bus priority of normal transactions.
pub const fn dma_cs_priority(priority: u32) -> u32 {
    (priority & 0xF) << 16
}

// DMA TI (transfer information) bits.
pub const DMA_TI_WAIT_RESP: u32 = 1 << 3;
pub const DMA_TI_DREQ: u32 = 1 << 6;
pub const DMA_TI_NO_WIDE_BURSTS: u32 = 1 << 26;

/// Peripheral whose DREQ line paces the transfer.
pub const fn dma_ti_permap(peripheral: u32) -> u32 {
    (peripheral & 0x1F) << 16
}

/// DREQ peripheral index of the PWM controller.
pub const DREQ_SOURCE_PWM: u32 = 5;

// PWM controller bits.
pub const PWM_CTL_PWEN1: u32 = 1 << 0;
pub const PWM_CTL_USEF1: u32 = 1 << 5;
pub const PWM_CTL_CLRF1: u32 = 1 << 6;
pub const PWM_DMAC_ENAB: u32 = 1 << 31;

/// FIFO thresholds for the DREQ and panic signals.
pub const fn pwm_dmac_thresholds(dreq: u32, panic: u32) -> u32 {
    ((panic & 0xFF) << 8) | (dreq & 0xFF)
}

// Clock manager bits.
pub const CM_PASSWORD: u32 = 0x5A << 24;
pub const CM_ENAB: u32 = 1 << 4;
/// Clock source 6: PLLD, 500 MHz.
pub const CM_SRC_PLLD: u32 = 6;

/// Divisor goes in bits 12..=23 of the DIV register.
pub const fn cm_divisor(divisor: u32) -> u32 {
    (divisor & 0xFFF) << 12
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::{offset_of, size_of};

    #[test]
    fn gpio_layout_matches_the_data_sheet() {
        assert_eq!(offset_of!(GpioRegisters, fsel), 0x00);
        assert_eq!(offset_of!(GpioRegisters, set), 0x1C);
        assert_eq!(offset_of!(GpioRegisters, clr), 0x28);
        assert_eq!(offset_of!(GpioRegisters, lev), 0x34);
    }

    #[test]
    fn dma_bank_layout_matches_the_data_sheet() {
        assert_eq!(offset_of!(DmaChannelRegisters, cs), 0x00);
        assert_eq!(offset_of!(DmaChannelRegisters, conblk_ad), 0x04);
        assert_eq!(offset_of!(DmaChannelRegisters, debug), 0x20);
        assert_eq!(size_of::<DmaChannelRegisters>(), 0x24);
    }

    #[test]
    fn pwm_layout_matches_the_data_sheet() {
        assert_eq!(offset_of!(PwmRegisters, dmac), 0x08);
        assert_eq!(offset_of!(PwmRegisters, rng1), 0x10);
        assert_eq!(offset_of!(PwmRegisters, fif1), 0x18);
        assert_eq!(offset_of!(PwmRegisters, rng2), 0x20);
    }

    #[test]
    fn field_helpers_mask_their_arguments() {
        assert_eq!(dma_cs_priority(7) | dma_cs_panic_priority(7), 0x0077_0000);
        assert_eq!(dma_ti_permap(DREQ_SOURCE_PWM), 5 << 16);
        assert_eq!(pwm_dmac_thresholds(15, 15), 0x0F0F);
        assert_eq!(cm_divisor(4095), 0xFFF << 12);
        assert_eq!(cm_divisor(0x1FFF), 0xFFF << 12);
    }
}
