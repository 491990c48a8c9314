//! Control-block sequence synthesis.
//!
//! One PWM period is a closed ring of DMA control blocks living in
//! uncached memory: a head block that sets (or clears) the GPIO mask,
//! DREQ-paced wait blocks that burn one pulse width each by feeding the
//! PWM FIFO, a clear block once the high phase expires, and more waits
//! until the ring loops. The DMA engine walks the ring by bus address
//! without any CPU involvement.

use core::mem;
use core::sync::atomic::{fence, Ordering};

use crate::errors::{Error, Result};
use crate::mmio::{
    dma_ti_permap, DMA_TI_DREQ, DMA_TI_NO_WIDE_BURSTS, DMA_TI_WAIT_RESP, DREQ_SOURCE_PWM,
};
use crate::pwm::timing::SignalTiming;
use crate::uncached::UncachedMem;

/// One BCM283x DMA control block. The hardware reads these at 32-byte
/// aligned bus addresses, in this exact layout.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlBlock {
    /// Transfer information.
    pub info: u32,
    /// Source bus address.
    pub source_ad: u32,
    /// Destination bus address.
    pub dest_ad: u32,
    /// Transfer length in bytes.
    pub txfr_len: u32,
    /// 2D stride (unused here).
    pub stride: u32,
    /// Bus address of the next control block.
    pub nextconbk: u32,
    _reserved: [u32; 2],
}

/// Size of one control block.
pub const CB_SIZE: usize = mem::size_of::<ControlBlock>();

// The word fed to the FIFO is irrelevant; only the paced transfer counts.
// The DMA engine still performs the read, so any readable bus address do.
const FIFO_FILLER_SOURCE: u32 = 0x00AB_CDEF;

impl ControlBlock {
    /// A mask-transfer block: copies one 32-bit GPIO mask into a
    /// set/clear register.
    fn step(source_ad: u32, dest_ad: u32, nextconbk: u32) -> Self {
        ControlBlock {
            info: DMA_TI_NO_WIDE_BURSTS | DMA_TI_WAIT_RESP,
            source_ad,
            dest_ad,
            txfr_len: 4,
            stride: 0,
            nextconbk,
            _reserved: [0; 2],
        }
    }

    /// A wait block: one DREQ-paced FIFO write, burning one pulse width.
    fn wait(fifo_bus: u32, nextconbk: u32) -> Self {
        ControlBlock {
            info: DMA_TI_NO_WIDE_BURSTS
                | DMA_TI_WAIT_RESP
                | DMA_TI_DREQ
                | dma_ti_permap(DREQ_SOURCE_PWM),
            source_ad: FIFO_FILLER_SOURCE,
            dest_ad: fifo_bus,
            txfr_len: 4,
            stride: 0,
            nextconbk,
            _reserved: [0; 2],
        }
    }
}

/// Bus addresses a ring transfers to.
#[derive(Debug, Clone, Copy)]
pub struct SequenceTargets {
    /// `GPSET0`.
    pub gpset0: u32,
    /// `GPCLR0`.
    pub gpclr0: u32,
    /// PWM FIFO input.
    pub pwm_fifo: u32,
}

/// Write the ring for one waveform into `region`.
///
/// The head decides the rail: any positive duty starts by writing the set
/// mask to `GPSET0`; at 0% it writes the clear mask to `GPCLR0` instead,
/// which holds the line low no matter how the ring is traversed. At 100%
/// the clear block is omitted so the line never drops.
pub(crate) fn build(
    region: &mut UncachedMem,
    timing: &SignalTiming,
    duty_desired_pct: f64,
    set_mask_bus: u32,
    clear_mask_bus: u32,
    targets: SequenceTargets,
) -> Result<()> {
    if timing.cb_total * CB_SIZE > region.size() {
        return Err(Error::OutOfMemory);
    }

    let base = region.virt().as_ptr().cast::<ControlBlock>();
    let rail = duty_desired_pct == 0.0 || duty_desired_pct == 100.0;

    for index in 0..timing.cb_total {
        let next = if index + 1 == timing.cb_total {
            region.bus_addr()
        } else {
            region.bus_at((index + 1) * CB_SIZE)?
        };

        let block = if index == 0 {
            if duty_desired_pct > 0.0 {
                ControlBlock::step(set_mask_bus, targets.gpset0, next)
            } else {
                ControlBlock::step(clear_mask_bus, targets.gpclr0, next)
            }
        } else if !rail && index == timing.wait_set + 1 {
            ControlBlock::step(clear_mask_bus, targets.gpclr0, next)
        } else {
            ControlBlock::wait(targets.pwm_fifo, next)
        };

        unsafe { base.add(index).write_volatile(block) };
    }

    // The ring must be globally visible before CONBLK_AD is armed.
    fence(Ordering::Release);
    Ok(())
}
