//! GPIO function select and level control.
//!
//! The engine drives pins through 32-bit set/clear masks, so only the
//! first GPIO bank (pins 0..=31, the ones reachable through `GPSET0` and
//! `GPCLR0`) is addressable.

use crate::errors::{Error, Result};
use crate::mmio::GpioRegisters;

/// Highest pin the engine can drive.
pub const MAX_PIN: u8 = 31;

const FSEL_OUTPUT: u32 = 0b001;

/// Pre-flight check for a list of pins.
pub(crate) fn validate(gpios: &[u8]) -> Result<()> {
    if gpios.iter().any(|&pin| pin > MAX_PIN) {
        return Err(Error::InvalidGpio);
    }
    Ok(())
}

/// The `GPSET0`/`GPCLR0` mask covering `gpios`.
pub(crate) fn mask_of(gpios: &[u8]) -> u32 {
    gpios.iter().fold(0, |mask, &pin| mask | 1 << pin)
}

/// Switch `pin` to output mode.
///
/// Clears the pin's 3-bit function-select field before writing `001`, so a
/// pin previously in an ALT function ends up as plain output.
///
/// # Safety
///
/// `regs` must point at a live GPIO register mapping and `pin` must be
/// `<= MAX_PIN`.
pub(crate) unsafe fn set_output(regs: &GpioRegisters, pin: u8) {
    let word = (pin / 10) as usize;
    let shift = (pin % 10) * 3;
    regs.fsel[word].modify(|fsel| (fsel & !(0b111 << shift)) | (FSEL_OUTPUT << shift));
}

/// Drive `pin` low through `GPCLR0`.
///
/// # Safety
///
/// `regs` must point at a live GPIO register mapping and `pin` must be
/// `<= MAX_PIN`.
pub(crate) unsafe fn clear_pin(regs: &GpioRegisters, pin: u8) {
    regs.clr[0].write(1 << pin);
}
