//! Settle delays mandated by the peripheral data sheet.
//!
//! The PWM clock manager and the DMA abort/reset path need a short pause
//! after certain register writes before the next write is issued. The
//! delay goes through `nanosleep` directly so the same routine is usable
//! from the termination signal handler.

/// Pause required after clock-manager and DMA control writes.
pub const SETTLE_US: u32 = 10;

/// Block the calling thread for `us` microseconds.
///
/// Async-signal-safe.
pub fn delay_us(us: u32) {
    let ts = libc::timespec {
        tv_sec: (us / 1_000_000) as libc::time_t,
        tv_nsec: ((us % 1_000_000) * 1_000) as libc::c_long,
    };
    unsafe {
        libc::nanosleep(&ts, core::ptr::null_mut());
    }
}

/// The data-sheet register-settle pause.
pub fn settle() {
    delay_us(SETTLE_US);
}
