//! Clock-divisor selection and waveform timing arithmetic.
//!
//! Pure functions, separated from the register choreography so the whole
//! timing model is testable without hardware.
//!
//! The engine's time base is the *pulse width*: the duration of one wait
//! tick, realized as `pwm_range * clock_divisor / SOURCE_CLOCK_HZ`. One
//! FIFO word consumed by the PWM controller accounts for a pulse-width
//! *pair*, which is where the recurring factor of 2 below comes from.

use crate::errors::{Error, Result};
use crate::pwm::sequence::CB_SIZE;

/// PLLD, the clock source the divisor is applied to.
pub const SOURCE_CLOCK_HZ: f64 = 500e6;

/// Integer divisor field limits of the clock manager.
pub const DIVISOR_MIN: u32 = 1;
pub const DIVISOR_MAX: u32 = 4095;

/// Nominal FIFO range; keeping the range near 100 keeps the controller's
/// own duty quantization near 1% while the divisor carries the dynamic
/// range.
pub const PWM_RANGE_NOMINAL: u32 = 100;

/// Accepted pulse-width domain in microseconds. The low bound is
/// exclusive, the high bound is the largest width the divisor and range
/// fields can express.
pub const PULSE_WIDTH_MIN_US: f64 = 0.4;
pub const PULSE_WIDTH_MAX_US: f64 = 35_175_782_146.0;

/// Clock-manager settings realizing a pulse width.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClockSettings {
    /// Integer divisor applied to PLLD.
    pub divisor: u32,
    /// PWM channel range (FIFO word duration in divided clocks).
    pub range: u32,
    /// The pulse width these settings actually achieve, in µs.
    pub pulse_width_us: f64,
}

impl ClockSettings {
    /// Power-on defaults: a 10 µs tick.
    pub const fn default_tick() -> Self {
        ClockSettings {
            divisor: 50,
            range: 100,
            pulse_width_us: 10.0,
        }
    }
}

/// Choose divisor and range for a requested pulse width.
///
/// The range stays at [`PWM_RANGE_NOMINAL`] while the divisor can absorb
/// the request; once the divisor clamps at either bound the range is
/// recomputed to make up the difference.
pub fn solve_pulse_width(pulse_width_us: f64) -> Result<ClockSettings> {
    if !pulse_width_us.is_finite()
        || pulse_width_us <= PULSE_WIDTH_MIN_US
        || pulse_width_us > PULSE_WIDTH_MAX_US
    {
        return Err(Error::InvalidPulseWidth);
    }

    let seconds = pulse_width_us / 1e6;
    let ideal = (seconds / PWM_RANGE_NOMINAL as f64 * SOURCE_CLOCK_HZ).round();

    let mut range = PWM_RANGE_NOMINAL;
    let divisor = if ideal < DIVISOR_MIN as f64 || ideal > DIVISOR_MAX as f64 {
        let clamped = if ideal < DIVISOR_MIN as f64 {
            DIVISOR_MIN
        } else {
            DIVISOR_MAX
        };
        range = (seconds * (SOURCE_CLOCK_HZ / clamped as f64)) as u32;
        if range < 1 {
            return Err(Error::InvalidPulseWidth);
        }
        clamped
    } else {
        ideal as u32
    };

    let achieved = range as f64 / (SOURCE_CLOCK_HZ / divisor as f64) * 1e6;
    Ok(ClockSettings {
        divisor,
        range,
        pulse_width_us: achieved,
    })
}

/// Everything `set` derives from (frequency, duty, pulse width).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SignalTiming {
    /// One PWM period, µs.
    pub subcycle_us: f64,
    /// DREQ-paced wait blocks per period.
    pub wait_ticks: usize,
    /// Wait blocks spent with the GPIOs set.
    pub wait_set: usize,
    /// Wait blocks spent with the GPIOs cleared.
    pub wait_clear: usize,
    /// Control blocks in the ring, including the set/clear blocks.
    pub cb_total: usize,
    /// Duty-cycle quantization step, percent.
    pub duty_resolution_pct: f64,
    /// Duty cycle actually realized, percent.
    pub duty_actual_pct: f64,
    /// Frequency actually realized, Hz.
    pub frequency_actual_hz: f64,
    /// Pages the control-block ring needs.
    pub pages_needed: usize,
}

/// Derive the ring dimensions for one signal.
///
/// `page_size` and `allocated_pages` bound the ring: the page estimate is
/// checked first, then the byte capacity of the region (the ring must
/// never outgrow the memory `request` reserved for it).
pub fn derive_signal(
    freq_hz: f64,
    duty_pct: f64,
    pulse_width_us: f64,
    page_size: usize,
    allocated_pages: usize,
) -> Result<SignalTiming> {
    if !(freq_hz.is_finite() && freq_hz > 0.0) {
        return Err(Error::FrequencyNotMet);
    }

    let subcycle_us = 1e6 / freq_hz;
    let ticks = (subcycle_us / pulse_width_us / 2.0).floor();
    if ticks < 1.0 {
        return Err(Error::FrequencyNotMet);
    }
    let wait_ticks = ticks as usize;

    let pages_needed = wait_ticks.div_ceil(page_size);
    if pages_needed > allocated_pages {
        return Err(Error::OutOfMemory);
    }

    let duty_resolution_pct = 100.0 / wait_ticks as f64;
    let exact_rail = duty_pct == 0.0 || duty_pct == 100.0;
    let duty_actual_pct = if exact_rail {
        duty_pct
    } else {
        (duty_pct / duty_resolution_pct).round() * duty_resolution_pct
    };

    let wait_set = (wait_ticks as f64 * duty_actual_pct / 100.0 / 2.0).floor() as usize;
    let wait_clear = wait_ticks.abs_diff(wait_set);
    let cb_total = wait_ticks + if exact_rail { 1 } else { 2 };

    if cb_total * CB_SIZE > allocated_pages * page_size {
        return Err(Error::OutOfMemory);
    }

    let frequency_actual_hz = 1e6 / (wait_ticks as f64 * pulse_width_us * 2.0);

    Ok(SignalTiming {
        subcycle_us,
        wait_ticks,
        wait_set,
        wait_clear,
        cb_total,
        duty_resolution_pct,
        duty_actual_pct,
        frequency_actual_hz,
        pages_needed,
    })
}
