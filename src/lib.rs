//! DMA-driven PWM on arbitrary GPIOs for the Raspberry Pi
//!
//! The BCM283x/BCM2711 SoCs expose two hardware PWM channels on a handful
//! of pins. This crate generates PWM on *any* GPIO of the first bank
//! instead, by programming the on-chip DMA controller to walk a circular
//! list of control blocks that set and clear the GPIO output registers.
//! The hardware PWM peripheral is used only as a metronome: its DREQ line
//! paces the DMA transfers, so the waveform keeps its timing with zero
//! CPU involvement once armed.
//!
//! The public surface lives in [`pwm::DmaPwmDriver`]:
//!
//! ```no_run
//! use dma_pwm::pwm::{config, DmaPwmDriver};
//!
//! # fn main() -> dma_pwm::Result<()> {
//! let mut pwm = DmaPwmDriver::new();
//!
//! // 5 ms ticks: plenty of duty resolution for a 1 Hz LED blink.
//! pwm.config(config::DEFAULT_PAGES, config::PULSE_WIDTH_LED_US)?;
//!
//! let channel = pwm.request()?;
//! pwm.set(channel, &[26], 1.0, 75.0)?;
//! pwm.enable(channel)?;
//! println!(
//!     "blinking at {:.3} Hz, {:.1} % duty",
//!     pwm.frequency(channel)?,
//!     pwm.duty_cycle(channel)?
//! );
//! # Ok(())
//! # }
//! ```
//!
//! # Requirements
//!
//! - Root: peripheral registers are reached through `/dev/mem`, and the
//!   control blocks live in uncached memory allocated via the firmware
//!   mailbox (`/dev/vcio`).
//! - A BCM2835, BCM2836/7 or BCM2711 board (Pi 1 through Pi 4 families).
//!
//! # Teardown
//!
//! The kernel does not return mailbox allocations when a process dies, so
//! the driver installs handlers for `HUP`/`INT`/`QUIT`/`TERM` that
//! release every channel before re-raising the signal. Embedders that own
//! their signal policy can opt out via [`pwm::SignalCleanup::Manual`];
//! dropping the driver performs the same cleanup.

pub mod board;
pub mod delay;
pub mod errors;
pub mod gpio;
pub mod mailbox;
pub mod mmio;
pub mod pwm;
pub mod uncached;

pub use crate::errors::{Error, Result};
pub use crate::pwm::{DmaPwmDriver, PwmPin, RegisterSnapshot, SignalCleanup};
