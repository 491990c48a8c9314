//! Crate error taxonomy.
//!
//! Every fallible operation of the engine reports one of the kinds below;
//! no panics cross the API boundary. Each kind also carries a stable
//! negative integer code (see [`Error::code`]) for callers that forward
//! results over FFI-style interfaces.

use core::fmt;

/// Convenience alias used throughout the crate.
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Failure kinds reported by the PWM engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum Error {
    /// `config` was called while at least one channel is requested.
    ChannelAlreadyRequested,
    /// Requested pulse width is outside the achievable range.
    InvalidPulseWidth,
    /// All DMA channels are already handed out.
    NoFreeChannel,
    /// Channel index out of range, or the slot was never requested.
    InvalidChannel,
    /// Duty cycle outside `0..=100` %.
    InvalidDuty,
    /// GPIO pin outside the bank driven by `GPSET0`/`GPCLR0`.
    InvalidGpio,
    /// The requested frequency needs a period shorter than one wait tick.
    FrequencyNotMet,
    /// `enable` was called before a signal was configured with `set`.
    PwmNotSet,
    /// The board revision could not be read or decoded.
    NoBoardIdentifier,
    /// Mapping peripheral registers into the process failed.
    MapFailed,
    /// Installing the termination signal handler failed.
    SignalHandlerFailed,
    /// Not enough uncached memory for the control-block sequence.
    OutOfMemory,
}

impl Error {
    /// Stable negative code of this error kind.
    pub const fn code(self) -> i32 {
        match self {
            Error::ChannelAlreadyRequested => -1,
            Error::InvalidPulseWidth => -2,
            Error::NoFreeChannel => -3,
            Error::InvalidChannel => -4,
            Error::InvalidDuty => -5,
            Error::InvalidGpio => -6,
            Error::FrequencyNotMet => -7,
            Error::PwmNotSet => -8,
            Error::NoBoardIdentifier => -9,
            Error::MapFailed => -10,
            Error::SignalHandlerFailed => -11,
            Error::OutOfMemory => -12,
        }
    }

    /// Inverse of [`Error::code`].
    pub const fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            -1 => Error::ChannelAlreadyRequested,
            -2 => Error::InvalidPulseWidth,
            -3 => Error::NoFreeChannel,
            -4 => Error::InvalidChannel,
            -5 => Error::InvalidDuty,
            -6 => Error::InvalidGpio,
            -7 => Error::FrequencyNotMet,
            -8 => Error::PwmNotSet,
            -9 => Error::NoBoardIdentifier,
            -10 => Error::MapFailed,
            -11 => Error::SignalHandlerFailed,
            -12 => Error::OutOfMemory,
            _ => return None,
        })
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let description = match self {
            Error::ChannelAlreadyRequested => "a channel has already been requested",
            Error::InvalidPulseWidth => "pulse width out of bounds",
            Error::NoFreeChannel => "no free DMA channel available",
            Error::InvalidChannel => "invalid or non-requested channel",
            Error::InvalidDuty => "duty cycle out of bounds",
            Error::InvalidGpio => "invalid GPIO pin",
            Error::FrequencyNotMet => "desired frequency cannot be met",
            Error::PwmNotSet => "no PWM signal set on the channel",
            Error::NoBoardIdentifier => "could not identify the board revision",
            Error::MapFailed => "peripheral memory mapping failed",
            Error::SignalHandlerFailed => "signal handler registration failed",
            Error::OutOfMemory => "not enough uncached memory allocated",
        };
        write!(f, "{description} ({})", self.code())
    }
}

impl std::error::Error for Error {}

impl embedded_hal::pwm::Error for Error {
    fn kind(&self) -> embedded_hal::pwm::ErrorKind {
        embedded_hal::pwm::ErrorKind::Other
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip() {
        for code in -12..=-1 {
            let err = Error::from_code(code).expect("every code in range maps to a kind");
            assert_eq!(err.code(), code);
        }
        assert_eq!(Error::from_code(0), None);
        assert_eq!(Error::from_code(-13), None);
    }

    #[test]
    fn display_includes_code() {
        assert!(Error::FrequencyNotMet.to_string().contains("-7"));
    }
}
