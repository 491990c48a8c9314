//! DMA-paced PWM engine.
//!
//! Drives arbitrary GPIOs with a PWM waveform generated entirely by the
//! DMA controller: each channel owns a circular control-block ring (see
//! [`sequence`]) whose wait blocks are paced by the PWM peripheral's DREQ
//! line. After [`DmaPwmDriver::enable`] the CPU is uninvolved.
//!
//! Channels are ping-pong buffered: [`DmaPwmDriver::set`] always writes
//! the inactive ring and a subsequent arm switches the DMA engine over in
//! a single `CONBLK_AD` write, so a running waveform is never disturbed
//! mid-period.
//!
//! # Examples
//!
//! Drive a servo on GPIO 18 at 50 Hz with a 7.5 % duty cycle:
//!
//! ```no_run
//! use dma_pwm::pwm::{config, DmaPwmDriver};
//!
//! # fn main() -> dma_pwm::Result<()> {
//! let mut pwm = DmaPwmDriver::new();
//! pwm.config(config::DEFAULT_PAGES, config::PULSE_WIDTH_SERVO_US)?;
//!
//! let channel = pwm.request()?;
//! pwm.set(channel, &[18], 50.0, 7.5)?;
//! pwm.enable(channel)?;
//! // ... the waveform now runs without CPU involvement ...
//! pwm.disable(channel)?;
//! pwm.free(channel)?;
//! # Ok(())
//! # }
//! ```
//!
//! The engine requires root (for `/dev/mem` and `/dev/vcio`) and is
//! single-threaded by construction: the driver is neither `Send` nor
//! `Sync`, and callers serialize externally if they must share it.

pub mod sequence;
pub mod timing;

use core::mem;
use core::ptr::{self, NonNull};
use core::sync::atomic::{fence, AtomicPtr, Ordering};

use log::{debug, trace, warn};

use crate::board::{self, BoardInfo, BoardProfile, CpuInfo};
use crate::delay::settle;
use crate::errors::{Error, Result};
use crate::gpio;
use crate::mailbox::Mailbox;
use crate::mmio::{
    self, cm_divisor, dma_cs_panic_priority, dma_cs_priority, pwm_dmac_thresholds, DevMem,
    DmaChannelRegisters, GpioRegisters, PeripheralMapper, PwmClockRegisters, PwmRegisters,
    CM_ENAB, CM_PASSWORD, CM_SRC_PLLD, DMA_CHANNEL_STRIDE, DMA_CS_ABORT, DMA_CS_ACTIVE,
    DMA_CS_END, DMA_CS_RESET, DMA_CS_WAIT_FOR_OUTSTANDING_WRITES, PWM_CLOCK_CTL_OFFSET,
    PWM_CTL_CLRF1, PWM_CTL_PWEN1, PWM_CTL_USEF1, PWM_DMAC_ENAB,
};
use crate::pwm::sequence::SequenceTargets;
use crate::pwm::timing::{ClockSettings, SignalTiming};
use crate::uncached::{UncachedAllocator, UncachedMem};

/// Engine tuning defaults and pulse-width presets.
pub mod config {
    /// Uncached pages reserved per control-block buffer.
    pub const DEFAULT_PAGES: usize = 16;

    /// Tick width for LED-style dimming: 5 ms.
    pub const PULSE_WIDTH_LED_US: f64 = 5000.0;
    /// Tick width for hobby servos: 50 µs.
    pub const PULSE_WIDTH_SERVO_US: f64 = 50.0;
}

/// Logical channels the engine manages.
pub const NUM_CHANNELS: usize = 7;

// Physical DMA channel behind each logical slot. Channels 0-3 and 5-7
// belong to the firmware and the OS and must not be touched.
const DMA_CHANNEL_MAP: [usize; NUM_CHANNELS] = [10, 8, 9, 11, 12, 13, 14];

// Bus priority used when arming a channel.
const DMA_PRIORITY: u32 = 7;

// FIFO fill levels at which the PWM peripheral asserts DREQ / panic.
const DREQ_THRESHOLD: u32 = 15;
const PANIC_THRESHOLD: u32 = 15;

/// Whether the engine installs termination-signal handlers on bring-up.
///
/// The OS does not reclaim mailbox memory on process exit, so *something*
/// must release it even when the process dies to a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalCleanup {
    /// Catch `HUP`/`INT`/`QUIT`/`TERM`, tear every channel down, then
    /// re-raise the signal with its default disposition.
    Automatic,
    /// The embedder owns signal policy; only [`DmaPwmDriver::free`] and
    /// `Drop` reclaim memory.
    Manual,
}

/// Raw register values captured by [`DmaPwmDriver::registers`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterSnapshot {
    /// PWM controller CTL.
    pub pwm_ctl: u32,
    /// PWM controller STA.
    pub pwm_sta: u32,
    /// PWM controller DMAC.
    pub pwm_dmac: u32,
    /// PWM clock manager CTL.
    pub clock_ctl: u32,
    /// PWM clock manager DIV.
    pub clock_div: u32,
    /// The channel's DMA CS.
    pub dma_cs: u32,
    /// The channel's DMA DEBUG.
    pub dma_debug: u32,
}

#[derive(Default)]
struct BufferSlot {
    cb_region: Option<UncachedMem>,
    set_mask: Option<UncachedMem>,
    clear_mask: Option<UncachedMem>,
}

struct Channel {
    buffers: [BufferSlot; 2],
    dma_reg: Option<NonNull<DmaChannelRegisters>>,
    freq_desired_hz: f64,
    duty_desired_pct: f64,
    timing: Option<SignalTiming>,
    enabled: bool,
    active_buf: usize,
    sequence_built: bool,
}

impl Channel {
    fn unused() -> Self {
        Channel {
            buffers: [BufferSlot::default(), BufferSlot::default()],
            dma_reg: None,
            freq_desired_hz: 0.0,
            duty_desired_pct: 0.0,
            timing: None,
            enabled: false,
            // The first `set` writes buffer 0.
            active_buf: 1,
            sequence_built: false,
        }
    }
}

struct Inner {
    board: Box<dyn BoardInfo>,
    mapper: Box<dyn PeripheralMapper>,
    allocator: Box<dyn UncachedAllocator>,
    signal_cleanup: SignalCleanup,
    initialized: bool,
    page_size: usize,
    pages: usize,
    clock: ClockSettings,
    profile: Option<BoardProfile>,
    gpio_regs: Option<NonNull<GpioRegisters>>,
    dma_base: Option<NonNull<u32>>,
    pwm_regs: Option<NonNull<PwmRegisters>>,
    clock_regs: Option<NonNull<PwmClockRegisters>>,
    channels: [Channel; NUM_CHANNELS],
    channel_free: [bool; NUM_CHANNELS],
}

/// The PWM engine.
///
/// Construct once; peripheral bring-up happens lazily on the first
/// successful [`request`](DmaPwmDriver::request). Dropping the driver
/// disables every channel and returns all uncached memory.
pub struct DmaPwmDriver {
    inner: Box<Inner>,
}

impl DmaPwmDriver {
    /// Engine with the production collaborators: `/proc/cpuinfo` board
    /// detection, `/dev/mem` mappings, mailbox memory and automatic
    /// signal cleanup.
    pub fn new() -> Self {
        Self::with_parts(
            Box::new(CpuInfo),
            Box::new(DevMem),
            Box::new(Mailbox),
            SignalCleanup::Automatic,
        )
    }

    /// Engine with injected collaborators.
    pub fn with_parts(
        board: Box<dyn BoardInfo>,
        mapper: Box<dyn PeripheralMapper>,
        allocator: Box<dyn UncachedAllocator>,
        signal_cleanup: SignalCleanup,
    ) -> Self {
        DmaPwmDriver {
            inner: Box::new(Inner {
                board,
                mapper,
                allocator,
                signal_cleanup,
                initialized: false,
                page_size: mmio::page_size(),
                pages: config::DEFAULT_PAGES,
                clock: ClockSettings::default_tick(),
                profile: None,
                gpio_regs: None,
                dma_base: None,
                pwm_regs: None,
                clock_regs: None,
                channels: std::array::from_fn(|_| Channel::unused()),
                channel_free: [true; NUM_CHANNELS],
            }),
        }
    }

    /// Set buffer size and pulse width for subsequent channels.
    ///
    /// Fails with [`Error::ChannelAlreadyRequested`] while any channel is
    /// handed out: the clock settings are global, and live rings were
    /// dimensioned for the old tick. If the hardware was already brought
    /// up the new divisor only reaches it on a future bring-up; the
    /// settings still govern all following `set` computations.
    pub fn config(&mut self, pages: usize, pulse_width_us: f64) -> Result<()> {
        let inner = &mut *self.inner;
        if inner.channel_free.iter().any(|&free| !free) {
            return Err(Error::ChannelAlreadyRequested);
        }
        if pages == 0 {
            return Err(Error::OutOfMemory);
        }

        let clock = timing::solve_pulse_width(pulse_width_us)?;
        debug!(
            "config: {pages} pages, pulse width {:.3} µs (divisor {}, range {})",
            clock.pulse_width_us, clock.divisor, clock.range
        );
        if inner.initialized {
            warn!("engine already initialized; clock settings are advisory until re-init");
        }

        inner.pages = pages;
        inner.clock = clock;
        Ok(())
    }

    /// Claim the lowest free channel.
    ///
    /// The first successful request performs global bring-up: signal
    /// handlers, board detection, peripheral mappings and PWM clock /
    /// controller programming.
    pub fn request(&mut self) -> Result<usize> {
        self.inner.initialize()?;

        let inner = &mut *self.inner;
        let Some(channel) = inner.channel_free.iter().position(|&free| free) else {
            return Err(Error::NoFreeChannel);
        };
        inner.prepare_channel(channel)?;
        inner.channel_free[channel] = false;

        debug!(
            "channel {channel} requested (DMA channel {})",
            DMA_CHANNEL_MAP[channel]
        );
        Ok(channel)
    }

    /// Configure the waveform of a requested channel.
    ///
    /// Builds the control-block ring for `(freq_hz, duty_pct)` on `gpios`
    /// in the channel's inactive buffer and swaps it in. If the channel is
    /// already enabled the DMA engine is re-armed on the new ring, so a
    /// running waveform transitions at a single period boundary.
    pub fn set(
        &mut self,
        channel: usize,
        gpios: &[u8],
        freq_hz: f64,
        duty_pct: f64,
    ) -> Result<()> {
        let inner = &mut *self.inner;
        inner.check_channel(channel)?;
        if !(0.0..=100.0).contains(&duty_pct) {
            return Err(Error::InvalidDuty);
        }
        gpio::validate(gpios)?;

        let timing = timing::derive_signal(
            freq_hz,
            duty_pct,
            inner.clock.pulse_width_us,
            inner.page_size,
            inner.pages,
        )?;

        let profile = inner.profile.ok_or(Error::MapFailed)?;
        let gpio_regs = inner.gpio_regs.ok_or(Error::MapFailed)?;

        let mask = gpio::mask_of(gpios);
        for &pin in gpios {
            unsafe { gpio::set_output(gpio_regs.as_ref(), pin) };
        }

        let slot = &mut inner.channels[channel];
        let inactive = 1 - slot.active_buf;
        let half = &mut slot.buffers[inactive];

        let set_mem = half.set_mask.as_ref().ok_or(Error::InvalidChannel)?;
        let clear_mem = half.clear_mask.as_ref().ok_or(Error::InvalidChannel)?;
        unsafe {
            set_mem.virt().as_ptr().cast::<u32>().write_volatile(mask);
            clear_mem.virt().as_ptr().cast::<u32>().write_volatile(mask);
        }
        let set_mask_bus = set_mem.bus_addr();
        let clear_mask_bus = clear_mem.bus_addr();

        let cb_region = half.cb_region.as_mut().ok_or(Error::InvalidChannel)?;
        sequence::build(
            cb_region,
            &timing,
            duty_pct,
            set_mask_bus,
            clear_mask_bus,
            SequenceTargets {
                gpset0: profile.gpset0_bus(),
                gpclr0: profile.gpclr0_bus(),
                pwm_fifo: profile.pwm_fifo_bus(),
            },
        )?;

        slot.freq_desired_hz = freq_hz;
        slot.duty_desired_pct = duty_pct;
        slot.timing = Some(timing);
        slot.active_buf = inactive;
        slot.sequence_built = true;
        let was_enabled = slot.enabled;

        trace!(
            "channel {channel}: mask {mask:#010x}, {} CBs on buffer {inactive} \
             ({} set / {} clear waits), duty {:.4} % at {:.4} Hz",
            timing.cb_total,
            timing.wait_set,
            timing.wait_clear,
            timing.duty_actual_pct,
            timing.frequency_actual_hz,
        );

        if was_enabled {
            self.enable(channel)?;
        }
        Ok(())
    }

    /// Arm the channel's DMA engine on its active ring.
    pub fn enable(&mut self, channel: usize) -> Result<()> {
        let inner = &mut *self.inner;
        inner.check_channel(channel)?;

        let slot = &mut inner.channels[channel];
        if !slot.sequence_built {
            return Err(Error::PwmNotSet);
        }
        let regs = slot.dma_reg.ok_or(Error::InvalidChannel)?;
        let first_cb = slot.buffers[slot.active_buf]
            .cb_region
            .as_ref()
            .ok_or(Error::InvalidChannel)?
            .bus_addr();

        unsafe {
            let regs = regs.as_ref();
            regs.cs.modify(|cs| cs | DMA_CS_ABORT);
            settle();
            regs.cs.modify(|cs| cs & !DMA_CS_ACTIVE);
            regs.cs.modify(|cs| cs | DMA_CS_END);
            regs.cs.modify(|cs| cs | DMA_CS_RESET);
            settle();

            // The ring and the reset must be visible before the arm.
            fence(Ordering::Release);
            regs.conblk_ad.write(first_cb);
            regs.cs.write(
                dma_cs_panic_priority(DMA_PRIORITY)
                    | dma_cs_priority(DMA_PRIORITY)
                    | DMA_CS_WAIT_FOR_OUTSTANDING_WRITES,
            );
            regs.cs.modify(|cs| cs | DMA_CS_ACTIVE);
        }

        slot.enabled = true;
        debug!(
            "channel {channel} armed at CB {first_cb:#010x} ({:.3} Hz / {:.3} % requested)",
            slot.freq_desired_hz, slot.duty_desired_pct
        );
        Ok(())
    }

    /// Stop the channel and drive all of its pins low.
    ///
    /// Idempotent; the channel keeps its ring and can be re-enabled.
    pub fn disable(&mut self, channel: usize) -> Result<()> {
        self.inner.check_channel(channel)?;
        self.inner.halt_channel(channel);
        debug!("channel {channel} disabled");
        Ok(())
    }

    /// Disable the channel and return its uncached memory.
    pub fn free(&mut self, channel: usize) -> Result<()> {
        self.inner.check_channel(channel)?;
        self.inner.teardown_channel(channel);
        debug!("channel {channel} freed");
        Ok(())
    }

    /// Frequency the channel actually generates, in Hz.
    ///
    /// `0.0` until a signal has been set.
    pub fn frequency(&self, channel: usize) -> Result<f64> {
        self.inner.check_channel(channel)?;
        Ok(self.inner.channels[channel]
            .timing
            .map_or(0.0, |t| t.frequency_actual_hz))
    }

    /// Duty cycle the channel actually generates, in percent.
    ///
    /// `0.0` until a signal has been set.
    pub fn duty_cycle(&self, channel: usize) -> Result<f64> {
        self.inner.check_channel(channel)?;
        Ok(self.inner.channels[channel]
            .timing
            .map_or(0.0, |t| t.duty_actual_pct))
    }

    /// The engine's tick duration in µs.
    pub fn pulse_width(&self) -> f64 {
        self.inner.clock.pulse_width_us
    }

    /// Snapshot of the PWM, clock-manager and DMA registers backing
    /// `channel`.
    pub fn registers(&self, channel: usize) -> Result<RegisterSnapshot> {
        let inner = &*self.inner;
        inner.check_channel(channel)?;

        let pwm = inner.pwm_regs.ok_or(Error::MapFailed)?;
        let clock = inner.clock_regs.ok_or(Error::MapFailed)?;
        let dma = inner.channels[channel]
            .dma_reg
            .ok_or(Error::InvalidChannel)?;

        unsafe {
            let pwm = pwm.as_ref();
            let clock = clock.as_ref();
            let dma = dma.as_ref();
            Ok(RegisterSnapshot {
                pwm_ctl: pwm.ctl.read(),
                pwm_sta: pwm.sta.read(),
                pwm_dmac: pwm.dmac.read(),
                clock_ctl: clock.ctl.read(),
                clock_div: clock.div.read(),
                dma_cs: dma.cs.read(),
                dma_debug: dma.debug.read(),
            })
        }
    }

    /// [`embedded_hal::pwm::SetDutyCycle`] view of a requested channel.
    ///
    /// Duty is scaled over the pin's maximum duty value; updates go
    /// through [`set`](DmaPwmDriver::set) and fail the same way.
    pub fn pwm_pin(&mut self, channel: usize, gpios: &[u8], freq_hz: f64) -> Result<PwmPin<'_>> {
        self.inner.check_channel(channel)?;
        gpio::validate(gpios)?;
        Ok(PwmPin {
            driver: self,
            channel,
            gpios: gpios.to_vec(),
            freq_hz,
        })
    }
}

impl Drop for DmaPwmDriver {
    fn drop(&mut self) {
        let inner = &mut *self.inner;
        let _ = ACTIVE_ENGINE.compare_exchange(
            inner as *mut Inner,
            ptr::null_mut(),
            Ordering::AcqRel,
            Ordering::Relaxed,
        );
        inner.teardown_all();
    }
}

impl Inner {
    fn check_channel(&self, channel: usize) -> Result<()> {
        if channel >= NUM_CHANNELS || self.channel_free[channel] {
            return Err(Error::InvalidChannel);
        }
        Ok(())
    }

    /// One-time bring-up; leaves the engine uninitialized on failure so a
    /// later request can retry.
    fn initialize(&mut self) -> Result<()> {
        if self.initialized {
            return Ok(());
        }

        if self.signal_cleanup == SignalCleanup::Automatic {
            install_signal_handler()?;
        }

        let profile = BoardProfile::detect(&*self.board)?;
        let gpio_regs = self
            .mapper
            .map(profile.phys_base + board::GPIO_OFFSET)?
            .cast::<GpioRegisters>();
        let dma_base = self.mapper.map(profile.phys_base + board::DMA_OFFSET)?;
        let pwm_regs = self
            .mapper
            .map(profile.phys_base + board::PWM_OFFSET)?
            .cast::<PwmRegisters>();
        let clock_page = self.mapper.map(profile.phys_base + board::CLOCK_OFFSET)?;
        let clock_regs = NonNull::new(
            unsafe { clock_page.as_ptr().cast::<u8>().add(PWM_CLOCK_CTL_OFFSET) }
                .cast::<PwmClockRegisters>(),
        )
        .ok_or(Error::MapFailed)?;

        unsafe {
            program_hardware(pwm_regs.as_ref(), clock_regs.as_ref(), &self.clock);
        }

        self.profile = Some(profile);
        self.gpio_regs = Some(gpio_regs);
        self.dma_base = Some(dma_base);
        self.pwm_regs = Some(pwm_regs);
        self.clock_regs = Some(clock_regs);
        self.initialized = true;

        if self.signal_cleanup == SignalCleanup::Automatic {
            ACTIVE_ENGINE.store(self as *mut Inner, Ordering::Release);
        }

        debug!(
            "engine initialized: divisor {}, range {}, tick {:.3} µs",
            self.clock.divisor, self.clock.range, self.clock.pulse_width_us
        );
        Ok(())
    }

    /// Allocate both buffer halves of a slot and locate its register bank.
    fn prepare_channel(&mut self, channel: usize) -> Result<()> {
        let halves = self.alloc_halves()?;

        let dma_base = self.dma_base.ok_or(Error::MapFailed)?;
        let bank = unsafe {
            dma_base
                .as_ptr()
                .cast::<u8>()
                .add(DMA_CHANNEL_STRIDE * DMA_CHANNEL_MAP[channel])
        }
        .cast::<DmaChannelRegisters>();

        let slot = &mut self.channels[channel];
        *slot = Channel::unused();
        slot.buffers = halves;
        slot.dma_reg = NonNull::new(bank);
        Ok(())
    }

    /// Allocate the six uncached regions of one slot. A request that
    /// fails mid-way hands back everything it already acquired.
    fn alloc_halves(&mut self) -> Result<[BufferSlot; 2]> {
        let cb_bytes = self.pages * self.page_size;
        let page_size = self.page_size;

        let mut halves = [BufferSlot::default(), BufferSlot::default()];
        let mut failure = None;

        'fill: for half in &mut halves {
            match self.allocator.alloc(cb_bytes, page_size) {
                Ok(mem) => half.cb_region = Some(mem),
                Err(err) => {
                    failure = Some(err);
                    break 'fill;
                }
            }
            for mask in [&mut half.set_mask, &mut half.clear_mask] {
                match self.allocator.alloc(4, 4) {
                    Ok(mem) => {
                        // The masks drive disable-time pin clearing;
                        // start them empty.
                        unsafe { mem.virt().as_ptr().cast::<u32>().write_volatile(0) };
                        *mask = Some(mem);
                    }
                    Err(err) => {
                        failure = Some(err);
                        break 'fill;
                    }
                }
            }
        }

        match failure {
            None => Ok(halves),
            Some(err) => {
                for half in &mut halves {
                    for mem in [
                        half.cb_region.take(),
                        half.set_mask.take(),
                        half.clear_mask.take(),
                    ]
                    .into_iter()
                    .flatten()
                    {
                        let _ = self.allocator.release(mem);
                    }
                }
                Err(err)
            }
        }
    }

    /// Abort and reset the channel's DMA engine, then force its pins low.
    ///
    /// No logging, no allocation: shared with the signal handler.
    fn halt_channel(&mut self, channel: usize) {
        let gpio_regs = self.gpio_regs;
        let slot = &mut self.channels[channel];

        if let Some(regs) = slot.dma_reg {
            unsafe {
                let regs = regs.as_ref();
                regs.cs.modify(|cs| cs | DMA_CS_ABORT);
                settle();
                regs.cs.modify(|cs| cs & !DMA_CS_ACTIVE);
                regs.cs.modify(|cs| cs | DMA_CS_END);
                regs.cs.modify(|cs| cs | DMA_CS_RESET);
                settle();
            }
        }

        if let (Some(gpio_regs), Some(set_mask)) = (
            gpio_regs,
            slot.buffers[slot.active_buf].set_mask.as_ref(),
        ) {
            let mask = unsafe { set_mask.virt().as_ptr().cast::<u32>().read_volatile() };
            for pin in 0..=gpio::MAX_PIN {
                if mask & (1 << pin) != 0 {
                    unsafe { gpio::clear_pin(gpio_regs.as_ref(), pin) };
                }
            }
        }

        slot.enabled = false;
    }

    /// Halt the channel and return its six uncached regions.
    ///
    /// No logging, no allocation: shared with the signal handler.
    fn teardown_channel(&mut self, channel: usize) {
        self.halt_channel(channel);

        for half in 0..2 {
            let regions = {
                let buffer = &mut self.channels[channel].buffers[half];
                [
                    buffer.cb_region.take(),
                    buffer.set_mask.take(),
                    buffer.clear_mask.take(),
                ]
            };
            for mem in regions.into_iter().flatten() {
                let _ = self.allocator.release(mem);
            }
        }

        self.channels[channel] = Channel::unused();
        self.channel_free[channel] = true;
    }

    /// Tear down every live channel. Signal-handler and `Drop` path.
    fn teardown_all(&mut self) {
        for channel in 0..NUM_CHANNELS {
            if !self.channel_free[channel] {
                self.teardown_channel(channel);
            }
        }
    }
}

/// Program the PWM clock manager and controller, one settle pause after
/// every write as the data sheet demands.
unsafe fn program_hardware(pwm: &PwmRegisters, clock: &PwmClockRegisters, settings: &ClockSettings) {
    clock.ctl.write(0);
    settle();
    clock.ctl.write(CM_PASSWORD | CM_SRC_PLLD);
    settle();
    clock.div.write(CM_PASSWORD | cm_divisor(settings.divisor));
    settle();
    clock.ctl.write(CM_PASSWORD | CM_SRC_PLLD | CM_ENAB);
    settle();

    pwm.ctl.write(0);
    settle();
    pwm.rng1.write(settings.range);
    settle();
    pwm.dmac
        .write(PWM_DMAC_ENAB | pwm_dmac_thresholds(DREQ_THRESHOLD, PANIC_THRESHOLD));
    settle();
    pwm.ctl.write(PWM_CTL_CLRF1);
    settle();
    pwm.ctl.write(PWM_CTL_USEF1 | PWM_CTL_PWEN1);
    settle();
}

// The engine whose channels the termination handler must release.
static ACTIVE_ENGINE: AtomicPtr<Inner> = AtomicPtr::new(ptr::null_mut());

const TERMINATION_SIGNALS: [libc::c_int; 4] =
    [libc::SIGHUP, libc::SIGINT, libc::SIGQUIT, libc::SIGTERM];

fn install_signal_handler() -> Result<()> {
    unsafe {
        let mut action: libc::sigaction = mem::zeroed();
        libc::sigemptyset(&mut action.sa_mask);
        action.sa_sigaction = handle_termination
            as extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut libc::c_void)
            as usize;
        action.sa_flags = libc::SA_SIGINFO;

        for signal in TERMINATION_SIGNALS {
            if libc::sigaction(signal, &action, ptr::null_mut()) < 0 {
                return Err(Error::SignalHandlerFailed);
            }
        }
    }
    Ok(())
}

// Async-signal-safe by construction: the teardown path is register
// writes, `nanosleep`, `munmap` and single-ioctl mailbox transactions.
// No locks, no allocation, no stdio.
extern "C" fn handle_termination(
    signal: libc::c_int,
    _info: *mut libc::siginfo_t,
    _context: *mut libc::c_void,
) {
    let engine = ACTIVE_ENGINE.swap(ptr::null_mut(), Ordering::AcqRel);
    if !engine.is_null() {
        unsafe { (*engine).teardown_all() };
    }
    unsafe {
        libc::signal(signal, libc::SIG_DFL);
        libc::raise(signal);
    }
}

/// [`embedded_hal::pwm::SetDutyCycle`] adapter for one channel.
///
/// Duty updates re-run [`DmaPwmDriver::set`] with the pin list and
/// frequency captured at construction.
pub struct PwmPin<'d> {
    driver: &'d mut DmaPwmDriver,
    channel: usize,
    gpios: Vec<u8>,
    freq_hz: f64,
}

// Duty is expressed in hundredths of a percent.
const HAL_DUTY_STEPS: u16 = 10_000;

impl embedded_hal::pwm::ErrorType for PwmPin<'_> {
    type Error = Error;
}

impl embedded_hal::pwm::SetDutyCycle for PwmPin<'_> {
    fn max_duty_cycle(&self) -> u16 {
        HAL_DUTY_STEPS
    }

    fn set_duty_cycle(&mut self, duty: u16) -> Result<()> {
        let duty = duty.min(HAL_DUTY_STEPS);
        self.driver.set(
            self.channel,
            &self.gpios,
            self.freq_hz,
            f64::from(duty) / 100.0,
        )
    }
}
