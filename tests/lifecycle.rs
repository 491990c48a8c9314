//! Channel lifecycle tests against in-memory collaborators.
//!
//! The engine's board detection, peripheral mappings and uncached memory
//! are injected, so the full request/set/enable/disable/free state
//! machine runs on plain RAM: register writes land in fake peripheral
//! pages and control-block rings land in ordinary heap allocations with
//! synthetic bus addresses.

use std::alloc::Layout;
use std::cell::RefCell;
use std::collections::HashMap;
use std::ptr::NonNull;
use std::rc::Rc;

use dma_pwm::board::BoardInfo;
use dma_pwm::mmio::PeripheralMapper;
use dma_pwm::pwm::{config, DmaPwmDriver, SignalCleanup, NUM_CHANNELS};
use dma_pwm::uncached::{UncachedAllocator, UncachedMem};
use dma_pwm::{Error, Result};

// Pi 3 Model B: peripherals at 0x3F00_0000, bus alias 0x7E00_0000.
const REVISION: &str = "a02082";
const GPIO_PAGE: u32 = 0x3F20_0000;
const DMA_PAGE: u32 = 0x3F00_7000;
const PWM_PAGE: u32 = 0x3F20_C000;
const CLOCK_PAGE: u32 = 0x3F10_1000;

// Logical channel 0 runs on physical DMA channel 10.
const CH0_BANK: usize = 10 * 0x100;

struct FixedBoard(&'static str);

impl BoardInfo for FixedBoard {
    fn revision(&self) -> Result<String> {
        if self.0.is_empty() {
            return Err(Error::NoBoardIdentifier);
        }
        Ok(self.0.to_owned())
    }
}

/// Hands out zeroed pages keyed by physical address and lets tests read
/// the registers the engine wrote.
#[derive(Clone, Default)]
struct FakePeripherals {
    pages: Rc<RefCell<HashMap<u32, Box<[u32; 1024]>>>>,
}

impl FakePeripherals {
    fn read(&self, phys: u32, byte_offset: usize) -> u32 {
        self.pages.borrow()[&phys][byte_offset / 4]
    }
}

impl PeripheralMapper for FakePeripherals {
    fn map(&self, phys_addr: u32) -> Result<NonNull<u32>> {
        let mut pages = self.pages.borrow_mut();
        let page = pages
            .entry(phys_addr)
            .or_insert_with(|| Box::new([0u32; 1024]));
        NonNull::new(page.as_mut_ptr()).ok_or(Error::MapFailed)
    }
}

struct Allocation {
    handle: u32,
    bus: u32,
    ptr: *mut u8,
    layout: Layout,
}

#[derive(Default)]
struct AllocState {
    live: Vec<Allocation>,
    allocated: usize,
    released: usize,
    next_bus: u32,
    fail_from: Option<usize>,
}

/// Heap-backed stand-in for the mailbox allocator with synthetic bus
/// addresses.
#[derive(Clone, Default)]
struct FakeUncached {
    state: Rc<RefCell<AllocState>>,
}

impl FakeUncached {
    fn counts(&self) -> (usize, usize, usize) {
        let s = self.state.borrow();
        (s.allocated, s.released, s.live.len())
    }

    /// Bus address of the n-th allocation ever made (1-based handles).
    fn bus_of(&self, handle: u32) -> u32 {
        self.state
            .borrow()
            .live
            .iter()
            .find(|a| a.handle == handle)
            .map(|a| a.bus)
            .expect("allocation is live")
    }

    fn fail_from(&self, nth: usize) {
        self.state.borrow_mut().fail_from = Some(nth);
    }

    fn fail_never(&self) {
        self.state.borrow_mut().fail_from = None;
    }
}

impl UncachedAllocator for FakeUncached {
    fn alloc(&mut self, size: usize, align: usize) -> Result<UncachedMem> {
        let mut s = self.state.borrow_mut();
        if let Some(nth) = s.fail_from {
            if s.allocated >= nth {
                return Err(Error::OutOfMemory);
            }
        }

        let layout = Layout::from_size_align(size, align).map_err(|_| Error::OutOfMemory)?;
        let ptr = NonNull::new(unsafe { std::alloc::alloc_zeroed(layout) })
            .ok_or(Error::OutOfMemory)?;

        if s.next_bus == 0 {
            s.next_bus = 0xC000_0000;
        }
        let align = align as u32;
        let bus = (s.next_bus + align - 1) & !(align - 1);
        s.next_bus = bus + size as u32;

        s.allocated += 1;
        let handle = s.allocated as u32;
        s.live.push(Allocation {
            handle,
            bus,
            ptr: ptr.as_ptr(),
            layout,
        });
        Ok(UncachedMem::new(size, ptr, bus, handle))
    }

    fn release(&mut self, mem: UncachedMem) -> Result<()> {
        let mut s = self.state.borrow_mut();
        let index = s
            .live
            .iter()
            .position(|a| a.handle == mem.handle())
            .expect("regions are never released twice");
        let allocation = s.live.swap_remove(index);
        unsafe { std::alloc::dealloc(allocation.ptr, allocation.layout) };
        s.released += 1;
        Ok(())
    }
}

fn engine() -> (DmaPwmDriver, FakePeripherals, FakeUncached) {
    engine_on(REVISION)
}

fn engine_on(revision: &'static str) -> (DmaPwmDriver, FakePeripherals, FakeUncached) {
    let periph = FakePeripherals::default();
    let alloc = FakeUncached::default();
    let driver = DmaPwmDriver::with_parts(
        Box::new(FixedBoard(revision)),
        Box::new(periph.clone()),
        Box::new(alloc.clone()),
        SignalCleanup::Manual,
    );
    (driver, periph, alloc)
}

#[test]
fn request_brings_up_the_hardware_once() {
    let (mut pwm, periph, _alloc) = engine();
    pwm.config(config::DEFAULT_PAGES, config::PULSE_WIDTH_SERVO_US)
        .unwrap();
    let channel = pwm.request().unwrap();
    assert_eq!(channel, 0);

    // Clock manager: PLLD, enabled, divisor 250 for a 50 µs tick.
    assert_eq!(periph.read(CLOCK_PAGE, 0xA0), 0x5A00_0016);
    assert_eq!(periph.read(CLOCK_PAGE, 0xA4), 0x5A00_0000 | (250 << 12));
    // Controller: FIFO mode, channel 1 enabled, DMA thresholds at 15.
    assert_eq!(periph.read(PWM_PAGE, 0x00), (1 << 5) | (1 << 0));
    assert_eq!(periph.read(PWM_PAGE, 0x08), 0x8000_0000 | (15 << 8) | 15);
    assert_eq!(periph.read(PWM_PAGE, 0x10), 100);
}

#[test]
fn channels_hand_out_lowest_free_first_and_run_dry() {
    let (mut pwm, _periph, alloc) = engine();
    for expected in 0..NUM_CHANNELS {
        assert_eq!(pwm.request().unwrap(), expected);
    }
    assert_eq!(pwm.request(), Err(Error::NoFreeChannel));

    // Six uncached regions per channel.
    let (allocated, _, live) = alloc.counts();
    assert_eq!(allocated, 6 * NUM_CHANNELS);
    assert_eq!(live, 6 * NUM_CHANNELS);

    // Freeing the middle slot makes it the next one handed out.
    pwm.free(3).unwrap();
    assert_eq!(pwm.request().unwrap(), 3);
}

#[test]
fn config_is_rejected_while_channels_are_live() {
    let (mut pwm, _periph, _alloc) = engine();
    let channel = pwm.request().unwrap();
    assert_eq!(
        pwm.config(16, 5000.0),
        Err(Error::ChannelAlreadyRequested)
    );
    pwm.free(channel).unwrap();
    pwm.config(16, 5000.0).unwrap();
}

#[test]
fn config_validates_its_inputs() {
    let (mut pwm, _periph, _alloc) = engine();
    assert_eq!(pwm.config(0, 50.0), Err(Error::OutOfMemory));
    assert_eq!(pwm.config(16, 0.4), Err(Error::InvalidPulseWidth));
    assert_eq!(pwm.config(16, 4e10), Err(Error::InvalidPulseWidth));
    pwm.config(16, 0.401).unwrap();
    // Default tick before any config.
    let (mut fresh, _p, _a) = engine();
    assert_eq!(fresh.pulse_width(), 10.0);
    fresh.config(16, 50.0).unwrap();
    assert_eq!(fresh.pulse_width(), 50.0);
}

#[test]
fn set_validates_channel_duty_and_pins() {
    let (mut pwm, _periph, _alloc) = engine();
    assert_eq!(pwm.set(0, &[18], 50.0, 50.0), Err(Error::InvalidChannel));

    let channel = pwm.request().unwrap();
    assert_eq!(
        pwm.set(channel + 1, &[18], 50.0, 50.0),
        Err(Error::InvalidChannel)
    );
    assert_eq!(pwm.set(99, &[18], 50.0, 50.0), Err(Error::InvalidChannel));
    assert_eq!(pwm.set(channel, &[18], 50.0, -0.1), Err(Error::InvalidDuty));
    assert_eq!(
        pwm.set(channel, &[18], 50.0, 100.1),
        Err(Error::InvalidDuty)
    );
    assert_eq!(pwm.set(channel, &[32], 50.0, 50.0), Err(Error::InvalidGpio));

    // 10 µs default tick: 100 kHz has no room for a single wait tick.
    assert_eq!(
        pwm.set(channel, &[18], 100_000.0, 50.0),
        Err(Error::FrequencyNotMet)
    );
    // And 0.5 Hz wants 25 pages when only 16 are configured.
    assert_eq!(
        pwm.set(channel, &[18], 0.5, 50.0),
        Err(Error::OutOfMemory)
    );
}

#[test]
fn enable_needs_a_signal_first() {
    let (mut pwm, _periph, _alloc) = engine();
    let channel = pwm.request().unwrap();
    assert_eq!(pwm.enable(channel), Err(Error::PwmNotSet));
    pwm.set(channel, &[18], 50.0, 50.0).unwrap();
    pwm.enable(channel).unwrap();
}

#[test]
fn set_then_enable_reports_the_realized_signal() {
    let (mut pwm, periph, _alloc) = engine();
    pwm.config(config::DEFAULT_PAGES, config::PULSE_WIDTH_SERVO_US)
        .unwrap();
    let channel = pwm.request().unwrap();
    pwm.set(channel, &[18], 50.0, 7.5).unwrap();
    pwm.enable(channel).unwrap();

    // 20 ms subcycle over 50 µs ticks: 200 waits, 0.5 % resolution.
    assert_eq!(pwm.frequency(channel).unwrap(), 50.0);
    assert_eq!(pwm.duty_cycle(channel).unwrap(), 7.5);

    // GPIO 18 switched to output: FSEL1, field 8, mode 001.
    assert_eq!(periph.read(GPIO_PAGE, 0x04), 1 << 24);

    // Armed: priorities 7, wait-for-writes, active.
    assert_eq!(periph.read(DMA_PAGE, CH0_BANK), 0x1077_0001);

    let snapshot = pwm.registers(channel).unwrap();
    assert_eq!(snapshot.dma_cs, 0x1077_0001);
    assert_eq!(snapshot.pwm_ctl, (1 << 5) | (1 << 0));
    assert_eq!(snapshot.clock_ctl, 0x5A00_0016);
    assert_eq!(snapshot.clock_div, 0x5A00_0000 | (250 << 12));
    assert_eq!(snapshot.pwm_sta, 0);
}

#[test]
fn introspection_before_set_reads_zero() {
    let (mut pwm, _periph, _alloc) = engine();
    let channel = pwm.request().unwrap();
    assert_eq!(pwm.frequency(channel).unwrap(), 0.0);
    assert_eq!(pwm.duty_cycle(channel).unwrap(), 0.0);
    assert_eq!(pwm.frequency(channel + 1), Err(Error::InvalidChannel));
}

#[test]
fn successive_sets_ping_pong_between_the_buffers() {
    let (mut pwm, periph, alloc) = engine();
    pwm.config(config::DEFAULT_PAGES, config::PULSE_WIDTH_SERVO_US)
        .unwrap();
    let channel = pwm.request().unwrap();

    // Allocation order per channel: CB half 0, masks, CB half 1, masks.
    let cb_half0 = alloc.bus_of(1);
    let cb_half1 = alloc.bus_of(4);

    // The first signal lands in buffer half 0.
    pwm.set(channel, &[18], 50.0, 7.5).unwrap();
    pwm.enable(channel).unwrap();
    assert_eq!(periph.read(DMA_PAGE, CH0_BANK + 4), cb_half0);

    // An update on a live channel re-arms on the other half.
    pwm.set(channel, &[18], 100.0, 50.0).unwrap();
    assert_eq!(periph.read(DMA_PAGE, CH0_BANK + 4), cb_half1);
    assert_eq!(periph.read(DMA_PAGE, CH0_BANK) & 1, 1);

    // And back again.
    pwm.set(channel, &[18], 50.0, 25.0).unwrap();
    assert_eq!(periph.read(DMA_PAGE, CH0_BANK + 4), cb_half0);
}

#[test]
fn a_failed_update_leaves_the_running_ring_armed() {
    let (mut pwm, periph, alloc) = engine();
    pwm.config(config::DEFAULT_PAGES, config::PULSE_WIDTH_SERVO_US)
        .unwrap();
    let channel = pwm.request().unwrap();
    let cb_half0 = alloc.bus_of(1);

    pwm.set(channel, &[18], 50.0, 7.5).unwrap();
    pwm.enable(channel).unwrap();

    // Too slow for the configured pages: rejected before the swap.
    assert_eq!(pwm.set(channel, &[18], 0.1, 50.0), Err(Error::OutOfMemory));
    assert_eq!(periph.read(DMA_PAGE, CH0_BANK + 4), cb_half0);
    assert_eq!(pwm.frequency(channel).unwrap(), 50.0);
}

#[test]
fn disable_halts_the_dma_and_grounds_every_pin() {
    let (mut pwm, periph, _alloc) = engine();
    let channel = pwm.request().unwrap();
    pwm.set(channel, &[5, 17], 100.0, 50.0).unwrap();
    pwm.enable(channel).unwrap();
    assert_eq!(periph.read(DMA_PAGE, CH0_BANK) & 1, 1);

    pwm.disable(channel).unwrap();
    // ACTIVE dropped, ABORT/RESET issued.
    let cs = periph.read(DMA_PAGE, CH0_BANK);
    assert_eq!(cs & 1, 0);
    assert_ne!(cs & (1 << 31), 0);
    // Each masked pin got a GPCLR0 write; pin 17 is the last one.
    assert_eq!(periph.read(GPIO_PAGE, 0x28), 1 << 17);

    // Idempotent, and the ring survives for a re-enable.
    pwm.disable(channel).unwrap();
    pwm.enable(channel).unwrap();
    assert_eq!(periph.read(DMA_PAGE, CH0_BANK) & 1, 1);
}

#[test]
fn free_returns_exactly_six_regions_once() {
    let (mut pwm, _periph, alloc) = engine();
    let channel = pwm.request().unwrap();
    pwm.set(channel, &[18], 100.0, 50.0).unwrap();
    pwm.enable(channel).unwrap();

    pwm.free(channel).unwrap();
    let (allocated, released, live) = alloc.counts();
    assert_eq!(allocated, 6);
    assert_eq!(released, 6);
    assert_eq!(live, 0);

    // A freed slot is no longer addressable.
    assert_eq!(pwm.free(channel), Err(Error::InvalidChannel));
    assert_eq!(pwm.disable(channel), Err(Error::InvalidChannel));
}

#[test]
fn dropping_the_driver_releases_everything() {
    let (mut pwm, _periph, alloc) = engine();
    pwm.request().unwrap();
    pwm.request().unwrap();
    pwm.set(0, &[18], 100.0, 50.0).unwrap();
    pwm.enable(0).unwrap();
    drop(pwm);

    let (allocated, released, live) = alloc.counts();
    assert_eq!(allocated, 12);
    assert_eq!(released, 12);
    assert_eq!(live, 0);
}

#[test]
fn a_request_that_fails_midway_hands_its_memory_back() {
    let (mut pwm, _periph, alloc) = engine();
    alloc.fail_from(3);
    assert_eq!(pwm.request(), Err(Error::OutOfMemory));

    let (allocated, released, live) = alloc.counts();
    assert_eq!(allocated, 3);
    assert_eq!(released, 3);
    assert_eq!(live, 0);

    // The slot stayed free and is usable once memory is available.
    alloc.fail_never();
    assert_eq!(pwm.request().unwrap(), 0);
}

#[test]
fn unknown_boards_fail_the_first_request_and_allow_retry() {
    let (mut pwm, _periph, _alloc) = engine_on("");
    assert_eq!(pwm.request(), Err(Error::NoBoardIdentifier));
    // Still uninitialized: the same error surfaces again rather than a
    // half-initialized engine.
    assert_eq!(pwm.request(), Err(Error::NoBoardIdentifier));
}

#[test]
fn hal_pin_quantizes_duty_through_set() {
    use embedded_hal::pwm::SetDutyCycle;

    let (mut pwm, _periph, _alloc) = engine();
    pwm.config(config::DEFAULT_PAGES, config::PULSE_WIDTH_SERVO_US)
        .unwrap();
    let channel = pwm.request().unwrap();

    let mut pin = pwm.pwm_pin(channel, &[18], 50.0).unwrap();
    let max = pin.max_duty_cycle();
    pin.set_duty_cycle(max / 2).unwrap();

    assert_eq!(pwm.duty_cycle(channel).unwrap(), 50.0);
    assert_eq!(pwm.frequency(channel).unwrap(), 50.0);
}
