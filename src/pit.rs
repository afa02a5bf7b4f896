//! PIT (8253/8254) channel 0 timer, mode 3 square wave (C5), grounded in
//! `examples/original_source/src/src/syncos/timer.c`'s divisor programming,
//! tick-counter/callback-table concurrency discipline, and `sleep_ms`
//! TSC-fallback behaviour.

use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use crate::arch::read_tsc;
use crate::config::{
    FALLBACK_TSC_HZ, PIT_INPUT_HZ, PIT_MAX_HZ, PIT_MIN_HZ, TIMER_CALLBACK_SLOTS,
};
use crate::io::outb;
use crate::sync::Spinlock;

const PIT_CHANNEL0_DATA: u16 = 0x40;
const PIT_COMMAND: u16 = 0x43;
const PIT_MODE3_LOBYTE_HIBYTE: u8 = 0x36;

pub type TimerCallback = fn(ticks: u64);

struct CallbackSlot {
    callback: Option<TimerCallback>,
    interval_ms: u32,
    next_tick: u64,
    active: AtomicBool,
}

impl CallbackSlot {
    const fn empty() -> Self {
        Self {
            callback: None,
            interval_ms: 0,
            next_tick: 0,
            active: AtomicBool::new(false),
        }
    }
}

static CALLBACKS: [Spinlock<CallbackSlot>; TIMER_CALLBACK_SLOTS] =
    [const { Spinlock::new("pit::callback_slot", CallbackSlot::empty()) }; TIMER_CALLBACK_SLOTS];

static TICKS: AtomicU64 = AtomicU64::new(0);
static FREQUENCY_HZ: AtomicU32 = AtomicU32::new(0);
static INITIALIZED: AtomicBool = AtomicBool::new(false);

fn tick_increment(interval_ms: u32, freq: u32) -> u64 {
    let inc = (interval_ms as u64 * freq as u64) / 1000;
    inc.max(1)
}

/// Program channel 0 for `frequency_hz`, clamped to `[PIT_MIN_HZ, PIT_MAX_HZ]`.
/// Idempotent with respect to the callback table: re-arming only changes the
/// divisor and recorded frequency.
pub fn set_frequency(frequency_hz: u32) {
    let clamped = frequency_hz.clamp(PIT_MIN_HZ, PIT_MAX_HZ);
    let divisor = (PIT_INPUT_HZ / clamped).clamp(1, 0xFFFF);

    let were_enabled = crate::idt::interrupts_enabled();
    if were_enabled {
        crate::idt::disable_interrupts();
    }

    FREQUENCY_HZ.store(clamped, Ordering::SeqCst);
    unsafe {
        outb(PIT_COMMAND, PIT_MODE3_LOBYTE_HIBYTE);
        outb(PIT_CHANNEL0_DATA, (divisor & 0xFF) as u8);
        outb(PIT_CHANNEL0_DATA, ((divisor >> 8) & 0xFF) as u8);
    }

    if were_enabled {
        crate::idt::enable_interrupts();
    }
}

/// Arm the PIT at `frequency_hz` and register the IRQ0 tick handler.
pub fn init(frequency_hz: u32) {
    if INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }
    set_frequency(frequency_hz);
    let _ = crate::pic::irq_register(0, on_timer_irq);
}

pub fn is_initialized() -> bool {
    INITIALIZED.load(Ordering::SeqCst)
}

pub fn frequency_hz() -> u32 {
    FREQUENCY_HZ.load(Ordering::SeqCst)
}

pub fn ticks() -> u64 {
    TICKS.load(Ordering::Acquire)
}

pub fn uptime_ms() -> u64 {
    let freq = frequency_hz();
    if freq == 0 {
        return 0;
    }
    (ticks() * 1000) / freq as u64
}

/// Register a periodic callback invoked every `interval_ms` once armed.
pub fn timer_register(
    callback: TimerCallback,
    interval_ms: u32,
) -> Result<(), crate::error::KernelError> {
    if interval_ms == 0 {
        return Err(crate::error::KernelError::InvalidAddress { addr: 0 });
    }
    let freq = frequency_hz().max(1);
    for slot in CALLBACKS.iter() {
        let mut guard = slot.lock();
        if guard.active.load(Ordering::Acquire) {
            continue;
        }
        guard.callback = Some(callback);
        guard.interval_ms = interval_ms;
        guard.next_tick = ticks() + tick_increment(interval_ms, freq);
        guard.active.store(true, Ordering::Release);
        return Ok(());
    }
    Err(crate::error::KernelError::QueueFull { resource: "timer_callbacks" })
}

pub fn timer_unregister(callback: TimerCallback) {
    for slot in CALLBACKS.iter() {
        let guard = slot.lock();
        if guard.active.load(Ordering::Acquire) && guard.callback == Some(callback) {
            guard.active.store(false, Ordering::Release);
            return;
        }
    }
}

fn on_timer_irq(_line: u8) -> bool {
    let now = TICKS.fetch_add(1, Ordering::SeqCst) + 1;
    let freq = frequency_hz().max(1);

    for slot in CALLBACKS.iter() {
        if !slot.lock().active.load(Ordering::Acquire) {
            continue;
        }
        // Snapshot under the lock, invoke outside it (spec.md §4.5: "scans
        // the callback table without holding any global lock" across the
        // call itself).
        let (callback, due, interval) = {
            let guard = slot.lock();
            (guard.callback, now >= guard.next_tick, guard.interval_ms)
        };
        if !due {
            continue;
        }
        if let Some(cb) = callback {
            cb(now);
            let guard = slot.lock();
            if guard.active.load(Ordering::Acquire) {
                let next = now + tick_increment(interval, freq);
                drop(guard);
                slot.lock().next_tick = next;
            }
        }
    }
    true
}

/// Busy-wait until `ticks()` has advanced by at least `ms` milliseconds'
/// worth of ticks, halting between checks. Falls back to a TSC busy-wait at
/// `FALLBACK_TSC_HZ` if the PIT has not been armed yet.
pub fn sleep_ms(ms: u32) {
    if ms == 0 {
        return;
    }
    if !is_initialized() || frequency_hz() == 0 {
        busy_wait_us(ms as u64 * 1000);
        return;
    }

    let freq = frequency_hz() as u64;
    let target = ticks() + tick_increment(ms, freq as u32);
    while ticks() < target {
        crate::idt::enable_interrupts();
        crate::arch::halt();
    }
}

/// Busy-wait for `us` microseconds using RDTSC deltas.
pub fn busy_wait_us(us: u64) {
    let start = read_tsc();
    let cycles = FALLBACK_TSC_HZ / 1_000_000 * us;
    while read_tsc().saturating_sub(start) < cycles {
        core::hint::spin_loop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_increment_never_rounds_to_zero() {
        assert_eq!(tick_increment(1, 1000), 1);
        assert_eq!(tick_increment(0, 1000), 1);
    }

    #[test]
    fn set_frequency_clamps_to_bounds() {
        set_frequency(5);
        assert_eq!(frequency_hz(), PIT_MIN_HZ);
        set_frequency(10_000_000);
        assert_eq!(frequency_hz(), PIT_MAX_HZ);
        set_frequency(1000);
        assert_eq!(frequency_hz(), 1000);
    }

    #[test]
    fn register_unregister_round_trip_clears_slot() {
        fn cb(_ticks: u64) {}
        set_frequency(1000);
        timer_register(cb, 10).unwrap();
        assert!(CALLBACKS.iter().any(|s| s.lock().active.load(Ordering::Acquire)
            && s.lock().callback == Some(cb)));
        timer_unregister(cb);
        assert!(!CALLBACKS
            .iter()
            .any(|s| s.lock().active.load(Ordering::Acquire) && s.lock().callback == Some(cb)));
    }

    #[test]
    fn sleep_ms_zero_returns_immediately() {
        sleep_ms(0);
    }

    #[test]
    fn zero_interval_registration_is_rejected() {
        fn cb(_ticks: u64) {}
        assert!(timer_register(cb, 0).is_err());
    }
}
