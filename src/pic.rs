//! 8259 PIC remap and IRQ multiplexer (C4), grounded in
//! `examples/original_source/src/src/syncos/pic.c`'s ICW sequence and
//! per-line mask bookkeeping, with the teacher's `Port`-based register
//! shape from its x86_64 arch module.

use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use crate::config::{IRQ_LINE_COUNT, IRQ_SLOTS_PER_LINE, PIC1_VECTOR_OFFSET, PIC2_VECTOR_OFFSET};
use crate::io::{inb, outb};
use crate::sync::Spinlock;

const PIC1_COMMAND: u16 = 0x20;
const PIC1_DATA: u16 = 0x21;
const PIC2_COMMAND: u16 = 0xA0;
const PIC2_DATA: u16 = 0xA1;

const ICW1_INIT: u8 = 0x10;
const ICW1_ICW4: u8 = 0x01;
const ICW4_8086: u8 = 0x01;
const PIC_EOI: u8 = 0x20;
const PIC_READ_ISR: u8 = 0x0B;

/// An installed IRQ callback. Returning `true` means "handled"; a line's
/// dispatch is only counted spurious when every active slot returns `false`.
pub type IrqHandler = fn(line: u8) -> bool;

struct LineSlots {
    handlers: [Option<IrqHandler>; IRQ_SLOTS_PER_LINE],
}

impl LineSlots {
    const fn empty() -> Self {
        Self {
            handlers: [None; IRQ_SLOTS_PER_LINE],
        }
    }

    fn is_empty(&self) -> bool {
        self.handlers.iter().all(Option::is_none)
    }
}

static LINES: [Spinlock<LineSlots>; IRQ_LINE_COUNT] =
    [const { Spinlock::new("pic::line", LineSlots::empty()) }; IRQ_LINE_COUNT];

static MASTER_MASK: AtomicUsize = AtomicUsize::new(0xFF);
static SLAVE_MASK: AtomicUsize = AtomicUsize::new(0xFF);
static INITIALIZED: AtomicBool = AtomicBool::new(false);
static SPURIOUS_COUNT: AtomicU64 = AtomicU64::new(0);
static UPTIME_TICKS: AtomicU64 = AtomicU64::new(0);

fn io_wait() {
    unsafe { outb(0x80, 0) };
}

/// Remap the PIC pair to `master_offset`/`slave_offset` and mask every line.
/// Idempotent: a second call is a no-op.
pub fn init(master_offset: u8, slave_offset: u8) {
    if INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }

    unsafe {
        outb(PIC1_COMMAND, ICW1_INIT | ICW1_ICW4);
        io_wait();
        outb(PIC2_COMMAND, ICW1_INIT | ICW1_ICW4);
        io_wait();

        outb(PIC1_DATA, master_offset);
        io_wait();
        outb(PIC2_DATA, slave_offset);
        io_wait();

        outb(PIC1_DATA, 4);
        io_wait();
        outb(PIC2_DATA, 2);
        io_wait();

        outb(PIC1_DATA, ICW4_8086);
        io_wait();
        outb(PIC2_DATA, ICW4_8086);
        io_wait();

        outb(PIC1_DATA, 0xFF);
        outb(PIC2_DATA, 0xFF);
    }
    MASTER_MASK.store(0xFF, Ordering::SeqCst);
    SLAVE_MASK.store(0xFF, Ordering::SeqCst);
}

/// Initialize with the configured default offsets.
pub fn init_default() {
    init(PIC1_VECTOR_OFFSET, PIC2_VECTOR_OFFSET);
}

fn set_master_mask(mask: u8) {
    MASTER_MASK.store(mask as usize, Ordering::SeqCst);
    unsafe { outb(PIC1_DATA, mask) };
}

fn set_slave_mask(mask: u8) {
    SLAVE_MASK.store(mask as usize, Ordering::SeqCst);
    unsafe { outb(PIC2_DATA, mask) };
}

fn unmask_line(line: u8) {
    if line < 8 {
        let mask = MASTER_MASK.load(Ordering::SeqCst) as u8 & !(1 << line);
        if mask != MASTER_MASK.load(Ordering::SeqCst) as u8 {
            set_master_mask(mask);
        }
    } else {
        let bit = line - 8;
        let mask = SLAVE_MASK.load(Ordering::SeqCst) as u8 & !(1 << bit);
        if mask != SLAVE_MASK.load(Ordering::SeqCst) as u8 {
            set_slave_mask(mask);
        }
        let master = MASTER_MASK.load(Ordering::SeqCst) as u8;
        if master & (1 << 2) != 0 {
            set_master_mask(master & !(1 << 2));
        }
    }
}

fn mask_line(line: u8) {
    if line < 8 {
        let mask = MASTER_MASK.load(Ordering::SeqCst) as u8 | (1 << line);
        set_master_mask(mask);
    } else {
        let bit = line - 8;
        let mask = SLAVE_MASK.load(Ordering::SeqCst) as u8 | (1 << bit);
        set_slave_mask(mask);
    }
}

/// Install `handler` into the first free slot for `line`, unmasking the
/// line (and the master cascade, if `line >= 8`) on first registration.
pub fn irq_register(line: u8, handler: IrqHandler) -> Result<(), crate::error::KernelError> {
    let slots = LINES
        .get(line as usize)
        .ok_or(crate::error::KernelError::InvalidAddress { addr: line as u64 })?;
    let mut guard = slots.lock();
    let was_empty = guard.is_empty();
    let slot = guard
        .handlers
        .iter_mut()
        .find(|s| s.is_none())
        .ok_or(crate::error::KernelError::QueueFull { resource: "irq_slots" })?;
    *slot = Some(handler);
    drop(guard);
    if was_empty {
        unmask_line(line);
    }
    Ok(())
}

/// Remove `handler` from `line`'s slot table, masking the line again if it
/// becomes empty.
pub fn irq_unregister(line: u8, handler: IrqHandler) {
    let Some(slots) = LINES.get(line as usize) else {
        return;
    };
    let mut guard = slots.lock();
    for slot in guard.handlers.iter_mut() {
        if *slot == Some(handler) {
            *slot = None;
        }
    }
    let now_empty = guard.is_empty();
    drop(guard);
    if now_empty {
        mask_line(line);
    }
}

fn isr_bit_set(line: u8) -> bool {
    unsafe {
        outb(PIC1_COMMAND, PIC_READ_ISR);
        outb(PIC2_COMMAND, PIC_READ_ISR);
        let master = inb(PIC1_COMMAND);
        let slave = inb(PIC2_COMMAND);
        let isr = (slave as u16) << 8 | master as u16;
        isr & (1 << line) != 0
    }
}

fn send_eoi(line: u8) {
    if line >= 8 {
        unsafe { outb(PIC2_COMMAND, PIC_EOI) };
    }
    unsafe { outb(PIC1_COMMAND, PIC_EOI) };
}

/// Dispatch every active handler slot for `line`. Handles the spurious
/// cases on lines 7/15 per spec: a clear ISR bit means the interrupt never
/// really happened, so line 7 sends no EOI at all, and line 15 sends EOI
/// only to the master (the slave never raised it).
pub fn irq_dispatch(line: u8) {
    if line == 7 || line == 15 {
        if !isr_bit_set(line) {
            SPURIOUS_COUNT.fetch_add(1, Ordering::Relaxed);
            if line == 15 {
                unsafe { outb(PIC1_COMMAND, PIC_EOI) };
            }
            return;
        }
    }

    if line == 0 {
        UPTIME_TICKS.fetch_add(1, Ordering::Release);
    }

    if let Some(slots) = LINES.get(line as usize) {
        let guard = slots.lock();
        let handlers: [Option<IrqHandler>; IRQ_SLOTS_PER_LINE] = guard.handlers;
        drop(guard);
        for handler in handlers.into_iter().flatten() {
            handler(line);
        }
    }

    send_eoi(line);
}

/// Compact uptime counter, incremented once per IRQ0 dispatch, independent
/// of the PIT's own tick count (spec.md §4.4's "for timer-less sleeps").
pub fn uptime_ticks() -> u64 {
    UPTIME_TICKS.load(Ordering::Acquire)
}

pub fn spurious_count() -> u64 {
    SPURIOUS_COUNT.load(Ordering::Relaxed)
}

pub fn is_initialized() -> bool {
    INITIALIZED.load(Ordering::SeqCst)
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::AtomicBool as TestFlag;

    static CALLED: TestFlag = TestFlag::new(false);

    fn test_handler(_line: u8) -> bool {
        CALLED.store(true, Ordering::SeqCst);
        true
    }

    #[test]
    fn register_unregister_round_trip_leaves_table_clear() {
        irq_register(3, test_handler).unwrap();
        assert!(!LINES[3].lock().is_empty());
        irq_unregister(3, test_handler);
        assert!(LINES[3].lock().is_empty());
    }

    #[test]
    fn dispatch_invokes_registered_handler() {
        CALLED.store(false, Ordering::SeqCst);
        irq_register(5, test_handler).unwrap();
        irq_dispatch(5);
        assert!(CALLED.load(Ordering::SeqCst));
        irq_unregister(5, test_handler);
    }

    #[test]
    fn register_out_of_range_line_fails() {
        assert!(irq_register(200, test_handler).is_err());
    }

    #[test]
    fn slots_exhaust_and_report_queue_full() {
        fn h(_l: u8) -> bool {
            true
        }
        for _ in 0..IRQ_SLOTS_PER_LINE {
            irq_register(6, h).unwrap();
        }
        assert!(irq_register(6, h).is_err());
        for _ in 0..IRQ_SLOTS_PER_LINE {
            irq_unregister(6, h);
        }
    }
}
