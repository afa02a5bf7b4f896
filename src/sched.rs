//! Preemptive round-robin scheduler (C10), grounded in
//! `examples/original_source/src/src/syncos/process.c`'s ready-queue
//! enqueue/dequeue order and quantum-driven preemption, rebuilt over this
//! crate's [`process`] table, [`process::context`] assembly primitives and
//! [`mm::vmm`] address-space switch.
//!
//! The ready queue is doubly linked (intrusive `ready_next`/`ready_prev`
//! fields on each [`process::Pcb`], spec.md §4.10) and the blocked list is
//! singly linked; both live inside the single spinlock `process::mod`
//! already guards the PCB table with, so there is no cross-lock ordering
//! to reason about here. Dispatch itself, though, never happens while that
//! lock is held — see [`dispatch_to`] for why.

use core::sync::atomic::{AtomicBool, Ordering};

use crate::config::DEFAULT_QUANTUM_TICKS;
use crate::error::KernelError;
use crate::mm::vmm;
use crate::process::context::{self, CpuContext};
use crate::process::{self, ProcessState};

static PREEMPTION_ENABLED: AtomicBool = AtomicBool::new(false);

/// Bring the scheduler up: register the idle PCB and arm a once-per-tick
/// preemption check. Call after `process::init()`'s prerequisites
/// (`gdt`/`idt`/`pic`/`pit`/`vmm`) are already initialized.
pub fn init() {
    process::init();
    let _ = crate::pit::timer_register(on_tick, 1);
    PREEMPTION_ENABLED.store(true, Ordering::SeqCst);
}

/// Append `slot` to the ready queue tail without touching its `state`
/// (the caller has already set it). Used both by `process::create` (state
/// `New`) and by this module's own requeue paths (state `Ready`).
pub(crate) fn push_ready(slot: u16) {
    process::with_table(|t| {
        t.pcb_mut(slot).ready_next = None;
        t.pcb_mut(slot).ready_prev = t.ready_tail();
        match t.ready_tail() {
            Some(tail) => t.pcb_mut(tail).ready_next = Some(slot),
            None => t.set_ready_head(Some(slot)),
        }
        t.set_ready_tail(Some(slot));
    });
}

fn pop_ready_head(t: &mut process::TableView) -> Option<u16> {
    let head = t.ready_head()?;
    let next = t.pcb(head).ready_next;
    t.set_ready_head(next);
    match next {
        Some(n) => t.pcb_mut(n).ready_prev = None,
        None => t.set_ready_tail(None),
    }
    t.pcb_mut(head).ready_next = None;
    t.pcb_mut(head).ready_prev = None;
    Some(head)
}

/// Unlink `slot` from the ready list wherever it sits. A no-op if `slot`
/// is not currently queued.
fn unlink_ready(t: &mut process::TableView, slot: u16) {
    let prev = t.pcb(slot).ready_prev;
    let next = t.pcb(slot).ready_next;
    match prev {
        Some(p) => t.pcb_mut(p).ready_next = next,
        None => {
            if t.ready_head() == Some(slot) {
                t.set_ready_head(next);
            }
        }
    }
    match next {
        Some(n) => t.pcb_mut(n).ready_prev = prev,
        None => {
            if t.ready_tail() == Some(slot) {
                t.set_ready_tail(prev);
            }
        }
    }
    t.pcb_mut(slot).ready_next = None;
    t.pcb_mut(slot).ready_prev = None;
}

fn push_blocked(t: &mut process::TableView, slot: u16) {
    t.pcb_mut(slot).blocked_next = t.blocked_head();
    t.set_blocked_head(Some(slot));
}

/// Unlink `slot` from the singly linked blocked list. Returns whether it
/// was found there.
fn unlink_blocked(t: &mut process::TableView, slot: u16) -> bool {
    if t.blocked_head() == Some(slot) {
        let next = t.pcb(slot).blocked_next;
        t.set_blocked_head(next);
        t.pcb_mut(slot).blocked_next = None;
        return true;
    }
    let mut cur = t.blocked_head();
    while let Some(c) = cur {
        let next = t.pcb(c).blocked_next;
        if next == Some(slot) {
            let after = t.pcb(slot).blocked_next;
            t.pcb_mut(c).blocked_next = after;
            t.pcb_mut(slot).blocked_next = None;
            return true;
        }
        cur = next;
    }
    false
}

pub fn current_pid() -> u32 {
    process::with_table(|t| t.pcb(t.current()).pid)
}

/// Per-tick preemption check (spec.md §4.10): if the running process has
/// used up its quantum, request a reschedule. Runs in IRQ0 context via
/// `pit::timer_register`, so it must stay non-blocking.
fn on_tick(now_ticks: u64) {
    if !PREEMPTION_ENABLED.load(Ordering::Acquire) {
        return;
    }
    let expired = process::with_table(|t| {
        let cur = t.pcb(t.current());
        cur.quantum_ticks != u64::MAX && now_ticks.saturating_sub(cur.last_schedule_tick) >= cur.quantum_ticks
    });
    if expired {
        yield_now();
    }
}

/// Pick the next runnable PCB (round robin), falling back to idle (slot 0)
/// when the ready queue is empty, and commit the table-side half of the
/// dispatch: `prev`'s disposition, `next`'s bookkeeping, and `current`.
/// Returns `(prev_slot, next_slot, next_was_new)`. Does not touch CR3 or
/// any register; see [`dispatch_to`] for the part that does.
fn pick_next(prev_disposition: ProcessState) -> (u16, u16, bool) {
    process::with_table(|t| {
        let prev = t.current();
        t.pcb_mut(prev).state = prev_disposition;

        let next = pop_ready_head(t).unwrap_or(0);
        let was_new = t.pcb(next).state == ProcessState::New;
        t.pcb_mut(next).state = ProcessState::Running;
        t.pcb_mut(next).last_schedule_tick = crate::pit::ticks();
        t.pcb_mut(next).cpu_ticks = t.pcb(next).cpu_ticks.saturating_add(1);
        t.set_current(next);

        if prev_disposition == ProcessState::Ready && prev != next {
            push_ready_linked(t, prev);
        }
        (prev, next, was_new)
    })
}

/// `push_ready` reimplemented against an already-locked [`process::TableView`],
/// for call sites inside [`pick_next`]'s own `with_table` closure.
fn push_ready_linked(t: &mut process::TableView, slot: u16) {
    t.pcb_mut(slot).ready_next = None;
    t.pcb_mut(slot).ready_prev = t.ready_tail();
    match t.ready_tail() {
        Some(tail) => t.pcb_mut(tail).ready_next = Some(slot),
        None => t.set_ready_head(Some(slot)),
    }
    t.set_ready_tail(Some(slot));
}

/// Hand the CPU from `prev` to `next`. Must run with the process table
/// *unlocked*: [`context::switch_context`] does not return to this call
/// site until `prev` is scheduled again, which may be an arbitrary time in
/// the future during which other code needs the table lock. Holding it
/// across the switch would deadlock the system the first time anything
/// else touched the table.
fn dispatch_to(prev: u16, next: u16, next_was_new: bool) {
    if prev == next {
        return;
    }

    let next_page_table = process::with_table(|t| t.pcb(next).page_table);
    vmm::switch_address_space(next_page_table);

    let prev_ctx: *mut CpuContext = process::with_table(|t| &mut t.pcb_mut(prev).context as *mut CpuContext);

    if next_was_new {
        context::save_current_context(unsafe { &mut *prev_ctx });
        let (entry, stack) = process::with_table(|t| {
            let p = t.pcb(next);
            (p.entry_point_virt, p.stack_top_virt)
        });
        unsafe { context::enter_usermode(entry, stack, 0, 0, 0) }
    } else {
        let next_ctx: *const CpuContext = process::with_table(|t| &t.pcb(next).context as *const CpuContext);
        context::switch_context(unsafe { &mut *prev_ctx }, unsafe { &*next_ctx });
    }
}

fn with_interrupts_disabled<R>(f: impl FnOnce() -> R) -> R {
    let were_enabled = crate::idt::interrupts_enabled();
    crate::idt::disable_interrupts();
    let r = f();
    if were_enabled {
        crate::idt::enable_interrupts();
    }
    r
}

/// Voluntarily give up the CPU: if still runnable, requeue at the ready
/// tail, then dispatch whatever is next (possibly the same process, if
/// the ready queue was empty).
pub fn yield_now() {
    with_interrupts_disabled(|| {
        let (prev, next, was_new) = pick_next(ProcessState::Ready);
        dispatch_to(prev, next, was_new);
    });
}

/// Move the running process to `Blocked` and dispatch the next runnable
/// one. The caller is responsible for later calling [`unblock`] with the
/// blocked process's PID once whatever it was waiting on is satisfied.
pub fn block_current() {
    with_interrupts_disabled(|| {
        let (prev, next, was_new) = pick_next(ProcessState::Blocked);
        process::with_table(|t| push_blocked(t, prev));
        dispatch_to(prev, next, was_new);
    });
}

/// Move `pid` from the blocked list back onto the ready queue. Does not
/// itself trigger a reschedule; the newly ready process runs on its next
/// natural dispatch (quantum expiry, a yield, or idle picking it up).
pub fn unblock(pid: u32) -> Result<(), KernelError> {
    with_interrupts_disabled(|| {
        process::with_table(|t| {
            let slot = t.find_by_pid(pid).ok_or(KernelError::NotFound { resource: "process" })?;
            if !unlink_blocked(t, slot) {
                return Err(KernelError::NotFound { resource: "blocked_process" });
            }
            t.pcb_mut(slot).state = ProcessState::Ready;
            push_ready_linked(t, slot);
            Ok(())
        })
    })
}

/// Terminate `pid` (spec.md §4.10 `terminate`): unlink it from whichever
/// queue it is on, reclaim its address space and ELF/stack frames via
/// `process::reclaim`, and — if it was the running process — dispatch a
/// replacement. Never returns in that case.
pub fn terminate(pid: u32, exit_code: i32) -> Result<(), KernelError> {
    with_interrupts_disabled(|| {
        let (slot, was_current) = process::with_table(|t| {
            let slot = t.find_by_pid(pid).ok_or(KernelError::NotFound { resource: "process" })?;
            unlink_ready(t, slot);
            unlink_blocked(t, slot);
            Ok::<_, KernelError>((slot, t.current() == slot))
        })?;

        process::reclaim(slot as usize, exit_code)?;

        if was_current {
            let (prev, next, was_new) = pick_next_after_reclaim(slot);
            dispatch_to(prev, next, was_new);
        }
        Ok(())
    })
}

/// Like [`pick_next`], but for a `prev` slot whose PCB is already
/// reclaimed (Terminated, removed from both queues) — there is nothing
/// left to requeue, just pick whatever is next.
fn pick_next_after_reclaim(prev: u16) -> (u16, u16, bool) {
    process::with_table(|t| {
        let next = pop_ready_head(t).unwrap_or(0);
        let was_new = t.pcb(next).state == ProcessState::New;
        t.pcb_mut(next).state = ProcessState::Running;
        t.pcb_mut(next).last_schedule_tick = crate::pit::ticks();
        t.set_current(next);
        (prev, next, was_new)
    })
}

/// Run the idle loop forever. Intended to be called once, from the boot
/// sequence, on the bootstrap kernel execution context after every other
/// subsystem is initialized: once a real process is `Ready`, the next
/// timer tick's preemption check (or an explicit [`yield_now`]) dispatches
/// away from here.
#[cfg(target_os = "none")]
pub fn idle_loop() -> ! {
    loop {
        crate::idt::enable_interrupts();
        crate::arch::halt();
    }
}

pub fn default_quantum() -> u64 {
    DEFAULT_QUANTUM_TICKS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_and_pop_ready_preserves_fifo_order() {
        process::init();
        process::with_table(|t| {
            t.set_ready_head(None);
            t.set_ready_tail(None);
        });
        push_ready(3);
        push_ready(5);
        push_ready(7);
        assert_eq!(process::with_table(pop_ready_head), Some(3));
        assert_eq!(process::with_table(pop_ready_head), Some(5));
        assert_eq!(process::with_table(pop_ready_head), Some(7));
    }

    #[test]
    fn unlink_ready_handles_interior_and_edge_removal() {
        process::with_table(|t| {
            t.set_ready_head(None);
            t.set_ready_tail(None);
        });
        push_ready(1);
        push_ready(2);
        push_ready(3);
        process::with_table(|t| unlink_ready(t, 2));
        let popped = process::with_table(pop_ready_head);
        assert_eq!(popped, Some(1));
        let popped = process::with_table(pop_ready_head);
        assert_eq!(popped, Some(3));
    }

    #[test]
    fn blocked_list_push_and_unlink_round_trips() {
        process::with_table(|t| {
            t.set_blocked_head(None);
            push_blocked(t, 9);
            push_blocked(t, 4);
            assert!(unlink_blocked(t, 9));
            assert!(!unlink_blocked(t, 9));
            assert!(unlink_blocked(t, 4));
        });
    }
}
