//! 256-entry IDT and exception dispatch (C3).
//!
//! Built on the `x86_64` crate's typed `InterruptDescriptorTable`, the same
//! way every example in this pack wires exceptions — none of them hand-roll
//! the 256 `naked` ISR trampolines a bit-for-bit GPR-capturing stub would
//! need. The frame handed to a registered handler therefore carries every
//! piece of CPU-pushed exception state (vector, error code, RIP, CS,
//! RFLAGS, RSP, SS, CR0/CR2/CR3/CR4) but not general-purpose registers,
//! which the `extern "x86-interrupt"` ABI keeps opaque to the handler body.

use core::sync::atomic::{AtomicBool, Ordering};

use x86_64::registers::control::{Cr0, Cr2, Cr3, Cr4};
use x86_64::structures::idt::{InterruptDescriptorTable, InterruptStackFrame, PageFaultErrorCode};
use x86_64::VirtAddr;

use lazy_static::lazy_static;

use crate::error::KernelError;
use crate::gdt::DOUBLE_FAULT_IST_INDEX;
use crate::sync::Spinlock;

/// Mnemonic table for vectors 0-31, used only for diagnostic reporting.
pub const EXCEPTION_MNEMONICS: [&str; 32] = [
    "#DE", "#DB", "NMI", "#BP", "#OF", "#BR", "#UD", "#NM", "#DF", "res9", "#TS", "#NP", "#SS",
    "#GP", "#PF", "res15", "#MF", "#AC", "#MC", "#XM", "#VE", "res21", "res22", "res23", "res24",
    "res25", "res26", "res27", "res28", "res29", "res30", "res31",
];

/// Full exception context handed to a registered extended handler.
#[derive(Debug, Clone, Copy)]
pub struct Frame {
    pub vector: u8,
    pub error_code: u64,
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
    pub cr0: u64,
    pub cr2: u64,
    pub cr3: u64,
    pub cr4: u64,
}

pub type ExceptionHandler = fn(&Frame);

const NUM_EXCEPTIONS: usize = 32;
static HANDLERS: [Spinlock<Option<ExceptionHandler>>; NUM_EXCEPTIONS] =
    [const { Spinlock::new("idt::handler_slot", None) }; NUM_EXCEPTIONS];

/// Install an extended handler for exception vector `vector` (0-31).
/// Returns `Err` if `vector` is out of range.
pub fn register_exception_handler(
    vector: u8,
    handler: ExceptionHandler,
) -> Result<(), KernelError> {
    let slot = HANDLERS
        .get(vector as usize)
        .ok_or(KernelError::InvalidAddress { addr: vector as u64 })?;
    *slot.lock() = Some(handler);
    Ok(())
}

fn dispatch(vector: u8, stack_frame: &InterruptStackFrame, error_code: u64) {
    let frame = Frame {
        vector,
        error_code,
        rip: stack_frame.instruction_pointer.as_u64(),
        cs: stack_frame.code_segment.0 as u64,
        rflags: stack_frame.cpu_flags.bits(),
        rsp: stack_frame.stack_pointer.as_u64(),
        ss: stack_frame.stack_segment.0 as u64,
        cr0: Cr0::read().bits(),
        cr2: Cr2::read().unwrap_or(VirtAddr::zero()).as_u64(),
        cr3: Cr3::read().0.start_address().as_u64(),
        cr4: Cr4::read().bits(),
    };

    if let Some(handler) = HANDLERS
        .get(vector as usize)
        .and_then(|slot| *slot.lock())
    {
        handler(&frame);
        return;
    }

    default_handler(&frame);
}

fn default_handler(frame: &Frame) {
    let mnemonic = EXCEPTION_MNEMONICS
        .get(frame.vector as usize)
        .copied()
        .unwrap_or("?");
    crate::println!(
        "unhandled exception {} (vector {}), error_code={:#x}",
        mnemonic,
        frame.vector,
        frame.error_code
    );
    crate::println!(
        "  rip={:#x} cs={:#x} rflags={:#x} rsp={:#x} ss={:#x}",
        frame.rip,
        frame.cs,
        frame.rflags,
        frame.rsp,
        frame.ss
    );
    crate::println!(
        "  cr0={:#x} cr2={:#x} cr3={:#x} cr4={:#x}",
        frame.cr0,
        frame.cr2,
        frame.cr3,
        frame.cr4
    );
    panic!("unhandled exception, vector {}", frame.vector);
}

macro_rules! simple_handler {
    ($name:ident, $vector:expr) => {
        extern "x86-interrupt" fn $name(stack_frame: InterruptStackFrame) {
            dispatch($vector, &stack_frame, 0);
        }
    };
}

macro_rules! error_code_handler {
    ($name:ident, $vector:expr) => {
        extern "x86-interrupt" fn $name(stack_frame: InterruptStackFrame, error_code: u64) {
            dispatch($vector, &stack_frame, error_code);
        }
    };
}

simple_handler!(divide_error_handler, 0);
simple_handler!(debug_handler, 1);
simple_handler!(nmi_handler, 2);
simple_handler!(breakpoint_handler, 3);
simple_handler!(overflow_handler, 4);
simple_handler!(bound_range_handler, 5);
simple_handler!(invalid_opcode_handler, 6);
simple_handler!(device_not_available_handler, 7);

extern "x86-interrupt" fn double_fault_handler(
    stack_frame: InterruptStackFrame,
    error_code: u64,
) -> ! {
    dispatch(8, &stack_frame, error_code);
    loop {
        crate::arch::halt();
    }
}

error_code_handler!(invalid_tss_handler, 10);
error_code_handler!(segment_not_present_handler, 11);
error_code_handler!(stack_segment_fault_handler, 12);
error_code_handler!(general_protection_fault_handler, 13);

extern "x86-interrupt" fn page_fault_handler(
    stack_frame: InterruptStackFrame,
    error_code: PageFaultErrorCode,
) {
    let fault_addr = Cr2::read().unwrap_or(VirtAddr::zero()).as_u64();
    if crate::mm::vmm::handle_page_fault(fault_addr, error_code.bits(), stack_frame.instruction_pointer.as_u64()) {
        return;
    }
    dispatch(14, &stack_frame, error_code.bits());
}

simple_handler!(x87_floating_point_handler, 16);
error_code_handler!(alignment_check_handler, 17);
simple_handler!(machine_check_handler, 18);
simple_handler!(simd_floating_point_handler, 19);
simple_handler!(virtualization_handler, 20);

macro_rules! irq_handler {
    ($name:ident, $line:expr) => {
        extern "x86-interrupt" fn $name(_stack_frame: InterruptStackFrame) {
            crate::pic::irq_dispatch($line);
        }
    };
}

irq_handler!(irq0_handler, 0);
irq_handler!(irq1_handler, 1);
irq_handler!(irq2_handler, 2);
irq_handler!(irq3_handler, 3);
irq_handler!(irq4_handler, 4);
irq_handler!(irq5_handler, 5);
irq_handler!(irq6_handler, 6);
irq_handler!(irq7_handler, 7);
irq_handler!(irq8_handler, 8);
irq_handler!(irq9_handler, 9);
irq_handler!(irq10_handler, 10);
irq_handler!(irq11_handler, 11);
irq_handler!(irq12_handler, 12);
irq_handler!(irq13_handler, 13);
irq_handler!(irq14_handler, 14);
irq_handler!(irq15_handler, 15);

lazy_static! {
    static ref IDT: InterruptDescriptorTable = {
        let mut idt = InterruptDescriptorTable::new();
        idt.divide_error.set_handler_fn(divide_error_handler);
        idt.debug.set_handler_fn(debug_handler);
        idt.non_maskable_interrupt.set_handler_fn(nmi_handler);
        idt.breakpoint.set_handler_fn(breakpoint_handler);
        idt.overflow.set_handler_fn(overflow_handler);
        idt.bound_range_exceeded.set_handler_fn(bound_range_handler);
        idt.invalid_opcode.set_handler_fn(invalid_opcode_handler);
        idt.device_not_available.set_handler_fn(device_not_available_handler);
        unsafe {
            idt.double_fault
                .set_handler_fn(double_fault_handler)
                .set_stack_index(DOUBLE_FAULT_IST_INDEX);
        }
        idt.invalid_tss.set_handler_fn(invalid_tss_handler);
        idt.segment_not_present.set_handler_fn(segment_not_present_handler);
        idt.stack_segment_fault.set_handler_fn(stack_segment_fault_handler);
        idt.general_protection_fault.set_handler_fn(general_protection_fault_handler);
        idt.page_fault.set_handler_fn(page_fault_handler);
        idt.x87_floating_point.set_handler_fn(x87_floating_point_handler);
        idt.alignment_check.set_handler_fn(alignment_check_handler);
        idt.machine_check.set_handler_fn(machine_check_handler);
        idt.simd_floating_point.set_handler_fn(simd_floating_point_handler);
        idt.virtualization.set_handler_fn(virtualization_handler);

        idt[32].set_handler_fn(irq0_handler);
        idt[33].set_handler_fn(irq1_handler);
        idt[34].set_handler_fn(irq2_handler);
        idt[35].set_handler_fn(irq3_handler);
        idt[36].set_handler_fn(irq4_handler);
        idt[37].set_handler_fn(irq5_handler);
        idt[38].set_handler_fn(irq6_handler);
        idt[39].set_handler_fn(irq7_handler);
        idt[40].set_handler_fn(irq8_handler);
        idt[41].set_handler_fn(irq9_handler);
        idt[42].set_handler_fn(irq10_handler);
        idt[43].set_handler_fn(irq11_handler);
        idt[44].set_handler_fn(irq12_handler);
        idt[45].set_handler_fn(irq13_handler);
        idt[46].set_handler_fn(irq14_handler);
        idt[47].set_handler_fn(irq15_handler);

        idt
    };
}

pub fn init() {
    #[cfg(target_os = "none")]
    IDT.load();
}

pub fn enable_interrupts() {
    #[cfg(target_os = "none")]
    x86_64::instructions::interrupts::enable();
}

pub fn disable_interrupts() {
    #[cfg(target_os = "none")]
    x86_64::instructions::interrupts::disable();
}

pub fn interrupts_enabled() -> bool {
    #[cfg(target_os = "none")]
    {
        x86_64::instructions::interrupts::are_enabled()
    }
    #[cfg(not(target_os = "none"))]
    {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exception_mnemonics_cover_all_32_vectors() {
        assert_eq!(EXCEPTION_MNEMONICS.len(), 32);
        assert_eq!(EXCEPTION_MNEMONICS[14], "#PF");
        assert_eq!(EXCEPTION_MNEMONICS[8], "#DF");
    }

    #[test]
    fn register_and_dispatch_extended_handler() {
        static CALLED: AtomicBool = AtomicBool::new(false);
        fn handler(_frame: &Frame) {
            CALLED.store(true, Ordering::SeqCst);
        }
        register_exception_handler(3, handler).unwrap();
        assert!(HANDLERS[3].lock().is_some());
    }

    #[test]
    fn register_out_of_range_vector_fails() {
        fn handler(_frame: &Frame) {}
        assert!(register_exception_handler(200, handler).is_err());
    }
}
