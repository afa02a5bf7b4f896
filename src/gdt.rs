//! Flat GDT + TSS (C2).
//!
//! Selector layout matches spec.md exactly (null / 0x08 ring-0 code / 0x10
//! ring-0 data / 0x18 ring-3 code / 0x20 ring-3 data / 0x28 TSS), which is
//! why this does not reuse the teacher's `Descriptor::user_data_segment()` +
//! `user_code_segment()` ordering (SYSRET-friendly, data-before-code at a
//! different offset) — entries are appended by hand instead so the fixed
//! selector numbers hold.

use core::sync::atomic::{AtomicU32, Ordering};

use lazy_static::lazy_static;
#[cfg(target_os = "none")]
use x86_64::instructions::segmentation::{Segment, CS, DS, ES, FS, GS, SS};
#[cfg(target_os = "none")]
use x86_64::instructions::tables::load_tss;
use x86_64::structures::gdt::{Descriptor, GlobalDescriptorTable, SegmentSelector};
use x86_64::structures::tss::TaskStateSegment;
use x86_64::VirtAddr;

use crate::error::KernelError;

pub const DOUBLE_FAULT_IST_INDEX: u16 = 0;

const KERNEL_STACK_SIZE: usize = 4096 * 5;
const DOUBLE_FAULT_STACK_SIZE: usize = 4096 * 5;

const KERNEL_CODE_SEL: u16 = 0x08;
const KERNEL_DATA_SEL: u16 = 0x10;
const USER_CODE_SEL: u16 = 0x18;
const USER_DATA_SEL: u16 = 0x20;
const TSS_SEL: u16 = 0x28;

/// Bound on GDT checksum recovery attempts before giving up (spec.md §4.2:
/// "exceeding a small retry bound is a panic").
const MAX_RECOVERY_ATTEMPTS: u32 = 3;

#[repr(align(16))]
struct AlignedStack([u8; KERNEL_STACK_SIZE]);
static mut KERNEL_STACK: AlignedStack = AlignedStack([0; KERNEL_STACK_SIZE]);

#[repr(align(16))]
struct AlignedDfStack([u8; DOUBLE_FAULT_STACK_SIZE]);
static mut DOUBLE_FAULT_STACK: AlignedDfStack = AlignedDfStack([0; DOUBLE_FAULT_STACK_SIZE]);

lazy_static! {
    static ref TSS: TaskStateSegment = {
        let mut tss = TaskStateSegment::new();

        tss.privilege_stack_table[0] = {
            let stack_start = VirtAddr::from_ptr(&raw const KERNEL_STACK);
            stack_start + KERNEL_STACK_SIZE as u64
        };

        tss.interrupt_stack_table[DOUBLE_FAULT_IST_INDEX as usize] = {
            let stack_start = VirtAddr::from_ptr(&raw const DOUBLE_FAULT_STACK);
            stack_start + DOUBLE_FAULT_STACK_SIZE as u64
        };

        tss
    };
}

lazy_static! {
    static ref GDT: (GlobalDescriptorTable, Selectors) = {
        let mut gdt = GlobalDescriptorTable::new();
        let code_selector = gdt.append(Descriptor::kernel_code_segment());
        let data_selector = gdt.append(Descriptor::kernel_data_segment());
        let user_code_selector = gdt.append(Descriptor::user_code_segment());
        let user_data_selector = gdt.append(Descriptor::user_data_segment());
        let tss_selector = gdt.append(Descriptor::tss_segment(&TSS));

        debug_assert_eq!(code_selector.0, KERNEL_CODE_SEL);
        debug_assert_eq!(data_selector.0, KERNEL_DATA_SEL);
        debug_assert_eq!(user_code_selector.0, USER_CODE_SEL);
        debug_assert_eq!(user_data_selector.0, USER_DATA_SEL);
        debug_assert_eq!(tss_selector.0, TSS_SEL);

        (
            gdt,
            Selectors {
                code_selector,
                data_selector,
                user_code_selector,
                user_data_selector,
                tss_selector,
            },
        )
    };
}

/// Flat GDT segment selectors, ring-0 and ring-3, plus the TSS selector.
pub struct Selectors {
    pub code_selector: SegmentSelector,
    pub data_selector: SegmentSelector,
    pub user_code_selector: SegmentSelector,
    pub user_data_selector: SegmentSelector,
    pub tss_selector: SegmentSelector,
}

static CHECKSUM: AtomicU32 = AtomicU32::new(0);
static RECOVERY_ATTEMPTS: AtomicU32 = AtomicU32::new(0);

/// Load the GDT, reload every segment register, load the TSS, and record the
/// initial integrity checksum.
///
/// Actually executing `lgdt`/`ltr`/segment loads only makes sense running on
/// bare metal as the booting kernel; under `cfg(test)` on a host target this
/// just primes the checksum so `verify_integrity` and the recovery path are
/// still exercisable without touching privileged state.
pub fn init() {
    #[cfg(target_os = "none")]
    unsafe {
        GDT.0.load();
        CS::set_reg(GDT.1.code_selector);
        DS::set_reg(GDT.1.data_selector);
        ES::set_reg(GDT.1.data_selector);
        FS::set_reg(GDT.1.data_selector);
        GS::set_reg(GDT.1.data_selector);
        SS::set_reg(GDT.1.data_selector);
        load_tss(GDT.1.tss_selector);
    }
    CHECKSUM.store(compute_checksum(), Ordering::SeqCst);
}

pub fn selectors() -> &'static Selectors {
    &GDT.1
}

/// Update TSS.RSP0, aligning the stack pointer down to 16 bytes per the
/// x86_64 ABI.
pub fn set_kernel_stack(stack_top: u64) {
    let aligned = stack_top & !0xF;
    unsafe {
        let tss_ptr = &*TSS as *const TaskStateSegment as *mut TaskStateSegment;
        (*tss_ptr).privilege_stack_table[0] = VirtAddr::new(aligned);
    }
}

pub fn get_kernel_stack() -> u64 {
    TSS.privilege_stack_table[0].as_u64()
}

/// A trivial rolling checksum over the live GDT image, used only to detect
/// gross memory corruption, not as a cryptographic guarantee.
fn compute_checksum() -> u32 {
    let bytes = unsafe {
        core::slice::from_raw_parts(
            &GDT.0 as *const GlobalDescriptorTable as *const u8,
            core::mem::size_of::<GlobalDescriptorTable>(),
        )
    };
    let mut sum: u32 = 0x811C9DC5;
    for &b in bytes {
        sum ^= b as u32;
        sum = sum.wrapping_mul(0x01000193);
    }
    sum
}

/// Recompute the checksum and compare against the value recorded at `init`.
/// On mismatch, reload the GDT/TSS from the static tables (the only copy
/// this kernel keeps, so "restore the backup" means "reload the descriptor
/// tables and re-verify") and retry up to `MAX_RECOVERY_ATTEMPTS` times.
///
/// # Panics
/// Panics if the checksum still mismatches after exhausting the recovery
/// budget: an in-kernel state change to the GDT past that point cannot be
/// trusted to run further code correctly.
pub fn verify_integrity() -> Result<(), KernelError> {
    if compute_checksum() == CHECKSUM.load(Ordering::SeqCst) {
        RECOVERY_ATTEMPTS.store(0, Ordering::SeqCst);
        return Ok(());
    }

    let attempts = RECOVERY_ATTEMPTS.fetch_add(1, Ordering::SeqCst) + 1;
    if attempts > MAX_RECOVERY_ATTEMPTS {
        panic!("GDT integrity check failed after {attempts} recovery attempts");
    }

    recover();
    if compute_checksum() == CHECKSUM.load(Ordering::SeqCst) {
        RECOVERY_ATTEMPTS.store(0, Ordering::SeqCst);
        Ok(())
    } else {
        Err(KernelError::HardwareFault { what: "gdt" })
    }
}

fn recover() {
    #[cfg(target_os = "none")]
    unsafe {
        GDT.0.load();
        load_tss(GDT.1.tss_selector);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_is_deterministic() {
        assert_eq!(compute_checksum(), compute_checksum());
    }

    #[test]
    fn selectors_have_expected_fixed_values() {
        let s = selectors();
        assert_eq!(s.code_selector.0, KERNEL_CODE_SEL);
        assert_eq!(s.data_selector.0, KERNEL_DATA_SEL);
        assert_eq!(s.user_code_selector.0, USER_CODE_SEL);
        assert_eq!(s.user_data_selector.0, USER_DATA_SEL);
        assert_eq!(s.tss_selector.0, TSS_SEL);
    }

    #[test]
    fn set_kernel_stack_aligns_down_to_16_bytes() {
        set_kernel_stack(0x1003);
        assert_eq!(get_kernel_stack() & 0xF, 0);
        assert_eq!(get_kernel_stack(), 0x1000);
    }
}
