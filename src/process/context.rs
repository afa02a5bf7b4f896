//! Saved CPU context (C10) and the assembly primitives that move a CPU
//! between processes: [`switch_context`] (kernel-to-kernel GPR/RFLAGS swap,
//! used by the scheduler's round-robin dispatch) and [`enter_usermode`]
//! (the one-time ring 3 transition for a process's first dispatch).
//! Grounded in the teacher's `arch/x86_64/context.rs` `context_switch` (the
//! save-then-restore-then-`ret` shape, and its `[rdi + offset]`/
//! `[rsi + offset]` addressing), generalized with the segment-selector and
//! IRETQ-frame fields spec.md §3/§4.10 add.
//!
//! Address-space switching is deliberately *not* folded into this asm:
//! `crate::mm::vmm` owns the single CR3 shadow (`CURRENT_PML4`) that
//! `map_page`/`unmap_page`/`current_address_space` all trust, so
//! `crate::sched` always calls `vmm::switch_address_space` itself before
//! handing control here, rather than letting these primitives write CR3
//! behind that cache's back. `CpuContext::cr3` is carried for completeness
//! (it mirrors the teacher's context struct) but is not read by the asm
//! below.
//!
//! `CpuContext` is `#[repr(C)]` with a fixed field order so the two `asm!`
//! blocks below can address it by constant byte offset, matching the
//! "saved-context blob as a repr(C) struct matching the assembly
//! prologue/epilogue bit-for-bit" redesign note (spec.md §9).

use crate::mm::types::{PhysAddr, VirtAddr};

/// Offsets into [`CpuContext`], named for the `asm!` blocks below. Kept in
/// one place so the struct and the assembly never drift independently.
mod offset {
    pub const R15: usize = 0x00;
    pub const R14: usize = 0x08;
    pub const R13: usize = 0x10;
    pub const R12: usize = 0x18;
    pub const R11: usize = 0x20;
    pub const R10: usize = 0x28;
    pub const R9: usize = 0x30;
    pub const R8: usize = 0x38;
    pub const RBP: usize = 0x40;
    pub const RDI: usize = 0x48;
    pub const RSI: usize = 0x50;
    pub const RDX: usize = 0x58;
    pub const RCX: usize = 0x60;
    pub const RBX: usize = 0x68;
    pub const RAX: usize = 0x70;
    pub const RIP: usize = 0x78;
    pub const CS: usize = 0x80;
    pub const RFLAGS: usize = 0x88;
    pub const RSP: usize = 0x90;
    pub const SS: usize = 0x98;
    pub const CR3: usize = 0xA0;
}

/// Full saved CPU state for one process (spec.md §3 PCB: "saved CPU
/// context (all GPRs, RIP, RFLAGS, segment selectors, CR3)").
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct CpuContext {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rbp: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rax: u64,
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
    pub cr3: u64,
    pub ds: u64,
    pub es: u64,
    pub fs: u64,
    pub gs: u64,
}

impl CpuContext {
    pub const fn zeroed() -> Self {
        Self {
            r15: 0,
            r14: 0,
            r13: 0,
            r12: 0,
            r11: 0,
            r10: 0,
            r9: 0,
            r8: 0,
            rbp: 0,
            rdi: 0,
            rsi: 0,
            rdx: 0,
            rcx: 0,
            rbx: 0,
            rax: 0,
            rip: 0,
            cs: 0,
            rflags: 0,
            rsp: 0,
            ss: 0,
            cr3: 0,
            ds: 0,
            es: 0,
            fs: 0,
            gs: 0,
        }
    }

    /// Initial kernel-mode context for the idle PCB: entry at `rip`, stack
    /// at `rsp`, ring-0 selectors, IF set, current CR3.
    pub fn new_kernel(rip: VirtAddr, rsp: VirtAddr, cr3: PhysAddr) -> Self {
        let sel = crate::gdt::selectors();
        Self {
            rip: rip.as_u64(),
            rsp: rsp.as_u64(),
            cs: sel.code_selector.0 as u64,
            ss: sel.data_selector.0 as u64,
            ds: sel.data_selector.0 as u64,
            es: sel.data_selector.0 as u64,
            fs: sel.data_selector.0 as u64,
            gs: sel.data_selector.0 as u64,
            rflags: 0x202,
            cr3: cr3.as_u64(),
            ..Self::zeroed()
        }
    }

    /// Initial ring-3 context for a freshly created process (spec.md
    /// §4.10 step 5): RIP = entry, RSP = stack top, RFLAGS.IF=1, user
    /// CS/SS/DS/ES/FS/GS selectors with RPL=3, CR3 = the process's page
    /// table.
    pub fn new_user(entry: VirtAddr, stack_top: VirtAddr, cr3: PhysAddr) -> Self {
        let sel = crate::gdt::selectors();
        let user_cs = (sel.user_code_selector.0 | 3) as u64;
        let user_ss = (sel.user_data_selector.0 | 3) as u64;
        Self {
            rip: entry.as_u64(),
            rsp: stack_top.as_u64(),
            cs: user_cs,
            ss: user_ss,
            ds: user_ss,
            es: user_ss,
            fs: user_ss,
            gs: user_ss,
            rflags: 0x202,
            cr3: cr3.as_u64(),
            ..Self::zeroed()
        }
    }
}

/// Swap from `*prev` to `*next`: save every GPR, RFLAGS and the resume RIP
/// into `prev`, switch CR3 if it differs, then restore `next`'s GPRs/RFLAGS
/// and `ret` into its saved RIP. Mirrors the teacher's `context_switch`
/// save/restore-then-`ret` shape; used by [`crate::sched::schedule_next`]
/// to swap between processes that are both already resumed in kernel
/// context (i.e. not a process's very first dispatch — see
/// [`enter_usermode`] for that transition).
///
/// # Safety
/// Must be called with interrupts disabled and both `prev`/`next` pointing
/// at live, correctly initialized contexts. `prev` must be the context of
/// the process currently executing on this CPU.
#[cfg(target_os = "none")]
#[no_mangle]
pub unsafe extern "C" fn context_switch(prev: *mut CpuContext, next: *const CpuContext) {
    use core::arch::asm;
    asm!(
        "mov [rdi + {r15}], r15",
        "mov [rdi + {r14}], r14",
        "mov [rdi + {r13}], r13",
        "mov [rdi + {r12}], r12",
        "mov [rdi + {r11}], r11",
        "mov [rdi + {r10}], r10",
        "mov [rdi + {r9}],  r9",
        "mov [rdi + {r8}],  r8",
        "mov [rdi + {rbp}], rbp",
        "mov [rdi + {rbx}], rbx",
        "mov [rdi + {rsp}], rsp",
        "mov rax, [rsp]",
        "mov [rdi + {rip}], rax",
        "pushfq",
        "pop rax",
        "mov [rdi + {rflags}], rax",

        "mov r15, [rsi + {r15}]",
        "mov r14, [rsi + {r14}]",
        "mov r13, [rsi + {r13}]",
        "mov r12, [rsi + {r12}]",
        "mov r11, [rsi + {r11}]",
        "mov r10, [rsi + {r10}]",
        "mov r9,  [rsi + {r9}]",
        "mov r8,  [rsi + {r8}]",
        "mov rbp, [rsi + {rbp}]",
        "mov rbx, [rsi + {rbx}]",
        "push qword ptr [rsi + {rflags}]",
        "popfq",
        "mov rsp, [rsi + {rsp}]",
        "push qword ptr [rsi + {rip}]",
        "ret",

        r15 = const offset::R15, r14 = const offset::R14, r13 = const offset::R13,
        r12 = const offset::R12, r11 = const offset::R11, r10 = const offset::R10,
        r9 = const offset::R9, r8 = const offset::R8, rbp = const offset::RBP,
        rbx = const offset::RBX, rsp = const offset::RSP, rip = const offset::RIP,
        rflags = const offset::RFLAGS,
        in("rdi") prev, in("rsi") next,
        lateout("rax") _,
    );
}

#[cfg(not(target_os = "none"))]
pub unsafe extern "C" fn context_switch(_prev: *mut CpuContext, _next: *const CpuContext) {}

/// Safe wrapper over [`context_switch`].
pub fn switch_context(prev: &mut CpuContext, next: &CpuContext) {
    unsafe { context_switch(prev as *mut _, next as *const _) };
}

/// Save the caller's resumable state into `ctx` and return normally,
/// without restoring anything. The save half of [`context_switch`] without
/// its matching restore. [`crate::sched`] calls this (instead of
/// [`switch_context`]) when the next PCB to dispatch was never resumed
/// before, right before handing control to [`enter_usermode`] — which
/// never returns, so there is no "next" context to restore from at this
/// call site. The saved `rip` is this function's own return address, so a
/// later `switch_context` into `ctx` resumes exactly here.
///
/// # Safety
/// Must be called with interrupts disabled; `ctx` must point at a live
/// `CpuContext`.
#[cfg(target_os = "none")]
#[no_mangle]
pub unsafe extern "C" fn save_context(ctx: *mut CpuContext) {
    use core::arch::asm;
    asm!(
        "mov [rdi + {r15}], r15",
        "mov [rdi + {r14}], r14",
        "mov [rdi + {r13}], r13",
        "mov [rdi + {r12}], r12",
        "mov [rdi + {r11}], r11",
        "mov [rdi + {r10}], r10",
        "mov [rdi + {r9}],  r9",
        "mov [rdi + {r8}],  r8",
        "mov [rdi + {rbp}], rbp",
        "mov [rdi + {rbx}], rbx",
        "mov [rdi + {rsp}], rsp",
        "mov rax, [rsp]",
        "mov [rdi + {rip}], rax",
        "pushfq",
        "pop rax",
        "mov [rdi + {rflags}], rax",
        "mov rax, cr3",
        "mov [rdi + {cr3}], rax",

        r15 = const offset::R15, r14 = const offset::R14, r13 = const offset::R13,
        r12 = const offset::R12, r11 = const offset::R11, r10 = const offset::R10,
        r9 = const offset::R9, r8 = const offset::R8, rbp = const offset::RBP,
        rbx = const offset::RBX, rsp = const offset::RSP, rip = const offset::RIP,
        rflags = const offset::RFLAGS, cr3 = const offset::CR3,
        in("rdi") ctx,
        lateout("rax") _,
    );
}

#[cfg(not(target_os = "none"))]
pub unsafe extern "C" fn save_context(_ctx: *mut CpuContext) {}

/// Safe wrapper over [`save_context`].
pub fn save_current_context(ctx: &mut CpuContext) {
    unsafe { save_context(ctx as *mut _) };
}

/// One-time transition into ring 3: load `cr3`, build an IRETQ frame with
/// user `SS:RSP`, `RFLAGS`, user `CS:RIP`, reload user data selectors, and
/// `IRETQ`. Used exactly once per process, the first time the scheduler
/// dispatches a PCB whose state was `New`. `argc`/`argv`/`envp` are placed
/// in the calling convention's first three integer registers; marshalling
/// them onto the user stack itself is left to `process::create` (spec.md
/// §4.10: "must leave the stack 16-byte aligned at entry").
///
/// # Safety
/// The caller must already have switched CR3 to the target address space
/// (`crate::sched` does this via `vmm::switch_address_space`, which keeps
/// the VMM's CR3 shadow in sync; this function does not touch CR3 itself).
/// `entry` must be mapped executable and `stack` mapped writable for the
/// user the CPU is about to run as. Never returns.
#[cfg(target_os = "none")]
pub unsafe fn enter_usermode(entry: VirtAddr, stack: VirtAddr, argc: u64, argv: u64, envp: u64) -> ! {
    use core::arch::asm;

    let sel = crate::gdt::selectors();
    let user_cs = (sel.user_code_selector.0 | 3) as u64;
    let user_ss = (sel.user_data_selector.0 | 3) as u64;
    let rflags: u64 = 0x202;

    asm!(
        "mov ds, {data_sel:x}",
        "mov es, {data_sel:x}",
        "mov fs, {data_sel:x}",
        "mov gs, {data_sel:x}",
        "push {ss}",
        "push {rsp}",
        "push {rflags}",
        "push {cs}",
        "push {rip}",
        "iretq",
        data_sel = in(reg) user_ss as u16,
        ss = in(reg) user_ss,
        rsp = in(reg) stack.as_u64(),
        rflags = in(reg) rflags,
        cs = in(reg) user_cs,
        rip = in(reg) entry.as_u64(),
        in("rdi") argc,
        in("rsi") argv,
        in("rdx") envp,
        options(noreturn),
    );
}

#[cfg(not(target_os = "none"))]
pub unsafe fn enter_usermode(_entry: VirtAddr, _stack: VirtAddr, _argc: u64, _argv: u64, _envp: u64) -> ! {
    panic!("enter_usermode is only meaningful on bare metal");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_offsets_match_asm_constants() {
        let c = CpuContext::zeroed();
        let base = &c as *const _ as usize;
        assert_eq!(&c.r15 as *const _ as usize - base, offset::R15);
        assert_eq!(&c.rip as *const _ as usize - base, offset::RIP);
        assert_eq!(&c.cr3 as *const _ as usize - base, offset::CR3);
        assert_eq!(&c.ss as *const _ as usize - base, offset::SS);
    }

    #[test]
    fn new_kernel_sets_interrupt_flag_and_ring0_selectors() {
        let ctx = CpuContext::new_kernel(VirtAddr::new(0x1000), VirtAddr::new(0x2000), PhysAddr::new(0x3000));
        assert_eq!(ctx.rflags & 0x200, 0x200);
        assert_eq!(ctx.cr3, 0x3000);
        assert_eq!(ctx.rip, 0x1000);
    }

    #[test]
    fn new_user_selectors_carry_rpl3() {
        let ctx = CpuContext::new_user(VirtAddr::new(0x4000_0000), VirtAddr::new(0x7fff_ffff_f000), PhysAddr::new(0x5000));
        assert_eq!(ctx.cs & 3, 3);
        assert_eq!(ctx.ss & 3, 3);
    }
}
