//! Aurelia kernel core: physical/virtual memory management, interrupt and
//! exception plumbing, and a preemptive round-robin process scheduler for
//! x86_64.
//!
//! Pure-logic modules compile and test on the host (`cfg(not(target_os =
//! "none"))`, ordinary `cargo test`); anything that issues a privileged
//! instruction is gated to `target_os = "none"` and only actually runs under
//! the `x86_64-unknown-none` target inside QEMU, driven by the `harness =
//! false` integration binaries under `tests/`.

#![no_std]
#![cfg_attr(all(test, target_os = "none"), no_main)]
#![cfg_attr(target_os = "none", feature(abi_x86_interrupt))]
#![cfg_attr(target_os = "none", feature(alloc_error_handler))]
#![feature(custom_test_frameworks)]
#![cfg_attr(target_os = "none", test_runner(crate::test_framework::test_runner))]
#![cfg_attr(target_os = "none", reexport_test_harness_main = "test_main")]

extern crate alloc;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
use linked_list_allocator::LockedHeap;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
#[global_allocator]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

// Host target (plain `cargo test`): delegate to the system allocator so
// unit tests that reach into `elf`/`process` and allocate `Vec`/`String`
// compile and run without a real kernel heap.
#[cfg(not(target_os = "none"))]
extern crate std;
#[cfg(not(target_os = "none"))]
#[global_allocator]
static SYSTEM_ALLOCATOR: std::alloc::System = std::alloc::System;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub fn kernel_allocator() -> &'static LockedHeap {
    &ALLOCATOR
}

#[macro_use]
pub mod print;

pub mod arch;
#[cfg(all(target_os = "none", not(test)))]
pub mod boot;
pub mod config;
pub mod elf;
pub mod error;
pub mod gdt;
pub mod idt;
pub mod io;
pub mod mm;
pub mod pic;
pub mod pit;
pub mod printf;
pub mod process;
pub mod sched;
pub mod serial;
pub mod sync;

pub mod test_framework;

pub use test_framework::{exit_qemu, test_panic_handler, QemuExitCode, Testable};

#[cfg(all(test, target_os = "none"))]
#[no_mangle]
pub extern "C" fn _start() -> ! {
    test_main();
    loop {
        arch::halt();
    }
}

#[cfg(all(test, target_os = "none"))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    test_framework::test_panic_handler(info)
}

/// Heap allocation failure in a `no_std` kernel is unrecoverable; the
/// `alloc_error_handler` ABI requires `-> !`.
#[cfg(target_os = "none")]
#[alloc_error_handler]
fn alloc_error_handler(layout: core::alloc::Layout) -> ! {
    panic!("allocation error: {layout:?}");
}
