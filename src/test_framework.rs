//! `no_std` test infrastructure: QEMU exit codes, the [`Testable`] trait
//! that every `#[test_case]` implements by virtue of being `Fn() ->
//! Result<(), KernelError>`, and the custom [`test_runner`] wired in as
//! this crate's `reexport_test_harness_main` on the bare-metal target.
//!
//! Grounded in the teacher's `kernel/src/test_framework.rs`, trimmed to the
//! pieces this kernel's bare-metal integration tests (`tests/*.rs`, all
//! `harness = false`) actually use; the benchmark/package-manager-specific
//! infrastructure the teacher carries alongside it has no counterpart here.

use core::panic::PanicInfo;

use crate::error::KernelError;
use crate::{serial_print, serial_println};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum QemuExitCode {
    Success = 0x10,
    Failed = 0x11,
}

/// Every `#[test_case]` closure implements this by virtue of being
/// `Fn() -> Result<(), KernelError>`.
pub trait Testable {
    fn run(&self) -> Result<(), KernelError>;
}

impl<T> Testable for T
where
    T: Fn() -> Result<(), KernelError>,
{
    fn run(&self) -> Result<(), KernelError> {
        serial_print!("{}...\t", core::any::type_name::<T>());
        match self() {
            Ok(()) => {
                serial_println!("[ok]");
                Ok(())
            }
            Err(e) => {
                serial_println!("[failed]: {e}");
                Err(e)
            }
        }
    }
}

#[cfg(target_os = "none")]
pub fn test_runner(tests: &[&dyn Testable]) -> ! {
    serial_println!("Running {} tests", tests.len());
    let mut passed = 0;
    let mut failed = 0;

    for test in tests {
        match test.run() {
            Ok(()) => passed += 1,
            Err(_) => failed += 1,
        }
    }

    serial_println!("\nTest results: {passed} passed, {failed} failed");

    if failed == 0 {
        exit_qemu(QemuExitCode::Success);
    } else {
        exit_qemu(QemuExitCode::Failed);
    }
}

pub fn test_panic_handler(info: &PanicInfo) -> ! {
    serial_println!("[failed]\n");
    serial_println!("Error: {info}\n");
    exit_qemu(QemuExitCode::Failed);
}

/// Exit QEMU via the `isa-debug-exit` device at port `0xf4` (see
/// `.cargo/config.toml`'s `-device isa-debug-exit,iobase=0xf4,iosize=0x04`).
pub fn exit_qemu(exit_code: QemuExitCode) -> ! {
    #[cfg(target_os = "none")]
    {
        use x86_64::instructions::port::Port;
        unsafe {
            let mut port: Port<u32> = Port::new(0xf4);
            port.write(exit_code as u32);
        }
        loop {
            crate::arch::halt();
        }
    }
    #[cfg(not(target_os = "none"))]
    {
        let _ = exit_code;
        loop {
            core::hint::spin_loop();
        }
    }
}
