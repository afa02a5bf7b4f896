//! Smoke test: does the kernel reach a point where GDT/IDT are installed and
//! the console is writable, without tripping a fault or panic.

#![no_std]
#![no_main]

use core::panic::PanicInfo;

use aurelia_kernel::{exit_qemu, serial_println, test_panic_handler, QemuExitCode};

#[no_mangle]
pub extern "C" fn _start() -> ! {
    aurelia_kernel::serial::init_stdio();
    serial_println!("basic_boot: starting");

    test_gdt_and_idt_install();
    test_interrupts_toggle();
    test_serial_round_trip();

    serial_println!("basic_boot: all tests passed");
    exit_qemu(QemuExitCode::Success)
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    test_panic_handler(info)
}

fn test_gdt_and_idt_install() {
    aurelia_kernel::gdt::init();
    aurelia_kernel::idt::init();
    aurelia_kernel::gdt::verify_integrity().expect("GDT checksum should verify right after init");
    serial_println!("[ok] gdt/idt init");
}

fn test_interrupts_toggle() {
    assert!(!aurelia_kernel::idt::interrupts_enabled());
    aurelia_kernel::idt::enable_interrupts();
    assert!(aurelia_kernel::idt::interrupts_enabled());
    aurelia_kernel::idt::disable_interrupts();
    assert!(!aurelia_kernel::idt::interrupts_enabled());
    serial_println!("[ok] interrupt enable/disable");
}

fn test_serial_round_trip() {
    serial_println!("probe line");
    serial_println!("[ok] serial console writable");
}
