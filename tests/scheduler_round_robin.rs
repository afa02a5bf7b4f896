//! Process creation feeds the scheduler's ready queue the way spec.md §4.10
//! describes: each `process::create` call gets a fresh PID, lands in
//! `Ready`, and the running thread (idle, slot 0) is left undisturbed until
//! something actually yields. Exercising an actual dispatch would jump this
//! test binary into ring 3 and never return (`dispatch_to`'s `enter_usermode`
//! path), so this only checks the bookkeeping dispatch itself relies on.

#![no_std]
#![no_main]

extern crate alloc;

use core::panic::PanicInfo;

use aurelia_kernel::mm::memmap::{MemoryRegion, RegionKind};
use aurelia_kernel::mm::pmm;
use aurelia_kernel::mm::vmm;
use aurelia_kernel::process::{self, ProcessParams, ProcessState};
use aurelia_kernel::sched;
use aurelia_kernel::{exit_qemu, serial_println, test_panic_handler, QemuExitCode};

#[no_mangle]
pub extern "C" fn _start() -> ! {
    aurelia_kernel::serial::init_stdio();
    serial_println!("scheduler_round_robin: starting");

    boot_minimal();
    test_created_processes_are_ready_and_unique();
    test_idle_stays_current_until_dispatch();

    serial_println!("scheduler_round_robin: all tests passed");
    exit_qemu(QemuExitCode::Success)
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    test_panic_handler(info)
}

/// Just enough of the real boot sequence for `process::create` to work:
/// GDT/IDT so faults during ELF load don't triple-fault, a PMM over a
/// synthetic memory map, and a VMM with a real HHDM offset of 0 (matches
/// QEMU's identity-mapped low memory under the `isa-debug-exit` harness).
fn boot_minimal() {
    aurelia_kernel::gdt::init();
    aurelia_kernel::idt::init();

    let memmap = [
        MemoryRegion { base: 0x0, length: 0x10_0000, kind: RegionKind::Reserved },
        MemoryRegion { base: 0x10_0000, length: 32 * 1024 * 1024, kind: RegionKind::Usable },
    ];
    pmm::init(&memmap);
    vmm::init(0, 0x10_0000 + 32 * 1024 * 1024);
    sched::init();
}

/// A one-segment static executable whose entry just spins (`jmp $`); never
/// actually run by this test, only loaded and mapped.
fn spinner_elf() -> alloc::vec::Vec<u8> {
    const EHDR_SIZE: usize = 64;
    const PHDR_SIZE: usize = 56;
    const ENTRY: u64 = 0x0040_0000;
    let code: [u8; 2] = [0xEB, 0xFE]; // jmp $

    let mut buf = alloc::vec![0u8; EHDR_SIZE + PHDR_SIZE + code.len()];
    buf[0..4].copy_from_slice(&[0x7F, b'E', b'L', b'F']);
    buf[4] = 2; // ELFCLASS64
    buf[5] = 1; // little-endian
    buf[6] = 1; // EV_CURRENT
    buf[16..18].copy_from_slice(&2u16.to_le_bytes()); // ET_EXEC
    buf[18..20].copy_from_slice(&62u16.to_le_bytes()); // EM_X86_64
    buf[20..24].copy_from_slice(&1u32.to_le_bytes());
    buf[24..32].copy_from_slice(&ENTRY.to_le_bytes());
    buf[32..40].copy_from_slice(&(EHDR_SIZE as u64).to_le_bytes()); // e_phoff
    buf[54..56].copy_from_slice(&(PHDR_SIZE as u16).to_le_bytes());
    buf[56..58].copy_from_slice(&1u16.to_le_bytes()); // e_phnum

    let ph = EHDR_SIZE;
    buf[ph..ph + 4].copy_from_slice(&1u32.to_le_bytes()); // PT_LOAD
    buf[ph + 4..ph + 8].copy_from_slice(&0x5u32.to_le_bytes()); // PF_R | PF_X
    buf[ph + 8..ph + 16].copy_from_slice(&(EHDR_SIZE as u64 + PHDR_SIZE as u64).to_le_bytes()); // p_offset
    buf[ph + 16..ph + 24].copy_from_slice(&ENTRY.to_le_bytes()); // p_vaddr
    buf[ph + 32..ph + 40].copy_from_slice(&(code.len() as u64).to_le_bytes()); // p_filesz
    buf[ph + 40..ph + 48].copy_from_slice(&(code.len() as u64).to_le_bytes()); // p_memsz

    buf.extend_from_slice(&code);
    buf
}

fn test_created_processes_are_ready_and_unique() {
    let elf = spinner_elf();
    let params = ProcessParams::default();

    let pid_a = process::create(&elf, &params).expect("first process should load");
    let pid_b = process::create(&elf, &params).expect("second process should load");
    let pid_c = process::create(&elf, &params).expect("third process should load");

    assert!(pid_a != pid_b && pid_b != pid_c && pid_a != pid_c);
    assert_eq!(process::state_of(pid_a), Some(ProcessState::Ready));
    assert_eq!(process::state_of(pid_b), Some(ProcessState::Ready));
    assert_eq!(process::state_of(pid_c), Some(ProcessState::Ready));

    serial_println!("[ok] three processes created with distinct pids, all Ready");
}

fn test_idle_stays_current_until_dispatch() {
    assert_eq!(sched::current_pid(), 0);
    serial_println!("[ok] idle (pid 0) remains current before any dispatch");
}
