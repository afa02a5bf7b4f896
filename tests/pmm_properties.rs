//! Physical memory manager properties under a synthetic memory map: the low
//! guard region stays reserved, allocation/free is consistent, and runs of
//! frames come back contiguous.

#![no_std]
#![no_main]

extern crate alloc;

use core::panic::PanicInfo;

use aurelia_kernel::config::{FRAME_SIZE, PMM_LOW_MEMORY_GUARD_FRAMES};
use aurelia_kernel::mm::memmap::{MemoryRegion, RegionKind};
use aurelia_kernel::mm::pmm;
use aurelia_kernel::{exit_qemu, serial_println, test_panic_handler, QemuExitCode};

#[no_mangle]
pub extern "C" fn _start() -> ! {
    aurelia_kernel::serial::init_stdio();
    serial_println!("pmm_properties: starting");

    test_init_reserves_low_guard();
    test_alloc_free_round_trips();
    test_contiguous_multi_page_alloc();
    test_exhaustion_is_reported();

    serial_println!("pmm_properties: all tests passed");
    exit_qemu(QemuExitCode::Success)
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    test_panic_handler(info)
}

fn test_map() -> [MemoryRegion; 2] {
    [
        MemoryRegion { base: 0x0, length: 0x10_0000, kind: RegionKind::Reserved },
        MemoryRegion { base: 0x10_0000, length: 8 * 1024 * 1024, kind: RegionKind::Usable },
    ]
}

fn test_init_reserves_low_guard() {
    pmm::init(&test_map());
    let guard_bytes = PMM_LOW_MEMORY_GUARD_FRAMES * FRAME_SIZE;
    for _ in 0..PMM_LOW_MEMORY_GUARD_FRAMES {
        let frame = pmm::alloc_page();
        assert!(frame.as_u64() >= 0x10_0000 + guard_bytes as u64);
        pmm::free_page(frame);
    }
    serial_println!("[ok] low guard frames excluded from allocation");
}

fn test_alloc_free_round_trips() {
    pmm::init(&test_map());
    let before = pmm::free_memory();
    let frame = pmm::alloc_page();
    assert!(frame.as_u64() != 0);
    assert_eq!(pmm::free_memory(), before - FRAME_SIZE);
    pmm::free_page(frame);
    assert_eq!(pmm::free_memory(), before);
    serial_println!("[ok] alloc/free round-trips free_memory()");
}

fn test_contiguous_multi_page_alloc() {
    pmm::init(&test_map());
    let base = pmm::alloc_pages(16);
    assert!(base.as_u64() != 0);
    for i in 0..16 {
        assert!(!pmm::is_free(aurelia_kernel::mm::types::PhysAddr::new(
            base.as_u64() + i as u64 * FRAME_SIZE as u64
        )));
    }
    pmm::free_pages(base, 16);
    serial_println!("[ok] 16-frame run is contiguous and frees cleanly");
}

fn test_exhaustion_is_reported() {
    let tiny = [MemoryRegion {
        base: 0x10_0000,
        length: (PMM_LOW_MEMORY_GUARD_FRAMES as u64 + 4) * FRAME_SIZE as u64,
        kind: RegionKind::Usable,
    }];
    pmm::init(&tiny);
    let mut allocated = alloc::vec::Vec::new();
    loop {
        let frame = pmm::alloc_page();
        if frame.as_u64() == 0 {
            break;
        }
        allocated.push(frame);
    }
    assert!(!allocated.is_empty());
    for frame in allocated {
        pmm::free_page(frame);
    }
    serial_println!("[ok] exhaustion returns a null frame instead of panicking");
}
