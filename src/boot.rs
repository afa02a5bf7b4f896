//! Limine entry point (C1-C10 boot glue, spec.md SPEC_FULL.md §4.11),
//! grounded in `examples/original_source/main.c`'s `pmm_init -> vmm_init ->
//! idt/pic/timer init -> process_init -> process_scheduler_init -> scheduler
//! loop` sequence and the teacher's `main.rs` `_start`
//! (`arch::init(); mm::init(); sched::init(); sched::run();`).
//!
//! Only compiled for the bare-metal target (see the `#[cfg(...)]` on this
//! module's declaration in `lib.rs`): `_start` touches CR3, port I/O, and
//! privileged MSRs that don't exist on the host test target, and the test
//! harness binary provides its own `_start` instead.

use limine::request::{
    BootloaderInfoRequest, FramebufferRequest, HhdmRequest, KernelAddressRequest, MemoryMapRequest,
};
use limine::memory_map::EntryType;
use limine::BaseRevision;

use crate::config::KERNEL_HEAP_SIZE;
use crate::mm::memmap::{MemoryRegion, RegionKind};
use crate::mm::page_table::PageFlags;
use crate::mm::{pmm, vmm};

/// Pins the Limine base revision this kernel was built against. Must live in
/// the `.requests` section, between the start/end markers below, for the
/// bootloader to find it during the handoff protocol.
#[used]
#[link_section = ".requests"]
static BASE_REVISION: BaseRevision = BaseRevision::new();

#[used]
#[link_section = ".requests"]
static MEMORY_MAP_REQUEST: MemoryMapRequest = MemoryMapRequest::new();

#[used]
#[link_section = ".requests"]
static HHDM_REQUEST: HhdmRequest = HhdmRequest::new();

#[used]
#[link_section = ".requests"]
static KERNEL_ADDRESS_REQUEST: KernelAddressRequest = KernelAddressRequest::new();

#[used]
#[link_section = ".requests"]
static FRAMEBUFFER_REQUEST: FramebufferRequest = FramebufferRequest::new();

#[used]
#[link_section = ".requests"]
static BOOTLOADER_INFO_REQUEST: BootloaderInfoRequest = BootloaderInfoRequest::new();

#[used]
#[link_section = ".requests_start_marker"]
static _REQUESTS_START: limine::requests_start_marker::RequestsStartMarker =
    limine::requests_start_marker::RequestsStartMarker::new();

#[used]
#[link_section = ".requests_end_marker"]
static _REQUESTS_END: limine::requests_end_marker::RequestsEndMarker =
    limine::requests_end_marker::RequestsEndMarker::new();

fn region_kind_of(entry_type: EntryType) -> RegionKind {
    match entry_type {
        EntryType::USABLE => RegionKind::Usable,
        EntryType::ACPI_RECLAIMABLE => RegionKind::AcpiReclaimable,
        EntryType::ACPI_NVS => RegionKind::AcpiNvs,
        EntryType::BAD_MEMORY => RegionKind::BadMemory,
        EntryType::BOOTLOADER_RECLAIMABLE => RegionKind::BootloaderReclaimable,
        EntryType::KERNEL_AND_MODULES => RegionKind::KernelAndModules,
        EntryType::FRAMEBUFFER => RegionKind::Framebuffer,
        _ => RegionKind::Reserved,
    }
}

/// Convert Limine's typed memory map response into this crate's
/// boot-protocol-neutral [`MemoryRegion`] slice, so `mm::pmm::init` (and its
/// host-runnable tests) never need to link against `limine` types directly.
/// Bounded by `MAX_REGIONS`: Limine never reports more than a few dozen
/// entries in practice, but a fixed buffer avoids a boot-time heap
/// allocation before the heap exists.
const MAX_REGIONS: usize = 64;

fn collect_memory_regions(response: &limine::memory_map::MemoryMapResponse) -> ([MemoryRegion; MAX_REGIONS], usize) {
    let mut regions = [MemoryRegion { base: 0, length: 0, kind: RegionKind::Reserved }; MAX_REGIONS];
    let mut count = 0;
    for entry in response.entries().iter().take(MAX_REGIONS) {
        regions[count] = MemoryRegion {
            base: entry.base,
            length: entry.length,
            kind: region_kind_of(entry.entry_type),
        };
        count += 1;
    }
    (regions, count)
}

/// Upper bound used to size the VMM's `is_mapped` HHDM fast path (REDESIGN
/// FLAG #3): the highest address any memory map entry extends to, not a
/// blanket "all of the HHDM window".
fn total_physical_extent(regions: &[MemoryRegion]) -> u64 {
    regions.iter().map(MemoryRegion::end).max().unwrap_or(0)
}

/// The kernel's single entry point, named in `linker.ld`'s `ENTRY(_start)`.
/// Never returns: the last step, `sched::idle_loop`, loops forever with
/// interrupts enabled.
#[no_mangle]
pub extern "C" fn _start() -> ! {
    crate::serial::init_stdio();
    crate::serial::init_logger(log::LevelFilter::Info);
    log::info!("aurelia-kernel boot (git {})", env!("GIT_HASH"));

    if let Some(info) = BOOTLOADER_INFO_REQUEST.get_response() {
        log::info!("bootloader: {} {}", info.name(), info.version());
    }

    crate::gdt::init();
    crate::idt::init();

    let memmap_response = MEMORY_MAP_REQUEST
        .get_response()
        .expect("Limine did not answer the memory map request");
    let hhdm_response = HHDM_REQUEST
        .get_response()
        .expect("Limine did not answer the HHDM request");

    let (regions, region_count) = collect_memory_regions(memmap_response);
    let regions = &regions[..region_count];
    let hhdm_offset = hhdm_response.offset();
    let total_ram = total_physical_extent(regions);

    if let Some(kaddr) = KERNEL_ADDRESS_REQUEST.get_response() {
        log::info!(
            "kernel loaded at phys {:#x}, virt {:#x}",
            kaddr.physical_base(),
            kaddr.virtual_base()
        );
    }
    if let Some(fb) = FRAMEBUFFER_REQUEST.get_response() {
        log::info!("{} framebuffer(s) reported", fb.framebuffers().count());
    }

    pmm::init(regions);
    vmm::init(hhdm_offset, total_ram);
    log::info!(
        "memory: {} usable frames, hhdm offset {:#x}",
        pmm::free_memory() / crate::config::FRAME_SIZE,
        hhdm_offset
    );

    init_kernel_heap();

    crate::pic::init_default();
    crate::pit::init(crate::config::DEFAULT_PIT_HZ);
    crate::sched::init();
    crate::idt::enable_interrupts();

    log::info!("scheduler armed, entering idle loop");
    crate::sched::idle_loop();
}

/// Map the kernel heap's reserved region (registered by `vmm::init`) and
/// hand it to the global allocator. Must run after `vmm::init` and before
/// any subsystem allocates (`process::create`'s `Vec`-backed ELF parsing,
/// the PCB table itself is fixed-size so it does not need the heap, but the
/// scheduler's future growth and any logging buffers might).
fn init_kernel_heap() {
    let heap_start = vmm::allocate(KERNEL_HEAP_SIZE, PageFlags::PRESENT | PageFlags::WRITABLE)
        .expect("failed to reserve kernel heap");
    unsafe {
        crate::kernel_allocator()
            .lock()
            .init(heap_start.as_u64() as *mut u8, KERNEL_HEAP_SIZE);
    }
}

#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    log::error!("panic: {info}");
    loop {
        crate::arch::halt();
    }
}
