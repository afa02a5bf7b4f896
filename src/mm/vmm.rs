//! High-level virtual memory manager (C8), grounded in
//! `examples/original_source/src/src/syncos/vmm.c`'s HHDM-relative table
//! walk, memory-area allocator, and address-space lifecycle, rebuilt onto
//! this crate's [`PhysAddr`]/[`VirtAddr`]/[`PageTable`] newtypes.
//!
//! Two REDESIGN FLAGS from spec.md §9 are applied here rather than copied
//! from the original:
//! - intermediate-table User-accessibility is decided by whether the
//!   *target* address is lower-half, not by the leaf's `PF_R` bit;
//! - `is_mapped`'s HHDM fast path is bounded by the total physical RAM
//!   reported by the boot memory map, not a blanket `addr >= hhdm` test.

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::config::FRAME_SIZE;
use crate::error::KernelError;
use crate::mm::page_table::{PageFlags, PageTable, ENTRIES_PER_TABLE};
use crate::mm::pmm;
use crate::mm::types::{PhysAddr, VirtAddr};
use crate::sync::Spinlock;

const PAGE_SIZE_2M: u64 = 0x20_0000;
const PAGE_SIZE_1G: u64 = 0x4000_0000;

const MAX_MEMORY_AREAS: usize = 32;

/// Default reserved user region, matching
/// `examples/original_source/vmm.c`'s `register_memory_area` call for user
/// space (base 4 MiB, 256 MiB span).
const USER_REGION_BASE: u64 = 0x0040_0000;
const USER_REGION_SIZE: u64 = 0x1000_0000;

static HHDM_OFFSET: AtomicU64 = AtomicU64::new(0);
static TOTAL_PHYS_RAM: AtomicU64 = AtomicU64::new(0);
static CURRENT_PML4: AtomicU64 = AtomicU64::new(0);
static NX_SUPPORTED: AtomicBool = AtomicBool::new(false);
static PAGE_FAULTS: AtomicU64 = AtomicU64::new(0);

#[cfg(not(target_os = "none"))]
static HOSTED_CR3: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Copy)]
struct MemoryArea {
    base: u64,
    size: u64,
    used: bool,
    flags: PageFlags,
}

impl MemoryArea {
    const fn empty() -> Self {
        Self {
            base: 0,
            size: 0,
            used: false,
            flags: PageFlags::empty(),
        }
    }
}

struct AreaTable {
    areas: [MemoryArea; MAX_MEMORY_AREAS],
    count: usize,
}

impl AreaTable {
    const fn empty() -> Self {
        Self {
            areas: [MemoryArea::empty(); MAX_MEMORY_AREAS],
            count: 0,
        }
    }

    fn register(&mut self, base: u64, size: u64, flags: PageFlags) {
        if self.count >= MAX_MEMORY_AREAS {
            return;
        }
        self.areas[self.count] = MemoryArea { base, size, used: false, flags };
        self.count += 1;
    }

    fn find_free_mut(&mut self, size: u64) -> Option<&mut MemoryArea> {
        self.areas[..self.count].iter_mut().find(|a| !a.used && a.size >= size)
    }

    fn release(&mut self, base: u64) {
        if let Some(a) = self.areas[..self.count].iter_mut().find(|a| a.base == base) {
            a.used = false;
        }
    }
}

static KERNEL_AREAS: Spinlock<AreaTable> = Spinlock::new("vmm::kernel_areas", AreaTable::empty());
static USER_AREAS: Spinlock<AreaTable> = Spinlock::new("vmm::user_areas", AreaTable::empty());

/// Set up the HHDM offset, the total-RAM bound used by [`is_mapped`], the
/// current-PML4 shadow (read from CR3), NX support, and the default
/// kernel/user reserved regions.
pub fn init(hhdm_offset: u64, total_phys_ram: u64) {
    HHDM_OFFSET.store(hhdm_offset, Ordering::SeqCst);
    TOTAL_PHYS_RAM.store(total_phys_ram, Ordering::SeqCst);
    CURRENT_PML4.store(read_cr3().as_u64(), Ordering::SeqCst);
    NX_SUPPORTED.store(detect_nx(), Ordering::SeqCst);

    KERNEL_AREAS.lock().register(
        crate::config::KERNEL_HEAP_BASE,
        crate::config::KERNEL_HEAP_SIZE as u64,
        PageFlags::PRESENT | PageFlags::WRITABLE,
    );
    USER_AREAS.lock().register(
        USER_REGION_BASE,
        USER_REGION_SIZE,
        PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::USER,
    );
}

#[cfg(target_os = "none")]
fn detect_nx() -> bool {
    let r = unsafe { core::arch::x86_64::__cpuid(0x8000_0001) };
    r.edx & (1 << 20) != 0
}

#[cfg(not(target_os = "none"))]
fn detect_nx() -> bool {
    false
}

pub fn nx_supported() -> bool {
    NX_SUPPORTED.load(Ordering::Relaxed)
}

pub fn hhdm_offset() -> u64 {
    HHDM_OFFSET.load(Ordering::Relaxed)
}

fn phys_to_virt(phys: PhysAddr) -> VirtAddr {
    VirtAddr::new(phys.as_u64() + HHDM_OFFSET.load(Ordering::Relaxed))
}

/// # Safety
/// `phys` must name a live, exclusively-addressed page-table frame reached
/// through the HHDM alias.
unsafe fn table_mut(phys: PhysAddr) -> &'static mut PageTable {
    &mut *(phys_to_virt(phys).as_u64() as *mut PageTable)
}

fn zero_frame(phys: PhysAddr) {
    unsafe {
        core::ptr::write_bytes(phys_to_virt(phys).as_u64() as *mut u8, 0, FRAME_SIZE);
    }
}

fn alloc_table_frame() -> Result<PhysAddr, KernelError> {
    let frame = pmm::alloc_page();
    if frame.as_u64() == 0 {
        return Err(KernelError::OutOfPhysicalMemory { requested_frames: 1 });
    }
    zero_frame(frame);
    Ok(frame)
}

#[cfg(target_os = "none")]
fn read_cr3() -> PhysAddr {
    use x86_64::registers::control::Cr3;
    PhysAddr::new(Cr3::read().0.start_address().as_u64())
}

#[cfg(target_os = "none")]
fn write_cr3(phys: PhysAddr) {
    use x86_64::registers::control::{Cr3, Cr3Flags};
    use x86_64::structures::paging::PhysFrame;
    let frame = PhysFrame::containing_address(x86_64::PhysAddr::new(phys.as_u64()));
    unsafe {
        Cr3::write(frame, Cr3Flags::empty());
    }
}

#[cfg(not(target_os = "none"))]
fn read_cr3() -> PhysAddr {
    PhysAddr::new(HOSTED_CR3.load(Ordering::SeqCst))
}

#[cfg(not(target_os = "none"))]
fn write_cr3(phys: PhysAddr) {
    HOSTED_CR3.store(phys.as_u64(), Ordering::SeqCst);
}

fn flush(virt: VirtAddr) {
    #[cfg(target_os = "none")]
    {
        x86_64::instructions::tlb::flush(x86_64::VirtAddr::new(virt.as_u64()));
    }
    #[cfg(not(target_os = "none"))]
    {
        let _ = virt;
    }
}

pub fn current_address_space() -> PhysAddr {
    PhysAddr::new(CURRENT_PML4.load(Ordering::SeqCst))
}

/// Allocate the intermediate table at `table[idx]` if absent. User-
/// accessibility of the new entry follows REDESIGN FLAG #2: it is set iff
/// `virt` itself is lower-half, never from a leaf permission bit.
fn ensure_present(
    table: &mut PageTable,
    idx: usize,
    virt: VirtAddr,
) -> Result<(), KernelError> {
    if table.entry(idx).is_present() {
        return Ok(());
    }
    let frame = alloc_table_frame()?;
    let mut flags = PageFlags::PRESENT | PageFlags::WRITABLE;
    if virt.is_lower_half() {
        flags |= PageFlags::USER;
    }
    table.entry_mut(idx).set(frame, flags);
    Ok(())
}

/// Map one leaf at `virt` -> `phys`. Uses a 1 GiB or 2 MiB leaf when `flags`
/// requests `HUGE` and both addresses are aligned accordingly; otherwise a
/// 4 KiB leaf.
pub fn map_page(virt: VirtAddr, phys: PhysAddr, flags: PageFlags) -> Result<(), KernelError> {
    if virt.as_u64() == 0 || phys.as_u64() == 0 {
        return Err(KernelError::InvalidAddress { addr: virt.as_u64() });
    }
    let virt = virt.align_down();
    let phys = phys.align_down();

    let pml4_phys = current_address_space();
    let pml4 = unsafe { table_mut(pml4_phys) };
    ensure_present(pml4, virt.pml4_index(), virt)?;
    let pdpt_phys = pml4.entry(virt.pml4_index()).addr();

    if flags.contains(PageFlags::HUGE) && virt.as_u64() % PAGE_SIZE_1G == 0 && phys.as_u64() % PAGE_SIZE_1G == 0
    {
        let pdpt = unsafe { table_mut(pdpt_phys) };
        pdpt.entry_mut(virt.pdpt_index()).set(phys, flags);
        flush(virt);
        return Ok(());
    }

    let pdpt = unsafe { table_mut(pdpt_phys) };
    ensure_present(pdpt, virt.pdpt_index(), virt)?;
    let pd_phys = pdpt.entry(virt.pdpt_index()).addr();

    if flags.contains(PageFlags::HUGE) && virt.as_u64() % PAGE_SIZE_2M == 0 && phys.as_u64() % PAGE_SIZE_2M == 0
    {
        let pd = unsafe { table_mut(pd_phys) };
        pd.entry_mut(virt.pd_index()).set(phys, flags);
        flush(virt);
        return Ok(());
    }

    let pd = unsafe { table_mut(pd_phys) };
    ensure_present(pd, virt.pd_index(), virt)?;
    let pt_phys = pd.entry(virt.pd_index()).addr();

    let pt = unsafe { table_mut(pt_phys) };
    pt.entry_mut(virt.pt_index()).set(phys, flags | PageFlags::PRESENT);
    flush(virt);
    Ok(())
}

/// Map `n` consecutive pages starting at `virt`/`phys`. Prefers 2 MiB leaves
/// when both addresses are 2 MiB aligned, `n >= 512`, and `HUGE` is
/// requested; any partial tail falls back to 4 KiB leaves. Unwinds prior
/// mappings on the first failure.
pub fn map_pages(virt: VirtAddr, phys: PhysAddr, n: usize, flags: PageFlags) -> Result<(), KernelError> {
    if flags.contains(PageFlags::HUGE)
        && virt.as_u64() % PAGE_SIZE_2M == 0
        && phys.as_u64() % PAGE_SIZE_2M == 0
        && n >= 512
    {
        let huge_pages = n / 512;
        let remaining = n % 512;

        for i in 0..huge_pages {
            let v = virt + i as u64 * PAGE_SIZE_2M;
            let p = phys + i as u64 * PAGE_SIZE_2M;
            if map_page(v, p, flags).is_err() {
                for j in 0..i {
                    unmap_page(virt + j as u64 * PAGE_SIZE_2M);
                }
                return Err(KernelError::OutOfPhysicalMemory { requested_frames: n });
            }
        }

        if remaining > 0 {
            let start_v = virt + huge_pages as u64 * PAGE_SIZE_2M;
            let start_p = phys + huge_pages as u64 * PAGE_SIZE_2M;
            let tail_flags = flags & !PageFlags::HUGE;
            for i in 0..remaining {
                let v = start_v + i as u64 * FRAME_SIZE as u64;
                let p = start_p + i as u64 * FRAME_SIZE as u64;
                if map_page(v, p, tail_flags).is_err() {
                    for j in 0..i {
                        unmap_page(start_v + j as u64 * FRAME_SIZE as u64);
                    }
                    for j in 0..huge_pages {
                        unmap_page(virt + j as u64 * PAGE_SIZE_2M);
                    }
                    return Err(KernelError::OutOfPhysicalMemory { requested_frames: n });
                }
            }
        }
        return Ok(());
    }

    let tail_flags = flags & !PageFlags::HUGE;
    for i in 0..n {
        let v = virt + i as u64 * FRAME_SIZE as u64;
        let p = phys + i as u64 * FRAME_SIZE as u64;
        if map_page(v, p, tail_flags).is_err() {
            for j in 0..i {
                unmap_page(virt + j as u64 * FRAME_SIZE as u64);
            }
            return Err(KernelError::OutOfPhysicalMemory { requested_frames: n });
        }
    }
    Ok(())
}

/// Walk to the leaf mapping `virt`, clear it, and invalidate the TLB entry.
/// Huge leaves are cleared in place at the PDPT/PD level, never split.
pub fn unmap_page(virt: VirtAddr) -> bool {
    let virt = virt.align_down();
    let pml4 = unsafe { table_mut(current_address_space()) };
    let pml4e = *pml4.entry(virt.pml4_index());
    if !pml4e.is_present() {
        return false;
    }

    let pdpt = unsafe { table_mut(pml4e.addr()) };
    let pdpte = *pdpt.entry(virt.pdpt_index());
    if !pdpte.is_present() {
        return false;
    }
    if pdpte.is_huge() {
        pdpt.entry_mut(virt.pdpt_index()).clear();
        flush(virt);
        return true;
    }

    let pd = unsafe { table_mut(pdpte.addr()) };
    let pde = *pd.entry(virt.pd_index());
    if !pde.is_present() {
        return false;
    }
    if pde.is_huge() {
        pd.entry_mut(virt.pd_index()).clear();
        flush(virt);
        return true;
    }

    let pt = unsafe { table_mut(pde.addr()) };
    if !pt.entry(virt.pt_index()).is_present() {
        return false;
    }
    pt.entry_mut(virt.pt_index()).clear();
    flush(virt);
    true
}

pub fn unmap_pages(virt: VirtAddr, n: usize) {
    for i in 0..n {
        unmap_page(virt + i as u64 * FRAME_SIZE as u64);
    }
}

fn walk_translate(virt: VirtAddr) -> Option<PhysAddr> {
    let pml4 = unsafe { table_mut(current_address_space()) };
    let pml4e = *pml4.entry(virt.pml4_index());
    if !pml4e.is_present() {
        return None;
    }

    let pdpt = unsafe { table_mut(pml4e.addr()) };
    let pdpte = *pdpt.entry(virt.pdpt_index());
    if !pdpte.is_present() {
        return None;
    }
    if pdpte.is_huge() {
        return Some(PhysAddr::new(pdpte.addr().as_u64() + (virt.as_u64() & (PAGE_SIZE_1G - 1))));
    }

    let pd = unsafe { table_mut(pdpte.addr()) };
    let pde = *pd.entry(virt.pd_index());
    if !pde.is_present() {
        return None;
    }
    if pde.is_huge() {
        return Some(PhysAddr::new(pde.addr().as_u64() + (virt.as_u64() & (PAGE_SIZE_2M - 1))));
    }

    let pt = unsafe { table_mut(pde.addr()) };
    let pte = *pt.entry(virt.pt_index());
    if !pte.is_present() {
        return None;
    }
    Some(PhysAddr::new(pte.addr().as_u64() + (virt.as_u64() & (FRAME_SIZE as u64 - 1))))
}

/// Translate `virt` to its mapped physical address, or `PhysAddr::new(0)` if
/// unmapped. HHDM addresses short-circuit to `virt - hhdm_offset`.
pub fn physical_of(virt: VirtAddr) -> PhysAddr {
    let hhdm = HHDM_OFFSET.load(Ordering::Relaxed);
    if hhdm != 0 && virt.as_u64() >= hhdm {
        return PhysAddr::new(virt.as_u64() - hhdm);
    }
    walk_translate(virt).unwrap_or(PhysAddr::new(0))
}

/// True if `virt` is mapped. The HHDM fast path is bounded by the total
/// physical RAM reported at boot (REDESIGN FLAG #3), not a blanket
/// `addr >= hhdm_offset` test, so addresses past the end of the HHDM window
/// fall through to the real table walk.
pub fn is_mapped(virt: VirtAddr) -> bool {
    let hhdm = HHDM_OFFSET.load(Ordering::Relaxed);
    let total_ram = TOTAL_PHYS_RAM.load(Ordering::Relaxed);
    if hhdm != 0 && total_ram != 0 && virt.as_u64() >= hhdm && virt.as_u64() < hhdm + total_ram {
        return true;
    }
    walk_translate(virt).is_some()
}

fn area_table_for(flags: PageFlags) -> &'static Spinlock<AreaTable> {
    if flags.contains(PageFlags::USER) {
        &USER_AREAS
    } else {
        &KERNEL_AREAS
    }
}

fn cleanup_allocated_page(base: u64, index: usize) {
    let addr = VirtAddr::new(base + index as u64 * FRAME_SIZE as u64);
    let phys = physical_of(addr);
    unmap_page(addr);
    if phys.as_u64() != 0 {
        pmm::free_page(phys);
    }
}

/// Find an unused reserved region of adequate size, allocate `ceil(size /
/// FRAME_SIZE)` physical frames one at a time, map them with `flags`
/// combined with the region's own default flags, and zero-fill through the
/// HHDM alias. Any failure unwinds every prior step.
pub fn allocate(size: usize, flags: PageFlags) -> Result<VirtAddr, KernelError> {
    if size == 0 {
        return Err(KernelError::InvalidAddress { addr: 0 });
    }
    let size = (size + FRAME_SIZE - 1) / FRAME_SIZE * FRAME_SIZE;
    let page_count = size / FRAME_SIZE;

    let table = area_table_for(flags);
    let (base, area_flags) = {
        let mut guard = table.lock();
        let area = guard
            .find_free_mut(size as u64)
            .ok_or(KernelError::NotFound { resource: "vmm_area" })?;
        area.used = true;
        (area.base, area.flags)
    };

    for i in 0..page_count {
        let phys = pmm::alloc_page();
        if phys.as_u64() == 0 {
            for j in 0..i {
                cleanup_allocated_page(base, j);
            }
            table.lock().release(base);
            return Err(KernelError::OutOfPhysicalMemory { requested_frames: page_count });
        }

        let virt = VirtAddr::new(base + i as u64 * FRAME_SIZE as u64);
        if map_page(virt, phys, flags | area_flags).is_err() {
            pmm::free_page(phys);
            for j in 0..i {
                cleanup_allocated_page(base, j);
            }
            table.lock().release(base);
            return Err(KernelError::OutOfPhysicalMemory { requested_frames: page_count });
        }
        zero_frame(phys);
    }

    Ok(VirtAddr::new(base))
}

/// Symmetric teardown of [`allocate`]: unmap and free every page, then mark
/// the owning region free again.
pub fn free(addr: VirtAddr, size: usize) {
    if addr.as_u64() == 0 || size == 0 {
        return;
    }
    let size = (size + FRAME_SIZE - 1) / FRAME_SIZE * FRAME_SIZE;
    let page_count = size / FRAME_SIZE;

    for i in 0..page_count {
        cleanup_allocated_page(addr.as_u64(), i);
    }

    let hhdm = HHDM_OFFSET.load(Ordering::Relaxed);
    let table = if hhdm != 0 && addr.as_u64() >= hhdm { &KERNEL_AREAS } else { &USER_AREAS };
    table.lock().release(addr.as_u64());
}

/// Allocate a fresh PML4, zero it, and copy entries 256-511 from the
/// current PML4 by value (kernel-half sharing).
pub fn create_address_space() -> Result<PhysAddr, KernelError> {
    let pml4_phys = alloc_table_frame()?;
    let current = current_address_space();
    let src = unsafe { table_mut(current) };
    let dst = unsafe { table_mut(pml4_phys) };
    for i in 256..ENTRIES_PER_TABLE {
        *dst.entry_mut(i) = *src.entry(i);
    }
    Ok(pml4_phys)
}

pub fn switch_address_space(pml4_phys: PhysAddr) {
    if pml4_phys.as_u64() == 0 || pml4_phys == current_address_space() {
        return;
    }
    CURRENT_PML4.store(pml4_phys.as_u64(), Ordering::SeqCst);
    write_cr3(pml4_phys);
}

/// Walk lower-half entries only, freeing every present non-huge PDPT/PD/PT
/// *structure* frame, then the PML4 itself. Leaf data frames are never
/// touched here — see `process::terminate`, which makes the ELF loader's
/// recorded segment list authoritative for those (REDESIGN FLAG #5).
pub fn delete_address_space(pml4_phys: PhysAddr) {
    if pml4_phys.as_u64() == 0 || pml4_phys == current_address_space() {
        return;
    }
    let pml4 = unsafe { table_mut(pml4_phys) };
    for pml4_idx in 0..256 {
        let e = *pml4.entry(pml4_idx);
        if !e.is_present() {
            continue;
        }
        let pdpt_phys = e.addr();
        let pdpt = unsafe { table_mut(pdpt_phys) };
        for pdpt_idx in 0..ENTRIES_PER_TABLE {
            let pe = *pdpt.entry(pdpt_idx);
            if pe.is_present() && !pe.is_huge() {
                let pd_phys = pe.addr();
                let pd = unsafe { table_mut(pd_phys) };
                for pd_idx in 0..ENTRIES_PER_TABLE {
                    let de = *pd.entry(pd_idx);
                    if de.is_present() && !de.is_huge() {
                        pmm::free_page(de.addr());
                    }
                }
                pmm::free_page(pd_phys);
            }
        }
        pmm::free_page(pdpt_phys);
    }
    pmm::free_page(pml4_phys);
}

/// Full TLB flush via a same-value CR3 reload.
pub fn flush_tlb_full() {
    write_cr3(current_address_space());
}

/// Called from `idt::page_fault_handler`. The core declines to resolve
/// every fault — demand paging/COW would attach here — so this only tallies
/// the fault and returns `false`, leaving the diagnostic dump and halt to
/// the IDT's default exception path.
pub fn handle_page_fault(fault_addr: u64, _error_code: u64, _rip: u64) -> bool {
    let _ = fault_addr;
    PAGE_FAULTS.fetch_add(1, Ordering::Relaxed);
    false
}

pub fn page_fault_count() -> u64 {
    PAGE_FAULTS.load(Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn area_table_register_and_find_free() {
        let mut t = AreaTable::empty();
        t.register(0x1000, 0x4000, PageFlags::PRESENT);
        assert!(t.find_free_mut(0x2000).is_some());
        assert!(t.find_free_mut(0x8000).is_none());
    }

    #[test]
    fn area_marked_used_is_excluded_until_released() {
        let mut t = AreaTable::empty();
        t.register(0x1000, 0x4000, PageFlags::PRESENT);
        t.find_free_mut(0x1000).unwrap().used = true;
        assert!(t.find_free_mut(0x1000).is_none());
        t.release(0x1000);
        assert!(t.find_free_mut(0x1000).is_some());
    }

    #[test]
    fn registering_past_capacity_is_a_silent_no_op() {
        let mut t = AreaTable::empty();
        for i in 0..MAX_MEMORY_AREAS + 4 {
            t.register(i as u64 * 0x1000, 0x1000, PageFlags::PRESENT);
        }
        assert_eq!(t.count, MAX_MEMORY_AREAS);
    }

    #[test]
    fn handle_page_fault_always_declines_and_tallies() {
        let before = page_fault_count();
        assert!(!handle_page_fault(0x1000, 0, 0));
        assert_eq!(page_fault_count(), before + 1);
    }
}
