//! Process control blocks, the fixed PCB table, and process lifecycle
//! (C10), grounded in `examples/original_source/src/src/syncos/process.c`'s
//! `process_create`/`process_terminate` step order and `process_t` layout,
//! rebuilt onto this crate's [`mm::vmm`]/[`elf`] types.
//!
//! REDESIGN FLAG #5 (spec.md §9) is applied in [`terminate`]: the ELF
//! loader's recorded segment list is authoritative for every leaf data
//! frame a process owns (its `PT_LOAD` segments *and* its stack), unmapped
//! and freed explicitly before `vmm::delete_address_space` reclaims the
//! page-table *structure* frames. The two paths never share responsibility
//! for the same frame.

pub mod context;

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::config::{DEFAULT_QUANTUM_TICKS, DEFAULT_STACK_SIZE, DEFAULT_STACK_TOP, FRAME_SIZE, MAX_PROCESSES};
use crate::error::KernelError;
use crate::mm::page_table::PageFlags;
use crate::mm::types::{PhysAddr, VirtAddr};
use crate::mm::{pmm, vmm};
use crate::sync::Spinlock;

use self::context::CpuContext;
use crate::elf::{ElfImage, LoadedSegment, MAX_LOADED_SEGMENTS};

/// Bias applied to `ET_DYN` (position-independent) executables. Chosen to
/// land inside the default user reserved region (`mm::vmm`'s `USER_REGION`)
/// without colliding with a process's fixed stack address.
pub const ELF_DYN_BIAS: u64 = 0x0040_0000;

/// Lifecycle states (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    New,
    Ready,
    Running,
    Blocked,
    Suspended,
    Terminated,
}

/// Process creation parameters (spec.md §4.10 `create(elf_bytes, params)`).
#[derive(Debug, Clone, Copy)]
pub struct ProcessParams {
    pub parent_pid: u32,
    pub stack_size: usize,
    pub base_priority: i32,
    pub quantum_ticks: u64,
}

impl Default for ProcessParams {
    fn default() -> Self {
        Self {
            parent_pid: 0,
            stack_size: 0,
            base_priority: 0,
            quantum_ticks: 0,
        }
    }
}

const NAME_CAP: usize = 32;

/// The durable per-process record (spec.md §3 PCB).
#[derive(Debug, Clone, Copy)]
pub struct Pcb {
    pub pid: u32,
    pub parent_pid: u32,
    name: [u8; NAME_CAP],
    name_len: u8,
    pub state: ProcessState,
    pub context: CpuContext,
    pub page_table: PhysAddr,
    pub stack_top_virt: VirtAddr,
    pub stack_size: usize,
    pub entry_point_virt: VirtAddr,
    pub start_tick: u64,
    pub cpu_ticks: u64,
    pub last_schedule_tick: u64,
    pub quantum_ticks: u64,
    pub base_priority: i32,
    pub dynamic_priority: i32,
    pub exit_code: i32,
    segments: [Option<LoadedSegment>; MAX_LOADED_SEGMENTS],
    segment_count: usize,
    in_use: bool,
    pub(crate) ready_next: Option<u16>,
    pub(crate) ready_prev: Option<u16>,
    pub(crate) blocked_next: Option<u16>,
}

impl Pcb {
    const fn empty() -> Self {
        Self {
            pid: 0,
            parent_pid: 0,
            name: [0; NAME_CAP],
            name_len: 0,
            state: ProcessState::New,
            context: CpuContext::zeroed(),
            page_table: PhysAddr::new(0),
            stack_top_virt: VirtAddr::new(0),
            stack_size: 0,
            entry_point_virt: VirtAddr::new(0),
            start_tick: 0,
            cpu_ticks: 0,
            last_schedule_tick: 0,
            quantum_ticks: DEFAULT_QUANTUM_TICKS,
            base_priority: 0,
            dynamic_priority: 0,
            exit_code: 0,
            segments: [None; MAX_LOADED_SEGMENTS],
            segment_count: 0,
            in_use: false,
            ready_next: None,
            ready_prev: None,
            blocked_next: None,
        }
    }

    pub fn name(&self) -> &str {
        core::str::from_utf8(&self.name[..self.name_len as usize]).unwrap_or("")
    }

    fn set_name(&mut self, name: &str) {
        let bytes = name.as_bytes();
        let n = bytes.len().min(NAME_CAP);
        self.name[..n].copy_from_slice(&bytes[..n]);
        self.name_len = n as u8;
    }
}

/// Fixed-size PCB table plus the doubly linked ready queue and singly
/// linked blocked queue (spec.md §4.10). All three live behind one
/// spinlock: the ready queue's links are intrusive fields on the PCBs
/// themselves, so one lock covering "the table" and "the queues" is both
/// sufficient and simpler to reason about than separate locks that would
/// otherwise need an ordering rule between them.
struct ProcessTable {
    slots: [Pcb; MAX_PROCESSES],
    ready_head: Option<u16>,
    ready_tail: Option<u16>,
    blocked_head: Option<u16>,
    current: u16,
}

impl ProcessTable {
    const fn empty() -> Self {
        Self {
            slots: [Pcb::empty(); MAX_PROCESSES],
            ready_head: None,
            ready_tail: None,
            blocked_head: None,
            current: 0,
        }
    }

    fn find_free_slot(&self) -> Option<usize> {
        self.slots.iter().position(|p| !p.in_use)
    }

    fn find_by_pid(&self, pid: u32) -> Option<usize> {
        self.slots.iter().position(|p| p.in_use && p.pid == pid)
    }
}

static TABLE: Spinlock<ProcessTable> = Spinlock::new("process::table", ProcessTable::empty());
static NEXT_PID: AtomicU32 = AtomicU32::new(1);
static IDLE_CR3: AtomicU64 = AtomicU64::new(0);

/// Allocate the next PID, skipping 0 on wraparound (spec.md §8 boundary:
/// "PID counter wrapping skips 0").
fn allocate_pid() -> u32 {
    loop {
        let pid = NEXT_PID.fetch_add(1, Ordering::SeqCst);
        if pid != 0 {
            return pid;
        }
    }
}

/// Register slot 0 as the idle PCB: the bootstrap kernel execution context
/// itself, lowest priority, infinite quantum, initially Running (spec.md
/// §4.10 "Idle").
pub fn init() {
    let cr3 = vmm::current_address_space();
    IDLE_CR3.store(cr3.as_u64(), Ordering::SeqCst);

    let mut table = TABLE.lock();
    let idle = &mut table.slots[0];
    *idle = Pcb::empty();
    idle.pid = 0;
    idle.parent_pid = 0;
    idle.set_name("idle");
    idle.state = ProcessState::Running;
    idle.page_table = cr3;
    idle.quantum_ticks = u64::MAX;
    idle.base_priority = i32::MIN;
    idle.dynamic_priority = i32::MIN;
    idle.in_use = true;
    table.current = 0;
}

/// Physical address of the idle PCB's page table, used as a safe landing
/// space to switch CR3 into before an address space is deleted.
fn idle_cr3() -> PhysAddr {
    PhysAddr::new(IDLE_CR3.load(Ordering::SeqCst))
}

fn stack_base_of(stack_top: VirtAddr, stack_size: usize) -> VirtAddr {
    VirtAddr::new(stack_top.as_u64() - stack_size as u64)
}

/// Validate `elf_bytes`, build a fresh address space, map a guarded user
/// stack, load the ELF's `PT_LOAD` segments, and enqueue the new PCB Ready
/// (spec.md §4.10 `create`). Every step unwinds fully on failure; no PID
/// or PML4 is allocated for an image that fails ELF validation.
pub fn create(elf_bytes: &[u8], params: &ProcessParams) -> Result<u32, KernelError> {
    let mut image = ElfImage::parse(elf_bytes).map_err(KernelError::InvalidElf)?;

    let slot = {
        let table = TABLE.lock();
        table.find_free_slot().ok_or(KernelError::QueueFull { resource: "process_table" })?
    };

    let stack_size = if params.stack_size == 0 { DEFAULT_STACK_SIZE } else { params.stack_size };
    let stack_page_count = stack_size.div_ceil(FRAME_SIZE);
    let stack_top = VirtAddr::new(DEFAULT_STACK_TOP);
    let stack_base = stack_base_of(stack_top, stack_size);

    let old_cr3 = vmm::current_address_space();
    let new_cr3 = vmm::create_address_space()?;
    vmm::switch_address_space(new_cr3);

    let result = (|| -> Result<(u64, [Option<LoadedSegment>; MAX_LOADED_SEGMENTS], usize), KernelError> {
        map_stack(stack_base, stack_page_count)?;
        let bias = if image.is_dynamic() { ELF_DYN_BIAS } else { 0 };
        let entry = image.load(bias)?;
        Ok((entry, image.segments, image.segment_count))
    })();

    let (entry, segments, segment_count) = match result {
        Ok(v) => v,
        Err(e) => {
            unmap_stack(stack_base, stack_page_count);
            vmm::switch_address_space(old_cr3);
            vmm::delete_address_space(new_cr3);
            return Err(e);
        }
    };

    vmm::switch_address_space(old_cr3);

    let pid = allocate_pid();
    let mut table = TABLE.lock();
    let pcb = &mut table.slots[slot];
    *pcb = Pcb::empty();
    pcb.pid = pid;
    pcb.parent_pid = params.parent_pid;
    pcb.set_name("process");
    pcb.state = ProcessState::Ready;
    pcb.context = CpuContext::new_user(VirtAddr::new(entry), stack_top, new_cr3);
    pcb.page_table = new_cr3;
    pcb.stack_top_virt = stack_top;
    pcb.stack_size = stack_size;
    pcb.entry_point_virt = VirtAddr::new(entry);
    pcb.start_tick = crate::pit::ticks();
    pcb.quantum_ticks = if params.quantum_ticks == 0 { DEFAULT_QUANTUM_TICKS } else { params.quantum_ticks };
    pcb.base_priority = params.base_priority;
    pcb.dynamic_priority = params.base_priority;
    pcb.segments = segments;
    pcb.segment_count = segment_count;
    pcb.in_use = true;
    drop(table);

    crate::sched::push_ready(slot as u16);
    Ok(pid)
}

fn map_stack(stack_base: VirtAddr, page_count: usize) -> Result<(), KernelError> {
    let flags = PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::USER | stack_nx_flag();
    for i in 0..page_count {
        let phys = pmm::alloc_page();
        if phys.as_u64() == 0 {
            for j in 0..i {
                unmap_one(stack_base, j);
            }
            return Err(KernelError::OutOfPhysicalMemory { requested_frames: page_count });
        }
        let virt = VirtAddr::new(stack_base.as_u64() + i as u64 * FRAME_SIZE as u64);
        if let Err(e) = vmm::map_page(virt, phys, flags) {
            pmm::free_page(phys);
            for j in 0..i {
                unmap_one(stack_base, j);
            }
            return Err(e);
        }
        let hhdm_virt = vmm::hhdm_offset() + phys.as_u64();
        unsafe { core::ptr::write_bytes(hhdm_virt as *mut u8, 0, FRAME_SIZE) };
    }
    Ok(())
}

fn stack_nx_flag() -> PageFlags {
    if vmm::nx_supported() {
        PageFlags::NO_EXECUTE
    } else {
        PageFlags::empty()
    }
}

fn unmap_one(stack_base: VirtAddr, index: usize) {
    let virt = VirtAddr::new(stack_base.as_u64() + index as u64 * FRAME_SIZE as u64);
    let phys = vmm::physical_of(virt);
    vmm::unmap_page(virt);
    if phys.as_u64() != 0 {
        pmm::free_page(phys);
    }
}

fn unmap_stack(stack_base: VirtAddr, page_count: usize) {
    for i in 0..page_count {
        unmap_one(stack_base, i);
    }
}

/// Remove `pid` from any queue, free its ELF segments and stack frames,
/// delete its address space, and mark the slot Terminated and reusable
/// (spec.md §4.10 `terminate`). If `pid` is the running process, the
/// caller (`sched::terminate`) dispatches a replacement afterward.
pub(crate) fn reclaim(slot: usize, exit_code: i32) -> Result<(), KernelError> {
    let (page_table, stack_base, stack_page_count, mut segments, mut segment_count) = {
        let mut table = TABLE.lock();
        let pcb = &mut table.slots[slot];
        if !pcb.in_use {
            return Err(KernelError::NotFound { resource: "process" });
        }
        pcb.exit_code = exit_code;
        let stack_base = stack_base_of(pcb.stack_top_virt, pcb.stack_size);
        let stack_page_count = pcb.stack_size / FRAME_SIZE;
        (pcb.page_table, stack_base, stack_page_count, pcb.segments, pcb.segment_count)
    };

    let was_current = vmm::current_address_space();
    let need_switch_in = was_current != page_table;
    if need_switch_in {
        vmm::switch_address_space(page_table);
    }

    crate::elf::free_loaded_segments(&mut segments, &mut segment_count);
    unmap_stack(stack_base, stack_page_count);

    if was_current == page_table {
        vmm::switch_address_space(idle_cr3());
    } else if need_switch_in {
        vmm::switch_address_space(was_current);
    }
    vmm::delete_address_space(page_table);

    let mut table = TABLE.lock();
    let pcb = &mut table.slots[slot];
    pcb.state = ProcessState::Terminated;
    pcb.in_use = false;
    Ok(())
}

/// Run `f` with shared access to the process table, holding
/// [`TABLE`]'s spinlock for the closure's duration. Internal to
/// `crate::sched`, which implements queue manipulation and dispatch over
/// these slots.
pub(crate) fn with_table<R>(f: impl FnOnce(&mut TableView) -> R) -> R {
    let mut guard = TABLE.lock();
    let mut view = TableView { inner: &mut guard };
    f(&mut view)
}

/// A bounds-checked view over the process table handed to `crate::sched`.
pub(crate) struct TableView<'a> {
    inner: &'a mut ProcessTable,
}

impl<'a> TableView<'a> {
    pub fn pcb(&self, slot: u16) -> &Pcb {
        &self.inner.slots[slot as usize]
    }

    pub fn pcb_mut(&mut self, slot: u16) -> &mut Pcb {
        &mut self.inner.slots[slot as usize]
    }

    pub fn current(&self) -> u16 {
        self.inner.current
    }

    pub fn set_current(&mut self, slot: u16) {
        self.inner.current = slot;
    }

    pub fn ready_head(&self) -> Option<u16> {
        self.inner.ready_head
    }

    pub fn ready_tail(&self) -> Option<u16> {
        self.inner.ready_tail
    }

    pub fn set_ready_head(&mut self, v: Option<u16>) {
        self.inner.ready_head = v;
    }

    pub fn set_ready_tail(&mut self, v: Option<u16>) {
        self.inner.ready_tail = v;
    }

    pub fn blocked_head(&self) -> Option<u16> {
        self.inner.blocked_head
    }

    pub fn set_blocked_head(&mut self, v: Option<u16>) {
        self.inner.blocked_head = v;
    }

    pub fn find_by_pid(&self, pid: u32) -> Option<u16> {
        self.inner.find_by_pid(pid).map(|i| i as u16)
    }
}

pub fn pid_of(slot: u16) -> u32 {
    with_table(|t| t.pcb(slot).pid)
}

pub fn state_of(pid: u32) -> Option<ProcessState> {
    with_table(|t| t.find_by_pid(pid).map(|s| t.pcb(s).state))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pid_allocation_is_monotonic_and_skips_zero_on_wrap() {
        NEXT_PID.store(u32::MAX, Ordering::SeqCst);
        let a = allocate_pid();
        assert_eq!(a, u32::MAX);
        let b = allocate_pid();
        assert_ne!(b, 0);
        NEXT_PID.store(1, Ordering::SeqCst);
    }

    #[test]
    fn idle_pcb_has_lowest_priority_and_infinite_quantum() {
        init();
        with_table(|t| {
            let idle = t.pcb(0);
            assert_eq!(idle.pid, 0);
            assert_eq!(idle.quantum_ticks, u64::MAX);
            assert_eq!(idle.base_priority, i32::MIN);
        });
    }

    #[test]
    fn empty_table_has_no_free_name_collisions() {
        let t = ProcessTable::empty();
        assert!(t.find_free_slot().is_some());
        assert!(t.find_by_pid(1).is_none());
    }
}
