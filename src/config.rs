//! Compile-time kernel tunables.
//!
//! Collected here instead of scattered as magic numbers through the
//! subsystems that use them, mirroring how the teacher collects comparable
//! constants at the top of `mm/frame_allocator.rs` and `sched/scheduler.rs`.

/// Size of a physical frame / virtual page on x86_64.
pub const FRAME_SIZE: usize = 4096;

/// Upper bound on the number of physical frames the bitmap PMM can track.
/// `STATIC_BITMAP_SIZE * 8` frames, i.e. 256 MiB worth of 4 KiB pages, as in
/// `examples/original_source/pmm.c`.
pub const PMM_MAX_TRACKED_FRAMES: usize = 8192 * 8;

/// Number of low frames unconditionally reserved at PMM init, regardless of
/// what the memory map says (spec.md §4.7's "belt-and-braces guard").
pub const PMM_LOW_MEMORY_GUARD_FRAMES: usize = 256;

/// Master/slave PIC vector offsets after remap (spec.md §4.4 default).
pub const PIC1_VECTOR_OFFSET: u8 = 0x20;
pub const PIC2_VECTOR_OFFSET: u8 = 0x28;

/// Callback slots per IRQ line (spec.md §4.4: "up to N (>= 8) slots").
pub const IRQ_SLOTS_PER_LINE: usize = 8;

/// Number of IRQ lines behind the cascaded 8259 pair.
pub const IRQ_LINE_COUNT: usize = 16;

/// Timer callback slot table size.
pub const TIMER_CALLBACK_SLOTS: usize = 16;

/// Default PIT frequency in Hz.
pub const DEFAULT_PIT_HZ: u32 = 1000;

/// PIT input clock frequency.
pub const PIT_INPUT_HZ: u32 = 1_193_182;

/// Clamp bounds for the PIT's programmable frequency (spec.md §4.5/§8).
pub const PIT_MIN_HZ: u32 = 19;
pub const PIT_MAX_HZ: u32 = PIT_INPUT_HZ;

/// Conservative TSC rate (Hz) assumed for `sleep_ms` before the PIT is armed.
pub const FALLBACK_TSC_HZ: u64 = 2_000_000_000;

/// Fixed PCB table size.
pub const MAX_PROCESSES: usize = 256;

/// Default preemption quantum, in timer ticks (spec.md §4.10).
pub const DEFAULT_QUANTUM_TICKS: u64 = 20;

/// Default user stack size for a newly created process.
pub const DEFAULT_STACK_SIZE: usize = 2 * 1024 * 1024;

/// Fixed high virtual address below which the default user stack is placed.
/// Chosen well below the canonical-hole boundary used by the default user
/// memory area (`vmm::USER_REGION_BASE`/`USER_REGION_END`).
pub const DEFAULT_STACK_TOP: u64 = 0x0000_7fff_ffff_f000;

/// Spinlock contention/hold tracking table size.
pub const SPINLOCK_TRACKING_SLOTS: usize = 64;

/// Size of the kernel heap reserved at boot.
pub const KERNEL_HEAP_SIZE: usize = 8 * 1024 * 1024;

/// Base virtual address of the kernel heap region (inside the HHDM-adjacent
/// kernel reserved area, chosen to avoid colliding with the HHDM window
/// itself or the kernel image's own higher-half load address).
pub const KERNEL_HEAP_BASE: u64 = 0xffff_9000_0000_0000;
