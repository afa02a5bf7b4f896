//! Tiny architecture primitives shared across subsystems: halt, pause, and
//! TSC reads. Kept separate from `idt.rs`/`io.rs` since none of the
//! instructions here touch a descriptor table or an I/O port.

/// Halt the CPU until the next interrupt (`hlt`). A no-op when hosted, since
/// a test process has no business putting the test runner thread to sleep
/// waiting for a hardware interrupt that will never come.
#[inline]
pub fn halt() {
    #[cfg(target_os = "none")]
    x86_64::instructions::hlt();
}

/// Read the timestamp counter (`rdtsc`). Returns 0 when hosted.
#[inline]
pub fn read_tsc() -> u64 {
    #[cfg(target_os = "none")]
    {
        x86_64::instructions::interrupts::without_interrupts(|| unsafe {
            core::arch::x86_64::_rdtsc()
        })
    }
    #[cfg(not(target_os = "none"))]
    {
        0
    }
}
