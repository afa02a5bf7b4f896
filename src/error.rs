//! Kernel-wide error types.
//!
//! Every fallible subsystem operation that is not already a `bool`/`Option`
//! per the interface it implements returns a `Result<T, KernelError>` (or a
//! subsystem-local error enum with a `From` conversion into `KernelError`).

use core::fmt;

/// Top-level kernel error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum KernelError {
    /// The PMM could not satisfy a frame request.
    OutOfPhysicalMemory { requested_frames: usize },
    /// A virtual or physical address was misaligned or out of range.
    InvalidAddress { addr: u64 },
    /// A translation or unmap target had no mapping.
    NotMapped { addr: u64 },
    /// ELF header, class, endianness, machine, type, or bounds check failed.
    InvalidElf(ElfError),
    /// A fixed-size slot table (PCB, IRQ handlers, timer callbacks) was full.
    QueueFull { resource: &'static str },
    /// A hardware descriptor table failed to load or re-verify.
    HardwareFault { what: &'static str },
    /// A CPU exception with no registered handler reached the default path.
    UnhandledException { vector: u8 },
    /// `handle_page_fault` declined to resolve a fault.
    UnhandledPageFault { addr: u64 },
    /// A named resource was not found.
    NotFound { resource: &'static str },
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfPhysicalMemory { requested_frames } => {
                write!(f, "out of physical memory: requested {requested_frames} frames")
            }
            Self::InvalidAddress { addr } => write!(f, "invalid address: {addr:#x}"),
            Self::NotMapped { addr } => write!(f, "address not mapped: {addr:#x}"),
            Self::InvalidElf(e) => write!(f, "invalid ELF image: {e}"),
            Self::QueueFull { resource } => write!(f, "{resource} table full"),
            Self::HardwareFault { what } => write!(f, "hardware fault: {what}"),
            Self::UnhandledException { vector } => {
                write!(f, "unhandled exception, vector {vector}")
            }
            Self::UnhandledPageFault { addr } => write!(f, "unhandled page fault at {addr:#x}"),
            Self::NotFound { resource } => write!(f, "{resource} not found"),
        }
    }
}

/// Reasons an ELF64 image was rejected by the loader (§4.9).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElfError {
    BadMagic,
    Not64Bit,
    NotLittleEndian,
    UnsupportedVersion,
    WrongMachine,
    UnsupportedType,
    ZeroEntryPoint,
    NoProgramHeaders,
    HeaderOutOfBounds,
    SegmentOutOfBounds,
}

impl fmt::Display for ElfError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::BadMagic => "bad magic number",
            Self::Not64Bit => "not a 64-bit object",
            Self::NotLittleEndian => "not little-endian",
            Self::UnsupportedVersion => "unsupported ELF version",
            Self::WrongMachine => "not an x86_64 image",
            Self::UnsupportedType => "not ET_EXEC or ET_DYN",
            Self::ZeroEntryPoint => "entry point is zero",
            Self::NoProgramHeaders => "no program headers",
            Self::HeaderOutOfBounds => "program/section header range exceeds buffer",
            Self::SegmentOutOfBounds => "PT_LOAD segment range exceeds buffer",
        };
        f.write_str(msg)
    }
}

impl From<ElfError> for KernelError {
    fn from(e: ElfError) -> Self {
        Self::InvalidElf(e)
    }
}

pub type KernelResult<T> = Result<T, KernelError>;
