//! 16550 UART driver and `kprintf`-style formatted console output (C1).
//!
//! Mirrors the register layout and init sequence of
//! `examples/original_source/src/src/syncos/serial.c`, reimplemented as a
//! safe-ish Rust driver instead of pulling in the `uart_16550` crate: the
//! spec calls for hand-rolled DLAB/divisor/FIFO programming, and the teacher
//! crate's `serial.rs` only wraps that crate rather than implementing it.

use core::fmt;

use crate::io::{inb, outb};
use crate::printf::{self, Arg};
use crate::sync::Spinlock;

const DATA_REG: u16 = 0;
const INT_ENABLE_REG: u16 = 1;
const FIFO_CTRL_REG: u16 = 2;
const LINE_CTRL_REG: u16 = 3;
const MODEM_CTRL_REG: u16 = 4;
const LINE_STATUS_REG: u16 = 5;

const LCR_DLAB: u8 = 0x80;
const LCR_8BITS: u8 = 0x03;

const FCR_ENABLE_FIFO: u8 = 0x01;
const FCR_CLEAR_RX: u8 = 0x02;
const FCR_CLEAR_TX: u8 = 0x04;
const FCR_TRIGGER_14: u8 = 0xC0;

const MCR_DTR: u8 = 0x01;
const MCR_RTS: u8 = 0x02;
const MCR_OUT2: u8 = 0x08;

const LSR_TX_HOLDING_EMPTY: u8 = 0x20;
const LSR_DATA_READY: u8 = 0x01;

pub const COM1: u16 = 0x3F8;
const BAUD_115200_DIVISOR: u16 = 1;

/// A single 16550-compatible UART at a fixed I/O base.
pub struct Uart {
    base: u16,
}

impl Uart {
    /// # Safety
    /// `base` must be the I/O port base of a real (or QEMU-emulated) 16550
    /// UART that nothing else is concurrently driving.
    pub const unsafe fn new(base: u16) -> Self {
        Self { base }
    }

    /// Disable interrupts, program the baud divisor, 8N1 framing, FIFOs at a
    /// 14-byte trigger level, and assert DTR/RTS/OUT2.
    pub fn init(&mut self, baud_divisor: u16) {
        unsafe {
            outb(self.base + INT_ENABLE_REG, 0x00);

            outb(self.base + LINE_CTRL_REG, LCR_DLAB);
            outb(self.base + DATA_REG, (baud_divisor & 0xFF) as u8);
            outb(self.base + DATA_REG + 1, (baud_divisor >> 8) as u8);

            outb(self.base + LINE_CTRL_REG, LCR_8BITS);

            outb(
                self.base + FIFO_CTRL_REG,
                FCR_ENABLE_FIFO | FCR_CLEAR_RX | FCR_CLEAR_TX | FCR_TRIGGER_14,
            );

            outb(self.base + MODEM_CTRL_REG, MCR_DTR | MCR_RTS | MCR_OUT2);
        }
    }

    fn transmit_empty(&self) -> bool {
        unsafe { inb(self.base + LINE_STATUS_REG) & LSR_TX_HOLDING_EMPTY != 0 }
    }

    fn data_ready(&self) -> bool {
        unsafe { inb(self.base + LINE_STATUS_REG) & LSR_DATA_READY != 0 }
    }

    /// Write one byte, translating `\n` to CR+LF for terminal compatibility.
    pub fn write_byte(&mut self, byte: u8) {
        while !self.transmit_empty() {
            core::hint::spin_loop();
        }
        if byte == b'\n' {
            unsafe { outb(self.base + DATA_REG, b'\r') };
            while !self.transmit_empty() {
                core::hint::spin_loop();
            }
        }
        unsafe { outb(self.base + DATA_REG, byte) };
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.write_byte(b);
        }
    }

    /// Blocking read of a single byte.
    pub fn read_byte(&mut self) -> u8 {
        while !self.data_ready() {
            core::hint::spin_loop();
        }
        unsafe { inb(self.base + DATA_REG) }
    }
}

impl fmt::Write for Uart {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.write_bytes(s.as_bytes());
        Ok(())
    }
}

static COM1_PORT: Spinlock<Option<Uart>> = Spinlock::new("serial::com1", None);

/// Initialise COM1 at 115200 8N1 and install it as the console's backing
/// port. Idempotent: calling twice just reprograms the same UART.
pub fn init_stdio() {
    let mut uart = unsafe { Uart::new(COM1) };
    uart.init(BAUD_115200_DIVISOR);
    *COM1_PORT.lock() = Some(uart);
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    use core::fmt::Write;
    let mut guard = COM1_PORT.lock();
    if let Some(uart) = guard.as_mut() {
        let _ = uart.write_fmt(args);
    }
}

/// `vsnprintf`-style entry point: format `fmt` against `args` into a bounded
/// stack buffer, then flush the buffer through the console UART. Returns the
/// logical (possibly-truncated) formatted length.
pub fn kprintf(fmt: &str, args: &[Arg]) -> usize {
    let mut buf = [0u8; 1024];
    let len = printf::format(&mut buf, fmt, args);
    let emitted = len.min(buf.len());
    let mut guard = COM1_PORT.lock();
    if let Some(uart) = guard.as_mut() {
        uart.write_bytes(&buf[..emitted]);
    }
    len
}

/// `log` facade backend that writes formatted records through the serial
/// console (spec.md's ambient logging requirement, SPEC_FULL.md §0).
/// Installed once from `boot::kernel_main` via [`init_logger`], before any
/// subsystem that might call `log::info!`/`log::warn!`/etc. runs. Raw
/// `println!`/`serial_println!` remain available for sites where logging
/// itself cannot yet be assumed to work (very early boot, panic, double
/// fault).
pub struct KernelLogger;

static LOGGER: KernelLogger = KernelLogger;

impl log::Log for KernelLogger {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn log(&self, record: &log::Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        crate::println!(
            "[{:>5} {}] {}",
            record.level(),
            record.target(),
            record.args()
        );
    }

    fn flush(&self) {}
}

/// Install [`KernelLogger`] as the `log` facade's global logger. Idempotent:
/// a second call is harmless (`log::set_logger` failure is swallowed, since
/// by then a logger — this one — is already installed).
pub fn init_logger(level: log::LevelFilter) {
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(level);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uart_register_offsets_are_distinct() {
        let offsets = [
            DATA_REG,
            INT_ENABLE_REG,
            FIFO_CTRL_REG,
            LINE_CTRL_REG,
            MODEM_CTRL_REG,
            LINE_STATUS_REG,
        ];
        for i in 0..offsets.len() {
            for j in (i + 1)..offsets.len() {
                assert_ne!(offsets[i], offsets[j]);
            }
        }
    }

    #[test]
    fn init_and_write_do_not_panic_on_stubbed_ports() {
        let mut uart = unsafe { Uart::new(COM1) };
        uart.init(BAUD_115200_DIVISOR);
        uart.write_bytes(b"hello\n");
    }
}
