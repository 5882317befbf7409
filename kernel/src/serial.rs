//! Early serial console
//!
//! The first output path available during bring-up, before the logger is
//! installed. x86_64 uses the COM1 16550 UART; aarch64 the QEMU-virt PL011;
//! riscv64 a 16550-compatible MMIO UART. On the host target (unit tests)
//! output is discarded.

use core::fmt;

use spin::Mutex;

/// Generic serial port wrapper over the per-architecture UART.
pub struct SerialPort {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    inner: uart_16550::SerialPort,
    #[cfg(target_arch = "aarch64")]
    inner: Pl011Uart,
    #[cfg(target_arch = "riscv64")]
    inner: MmioUart16550,
}

impl SerialPort {
    /// COM1 I/O port base on x86.
    #[cfg(target_arch = "x86_64")]
    const COM1: u16 = 0x3F8;

    fn new() -> Self {
        #[cfg(all(target_arch = "x86_64", target_os = "none"))]
        {
            // SAFETY: COM1 is the standard ISA serial port; probing it has
            // no side effects beyond the UART itself.
            let mut port = unsafe { uart_16550::SerialPort::new(Self::COM1) };
            port.init();
            Self { inner: port }
        }
        #[cfg(target_arch = "aarch64")]
        {
            Self {
                inner: Pl011Uart::new(0x0900_0000),
            }
        }
        #[cfg(target_arch = "riscv64")]
        {
            Self {
                inner: MmioUart16550::new(0x1000_0000),
            }
        }
        #[cfg(not(any(
            all(target_arch = "x86_64", target_os = "none"),
            target_arch = "aarch64",
            target_arch = "riscv64"
        )))]
        {
            Self {}
        }
    }
}

impl fmt::Write for SerialPort {
    #[allow(unused_variables)]
    fn write_str(&mut self, s: &str) -> fmt::Result {
        #[cfg(any(
            all(target_arch = "x86_64", target_os = "none"),
            target_arch = "aarch64",
            target_arch = "riscv64"
        ))]
        {
            self.inner.write_str(s)?;
        }
        Ok(())
    }
}

/// PL011 UART at the QEMU-virt address, transmit-only.
#[cfg(target_arch = "aarch64")]
pub struct Pl011Uart {
    base: usize,
}

#[cfg(target_arch = "aarch64")]
impl Pl011Uart {
    const UARTDR: usize = 0x000;
    const UARTFR: usize = 0x018;
    const FR_TXFF: u32 = 1 << 5;

    pub const fn new(base: usize) -> Self {
        Self { base }
    }
}

#[cfg(target_arch = "aarch64")]
impl fmt::Write for Pl011Uart {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            // SAFETY: the PL011 data/flag registers are device memory at a
            // fixed platform address; volatile access only.
            unsafe {
                let fr = (self.base + Self::UARTFR) as *const u32;
                while core::ptr::read_volatile(fr) & Self::FR_TXFF != 0 {
                    core::hint::spin_loop();
                }
                core::ptr::write_volatile((self.base + Self::UARTDR) as *mut u32, byte as u32);
            }
        }
        Ok(())
    }
}

/// 16550-compatible MMIO UART (QEMU-virt riscv64), transmit-only.
#[cfg(target_arch = "riscv64")]
pub struct MmioUart16550 {
    base: usize,
}

#[cfg(target_arch = "riscv64")]
impl MmioUart16550 {
    const THR: usize = 0x00;
    const LSR: usize = 0x05;
    const LSR_THRE: u8 = 1 << 5;

    pub const fn new(base: usize) -> Self {
        Self { base }
    }
}

#[cfg(target_arch = "riscv64")]
impl fmt::Write for MmioUart16550 {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            // SAFETY: fixed platform MMIO registers, volatile access only.
            unsafe {
                let lsr = (self.base + Self::LSR) as *const u8;
                while core::ptr::read_volatile(lsr) & Self::LSR_THRE == 0 {
                    core::hint::spin_loop();
                }
                core::ptr::write_volatile((self.base + Self::THR) as *mut u8, byte);
            }
        }
        Ok(())
    }
}

lazy_static::lazy_static! {
    /// Global serial console, shared by the print macros and the logger.
    pub static ref CONSOLE: Mutex<SerialPort> = Mutex::new(SerialPort::new());
}

/// Write formatted output to the serial console.
///
/// Used by the `kprint!`/`kprintln!` macros; not intended to be called
/// directly.
#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    use fmt::Write;
    let _ = CONSOLE.lock().write_fmt(args);
}
