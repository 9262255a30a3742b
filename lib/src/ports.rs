//! Legacy I/O port map and polled UART output.
//!
//! These primitives are lock-free; callers serialise (early boot is single
//! threaded, later output goes through the registered klog backend).

pub const COM1_BASE: u16 = 0x3F8;

pub const PIT_CHANNEL0: u16 = 0x40;
pub const PIT_COMMAND: u16 = 0x43;

pub const UART_REG_THR: u16 = 0;
pub const UART_REG_IER: u16 = 1;
pub const UART_REG_FCR: u16 = 2;
pub const UART_REG_LCR: u16 = 3;
pub const UART_REG_MCR: u16 = 4;
pub const UART_REG_LSR: u16 = 5;

pub const UART_LCR_DLAB: u8 = 0x80;
pub const UART_LCR_8N1: u8 = 0x03;
pub const UART_FCR_ENABLE_CLEAR_14: u8 = 0xC7;
pub const UART_MCR_DTR_RTS_OUT2: u8 = 0x0B;
pub const UART_LSR_TX_EMPTY: u8 = 0x20;

pub const PIT_BASE_FREQUENCY_HZ: u32 = 1_193_182;
pub const PIT_COMMAND_CHANNEL0: u8 = 0x00;
pub const PIT_COMMAND_ACCESS_LOHI: u8 = 0x30;
pub const PIT_COMMAND_MODE_SQUARE: u8 = 0x06;

/// Divisor that makes PIT channel 0 fire at `hz`.
pub const fn pit_divisor(hz: u32) -> u16 {
    let hz = if hz == 0 { 1 } else { hz };
    let div = PIT_BASE_FREQUENCY_HZ / hz;
    if div > u16::MAX as u32 {
        u16::MAX
    } else if div == 0 {
        1
    } else {
        div as u16
    }
}

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod io {
    use x86_64::instructions::port::Port;

    use super::*;

    /// Program COM1 for 38400 baud 8N1 with FIFOs on.
    ///
    /// # Safety
    ///
    /// Port I/O on the legacy COM1 range.
    pub unsafe fn serial_init_com1() {
        let base = COM1_BASE;
        unsafe {
            Port::<u8>::new(base + UART_REG_IER).write(0x00);
            Port::<u8>::new(base + UART_REG_LCR).write(UART_LCR_DLAB);
            Port::<u8>::new(base).write(0x03);
            Port::<u8>::new(base + 1).write(0x00);
            Port::<u8>::new(base + UART_REG_LCR).write(UART_LCR_8N1);
            Port::<u8>::new(base + UART_REG_FCR).write(UART_FCR_ENABLE_CLEAR_14);
            Port::<u8>::new(base + UART_REG_MCR).write(UART_MCR_DTR_RTS_OUT2);
        }
    }

    /// Write one byte, polling LSR until the holding register is empty.
    ///
    /// # Safety
    ///
    /// Port I/O. Concurrent writers must be serialised by the caller.
    #[inline(always)]
    pub unsafe fn serial_putc(base: u16, byte: u8) {
        let mut lsr = Port::<u8>::new(base + UART_REG_LSR);
        let mut thr = Port::<u8>::new(base + UART_REG_THR);
        unsafe {
            while (lsr.read() & UART_LSR_TX_EMPTY) == 0 {
                core::hint::spin_loop();
            }
            thr.write(byte);
        }
    }

    /// Write bytes, turning lone `\n` into `\r\n`.
    ///
    /// # Safety
    ///
    /// Same requirements as [`serial_putc`].
    pub unsafe fn serial_write_bytes(base: u16, bytes: &[u8]) {
        for &b in bytes {
            if b == b'\n' {
                unsafe { serial_putc(base, b'\r') };
            }
            unsafe { serial_putc(base, b) };
        }
    }

    /// Start PIT channel 0 as a square wave at `hz`.
    ///
    /// # Safety
    ///
    /// Port I/O on the PIT.
    pub unsafe fn pit_program(hz: u32) {
        let divisor = pit_divisor(hz);
        unsafe {
            Port::<u8>::new(PIT_COMMAND).write(
                PIT_COMMAND_CHANNEL0 | PIT_COMMAND_ACCESS_LOHI | PIT_COMMAND_MODE_SQUARE,
            );
            Port::<u8>::new(PIT_CHANNEL0).write((divisor & 0xFF) as u8);
            Port::<u8>::new(PIT_CHANNEL0).write((divisor >> 8) as u8);
        }
    }
}

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub use io::*;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pit_divisor() {
        assert_eq!(pit_divisor(100), 11931);
        assert_eq!(pit_divisor(0), u16::MAX);
        assert_eq!(pit_divisor(10), u16::MAX);
        assert_eq!(pit_divisor(u32::MAX), 1);
    }
}
