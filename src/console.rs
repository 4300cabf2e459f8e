//! Console output for the Kestrel kernel
//!
//! Provides basic text output for kernel status and lifecycle messages.
//! In a freestanding build this writes to a UART; under test the output is
//! captured in a bounded buffer so tests can assert on it.

use core::fmt::{self, Write};
use spin::Mutex;

// QEMU virt machine UART base
#[cfg(not(test))]
const UART_BASE: usize = 0x0900_0000;

/// Console writer interface
pub struct Console {
    #[cfg(test)]
    buffer: heapless::String<4096>,
}

impl Console {
    pub const fn new() -> Self {
        Console {
            #[cfg(test)]
            buffer: heapless::String::new(),
        }
    }

    /// Write a byte to the console
    pub fn write_byte(&mut self, byte: u8) {
        #[cfg(test)]
        {
            if byte.is_ascii() {
                if self.buffer.len() == self.buffer.capacity() {
                    self.buffer.clear();
                }
                let _ = self.buffer.push(byte as char);
            }
        }

        #[cfg(not(test))]
        unsafe {
            (UART_BASE as *mut u8).write_volatile(byte);
        }
    }

    pub fn write_str(&mut self, s: &str) {
        for byte in s.bytes() {
            if byte == b'\n' {
                self.write_byte(b'\r');
            }
            self.write_byte(byte);
        }
    }

    /// Contents written so far (test builds only).
    #[cfg(test)]
    pub fn captured(&self) -> &str {
        self.buffer.as_str()
    }

    #[cfg(test)]
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

impl fmt::Write for Console {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        Console::write_str(self, s);
        Ok(())
    }
}

static CONSOLE: Mutex<Console> = Mutex::new(Console::new());

/// Write formatted output to the global console.
pub fn _print(args: fmt::Arguments) {
    let mut console = CONSOLE.lock();
    let _ = console.write_fmt(args);
}

/// Run a closure against the captured console output (test builds only).
#[cfg(test)]
pub fn with_captured<R>(f: impl FnOnce(&str) -> R) -> R {
    let console = CONSOLE.lock();
    f(console.captured())
}

#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => ($crate::console::_print(format_args!($($arg)*)));
}

#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => ($crate::print!("{}\n", format_args!($($arg)*)));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_console_captures_output() {
        let mut console = Console::new();
        console.write_str("hello");
        assert_eq!(console.captured(), "hello");
    }

    #[test]
    fn test_newline_becomes_crlf() {
        let mut console = Console::new();
        console.write_str("a\nb");
        assert_eq!(console.captured(), "a\r\nb");
    }
}
