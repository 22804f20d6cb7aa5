//! Serial port logger.
//!
//! VMX root operation has no console, so log records go straight to a 16550
//! UART. Each line is tagged with the APIC ID of the processor that wrote it,
//! which is what tells the processors apart when several handle exits at once.

use {
    crate::intel::support::{inb, outb},
    core::fmt::{self, Write},
    log::{LevelFilter, Log, Metadata, Record},
    spin::{Mutex, Once},
};

/// UART register offsets
const UART_OFFSET_DATA: u16 = 0x0;
const UART_OFFSET_INTERRUPT_ENABLE: u16 = 0x1;
const UART_OFFSET_FIFO_CONTROL: u16 = 0x2;
const UART_OFFSET_LINE_CONTROL: u16 = 0x3;
const UART_OFFSET_MODEM_CONTROL: u16 = 0x4;
const UART_OFFSET_LINE_STATUS: u16 = 0x5;

/// Line status: transmitter holding register empty.
const LINE_STATUS_THR_EMPTY: u8 = 0x20;

static SERIAL_LOGGER: Once<SerialLogger> = Once::new();

/// Installs the serial logger as the global `log` logger.
///
/// Only the first call programs the UART and registers the logger; later
/// calls just change the maximum level.
pub fn init(port: SerialPort, level: LevelFilter) {
    let logger = SERIAL_LOGGER.call_once(|| SerialLogger::new(port));

    // Another logger may already be registered by the loader. Keep it.
    let _ = log::set_logger(logger);
    log::set_max_level(level);
}

/// Serial ports supported by the logger.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SerialPort {
    /// COM1 (0x3F8)
    COM1 = 0x3F8,
    /// COM2 (0x2F8)
    COM2 = 0x2F8,
}

pub struct SerialLogger {
    port: Mutex<Serial>,
}

impl SerialLogger {
    fn new(port: SerialPort) -> Self {
        let mut serial = Serial { port };
        serial.init();
        Self { port: Mutex::new(serial) }
    }
}

impl Log for SerialLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record<'_>) {
        if self.enabled(record.metadata()) {
            let apic_id = apic_id();
            let mut serial = self.port.lock();
            let _ = format_line(&mut *serial, apic_id, record);
        }
    }

    fn flush(&self) {}
}

/// Writes one log line: `cpu-<apic id> <level>: <message>`.
fn format_line<W: Write>(writer: &mut W, apic_id: u32, record: &Record<'_>) -> fmt::Result {
    writeln!(writer, "cpu-{} {}: {}", apic_id, record.level(), record.args())
}

struct Serial {
    port: SerialPort,
}

impl Serial {
    fn init(&mut self) {
        let base = self.port as u16;

        // Disable interrupts
        outb(base + UART_OFFSET_INTERRUPT_ENABLE, 0x00);
        // Enable DLAB
        outb(base + UART_OFFSET_LINE_CONTROL, 0x80);
        // Divisor = 1 -> 115200 baud
        outb(base + UART_OFFSET_DATA, 0x01);
        outb(base + UART_OFFSET_INTERRUPT_ENABLE, 0x00);
        // 8 bits, no parity, one stop bit
        outb(base + UART_OFFSET_LINE_CONTROL, 0x03);
        // Enable FIFO, clear, 14-byte threshold
        outb(base + UART_OFFSET_FIFO_CONTROL, 0xC7);
        // RTS/DSR set
        outb(base + UART_OFFSET_MODEM_CONTROL, 0x03);
    }

    fn write_byte(&mut self, byte: u8) {
        let base = self.port as u16;
        while inb(base + UART_OFFSET_LINE_STATUS) & LINE_STATUS_THR_EMPTY == 0 {
            core::hint::spin_loop();
        }
        outb(base + UART_OFFSET_DATA, byte);
    }
}

impl Write for Serial {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for b in s.bytes() {
            if b == b'\n' {
                self.write_byte(b'\r');
            }
            self.write_byte(b);
        }
        Ok(())
    }
}

/// Initial APIC ID of the current processor.
fn apic_id() -> u32 {
    x86::cpuid::cpuid!(0x1).ebx >> 24
}
