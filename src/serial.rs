//! Kernel log output.
//!
//! `log_info!`, `log_warn!` and `log_error!` format one line and hand it to
//! the installed [`LogSink`]. With no sink installed (hosted builds) records
//! are dropped. On bare metal [`init`] routes them to COM1.

use alloc::string::String;
use core::fmt::{self, Write};
use core::sync::atomic::{AtomicU8, Ordering};
use spin::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    Error = 1,
    Warn = 2,
    Info = 3,
}

impl LogLevel {
    pub fn tag(self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
        }
    }
}

/// Destination for formatted log lines.
pub trait LogSink: Send + Sync {
    fn write_line(&self, level: LogLevel, line: &str);
}

static SINK: Mutex<Option<&'static dyn LogSink>> = Mutex::new(None);
static MAX_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);

pub fn set_sink(sink: &'static dyn LogSink) {
    *SINK.lock() = Some(sink);
}

pub fn clear_sink() {
    *SINK.lock() = None;
}

/// Records above `level` are discarded.
pub fn set_max_level(level: LogLevel) {
    MAX_LEVEL.store(level as u8, Ordering::Relaxed);
}

pub fn enabled(level: LogLevel) -> bool {
    level as u8 <= MAX_LEVEL.load(Ordering::Relaxed)
}

#[doc(hidden)]
pub fn _log(level: LogLevel, args: fmt::Arguments) {
    if !enabled(level) {
        return;
    }
    let sink = *SINK.lock();
    if let Some(sink) = sink {
        let mut line = String::new();
        if line.write_fmt(args).is_ok() {
            sink.write_line(level, &line);
        }
    }
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        $crate::serial::_log($crate::serial::LogLevel::Info, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        $crate::serial::_log($crate::serial::LogLevel::Warn, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        $crate::serial::_log($crate::serial::LogLevel::Error, format_args!($($arg)*))
    };
}

#[cfg(target_arch = "x86_64")]
pub use uart::{init, SerialPort, SERIAL1};

#[cfg(target_arch = "x86_64")]
mod uart {
    use core::fmt::Write;
    use lazy_static::lazy_static;
    use spin::Mutex;
    use x86_64::instructions::port::Port;

    use super::{LogLevel, LogSink};

    const COM1: u16 = 0x3F8;
    const LINE_STATUS_TX_EMPTY: u8 = 0x20;

    /// 16550 UART.
    pub struct SerialPort {
        data: Port<u8>,
        int_en: Port<u8>,
        fifo_ctrl: Port<u8>,
        line_ctrl: Port<u8>,
        modem_ctrl: Port<u8>,
        line_sts: Port<u8>,
    }

    impl SerialPort {
        /// # Safety
        /// `base` must be the I/O base of a 16550-compatible port.
        pub const unsafe fn new(base: u16) -> SerialPort {
            SerialPort {
                data: Port::new(base),
                int_en: Port::new(base + 1),
                fifo_ctrl: Port::new(base + 2),
                line_ctrl: Port::new(base + 3),
                modem_ctrl: Port::new(base + 4),
                line_sts: Port::new(base + 5),
            }
        }

        /// 38400 baud, 8N1, FIFOs on, receive interrupts on.
        pub fn init(&mut self) {
            unsafe {
                self.int_en.write(0x00);
                self.line_ctrl.write(0x80);
                self.data.write(0x03);
                self.int_en.write(0x00);
                self.line_ctrl.write(0x03);
                self.fifo_ctrl.write(0xC7);
                self.modem_ctrl.write(0x0B);
                self.int_en.write(0x01);
            }
        }

        pub fn send(&mut self, byte: u8) {
            unsafe {
                while self.line_sts.read() & LINE_STATUS_TX_EMPTY == 0 {}
                self.data.write(byte);
            }
        }
    }

    impl Write for SerialPort {
        fn write_str(&mut self, s: &str) -> core::fmt::Result {
            s.bytes().for_each(|b| self.send(b));
            Ok(())
        }
    }

    lazy_static! {
        pub static ref SERIAL1: Mutex<SerialPort> = {
            let mut port = unsafe { SerialPort::new(COM1) };
            port.init();
            Mutex::new(port)
        };
    }

    struct Com1;

    impl LogSink for Com1 {
        fn write_line(&self, level: LogLevel, line: &str) {
            let _ = writeln!(SERIAL1.lock(), "[{}] {}", level.tag(), line);
        }
    }

    static COM1_SINK: Com1 = Com1;

    /// Brings up COM1 and sends every log record there. Bare metal only.
    pub fn init() {
        lazy_static::initialize(&SERIAL1);
        super::set_sink(&COM1_SINK);
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use alloc::string::ToString;
    use alloc::vec::Vec;

    /// Collects every record; shared by all tests in the process.
    pub struct Capture {
        pub lines: Mutex<Vec<(LogLevel, String)>>,
    }

    impl LogSink for Capture {
        fn write_line(&self, level: LogLevel, line: &str) {
            self.lines.lock().push((level, line.to_string()));
        }
    }

    pub static CAPTURE: Capture = Capture {
        lines: Mutex::new(Vec::new()),
    };

    pub fn install() {
        set_sink(&CAPTURE);
    }

    pub fn contains(needle: &str) -> bool {
        CAPTURE.lines.lock().iter().any(|(_, l)| l.contains(needle))
    }
}
