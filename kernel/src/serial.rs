//! Early serial console (16550 UART at the legacy COM1 port)

use core::fmt;

use lazy_static::lazy_static;
use spin::Mutex;
use uart_16550::SerialPort;

lazy_static! {
    /// COM1, initialised on first use.
    pub static ref SERIAL1: Mutex<SerialPort> = {
        // SAFETY: 0x3F8 is the standard COM1 I/O port block.
        let mut serial_port = unsafe { SerialPort::new(0x3F8) };
        serial_port.init();
        Mutex::new(serial_port)
    };
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    use fmt::Write;

    let flags = crate::arch::local_irq_save();
    SERIAL1
        .lock()
        .write_fmt(args)
        .expect("serial write never fails");
    crate::arch::local_irq_restore(flags);
}
