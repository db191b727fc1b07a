// Print macros for kernel console output

#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => ($crate::print::_print(format_args!($($arg)*)));
}

#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => ($crate::print!("{}\n", format_args!($($arg)*)));
}

#[doc(hidden)]
pub fn _print(args: core::fmt::Arguments) {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    crate::serial::_print(args);

    #[cfg(all(not(target_arch = "x86_64"), target_os = "none"))]
    let _ = args; // riscv64 console goes through the SBI glue, outside the core

    #[cfg(not(target_os = "none"))]
    {
        extern crate std;
        use std::io::Write;
        let _ = std::io::stdout().write_fmt(args);
    }
}
