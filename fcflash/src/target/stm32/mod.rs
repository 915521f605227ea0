//! STM32 ROM bootloader over a UART.

mod flasher;

pub use flasher::Stm32Flasher;
