//! Wire formats spoken to the device.

pub mod dfu;
pub mod msp;
pub mod stm32;

pub use dfu::{ChipLayout, MemoryRegion, Sector, State as DfuState, Status as DfuStatus, StatusReport};
pub use stm32::{BootloaderInfo, ChipInfo, Command, EraseMode, xor_checksum};
