//! Serial port abstraction.
//!
//! The STM32 bootloader driver talks to a [`Port`] rather than a concrete
//! serial device, so the protocol logic can be driven by a scripted mock in
//! tests and by [`native::NativePort`] in production.
//!
//! ```text
//! +------------------+
//! |  Stm32Flasher<P> |
//! +--------+---------+
//!          |
//!          v
//! +--------+---------+        +------------------+
//! |    Port trait    | <----- |  MockSerial      |  (tests)
//! +--------+---------+        +------------------+
//!          |
//!          v
//! +--------+---------+
//! |    NativePort    |
//! |   (serialport)   |
//! +------------------+
//! ```
//!
//! The ROM bootloader requires 8 data bits, even parity and one stop bit;
//! the MSP reboot request is sent with no parity.

#[cfg(feature = "native")]
pub mod native;

use std::io::{Read, Write};
use std::time::Duration;

use crate::error::Result;

/// Default read timeout for a single byte.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(1000);

/// Serial port configuration.
#[derive(Debug, Clone)]
pub struct SerialConfig {
    /// Port name/path (e.g., "/dev/ttyACM0", "COM3").
    pub port_name: String,
    /// Baud rate.
    pub baud_rate: u32,
    /// Read/write timeout.
    pub timeout: Duration,
    /// Parity.
    pub parity: Parity,
    /// Stop bits.
    pub stop_bits: StopBits,
}

impl SerialConfig {
    /// Plain 8N1 configuration, as used for MSP traffic.
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            timeout: DEFAULT_TIMEOUT,
            parity: Parity::None,
            stop_bits: StopBits::One,
        }
    }

    /// 8E1 configuration required by the STM32 ROM bootloader.
    pub fn bootloader(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            parity: Parity::Even,
            ..Self::new(port_name, baud_rate)
        }
    }

    /// Set the timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Parity checking mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Parity {
    /// No parity.
    #[default]
    None,
    /// Odd parity.
    Odd,
    /// Even parity.
    Even,
}

/// Number of stop bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StopBits {
    /// 1 stop bit.
    #[default]
    One,
    /// 2 stop bits.
    Two,
}

/// Byte stream to a bootloader.
pub trait Port: Read + Write + Send {
    /// Set the read/write timeout.
    fn set_timeout(&mut self, timeout: Duration) -> Result<()>;

    /// Get the current timeout.
    fn timeout(&self) -> Duration;

    /// Get the current baud rate.
    fn baud_rate(&self) -> u32;

    /// Drop any pending input and output.
    fn clear_buffers(&mut self) -> Result<()>;

    /// Get the port name/path.
    fn name(&self) -> &str;

    /// Close the port and release resources.
    ///
    /// Closing twice is a no-op.
    fn close(&mut self) -> Result<()>;

    /// Write all bytes, blocking until complete.
    fn write_all_bytes(&mut self, buf: &[u8]) -> Result<()> {
        std::io::Write::write_all(self, buf)?;
        std::io::Write::flush(self)?;
        Ok(())
    }
}

#[cfg(feature = "native")]
pub use native::NativePort;
