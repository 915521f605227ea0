//! Error types for fcflash.

use std::io;
use thiserror::Error;

/// Result type for fcflash operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for fcflash operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (serial port, file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// USB control transfer error.
    #[cfg(feature = "usb")]
    #[error("USB transfer error: {0}")]
    Usb(#[from] nusb::transfer::TransferError),

    /// The firmware image failed to parse or carries no usable data.
    #[error("Corrupt image: {0}")]
    CorruptImage(String),

    /// Chip signature or memory descriptor not recognised.
    #[error("Unsupported chip: {0}")]
    UnsupportedChip(String),

    /// Custom defaults payload does not fit the reserved area.
    #[error("Custom defaults area too small ({available} bytes), {needed} bytes needed")]
    AreaTooSmall {
        /// Size of the reserved area in bytes.
        available: usize,
        /// Bytes required to hold the payload.
        needed: usize,
    },

    /// The reserved custom defaults area already holds image data.
    #[error("Custom defaults area at {address:#010x} is not free")]
    AreaNotFree {
        /// Address where the collision was found.
        address: u32,
    },

    /// Bootloader answered NACK.
    #[error("Device rejected {context} (NACK)")]
    Nack {
        /// Step that was rejected.
        context: &'static str,
    },

    /// Bootloader answered with an unexpected byte.
    #[error("Unexpected response to {context}: expected {expected:#04x}, got {actual:#04x}")]
    UnexpectedResponse {
        /// Step that produced the response.
        context: &'static str,
        /// Expected byte.
        expected: u8,
        /// Received byte.
        actual: u8,
    },

    /// DFU device reported a state other than the expected one.
    #[error("Unexpected DFU state during {context}: expected {expected}, got {actual} (status {status})")]
    UnexpectedState {
        /// Step that produced the state.
        context: &'static str,
        /// Expected state name.
        expected: &'static str,
        /// Reported state name.
        actual: &'static str,
        /// Reported status name.
        status: &'static str,
    },

    /// Handshake failed.
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    /// Communication timeout.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Image does not fit the target flash.
    #[error("Image too large: {image} bytes, flash holds {flash} bytes")]
    ImageTooLarge {
        /// Image payload size.
        image: usize,
        /// Flash size of the target.
        flash: usize,
    },

    /// Image block not covered by the device memory layout.
    #[error("Address out of range: {length} bytes at {address:#010x}")]
    AddressOutOfRange {
        /// Block start address.
        address: u32,
        /// Block length in bytes.
        length: usize,
    },

    /// Readback differs from the written image.
    #[error("Verification failed at {address:#010x}: {detail}")]
    VerifyMismatch {
        /// First differing address.
        address: u32,
        /// Human-readable description of the difference.
        detail: String,
    },

    /// Read protection was found and removed; the board must be power-cycled.
    #[error("Read protection detected and removed, power-cycle the device and flash again")]
    ReadProtectionDetected,

    /// The read-unprotect sequence did not complete.
    #[error("Failed to remove read protection: {0}")]
    UnprotectFailed(String),

    /// Operation cancelled by the embedding application.
    #[error("Operation cancelled")]
    Cancelled,

    /// Device not found.
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Protocol error.
    #[error("Protocol error: {0}")]
    Protocol(String),
}
