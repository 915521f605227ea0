//! MSP v1 request frames, used only to reboot running firmware into the
//! ROM bootloader before a serial flash.
//!
//! ```text
//! +----+----+----+------+-----+-----------+-----+
//! | $  | M  | <  | size | cmd |  payload  | XOR |
//! +----+----+----+------+-----+-----------+-----+
//! ```
//!
//! The checksum covers size, cmd and payload.

/// `MSP_SET_REBOOT`.
pub const MSP_SET_REBOOT: u8 = 68;

/// Reboot targets understood by `MSP_SET_REBOOT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RebootMode {
    /// Restart the firmware.
    Firmware = 0,
    /// Jump to the ROM bootloader.
    BootloaderRom = 1,
    /// Enter the MSC mode.
    Msc = 2,
    /// Enter MSC mode with UTC time.
    MscUtc = 3,
    /// Jump to the flash-resident bootloader.
    BootloaderFlash = 4,
}

/// Build a request frame.
#[allow(clippy::cast_possible_truncation)]
pub fn request(command: u8, payload: &[u8]) -> Vec<u8> {
    debug_assert!(payload.len() <= usize::from(u8::MAX));

    let size = payload.len() as u8;
    let mut frame = Vec::with_capacity(payload.len() + 6);
    frame.extend_from_slice(b"$M<");
    frame.push(size);
    frame.push(command);
    frame.extend_from_slice(payload);

    let checksum = frame[3..].iter().fold(0u8, |acc, b| acc ^ b);
    frame.push(checksum);
    frame
}

/// Reboot request.
pub fn reboot(mode: RebootMode) -> Vec<u8> {
    request(MSP_SET_REBOOT, &[mode as u8])
}
