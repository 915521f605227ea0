//! STM32 USART bootloader (AN3155) command frames.
//!
//! ## Command Format
//!
//! Every command is sent as the opcode followed by its complement. Multi-byte
//! arguments are followed by an XOR checksum over the argument bytes.
//!
//! ```text
//! +------+-------+         +-----+-----+-----+-----+-----+
//! | Cmd  | ~Cmd  |  ACK    | A31 | A23 | A15 | A7  | XOR |  ACK
//! +------+-------+  <---   +-----+-----+-----+-----+-----+  <---
//!
//! +-----+--------------------+-----+
//! | N-1 |   data (N bytes)   | XOR |  ACK       (write memory payload)
//! +-----+--------------------+-----+  <---
//! ```

use byteorder::{BigEndian, WriteBytesExt};

/// Positive acknowledge.
pub const ACK: u8 = 0x79;

/// Negative acknowledge.
pub const NACK: u8 = 0x1F;

/// Autobaud synchronisation byte.
pub const SYNC: u8 = 0x7F;

/// Base of the internal flash; "go" always jumps here.
pub const FLASH_BASE: u32 = 0x0800_0000;

/// Largest window for a single read or write command.
pub const MAX_TRANSFER: usize = 256;

/// Bootloader opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    /// Bootloader version and supported commands.
    Get = 0x00,
    /// Bootloader version and read protection status.
    GetVersion = 0x01,
    /// Chip product ID.
    GetId = 0x02,
    /// Read up to 256 bytes.
    ReadMemory = 0x11,
    /// Jump to application code.
    Go = 0x21,
    /// Write up to 256 bytes.
    WriteMemory = 0x31,
    /// Legacy erase with one-byte page numbers.
    Erase = 0x43,
    /// Extended erase with two-byte page numbers.
    ExtendedErase = 0x44,
}

impl Command {
    /// Opcode followed by its complement.
    pub fn frame(self) -> [u8; 2] {
        let code = self as u8;
        [code, !code]
    }

    /// Human-readable name for logs and errors.
    pub fn name(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::GetVersion => "GET_VERSION",
            Self::GetId => "GET_ID",
            Self::ReadMemory => "READ_MEMORY",
            Self::Go => "GO",
            Self::WriteMemory => "WRITE_MEMORY",
            Self::Erase => "ERASE",
            Self::ExtendedErase => "EXTENDED_ERASE",
        }
    }
}

/// XOR of all bytes.
pub fn xor_checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0, |acc, b| acc ^ b)
}

/// Big-endian address followed by its XOR checksum.
pub fn address_frame(address: u32) -> [u8; 5] {
    let [a, b, c, d] = address.to_be_bytes();
    [a, b, c, d, a ^ b ^ c ^ d]
}

/// Write memory payload: `[N-1, data.., XOR(N-1, data..)]`.
///
/// `data` must hold between 1 and 256 bytes.
#[allow(clippy::cast_possible_truncation)]
pub fn write_payload(data: &[u8]) -> Vec<u8> {
    debug_assert!(!data.is_empty() && data.len() <= MAX_TRANSFER);

    let count = (data.len() - 1) as u8;
    let mut frame = Vec::with_capacity(data.len() + 2);
    frame.push(count);
    frame.extend_from_slice(data);
    frame.push(count ^ xor_checksum(data));
    frame
}

/// Read memory length frame: `[N-1, !(N-1)]`.
#[allow(clippy::cast_possible_truncation)]
pub fn read_length_frame(length: usize) -> [u8; 2] {
    debug_assert!(length > 0 && length <= MAX_TRANSFER);

    let count = (length - 1) as u8;
    [count, !count]
}

/// Erase command variant, fixed for the session by the GET reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EraseMode {
    /// `0x43`, one-byte page numbers.
    Legacy,
    /// `0x44`, two-byte page numbers.
    Extended,
}

impl EraseMode {
    /// Command used for this variant.
    pub fn command(self) -> Command {
        match self {
            Self::Legacy => Command::Erase,
            Self::Extended => Command::ExtendedErase,
        }
    }

    /// "Erase everything" argument.
    pub fn mass_erase_frame(self) -> Vec<u8> {
        match self {
            Self::Legacy => vec![0xFF, 0x00],
            Self::Extended => vec![0xFF, 0xFF, 0x00],
        }
    }

    /// Argument erasing pages `0..count`.
    ///
    /// Legacy mode: `[N-1, p0, p1, .., XOR]`; extended mode:
    /// `[(N-1) BE16, p0 BE16, .., XOR]`.
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    #[allow(clippy::cast_possible_truncation)]
    pub fn pages_frame(self, count: u16) -> Vec<u8> {
        debug_assert!(count > 0);
        let last = count - 1;

        let mut frame = Vec::new();
        match self {
            Self::Legacy => {
                frame.push(last as u8);
                for page in 0..count {
                    frame.push(page as u8);
                }
            },
            Self::Extended => {
                frame.write_u16::<BigEndian>(last).unwrap();
                for page in 0..count {
                    frame.write_u16::<BigEndian>(page).unwrap();
                }
            },
        }
        frame.push(xor_checksum(&frame));
        frame
    }

    /// Largest page count a single command can express. A legacy count
    /// byte of 0xFF means global erase, so 256 pages do not fit.
    pub fn max_pages(self) -> usize {
        match self {
            Self::Legacy => 255,
            Self::Extended => 0xFFF0,
        }
    }
}

/// Decoded GET reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootloaderInfo {
    /// BCD protocol version, e.g. `0x31` for 3.1.
    pub version: u8,
    /// Supported opcodes.
    pub commands: Vec<u8>,
}

impl BootloaderInfo {
    /// Parse the bytes following the count byte (version, commands), with
    /// the trailing ACK already stripped.
    pub fn from_reply(reply: &[u8]) -> Option<Self> {
        let (&version, commands) = reply.split_first()?;
        Some(Self {
            version,
            commands: commands.to_vec(),
        })
    }

    /// Version formatted as `major.minor`.
    pub fn version_string(&self) -> String {
        format!("{}.{}", self.version >> 4, self.version & 0x0F)
    }

    /// Erase variant the bootloader accepts.
    pub fn erase_mode(&self) -> EraseMode {
        if self
            .commands
            .contains(&(Command::ExtendedErase as u8))
        {
            EraseMode::Extended
        } else {
            EraseMode::Legacy
        }
    }
}

/// Flash geometry for a chip the driver can program.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    /// Flash size in bytes.
    pub flash_size: usize,
    /// Erase page size in bytes.
    pub page_size: usize,
}

/// Known product IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChipInfo {
    /// Product ID returned by GET_ID.
    pub pid: u16,
    /// Family description.
    pub name: &'static str,
    /// Flash geometry, when the chip is programmable by this driver.
    pub geometry: Option<Geometry>,
}

const fn chip(pid: u16, name: &'static str) -> ChipInfo {
    ChipInfo {
        pid,
        name,
        geometry: None,
    }
}

const fn chip_with(pid: u16, name: &'static str, flash_size: usize, page_size: usize) -> ChipInfo {
    ChipInfo {
        pid,
        name,
        geometry: Some(Geometry {
            flash_size,
            page_size,
        }),
    }
}

/// Product ID table.
pub static CHIPS: &[ChipInfo] = &[
    chip(0x412, "F1 Low-density"),
    chip_with(0x410, "F1 Medium-density", 0x2_0000, 1024),
    chip_with(0x414, "F1 High-density", 0x4_0000, 2048),
    chip(0x418, "F1 Connectivity line"),
    chip(0x420, "F1 Medium-density value line"),
    chip(0x428, "F1 High-density value line"),
    chip(0x430, "F1 XL-density value line"),
    chip(0x416, "L1 Medium-density ultralow power"),
    chip(0x436, "L1 High-density ultralow power"),
    chip(0x427, "L1 Medium-density plus ultralow power"),
    chip(0x411, "F2 STM32F2xxxx"),
    chip(0x440, "F0 STM32F051xx"),
    chip(0x444, "F0 STM32F050xx"),
    chip(0x413, "F4 STM32F40xxx/41xxx"),
    chip(0x419, "F4 STM32F427xx/437xx, STM32F429xx/439xx"),
    chip(0x432, "F3 STM32F37xxx, STM32F38xxx"),
    chip_with(0x422, "F3 STM32F30xxx, STM32F31xxx", 0x4_0000, 2048),
];

/// Look up a product ID.
pub fn lookup_chip(pid: u16) -> Option<&'static ChipInfo> {
    CHIPS.iter().find(|c| c.pid == pid)
}
