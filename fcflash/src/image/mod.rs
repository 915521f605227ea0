//! Firmware image model.
//!
//! A [`FirmwareImage`] is an ordered list of [`DataBlock`]s, each a contiguous
//! run of bytes bound to a flash address. Images are produced by the
//! Intel-HEX parser ([`hex`]) and may be rewritten once by the custom
//! defaults inserter ([`config`]) before a flashing session starts. Drivers
//! only ever borrow an image immutably.
//!
//! ```text
//! blocks[0]  0x08000000 +-----------------+
//!                       |  vector table   |
//!                       |  code ...       |
//! blocks[1]  0x08002800 +-----------------+  <- custom defaults pointers
//!                       |  ...            |
//! blocks[n]  <start>    +-----------------+  <- spliced config chunks
//! ```

pub mod config;
pub mod hex;

use crate::error::Result;
use log::debug;
use std::fs;
use std::path::Path;

/// A contiguous run of bytes destined for one flash address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataBlock {
    /// Absolute start address.
    pub address: u32,
    /// Payload bytes.
    pub data: Vec<u8>,
}

impl DataBlock {
    /// Create a new block.
    pub fn new(address: u32, data: Vec<u8>) -> Self {
        Self { address, data }
    }

    /// Number of payload bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the block carries no bytes.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Address one past the last byte of the block.
    #[allow(clippy::cast_possible_truncation)]
    pub fn end_address(&self) -> u32 {
        self.address.wrapping_add(self.data.len() as u32)
    }

    /// Whether `address` falls inside this block.
    pub fn contains(&self, address: u32) -> bool {
        address >= self.address && u64::from(address) < u64::from(self.address) + self.data.len() as u64
    }
}

/// A parsed firmware image.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FirmwareImage {
    pub(crate) blocks: Vec<DataBlock>,
    pub(crate) bytes_total: usize,
    pub(crate) start_linear_address: Option<u32>,
    pub(crate) config_inserted: bool,
}

impl FirmwareImage {
    /// Build an image directly from blocks.
    ///
    /// Blocks keep the given order; `bytes_total` is the sum of their lengths.
    pub fn from_blocks(blocks: Vec<DataBlock>) -> Self {
        let bytes_total = blocks.iter().map(DataBlock::len).sum();
        Self {
            blocks,
            bytes_total,
            start_linear_address: None,
            config_inserted: false,
        }
    }

    /// Parse an Intel-HEX image from text.
    pub fn from_hex(text: &str) -> Result<Self> {
        hex::parse(text)
    }

    /// Load and parse an Intel-HEX image from a file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        debug!("Loading HEX image from: {}", path.display());

        let bytes = fs::read(path)?;
        let text = String::from_utf8_lossy(&bytes);
        hex::parse(&text)
    }

    /// Blocks in insertion order.
    pub fn blocks(&self) -> &[DataBlock] {
        &self.blocks
    }

    /// Total payload bytes across all blocks.
    pub fn bytes_total(&self) -> usize {
        self.bytes_total
    }

    /// Entry point recorded by a start-linear-address record.
    pub fn start_linear_address(&self) -> Option<u32> {
        self.start_linear_address
    }

    /// Whether custom defaults were already spliced in.
    pub fn config_inserted(&self) -> bool {
        self.config_inserted
    }

    /// Lowest block start address.
    pub fn lowest_address(&self) -> Option<u32> {
        self.blocks.iter().map(|b| b.address).min()
    }

    /// Highest address one past the end of any block.
    pub fn end_address(&self) -> Option<u32> {
        self.blocks.iter().map(DataBlock::end_address).max()
    }

    /// Whether the image holds no data.
    pub fn is_empty(&self) -> bool {
        self.blocks.iter().all(DataBlock::is_empty)
    }
}
