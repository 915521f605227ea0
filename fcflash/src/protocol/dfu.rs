//! USB DFU 1.1 class requests with the ST DfuSe extensions.
//!
//! ## Status Report
//!
//! ```text
//! +----------+---------------------+---------+---------+
//! | bStatus  | bwPollTimeout (LE)  | bState  | iString |
//! +----------+---------------------+---------+---------+
//! |    1     |          3          |    1    |    1    |
//! +----------+---------------------+---------+---------+
//! ```
//!
//! ## Memory Descriptor Grammar
//!
//! Each alternate setting of the DFU interface names one memory region:
//!
//! ```text
//! @Internal Flash  /0x08000000/04*016Kg,01*064Kg,07*128Kg
//!  ^ name           ^ start    ^ count*size<unit><flags>, ...
//! ```

use crate::error::{Error, Result};
use crate::image::DataBlock;
use log::{debug, warn};
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::time::Duration;

/// DfuSe command: set address pointer.
pub const CMD_SET_ADDRESS: u8 = 0x21;

/// DfuSe command: erase page.
pub const CMD_ERASE_PAGE: u8 = 0x41;

/// DfuSe command: read unprotect (mass erase).
pub const CMD_READ_UNPROTECT: u8 = 0x92;

/// `wValue` of the first data block in a DNLOAD/UPLOAD sequence.
pub const FIRST_DATA_BLOCK: u16 = 2;

/// Transfer size used when the functional descriptor is unavailable.
pub const DEFAULT_TRANSFER_SIZE: usize = 2048;

/// Length of a GETSTATUS reply.
pub const STATUS_LENGTH: usize = 6;

/// Class-specific requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Request {
    /// Leave DFU mode.
    Detach = 0x00,
    /// Host to device transfer.
    Dnload = 0x01,
    /// Device to host transfer.
    Upload = 0x02,
    /// Status report.
    GetStatus = 0x03,
    /// Clear error status.
    ClrStatus = 0x04,
    /// Current state only.
    GetState = 0x05,
    /// Return to dfuIDLE.
    Abort = 0x06,
}

/// `bStatus` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    /// No error.
    Ok = 0x00,
    /// File is not targeted for this device.
    ErrTarget = 0x01,
    /// File failed vendor verification.
    ErrFile = 0x02,
    /// Memory write failed.
    ErrWrite = 0x03,
    /// Memory erase failed.
    ErrErase = 0x04,
    /// Erase check failed.
    ErrCheckErased = 0x05,
    /// Program failed.
    ErrProg = 0x06,
    /// Verify failed.
    ErrVerify = 0x07,
    /// Address out of range.
    ErrAddress = 0x08,
    /// Zero-length DNLOAD before all data arrived.
    ErrNotDone = 0x09,
    /// Firmware corrupt.
    ErrFirmware = 0x0A,
    /// Vendor-specific error.
    ErrVendor = 0x0B,
    /// Unexpected USB reset.
    ErrUsbReset = 0x0C,
    /// Unexpected power-on reset.
    ErrPowerOnReset = 0x0D,
    /// Unknown error.
    ErrUnknown = 0x0E,
    /// Unexpected request stalled.
    ErrStalledPacket = 0x0F,
}

impl Status {
    /// Decode `bStatus`; out-of-range values map to [`Status::ErrUnknown`].
    pub fn from_u8(value: u8) -> Self {
        match value {
            0x00 => Self::Ok,
            0x01 => Self::ErrTarget,
            0x02 => Self::ErrFile,
            0x03 => Self::ErrWrite,
            0x04 => Self::ErrErase,
            0x05 => Self::ErrCheckErased,
            0x06 => Self::ErrProg,
            0x07 => Self::ErrVerify,
            0x08 => Self::ErrAddress,
            0x09 => Self::ErrNotDone,
            0x0A => Self::ErrFirmware,
            0x0B => Self::ErrVendor,
            0x0C => Self::ErrUsbReset,
            0x0D => Self::ErrPowerOnReset,
            0x0F => Self::ErrStalledPacket,
            _ => Self::ErrUnknown,
        }
    }

    /// Name as used in the DFU class specification.
    pub fn name(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::ErrTarget => "errTARGET",
            Self::ErrFile => "errFILE",
            Self::ErrWrite => "errWRITE",
            Self::ErrErase => "errERASE",
            Self::ErrCheckErased => "errCHECK_ERASED",
            Self::ErrProg => "errPROG",
            Self::ErrVerify => "errVERIFY",
            Self::ErrAddress => "errADDRESS",
            Self::ErrNotDone => "errNOTDONE",
            Self::ErrFirmware => "errFIRMWARE",
            Self::ErrVendor => "errVENDOR",
            Self::ErrUsbReset => "errUSBR",
            Self::ErrPowerOnReset => "errPOR",
            Self::ErrUnknown => "errUNKNOWN",
            Self::ErrStalledPacket => "errSTALLEDPKT",
        }
    }
}

/// `bState` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum State {
    /// Running the application.
    AppIdle = 0,
    /// Application received DETACH.
    AppDetach = 1,
    /// Waiting for requests.
    DfuIdle = 2,
    /// Block received, waiting for GETSTATUS.
    DnloadSync = 3,
    /// Programming a block.
    DnBusy = 4,
    /// Download in progress, expecting DNLOAD.
    DnloadIdle = 5,
    /// Final block received.
    ManifestSync = 6,
    /// Manifestation phase.
    Manifest = 7,
    /// Waiting for reset after manifestation.
    ManifestWaitReset = 8,
    /// Upload in progress.
    UploadIdle = 9,
    /// Error, waiting for CLRSTATUS.
    Error = 10,
}

impl State {
    /// Decode `bState`.
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => Self::AppIdle,
            1 => Self::AppDetach,
            2 => Self::DfuIdle,
            3 => Self::DnloadSync,
            4 => Self::DnBusy,
            5 => Self::DnloadIdle,
            6 => Self::ManifestSync,
            7 => Self::Manifest,
            8 => Self::ManifestWaitReset,
            9 => Self::UploadIdle,
            10 => Self::Error,
            _ => return None,
        })
    }

    /// Name as used in the DFU class specification.
    pub fn name(self) -> &'static str {
        match self {
            Self::AppIdle => "appIDLE",
            Self::AppDetach => "appDETACH",
            Self::DfuIdle => "dfuIDLE",
            Self::DnloadSync => "dfuDNLOAD-SYNC",
            Self::DnBusy => "dfuDNBUSY",
            Self::DnloadIdle => "dfuDNLOAD-IDLE",
            Self::ManifestSync => "dfuMANIFEST-SYNC",
            Self::Manifest => "dfuMANIFEST",
            Self::ManifestWaitReset => "dfuMANIFEST-WAIT-RESET",
            Self::UploadIdle => "dfuUPLOAD-IDLE",
            Self::Error => "dfuERROR",
        }
    }
}

/// Decoded GETSTATUS reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusReport {
    /// Result of the previous request.
    pub status: Status,
    /// Minimum wait before the next GETSTATUS.
    pub poll_timeout: Duration,
    /// State the device enters after this reply.
    pub state: State,
    /// Index of a status description string.
    pub string_index: u8,
}

impl StatusReport {
    /// Parse a 6-byte GETSTATUS reply.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < STATUS_LENGTH {
            return Err(Error::Protocol(format!(
                "GETSTATUS returned {} bytes, expected {STATUS_LENGTH}",
                data.len()
            )));
        }

        let millis = u32::from(data[1]) | (u32::from(data[2]) << 8) | (u32::from(data[3]) << 16);
        let state = State::from_u8(data[4])
            .ok_or_else(|| Error::Protocol(format!("unknown DFU state {}", data[4])))?;

        Ok(Self {
            status: Status::from_u8(data[0]),
            poll_timeout: Duration::from_millis(u64::from(millis)),
            state,
            string_index: data[5],
        })
    }

    /// Encode as the 6 bytes a device would send.
    #[allow(clippy::cast_possible_truncation)]
    pub fn to_bytes(&self) -> [u8; STATUS_LENGTH] {
        let millis = self.poll_timeout.as_millis().min(0x00FF_FFFF) as u32;
        let [t0, t1, t2, _] = millis.to_le_bytes();
        [self.status as u8, t0, t1, t2, self.state as u8, self.string_index]
    }
}

/// `[0x21, address LE]`.
pub fn set_address_command(address: u32) -> [u8; 5] {
    let [a, b, c, d] = address.to_le_bytes();
    [CMD_SET_ADDRESS, a, b, c, d]
}

/// `[0x41, address LE]`.
pub fn erase_page_command(address: u32) -> [u8; 5] {
    let [a, b, c, d] = address.to_le_bytes();
    [CMD_ERASE_PAGE, a, b, c, d]
}

/// Known malformed descriptors and their replacements.
const DESCRIPTOR_SHIMS: &[(&str, &str)] = &[
    // Early H750 external flash bootloader
    (
        "@External Flash /0x90000000/1001*128Kg,3*128Kg,20*128Ka",
        "@External Flash /0x90000000/998*128Kg,1*128Kg,4*128Kg,21*128Ka",
    ),
    // AT32F43xxM
    ("@Option byte   /0x1FFFC000/01*4096 g", "@Option bytes   /0x1FFFC000/01*4096 g"),
    // AT32F43xxG
    ("@Option byte   /0x1FFFC000/01*512 g", "@Option bytes   /0x1FFFC000/01*512 g"),
];

/// Replace a known malformed descriptor with its corrected form.
pub fn apply_descriptor_shims(descriptor: &str) -> Cow<'_, str> {
    DESCRIPTOR_SHIMS
        .iter()
        .find(|(bad, _)| *bad == descriptor)
        .map_or(Cow::Borrowed(descriptor), |(bad, good)| {
            debug!("Descriptor shim: \"{bad}\" -> \"{good}\"");
            Cow::Borrowed(*good)
        })
}

/// A run of equally sized pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sector {
    /// Address of the first page.
    pub start_address: u32,
    /// Page size in bytes.
    pub page_size: u32,
    /// Number of pages.
    pub num_pages: u32,
    /// `page_size * num_pages`.
    pub total_size: u32,
}

impl Sector {
    fn end(&self) -> u64 {
        u64::from(self.start_address) + u64::from(self.total_size)
    }

    /// Start address of page `index`.
    pub fn page_address(&self, index: u32) -> u32 {
        self.start_address + index * self.page_size
    }
}

/// One named memory region of the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryRegion {
    /// Region name as reported, e.g. `Internal Flash`.
    pub name: String,
    /// First address.
    pub start_address: u32,
    /// Contiguous sectors.
    pub sectors: Vec<Sector>,
    /// Sum of all sector sizes.
    pub total_size: u32,
}

/// Page chosen for erasing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErasePage {
    /// Sector index.
    pub sector: usize,
    /// Page index within the sector.
    pub page: u32,
    /// Page start address.
    pub address: u32,
    /// Page size in bytes.
    pub size: u32,
}

impl MemoryRegion {
    /// Lookup key: lower-case name with spaces replaced by `_`.
    pub fn key(&self) -> String {
        region_key(&self.name)
    }

    /// Whether `length` bytes at `address` are covered by consecutive
    /// sectors of this region.
    pub fn is_block_usable(&self, address: u32, length: usize) -> bool {
        let end = u64::from(address) + length as u64;
        let mut cursor = u64::from(address);

        loop {
            let Some(sector) = self
                .sectors
                .iter()
                .find(|s| cursor >= u64::from(s.start_address) && cursor < s.end())
            else {
                return false;
            };

            if end <= sector.end() {
                return true;
            }
            cursor = sector.end();
        }
    }

    /// Pages to erase for `blocks`, in layout order without duplicates.
    ///
    /// With `erase_chip` every page of every sector is returned.
    pub fn erase_pages(&self, blocks: &[DataBlock], erase_chip: bool) -> Vec<ErasePage> {
        let mut pages = Vec::new();

        for (index, sector) in self.sectors.iter().enumerate() {
            for page in 0..sector.num_pages {
                let page_start = u64::from(sector.page_address(page));
                let page_end = page_start + u64::from(sector.page_size) - 1;

                let selected = erase_chip
                    || blocks.iter().filter(|b| !b.is_empty()).any(|block| {
                        let start = u64::from(block.address);
                        let end = start + block.len() as u64 - 1;

                        let starts_in_page = start >= page_start && start <= page_end;
                        let ends_in_page = end >= page_start && end <= page_end;
                        let spans_page = start < page_start && end > page_end;

                        starts_in_page || ends_in_page || spans_page
                    });

                if selected {
                    pages.push(ErasePage {
                        sector: index,
                        page,
                        address: sector.page_address(page),
                        size: sector.page_size,
                    });
                }
            }
        }

        pages
    }
}

fn region_key(name: &str) -> String {
    name.to_lowercase().replace(' ', "_")
}

fn leading_number(text: &str) -> Option<u32> {
    let text = text.trim_start();
    let digits = text
        .find(|c: char| !c.is_ascii_digit())
        .map_or(text, |end| &text[..end]);
    digits.parse().ok()
}

fn parse_address(text: &str) -> Option<u32> {
    let text = text.trim();
    match text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
    {
        Some(hex) => u32::from_str_radix(hex, 16).ok(),
        None => text.parse().ok(),
    }
}

/// Parse one memory descriptor string.
///
/// Known malformed strings are corrected first. Characters outside printable
/// ASCII are dropped, and fields past the third `/`-separated one are
/// ignored (some chips append a second bank).
pub fn parse_descriptor(descriptor: &str) -> Result<MemoryRegion> {
    let invalid = |what: &str| Error::UnsupportedChip(format!("memory descriptor \"{descriptor}\": {what}"));

    let shimmed = apply_descriptor_shims(descriptor);
    let printable: String = shimmed
        .chars()
        .filter(|c| (' '..='~').contains(c))
        .collect();

    let mut fields: Vec<&str> = printable.split('/').collect();
    if fields.len() > 3 {
        debug!("Shrinking long descriptor \"{printable}\"");
        fields.truncate(3);
    }
    if fields.len() < 3 {
        return Err(invalid("expected name/start/sectors"));
    }

    let name = fields[0]
        .trim()
        .strip_prefix('@')
        .ok_or_else(|| invalid("name must start with '@'"))?
        .trim()
        .to_string();

    let start_address = parse_address(fields[1]).ok_or_else(|| invalid("bad start address"))?;

    let mut sectors = Vec::new();
    let mut total_size: u32 = 0;

    for group in fields[2].split(',') {
        let parts: Vec<&str> = group.split('*').collect();
        let [count, size] = parts.as_slice() else {
            return Err(invalid("sector group must be count*size"));
        };

        let num_pages = leading_number(count).ok_or_else(|| invalid("bad page count"))?;
        let mut page_size = leading_number(size)
            .filter(|s| *s != 0)
            .ok_or_else(|| invalid("bad page size"))?;

        let unit = size.chars().rev().nth(1);
        let multiplier = match unit {
            Some('M') => 1024 * 1024,
            Some('K') => 1024,
            _ => 1,
        };
        page_size = page_size
            .checked_mul(multiplier)
            .ok_or_else(|| invalid("page size overflow"))?;

        let sector_size = num_pages
            .checked_mul(page_size)
            .ok_or_else(|| invalid("sector size overflow"))?;

        sectors.push(Sector {
            start_address: start_address.wrapping_add(total_size),
            page_size,
            num_pages,
            total_size: sector_size,
        });

        total_size = total_size
            .checked_add(sector_size)
            .ok_or_else(|| invalid("region size overflow"))?;
    }

    Ok(MemoryRegion {
        name,
        start_address,
        sectors,
        total_size,
    })
}

/// All memory regions of a device, keyed by [`MemoryRegion::key`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChipLayout {
    regions: BTreeMap<String, MemoryRegion>,
}

impl ChipLayout {
    /// Key of the internal flash region.
    pub const INTERNAL_FLASH: &'static str = "internal_flash";
    /// Key of the external flash region.
    pub const EXTERNAL_FLASH: &'static str = "external_flash";
    /// Key of the option bytes region.
    pub const OPTION_BYTES: &'static str = "option_bytes";

    /// Parse every descriptor, skipping ones that do not follow the grammar.
    pub fn from_descriptors<S: AsRef<str>>(descriptors: &[S]) -> Self {
        let mut regions = BTreeMap::new();
        for descriptor in descriptors {
            match parse_descriptor(descriptor.as_ref()) {
                Ok(region) => {
                    debug!(
                        "Memory region {}: {:#010x}, {} bytes in {} sector group(s)",
                        region.name,
                        region.start_address,
                        region.total_size,
                        region.sectors.len()
                    );
                    regions.insert(region.key(), region);
                },
                Err(e) => warn!("Ignoring memory descriptor: {e}"),
            }
        }
        Self { regions }
    }

    /// Region by key.
    pub fn region(&self, key: &str) -> Option<&MemoryRegion> {
        self.regions.get(key)
    }

    /// Internal flash region.
    pub fn internal_flash(&self) -> Option<&MemoryRegion> {
        self.region(Self::INTERNAL_FLASH)
    }

    /// External flash region.
    pub fn external_flash(&self) -> Option<&MemoryRegion> {
        self.region(Self::EXTERNAL_FLASH)
    }

    /// Option bytes region.
    pub fn option_bytes(&self) -> Option<&MemoryRegion> {
        self.region(Self::OPTION_BYTES)
    }

    /// All regions in key order.
    pub fn regions(&self) -> impl Iterator<Item = &MemoryRegion> {
        self.regions.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_report_parse() {
        let report = StatusReport::parse(&[0x00, 0x64, 0x00, 0x00, 0x04, 0x00]).unwrap();
        assert_eq!(report.status, Status::Ok);
        assert_eq!(report.state, State::DnBusy);
        assert_eq!(report.poll_timeout, Duration::from_millis(100));
        assert_eq!(report.to_bytes(), [0x00, 0x64, 0x00, 0x00, 0x04, 0x00]);
    }

    #[test]
    fn test_status_report_24bit_timeout() {
        let report = StatusReport::parse(&[0x0B, 0x01, 0x02, 0x03, 0x0A, 0x00]).unwrap();
        assert_eq!(report.status, Status::ErrVendor);
        assert_eq!(report.state, State::Error);
        assert_eq!(report.poll_timeout, Duration::from_millis(0x030201));
    }

    #[test]
    fn test_status_report_rejects_short_or_unknown() {
        assert!(StatusReport::parse(&[0, 0, 0]).is_err());
        assert!(StatusReport::parse(&[0, 0, 0, 0, 42, 0]).is_err());
    }

    #[test]
    fn test_address_commands() {
        assert_eq!(set_address_command(0x0800_4000), [0x21, 0x00, 0x40, 0x00, 0x08]);
        assert_eq!(erase_page_command(0x0800_0800), [0x41, 0x00, 0x08, 0x00, 0x08]);
    }

    #[test]
    fn test_parse_f4_descriptor() {
        let region = parse_descriptor("@Internal Flash  /0x08000000/04*016Kg,01*064Kg,07*128Kg").unwrap();

        assert_eq!(region.key(), "internal_flash");
        assert_eq!(region.start_address, 0x0800_0000);
        assert_eq!(region.sectors.len(), 3);
        assert_eq!(region.sectors[0].page_size, 16 * 1024);
        assert_eq!(region.sectors[1].start_address, 0x0801_0000);
        assert_eq!(region.sectors[2].start_address, 0x0802_0000);
        assert_eq!(region.total_size, 1024 * 1024);
    }

    #[test]
    fn test_parse_byte_unit_and_second_bank() {
        let region = parse_descriptor("@Option Bytes   /0x1FFF7800/01*048 e/0x1FFFF800/01*048 e").unwrap();

        assert_eq!(region.key(), "option_bytes");
        assert_eq!(region.total_size, 48);
        assert_eq!(region.sectors.len(), 1);
    }

    #[test]
    fn test_parse_strips_non_printable() {
        let region = parse_descriptor("@Internal Flash  /0x08000000/128*0002Kg\u{0}\u{1}").unwrap();
        assert_eq!(region.total_size, 256 * 1024);
    }

    #[test]
    fn test_descriptor_shims() {
        let region = parse_descriptor("@External Flash /0x90000000/1001*128Kg,3*128Kg,20*128Ka").unwrap();
        let pages: Vec<u32> = region
            .sectors
            .iter()
            .map(|s| s.num_pages)
            .collect();
        assert_eq!(pages, vec![998, 1, 4, 21]);

        let region = parse_descriptor("@Option byte   /0x1FFFC000/01*4096 g").unwrap();
        assert_eq!(region.key(), "option_bytes");
        assert_eq!(region.total_size, 4096);

        let region = parse_descriptor("@Option byte   /0x1FFFC000/01*512 g").unwrap();
        assert_eq!(region.total_size, 512);
    }

    #[test]
    fn test_unshimmed_variants_are_left_alone() {
        let region = parse_descriptor("@Option byte  /0x1FFFC000/01*512 g").unwrap();
        assert_eq!(region.key(), "option_byte");
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(parse_descriptor("Internal Flash/0x08000000/04*016Kg").is_err());
        assert!(parse_descriptor("@Internal Flash/0x08000000/04-016Kg").is_err());
        assert!(parse_descriptor("@Internal Flash/0x08000000/04*000Kg").is_err());
        assert!(parse_descriptor("@Internal Flash").is_err());
    }

    #[test]
    fn test_chip_layout_skips_bad_descriptors() {
        let layout = ChipLayout::from_descriptors(&[
            "@Internal Flash  /0x08000000/04*016Kg,01*064Kg,07*128Kg",
            "garbage",
            "@Option Bytes  /0x1FFFC000/01*016 e",
        ]);

        assert!(layout.internal_flash().is_some());
        assert!(layout.option_bytes().is_some());
        assert!(layout.external_flash().is_none());
        assert_eq!(layout.regions().count(), 2);
    }

    fn uniform_region(pages: u32, page_size: u32) -> MemoryRegion {
        MemoryRegion {
            name: "Internal Flash".into(),
            start_address: 0x0800_0000,
            sectors: vec![Sector {
                start_address: 0x0800_0000,
                page_size,
                num_pages: pages,
                total_size: pages * page_size,
            }],
            total_size: pages * page_size,
        }
    }

    #[test]
    fn test_erase_pages_straddling_block() {
        let region = uniform_region(16, 1024);
        let block = DataBlock::new(0x0800_0000 + 1024 - 10, vec![0xAB; 300]);

        let pages = region.erase_pages(&[block], false);

        assert_eq!(pages.len(), 2);
        assert_eq!(pages[0].address, 0x0800_0000);
        assert_eq!(pages[1].address, 0x0800_0400);
    }

    #[test]
    fn test_erase_pages_spanning_and_deduplicated() {
        let region = uniform_region(8, 1024);
        let blocks = vec![
            DataBlock::new(0x0800_0000, vec![0; 3000]),
            DataBlock::new(0x0800_0100, vec![0; 16]),
        ];

        let pages = region.erase_pages(&blocks, false);
        let indices: Vec<u32> = pages.iter().map(|p| p.page).collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }

    #[test]
    fn test_erase_chip_selects_everything() {
        let region = parse_descriptor("@Internal Flash  /0x08000000/04*016Kg,01*064Kg,07*128Kg").unwrap();
        assert_eq!(region.erase_pages(&[], true).len(), 12);
        assert!(region.erase_pages(&[], false).is_empty());
    }

    #[test]
    fn test_block_usable_across_sectors() {
        let region = parse_descriptor("@Internal Flash  /0x08000000/04*016Kg,01*064Kg,07*128Kg").unwrap();

        assert!(region.is_block_usable(0x0800_0000, 0x100));
        // Crosses from the 16K sectors into the 64K sector
        assert!(region.is_block_usable(0x0800_F000, 0x2000));
        assert!(region.is_block_usable(0x0800_0000, 1024 * 1024));
        assert!(!region.is_block_usable(0x0800_0000, 1024 * 1024 + 1));
        assert!(!region.is_block_usable(0x0700_0000, 16));
    }
}
