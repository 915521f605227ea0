//! Custom defaults insertion.
//!
//! Firmware builds that support custom defaults reserve a free flash area and
//! store its bounds as two little-endian `u32` values (start, end) at a
//! well-known pointer address. The inserter locates that pointer, checks the
//! area is both large enough and absent from the image, then splices the
//! configuration text into the image as new blocks of at most 16 KiB.

use crate::error::{Error, Result};
use crate::image::{DataBlock, FirmwareImage};
use log::{debug, info};

/// Pointer addresses probed in order.
pub const CUSTOM_DEFAULTS_POINTERS: [u32; 3] = [
    // Internal flash targets
    0x0800_2800,
    // Memory-mapped external flash targets
    0x901F_DFC0,
    // RAM-copy external flash targets
    0x2407_DFC0,
];

/// Maximum size of one inserted block.
pub const CHUNK_SIZE: usize = 16384;

/// Header prepended to the configuration text.
const HEADER: &str = "# Betaflight\n";

/// Position of an address relative to the image blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Cursor {
    /// First block whose end lies above the address.
    block: usize,
    /// Offset into that block, when the address lies inside it.
    offset: Option<usize>,
}

fn seek(blocks: &[DataBlock], address: u32) -> Cursor {
    let block = blocks
        .iter()
        .position(|b| u64::from(address) < u64::from(b.address) + b.len() as u64)
        .unwrap_or(blocks.len());

    let offset = blocks
        .get(block)
        .filter(|b| address >= b.address)
        .map(|b| (address - b.address) as usize);

    Cursor { block, offset }
}

/// Read a little-endian `u32`, following the cursor into the next block when
/// the value straddles a block end.
fn read_u32_le(blocks: &[DataBlock], cursor: &mut Cursor) -> Option<u32> {
    let mut value = 0u32;
    for shift in 0..4 {
        let offset = cursor.offset?;
        let block = blocks.get(cursor.block)?;
        let byte = *block.data.get(offset)?;
        value |= u32::from(byte) << (8 * shift);

        if offset + 1 >= block.len() {
            cursor.block += 1;
            cursor.offset = Some(0);
        } else {
            cursor.offset = Some(offset + 1);
        }
    }
    Some(value)
}

/// Bounds of the reserved custom defaults area.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DefaultsArea {
    /// First free byte.
    pub start: u32,
    /// One past the last free byte.
    pub end: u32,
}

impl DefaultsArea {
    /// Size of the area in bytes.
    pub fn len(&self) -> usize {
        (self.end - self.start) as usize
    }

    /// Whether the area has no room at all.
    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

fn area_at(blocks: &[DataBlock], pointer: u32) -> Option<DefaultsArea> {
    let mut cursor = seek(blocks, pointer);
    cursor.offset?;

    let start = read_u32_le(blocks, &mut cursor)?;
    let end = read_u32_le(blocks, &mut cursor)?;

    (end > start).then_some(DefaultsArea { start, end })
}

/// Locate the custom defaults area using the first pointer that resolves.
pub fn find_defaults_area(image: &FirmwareImage) -> Option<DefaultsArea> {
    CUSTOM_DEFAULTS_POINTERS.iter().find_map(|&pointer| {
        let area = area_at(&image.blocks, pointer);
        if let Some(area) = area {
            debug!(
                "Custom defaults pointer {pointer:#010x} -> area {:#010x}..{:#010x}",
                area.start, area.end
            );
        }
        area
    })
}

/// Splice `config` into the image's custom defaults area.
///
/// Returns `Ok(false)` when the image has no custom defaults area or already
/// carries inserted defaults, leaving it untouched. On error the image is
/// also left untouched.
pub fn insert_config(image: &mut FirmwareImage, config: &str) -> Result<bool> {
    if image.config_inserted {
        debug!("Custom defaults already inserted, skipping");
        return Ok(false);
    }

    let Some(area) = find_defaults_area(image) else {
        debug!("Image has no custom defaults area");
        return Ok(false);
    };

    let mut payload = Vec::with_capacity(HEADER.len() + config.len() + 1);
    payload.extend_from_slice(HEADER.as_bytes());
    payload.extend_from_slice(config.as_bytes());
    payload.push(0);

    if payload.len() >= area.len() {
        return Err(Error::AreaTooSmall {
            available: area.len(),
            needed: payload.len() + 1,
        });
    }

    let cursor = seek(&image.blocks, area.start);
    if cursor.offset.is_some() {
        return Err(Error::AreaNotFree {
            address: area.start,
        });
    }

    let next_start = image.blocks.get(cursor.block).map(|b| b.address);
    let mut chunks = Vec::with_capacity(payload.len().div_ceil(CHUNK_SIZE));
    let mut address = area.start;
    for chunk in payload.chunks(CHUNK_SIZE) {
        #[allow(clippy::cast_possible_truncation)]
        let length = chunk.len() as u32;
        let chunk_end = u64::from(address) + u64::from(length);
        if next_start.is_some_and(|next| chunk_end > u64::from(next)) {
            return Err(Error::AreaNotFree {
                address: next_start.unwrap_or(address),
            });
        }
        chunks.push(DataBlock::new(address, chunk.to_vec()));
        address = address.wrapping_add(length);
    }

    let count = chunks.len();
    image
        .blocks
        .splice(cursor.block..cursor.block, chunks);
    image.bytes_total += payload.len();
    image.config_inserted = true;

    info!(
        "Custom defaults inserted at {:#010x}: {} bytes in {count} block(s)",
        area.start,
        payload.len()
    );

    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Image with a pointer block at 0x08002800 describing `start..end`, plus
    /// an optional block after the area.
    fn image_with_area(start: u32, end: u32, trailer: Option<u32>) -> FirmwareImage {
        let mut pointer = Vec::new();
        pointer.extend_from_slice(&start.to_le_bytes());
        pointer.extend_from_slice(&end.to_le_bytes());

        let mut blocks = vec![
            DataBlock::new(0x0800_0000, vec![0xFF; 0x100]),
            DataBlock::new(0x0800_2800, pointer),
        ];
        if let Some(address) = trailer {
            blocks.push(DataBlock::new(address, vec![0x55; 0x40]));
        }
        FirmwareImage::from_blocks(blocks)
    }

    #[test]
    fn test_insert_grows_image() {
        let mut image = image_with_area(0x0800_4000, 0x0800_8000, Some(0x0800_8000));
        let before = image.bytes_total();
        let config = "set gyro_lpf1_static_hz = 250\nsave";

        assert!(insert_config(&mut image, config).unwrap());

        let payload_len = HEADER.len() + config.len() + 1;
        assert_eq!(image.bytes_total(), before + payload_len);
        assert!(image.config_inserted());

        let inserted = &image.blocks()[2];
        assert_eq!(inserted.address, 0x0800_4000);
        assert!(inserted.data.starts_with(b"# Betaflight\nset gyro"));
        assert_eq!(inserted.data.last(), Some(&0));
        assert_eq!(image.blocks()[3].address, 0x0800_8000);
    }

    #[test]
    fn test_oversized_config_leaves_image_untouched() {
        let mut image = image_with_area(0x0800_4000, 0x0800_4010, None);
        let before = image.clone();

        let err = insert_config(&mut image, "this will not fit in sixteen bytes").unwrap_err();

        match err {
            Error::AreaTooSmall { available, needed } => {
                assert_eq!(available, 16);
                assert_eq!(needed, HEADER.len() + 34 + 2);
            },
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(image, before);
    }

    #[test]
    fn test_no_pointer_returns_false() {
        let mut image = FirmwareImage::from_blocks(vec![DataBlock::new(0x0800_0000, vec![0; 64])]);
        assert!(!insert_config(&mut image, "save").unwrap());
        assert_eq!(image.blocks().len(), 1);
    }

    #[test]
    fn test_inverted_area_is_ignored() {
        let mut image = image_with_area(0x0800_8000, 0x0800_4000, None);
        assert!(!insert_config(&mut image, "save").unwrap());
    }

    #[test]
    fn test_occupied_area_is_rejected() {
        let mut image = image_with_area(0x0800_0010, 0x0800_0400, None);
        let before = image.clone();

        assert!(matches!(
            insert_config(&mut image, "save"),
            Err(Error::AreaNotFree { address: 0x0800_0010 })
        ));
        assert_eq!(image, before);
    }

    #[test]
    fn test_following_block_inside_area_is_rejected() {
        let mut image = image_with_area(0x0800_4000, 0x0800_8000, Some(0x0800_4008));
        let before = image.clone();

        assert!(matches!(
            insert_config(&mut image, "set motor_pwm_protocol = DSHOT600"),
            Err(Error::AreaNotFree { .. })
        ));
        assert_eq!(image, before);
    }

    #[test]
    fn test_large_config_is_chunked() {
        let mut image = image_with_area(0x0800_4000, 0x0801_4000, None);
        let config = "#".repeat(CHUNK_SIZE + 100);

        assert!(insert_config(&mut image, &config).unwrap());

        let first = &image.blocks()[2];
        let second = &image.blocks()[3];
        assert_eq!(first.len(), CHUNK_SIZE);
        assert_eq!(second.address, first.end_address());
        assert_eq!(first.len() + second.len(), HEADER.len() + config.len() + 1);
    }

    #[test]
    fn test_second_insert_is_skipped() {
        let mut image = image_with_area(0x0800_4000, 0x0800_8000, None);
        assert!(insert_config(&mut image, "save").unwrap());
        let once = image.clone();

        assert!(!insert_config(&mut image, "save").unwrap());
        assert_eq!(image, once);
    }

    #[test]
    fn test_pointer_straddling_blocks() {
        let start = 0x0800_4000u32.to_le_bytes();
        let end = 0x0800_5000u32.to_le_bytes();
        let mut head = vec![0u8; 0x10];
        head.extend_from_slice(&start);
        head.extend_from_slice(&end[..2]);

        let image = FirmwareImage::from_blocks(vec![
            DataBlock::new(0x0800_27F0, head),
            DataBlock::new(0x0800_2806, end[2..].to_vec()),
        ]);

        assert_eq!(
            find_defaults_area(&image),
            Some(DefaultsArea {
                start: 0x0800_4000,
                end: 0x0800_5000
            })
        );
    }
}
