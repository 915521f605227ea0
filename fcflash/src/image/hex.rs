//! Intel-HEX image parser.
//!
//! ## Record Format
//!
//! ```text
//! +---+-------+---------+------+-----------------+----------+
//! | : | Count | Address | Type |      Data       | Checksum |
//! +---+-------+---------+------+-----------------+----------+
//! | 1 |   2   |    4    |  2   |   2 * Count     |    2     |  (hex characters)
//! +---+-------+---------+------+-----------------+----------+
//! ```
//!
//! The checksum is the two's complement of the byte sum of count, both
//! address bytes, type and data. Data addresses are 16-bit offsets into the
//! 64 KiB window selected by the last extended linear address record.
//!
//! Parsing is all-or-nothing: any malformed record, checksum mismatch or a
//! missing end-of-file record yields [`Error::CorruptImage`].

use crate::error::{Error, Result};
use crate::image::{DataBlock, FirmwareImage};
use byteorder::{BigEndian, ByteOrder};
use log::{debug, trace, warn};

/// Intel-HEX record types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordType {
    /// Data record.
    Data = 0x00,
    /// End-of-file record.
    EndOfFile = 0x01,
    /// Extended segment address record.
    ExtendedSegmentAddress = 0x02,
    /// Start segment address record.
    StartSegmentAddress = 0x03,
    /// Extended linear address record.
    ExtendedLinearAddress = 0x04,
    /// Start linear address record.
    StartLinearAddress = 0x05,
}

impl RecordType {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::Data),
            0x01 => Some(Self::EndOfFile),
            0x02 => Some(Self::ExtendedSegmentAddress),
            0x03 => Some(Self::StartSegmentAddress),
            0x04 => Some(Self::ExtendedLinearAddress),
            0x05 => Some(Self::StartLinearAddress),
            _ => None,
        }
    }
}

/// One decoded record.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Record {
    offset: u16,
    kind: u8,
    payload: Vec<u8>,
}

impl Record {
    /// Decode and checksum-verify a single record line.
    fn decode(line: &str, line_no: usize) -> Result<Self> {
        let corrupt = |what: &str| Error::CorruptImage(format!("line {line_no}: {what}"));

        let body = line
            .strip_prefix(':')
            .ok_or_else(|| corrupt("missing ':' start code"))?;

        if body.len() < 10 || body.len() % 2 != 0 {
            return Err(corrupt("truncated record"));
        }

        let bytes = decode_hex(body).ok_or_else(|| corrupt("invalid hex digit"))?;
        let count = usize::from(bytes[0]);

        if bytes.len() != count + 5 {
            return Err(corrupt(&format!(
                "length field says {count} bytes, record carries {}",
                bytes.len() - 5
            )));
        }

        let sum = bytes
            .iter()
            .fold(0u8, |acc, b| acc.wrapping_add(*b));
        if sum != 0 {
            let expected = bytes[..bytes.len() - 1]
                .iter()
                .fold(0u8, |acc, b| acc.wrapping_add(*b))
                .wrapping_neg();
            return Err(corrupt(&format!(
                "checksum mismatch: expected {expected:#04x}, got {:#04x}",
                bytes[bytes.len() - 1]
            )));
        }

        Ok(Self {
            offset: BigEndian::read_u16(&bytes[1..3]),
            kind: bytes[3],
            payload: bytes[4..4 + count].to_vec(),
        })
    }
}

fn decode_hex(text: &str) -> Option<Vec<u8>> {
    if !text.is_ascii() {
        return None;
    }
    text.as_bytes()
        .chunks(2)
        .map(|pair| {
            let s = std::str::from_utf8(pair).ok()?;
            u8::from_str_radix(s, 16).ok()
        })
        .collect()
}

/// Parse Intel-HEX text into a [`FirmwareImage`].
///
/// A single trailing empty line is tolerated; `\r\n` line endings are
/// accepted. Consecutive data records continue the current block when their
/// absolute address equals the end of the previous record, otherwise a new
/// block is started.
pub fn parse(text: &str) -> Result<FirmwareImage> {
    let mut lines: Vec<&str> = text.split('\n').collect();
    if lines.last().is_some_and(|l| l.trim_end_matches('\r').is_empty()) {
        lines.pop();
    }

    let mut image = FirmwareImage::default();
    let mut extended_linear_address: u32 = 0;
    let mut next_address: Option<u32> = None;
    let mut end_of_file = false;

    for (index, raw) in lines.iter().enumerate() {
        let line = raw.trim_end_matches('\r');

        if end_of_file {
            if !line.trim().is_empty() {
                warn!("Ignoring data after end-of-file record (line {})", index + 1);
            }
            break;
        }

        let record = Record::decode(line, index + 1)?;
        trace!(
            "record type {:#04x} @ {:#06x}, {} bytes",
            record.kind,
            record.offset,
            record.payload.len()
        );

        match RecordType::from_u8(record.kind) {
            Some(RecordType::Data) => {
                let address = extended_linear_address.wrapping_add(u32::from(record.offset));

                if next_address != Some(address) || image.blocks.is_empty() {
                    image
                        .blocks
                        .push(DataBlock::new(address, Vec::new()));
                }

                if let Some(block) = image.blocks.last_mut() {
                    block
                        .data
                        .extend_from_slice(&record.payload);
                }

                image.bytes_total += record.payload.len();
                #[allow(clippy::cast_possible_truncation)]
                let count = record.payload.len() as u32;
                next_address = Some(address.wrapping_add(count));
            },
            Some(RecordType::EndOfFile) => {
                end_of_file = true;
            },
            Some(RecordType::ExtendedSegmentAddress | RecordType::StartSegmentAddress) => {
                if record.payload.iter().any(|b| *b != 0) {
                    warn!(
                        "Segment address record on line {} is not supported, ignoring",
                        index + 1
                    );
                }
            },
            Some(RecordType::ExtendedLinearAddress) => {
                if record.payload.len() != 2 {
                    return Err(Error::CorruptImage(format!(
                        "line {}: extended linear address record needs 2 bytes",
                        index + 1
                    )));
                }
                extended_linear_address = u32::from(BigEndian::read_u16(&record.payload)) << 16;
            },
            Some(RecordType::StartLinearAddress) => {
                if record.payload.len() != 4 {
                    return Err(Error::CorruptImage(format!(
                        "line {}: start linear address record needs 4 bytes",
                        index + 1
                    )));
                }
                image.start_linear_address = Some(BigEndian::read_u32(&record.payload));
            },
            None => {
                warn!(
                    "Unknown record type {:#04x} on line {}, ignoring",
                    record.kind,
                    index + 1
                );
            },
        }
    }

    if !end_of_file {
        return Err(Error::CorruptImage("missing end-of-file record".into()));
    }

    debug!(
        "HEX image parsed: {} blocks, {} bytes",
        image.blocks.len(),
        image.bytes_total
    );

    Ok(image)
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::image::DataBlock;

    /// Build one record line with a valid checksum.
    #[allow(clippy::cast_possible_truncation)]
    pub(crate) fn record(kind: u8, offset: u16, payload: &[u8]) -> String {
        let mut bytes = vec![payload.len() as u8, (offset >> 8) as u8, offset as u8, kind];
        bytes.extend_from_slice(payload);
        let checksum = bytes
            .iter()
            .fold(0u8, |acc, b| acc.wrapping_add(*b))
            .wrapping_neg();
        bytes.push(checksum);

        let mut line = String::from(":");
        for b in bytes {
            line.push_str(&format!("{b:02X}"));
        }
        line
    }

    /// Encode blocks as Intel-HEX text with 16-byte data records.
    #[allow(clippy::cast_possible_truncation)]
    pub(crate) fn encode_blocks(blocks: &[DataBlock]) -> String {
        let mut lines = Vec::new();
        let mut upper: Option<u16> = None;

        for block in blocks {
            for (i, chunk) in block.data.chunks(16).enumerate() {
                let address = block.address + (i * 16) as u32;
                let high = (address >> 16) as u16;
                if upper != Some(high) {
                    lines.push(record(0x04, 0, &high.to_be_bytes()));
                    upper = Some(high);
                }
                lines.push(record(0x00, address as u16, chunk));
            }
        }

        lines.push(record(0x01, 0, &[]));
        lines.join("\n") + "\n"
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::{encode_blocks, record};
    use super::*;

    #[test]
    fn test_parse_reference_record() {
        let text = ":10010000214601360121470136007EFE09D2190140\n:00000001FF\n";
        let image = parse(text).unwrap();

        assert_eq!(image.blocks().len(), 1);
        assert_eq!(image.blocks()[0].address, 0x0100);
        assert_eq!(image.blocks()[0].data[0], 0x21);
        assert_eq!(image.bytes_total(), 16);
    }

    #[test]
    fn test_bytes_total_matches_payloads() {
        let text = [
            record(0x04, 0, &[0x08, 0x00]),
            record(0x00, 0x0000, &[1; 16]),
            record(0x00, 0x0010, &[2; 16]),
            record(0x00, 0x0020, &[3; 7]),
            record(0x00, 0x1000, &[4; 5]),
            record(0x01, 0, &[]),
        ]
        .join("\n");

        let image = parse(&text).unwrap();

        assert_eq!(image.bytes_total(), 16 + 16 + 7 + 5);
        assert_eq!(image.blocks().len(), 2);
        assert_eq!(image.blocks()[0].address, 0x0800_0000);
        assert_eq!(image.blocks()[0].len(), 39);
        assert_eq!(image.blocks()[1].address, 0x0800_1000);
    }

    #[test]
    fn test_flipped_payload_byte_is_rejected() {
        let good = record(0x00, 0x0000, &[0x10, 0x20, 0x30, 0x40]);
        // Byte 1 of the payload starts after ":LLAAAATT" (9 chars).
        let mut bad = good.clone().into_bytes();
        bad[9] = if bad[9] == b'1' { b'2' } else { b'1' };
        let bad = String::from_utf8(bad).unwrap();

        let text = format!("{bad}\n{}\n", record(0x01, 0, &[]));
        assert!(matches!(parse(&text), Err(Error::CorruptImage(_))));

        let text = format!("{good}\n{}\n", record(0x01, 0, &[]));
        assert!(parse(&text).is_ok());
    }

    #[test]
    fn test_missing_end_of_file_is_rejected() {
        let text = record(0x00, 0, &[1, 2, 3]);
        assert!(matches!(parse(&text), Err(Error::CorruptImage(_))));
    }

    #[test]
    fn test_crlf_and_start_linear_address() {
        let text = [
            record(0x04, 0, &[0x08, 0x00]),
            record(0x00, 0x0000, &[0xAA; 4]),
            record(0x05, 0, &[0x08, 0x00, 0x01, 0x89]),
            record(0x01, 0, &[]),
        ]
        .join("\r\n")
            + "\r\n";

        let image = parse(&text).unwrap();
        assert_eq!(image.start_linear_address(), Some(0x0800_0189));
        assert_eq!(image.blocks()[0].address, 0x0800_0000);
    }

    #[test]
    fn test_segment_records_are_tolerated() {
        let text = [
            record(0x02, 0, &[0x10, 0x00]),
            record(0x03, 0, &[0, 0, 0, 0]),
            record(0x00, 0, &[1]),
            record(0x01, 0, &[]),
        ]
        .join("\n");

        let image = parse(&text).unwrap();
        assert_eq!(image.bytes_total(), 1);
    }

    #[test]
    fn test_garbage_line_is_rejected() {
        let text = format!("hello\n{}\n", record(0x01, 0, &[]));
        assert!(parse(&text).is_err());

        let text = format!(":0100000G00\n{}\n", record(0x01, 0, &[]));
        assert!(parse(&text).is_err());
    }

    #[test]
    fn test_parse_is_idempotent() {
        let blocks = vec![
            DataBlock::new(0x0800_0000, (0..=255).collect()),
            DataBlock::new(0x0801_0000, vec![0x5A; 40]),
        ];
        let text = encode_blocks(&blocks);

        let first = parse(&text).unwrap();
        let second = parse(&text).unwrap();

        assert_eq!(first, second);
        assert_eq!(first.blocks(), blocks.as_slice());
    }

    #[test]
    fn test_block_continues_across_64k_window() {
        let blocks = vec![DataBlock::new(0x0800_FFF0, vec![0x11; 32])];
        let image = parse(&encode_blocks(&blocks)).unwrap();

        assert_eq!(image.blocks().len(), 1);
        assert_eq!(image.blocks()[0].len(), 32);
    }
}
