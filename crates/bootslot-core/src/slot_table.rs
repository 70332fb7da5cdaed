//! Slot table (boot jump table) codec
//!
//! The table sits at offset 0 of the flash and holds one fixed-size record
//! per slot. Each record is a tiny configuration command stream the FPGA
//! boot logic executes to jump to the slot:
//!
//! ```text
//! 7E AA 99 7E          preamble
//! 92 00 00             boot mode
//! 44 03 AA AA AA       boot address (44 04 AA AA AA AA with 4-byte width)
//! 82 00 00             bank offset
//! 01 08                reboot
//! 00 ...               padding up to 32 bytes
//! ```
//!
//! The table is always rebuilt from the partition list and written in one
//! pass, never patched in place.

use crate::error::{Error, Result};
use crate::partition::{Partition, MAX_SLOTS};
use crate::spi::AddressWidth;

/// Size of one record
pub const RECORD_SIZE: usize = 32;

/// Largest encoded table
pub const MAX_TABLE_SIZE: usize = RECORD_SIZE * MAX_SLOTS;

/// Sync word opening each record
pub const PREAMBLE: [u8; 4] = [0x7E, 0xAA, 0x99, 0x7E];

const CMD_BOOT_MODE: [u8; 3] = [0x92, 0x00, 0x00];
const CMD_BOOT_ADDRESS: u8 = 0x44;
const CMD_BANK_OFFSET: [u8; 3] = [0x82, 0x00, 0x00];
const CMD_REBOOT: [u8; 2] = [0x01, 0x08];

/// An encoded slot table
pub type SlotTable = heapless::Vec<u8, MAX_TABLE_SIZE>;

/// One decoded record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootRecord {
    /// Address the record jumps to
    pub boot_address: u32,
    /// Width the address was encoded with
    pub address_width: AddressWidth,
}

fn encode_record(boot_address: u32, width: AddressWidth) -> Result<[u8; RECORD_SIZE]> {
    if width == AddressWidth::None || u64::from(boot_address) >= width.max_size() {
        return Err(Error::AddressOutOfBounds);
    }

    let mut rec = [0u8; RECORD_SIZE];
    let mut pos = 0;
    let mut put = |bytes: &[u8]| {
        rec[pos..pos + bytes.len()].copy_from_slice(bytes);
        pos += bytes.len();
    };

    put(&PREAMBLE);
    put(&CMD_BOOT_MODE);
    put(&[CMD_BOOT_ADDRESS, width.bytes()]);
    let mut addr = [0u8; 4];
    let n = width.encode(boot_address, &mut addr);
    put(&addr[..n]);
    put(&CMD_BANK_OFFSET);
    put(&CMD_REBOOT);
    Ok(rec)
}

/// Encode the slot table for `partitions`
///
/// Records follow partition order, each pointing at the partition start.
pub fn encode_slot_table(partitions: &[Partition], address_width: AddressWidth) -> Result<SlotTable> {
    if partitions.is_empty() || partitions.len() > MAX_SLOTS {
        return Err(Error::InvalidSlotCount);
    }

    let mut table = SlotTable::new();
    for p in partitions {
        let rec = encode_record(p.start, address_width)?;
        table
            .extend_from_slice(&rec)
            .map_err(|_| Error::TableTooLarge)?;
    }
    Ok(table)
}

fn take_prefix<'a>(rest: &mut &'a [u8], bytes: &[u8]) -> Result<()> {
    let current: &'a [u8] = *rest;
    match current.strip_prefix(bytes) {
        Some(tail) => {
            *rest = tail;
            Ok(())
        }
        None => Err(Error::InvalidSlotTable),
    }
}

fn decode_record(rec: &[u8]) -> Result<BootRecord> {
    let mut rest = rec;
    take_prefix(&mut rest, &PREAMBLE)?;
    take_prefix(&mut rest, &CMD_BOOT_MODE)?;
    take_prefix(&mut rest, &[CMD_BOOT_ADDRESS])?;

    let width = rest
        .first()
        .and_then(|&b| AddressWidth::from_bytes(b))
        .filter(|w| *w != AddressWidth::None)
        .ok_or(Error::InvalidSlotTable)?;
    rest = &rest[1..];
    let boot_address = width.decode(rest).ok_or(Error::InvalidSlotTable)?;
    rest = &rest[width.bytes() as usize..];

    take_prefix(&mut rest, &CMD_BANK_OFFSET)?;
    take_prefix(&mut rest, &CMD_REBOOT)?;
    if rest.iter().any(|&b| b != 0) {
        return Err(Error::InvalidSlotTable);
    }

    Ok(BootRecord {
        boot_address,
        address_width: width,
    })
}

/// Decode a slot table read back from flash
///
/// Decoding stops at the first fully erased (all `0xFF`) record, so a whole
/// erase block can be passed in.
pub fn decode_slot_table(bytes: &[u8]) -> Result<heapless::Vec<BootRecord, MAX_SLOTS>> {
    let mut records = heapless::Vec::new();
    for rec in bytes.chunks(RECORD_SIZE) {
        if rec.iter().all(|&b| b == 0xFF) {
            break;
        }
        if rec.len() != RECORD_SIZE {
            return Err(Error::InvalidSlotTable);
        }
        records
            .push(decode_record(rec)?)
            .map_err(|_| Error::TableTooLarge)?;
    }
    if records.is_empty() {
        return Err(Error::InvalidSlotTable);
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::FlashGeometry;
    use crate::partition::compute_partitions;

    #[test]
    fn test_record_layout_3byte() {
        let slots = [Partition {
            index: 0,
            start: 0x01_0000,
            end: 0x05_0000,
        }];
        let table = encode_slot_table(&slots, AddressWidth::ThreeByte).unwrap();
        assert_eq!(table.len(), RECORD_SIZE);
        assert_eq!(
            &table[..17],
            &[
                0x7E, 0xAA, 0x99, 0x7E, 0x92, 0x00, 0x00, 0x44, 0x03, 0x01, 0x00, 0x00, 0x82,
                0x00, 0x00, 0x01, 0x08
            ]
        );
        assert!(table[17..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_record_layout_4byte() {
        let slots = [Partition {
            index: 0,
            start: 0x0100_0000,
            end: 0x0200_0000,
        }];
        let table = encode_slot_table(&slots, AddressWidth::FourByte).unwrap();
        assert_eq!(&table[7..13], &[0x44, 0x04, 0x01, 0x00, 0x00, 0x00]);
        assert_eq!(&table[13..18], &[0x82, 0x00, 0x00, 0x01, 0x08]);
    }

    #[test]
    fn test_table_matches_partitions() {
        let g = FlashGeometry::default();
        let slots = compute_partitions(&g, 4).unwrap();
        let table = encode_slot_table(&slots, g.address_width).unwrap();
        assert_eq!(table.len(), 4 * RECORD_SIZE);

        let records = decode_slot_table(&table).unwrap();
        assert_eq!(records.len(), 4);
        for (rec, slot) in records.iter().zip(slots.iter()) {
            assert_eq!(rec.boot_address, slot.start);
            assert_eq!(rec.address_width, AddressWidth::ThreeByte);
        }
    }

    #[test]
    fn test_decode_stops_at_erased() {
        let g = FlashGeometry::default();
        let slots = compute_partitions(&g, 2).unwrap();
        let table = encode_slot_table(&slots, g.address_width).unwrap();

        let mut block = [0xFFu8; 256];
        block[..table.len()].copy_from_slice(&table);
        assert_eq!(decode_slot_table(&block).unwrap().len(), 2);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert_eq!(decode_slot_table(&[0xFF; 64]), Err(Error::InvalidSlotTable));
        let mut bad = [0u8; RECORD_SIZE];
        bad[..4].copy_from_slice(&PREAMBLE);
        assert_eq!(decode_slot_table(&bad), Err(Error::InvalidSlotTable));
    }

    #[test]
    fn test_address_must_fit_width() {
        let slots = [Partition {
            index: 0,
            start: 0x0100_0000,
            end: 0x0101_0000,
        }];
        assert_eq!(
            encode_slot_table(&slots, AddressWidth::ThreeByte),
            Err(Error::AddressOutOfBounds)
        );
        assert_eq!(encode_slot_table(&[], AddressWidth::ThreeByte), Err(Error::InvalidSlotCount));
    }
}
