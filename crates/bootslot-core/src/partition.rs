//! Slot partitioning
//!
//! Erase block 0 holds the slot table. The rest of the flash is split into
//! equal, erase-block aligned slots laid out back to back, slot 0 (the
//! bootloader) first. Any remainder smaller than one slot stays unused at
//! the top of the part.

use core::ops::Range;

use crate::error::{Error, Result};
use crate::geometry::FlashGeometry;

/// Maximum number of slots the table can describe
pub const MAX_SLOTS: usize = 8;

/// One slot on the flash
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Partition {
    /// Slot index (also the DFU alternate setting that targets it)
    pub index: u8,
    /// First byte of the slot
    pub start: u32,
    /// One past the last byte of the slot
    pub end: u32,
}

impl Partition {
    /// Slot size in bytes
    pub fn size(&self) -> u32 {
        self.end - self.start
    }

    /// Check whether `addr` lies inside the slot
    pub fn contains(&self, addr: u32) -> bool {
        addr >= self.start && addr < self.end
    }

    /// Byte range covered by the slot
    pub fn range(&self) -> Range<u32> {
        self.start..self.end
    }
}

/// The slots of one flash, in address order
pub type PartitionTable = heapless::Vec<Partition, MAX_SLOTS>;

/// Split the flash into `slot_count` slots
///
/// Pure and deterministic: the same geometry and count always give the same
/// table.
pub fn compute_partitions(geometry: &FlashGeometry, slot_count: usize) -> Result<PartitionTable> {
    geometry.validate()?;
    if slot_count == 0 || slot_count > MAX_SLOTS {
        return Err(Error::InvalidSlotCount);
    }

    let block = geometry.erase_block_size;
    let blocks_available = geometry.erase_block_count() - 1;
    let blocks_per_slot = blocks_available / slot_count as u32;
    if blocks_per_slot == 0 {
        return Err(Error::SlotTooSmall);
    }
    let slot_size = blocks_per_slot * block;

    let mut table = PartitionTable::new();
    for i in 0..slot_count {
        let start = block + i as u32 * slot_size;
        // Capacity is MAX_SLOTS and slot_count was checked above
        let _ = table.push(Partition {
            index: i as u8,
            start,
            end: start + slot_size,
        });
    }
    Ok(table)
}

/// The pseudo-partition holding the slot table
///
/// It covers erase block 0 and is addressed through the alternate setting
/// one past the last slot.
pub fn slot_table_partition(geometry: &FlashGeometry, slot_count: usize) -> Partition {
    Partition {
        index: slot_count as u8,
        start: 0,
        end: geometry.erase_block_size,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spi::AddressWidth;

    fn geometry() -> FlashGeometry {
        FlashGeometry::new(1024 * 1024, 256, 64 * 1024, AddressWidth::ThreeByte).unwrap()
    }

    #[test]
    fn test_slots_are_equal_aligned_contiguous() {
        let g = geometry();
        let slots = compute_partitions(&g, 4).unwrap();
        assert_eq!(slots.len(), 4);
        assert_eq!(slots[0].start, g.erase_block_size);
        for (i, s) in slots.iter().enumerate() {
            assert_eq!(s.index as usize, i);
            assert_eq!(s.size(), slots[0].size());
            assert_eq!(s.start % g.erase_block_size, 0);
            assert!(s.end <= g.total_size);
        }
        for pair in slots.windows(2) {
            assert_eq!(pair[0].end, pair[1].start);
        }
        // 15 usable blocks over 4 slots: 3 blocks each, 3 left over
        assert_eq!(slots[0].size(), 3 * 64 * 1024);
    }

    #[test]
    fn test_deterministic() {
        let g = geometry();
        assert_eq!(compute_partitions(&g, 3), compute_partitions(&g, 3));
    }

    #[test]
    fn test_slot_count_limits() {
        let g = geometry();
        assert_eq!(compute_partitions(&g, 0), Err(Error::InvalidSlotCount));
        assert_eq!(compute_partitions(&g, MAX_SLOTS + 1), Err(Error::InvalidSlotCount));

        let tiny = FlashGeometry::new(4 * 64 * 1024, 256, 64 * 1024, AddressWidth::ThreeByte).unwrap();
        assert!(compute_partitions(&tiny, 3).is_ok());
        assert_eq!(compute_partitions(&tiny, 4), Err(Error::SlotTooSmall));
    }

    #[test]
    fn test_table_partition() {
        let g = geometry();
        let t = slot_table_partition(&g, 4);
        assert_eq!(t.index, 4);
        assert_eq!(t.range(), 0..g.erase_block_size);
        assert!(t.contains(0));
        assert!(!t.contains(g.erase_block_size));
    }
}
