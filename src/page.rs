//! Hash-table page layout: a fixed array of slots with start/end delimiters
//! and a CRC over the slot array (spec §3, §4.2, §6, GLOSSARY). The last
//! slot of every page is reserved as a forward link to the next page in the
//! chain and is never used for user data.
use crate::constants::*;

/// One hash-table slot: two file offsets and a selector saying which one
/// currently holds the committed-latest value. A negative offset marks a
/// tombstoned-but-reusable block pair (spec invariant 3); zero means empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Slot {
    pub offset_a: i64,
    pub offset_b: i64,
    pub selector: u8,
}

impl Slot {
    pub const EMPTY: Slot = Slot {
        offset_a: 0,
        offset_b: 0,
        selector: SELECTOR_A,
    };

    pub fn is_empty(&self) -> bool {
        self.offset_a == 0 && self.offset_b == 0
    }

    /// The offset currently selected as the committed value, ignoring sign
    /// (tombstone state). `None` for an empty slot.
    pub fn current_offset(&self) -> Option<i64> {
        if self.is_empty() {
            return None;
        }
        Some(if self.selector == SELECTOR_A {
            self.offset_a
        } else {
            self.offset_b
        })
    }

    pub fn backup_offset(&self) -> Option<i64> {
        if self.is_empty() {
            return None;
        }
        Some(if self.selector == SELECTOR_A {
            self.offset_b
        } else {
            self.offset_a
        })
    }

    /// A slot is tombstoned iff its current offset is negative (spec
    /// invariant 3): the block pair still physically exists, reusable by
    /// the next insert hashing to this slot.
    pub fn is_tombstoned(&self) -> bool {
        matches!(self.current_offset(), Some(o) if o < 0)
    }

    pub fn negate(&mut self) {
        self.offset_a = -self.offset_a;
        self.offset_b = -self.offset_b;
        self.selector = SELECTOR_A;
    }
}

const SLOT_SIZE: usize = 24;

fn encode_slot(buf: &mut [u8], slot: &Slot) {
    buf[0..8].copy_from_slice(&slot.offset_a.to_le_bytes());
    buf[8..16].copy_from_slice(&slot.offset_b.to_le_bytes());
    buf[16..24].copy_from_slice(&(slot.selector as u64).to_le_bytes());
}

fn decode_slot(buf: &[u8]) -> Slot {
    Slot {
        offset_a: i64::from_le_bytes(buf[0..8].try_into().unwrap()),
        offset_b: i64::from_le_bytes(buf[8..16].try_into().unwrap()),
        selector: u64::from_le_bytes(buf[16..24].try_into().unwrap()) as u8,
    }
}

/// Number of slots stored on disk/in shared memory: `n` user slots plus one
/// reserved link slot.
pub fn slot_count_with_link(n: u16) -> usize {
    n as usize + 1
}

/// Byte size of the slot array only (the CRC domain).
pub fn slot_array_size(n: u16) -> usize {
    slot_count_with_link(n) * SLOT_SIZE
}

/// Total page size: header + slot array + trailer, rounded up to a whole
/// multiple of the system page size (spec §4.2: "a small integer multiple
/// of the system page size").
pub fn page_size(n: u16) -> u64 {
    let raw = 8 + slot_array_size(n) + 8;
    let granule = *OS_PAGE_SIZE;
    let pages = (raw + granule - 1) / granule;
    (pages * granule) as u64
}

pub struct Page {
    pub slots: Vec<Slot>,
}

impl Page {
    pub fn new_empty(n: u16) -> Page {
        Page {
            slots: vec![Slot::EMPTY; slot_count_with_link(n)],
        }
    }

    pub fn link_slot_index(n: u16) -> usize {
        n as usize
    }

    pub fn crc(&self) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        let mut buf = vec![0u8; SLOT_SIZE];
        for slot in &self.slots {
            encode_slot(&mut buf, slot);
            hasher.update(&buf);
        }
        hasher.finalize()
    }

    /// Encode header + slot array + trailer into `buf`; `buf` may be larger
    /// than the logical content (it is zero-padded out to `page_size`
    /// already by the caller's mmap allocation).
    pub fn encode(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&HASHTABLE_START_DELIMITER.to_le_bytes());
        buf[4..8].copy_from_slice(&0u32.to_le_bytes());
        let crc = self.crc();
        buf[8..16].copy_from_slice(&(crc as u64).to_le_bytes());
        let slots_off = 16;
        let mut off = slots_off;
        for slot in &self.slots {
            encode_slot(&mut buf[off..off + SLOT_SIZE], slot);
            off += SLOT_SIZE;
        }
        buf[off..off + 4].copy_from_slice(&HASHTABLE_END_DELIMITER.to_le_bytes());
        buf[off + 4..off + 8].copy_from_slice(&0u32.to_le_bytes());
    }

    /// Decode a page without verifying its CRC (caller decides: normal
    /// lookup trusts the mirror; recovery's verification step checks CRC
    /// explicitly via `stored_crc`/`crc`).
    pub fn decode(buf: &[u8], n: u16) -> Option<Page> {
        let start = u32::from_le_bytes(buf[0..4].try_into().ok()?);
        if start != HASHTABLE_START_DELIMITER {
            return None;
        }
        let slots_off = 16;
        let count = slot_count_with_link(n);
        let end_off = slots_off + count * SLOT_SIZE;
        if buf.len() < end_off + 8 {
            return None;
        }
        let end = u32::from_le_bytes(buf[end_off..end_off + 4].try_into().ok()?);
        if end != HASHTABLE_END_DELIMITER {
            return None;
        }
        let mut slots = Vec::with_capacity(count);
        let mut off = slots_off;
        for _ in 0..count {
            slots.push(decode_slot(&buf[off..off + SLOT_SIZE]));
            off += SLOT_SIZE;
        }
        Some(Page { slots })
    }

    pub fn stored_crc(buf: &[u8]) -> u32 {
        u64::from_le_bytes(buf[8..16].try_into().unwrap()) as u32
    }

    /// Whether start/end delimiters are present, independent of CRC --
    /// used by recovery's first pass (spec §4.6 step 1) and by the blind
    /// scan that identifies page boundaries during a rebuild.
    pub fn has_delimiters(buf: &[u8], n: u16) -> bool {
        let count = slot_count_with_link(n);
        let end_off = 16 + count * SLOT_SIZE;
        if buf.len() < end_off + 8 {
            return false;
        }
        let start = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        let end = u32::from_le_bytes(buf[end_off..end_off + 4].try_into().unwrap());
        start == HASHTABLE_START_DELIMITER || end == HASHTABLE_END_DELIMITER
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_bytes() {
        let mut page = Page::new_empty(4);
        page.slots[0] = Slot {
            offset_a: 128,
            offset_b: 256,
            selector: SELECTOR_B,
        };
        let size = page_size(4) as usize;
        let mut buf = vec![0u8; size];
        page.encode(&mut buf);
        assert_eq!(Page::stored_crc(&buf), page.crc());
        let decoded = Page::decode(&buf, 4).unwrap();
        assert_eq!(decoded.slots[0], page.slots[0]);
        assert!(Page::has_delimiters(&buf, 4));
    }

    #[test]
    fn crc_changes_when_slots_change() {
        let mut page = Page::new_empty(4);
        let crc0 = page.crc();
        page.slots[1].offset_a = 42;
        assert_ne!(crc0, page.crc());
    }

    #[test]
    fn tombstone_roundtrip() {
        let mut slot = Slot {
            offset_a: 4096,
            offset_b: 4096 + 100,
            selector: SELECTOR_A,
        };
        assert!(!slot.is_tombstoned());
        slot.negate();
        assert!(slot.is_tombstoned());
        assert_eq!(slot.current_offset(), Some(-4096));
    }
}
