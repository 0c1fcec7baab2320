//! Data block layout: the on-disk unit holding one (key, value) pair plus
//! delimiters, CRC and owning-page index (spec §3, §4.3, §6, GLOSSARY).
//! Blocks are always allocated in pairs (A, B) for a single key; which one
//! is "live" vs. "tombstoned" is encoded purely in the delimiter constants
//! so a blind scan of the raw file (recovery, §4.6) can classify a block
//! without consulting anything else.
use crate::constants::*;

/// Which of the eight delimiter pairs a block currently carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flavor {
    ALive,
    BLive,
    ADeleted,
    BDeleted,
}

impl Flavor {
    pub fn start_delimiter(self) -> u32 {
        match self {
            Flavor::ALive => DATA_BLOCK_A_START_DELIMITER,
            Flavor::BLive => DATA_BLOCK_B_START_DELIMITER,
            Flavor::ADeleted => DATA_BLOCK_A_DELETED_START_DELIMITER,
            Flavor::BDeleted => DATA_BLOCK_B_DELETED_START_DELIMITER,
        }
    }

    pub fn end_delimiter(self) -> u32 {
        match self {
            Flavor::ALive => DATA_BLOCK_A_END_DELIMITER,
            Flavor::BLive => DATA_BLOCK_B_END_DELIMITER,
            Flavor::ADeleted => DATA_BLOCK_A_DELETED_END_DELIMITER,
            Flavor::BDeleted => DATA_BLOCK_B_DELETED_END_DELIMITER,
        }
    }

    pub fn is_live(self) -> bool {
        matches!(self, Flavor::ALive | Flavor::BLive)
    }

    pub fn is_a(self) -> bool {
        matches!(self, Flavor::ALive | Flavor::ADeleted)
    }

    pub fn tombstoned(self) -> Flavor {
        match self {
            Flavor::ALive | Flavor::ADeleted => Flavor::ADeleted,
            Flavor::BLive | Flavor::BDeleted => Flavor::BDeleted,
        }
    }

    /// Classify a block purely from its start delimiter, the way recovery's
    /// blind scan must (spec §4.6 step 2).
    pub fn from_start_delimiter(value: u32) -> Option<Flavor> {
        match value {
            DATA_BLOCK_A_START_DELIMITER => Some(Flavor::ALive),
            DATA_BLOCK_B_START_DELIMITER => Some(Flavor::BLive),
            DATA_BLOCK_A_DELETED_START_DELIMITER => Some(Flavor::ADeleted),
            DATA_BLOCK_B_DELETED_START_DELIMITER => Some(Flavor::BDeleted),
            _ => None,
        }
    }
}

/// Fixed byte layout of a data block body, sized for given key/value caps:
/// `start(8) | crc(8) | key(key_size) | value_len(4) | value(value_size) |
/// owning_page(8) | end(8)`.
pub fn block_size(key_size: u64, value_size: u64) -> u64 {
    8 + 8 + key_size + 4 + value_size + 8 + 8
}

#[derive(Debug, Clone)]
pub struct Block {
    pub flavor: Flavor,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub owning_page: u64,
    pub crc: u32,
}

impl Block {
    /// Build a live block for `flavor` (must be `ALive`/`BLive`) holding
    /// `key`/`value`, computing the CRC over the committed domain.
    pub fn new_live(flavor: Flavor, key: &[u8], value: &[u8], owning_page: u64, key_size: u64, value_size: u64) -> Block {
        let mut key_buf = vec![0u8; key_size as usize];
        key_buf[..key.len()].copy_from_slice(key);
        let mut value_buf = vec![0u8; value_size as usize];
        value_buf[..value.len()].copy_from_slice(value);
        let crc = compute_crc(&key_buf, value.len() as u32, &value_buf, owning_page);
        Block {
            flavor,
            key: key_buf,
            value: value_buf,
            owning_page,
            crc,
        }
    }

    /// Build a tombstoned block: value bytes zeroed, key bytes kept (the
    /// key is needed by hash-table rebuild, per original source behavior
    /// carried forward in SPEC_FULL.md §5.2).
    pub fn new_tombstone(flavor: Flavor, key: &[u8], owning_page: u64, key_size: u64, value_size: u64) -> Block {
        let mut key_buf = vec![0u8; key_size as usize];
        key_buf[..key.len()].copy_from_slice(key);
        let value_buf = vec![0u8; value_size as usize];
        let crc = compute_crc(&key_buf, 0, &value_buf, owning_page);
        Block {
            flavor: flavor.tombstoned(),
            key: key_buf,
            value: value_buf,
            owning_page,
            crc,
        }
    }

    pub fn value_len(&self) -> u32 {
        if self.flavor.is_live() {
            // value length is stored explicitly; recomputed at decode time.
            self.value.len() as u32
        } else {
            0
        }
    }

    /// Verify this block's stored CRC against its own (key, value, page)
    /// domain -- spec invariant 1.
    pub fn verify_crc(&self, stored_value_len: u32) -> bool {
        self.crc == compute_crc(&self.key, stored_value_len, &self.value, self.owning_page)
    }

    pub fn encode(&self, buf: &mut [u8], key_size: u64, value_size: u64) {
        let size = block_size(key_size, value_size) as usize;
        assert!(buf.len() >= size);
        let value_len = if self.flavor.is_live() {
            self.value.len() as u32
        } else {
            0
        };
        write_delim(&mut buf[0..8], self.flavor.start_delimiter());
        buf[8..16].copy_from_slice(&(self.crc as u64).to_le_bytes());
        let key_off = 16;
        let vlen_off = key_off + key_size as usize;
        let val_off = vlen_off + 4;
        let page_off = val_off + value_size as usize;
        let end_off = page_off + 8;
        buf[key_off..vlen_off].copy_from_slice(&self.key);
        buf[vlen_off..val_off].copy_from_slice(&value_len.to_le_bytes());
        buf[val_off..page_off].copy_from_slice(&self.value);
        buf[page_off..end_off].copy_from_slice(&self.owning_page.to_le_bytes());
        write_delim(&mut buf[end_off..end_off + 8], self.flavor.end_delimiter());
    }

    pub fn decode(buf: &[u8], key_size: u64, value_size: u64) -> Option<(Block, u32)> {
        let size = block_size(key_size, value_size) as usize;
        if buf.len() < size {
            return None;
        }
        let start = read_delim(&buf[0..8]);
        let flavor = Flavor::from_start_delimiter(start)?;
        let crc = u64::from_le_bytes(buf[8..16].try_into().unwrap()) as u32;
        let key_off = 16;
        let vlen_off = key_off + key_size as usize;
        let val_off = vlen_off + 4;
        let page_off = val_off + value_size as usize;
        let end_off = page_off + 8;
        let key = buf[key_off..vlen_off].to_vec();
        let value_len = u32::from_le_bytes(buf[vlen_off..val_off].try_into().unwrap());
        let value = buf[val_off..page_off].to_vec();
        let owning_page = u64::from_le_bytes(buf[page_off..end_off].try_into().unwrap());
        Some((
            Block {
                flavor,
                key,
                value,
                owning_page,
                crc,
            },
            value_len,
        ))
    }
}

fn compute_crc(key: &[u8], value_len: u32, value: &[u8], owning_page: u64) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(key);
    hasher.update(&value_len.to_le_bytes());
    hasher.update(value);
    hasher.update(&owning_page.to_le_bytes());
    hasher.finalize()
}

fn write_delim(buf: &mut [u8], value: u32) {
    buf[0..4].copy_from_slice(&value.to_le_bytes());
    buf[4..8].copy_from_slice(&0u32.to_le_bytes());
}

fn read_delim(buf: &[u8]) -> u32 {
    u32::from_le_bytes(buf[0..4].try_into().unwrap())
}
