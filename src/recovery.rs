//! Three-step recovery procedure run at open time when the header's
//! close-ok flag was never set (spec §4.6):
//!
//! 1. `verify_hashtable_crcs` -- check every page's stored CRC.
//! 2. `blind_scan_rebuild` -- if any page fails, walk the raw file looking
//!    for data-block delimiters (stepping by `gcd(block_size, page_size)`,
//!    mirroring `rebuildHashtables`' pointer increment) and reconstruct the
//!    hash-table slots from each block's embedded owning-page index and key.
//! 3. `recover_data_blocks` -- verify every surviving block pair's CRC and
//!    repair or tombstone-invert as needed.
use std::convert::TryInto;

use crate::block::{block_size, Block, Flavor};
use crate::constants::{HASHTABLE_START_DELIMITER, HEADER_SIZE, SELECTOR_A, SELECTOR_B};
use crate::errors::DbError;
use crate::hashtable::{djb2_hash, HashTable};
use crate::mmap_file::MmapFile;
use crate::page::{self, Page, Slot};

fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        let t = b;
        b = a % b;
        a = t;
    }
    a
}

/// Step 1: every page's stored CRC matches its recomputed one. A missing
/// or wrong delimiter also counts as a failure (spec §4.6 step 1).
pub fn verify_hashtable_crcs(ht: &HashTable) -> bool {
    for i in 0..ht.page_count() {
        match ht.page_crc_valid(i) {
            Ok(true) => continue,
            _ => return false,
        }
    }
    true
}

struct FoundPair {
    owning_page: u64,
    hash: usize,
    addr_a: u64,
    addr_b: u64,
    /// `None` once both halves fail CRC: the key is unrecoverable and the
    /// slot is left empty, matching `invalidateBlocks`.
    selector: Option<u8>,
    tombstoned: bool,
}

/// Step 2: reconstruct every page's slot array purely from the data
/// blocks found by a blind scan of the file (spec §4.6 step 2). Returns
/// one `Page` per distinct `owning_page` index observed, densely indexed
/// from 0 -- gaps are filled with empty pages.
pub fn blind_scan_rebuild(file: &MmapFile, key_size: u64, value_size: u64, n: u16) -> Result<Vec<Page>, DbError> {
    let bsize = block_size(key_size, value_size);
    let page_stride = page::page_size(n);
    let step = gcd(bsize, page_stride).max(1);
    let file_len = file.len();
    let mut found = Vec::new();
    let mut offset = HEADER_SIZE;

    while offset + 8 <= file_len {
        let delim_bytes = file.read_at(offset, 4);
        let delim = u32::from_le_bytes(delim_bytes.try_into().unwrap());

        if delim == HASHTABLE_START_DELIMITER {
            offset += page_stride;
            continue;
        }

        if let Some(flavor) = Flavor::from_start_delimiter(delim) {
            if offset + bsize * 2 <= file_len && flavor.is_a() {
                if let Some(pair) = classify_pair(file, offset, bsize, key_size, value_size, flavor, n) {
                    found.push(pair);
                }
                offset += bsize * 2;
                continue;
            }
            if offset + bsize <= file_len && !flavor.is_a() {
                // a lone B block: its partner A was lost to corruption
                // beyond recognition. Recover from B alone if it verifies.
                if let Some((block, vlen)) = Block::decode(file.read_at(offset, bsize as usize), key_size, value_size) {
                    if block.verify_crc(vlen) {
                        let hash = (djb2_hash(&block.key) % n as u64) as usize;
                        found.push(FoundPair {
                            owning_page: block.owning_page,
                            hash,
                            addr_a: offset.saturating_sub(bsize),
                            addr_b: offset,
                            selector: Some(if flavor.is_live() { SELECTOR_B } else { SELECTOR_A }),
                            tombstoned: !flavor.is_live(),
                        });
                    }
                }
                offset += bsize;
                continue;
            }
        }
        offset += step;
    }

    let page_count = found.iter().map(|f| f.owning_page + 1).max().unwrap_or(0) as usize;
    let mut pages: Vec<Page> = (0..page_count).map(|_| Page::new_empty(n)).collect();
    for pair in found {
        let page = &mut pages[pair.owning_page as usize];
        let selector = match pair.selector {
            Some(s) => s,
            None => continue,
        };
        let mut slot = Slot {
            offset_a: pair.addr_a as i64,
            offset_b: pair.addr_b as i64,
            selector,
        };
        if pair.tombstoned {
            slot.negate();
        }
        page.slots[pair.hash] = slot;
    }
    Ok(pages)
}

/// Classify one (A, B) block pair found at `offset`, choosing whichever
/// half verifies -- block B is preferred when both verify, since
/// `KISSDB_put` always finishes its dual write by committing B last in
/// the common case (spec §5.2 decision; mirrors `rebuildHashtables`'s
/// static preference for block B).
fn classify_pair(file: &MmapFile, offset: u64, bsize: u64, key_size: u64, value_size: u64, flavor_a: Flavor, n: u16) -> Option<FoundPair> {
    let a = Block::decode(file.read_at(offset, bsize as usize), key_size, value_size);
    let b = Block::decode(file.read_at(offset + bsize, bsize as usize), key_size, value_size);

    let a_ok = matches!(&a, Some((blk, vlen)) if blk.verify_crc(*vlen));
    let b_ok = matches!(&b, Some((blk, vlen)) if blk.verify_crc(*vlen));

    let tombstoned = !flavor_a.is_live();

    let (chosen_block, selector) = if b_ok {
        (b.unwrap().0, if tombstoned { SELECTOR_A } else { SELECTOR_B })
    } else if a_ok {
        (a.unwrap().0, SELECTOR_A)
    } else {
        return None;
    };

    let hash = (djb2_hash(&chosen_block.key) % n as u64) as usize;
    Some(FoundPair {
        owning_page: chosen_block.owning_page,
        hash,
        addr_a: offset,
        addr_b: offset + bsize,
        selector: Some(selector),
        tombstoned,
    })
}

/// Step 3: walk every occupied slot of a (just-rebuilt or CRC-trusted)
/// hash table and verify its current block's CRC, repairing from the
/// backup block if the primary is torn (spec §4.6 step 3). Returns the
/// number of block pairs that could not be recovered at all.
pub fn recover_data_blocks(ht: &mut HashTable, file: &mut MmapFile) -> Result<u64, DbError> {
    let mut invalidated = 0u64;
    let key_size = ht.key_size();
    let value_size = ht.value_size();
    let n = ht.slot_count();
    let bsize = block_size(key_size, value_size) as usize;

    for page_idx in 0..ht.page_count() {
        let mut page = ht.read_page(page_idx)?;
        let mut changed = false;
        for hash in 0..n as usize {
            let slot = page.slots[hash];
            if slot.is_empty() {
                continue;
            }
            let addr_a = slot.offset_a.unsigned_abs();
            let addr_b = slot.offset_b.unsigned_abs();
            let a = Block::decode(file.read_at(addr_a, bsize), key_size, value_size);
            let b = Block::decode(file.read_at(addr_b, bsize), key_size, value_size);
            let a_ok = matches!(&a, Some((blk, vlen)) if blk.verify_crc(*vlen));
            let b_ok = matches!(&b, Some((blk, vlen)) if blk.verify_crc(*vlen));

            if slot.is_tombstoned() {
                if !a_ok && !b_ok {
                    page.slots[hash] = Slot::EMPTY;
                    changed = true;
                    invalidated += 1;
                }
                continue;
            }

            let want_current_ok = if slot.selector == SELECTOR_A { a_ok } else { b_ok };
            if want_current_ok {
                continue;
            }
            let other_ok = if slot.selector == SELECTOR_A { b_ok } else { a_ok };
            if other_ok {
                page.slots[hash].selector = if slot.selector == SELECTOR_A { SELECTOR_B } else { SELECTOR_A };
                changed = true;
            } else {
                page.slots[hash] = Slot::EMPTY;
                changed = true;
                invalidated += 1;
            }
        }
        if changed {
            ht.write_page(page_idx, &page, file)?;
        }
    }
    Ok(invalidated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shm::ShmRegion;
    use tempfile::tempdir;

    #[test]
    fn gcd_matches_known_values() {
        assert_eq!(gcd(12, 18), 6);
        assert_eq!(gcd(17, 5), 1);
    }

    #[test]
    fn verify_passes_on_freshly_written_table() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("db.kdb");
        let mut file = MmapFile::open(&db_path, true, false).unwrap();
        let mirror = format!("recovery-test-{}", std::process::id());
        let mut ht = HashTable::create(&mirror, 8, 16, 16, &mut file, 4096).unwrap();
        ht.put(&mut file, b"k", b"v").unwrap();
        assert!(verify_hashtable_crcs(&ht));
        ShmRegion::unlink(&mirror).unwrap();
    }

    #[test]
    fn blind_scan_recovers_live_key_after_simulated_corruption() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("db.kdb");
        let mut file = MmapFile::open(&db_path, true, false).unwrap();
        let mirror = format!("recovery-test-scan-{}", std::process::id());
        let mut ht = HashTable::create(&mirror, 8, 16, 16, &mut file, 4096).unwrap();
        ht.put(&mut file, b"k", b"v").unwrap();

        let pages = blind_scan_rebuild(&file, 16, 16, 8).unwrap();
        assert_eq!(pages.len(), 1);
        let hash = (djb2_hash(b"k") % 8) as usize;
        assert!(!pages[0].slots[hash].is_empty());
        ShmRegion::unlink(&mirror).unwrap();
    }
}
