//! Page-chain hash table: djb2 hashing, per-page slot lookup, and the
//! insert/overwrite/delete/tombstone-reuse logic (spec §4.2-§4.4, GLOSSARY).
//!
//! Pages are appended to the main data file exactly like data blocks, and
//! mirrored into a `ShmRegion` so that every attached process can resolve a
//! lookup without re-reading the file's hash-table pages on every call --
//! only the data block itself is read from the file. This mirrors
//! `kissdb.c`'s split between `db->mappedDb` (the file) and
//! `db->hashTables` (the shared, in-memory array rebuilt at open time).
use crate::block::{block_size, Block, Flavor};
use crate::constants::{HASHTABLE_START_DELIMITER, SELECTOR_A, SELECTOR_B};
use crate::errors::DbError;
use crate::mmap_file::MmapFile;
use crate::page::{self, Page, Slot};
use crate::shm::ShmRegion;

/// djb2: `h = h*33 + byte`, seeded at 5381 (spec §6, GLOSSARY "djb2").
pub fn djb2_hash(key: &[u8]) -> u64 {
    let mut hash: u64 = 5381;
    for &b in key {
        hash = hash.wrapping_shl(5).wrapping_add(hash).wrapping_add(b as u64);
    }
    hash
}

/// Walk the page chain starting at `first_offset` by following each
/// page's reserved link slot, the way the normal (non-recovery) open path
/// discovers existing pages (spec §4.2 "forward link", mirrors the
/// `shmCreator`-only discovery loop in the original open routine).
pub fn discover_page_chain(file: &MmapFile, first_offset: u64, n: u16) -> Vec<u64> {
    let stride = page::page_size(n) as usize;
    let mut offsets = Vec::new();
    let mut offset = first_offset;
    loop {
        if offset as usize + stride > file.len() as usize {
            break;
        }
        let buf = file.read_at(offset, stride);
        if !Page::has_delimiters(buf, n) {
            break;
        }
        offsets.push(offset);
        let page = match Page::decode(buf, n) {
            Some(p) => p,
            None => break,
        };
        let link = page.slots[Page::link_slot_index(n)].offset_a;
        if link <= 0 {
            break;
        }
        offset = link as u64;
    }
    offsets
}

/// Strip the trailing zero padding a fixed-size key buffer carries on disk
/// (spec §6 "key (fixed max-key-length buffer, zero-padded)") back down to
/// the logical key bytes the caller wrote. Used wherever a stored key is
/// surfaced to a caller rather than compared against a query of known
/// length (e.g. listing), since the query-driven comparisons in
/// `keys_equal` never need this.
fn trim_key_padding(stored: &[u8]) -> Vec<u8> {
    let end = stored.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
    stored[..end].to_vec()
}

fn keys_equal(stored: &[u8], query: &[u8], key_size: u64) -> bool {
    if query.len() as u64 > key_size {
        return false;
    }
    &stored[..query.len()] == query && stored[query.len()..].iter().all(|&b| b == 0)
}

pub struct HashTable {
    n: u16,
    key_size: u64,
    value_size: u64,
    mirror: ShmRegion,
    mirror_name: String,
    page_count: usize,
    /// Byte offset of each page within the main data file, in chain order.
    file_offsets: Vec<u64>,
}

impl HashTable {
    fn page_stride(&self) -> u64 {
        page::page_size(self.n)
    }

    fn mirror_capacity(page_count: usize, n: u16) -> u64 {
        (page_count as u64).max(1) * page::page_size(n)
    }

    /// Create a brand-new, empty hash table (first opener of a fresh
    /// database file): one page, mirrored and written at `first_page_offset`.
    pub fn create(
        mirror_name: &str,
        n: u16,
        key_size: u64,
        value_size: u64,
        file: &mut MmapFile,
        first_page_offset: u64,
    ) -> Result<HashTable, DbError> {
        let (mirror, _) = ShmRegion::create_or_open(mirror_name, Self::mirror_capacity(1, n))?;
        let mut ht = HashTable {
            n,
            key_size,
            value_size,
            mirror,
            mirror_name: mirror_name.to_string(),
            page_count: 0,
            file_offsets: Vec::new(),
        };
        let page = Page::new_empty(n);
        file.grow_to(first_page_offset + ht.page_stride())?;
        ht.file_offsets.push(first_page_offset);
        ht.page_count = 1;
        ht.write_page(0, &page, file)?;
        Ok(ht)
    }

    /// Attach to a hash table mirror, given the page file offsets
    /// discovered at open time (normal path: walk forward links starting
    /// from page 0; recovery path: a blind-scan-derived chain, spec §4.6).
    ///
    /// The mirror shm object may or may not still be live: another handle
    /// already holding the database keeps it populated, but the *first*
    /// handle to reopen a database after every prior handle closed finds
    /// it unlinked (spec §4.5 "last closer unlinks"). In that case this
    /// call recreates it and repopulates it by copying each page's bytes
    /// straight out of the file at its durable offset -- the file, not the
    /// mirror, is the record of truth across a full close/reopen cycle.
    pub fn attach(
        mirror_name: &str,
        n: u16,
        key_size: u64,
        value_size: u64,
        file_offsets: Vec<u64>,
        file: &MmapFile,
    ) -> Result<HashTable, DbError> {
        let page_count = file_offsets.len();
        let (mirror, created) = ShmRegion::create_or_open(mirror_name, Self::mirror_capacity(page_count, n))?;
        let mut ht = HashTable {
            n,
            key_size,
            value_size,
            mirror,
            mirror_name: mirror_name.to_string(),
            page_count,
            file_offsets,
        };
        if created {
            let stride = ht.page_stride() as usize;
            for i in 0..ht.page_count {
                let off = ht.file_offsets[i];
                let buf = file.read_at(off, stride).to_vec();
                ht.page_bytes_mut(i).copy_from_slice(&buf);
            }
        }
        Ok(ht)
    }

    pub fn page_count(&self) -> usize {
        self.page_count
    }

    pub fn file_offsets(&self) -> &[u64] {
        &self.file_offsets
    }

    fn page_bytes(&self, index: usize) -> &[u8] {
        let stride = self.page_stride() as usize;
        let start = index * stride;
        &self.mirror.as_slice()[start..start + stride]
    }

    fn page_bytes_mut(&mut self, index: usize) -> &mut [u8] {
        let stride = self.page_stride() as usize;
        let start = index * stride;
        &mut self.mirror.as_mut_slice()[start..start + stride]
    }

    pub fn read_page(&self, index: usize) -> Result<Page, DbError> {
        Page::decode(self.page_bytes(index), self.n).ok_or(DbError::CorruptDbFile("hash table page missing delimiters"))
    }

    /// Write a page into both the shared mirror and the main file copy at
    /// its tracked offset (spec §4.2 invariant: the file is the durable
    /// record; the mirror exists only to avoid re-reading it on lookups).
    pub fn write_page(&mut self, index: usize, page: &Page, file: &mut MmapFile) -> Result<(), DbError> {
        let stride = self.page_stride() as usize;
        let mut buf = vec![0u8; stride];
        page.encode(&mut buf);
        self.page_bytes_mut(index).copy_from_slice(&buf);
        let file_off = self.file_offsets[index];
        file.write_at(file_off, &buf);
        Ok(())
    }

    /// Append a new, empty page to both file and mirror, linking it from
    /// the previous page's reserved slot (spec §4.2 "forward link").
    pub fn add_page(&mut self, file: &mut MmapFile) -> Result<usize, DbError> {
        let new_index = self.page_count;
        let new_file_offset = file.len();
        let stride = self.page_stride();
        file.grow_to(new_file_offset + stride)?;

        let new_capacity = Self::mirror_capacity(new_index + 1, self.n);
        if (self.mirror.len() as u64) < new_capacity {
            self.mirror.grow(new_capacity)?;
        }

        self.file_offsets.push(new_file_offset);
        self.page_count += 1;

        let empty = Page::new_empty(self.n);
        self.write_page(new_index, &empty, file)?;

        if new_index > 0 {
            let mut prev = self.read_page(new_index - 1)?;
            let link = Page::link_slot_index(self.n);
            prev.slots[link].offset_a = new_file_offset as i64;
            self.write_page(new_index - 1, &prev, file)?;
        }
        Ok(new_index)
    }

    /// Pick up any pages another handle appended to the chain since this
    /// one last looked (spec §3 "[hash-table mirror] grown in place by
    /// later openers as new pages are discovered"). Must run after the
    /// caller has already remapped the file to its current length, so the
    /// newly appended page's bytes are visible to `file.read_at`.
    pub fn resync_pages(&mut self, file: &MmapFile) -> Result<(), DbError> {
        loop {
            let last_idx = self.page_count - 1;
            let link = self.read_page(last_idx)?.slots[Page::link_slot_index(self.n)].offset_a;
            if link <= 0 {
                return Ok(());
            }
            let off = link as u64;
            let stride = self.page_stride() as usize;
            if off as usize + stride > file.len() as usize {
                return Ok(());
            }
            let buf = file.read_at(off, stride).to_vec();
            if !Page::has_delimiters(&buf, self.n) {
                return Ok(());
            }
            let new_index = self.page_count;
            let new_capacity = Self::mirror_capacity(new_index + 1, self.n);
            if (self.mirror.len() as u64) < new_capacity {
                self.mirror.grow(new_capacity)?;
            }
            self.file_offsets.push(off);
            self.page_count += 1;
            self.page_bytes_mut(new_index).copy_from_slice(&buf);
        }
    }

    fn hash_index(&self, key: &[u8]) -> usize {
        (djb2_hash(key) % self.n as u64) as usize
    }

    fn block_size(&self) -> u64 {
        block_size(self.key_size, self.value_size)
    }

    fn read_block(&self, file: &MmapFile, offset: u64) -> Result<(Block, u32), DbError> {
        let size = self.block_size() as usize;
        Block::decode(file.read_at(offset, size), self.key_size, self.value_size)
            .ok_or(DbError::CorruptDbFile("data block missing delimiters"))
    }

    fn write_block_pair(&self, file: &mut MmapFile, addr_a: u64, addr_b: u64, owning_page: u64, key: &[u8], value: &[u8]) {
        let size = self.block_size() as usize;
        let mut buf = vec![0u8; size];
        let a = Block::new_live(Flavor::ALive, key, value, owning_page, self.key_size, self.value_size);
        a.encode(&mut buf, self.key_size, self.value_size);
        file.write_at(addr_a, &buf);
        let b = Block::new_live(Flavor::BLive, key, value, owning_page, self.key_size, self.value_size);
        b.encode(&mut buf, self.key_size, self.value_size);
        file.write_at(addr_b, &buf);
    }

    /// Point lookup (spec §4 "get"). Stops at the first untouched slot --
    /// insert always prefers the first page with a free or matching slot,
    /// so an empty slot here means the key was never written.
    ///
    /// Self-healing: if the currently-selected block fails its CRC (e.g. a
    /// bit flip in an already-closed file, spec §8 scenario E3), the backup
    /// block is tried before giving up; if the backup verifies, the value
    /// is served from it and the slot's selector is flipped and persisted
    /// so the next lookup goes straight to the good copy (spec invariant 1:
    /// "at least one of (offsetA, offsetB) ... verifies").
    pub fn get(&mut self, file: &mut MmapFile, key: &[u8]) -> Result<Vec<u8>, DbError> {
        if key.len() as u64 > self.key_size {
            return Err(DbError::InvalidParam("key exceeds configured max_key_size"));
        }
        let hash = self.hash_index(key);
        for page_idx in 0..self.page_count {
            let mut page = self.read_page(page_idx)?;
            let slot = page.slots[hash];
            if slot.is_empty() {
                return Err(DbError::NotFound);
            }
            if slot.is_tombstoned() {
                continue;
            }
            let cur_off = slot.current_offset().unwrap() as u64;
            let (block, vlen) = self.read_block(file, cur_off)?;
            if !keys_equal(&block.key, key, self.key_size) {
                continue;
            }
            if block.verify_crc(vlen) {
                return Ok(block.value[..vlen as usize].to_vec());
            }

            let back_off = slot.backup_offset().unwrap() as u64;
            let (back_block, back_vlen) = self.read_block(file, back_off)?;
            if keys_equal(&back_block.key, key, self.key_size) && back_block.verify_crc(back_vlen) {
                page.slots[hash].selector = if slot.selector == SELECTOR_A { SELECTOR_B } else { SELECTOR_A };
                self.write_page(page_idx, &page, file)?;
                return Ok(back_block.value[..back_vlen as usize].to_vec());
            }
            return Err(DbError::CorruptDbFile("data block crc mismatch"));
        }
        Err(DbError::NotFound)
    }

    /// Insert-or-overwrite (spec §4 "put"). On overwrite, the currently
    /// selected block is rewritten first, then the backup block with the
    /// same new value, then the selector flips -- mirrors `KISSDB_put`'s
    /// "also overwrite latest valid block" sequence.
    pub fn put(&mut self, file: &mut MmapFile, key: &[u8], value: &[u8]) -> Result<(), DbError> {
        if key.len() as u64 > self.key_size {
            return Err(DbError::InvalidParam("key exceeds configured max_key_size"));
        }
        if value.len() as u64 > self.value_size {
            return Err(DbError::InvalidParam("value exceeds configured max_value_size"));
        }
        let hash = self.hash_index(key);

        for page_idx in 0..self.page_count {
            let mut page = self.read_page(page_idx)?;
            let slot = page.slots[hash];

            if slot.is_empty() {
                let bsize = self.block_size();
                let addr_a = file.len();
                let addr_b = addr_a + bsize;
                file.grow_to(addr_b + bsize)?;
                self.write_block_pair(file, addr_a, addr_b, page_idx as u64, key, value);
                page.slots[hash] = Slot {
                    offset_a: addr_a as i64,
                    offset_b: addr_b as i64,
                    selector: SELECTOR_A,
                };
                self.write_page(page_idx, &page, file)?;
                return Ok(());
            }

            if slot.is_tombstoned() {
                // reuse the existing block pair at its original addresses.
                let addr_a = (-slot.offset_a) as u64;
                let addr_b = (-slot.offset_b) as u64;
                self.write_block_pair(file, addr_a, addr_b, page_idx as u64, key, value);
                page.slots[hash] = Slot {
                    offset_a: addr_a as i64,
                    offset_b: addr_b as i64,
                    selector: SELECTOR_A,
                };
                self.write_page(page_idx, &page, file)?;
                return Ok(());
            }

            let cur_off = slot.current_offset().unwrap() as u64;
            let (cur_block, _) = self.read_block(file, cur_off)?;
            if !keys_equal(&cur_block.key, key, self.key_size) {
                continue;
            }

            let back_off = slot.backup_offset().unwrap() as u64;
            let bsize = self.block_size() as usize;
            let mut buf = vec![0u8; bsize];

            let cur_flavor = if cur_off < back_off { Flavor::ALive } else { Flavor::BLive };
            let new_cur = Block::new_live(cur_flavor, key, value, page_idx as u64, self.key_size, self.value_size);
            new_cur.encode(&mut buf, self.key_size, self.value_size);
            file.write_at(cur_off, &buf);

            let back_flavor = if back_off < cur_off { Flavor::ALive } else { Flavor::BLive };
            let new_back = Block::new_live(back_flavor, key, value, page_idx as u64, self.key_size, self.value_size);
            new_back.encode(&mut buf, self.key_size, self.value_size);
            file.write_at(back_off, &buf);

            file.flush()?;

            page.slots[hash].selector = if slot.selector == SELECTOR_A { SELECTOR_B } else { SELECTOR_A };
            self.write_page(page_idx, &page, file)?;
            return Ok(());
        }

        // No existing page had a free or matching slot: grow the chain.
        let page_idx = self.add_page(file)?;
        let mut page = self.read_page(page_idx)?;
        let bsize = self.block_size();
        let addr_a = file.len();
        let addr_b = addr_a + bsize;
        file.grow_to(addr_b + bsize)?;
        self.write_block_pair(file, addr_a, addr_b, page_idx as u64, key, value);
        page.slots[hash] = Slot {
            offset_a: addr_a as i64,
            offset_b: addr_b as i64,
            selector: SELECTOR_A,
        };
        self.write_page(page_idx, &page, file)?;
        Ok(())
    }

    /// Tombstone both blocks of a matching slot (spec §4 "delete"). Value
    /// bytes are zeroed; key bytes are kept so hash-table rebuild can still
    /// classify the pair (spec §5.2).
    pub fn delete(&mut self, file: &mut MmapFile, key: &[u8]) -> Result<u32, DbError> {
        if key.len() as u64 > self.key_size {
            return Err(DbError::InvalidParam("key exceeds configured max_key_size"));
        }
        let hash = self.hash_index(key);

        for page_idx in 0..self.page_count {
            let mut page = self.read_page(page_idx)?;
            let slot = page.slots[hash];

            if slot.is_empty() {
                return Err(DbError::NotFound);
            }
            if slot.is_tombstoned() {
                continue;
            }

            let cur_off = slot.current_offset().unwrap() as u64;
            let (cur_block, cur_vlen) = self.read_block(file, cur_off)?;
            if !keys_equal(&cur_block.key, key, self.key_size) {
                continue;
            }

            let back_off = slot.backup_offset().unwrap() as u64;
            let bsize = self.block_size() as usize;
            let mut buf = vec![0u8; bsize];

            let cur_src_flavor = if cur_off < back_off { Flavor::ALive } else { Flavor::BLive };
            let tomb_cur = Block::new_tombstone(cur_src_flavor, &cur_block.key, page_idx as u64, self.key_size, self.value_size);
            tomb_cur.encode(&mut buf, self.key_size, self.value_size);
            file.write_at(cur_off, &buf);

            let back_src_flavor = if back_off < cur_off { Flavor::ALive } else { Flavor::BLive };
            let tomb_back = Block::new_tombstone(back_src_flavor, &cur_block.key, page_idx as u64, self.key_size, self.value_size);
            tomb_back.encode(&mut buf, self.key_size, self.value_size);
            file.write_at(back_off, &buf);

            file.flush()?;

            page.slots[hash].offset_a = -slot.offset_a.abs();
            page.slots[hash].offset_b = -slot.offset_b.abs();
            page.slots[hash].selector = SELECTOR_A;
            self.write_page(page_idx, &page, file)?;

            return Ok(cur_vlen);
        }
        Err(DbError::NotFound)
    }

    /// Walk every live slot across every page, yielding `(key, value)`
    /// pairs -- backs the RCT "list keys" / iteration surface (spec §4.7).
    pub fn iter_live<'a>(&'a self, file: &'a MmapFile) -> impl Iterator<Item = Result<(Vec<u8>, Vec<u8>), DbError>> + 'a {
        let n = self.n;
        (0..self.page_count).flat_map(move |page_idx| {
            let page = self.read_page(page_idx);
            let page = match page {
                Ok(p) => p,
                Err(e) => return vec![Err(e)].into_iter(),
            };
            let mut out = Vec::new();
            for hash in 0..n as usize {
                let slot = page.slots[hash];
                if slot.is_empty() || slot.is_tombstoned() {
                    continue;
                }
                let cur_off = slot.current_offset().unwrap() as u64;
                match self.read_block(file, cur_off) {
                    Ok((block, vlen)) => out.push(Ok((trim_key_padding(&block.key), block.value[..vlen as usize].to_vec()))),
                    Err(e) => out.push(Err(e)),
                }
            }
            out.into_iter()
        })
    }

    pub fn mirror_name(&self) -> &str {
        &self.mirror_name
    }

    pub fn verify_start_delimiter(&self, index: usize) -> bool {
        let buf = self.page_bytes(index);
        buf.len() >= 4 && u32::from_le_bytes(buf[0..4].try_into().unwrap()) == HASHTABLE_START_DELIMITER
    }

    /// Check a page's stored CRC against its recomputed one (spec §4.6
    /// step 1). Delimiter presence alone is not enough -- a torn write can
    /// leave valid delimiters around a half-written slot array.
    pub fn page_crc_valid(&self, index: usize) -> Result<bool, DbError> {
        let buf = self.page_bytes(index);
        let page = Page::decode(buf, self.n).ok_or(DbError::CorruptDbFile("hash table page missing delimiters"))?;
        Ok(Page::stored_crc(buf) == page.crc())
    }

    pub fn slot_count(&self) -> u16 {
        self.n
    }

    pub fn key_size(&self) -> u64 {
        self.key_size
    }

    pub fn value_size(&self) -> u64 {
        self.value_size
    }

    /// Overwrite every page's slot array wholesale -- used by recovery
    /// after a blind scan reconstructs the table from data blocks alone
    /// (spec §4.6 step 2).
    pub fn replace_all_pages(&mut self, file: &mut MmapFile, pages: Vec<Page>) -> Result<(), DbError> {
        for (idx, page) in pages.into_iter().enumerate() {
            if idx >= self.page_count {
                self.add_page(file)?;
            }
            self.write_page(idx, &page, file)?;
        }
        Ok(())
    }
}
