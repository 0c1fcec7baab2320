//! Write-back dirty cache (spec §4.4): a fixed-size, shared-memory,
//! open-addressing hash array absorbing puts/deletes for handles opened in
//! cached mode. Flushed into the file only when the last handle closes.
//!
//! Grounded in the same shared-memory-as-a-file approach as `shm.rs`
//! (`toloco-warp_cache`'s `ShmRegion`); the open-addressing probe sequence
//! and fixed capacity follow spec §4.4's "fixed-size... hash-array", since
//! the original source's disabled multi-region growth path ("addCache") is
//! explicitly out of scope (spec §9 open question 3).
use crate::errors::DbError;
use crate::hashtable::djb2_hash;
use crate::shm::ShmRegion;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tag {
    Write,
    Delete,
}

const STATE_EMPTY: u8 = 0;
const STATE_OCCUPIED: u8 = 1;
const TAG_WRITE: u8 = 0;
const TAG_DELETE: u8 = 1;

pub enum Lookup {
    Write(Vec<u8>),
    Delete,
}

pub struct Cache {
    region: ShmRegion,
    capacity: usize,
    key_size: u64,
    value_size: u64,
}

impl Cache {
    fn entry_stride(key_size: u64, value_size: u64) -> usize {
        // state(1) + tag(1) + key(key_size) + value_len(4) + value(value_size)
        1 + 1 + key_size as usize + 4 + value_size as usize
    }

    fn region_size(capacity: usize, key_size: u64, value_size: u64) -> u64 {
        (Self::entry_stride(key_size, value_size) * capacity) as u64
    }

    /// Create the cache region on first use, or attach to one another
    /// process already created (spec §4.4 "created lazily on first write").
    pub fn create_or_attach(name: &str, capacity: usize, key_size: u64, value_size: u64) -> Result<Cache, DbError> {
        let size = Self::region_size(capacity, key_size, value_size);
        let (region, _created) = ShmRegion::create_or_open(name, size)?;
        Ok(Cache {
            region,
            capacity,
            key_size,
            value_size,
        })
    }

    fn stride(&self) -> usize {
        Self::entry_stride(self.key_size, self.value_size)
    }

    fn slot(&self, index: usize) -> &[u8] {
        let stride = self.stride();
        let start = index * stride;
        &self.region.as_slice()[start..start + stride]
    }

    fn slot_mut(&mut self, index: usize) -> &mut [u8] {
        let stride = self.stride();
        let start = index * stride;
        &mut self.region.as_mut_slice()[start..start + stride]
    }

    fn decode(buf: &[u8], key_size: u64, value_size: u64) -> Option<(u8, Tag, Vec<u8>, Vec<u8>)> {
        let state = buf[0];
        if state != STATE_OCCUPIED {
            return None;
        }
        let tag = if buf[1] == TAG_DELETE { Tag::Delete } else { Tag::Write };
        let key_off = 2;
        let vlen_off = key_off + key_size as usize;
        let val_off = vlen_off + 4;
        let key = buf[key_off..vlen_off].to_vec();
        let vlen = u32::from_le_bytes(buf[vlen_off..val_off].try_into().unwrap()) as usize;
        let value = buf[val_off..val_off + value_size as usize][..vlen].to_vec();
        Some((state, tag, key, value))
    }

    fn encode(buf: &mut [u8], tag: Tag, key: &[u8], value: &[u8], key_size: u64, value_size: u64) {
        buf[0] = STATE_OCCUPIED;
        buf[1] = if tag == Tag::Delete { TAG_DELETE } else { TAG_WRITE };
        let key_off = 2;
        let vlen_off = key_off + key_size as usize;
        let val_off = vlen_off + 4;
        buf[key_off..vlen_off].fill(0);
        buf[key_off..key_off + key.len()].copy_from_slice(key);
        buf[vlen_off..val_off].copy_from_slice(&(value.len() as u32).to_le_bytes());
        buf[val_off..val_off + value_size as usize].fill(0);
        buf[val_off..val_off + value.len()].copy_from_slice(value);
    }

    /// Strip the trailing zero padding a fixed-size key buffer carries in
    /// the cache region, the same way `hashtable::trim_key_padding` does for
    /// on-disk blocks -- `iter()` surfaces keys to callers (listing, flush),
    /// who need the logical key back, not the padded storage buffer.
    fn trim_key_padding(stored: &[u8]) -> Vec<u8> {
        let end = stored.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
        stored[..end].to_vec()
    }

    fn keys_match(stored: &[u8], query: &[u8]) -> bool {
        stored.len() >= query.len() && &stored[..query.len()] == query && stored[query.len()..].iter().all(|&b| b == 0)
    }

    /// Upsert `key` with `tag`/`value` using linear-probing open addressing.
    /// Returns `OutOfMemory` if the region is saturated -- callers must
    /// treat that as a hard failure (spec §4.4, no silent fallthrough).
    fn upsert(&mut self, key: &[u8], tag: Tag, value: &[u8]) -> Result<(), DbError> {
        let start = (djb2_hash(key) % self.capacity as u64) as usize;
        let mut first_free: Option<usize> = None;
        for probe in 0..self.capacity {
            let idx = (start + probe) % self.capacity;
            let buf = self.slot(idx);
            match Self::decode(buf, self.key_size, self.value_size) {
                None => {
                    if first_free.is_none() {
                        first_free = Some(idx);
                    }
                    break;
                }
                Some((_, _, stored_key, _)) if Self::keys_match(&stored_key, key) => {
                    let mut enc = vec![0u8; self.stride()];
                    Self::encode(&mut enc, tag, key, value, self.key_size, self.value_size);
                    self.slot_mut(idx).copy_from_slice(&enc);
                    return Ok(());
                }
                Some(_) => continue,
            }
        }
        let idx = first_free.ok_or(DbError::OutOfMemory)?;
        let mut enc = vec![0u8; self.stride()];
        Self::encode(&mut enc, tag, key, value, self.key_size, self.value_size);
        self.slot_mut(idx).copy_from_slice(&enc);
        Ok(())
    }

    pub fn put_write(&mut self, key: &[u8], value: &[u8]) -> Result<(), DbError> {
        self.upsert(key, Tag::Write, value)
    }

    pub fn put_delete(&mut self, key: &[u8]) -> Result<(), DbError> {
        self.upsert(key, Tag::Delete, &[])
    }

    /// Look up a key in the cache: `Some(Write(v))` shadows the file with
    /// `v`, `Some(Delete)` shadows the file with not-found, `None` means
    /// the file is authoritative (spec §4 invariant 5).
    pub fn get(&self, key: &[u8]) -> Option<Lookup> {
        let start = (djb2_hash(key) % self.capacity as u64) as usize;
        for probe in 0..self.capacity {
            let idx = (start + probe) % self.capacity;
            match Self::decode(self.slot(idx), self.key_size, self.value_size) {
                None => return None,
                Some((_, tag, stored_key, value)) if Self::keys_match(&stored_key, key) => {
                    return Some(match tag {
                        Tag::Write => Lookup::Write(value),
                        Tag::Delete => Lookup::Delete,
                    });
                }
                Some(_) => continue,
            }
        }
        None
    }

    /// Iterate every occupied entry, for flush-at-close (spec §4.4 "Flush")
    /// and for `list_keys` merging cache state with the file.
    pub fn iter(&self) -> impl Iterator<Item = (Tag, Vec<u8>, Vec<u8>)> + '_ {
        (0..self.capacity).filter_map(move |idx| {
            Self::decode(self.slot(idx), self.key_size, self.value_size)
                .map(|(_, tag, key, value)| (tag, Self::trim_key_padding(&key), value))
        })
    }

    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_cache(tag: &str) -> Cache {
        let name = format!("kissdb-test-cache-{}-{}", std::process::id(), tag);
        Cache::create_or_attach(&name, 16, 8, 8).unwrap()
    }

    #[test]
    fn put_write_then_get() {
        let mut c = new_cache("a");
        c.put_write(b"k", b"v").unwrap();
        match c.get(b"k") {
            Some(Lookup::Write(v)) => assert_eq!(v, b"v"),
            _ => panic!("expected write entry"),
        }
        ShmRegion::unlink(&format!("kissdb-test-cache-{}-a", std::process::id())).unwrap();
    }

    #[test]
    fn put_delete_shadows_as_tombstone() {
        let mut c = new_cache("b");
        c.put_write(b"k", b"v").unwrap();
        c.put_delete(b"k").unwrap();
        assert!(matches!(c.get(b"k"), Some(Lookup::Delete)));
        ShmRegion::unlink(&format!("kissdb-test-cache-{}-b", std::process::id())).unwrap();
    }

    #[test]
    fn saturated_cache_fails_hard() {
        let name = format!("kissdb-test-cache-{}-c", std::process::id());
        let mut c = Cache::create_or_attach(&name, 2, 4, 4).unwrap();
        c.put_write(b"a", b"1").unwrap();
        c.put_write(b"b", b"2").unwrap();
        assert!(matches!(c.put_write(b"c", b"3"), Err(DbError::OutOfMemory)));
        ShmRegion::unlink(&name).unwrap();
    }
}
