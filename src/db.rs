//! Database orchestrator (spec §3-§4.6): ties the mmap file, the
//! hash-table mirror, the write-back cache and the cross-process
//! synchronization primitives into one per-handle engine instance.
use std::path::{Path, PathBuf};

use log::{debug, warn};

use crate::cache::{Cache, Lookup, Tag};
use crate::constants::*;
use crate::errors::{DbError, DbResult};
use crate::hashtable::{discover_page_chain, HashTable};
use crate::header::Header;
use crate::mmap_file::MmapFile;
use crate::recovery;
use crate::shm::{shm_name, ShmRegion};
use crate::sync::{rwlock_size, NamedSemaphore, SharedRwLock};

#[derive(Debug, Clone, Copy)]
pub struct OpenOptions {
    pub create: bool,
    pub write_through: bool,
    pub read_only: bool,
    pub hash_table_size: u16,
    pub key_size: u64,
    pub value_size: u64,
    pub cache_capacity: usize,
}

impl Default for OpenOptions {
    fn default() -> OpenOptions {
        OpenOptions {
            create: true,
            write_through: true,
            read_only: false,
            hash_table_size: DEFAULT_HASH_TABLE_SIZE,
            key_size: DEFAULT_MAX_KEY_SIZE,
            value_size: DEFAULT_MAX_VALUE_SIZE,
            cache_capacity: 1024,
        }
    }
}

// Shared control block layout, following the rwlock: refcount(8) |
// write_through(8) | cache_created(8) (spec §3 "Shared control block").
fn off_refcount() -> usize {
    rwlock_size()
}
fn off_write_through() -> usize {
    rwlock_size() + 8
}
fn off_cache_created() -> usize {
    rwlock_size() + 16
}
fn control_size() -> u64 {
    (rwlock_size() + 24) as u64
}

fn read_u64_at(buf: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(buf[offset..offset + 8].try_into().unwrap())
}
fn write_u64_at(buf: &mut [u8], offset: usize, value: u64) {
    buf[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

pub struct Database {
    path: PathBuf,
    file: MmapFile,
    hashtable: HashTable,
    cache: Option<Cache>,
    control: ShmRegion,
    rwlock: SharedRwLock,
    semaphore: NamedSemaphore,
    read_only: bool,
}

impl Database {
    pub fn open(path: &Path, opts: OpenOptions) -> DbResult<Database> {
        let path_str = path.to_string_lossy().to_string();

        let semaphore = NamedSemaphore::open_or_create(&format!("/{}", shm_name(&path_str, "-sem")))?;
        let _sem_guard = semaphore.acquire();

        let (mut control, created) = ShmRegion::create_or_open(&shm_name(&path_str, "-shm-info"), control_size())?;
        let rwlock = if created {
            unsafe { SharedRwLock::init_at(control.as_mut_ptr())? }
        } else {
            unsafe { SharedRwLock::from_existing(control.as_mut_ptr()) }
        };
        if created {
            write_u64_at(control.as_mut_slice(), off_refcount(), 0);
            write_u64_at(control.as_mut_slice(), off_write_through(), if opts.write_through { 1 } else { 0 });
            write_u64_at(control.as_mut_slice(), off_cache_created(), 0);
        }

        let _write_guard = rwlock.write_lock();

        let mut file = MmapFile::open(path, opts.create, opts.read_only)?;
        file.grow_to(HEADER_SIZE)?;

        let header_bytes = file.read_at(0, HEADER_SIZE as usize).to_vec();
        let is_new = header_bytes.iter().all(|&b| b == 0);

        let (mut header, hash_table_size, key_size, value_size) = if is_new {
            if !opts.create {
                return Err(DbError::InvalidParam("database does not exist and create was not requested"));
            }
            let h = Header::new(opts.hash_table_size as u64, opts.key_size, opts.value_size);
            file.write_at(0, &h.to_bytes());
            (h, opts.hash_table_size, opts.key_size, opts.value_size)
        } else {
            let h = Header::from_bytes(&header_bytes)?;
            let n = h.hash_table_size as u16;
            (h, n, h.max_key_size, h.max_value_size)
        };

        let mirror_name = shm_name(&path_str, "-ht");
        let hashtable = if is_new {
            HashTable::create(&mirror_name, hash_table_size, key_size, value_size, &mut file, HEADER_SIZE)?
        } else {
            let needs_recovery = header.needs_recovery();
            let offsets = discover_page_chain(&file, HEADER_SIZE, hash_table_size);
            let offsets_empty = offsets.is_empty();
            let mut ht = if offsets_empty {
                HashTable::create(&mirror_name, hash_table_size, key_size, value_size, &mut file, HEADER_SIZE)?
            } else {
                HashTable::attach(&mirror_name, hash_table_size, key_size, value_size, offsets, &file)?
            };

            // Step 1 of recovery (spec §4.6) is cheap and is always run, even
            // when the close flags claim the last session ended cleanly: a
            // page CRC can only have gone bad through external corruption of
            // an already-closed file, which the close flags cannot see. The
            // costlier rebuild/data-block steps still only run when needed.
            let pages_crc_ok = offsets_empty || recovery::verify_hashtable_crcs(&ht);
            if needs_recovery || !pages_crc_ok {
                warn!(
                    "running database recovery (clean close last time: {}, hash table checksums ok: {})",
                    !needs_recovery, pages_crc_ok
                );
                if !pages_crc_ok {
                    warn!("hash table checksum invalid, rebuilding from a blind scan of the data file");
                    let pages = recovery::blind_scan_rebuild(&file, key_size, value_size, hash_table_size)?;
                    ht.replace_all_pages(&mut file, pages)?;
                } else {
                    debug!("hash table checksums OK, skipping rebuild");
                }
                let invalidated = recovery::recover_data_blocks(&mut ht, &mut file)?;
                if invalidated > 0 {
                    warn!("{} data block pair(s) could not be recovered and were invalidated", invalidated);
                }
            }
            ht
        };

        let cache = if !opts.read_only && !opts.write_through {
            write_u64_at(control.as_mut_slice(), off_cache_created(), 1);
            Some(Cache::create_or_attach(&shm_name(&path_str, "-cache"), opts.cache_capacity, key_size, value_size)?)
        } else {
            None
        };

        if !opts.read_only {
            Header::set_close_flags(file.as_mut_slice(), true, false);
            file.flush()?;
        }

        let refcount = read_u64_at(control.as_slice(), off_refcount());
        write_u64_at(control.as_mut_slice(), off_refcount(), refcount + 1);

        let _ = &mut header; // header kept for diagnostics; authoritative state now lives in `file`.

        Ok(Database {
            path: path.to_path_buf(),
            file,
            hashtable,
            cache,
            control,
            rwlock,
            semaphore,
            read_only: opts.read_only,
        })
    }

    fn path_str(&self) -> String {
        self.path.to_string_lossy().to_string()
    }

    pub fn key_size_limit(&self) -> u64 {
        self.hashtable.key_size()
    }

    pub fn value_size_limit(&self) -> u64 {
        self.hashtable.value_size()
    }

    /// Point read, merging the cache's logical overlay with the file
    /// (spec §4 invariant 5): a cached `Delete` shadows the file as
    /// not-found, a cached `Write` overrides it, otherwise the file's
    /// value (if any) is authoritative.
    pub fn read_key(&mut self, key: &[u8]) -> DbResult<Vec<u8>> {
        let _guard = self.rwlock.write_lock();
        self.file.remap_if_grown()?;
        self.hashtable.resync_pages(&self.file)?;
        if let Some(cache) = &self.cache {
            match cache.get(key) {
                Some(Lookup::Write(v)) => return Ok(v),
                Some(Lookup::Delete) => return Err(DbError::NotFound),
                None => {}
            }
        }
        self.hashtable.get(&mut self.file, key)
    }

    pub fn key_size(&mut self, key: &[u8]) -> DbResult<usize> {
        self.read_key(key).map(|v| v.len())
    }

    pub fn write_key(&mut self, key: &[u8], value: &[u8]) -> DbResult<usize> {
        if self.read_only {
            return Err(DbError::ReadOnly);
        }
        let _guard = self.rwlock.write_lock();
        self.file.remap_if_grown()?;
        self.hashtable.resync_pages(&self.file)?;
        if let Some(cache) = &mut self.cache {
            cache.put_write(key, value)?;
        } else {
            self.hashtable.put(&mut self.file, key, value)?;
        }
        Ok(value.len())
    }

    pub fn delete_key(&mut self, key: &[u8]) -> DbResult<()> {
        if self.read_only {
            return Err(DbError::ReadOnly);
        }
        let _guard = self.rwlock.write_lock();
        self.file.remap_if_grown()?;
        self.hashtable.resync_pages(&self.file)?;

        let currently_present = match self.cache.as_ref().and_then(|c| c.get(key)) {
            Some(Lookup::Write(_)) => true,
            Some(Lookup::Delete) => false,
            None => self.hashtable.get(&mut self.file, key).is_ok(),
        };
        if !currently_present {
            return Err(DbError::NotFound);
        }

        if let Some(cache) = &mut self.cache {
            cache.put_delete(key)?;
        } else {
            self.hashtable.delete(&mut self.file, key)?;
        }
        Ok(())
    }

    /// Merge the cache's overlay with the file's live keys into one set
    /// (spec §4.7 "list_keys"/"list_size"): `Write` entries not already
    /// backed by the file count once, `Delete` entries remove a file key.
    fn merged_keys(&self) -> DbResult<Vec<Vec<u8>>> {
        let mut keys: Vec<Vec<u8>> = self
            .hashtable
            .iter_live(&self.file)
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .map(|(k, _)| k)
            .collect();

        if let Some(cache) = &self.cache {
            for (tag, key, _) in cache.iter() {
                keys.retain(|k| k != &key);
                if tag == Tag::Write {
                    keys.push(key);
                }
            }
        }
        Ok(keys)
    }

    /// Size in bytes of the NUL-separated listing buffer `list_keys`
    /// would fill (spec §4.7).
    pub fn list_size(&mut self) -> DbResult<usize> {
        let _guard = self.rwlock.write_lock();
        self.file.remap_if_grown()?;
        self.hashtable.resync_pages(&self.file)?;
        let keys = self.merged_keys()?;
        Ok(keys.iter().map(|k| k.len() + 1).sum())
    }

    /// NUL-separated listing of every live key (spec §4.7 "list_keys").
    pub fn list_keys(&mut self) -> DbResult<Vec<u8>> {
        let _guard = self.rwlock.write_lock();
        self.file.remap_if_grown()?;
        self.hashtable.resync_pages(&self.file)?;
        let keys = self.merged_keys()?;
        let mut out = Vec::with_capacity(keys.iter().map(|k| k.len() + 1).sum());
        for key in keys {
            out.extend_from_slice(&key);
            out.push(0);
        }
        Ok(out)
    }

    /// Drop this handle. If it is the last one referencing the database,
    /// drain the dirty cache into the file, write the close-ok flag, and
    /// release the shared resources (spec §3 "Close").
    pub fn close(mut self) -> DbResult<()> {
        let path_str = self.path_str();
        let sem_guard = self.semaphore.acquire();
        let guard = self.rwlock.write_lock();

        let refcount = read_u64_at(self.control.as_slice(), off_refcount());
        let remaining = refcount.saturating_sub(1);
        write_u64_at(self.control.as_mut_slice(), off_refcount(), remaining);

        if remaining == 0 && !self.read_only {
            if let Some(cache) = self.cache.take() {
                for (tag, key, value) in cache.iter() {
                    let result = match tag {
                        Tag::Write => self.hashtable.put(&mut self.file, &key, &value),
                        Tag::Delete => self.hashtable.delete(&mut self.file, &key).map(|_| ()),
                    };
                    if let Err(e) = result {
                        warn!("error flushing cache entry at close: {}", e);
                    }
                }
            }

            Header::set_close_flags(self.file.as_mut_slice(), false, true);
            self.file.flush()?;

            drop(guard);
            ShmRegion::unlink(&shm_name(&path_str, "-ht"))?;
            if read_u64_at(self.control.as_slice(), off_cache_created()) != 0 {
                ShmRegion::unlink(&shm_name(&path_str, "-cache"))?;
            }
            ShmRegion::unlink(&shm_name(&path_str, "-shm-info"))?;
            drop(sem_guard);
            drop(self.semaphore.close());
            NamedSemaphore::unlink(&format!("/{}", shm_name(&path_str, "-sem")))?;
            return Ok(());
        }

        drop(sem_guard);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn opts() -> OpenOptions {
        OpenOptions {
            create: true,
            write_through: true,
            read_only: false,
            hash_table_size: 8,
            key_size: 16,
            value_size: 16,
            cache_capacity: 32,
        }
    }

    #[test]
    fn open_write_read_delete_close_cycle() {
        let _ = env_logger::builder().is_test(true).try_init();

        let dir = tempdir().unwrap();
        let path = dir.path().join("db.kdb");

        let mut db = Database::open(&path, opts()).unwrap();
        db.write_key(b"k", b"v").unwrap();
        assert_eq!(db.read_key(b"k").unwrap(), b"v");
        db.delete_key(b"k").unwrap();
        assert!(matches!(db.read_key(b"k"), Err(DbError::NotFound)));
        db.close().unwrap();
    }

    #[test]
    fn cached_mode_defers_writes_until_close() {
        let _ = env_logger::builder().is_test(true).try_init();

        let dir = tempdir().unwrap();
        let path = dir.path().join("db.kdb");
        let mut cached_opts = opts();
        cached_opts.write_through = false;

        let mut db = Database::open(&path, cached_opts).unwrap();
        db.write_key(b"k", b"v").unwrap();
        assert_eq!(db.read_key(b"k").unwrap(), b"v");
        db.close().unwrap();

        let mut reopened = Database::open(&path, { let mut o = opts(); o.create = false; o }).unwrap();
        assert_eq!(reopened.read_key(b"k").unwrap(), b"v");
        reopened.close().unwrap();
    }
}
