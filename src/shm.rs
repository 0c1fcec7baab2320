//! Named shared-memory regions used by the hash-table mirror, the
//! write-back cache and the shared control block (spec §4.5, §6).
//!
//! POSIX `shm_open` objects are files in all but name; this module realizes
//! them the same way `toloco-warp_cache`'s `ShmRegion` does -- as regular
//! files under the platform's shared-memory directory, mapped with
//! `memmap2`. That sidesteps needing raw `libc::shm_open` bindings while
//! preserving the exact semantics the spec requires: first-opener creates,
//! later openers attach to the same backing store, last closer unlinks.
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use memmap2::MmapMut;

use crate::errors::DbError;

/// Directory holding shared-memory-backed files for this platform.
pub fn shm_dir() -> PathBuf {
    if cfg!(target_os = "linux") && Path::new("/dev/shm").is_dir() {
        PathBuf::from("/dev/shm")
    } else {
        std::env::temp_dir().join("kissdb-shm")
    }
}

/// Replace every non-alphanumeric character with `_`, as KISSDB's
/// `kdbGetShmName` does for deriving shared-object names from a database
/// path (spec §6 "Shared-memory object names").
pub fn sanitize(path: &str) -> String {
    path.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

pub fn shm_name(db_path: &str, suffix: &str) -> String {
    format!("{}{}", sanitize(db_path), suffix)
}

pub struct ShmRegion {
    mmap: MmapMut,
    path: PathBuf,
}

impl ShmRegion {
    fn dir_ready() -> io::Result<PathBuf> {
        let dir = shm_dir();
        if !dir.exists() {
            fs::create_dir_all(&dir)?;
        }
        Ok(dir)
    }

    /// Attempt to create a fresh, zero-filled region of `size` bytes. If
    /// one already exists, attach to it instead (mirrors `kdbShmemOpen`'s
    /// `O_CREAT | O_EXCL` then fallback-open). Returns whether *this* call
    /// was the creator.
    pub fn create_or_open(name: &str, size: u64) -> Result<(ShmRegion, bool), DbError> {
        let dir = Self::dir_ready().map_err(DbError::Io)?;
        let path = dir.join(name);

        let (file, created) = match OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(f) => (f, true),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                let f = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .open(&path)
                    .map_err(|_| DbError::OpenShm("failed to open existing shared memory file"))?;
                (f, false)
            }
            Err(_) => return Err(DbError::OpenShm("failed to create shared memory file")),
        };

        if created {
            file.set_len(size).map_err(|_| DbError::OpenShm("ftruncate failed"))?;
        }

        let mmap = unsafe { MmapMut::map_mut(&file) }.map_err(|_| DbError::MapShm("mmap failed"))?;
        Ok((ShmRegion { mmap, path }, created))
    }

    /// Attach to an existing region, mapping its current on-disk size.
    pub fn open_existing(name: &str) -> Result<ShmRegion, DbError> {
        let dir = shm_dir();
        let path = dir.join(name);
        let file: File = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|_| DbError::OpenShm("shared memory file does not exist"))?;
        let mmap = unsafe { MmapMut::map_mut(&file) }.map_err(|_| DbError::MapShm("mmap failed"))?;
        Ok(ShmRegion { mmap, path })
    }

    /// Grow the region in place: unmap, extend the backing file, remap.
    /// Callers must hold the write rwlock -- growth is never concurrent
    /// with itself (spec §4.5).
    pub fn grow(&mut self, new_size: u64) -> Result<(), DbError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.path)
            .map_err(|_| DbError::ResizeShm("failed to reopen shared memory file"))?;
        file.set_len(new_size).map_err(|_| DbError::ResizeShm("ftruncate failed"))?;
        let mmap = unsafe { MmapMut::map_mut(&file) }.map_err(|_| DbError::ResizeShm("remap failed"))?;
        self.mmap = mmap;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mmap.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.mmap[..]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.mmap[..]
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.mmap.as_ptr()
    }

    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.mmap.as_mut_ptr()
    }

    /// Remove the backing file. Only the last closer should call this
    /// (spec §4.5 "Shared-resource policy").
    pub fn unlink(path_name: &str) -> Result<(), DbError> {
        let path = shm_dir().join(path_name);
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(_) => Err(DbError::CloseShm("failed to unlink shared memory file")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_replaces_non_alphanumeric() {
        assert_eq!(sanitize("/tmp/my-db.kdb"), "_tmp_my_db_kdb");
    }

    #[test]
    fn create_then_attach_sees_same_bytes() {
        let name = format!("kissdb-test-{}-shm", std::process::id());
        let (mut region, created) = ShmRegion::create_or_open(&name, 4096).unwrap();
        assert!(created);
        region.as_mut_slice()[0] = 42;

        let region2 = ShmRegion::open_existing(&name).unwrap();
        assert_eq!(region2.as_slice()[0], 42);

        ShmRegion::unlink(&name).unwrap();
    }

    #[test]
    fn grow_preserves_existing_bytes() {
        let name = format!("kissdb-test-grow-{}-shm", std::process::id());
        let (mut region, _) = ShmRegion::create_or_open(&name, 64).unwrap();
        region.as_mut_slice()[10] = 7;
        region.grow(128).unwrap();
        assert_eq!(region.len(), 128);
        assert_eq!(region.as_slice()[10], 7);
        ShmRegion::unlink(&name).unwrap();
    }
}
