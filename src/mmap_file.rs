//! File-backed mmap ownership for the database's single data file: open,
//! grow, and the `remap_if_grown` contract every read/write path must
//! honor before dereferencing an offset into the map (spec §4.1).
//!
//! Generalizes the teacher's `mmap_array.rs` `JumpTable`, which mapped a
//! single fixed-stride header-plus-array file, to the paged KISSDB layout:
//! a fixed header, a growable chain of hash-table pages, and a growable,
//! append-only run of data blocks.
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use memmap2::MmapMut;

use crate::errors::DbError;

pub struct MmapFile {
    file: File,
    mmap: MmapMut,
    path: PathBuf,
}

impl MmapFile {
    /// Open `path`, creating it if `create` is set, and map its entire
    /// current length. Callers that need a minimum length should call
    /// `grow_to` immediately afterward.
    pub fn open(path: &Path, create: bool, read_only: bool) -> Result<MmapFile, DbError> {
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .create(create)
            .open(path)
            .map_err(DbError::Io)?;
        if file.metadata().map_err(DbError::Io)?.len() == 0 {
            // memmap2 refuses to map a zero-length file; give callers a
            // one-page placeholder to grow from.
            file.set_len(*crate::constants::OS_PAGE_SIZE as u64).map_err(DbError::Io)?;
        }
        let mmap = unsafe { MmapMut::map_mut(&file) }.map_err(DbError::Io)?;
        Ok(MmapFile {
            file,
            mmap,
            path: path.to_path_buf(),
        })
    }

    pub fn len(&self) -> u64 {
        self.mmap.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.mmap.is_empty()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Extend the backing file to at least `new_len` bytes and remap.
    /// No-op if the file is already at least that long. The caller must
    /// hold the database's write lock -- growth races with any concurrent
    /// reader of the old map (spec §4.1, §4.5).
    pub fn grow_to(&mut self, new_len: u64) -> Result<(), DbError> {
        if new_len <= self.len() {
            return Ok(());
        }
        self.file.set_len(new_len).map_err(DbError::Io)?;
        self.mmap = unsafe { MmapMut::map_mut(&self.file) }.map_err(DbError::Io)?;
        Ok(())
    }

    /// Re-read the file's on-disk length and remap if another process has
    /// grown it since our last map. Every lookup and mutation must call
    /// this before computing a pointer from a stored offset (spec §4.1
    /// "remap_if_grown contract").
    pub fn remap_if_grown(&mut self) -> Result<(), DbError> {
        let on_disk_len = self.file.metadata().map_err(DbError::Io)?.len();
        if on_disk_len > self.len() {
            self.mmap = unsafe { MmapMut::map_mut(&self.file) }.map_err(DbError::Io)?;
        }
        Ok(())
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.mmap[..]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.mmap[..]
    }

    pub fn read_at(&self, offset: u64, len: usize) -> &[u8] {
        let start = offset as usize;
        &self.mmap[start..start + len]
    }

    pub fn write_at(&mut self, offset: u64, data: &[u8]) {
        let start = offset as usize;
        self.mmap[start..start + data.len()].copy_from_slice(data);
    }

    /// Flush dirty pages to disk. Called at the end of any sequence that
    /// must be durable before the caller releases the write lock (spec
    /// §4.1, invariant 2's "each write leaves the file in a state where
    /// either the old or the new value is fully readable").
    pub fn flush(&self) -> Result<(), DbError> {
        self.mmap.flush().map_err(DbError::Io)
    }
}
