//! Public dispatch & handle table (spec §4.7, §6): assigns small integer
//! handles to open databases, tags each handle with a purpose, validates
//! parameters, and routes operations to the owning `Database`.
//!
//! REDESIGN FLAG applied: the handle table is an explicit, lazily
//! initialized singleton registry (`lazy_static!` + `Mutex`, the same
//! initialization-guarded-singleton idiom the teacher uses for
//! `constants::OS_PAGE_SIZE`) rather than a bare global mutable array.
use std::path::Path;
use std::sync::Mutex;

use bitflags::bitflags;

use crate::db::{Database, OpenOptions};
use crate::errors::{DbError, DbResult};

const FIXED_SLOTS: usize = 16;

bitflags! {
    /// Open-mode bitfield (spec §6 `open` row).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenMode: u32 {
        const CREATE = 0b001;
        const WRITE_THROUGH = 0b010;
        const READ_ONLY = 0b100;
    }
}

/// Selects which of the two logical schemas a handle's operations address
/// (spec §4.7, GLOSSARY "Purpose"). The engine persists both identically;
/// only parameter validation here differs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Purpose {
    Db,
    Rct,
}

/// One overflow-list node, kept sorted by ascending identifier (spec §4.7
/// "Handle table": "the list is kept sorted by identifier").
struct OverflowNode {
    id: i32,
    db: Database,
    next: Option<Box<OverflowNode>>,
}

struct HandleTable {
    fixed: [Option<Database>; FIXED_SLOTS],
    overflow: Option<Box<OverflowNode>>,
}

impl HandleTable {
    fn new() -> HandleTable {
        HandleTable {
            fixed: Default::default(),
            overflow: None,
        }
    }

    /// Smallest-available-identifier allocation, both within the fixed
    /// array and within the sorted overflow list (spec §4.7).
    fn insert(&mut self, db: Database) -> i32 {
        for (i, slot) in self.fixed.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(db);
                return i as i32;
            }
        }

        let mut wanted = FIXED_SLOTS as i32;
        let mut cursor = &mut self.overflow;
        while let Some(node) = cursor {
            if node.id != wanted {
                break;
            }
            wanted += 1;
            cursor = &mut node.next;
        }

        let new_node = Box::new(OverflowNode { id: wanted, db, next: None });
        Self::insert_sorted(&mut self.overflow, new_node);
        wanted
    }

    fn insert_sorted(slot: &mut Option<Box<OverflowNode>>, mut new_node: Box<OverflowNode>) {
        match slot {
            None => *slot = Some(new_node),
            Some(node) if new_node.id < node.id => {
                new_node.next = slot.take();
                *slot = Some(new_node);
            }
            Some(node) => Self::insert_sorted(&mut node.next, new_node),
        }
    }

    fn remove(&mut self, id: i32) -> Option<Database> {
        if (0..FIXED_SLOTS as i32).contains(&id) {
            return self.fixed[id as usize].take();
        }
        Self::remove_from_list(&mut self.overflow, id)
    }

    fn remove_from_list(slot: &mut Option<Box<OverflowNode>>, id: i32) -> Option<Database> {
        match slot {
            None => None,
            Some(node) if node.id == id => {
                let node = slot.take().unwrap();
                *slot = node.next;
                Some(node.db)
            }
            Some(node) => Self::remove_from_list(&mut node.next, id),
        }
    }

    fn get_mut(&mut self, id: i32) -> Option<&mut Database> {
        if (0..FIXED_SLOTS as i32).contains(&id) {
            return self.fixed[id as usize].as_mut();
        }
        let mut cursor = &mut self.overflow;
        while let Some(node) = cursor {
            if node.id == id {
                return Some(&mut node.db);
            }
            cursor = &mut node.next;
        }
        None
    }
}

lazy_static! {
    static ref HANDLES: Mutex<HandleTable> = Mutex::new(HandleTable::new());
}

fn with_handle<T>(handle: i32, f: impl FnOnce(&mut Database) -> DbResult<T>) -> DbResult<T> {
    let mut table = HANDLES.lock().unwrap();
    let db = table
        .get_mut(handle)
        .ok_or(DbError::InvalidParam("unknown handle"))?;
    f(db)
}

fn check_key(key: &[u8], key_size: u64) -> DbResult<()> {
    if key.is_empty() || key.len() as u64 > key_size {
        return Err(DbError::InvalidParam("key length out of bounds"));
    }
    Ok(())
}

/// Open a database and return a fresh handle (spec §4.7 `open`). `mode`
/// selects create/write-through/read-only; `slot_count` is the hash-table
/// width used only when creating a fresh file.
pub fn open(path: &Path, mode: OpenMode, key_size: u64, value_size: u64, slot_count: u16) -> DbResult<i32> {
    if key_size == 0 || value_size == 0 || slot_count == 0 {
        return Err(DbError::InvalidParam("key_size, value_size and slot_count must be non-zero"));
    }
    let opts = OpenOptions {
        create: mode.contains(OpenMode::CREATE),
        write_through: mode.contains(OpenMode::WRITE_THROUGH),
        read_only: mode.contains(OpenMode::READ_ONLY),
        hash_table_size: slot_count,
        key_size,
        value_size,
        cache_capacity: OpenOptions::default().cache_capacity,
    };
    let db = Database::open(path, opts)?;
    let mut table = HANDLES.lock().unwrap();
    Ok(table.insert(db))
}

/// Close a handle, releasing shared resources if it was the last one open
/// against its database (spec §4.7 `close`).
pub fn close(handle: i32) -> DbResult<()> {
    let db = {
        let mut table = HANDLES.lock().unwrap();
        table.remove(handle).ok_or(DbError::InvalidParam("unknown handle"))?
    };
    db.close()
}

/// Validate a value's length against `purpose`: DB values may be any length
/// up to `value_size`; RCT values must equal `value_size` exactly, since an
/// RCT record is a fixed-size structured block (spec §4.7, GLOSSARY "RCT").
fn check_write_value(purpose: Purpose, value_len: usize, value_size: u64) -> DbResult<()> {
    match purpose {
        Purpose::Db if value_len as u64 <= value_size => Ok(()),
        Purpose::Rct if value_len as u64 == value_size => Ok(()),
        _ => Err(DbError::InvalidParam("value length invalid for purpose")),
    }
}

pub fn write_key(handle: i32, purpose: Purpose, key: &[u8], value: &[u8]) -> DbResult<usize> {
    with_handle(handle, |db| {
        check_key(key, db.key_size_limit())?;
        check_write_value(purpose, value.len(), db.value_size_limit())?;
        db.write_key(key, value)
    })
}

pub fn read_key(handle: i32, _purpose: Purpose, key: &[u8], buf: &mut [u8]) -> DbResult<usize> {
    with_handle(handle, |db| {
        check_key(key, db.key_size_limit())?;
        let value = db.read_key(key)?;
        if buf.len() < value.len() {
            return Err(DbError::BufferTooSmall);
        }
        buf[..value.len()].copy_from_slice(&value);
        Ok(value.len())
    })
}

pub fn key_size(handle: i32, _purpose: Purpose, key: &[u8]) -> DbResult<usize> {
    with_handle(handle, |db| {
        check_key(key, db.key_size_limit())?;
        db.key_size(key)
    })
}

pub fn delete_key(handle: i32, _purpose: Purpose, key: &[u8]) -> DbResult<()> {
    with_handle(handle, |db| {
        check_key(key, db.key_size_limit())?;
        db.delete_key(key)
    })
}

pub fn list_size(handle: i32, _purpose: Purpose) -> DbResult<usize> {
    with_handle(handle, |db| db.list_size())
}

pub fn list_keys(handle: i32, _purpose: Purpose, buf: &mut [u8]) -> DbResult<usize> {
    with_handle(handle, |db| {
        let listing = db.list_keys()?;
        if buf.len() < listing.len() {
            return Err(DbError::BufferTooSmall);
        }
        buf[..listing.len()].copy_from_slice(&listing);
        Ok(listing.len())
    })
}

/// Thin `i32`-coded adapter over the `Result`-returning entry points above,
/// for callers needing the C-ABI-shaped contract described in spec §6 --
/// a documented wrapper over the idiomatic API, not a parallel
/// implementation (see `errors.rs`'s `DbError::code`).
pub mod ffi {
    use super::*;

    pub fn open(path: &Path, mode: OpenMode, key_size: u64, value_size: u64, slot_count: u16) -> i32 {
        match super::open(path, mode, key_size, value_size, slot_count) {
            Ok(h) => h,
            Err(e) => e.code(),
        }
    }

    pub fn close(handle: i32) -> i32 {
        match super::close(handle) {
            Ok(()) => 0,
            Err(e) => e.code(),
        }
    }

    pub fn write_key(handle: i32, purpose: Purpose, key: &[u8], value: &[u8]) -> i32 {
        match super::write_key(handle, purpose, key, value) {
            Ok(n) => n as i32,
            Err(e) => e.code(),
        }
    }

    pub fn read_key(handle: i32, purpose: Purpose, key: &[u8], buf: &mut [u8]) -> i32 {
        match super::read_key(handle, purpose, key, buf) {
            Ok(n) => n as i32,
            Err(e) => e.code(),
        }
    }

    pub fn key_size(handle: i32, purpose: Purpose, key: &[u8]) -> i32 {
        match super::key_size(handle, purpose, key) {
            Ok(n) => n as i32,
            Err(e) => e.code(),
        }
    }

    pub fn delete_key(handle: i32, purpose: Purpose, key: &[u8]) -> i32 {
        match super::delete_key(handle, purpose, key) {
            Ok(()) => 0,
            Err(e) => e.code(),
        }
    }

    pub fn list_size(handle: i32, purpose: Purpose) -> i32 {
        match super::list_size(handle, purpose) {
            Ok(n) => n as i32,
            Err(e) => e.code(),
        }
    }

    pub fn list_keys(handle: i32, purpose: Purpose, buf: &mut [u8]) -> i32 {
        match super::list_keys(handle, purpose, buf) {
            Ok(n) => n as i32,
            Err(e) => e.code(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_test_db(dir: &std::path::Path) -> i32 {
        let path = dir.join("db.kdb");
        open(&path, OpenMode::CREATE | OpenMode::WRITE_THROUGH, 16, 16, 8).unwrap()
    }

    #[test]
    fn smallest_available_identifier_is_reused() {
        let dir = tempdir().unwrap();
        let h0 = open_test_db(dir.path());
        assert_eq!(h0, 0);
        close(h0).unwrap();
        let h1 = open_test_db(dir.path());
        assert_eq!(h1, 0);
        close(h1).unwrap();
    }

    #[test]
    fn write_then_read_through_dispatch() {
        let dir = tempdir().unwrap();
        let h = open_test_db(dir.path());
        write_key(h, Purpose::Db, b"k", b"v").unwrap();
        let mut buf = [0u8; 16];
        let n = read_key(h, Purpose::Db, b"k", &mut buf).unwrap();
        assert_eq!(&buf[..n], b"v");
        close(h).unwrap();
    }

    #[test]
    fn rct_write_requires_exact_value_size() {
        let dir = tempdir().unwrap();
        let h = open_test_db(dir.path());
        assert!(matches!(write_key(h, Purpose::Rct, b"k", b"short"), Err(DbError::InvalidParam(_))));
        write_key(h, Purpose::Rct, b"k", &[0u8; 16]).unwrap();
        close(h).unwrap();
    }

    #[test]
    fn read_into_undersized_buffer_fails() {
        let dir = tempdir().unwrap();
        let h = open_test_db(dir.path());
        write_key(h, Purpose::Db, b"k", b"hello world").unwrap();
        let mut buf = [0u8; 2];
        assert!(matches!(read_key(h, Purpose::Db, b"k", &mut buf), Err(DbError::BufferTooSmall)));
        close(h).unwrap();
    }

    #[test]
    fn unknown_handle_is_invalid_param() {
        assert!(matches!(close(999), Err(DbError::InvalidParam(_))));
    }
}
