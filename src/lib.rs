/*!
Embedded, append-only, crash-tolerant key-value storage engine for shared,
multi-process persistence.

A single data file holds a header, a chained hash table and paired data
blocks; every read, write and delete is serialized through a process-shared
rwlock and (in write-through mode) lands directly in the mmap. In cached
mode, mutations are absorbed into a shared-memory dirty cache and replayed
into the file only when the last handle closes. A database left open by a
crashed process is repaired at the next open via a CRC-verified hash-table
rebuild, falling back to a blind scan of the raw file when the hash table
itself cannot be trusted.

The public surface is the purpose-tagged dispatch layer in [`handle`]:
[`handle::open`], [`handle::close`], [`handle::write_key`],
[`handle::read_key`], [`handle::key_size`], [`handle::delete_key`],
[`handle::list_size`] and [`handle::list_keys`], plus an `i32`-coded adapter
in [`handle::ffi`] for callers needing that contract.
*/
#![crate_type = "lib"]
#![cfg_attr(feature = "lints", deny(warnings))]
#![warn(missing_debug_implementations, trivial_casts, unused_import_braces, unused_allocation, unused_qualifications)]
#![allow(dead_code)]

#[macro_use]
extern crate lazy_static;

#[macro_use]
extern crate quick_error;

mod block;
mod cache;
mod constants;
mod db;
mod errors;
mod handle;
mod hashtable;
mod header;
mod mmap_file;
mod page;
mod recovery;
mod shm;
mod sync;

pub use crate::errors::{DbError, DbResult};
pub use crate::handle::{close, delete_key, ffi, key_size, list_keys, list_size, open, read_key, write_key, OpenMode, Purpose};
