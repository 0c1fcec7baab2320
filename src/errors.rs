//! Error taxonomy for the storage engine (spec §7). One `quick_error` arm
//! per kind; CRC failures discovered during recovery are handled locally
//! and never surface here (recovery changes its own decisions instead of
//! propagating an error -- see `recovery.rs`).
use std::io;

quick_error! {
    #[derive(Debug)]
    pub enum DbError {
        /// Null/bounds/length violation caught at the dispatch layer.
        InvalidParam(msg: &'static str) {
            description("invalid parameter")
            display("invalid parameter: {}", msg)
        }
        /// Any syscall failure touching the file: open, ftruncate, mmap,
        /// mremap, msync.
        Io(err: io::Error) {
            description("I/O error")
            display("I/O error: {}", err)
            from()
        }
        /// Unable to create or open a POSIX shared-memory object.
        OpenShm(msg: &'static str) {
            description("failed to open shared memory")
            display("failed to open shared memory: {}", msg)
        }
        /// Unable to map a shared-memory object into this process.
        MapShm(msg: &'static str) {
            description("failed to map shared memory")
            display("failed to map shared memory: {}", msg)
        }
        /// Unable to grow an existing shared-memory object.
        ResizeShm(msg: &'static str) {
            description("failed to resize shared memory")
            display("failed to resize shared memory: {}", msg)
        }
        /// Unable to unmap/unlink a shared-memory object at close.
        CloseShm(msg: &'static str) {
            description("failed to close shared memory")
            display("failed to close shared memory: {}", msg)
        }
        /// Heap allocation failure, or the write-back cache region is
        /// saturated. The caller must treat this as a hard failure -- the
        /// cache never silently falls through to the file.
        OutOfMemory {
            description("out of memory")
            display("out of memory or cache region saturated")
        }
        /// Point lookup or delete found no matching key. A routine outcome,
        /// not exceptional.
        NotFound {
            description("key not found")
            display("key not found")
        }
        /// Caller-provided output buffer cannot hold the value or listing.
        BufferTooSmall {
            description("buffer too small")
            display("buffer too small")
        }
        /// Mutation attempted on a read-only-opened handle.
        ReadOnly {
            description("database opened read-only")
            display("database opened read-only")
        }
        /// File header missing or unreadable -- distinct from recoverable
        /// corruption handled by `recovery.rs`.
        CorruptDbFile(msg: &'static str) {
            description("corrupt database file")
            display("corrupt database file: {}", msg)
        }
        /// Header version does not match this build's format version.
        WrongDatabaseVersion {
            description("wrong database version")
            display("database file was created with an incompatible version")
        }
        /// Unexpected condition the engine cannot otherwise classify.
        Failure(msg: &'static str) {
            description("unclassified failure")
            display("failure: {}", msg)
        }
    }
}

pub type DbResult<T> = Result<T, DbError>;

/// Negative integer error codes for the C-ABI-shaped dispatch surface
/// (spec §6). The idiomatic `Result<T, DbError>` API is authoritative;
/// these codes are a documented adapter over it, not a parallel
/// implementation.
impl DbError {
    pub fn code(&self) -> i32 {
        match *self {
            DbError::InvalidParam(_) => -3,
            DbError::Io(_) => -1,
            DbError::OpenShm(_) => -7,
            DbError::MapShm(_) => -9,
            DbError::ResizeShm(_) => -10,
            DbError::CloseShm(_) => -11,
            DbError::OutOfMemory => -2,
            DbError::NotFound => -6,
            DbError::BufferTooSmall => -13,
            DbError::ReadOnly => -14,
            DbError::CorruptDbFile(_) => -4,
            DbError::WrongDatabaseVersion => -12,
            DbError::Failure(_) => -5,
        }
    }
}
