//! Cross-process synchronization primitives (spec §4.5): a named POSIX
//! semaphore guarding the open/close critical sections, and a
//! process-shared rwlock embedded directly in the shared control block.
//! The design deliberately uses only write-mode locking -- mmap growth is
//! treated as intrinsically exclusive, so there is no read-mode path here,
//! mirroring the original's `Kdb_wrlock`/`Kdb_unlock` pair (its `Kdb_rdlock`
//! was never wired up either).
use std::ffi::CString;

use crate::errors::DbError;

/// A named semaphore used as an exclusive latch around a database's
/// open-and-initialize and close-and-teardown sequences (spec §4.5 item 1).
pub struct NamedSemaphore {
    handle: *mut libc::sem_t,
}

// The semaphore is process-shared by construction; the handle itself is
// just a pointer into the kernel's semaphore table and is safe to hand
// across threads within this process.
unsafe impl Send for NamedSemaphore {}
unsafe impl Sync for NamedSemaphore {}

impl NamedSemaphore {
    /// Create the semaphore if it does not exist yet, otherwise open the
    /// existing one (mirrors `kdbShmemOpen`'s O_CREAT|O_EXCL-then-fallback
    /// pattern, applied to `sem_open`).
    pub fn open_or_create(name: &str) -> Result<NamedSemaphore, DbError> {
        let cname = CString::new(name).map_err(|_| DbError::InvalidParam("semaphore name contains NUL"))?;
        let handle = unsafe {
            libc::sem_open(cname.as_ptr(), libc::O_CREAT, 0o600 as libc::mode_t, 1u32)
        };
        if handle as usize == libc::SEM_FAILED as usize {
            return Err(DbError::OpenShm("sem_open failed"));
        }
        Ok(NamedSemaphore { handle })
    }

    /// Acquire the semaphore, returning a guard that releases it on drop.
    pub fn acquire(&self) -> SemGuard<'_> {
        unsafe {
            libc::sem_wait(self.handle);
        }
        SemGuard { sem: self }
    }

    fn post(&self) {
        unsafe {
            libc::sem_post(self.handle);
        }
    }

    pub fn close(self) -> Result<(), DbError> {
        let rc = unsafe { libc::sem_close(self.handle) };
        if rc != 0 {
            return Err(DbError::CloseShm("sem_close failed"));
        }
        Ok(())
    }

    /// Unlink the named semaphore. Only the last closer of a database
    /// should call this (spec §4.5 "Shared-resource policy").
    pub fn unlink(name: &str) -> Result<(), DbError> {
        let cname = CString::new(name).map_err(|_| DbError::InvalidParam("semaphore name contains NUL"))?;
        let rc = unsafe { libc::sem_unlink(cname.as_ptr()) };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() != std::io::ErrorKind::NotFound {
                return Err(DbError::CloseShm("sem_unlink failed"));
            }
        }
        Ok(())
    }
}

/// RAII guard releasing a `NamedSemaphore` acquisition.
pub struct SemGuard<'a> {
    sem: &'a NamedSemaphore,
}

impl<'a> Drop for SemGuard<'a> {
    fn drop(&mut self) {
        self.sem.post();
    }
}

/// Byte size a `SharedRwLock` occupies when embedded in shared memory.
pub fn rwlock_size() -> usize {
    std::mem::size_of::<libc::pthread_rwlock_t>()
}

/// A `pthread_rwlock_t` living at a fixed offset inside a process-shared
/// memory region (spec §4.5 item 2, §3 "Shared control block"). Only the
/// first opener initializes it; every later opener just attaches to the
/// already-initialized bytes.
pub struct SharedRwLock {
    ptr: *mut libc::pthread_rwlock_t,
}

unsafe impl Send for SharedRwLock {}
unsafe impl Sync for SharedRwLock {}

impl SharedRwLock {
    /// Initialize a fresh rwlock at `ptr` with the process-shared
    /// attribute set. Caller must ensure `ptr` points at
    /// `rwlock_size()` zeroed, stable (non-moving) bytes.
    pub unsafe fn init_at(ptr: *mut u8) -> Result<SharedRwLock, DbError> {
        let lock_ptr = ptr as *mut libc::pthread_rwlock_t;
        let mut attr: libc::pthread_rwlockattr_t = std::mem::zeroed();
        if libc::pthread_rwlockattr_init(&mut attr) != 0 {
            return Err(DbError::Failure("pthread_rwlockattr_init failed"));
        }
        if libc::pthread_rwlockattr_setpshared(&mut attr, libc::PTHREAD_PROCESS_SHARED) != 0 {
            libc::pthread_rwlockattr_destroy(&mut attr);
            return Err(DbError::Failure("pthread_rwlockattr_setpshared failed"));
        }
        let rc = libc::pthread_rwlock_init(lock_ptr, &attr);
        libc::pthread_rwlockattr_destroy(&mut attr);
        if rc != 0 {
            return Err(DbError::Failure("pthread_rwlock_init failed"));
        }
        Ok(SharedRwLock { ptr: lock_ptr })
    }

    /// Attach to a rwlock some other process already initialized.
    pub unsafe fn from_existing(ptr: *mut u8) -> SharedRwLock {
        SharedRwLock {
            ptr: ptr as *mut libc::pthread_rwlock_t,
        }
    }

    /// Acquire in write mode. Every public engine operation uses this --
    /// the design has no read-mode path (spec §4.5, §5).
    pub fn write_lock(&self) -> RwWriteGuard<'_> {
        unsafe {
            libc::pthread_rwlock_wrlock(self.ptr);
        }
        RwWriteGuard { lock: self }
    }
}

pub struct RwWriteGuard<'a> {
    lock: &'a SharedRwLock,
}

impl<'a> Drop for RwWriteGuard<'a> {
    fn drop(&mut self) {
        unsafe {
            libc::pthread_rwlock_unlock(self.lock.ptr);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn semaphore_round_trips() {
        let name = format!("/kissdb-test-sem-{}", std::process::id());
        let sem = NamedSemaphore::open_or_create(&name).unwrap();
        {
            let _g = sem.acquire();
        }
        sem.close().unwrap();
        NamedSemaphore::unlink(&name).unwrap();
    }

    #[test]
    fn rwlock_excludes_writers() {
        let mut buf = vec![0u8; rwlock_size()];
        let lock = unsafe { SharedRwLock::init_at(buf.as_mut_ptr()).unwrap() };
        let g1 = lock.write_lock();
        drop(g1);
        let _g2 = lock.write_lock();
    }
}
