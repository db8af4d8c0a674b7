//! The lock file: a shared reader table mapped by every process that has the
//! environment open.
//!
//! ```text
//! header (64 bytes): [magic: u32][format: u32][slots: u32][pad][num_readers: u32][pad ...]
//! slot   (64 bytes): [pid: u32][pad][thread: u64][txnid: u64][pad ...]
//! ```
//!
//! A slot belongs to whoever swapped its pid from zero. Its txnid pins the
//! snapshot a read transaction is using; `IDLE` means nothing is pinned.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use fs2::FileExt;
use log::{trace, warn};
use memmap2::{MmapOptions, MmapRaw};

use crate::constants::{LOCK_MAGIC, LOCK_VERSION};
use crate::error::{Error, Result};
use crate::types::ReaderInfo;

const HEADER_SIZE: usize = 64;
const SLOT_SIZE: usize = 64;

const MAGIC_OFFSET: usize = 0;
const FORMAT_OFFSET: usize = 4;
const SLOTS_OFFSET: usize = 8;
const NUM_READERS_OFFSET: usize = 16;

const SLOT_PID: usize = 0;
const SLOT_TID: usize = 8;
const SLOT_TXNID: usize = 16;

/// Slot txnid meaning "no snapshot pinned"
pub(crate) const IDLE: u64 = u64::MAX;

pub(crate) struct LockFile {
    file: File,
    map: MmapRaw,
    slots: usize,
}

impl LockFile {
    /// Opens or creates the lock file. The first process to open it resets
    /// the reader table; everyone then holds a shared `flock` on it for as
    /// long as the environment is open.
    pub(crate) fn open(path: &Path, max_readers: u32, mode: u32) -> Result<LockFile> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .mode(mode)
            .open(path)?;

        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => {
                let slots = max_readers as usize;
                let len = (HEADER_SIZE + slots * SLOT_SIZE) as u64;
                file.set_len(0)?;
                file.set_len(len)?;
                let map = MmapOptions::new().len(len as usize).map_raw(&file)?;
                let lock = LockFile { file, map, slots };
                lock.u32_at(SLOTS_OFFSET).store(max_readers, Ordering::Relaxed);
                lock.u32_at(FORMAT_OFFSET).store(LOCK_VERSION, Ordering::Relaxed);
                lock.u32_at(MAGIC_OFFSET).store(LOCK_MAGIC, Ordering::Release);
                FileExt::lock_shared(&lock.file)?;
                trace!("reset reader table at {} with {} slots", path.display(), slots);
                Ok(lock)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                FileExt::lock_shared(&file)?;
                let len = file.metadata()?.len() as usize;
                if len < HEADER_SIZE {
                    return Err(Error::Invalid("lock file too short"));
                }
                let map = MmapOptions::new().len(len).map_raw(&file)?;
                let mut lock = LockFile {
                    file,
                    map,
                    slots: 0,
                };
                if lock.u32_at(MAGIC_OFFSET).load(Ordering::Acquire) != LOCK_MAGIC {
                    return Err(Error::Invalid("not a lumodb lock file"));
                }
                let format = lock.u32_at(FORMAT_OFFSET).load(Ordering::Relaxed);
                if format != LOCK_VERSION {
                    return Err(Error::VersionMismatch {
                        found: format,
                        expected: LOCK_VERSION,
                    });
                }
                let slots = lock.u32_at(SLOTS_OFFSET).load(Ordering::Relaxed) as usize;
                if HEADER_SIZE + slots * SLOT_SIZE > len {
                    return Err(Error::Invalid("lock file shorter than its reader table"));
                }
                lock.slots = slots;
                Ok(lock)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn u32_at(&self, off: usize) -> &AtomicU32 {
        debug_assert!(off % 4 == 0 && off + 4 <= self.map.len());
        // SAFETY: the map is page aligned, `off` is 4-aligned and in bounds,
        // and every process only touches these words atomically.
        unsafe { &*(self.map.as_mut_ptr().add(off) as *const AtomicU32) }
    }

    fn u64_at(&self, off: usize) -> &AtomicU64 {
        debug_assert!(off % 8 == 0 && off + 8 <= self.map.len());
        // SAFETY: as for `u32_at`, with 8-byte alignment.
        unsafe { &*(self.map.as_mut_ptr().add(off) as *const AtomicU64) }
    }

    fn slot_pid(&self, i: usize) -> &AtomicU32 {
        self.u32_at(HEADER_SIZE + i * SLOT_SIZE + SLOT_PID)
    }

    fn slot_tid(&self, i: usize) -> &AtomicU64 {
        self.u64_at(HEADER_SIZE + i * SLOT_SIZE + SLOT_TID)
    }

    fn slot_txnid(&self, i: usize) -> &AtomicU64 {
        self.u64_at(HEADER_SIZE + i * SLOT_SIZE + SLOT_TXNID)
    }

    pub(crate) fn max_readers(&self) -> u32 {
        self.slots as u32
    }

    /// High-water mark of slots ever claimed since the table was reset.
    pub(crate) fn num_readers(&self) -> u32 {
        self.u32_at(NUM_READERS_OFFSET).load(Ordering::Acquire)
    }

    /// Claims a free reader slot.
    pub(crate) fn acquire(&self) -> Result<ReaderSlot<'_>> {
        let pid = std::process::id();
        // SAFETY: pthread_self has no preconditions.
        let tid = unsafe { libc::pthread_self() } as u64;
        for i in 0..self.slots {
            if self
                .slot_pid(i)
                .compare_exchange(0, pid, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                self.slot_txnid(i).store(IDLE, Ordering::SeqCst);
                self.slot_tid(i).store(tid, Ordering::Relaxed);
                self.u32_at(NUM_READERS_OFFSET)
                    .fetch_max(i as u32 + 1, Ordering::AcqRel);
                trace!("claimed reader slot {}", i);
                return Ok(ReaderSlot {
                    lock: self,
                    index: i,
                });
            }
        }
        Err(Error::ReadersFull)
    }

    /// Smallest snapshot pinned by any reader, capped at `bound`.
    pub(crate) fn oldest_reader(&self, bound: u64) -> u64 {
        let n = (self.num_readers() as usize).min(self.slots);
        (0..n)
            .filter(|&i| self.slot_pid(i).load(Ordering::Acquire) != 0)
            .map(|i| self.slot_txnid(i).load(Ordering::SeqCst))
            .fold(bound, u64::min)
    }

    pub(crate) fn readers(&self) -> Vec<ReaderInfo> {
        let n = (self.num_readers() as usize).min(self.slots);
        (0..n)
            .filter_map(|i| {
                let pid = self.slot_pid(i).load(Ordering::Acquire);
                if pid == 0 {
                    return None;
                }
                let txnid = self.slot_txnid(i).load(Ordering::Acquire);
                Some(ReaderInfo {
                    pid,
                    thread: self.slot_tid(i).load(Ordering::Relaxed),
                    txnid: (txnid != IDLE).then_some(txnid),
                })
            })
            .collect()
    }

    /// Clears slots owned by processes that no longer exist. Returns how
    /// many slots were freed.
    pub(crate) fn clear_stale(&self) -> usize {
        let own = std::process::id();
        let n = (self.num_readers() as usize).min(self.slots);
        let mut cleared = 0;
        for i in 0..n {
            let pid = self.slot_pid(i).load(Ordering::Acquire);
            if pid == 0 || pid == own || process_alive(pid) {
                continue;
            }
            self.slot_txnid(i).store(IDLE, Ordering::SeqCst);
            if self
                .slot_pid(i)
                .compare_exchange(pid, 0, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                warn!("cleared reader slot {} of dead process {}", i, pid);
                cleared += 1;
            }
        }
        cleared
    }
}

fn process_alive(pid: u32) -> bool {
    // SAFETY: signal 0 only probes for the process.
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    rc == 0 || io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH)
}

impl Drop for LockFile {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

/// A claimed reader slot, released on drop.
pub(crate) struct ReaderSlot<'a> {
    lock: &'a LockFile,
    index: usize,
}

impl ReaderSlot<'_> {
    pub(crate) fn pin(&self, txnid: u64) {
        self.lock.slot_txnid(self.index).store(txnid, Ordering::SeqCst);
    }

    pub(crate) fn unpin(&self) {
        self.lock.slot_txnid(self.index).store(IDLE, Ordering::SeqCst);
    }
}

impl Drop for ReaderSlot<'_> {
    fn drop(&mut self) {
        self.unpin();
        self.lock.slot_pid(self.index).store(0, Ordering::Release);
        trace!("released reader slot {}", self.index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_slots_pin_and_release() {
        let dir = TempDir::new().unwrap();
        let lock = LockFile::open(&dir.path().join("lock.mdb"), 2, 0o644).unwrap();
        assert_eq!(lock.max_readers(), 2);

        let a = lock.acquire().unwrap();
        let b = lock.acquire().unwrap();
        assert!(matches!(lock.acquire(), Err(Error::ReadersFull)));

        a.pin(5);
        b.pin(3);
        assert_eq!(lock.oldest_reader(10), 3);
        assert_eq!(lock.oldest_reader(2), 2);

        drop(b);
        assert_eq!(lock.oldest_reader(10), 5);
        let readers = lock.readers();
        assert_eq!(readers.len(), 1);
        assert_eq!(readers[0].pid, std::process::id());
        assert_eq!(readers[0].txnid, Some(5));
        assert_eq!(lock.num_readers(), 2);

        let _c = lock.acquire().unwrap();
        assert_eq!(lock.clear_stale(), 0);
    }

    #[test]
    fn test_slots_of_dead_processes_are_cleared() {
        let dir = TempDir::new().unwrap();
        let lock = LockFile::open(&dir.path().join("lock.mdb"), 4, 0o644).unwrap();

        let mut child = std::process::Command::new("true").spawn().unwrap();
        let dead = child.id();
        child.wait().unwrap();

        let live = lock.acquire().unwrap();
        live.pin(7);
        let orphan = lock.acquire().unwrap();
        orphan.pin(4);
        lock.slot_pid(orphan.index).store(dead, Ordering::Release);
        assert_eq!(lock.oldest_reader(10), 4);
        assert_eq!(lock.readers().len(), 2);

        assert_eq!(lock.clear_stale(), 1);
        assert_eq!(lock.oldest_reader(10), 7);
        let readers = lock.readers();
        assert_eq!(readers.len(), 1);
        assert_eq!(readers[0].txnid, Some(7));
        assert_eq!(lock.clear_stale(), 0);

        // The freed slot is handed out again
        std::mem::forget(orphan);
        let reused = lock.acquire().unwrap();
        assert_eq!(reused.index, 1);
    }

    #[test]
    fn test_second_open_shares_the_table() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("lock.mdb");
        let first = LockFile::open(&path, 4, 0o644).unwrap();
        let slot = first.acquire().unwrap();
        slot.pin(9);

        let second = LockFile::open(&path, 16, 0o644).unwrap();
        assert_eq!(second.max_readers(), 4);
        assert_eq!(second.oldest_reader(u64::MAX), 9);
    }
}
