use std::ffi::OsString;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::{FileExt as _, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};

use fs2::FileExt;
use lazy_static::lazy_static;
use log::{debug, info, warn};
use memmap2::{Mmap, MmapOptions, MmapRaw};
use once_cell::sync::Lazy;
use parking_lot::{Mutex, MutexGuard, RwLock};

use crate::constants::{
    CopyFlags, DbFlags, EnvFlags, CORE_DBS, DATA_NAME, DEFAULT_FILE_MODE, DEFAULT_MAP_SIZE,
    DEFAULT_MAX_DBS, DEFAULT_MAX_READERS, LOCK_NAME, LOCK_SUFFIX, MAX_KEY_SIZE,
    MAX_PAGE_SIZE, META_PAGES, MIN_PAGE_SIZE, VERSION_MAJOR, VERSION_MINOR, VERSION_PATCH,
};
use crate::error::{Error, Result};
use crate::lock::LockFile;
use crate::meta::{DbRecord, MetaHeader, DB_RECORD_SIZE, META_SIZE};
use crate::page::{
    node_max, stamp_checksum, verify_checksum, PageMut, PageRef, PageSource, Pgno,
    NODE_HEADER_SIZE,
};
use crate::transaction::{RoTransaction, RwTransaction};
use crate::types::{EnvInfo, ReaderInfo, Stat};
use crate::value::{dup_comparator, key_comparator, Comparator};

lazy_static! {
    /// Flags that may be toggled on an open environment
    static ref CHANGEABLE: EnvFlags = EnvFlags::NOSYNC | EnvFlags::NOMETASYNC | EnvFlags::MAPASYNC;
}

/// Memory page size of the host, the default database page size.
static OS_PAGE_SIZE: Lazy<usize> = Lazy::new(|| {
    // SAFETY: sysconf has no preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size <= 0 {
        4096
    } else {
        size as usize
    }
});

/// Deepest tree the compacting copy follows.
const MAX_COPY_DEPTH: usize = 64;

/// A database handle registered with the environment.
#[derive(Debug, Clone)]
pub(crate) struct DbSlot {
    pub(crate) name: Option<String>,
    pub(crate) flags: DbFlags,
    pub(crate) cmp: Comparator,
    pub(crate) dcmp: Comparator,
}

impl DbSlot {
    fn new(name: Option<String>, flags: DbFlags) -> Self {
        DbSlot {
            name,
            flags,
            cmp: key_comparator(flags),
            dcmp: dup_comparator(flags),
        }
    }
}

enum DataMap {
    /// Pages are written with `pwrite`; the map is only read
    Read(Mmap),
    /// WRITEMAP: committed pages are copied into the map
    Write(MmapRaw),
}

/// Exclusive right to run a write transaction, in this process and across
/// processes.
pub(crate) struct WriterGuard<'env> {
    file: &'env File,
    _guard: MutexGuard<'env, ()>,
}

impl Drop for WriterGuard<'_> {
    fn drop(&mut self) {
        let _ = FileExt::unlock(self.file);
    }
}

/// Options for opening an [`Environment`].
#[derive(Debug, Clone)]
pub struct EnvironmentBuilder {
    map_size: usize,
    max_readers: u32,
    max_dbs: u32,
    flags: EnvFlags,
    page_size: Option<usize>,
}

impl Default for EnvironmentBuilder {
    fn default() -> Self {
        EnvironmentBuilder {
            map_size: DEFAULT_MAP_SIZE,
            max_readers: DEFAULT_MAX_READERS,
            max_dbs: DEFAULT_MAX_DBS,
            flags: EnvFlags::empty(),
            page_size: None,
        }
    }
}

impl EnvironmentBuilder {
    /// Set the size of the memory map, which is also the largest the data
    /// file may grow to.
    pub fn set_map_size(&mut self, size: usize) -> &mut Self {
        self.map_size = size;
        self
    }

    /// Set the number of reader slots. Only used by the process that
    /// creates the reader table.
    pub fn set_max_readers(&mut self, readers: u32) -> &mut Self {
        self.max_readers = readers;
        self
    }

    /// Set the maximum number of named databases.
    pub fn set_max_dbs(&mut self, dbs: u32) -> &mut Self {
        self.max_dbs = dbs;
        self
    }

    pub fn set_flags(&mut self, flags: EnvFlags) -> &mut Self {
        self.flags = flags;
        self
    }

    /// Set the page size of a new data file. Existing files keep theirs.
    pub fn set_page_size(&mut self, size: usize) -> &mut Self {
        self.page_size = Some(size);
        self
    }

    pub fn open(&self, path: &Path) -> Result<Environment> {
        self.open_with_permissions(path, DEFAULT_FILE_MODE)
    }

    /// Open the environment, creating missing files with `mode`.
    pub fn open_with_permissions(&self, path: &Path, mode: u32) -> Result<Environment> {
        let flags = self.flags;
        let read_only = flags.contains(EnvFlags::RDONLY);
        if self.max_readers == 0 {
            return Err(Error::Invalid("max readers must be at least 1"));
        }
        let (data_path, lock_path) = if flags.contains(EnvFlags::NOSUBDIR) {
            let mut lock = OsString::from(path.as_os_str());
            lock.push(LOCK_SUFFIX);
            (path.to_path_buf(), PathBuf::from(lock))
        } else {
            (path.join(DATA_NAME), path.join(LOCK_NAME))
        };

        let data_file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .create(!read_only)
            .mode(mode)
            .open(&data_path)?;
        let lock = LockFile::open(&lock_path, self.max_readers, mode)?;

        if !read_only && data_file.metadata()?.len() == 0 {
            let page_size = self.page_size.unwrap_or(*OS_PAGE_SIZE);
            if !page_size.is_power_of_two() || !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size) {
                return Err(Error::Invalid("page size must be a power of two between 512 and 32768"));
            }
            FileExt::lock_exclusive(&data_file)?;
            let created = init_file(&data_file, page_size, self.map_size, flags);
            FileExt::unlock(&data_file)?;
            created?;
        }

        let meta = read_file_meta(&data_file)?;
        let page_size = meta.page_size as usize;
        let checksum = meta.flags & EnvFlags::CHECKSUM.bits() != 0;
        let flags = (flags - EnvFlags::CHECKSUM) | if checksum { EnvFlags::CHECKSUM } else { EnvFlags::empty() };

        let file_len = data_file.metadata()?.len() as usize;
        let map_size = self
            .map_size
            .max(meta.mapsize as usize)
            .max(file_len)
            .div_ceil(page_size)
            * page_size;
        let map = map_file(&data_file, map_size, flags)?;

        let main_flags = DbFlags::from_bits_truncate(meta.dbs[1].flags);
        let max_key_size = MAX_KEY_SIZE.min(node_max(page_size) - NODE_HEADER_SIZE - DB_RECORD_SIZE);
        info!(
            "opened environment {} (page size {}, map size {}, txn {})",
            path.display(),
            page_size,
            map_size,
            meta.txnid
        );
        Ok(Environment {
            path: path.to_path_buf(),
            data_file,
            map,
            lock,
            flags: AtomicU32::new(flags.bits()),
            page_size,
            map_size,
            max_dbs: self.max_dbs,
            max_key_size,
            checksum,
            write_lock: Mutex::new(()),
            dbs: RwLock::new(vec![
                Some(DbSlot::new(None, DbFlags::empty())),
                Some(DbSlot::new(None, main_flags)),
            ]),
        })
    }
}

fn map_file(file: &File, len: usize, flags: EnvFlags) -> Result<DataMap> {
    if flags.contains(EnvFlags::WRITEMAP) && !flags.contains(EnvFlags::RDONLY) {
        Ok(DataMap::Write(MmapOptions::new().len(len).map_raw(file)?))
    } else {
        // SAFETY: pages of committed snapshots are never written, and
        // readers only look at pages their snapshot reaches.
        Ok(DataMap::Read(unsafe { MmapOptions::new().len(len).map(file)? }))
    }
}

/// Writes the two meta pages of a new data file.
fn init_file(file: &File, page_size: usize, map_size: usize, flags: EnvFlags) -> Result<()> {
    if file.metadata()?.len() != 0 {
        return Ok(());
    }
    let persistent = flags & EnvFlags::CHECKSUM;
    let meta = MetaHeader::new(page_size as u32, map_size as u64, persistent.bits());
    let mut buf = vec![0u8; page_size * META_PAGES as usize];
    let (slot0, slot1) = buf.split_at_mut(page_size);
    meta.encode_into(0, slot0);
    meta.encode_into(1, slot1);
    file.write_all_at(&buf, 0)?;
    file.sync_all()?;
    debug!("initialized data file with page size {}", page_size);
    Ok(())
}

fn read_meta_slot(file: &File, offset: u64) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; META_SIZE];
    file.read_exact_at(&mut buf, offset)
        .map_err(|_| Error::Invalid("file too short for a meta page"))?;
    Ok(buf)
}

/// Reads the newest valid meta of a data file that is not mapped yet. The
/// page size is taken from slot 0, or found by probing when slot 0 is
/// damaged.
fn read_file_meta(file: &File) -> Result<MetaHeader> {
    let slot0 = read_meta_slot(file, 0)?;
    let page_size = match MetaHeader::decode(&slot0) {
        Ok(meta) => meta.page_size as usize,
        Err(e @ (Error::Invalid(_) | Error::Corrupted(_))) => {
            warn!("meta page 0 is damaged ({}), probing for page 1", e);
            probe_page_size(file).ok_or(e)?
        }
        Err(e) => return Err(e),
    };
    let slot1 = read_meta_slot(file, page_size as u64)?;
    let meta = MetaHeader::pick(&slot0, &slot1)?;
    if let Err(e) = MetaHeader::decode(&slot1) {
        warn!("meta page 1 is damaged ({}), using txn {}", e, meta.txnid);
    }
    Ok(meta)
}

/// Page size at which a valid meta page 1 sits, if any.
fn probe_page_size(file: &File) -> Option<usize> {
    let mut probe = MIN_PAGE_SIZE;
    while probe <= MAX_PAGE_SIZE {
        if let Ok(buf) = read_meta_slot(file, probe as u64) {
            if matches!(MetaHeader::decode(&buf), Ok(m) if m.page_size as usize == probe) {
                return Some(probe);
            }
        }
        probe *= 2;
    }
    None
}

/// An open database environment: the data file, its memory map and the
/// shared reader table.
pub struct Environment {
    path: PathBuf,
    data_file: File,
    map: DataMap,
    lock: LockFile,
    flags: AtomicU32,
    page_size: usize,
    map_size: usize,
    max_dbs: u32,
    max_key_size: usize,
    checksum: bool,
    write_lock: Mutex<()>,
    dbs: RwLock<Vec<Option<DbSlot>>>,
}

impl Environment {
    /// Start configuring a new environment.
    #[allow(clippy::new_ret_no_self)]
    pub fn new() -> EnvironmentBuilder {
        EnvironmentBuilder::default()
    }

    /// Begin a read-write transaction, waiting for the current writer.
    pub fn begin_txn(&self) -> Result<RwTransaction<'_>> {
        RwTransaction::new(self, true)
    }

    /// Begin a read-write transaction, failing with `WouldBlock` if another
    /// one is running.
    pub fn try_begin_txn(&self) -> Result<RwTransaction<'_>> {
        RwTransaction::new(self, false)
    }

    /// Begin a read-only transaction on the newest snapshot.
    ///
    /// The snapshot stays pinned until the transaction ends. Pages freed
    /// by later commits cannot be reused meanwhile, so a long-lived reader
    /// under sustained writes makes the data file grow.
    pub fn begin_ro_txn(&self) -> Result<RoTransaction<'_>> {
        RoTransaction::new(self)
    }

    /// Remap the data file with at least `size` bytes, and at least the map
    /// size recorded by the newest commit. With `size` 0 this adopts the map
    /// size another handle committed with, after a begin failed with
    /// `MapResized`.
    ///
    /// No transaction of this handle can be alive while the map changes.
    pub fn set_map_size(&mut self, size: usize) -> Result<()> {
        let meta = self.read_meta()?;
        let file_len = self.data_file.metadata()?.len() as usize;
        let map_size = size
            .max(meta.mapsize as usize)
            .max(file_len)
            .div_ceil(self.page_size)
            * self.page_size;
        self.map = map_file(&self.data_file, map_size, self.get_flags())?;
        self.map_size = map_size;
        info!("remapped environment {} to {} bytes", self.path.display(), map_size);
        Ok(())
    }

    /// Copy the environment to `path`.
    ///
    /// The copy is taken from a read-only snapshot, so writers keep going
    /// meanwhile. With `CopyFlags::COMPACT` only reachable pages are written,
    /// renumbered densely, and the copy starts with an empty freelist. For
    /// environments opened with `NOSUBDIR` `path` names the new data file,
    /// otherwise an existing directory. No lock file is written.
    pub fn copy(&self, path: &Path, flags: CopyFlags) -> Result<()> {
        let dest = if self.get_flags().contains(EnvFlags::NOSUBDIR) {
            path.to_path_buf()
        } else {
            path.join(DATA_NAME)
        };
        let out = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(DEFAULT_FILE_MODE)
            .open(&dest)?;
        let txn = self.begin_ro_txn()?;
        let mut meta = txn.meta().clone();
        meta.mapsize = self.map_size as u64;

        if flags.contains(CopyFlags::COMPACT) {
            let mut compactor = Compactor {
                txn: &txn,
                out: &out,
                page_size: self.page_size,
                checksum: self.checksum,
                next: META_PAGES,
            };
            meta.dbs[0] = DbRecord::default();
            meta.dbs[1] = compactor.copy_tree(&meta.dbs[1])?;
            meta.last_pgno = compactor.next - 1;
        } else {
            let start = META_PAGES as usize * self.page_size;
            let end = (meta.last_pgno as usize + 1) * self.page_size;
            if end > start {
                out.write_all_at(self.map_slice(start, end - start)?, start as u64)?;
            }
        }

        let mut metas = vec![0u8; self.page_size * META_PAGES as usize];
        let (slot0, slot1) = metas.split_at_mut(self.page_size);
        meta.encode_into(0, slot0);
        meta.encode_into(1, slot1);
        out.write_all_at(&metas, 0)?;
        out.set_len((meta.last_pgno + 1) * self.page_size as u64)?;
        out.sync_all()?;
        info!(
            "copied snapshot {} to {} ({} pages{})",
            meta.txnid,
            dest.display(),
            meta.last_pgno + 1,
            if flags.contains(CopyFlags::COMPACT) { ", compacted" } else { "" }
        );
        Ok(())
    }

    /// Flush the data buffers to disk.
    ///
    /// Commits already sync unless `NOSYNC` or `MAPASYNC` is set; this makes
    /// up for it. With `force` the flush is synchronous even under `MAPASYNC`.
    pub fn sync(&self, force: bool) -> Result<()> {
        let flags = self.get_flags();
        if flags.contains(EnvFlags::RDONLY) {
            return Err(Error::EnvReadOnly);
        }
        match &self.map {
            DataMap::Write(map) if !force && flags.contains(EnvFlags::MAPASYNC) => map.flush_async()?,
            DataMap::Write(map) => map.flush()?,
            DataMap::Read(_) => self.data_file.sync_data()?,
        }
        Ok(())
    }

    /// Close the environment. Dropping it has the same effect.
    pub fn close(self) {
        debug!("closed environment {}", self.path.display());
    }

    /// Set or clear flags on the open environment. Only the durability
    /// flags `NOSYNC`, `NOMETASYNC` and `MAPASYNC` may change.
    pub fn set_flags(&self, flags: EnvFlags, onoff: bool) -> Result<()> {
        if !CHANGEABLE.contains(flags) {
            return Err(Error::EnvFlagsImmutable);
        }
        if onoff {
            self.flags.fetch_or(flags.bits(), Ordering::AcqRel);
        } else {
            self.flags.fetch_and(!flags.bits(), Ordering::AcqRel);
        }
        Ok(())
    }

    pub fn get_flags(&self) -> EnvFlags {
        EnvFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    /// The path given to `open`.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn max_readers(&self) -> u32 {
        self.lock.max_readers()
    }

    pub fn max_dbs(&self) -> u32 {
        self.max_dbs
    }

    /// Longest key (and DUPSORT value) the environment accepts.
    pub fn max_key_size(&self) -> usize {
        self.max_key_size
    }

    /// Engine version as (major, minor, patch)
    pub fn version() -> (i32, i32, i32) {
        (VERSION_MAJOR as i32, VERSION_MINOR as i32, VERSION_PATCH as i32)
    }

    pub fn version_string() -> String {
        format!("lumodb {}.{}.{}", VERSION_MAJOR, VERSION_MINOR, VERSION_PATCH)
    }

    /// Used reader slots of every process sharing the environment.
    pub fn reader_list(&self) -> Result<Vec<ReaderInfo>> {
        Ok(self.lock.readers())
    }

    /// Clear reader slots left behind by dead processes, returning how many
    /// were cleared.
    pub fn reader_check(&self) -> Result<usize> {
        Ok(self.lock.clear_stale())
    }

    /// Statistics of the main database in the newest snapshot.
    pub fn stat(&self) -> Result<Stat> {
        let meta = self.read_meta()?;
        let main = &meta.dbs[1];
        Ok(Stat {
            psize: self.page_size as u32,
            depth: main.depth,
            branch_pages: main.branch_pages as usize,
            leaf_pages: main.leaf_pages as usize,
            overflow_pages: main.overflow_pages as usize,
            entries: main.entries as usize,
        })
    }

    pub fn info(&self) -> Result<EnvInfo> {
        let meta = self.read_meta()?;
        Ok(EnvInfo {
            mapsize: self.map_size,
            last_pgno: meta.last_pgno as usize,
            last_txnid: meta.txnid as usize,
            max_readers: self.lock.max_readers(),
            num_readers: self.lock.num_readers(),
        })
    }

    pub(crate) fn flags(&self) -> EnvFlags {
        self.get_flags()
    }

    pub(crate) fn map_size(&self) -> usize {
        self.map_size
    }

    /// First page number beyond the map.
    pub(crate) fn max_pgno(&self) -> Pgno {
        (self.map_size / self.page_size) as Pgno
    }

    pub(crate) fn reader_table(&self) -> &LockFile {
        &self.lock
    }

    pub(crate) fn lock_writer(&self, wait: bool) -> Result<WriterGuard<'_>> {
        let guard = if wait {
            self.write_lock.lock()
        } else {
            self.write_lock.try_lock().ok_or(Error::WouldBlock)?
        };
        let locked = if wait {
            FileExt::lock_exclusive(&self.data_file)
        } else {
            FileExt::try_lock_exclusive(&self.data_file)
        };
        match locked {
            Ok(()) => Ok(WriterGuard {
                file: &self.data_file,
                _guard: guard,
            }),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Err(Error::WouldBlock),
            Err(e) => Err(e.into()),
        }
    }

    fn map_slice(&self, offset: usize, len: usize) -> Result<&[u8]> {
        let end = offset
            .checked_add(len)
            .filter(|&end| end <= self.map_size)
            .ok_or(Error::PageNotFound((offset / self.page_size) as Pgno))?;
        match &self.map {
            DataMap::Read(map) => Ok(&map[offset..end]),
            // SAFETY: the range is inside the map, which lives as long as
            // `self`; bytes a reader can reach are not written anymore.
            DataMap::Write(map) => Ok(unsafe { std::slice::from_raw_parts(map.as_ptr().add(offset), len) }),
        }
    }

    /// Newest valid meta page.
    pub(crate) fn read_meta(&self) -> Result<MetaHeader> {
        let slot0 = self.map_slice(0, META_SIZE)?;
        let slot1 = self.map_slice(self.page_size, META_SIZE)?;
        MetaHeader::pick(slot0, slot1)
    }

    /// Newest meta for a new transaction, whose pages must all lie inside
    /// this handle's map.
    pub(crate) fn snapshot_meta(&self) -> Result<MetaHeader> {
        let meta = self.read_meta()?;
        if meta.last_pgno >= self.max_pgno() {
            return Err(Error::MapResized);
        }
        Ok(meta)
    }

    /// A committed page, checked against its page number and checksum.
    pub(crate) fn map_page(&self, pgno: Pgno, last: Pgno) -> Result<PageRef<'_>> {
        if pgno > last || pgno < META_PAGES {
            return Err(Error::PageNotFound(pgno));
        }
        let bytes = self.map_slice(pgno as usize * self.page_size, self.page_size)?;
        let page = PageRef::new(bytes)?;
        if page.pgno() != pgno {
            return Err(Error::corrupted(format!("page {} claims to be page {}", pgno, page.pgno())));
        }
        if self.checksum && page.overflow_pages() == 0 && !verify_checksum(bytes) {
            return Err(Error::corrupted(format!("page {} checksum mismatch", pgno)));
        }
        Ok(page)
    }

    /// A committed overflow run, header included.
    pub(crate) fn map_run(&self, pgno: Pgno, last: Pgno) -> Result<&[u8]> {
        if pgno > last || pgno < META_PAGES {
            return Err(Error::PageNotFound(pgno));
        }
        let head = PageRef::new(self.map_slice(pgno as usize * self.page_size, self.page_size)?)?;
        let pages = head.overflow_pages().max(1);
        if head.pgno() != pgno || pgno + pages as Pgno - 1 > last {
            return Err(Error::corrupted(format!("bad overflow run at page {}", pgno)));
        }
        let run = self.map_slice(pgno as usize * self.page_size, pages * self.page_size)?;
        if self.checksum && !verify_checksum(run) {
            return Err(Error::corrupted(format!("overflow run {} checksum mismatch", pgno)));
        }
        Ok(run)
    }

    /// Writes committed pages, growing the file to hold `last_pgno`.
    pub(crate) fn write_pages(&self, pages: &mut [(Pgno, Box<[u8]>)], last_pgno: Pgno) -> Result<()> {
        let end = (last_pgno + 1) * self.page_size as u64;
        if self.data_file.metadata()?.len() < end {
            self.data_file.set_len(end)?;
        }
        for (pgno, buf) in pages.iter_mut() {
            if self.checksum {
                stamp_checksum(buf);
            }
            let offset = *pgno as usize * self.page_size;
            self.write_at(offset, buf)?;
        }
        Ok(())
    }

    fn write_at(&self, offset: usize, buf: &[u8]) -> Result<()> {
        match &self.map {
            DataMap::Read(_) => self.data_file.write_all_at(buf, offset as u64)?,
            DataMap::Write(map) => {
                if offset + buf.len() > self.map_size {
                    return Err(Error::MapFull);
                }
                // SAFETY: the range is inside the map and belongs to pages no
                // reader snapshot can reach; only the single writer copies here.
                unsafe {
                    std::ptr::copy_nonoverlapping(buf.as_ptr(), map.as_mut_ptr().add(offset), buf.len());
                }
            }
        }
        Ok(())
    }

    /// Flushes data pages written by a commit, unless `NOSYNC` is set.
    pub(crate) fn sync_data(&self) -> Result<()> {
        let flags = self.get_flags();
        if flags.contains(EnvFlags::NOSYNC) {
            return Ok(());
        }
        match &self.map {
            DataMap::Write(map) if flags.contains(EnvFlags::MAPASYNC) => map.flush_async()?,
            DataMap::Write(map) => map.flush()?,
            DataMap::Read(_) => self.data_file.sync_data()?,
        }
        Ok(())
    }

    /// Writes `meta` into the slot of its transaction id.
    pub(crate) fn write_meta(&self, meta: &MetaHeader) -> Result<()> {
        let slot = MetaHeader::slot_for(meta.txnid);
        let mut buf = vec![0u8; META_SIZE];
        meta.encode_into(slot, &mut buf);
        let offset = slot as usize * self.page_size;
        self.write_at(offset, &buf)?;
        let flags = self.get_flags();
        if flags.intersects(EnvFlags::NOSYNC | EnvFlags::NOMETASYNC) {
            return Ok(());
        }
        match &self.map {
            DataMap::Write(map) => map.flush_range(offset, META_SIZE)?,
            DataMap::Read(_) => self.data_file.sync_data()?,
        }
        Ok(())
    }

    pub(crate) fn db_slot(&self, dbi: u32) -> Result<DbSlot> {
        self.dbs
            .read()
            .get(dbi as usize)
            .cloned()
            .flatten()
            .ok_or(Error::BadDbi)
    }

    /// Registers a handle for a named database, reusing the one already
    /// open under that name.
    pub(crate) fn register_db(&self, name: &str, flags: DbFlags) -> Result<u32> {
        let mut dbs = self.dbs.write();
        if let Some(i) = dbs
            .iter()
            .position(|slot| matches!(slot, Some(s) if s.name.as_deref() == Some(name)))
        {
            return Ok(i as u32);
        }
        let named = dbs[CORE_DBS as usize..].iter().filter(|s| s.is_some()).count();
        if named >= self.max_dbs as usize {
            return Err(Error::DbsFull);
        }
        let slot = Some(DbSlot::new(Some(name.to_string()), flags));
        let dbi = match dbs[CORE_DBS as usize..].iter().position(|s| s.is_none()) {
            Some(i) => {
                dbs[CORE_DBS as usize + i] = slot;
                CORE_DBS as usize + i
            }
            None => {
                dbs.push(slot);
                dbs.len() - 1
            }
        };
        debug!("registered database {:?} as handle {}", name, dbi);
        Ok(dbi as u32)
    }

    /// Changes the stored flags of a handle and resets its comparators.
    pub(crate) fn set_db_flags(&self, dbi: u32, flags: DbFlags) -> Result<()> {
        let mut dbs = self.dbs.write();
        let slot = dbs.get_mut(dbi as usize).and_then(Option::as_mut).ok_or(Error::BadDbi)?;
        *slot = DbSlot::new(slot.name.take(), flags);
        Ok(())
    }

    pub(crate) fn set_compare(&self, dbi: u32, cmp: Comparator) -> Result<()> {
        let mut dbs = self.dbs.write();
        let slot = dbs.get_mut(dbi as usize).and_then(Option::as_mut).ok_or(Error::BadDbi)?;
        slot.cmp = cmp;
        Ok(())
    }

    pub(crate) fn set_dup_compare(&self, dbi: u32, cmp: Comparator) -> Result<()> {
        let mut dbs = self.dbs.write();
        let slot = dbs.get_mut(dbi as usize).and_then(Option::as_mut).ok_or(Error::BadDbi)?;
        if !slot.flags.contains(DbFlags::DUPSORT) {
            return Err(Error::Incompatible);
        }
        slot.dcmp = cmp;
        Ok(())
    }

    pub(crate) fn close_db(&self, dbi: u32) {
        if dbi < CORE_DBS {
            return;
        }
        if let Some(slot) = self.dbs.write().get_mut(dbi as usize) {
            *slot = None;
        }
    }
}

/// Writes the reachable pages of a snapshot densely into a new file,
/// children before their parents.
struct Compactor<'a, 'env> {
    txn: &'a RoTransaction<'env>,
    out: &'a File,
    page_size: usize,
    checksum: bool,
    next: Pgno,
}

enum Link {
    Child(Pgno),
    Run(Pgno),
    Tree(DbRecord),
}

impl Compactor<'_, '_> {
    fn emit(&mut self, buf: &mut [u8], pages: usize) -> Result<Pgno> {
        let pgno = self.next;
        self.next += pages as Pgno;
        PageMut::new(buf).set_pgno(pgno);
        if self.checksum {
            stamp_checksum(buf);
        }
        self.out.write_all_at(buf, pgno * self.page_size as u64)?;
        Ok(pgno)
    }

    fn copy_tree(&mut self, rec: &DbRecord) -> Result<DbRecord> {
        if rec.is_empty() {
            return Ok(*rec);
        }
        let root = self.copy_page(rec.root, 0)?;
        Ok(DbRecord { root, ..*rec })
    }

    fn copy_page(&mut self, pgno: Pgno, depth: usize) -> Result<Pgno> {
        if depth > MAX_COPY_DEPTH {
            return Err(Error::corrupted(format!("tree too deep at page {}", pgno)));
        }
        let page = self.txn.page(pgno)?;
        let mut links = Vec::new();
        for i in 0..page.num_keys() {
            let node = page.node(i)?;
            if page.is_branch() {
                links.push((i, Link::Child(node.pgno())));
            } else if node.is_big() {
                links.push((i, Link::Run(node.pgno())));
            } else if node.is_sub() {
                links.push((i, Link::Tree(DbRecord::decode(node.data)?)));
            }
        }
        let mut buf = page.bytes().to_vec();
        for (i, link) in links {
            match link {
                Link::Child(child) => {
                    let new = self.copy_page(child, depth + 1)?;
                    PageMut::new(&mut buf).set_child(i, new);
                }
                Link::Run(run) => {
                    let mut bytes = self.txn.page_run(run)?.to_vec();
                    let pages = bytes.len() / self.page_size;
                    let new = self.emit(&mut bytes, pages)?;
                    PageMut::new(&mut buf).set_node_data(i, &new.to_le_bytes());
                }
                Link::Tree(rec) => {
                    let copied = self.copy_tree(&rec)?;
                    PageMut::new(&mut buf).set_node_data(i, &copied.encode());
                }
            }
        }
        self.emit(&mut buf, 1)
    }
}
