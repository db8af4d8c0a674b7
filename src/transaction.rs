use std::cell::RefCell;
use std::collections::HashMap;
use std::ops::{Deref, DerefMut};

use log::{debug, trace};

use crate::btree;
use crate::constants::{
    DbFlags, EnvFlags, TransactionFlags, WriteFlags, CORE_DBS, FREE_DBI, MAIN_DBI,
};
use crate::cursor::{RoCursor, RwCursor};
use crate::database::Database;
use crate::env::{DbSlot, Environment, WriterGuard};
use crate::error::{Error, Result};
use crate::freelist;
use crate::lock::ReaderSlot;
use crate::meta::{DbRecord, MetaHeader};
use crate::midl::Idl;
use crate::page::{PageMut, PageRef, PageSource, Pgno};
use crate::types::Stat;
use crate::value::Comparator;

/// A database as seen by one transaction: its record plus the comparators
/// in force.
#[derive(Debug, Clone, Copy)]
pub struct TxnDb {
    pub(crate) rec: DbRecord,
    pub(crate) cmp: Comparator,
    pub(crate) dcmp: Comparator,
    /// The record changed in this transaction
    pub(crate) dirty: bool,
}

impl TxnDb {
    pub(crate) fn new(rec: DbRecord, slot: &DbSlot) -> Self {
        TxnDb {
            rec,
            cmp: slot.cmp,
            dcmp: slot.dcmp,
            dirty: false,
        }
    }

    pub(crate) fn flags(&self) -> DbFlags {
        DbFlags::from_bits_truncate(self.rec.flags)
    }

    pub(crate) fn is_dupsort(&self) -> bool {
        self.flags().contains(DbFlags::DUPSORT)
    }

    pub(crate) fn stat(&self, page_size: usize) -> Stat {
        Stat {
            psize: page_size as u32,
            depth: self.rec.depth,
            branch_pages: self.rec.branch_pages as usize,
            leaf_pages: self.rec.leaf_pages as usize,
            overflow_pages: self.rec.overflow_pages as usize,
            entries: self.rec.entries as usize,
        }
    }
}

/// Internal access every transaction kind provides.
pub trait TxnAccess: PageSource {
    fn txn_env(&self) -> &Environment;
    fn txn_id(&self) -> u64;
    fn txn_db(&self, dbi: u32) -> Result<TxnDb>;
}

/// Operations shared by read-only and read-write transactions.
pub trait Transaction: TxnAccess {
    /// Snapshot (read-only) or new (read-write) transaction id.
    fn id(&self) -> u64 {
        self.txn_id()
    }

    fn env(&self) -> &Environment {
        self.txn_env()
    }

    /// Gets the value for `key`, the first duplicate for DUPSORT databases.
    fn get<'t>(&'t self, db: Database, key: &[u8]) -> Result<&'t [u8]> {
        let tdb = self.txn_db(db.dbi())?;
        btree::get(self, &tdb, key)?.ok_or(Error::NotFound)
    }

    fn open_ro_cursor(&self, db: Database) -> Result<RoCursor<'_>>
    where
        Self: Sized,
    {
        RoCursor::new(self, db.dbi())
    }

    fn stat(&self, db: Database) -> Result<Stat> {
        let tdb = self.txn_db(db.dbi())?;
        Ok(tdb.stat(self.txn_env().page_size()))
    }

    fn db_flags(&self, db: Database) -> Result<DbFlags> {
        Ok(self.txn_db(db.dbi())?.flags())
    }
}

/// Loads a named database record from the main tree of `txn`.
pub(crate) fn load_named<T: TxnAccess + ?Sized>(txn: &T, dbi: u32) -> Result<TxnDb> {
    let slot = txn.txn_env().db_slot(dbi)?;
    let name = slot.name.as_deref().ok_or(Error::BadDbi)?;
    let main = txn.txn_db(MAIN_DBI)?;
    match btree::find_record(txn, &main, name.as_bytes())? {
        Some(rec) => Ok(TxnDb::new(rec, &slot)),
        None => Err(Error::BadDbi),
    }
}

/// Read-only transaction over a pinned snapshot
///
/// While it lives, pages freed by newer commits stay reserved for it, so
/// keeping one open across many write transactions grows the data file.
pub struct RoTransaction<'env> {
    env: &'env Environment,
    meta: MetaHeader,
    slot: ReaderSlot<'env>,
    dbs: RefCell<Vec<Option<TxnDb>>>,
}

impl<'env> RoTransaction<'env> {
    pub(crate) fn new(env: &'env Environment) -> Result<Self> {
        let slot = env.reader_table().acquire()?;
        // A commit may land between reading the meta and publishing the pin;
        // retry until the pinned snapshot is still the newest one.
        let meta = loop {
            let meta = env.snapshot_meta()?;
            slot.pin(meta.txnid);
            if env.read_meta()?.txnid == meta.txnid {
                break meta;
            }
        };
        trace!("began read txn on snapshot {}", meta.txnid);
        let free = TxnDb::new(meta.dbs[0], &env.db_slot(FREE_DBI)?);
        let main = TxnDb::new(meta.dbs[1], &env.db_slot(MAIN_DBI)?);
        Ok(RoTransaction {
            env,
            meta,
            slot,
            dbs: RefCell::new(vec![Some(free), Some(main)]),
        })
    }

    /// Ends the transaction. Equivalent to dropping it.
    pub fn commit(self) -> Result<()> {
        Ok(())
    }

    pub fn abort(self) {}

    pub(crate) fn meta(&self) -> &MetaHeader {
        &self.meta
    }
}

impl PageSource for RoTransaction<'_> {
    fn page(&self, pgno: Pgno) -> Result<PageRef<'_>> {
        self.env.map_page(pgno, self.meta.last_pgno)
    }

    fn page_run(&self, pgno: Pgno) -> Result<&[u8]> {
        self.env.map_run(pgno, self.meta.last_pgno)
    }
}

impl TxnAccess for RoTransaction<'_> {
    fn txn_env(&self) -> &Environment {
        self.env
    }

    fn txn_id(&self) -> u64 {
        self.meta.txnid
    }

    fn txn_db(&self, dbi: u32) -> Result<TxnDb> {
        let cached = self.dbs.borrow().get(dbi as usize).copied().flatten();
        let db = match cached {
            Some(db) => db,
            None => {
                let db = load_named(self, dbi)?;
                let mut dbs = self.dbs.borrow_mut();
                if dbs.len() <= dbi as usize {
                    dbs.resize(dbi as usize + 1, None);
                }
                dbs[dbi as usize] = Some(db);
                db
            }
        };
        let slot = self.env.db_slot(dbi)?;
        Ok(TxnDb {
            cmp: slot.cmp,
            dcmp: slot.dcmp,
            ..db
        })
    }
}

impl Transaction for RoTransaction<'_> {}

impl Drop for RoTransaction<'_> {
    fn drop(&mut self) {
        self.slot.unpin();
        trace!("ended read txn on snapshot {}", self.meta.txnid);
    }
}

/// Allocation state of a write transaction, saved and restored around
/// nested transactions.
#[derive(Debug, Clone)]
pub(crate) struct WriteState {
    /// First never-used page number
    pub(crate) next_pgno: Pgno,
    /// Pages of the committed snapshot this transaction released
    pub(crate) free_pgs: Idl,
    /// Pages allocated and released again by this transaction
    pub(crate) loose: Vec<Pgno>,
    /// Pages taken from old freelist records, not yet handed out
    pub(crate) reclaimed: Idl,
    /// Freelist records consumed into `reclaimed`
    pub(crate) reclaimed_keys: Vec<u64>,
    pub(crate) last_reclaimed: u64,
    pub(crate) dbs: Vec<Option<TxnDb>>,
}

struct Level {
    dirty: HashMap<Pgno, Box<[u8]>>,
    /// Parent state to restore if this level aborts
    saved: Option<WriteState>,
    flags: TransactionFlags,
}

impl Level {
    fn new(saved: Option<WriteState>) -> Self {
        Level {
            dirty: HashMap::new(),
            saved,
            flags: TransactionFlags::empty(),
        }
    }
}

/// The single read-write transaction of an environment
pub struct RwTransaction<'env> {
    env: &'env Environment,
    _writer: WriterGuard<'env>,
    txnid: u64,
    meta: MetaHeader,
    pub(crate) state: WriteState,
    levels: Vec<Level>,
    oldest: Option<u64>,
    /// Set while the freelist is written; no further records are reclaimed
    pub(crate) saving: bool,
    /// Allocation only extends the file
    pub(crate) extend_only: bool,
    flags: TransactionFlags,
}

impl<'env> RwTransaction<'env> {
    pub(crate) fn new(env: &'env Environment, wait: bool) -> Result<Self> {
        if env.flags().contains(EnvFlags::RDONLY) {
            return Err(Error::EnvReadOnly);
        }
        let writer = env.lock_writer(wait)?;
        let meta = env.snapshot_meta()?;
        let txnid = meta.txnid + 1;
        let free = TxnDb::new(meta.dbs[0], &env.db_slot(FREE_DBI)?);
        let main = TxnDb::new(meta.dbs[1], &env.db_slot(MAIN_DBI)?);
        debug!("began write txn {}", txnid);
        Ok(RwTransaction {
            env,
            _writer: writer,
            txnid,
            state: WriteState {
                next_pgno: meta.last_pgno + 1,
                free_pgs: Idl::new(),
                loose: Vec::new(),
                reclaimed: Idl::new(),
                reclaimed_keys: Vec::new(),
                last_reclaimed: 0,
                dbs: vec![Some(free), Some(main)],
            },
            meta,
            levels: vec![Level::new(None)],
            oldest: None,
            saving: false,
            extend_only: false,
            flags: TransactionFlags::empty(),
        })
    }

    fn top(&self) -> &Level {
        &self.levels[self.levels.len() - 1]
    }

    fn top_mut(&mut self) -> &mut Level {
        let n = self.levels.len();
        &mut self.levels[n - 1]
    }

    /// Fails once a write in the current level went wrong halfway.
    pub(crate) fn check_usable(&self) -> Result<()> {
        if self.top().flags.contains(TransactionFlags::ERROR) {
            Err(Error::BadTxn)
        } else {
            Ok(())
        }
    }

    fn mark_error(&mut self) {
        self.top_mut().flags.insert(TransactionFlags::ERROR);
    }

    /// Runs a mutation of database `dbi`, storing the updated record on
    /// success and poisoning the level on a non-benign failure.
    pub(crate) fn with_db<R>(
        &mut self,
        dbi: u32,
        f: impl FnOnce(&mut Self, &mut TxnDb) -> Result<R>,
    ) -> Result<R> {
        self.check_usable()?;
        let mut db = self.txn_db(dbi)?;
        let before = db.rec;
        match f(self, &mut db) {
            Ok(out) => {
                if db.rec != before {
                    db.dirty = true;
                }
                self.set_db(dbi, Some(db));
                Ok(out)
            }
            Err(e) => {
                if !e.is_benign() {
                    self.mark_error();
                }
                Err(e)
            }
        }
    }

    pub(crate) fn set_db(&mut self, dbi: u32, db: Option<TxnDb>) {
        let dbs = &mut self.state.dbs;
        if dbs.len() <= dbi as usize {
            dbs.resize(dbi as usize + 1, None);
        }
        dbs[dbi as usize] = db;
    }

    /// Forgets every cached named database record.
    pub(crate) fn forget_named(&mut self) {
        self.state.dbs.truncate(CORE_DBS as usize);
    }

    fn find_dirty(&self, pgno: Pgno) -> Option<&[u8]> {
        self.levels
            .iter()
            .rev()
            .find_map(|level| level.dirty.get(&pgno))
            .map(|buf| &buf[..])
    }

    pub(crate) fn is_dirty_top(&self, pgno: Pgno) -> bool {
        self.top().dirty.contains_key(&pgno)
    }

    /// Snapshot id below which freelist records may be reused.
    pub(crate) fn oldest_reader(&mut self) -> u64 {
        let (env, txnid) = (self.env, self.txnid);
        *self
            .oldest
            .get_or_insert_with(|| env.reader_table().oldest_reader(txnid))
    }

    /// Allocates `count` contiguous zeroed pages, dirty in the current level.
    pub(crate) fn page_alloc(&mut self, count: usize) -> Result<Pgno> {
        let pgno = self.alloc_pgno(count)?;
        let buf = vec![0u8; count * self.env.page_size()].into_boxed_slice();
        self.top_mut().dirty.insert(pgno, buf);
        trace!("allocated {} page(s) at {}", count, pgno);
        Ok(pgno)
    }

    fn alloc_pgno(&mut self, count: usize) -> Result<Pgno> {
        if !self.extend_only {
            if count == 1 {
                if let Some(pgno) = self.state.loose.pop() {
                    return Ok(pgno);
                }
            }
            loop {
                if let Some(pgno) = self.state.reclaimed.take_run(count) {
                    return Ok(pgno);
                }
                if self.saving || !freelist::reclaim_next(self)? {
                    break;
                }
            }
        }
        let pgno = self.state.next_pgno;
        if pgno + count as u64 > self.env.max_pgno() {
            return Err(Error::MapFull);
        }
        self.state.next_pgno += count as u64;
        Ok(pgno)
    }

    /// Makes `pgno` writable in the current level, returning the page number
    /// the writable copy lives under.
    pub(crate) fn page_touch(&mut self, pgno: Pgno) -> Result<Pgno> {
        if self.is_dirty_top(pgno) {
            return Ok(pgno);
        }
        if let Some(buf) = self.find_dirty(pgno) {
            let copy: Box<[u8]> = buf.into();
            self.top_mut().dirty.insert(pgno, copy);
            return Ok(pgno);
        }
        let mut copy: Box<[u8]> = self.env.map_page(pgno, self.meta.last_pgno)?.bytes().into();
        let new = self.alloc_pgno(1)?;
        PageMut::new(&mut copy).set_pgno(new);
        self.top_mut().dirty.insert(new, copy);
        self.state.free_pgs.insert(pgno);
        trace!("touched page {} as {}", pgno, new);
        Ok(new)
    }

    pub(crate) fn page_mut(&mut self, pgno: Pgno) -> Result<PageMut<'_>> {
        self.top_mut()
            .dirty
            .get_mut(&pgno)
            .map(|buf| PageMut::new(buf))
            .ok_or_else(|| Error::corrupted(format!("page {} is not writable", pgno)))
    }

    /// Releases `count` pages starting at `pgno`.
    pub(crate) fn page_free(&mut self, pgno: Pgno, count: usize) {
        let in_top = self.top_mut().dirty.remove(&pgno).is_some();
        let in_lower = in_top || self.find_dirty(pgno).is_some();
        for p in pgno..pgno + count as u64 {
            if in_lower {
                self.state.loose.push(p);
            } else {
                self.state.free_pgs.insert(p);
            }
        }
    }

    /// Starts a child transaction. The parent is unusable until the child
    /// commits or aborts.
    pub fn begin_nested_txn(&mut self) -> Result<NestedTransaction<'_, 'env>> {
        self.check_usable()?;
        let saved = self.state.clone();
        self.levels.push(Level::new(Some(saved)));
        debug!("began nested txn at depth {}", self.levels.len() - 1);
        Ok(NestedTransaction {
            txn: self,
            finished: false,
        })
    }

    pub fn put(&mut self, db: Database, key: &[u8], data: &[u8], flags: WriteFlags) -> Result<()> {
        self.with_db(db.dbi(), |txn, tdb| btree::put(txn, tdb, key, data, flags))
    }

    /// Deletes `key`; for DUPSORT databases `data` selects a single duplicate.
    pub fn del(&mut self, db: Database, key: &[u8], data: Option<&[u8]>) -> Result<()> {
        self.with_db(db.dbi(), |txn, tdb| btree::del(txn, tdb, key, data))
    }

    /// Removes every entry of `db`, freeing its pages. Emptying the main
    /// database also deletes every named database.
    pub fn clear_db(&mut self, db: Database) -> Result<()> {
        let dbi = db.dbi();
        if dbi == MAIN_DBI {
            self.flush_named()?;
        }
        self.with_db(dbi, |txn, tdb| {
            btree::free_tree(txn, &tdb.rec)?;
            tdb.rec = DbRecord::with_flags(tdb.rec.flags);
            Ok(())
        })?;
        if dbi == MAIN_DBI {
            self.forget_named();
        }
        Ok(())
    }

    /// Deletes a named database and closes its handle.
    pub fn drop_db(&mut self, db: Database) -> Result<()> {
        let dbi = db.dbi();
        if dbi < CORE_DBS {
            return Err(Error::Invalid("core databases cannot be deleted"));
        }
        let name = self.env.db_slot(dbi)?.name.ok_or(Error::BadDbi)?;
        let tdb = self.txn_db(dbi)?;
        self.with_db(MAIN_DBI, |txn, main| {
            btree::free_tree(txn, &tdb.rec)?;
            btree::remove_key(txn, main, name.as_bytes())
        })?;
        self.set_db(dbi, None);
        self.env.close_db(dbi);
        debug!("dropped database {:?}", name);
        Ok(())
    }

    pub fn open_rw_cursor(&mut self, db: Database) -> Result<RwCursor<'_, 'env>> {
        RwCursor::new(self, db.dbi())
    }

    /// Commits the transaction, making it the newest snapshot.
    pub fn commit(mut self) -> Result<()> {
        self.check_usable()?;
        self.commit_inner()?;
        self.flags.insert(TransactionFlags::FINISHED);
        Ok(())
    }

    /// Discards every change. Equivalent to dropping the transaction.
    pub fn abort(self) {}

    fn unchanged(&self) -> bool {
        self.top().dirty.is_empty()
            && self.state.free_pgs.is_empty()
            && self.state.loose.is_empty()
            && self.state.reclaimed_keys.is_empty()
            && self.state.dbs[..CORE_DBS as usize]
                .iter()
                .zip(self.meta.dbs.iter())
                .all(|(db, rec)| db.map(|d| d.rec) == Some(*rec))
    }

    /// Writes the changed records of named databases into the main tree.
    fn flush_named(&mut self) -> Result<()> {
        for dbi in CORE_DBS..self.state.dbs.len() as u32 {
            let db = match self.state.dbs[dbi as usize] {
                Some(db) if db.dirty => db,
                _ => continue,
            };
            let slot = self.env.db_slot(dbi)?;
            let name = slot.name.ok_or(Error::BadDbi)?;
            self.with_db(MAIN_DBI, |txn, main| {
                btree::put_record(txn, main, name.as_bytes(), &db.rec)
            })?;
            if let Some(db) = self.state.dbs[dbi as usize].as_mut() {
                db.dirty = false;
            }
        }
        Ok(())
    }

    fn commit_inner(&mut self) -> Result<()> {
        self.flush_named()?;
        if self.unchanged() {
            debug!("write txn {} had nothing to commit", self.txnid);
            return Ok(());
        }

        let result = freelist::save(self);
        if let Err(e) = result {
            self.mark_error();
            return Err(e);
        }

        let dirty = std::mem::take(&mut self.top_mut().dirty);
        let mut pages: Vec<(Pgno, Box<[u8]>)> = dirty.into_iter().collect();
        pages.sort_unstable_by_key(|(pgno, _)| *pgno);
        let last_pgno = self.state.next_pgno - 1;
        self.env.write_pages(&mut pages, last_pgno)?;
        self.env.sync_data()?;

        let mut meta = self.meta.clone();
        meta.mapsize = meta.mapsize.max(self.env.map_size() as u64);
        meta.dbs = [self.db_rec(FREE_DBI)?, self.db_rec(MAIN_DBI)?];
        meta.last_pgno = last_pgno;
        meta.txnid = self.txnid;
        self.env.write_meta(&meta)?;
        debug!(
            "committed txn {}: {} page(s) written, last page {}",
            self.txnid,
            pages.len(),
            last_pgno
        );
        Ok(())
    }

    fn db_rec(&self, dbi: u32) -> Result<DbRecord> {
        self.state.dbs[dbi as usize]
            .map(|db| db.rec)
            .ok_or(Error::BadDbi)
    }
}

impl PageSource for RwTransaction<'_> {
    fn page(&self, pgno: Pgno) -> Result<PageRef<'_>> {
        match self.find_dirty(pgno) {
            Some(buf) => PageRef::new(buf),
            None => self.env.map_page(pgno, self.meta.last_pgno),
        }
    }

    fn page_run(&self, pgno: Pgno) -> Result<&[u8]> {
        match self.find_dirty(pgno) {
            Some(buf) => Ok(buf),
            None => self.env.map_run(pgno, self.meta.last_pgno),
        }
    }
}

impl TxnAccess for RwTransaction<'_> {
    fn txn_env(&self) -> &Environment {
        self.env
    }

    fn txn_id(&self) -> u64 {
        self.txnid
    }

    fn txn_db(&self, dbi: u32) -> Result<TxnDb> {
        let db = match self.state.dbs.get(dbi as usize).copied().flatten() {
            Some(db) => db,
            None => load_named(self, dbi)?,
        };
        let slot = self.env.db_slot(dbi)?;
        Ok(TxnDb {
            cmp: slot.cmp,
            dcmp: slot.dcmp,
            ..db
        })
    }
}

impl Transaction for RwTransaction<'_> {}

impl Drop for RwTransaction<'_> {
    fn drop(&mut self) {
        if !self.flags.contains(TransactionFlags::FINISHED) {
            debug!("aborted write txn {}", self.txnid);
        }
    }
}

/// A child of a write transaction. Dropping it without `commit` rolls back
/// everything done through it.
pub struct NestedTransaction<'p, 'env> {
    txn: &'p mut RwTransaction<'env>,
    finished: bool,
}

impl<'p, 'env> NestedTransaction<'p, 'env> {
    /// Folds the child's changes into its parent.
    pub fn commit(mut self) -> Result<()> {
        self.txn.check_usable()?;
        let Some(level) = self.txn.levels.pop() else {
            return Err(Error::BadTxn);
        };
        self.txn.top_mut().dirty.extend(level.dirty);
        self.finished = true;
        debug!("committed nested txn into depth {}", self.txn.levels.len() - 1);
        Ok(())
    }

    pub fn abort(self) {}
}

impl<'env> Deref for NestedTransaction<'_, 'env> {
    type Target = RwTransaction<'env>;

    fn deref(&self) -> &Self::Target {
        self.txn
    }
}

impl DerefMut for NestedTransaction<'_, '_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.txn
    }
}

impl PageSource for NestedTransaction<'_, '_> {
    fn page(&self, pgno: Pgno) -> Result<PageRef<'_>> {
        self.txn.page(pgno)
    }

    fn page_run(&self, pgno: Pgno) -> Result<&[u8]> {
        self.txn.page_run(pgno)
    }
}

impl TxnAccess for NestedTransaction<'_, '_> {
    fn txn_env(&self) -> &Environment {
        self.txn.txn_env()
    }

    fn txn_id(&self) -> u64 {
        self.txn.txn_id()
    }

    fn txn_db(&self, dbi: u32) -> Result<TxnDb> {
        self.txn.txn_db(dbi)
    }
}

impl Transaction for NestedTransaction<'_, '_> {}

impl Drop for NestedTransaction<'_, '_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Some(level) = self.txn.levels.pop() {
            if let Some(saved) = level.saved {
                self.txn.state = saved;
            }
        }
        debug!("aborted nested txn");
    }
}
