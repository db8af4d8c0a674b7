//! Cursors: positioned walks over a database in key order.
//!
//! A DUPSORT database keeps the duplicates of a key in their own sub-tree,
//! so a cursor is a position in the main tree plus, on such a key, a
//! position in its duplicate tree.

use std::cmp::Ordering;

use crate::btree::{self, Frame};
use crate::constants::WriteFlags;
use crate::error::{Error, Result};
use crate::meta::DbRecord;
use crate::page::{NodeRef, PageSource};
use crate::transaction::{RwTransaction, TxnAccess, TxnDb};
use crate::types::CursorOp;
use crate::value::Comparator;

type Item<'a> = Option<(&'a [u8], &'a [u8])>;

/// Position inside one B+tree, one frame per level with the leaf last.
///
/// A leaf index equal to the leaf's key count is the end position.
#[derive(Debug, Clone, Default)]
pub(crate) struct TreeCursor {
    frames: Vec<Frame>,
}

impl TreeCursor {
    pub(crate) fn reset(&mut self) {
        self.frames.clear();
    }

    pub(crate) fn is_set(&self) -> bool {
        !self.frames.is_empty()
    }

    fn leaf(&self) -> Option<Frame> {
        self.frames.last().copied()
    }

    fn set_leaf_idx(&mut self, idx: usize) {
        if let Some(leaf) = self.frames.last_mut() {
            leaf.idx = idx;
        }
    }

    pub(crate) fn first<S: PageSource + ?Sized>(&mut self, src: &S, rec: &DbRecord) -> Result<bool> {
        self.edge(src, rec, false)
    }

    pub(crate) fn last<S: PageSource + ?Sized>(&mut self, src: &S, rec: &DbRecord) -> Result<bool> {
        self.edge(src, rec, true)
    }

    fn edge<S: PageSource + ?Sized>(&mut self, src: &S, rec: &DbRecord, last: bool) -> Result<bool> {
        self.frames.clear();
        if rec.is_empty() {
            return Ok(false);
        }
        btree::descend(src, &mut self.frames, rec.root, last)?;
        Ok(self.node(src)?.is_some())
    }

    /// Positions at the first key not less than `key`, or at the end.
    /// Returns whether `key` itself was found.
    pub(crate) fn seek<S: PageSource + ?Sized>(
        &mut self,
        src: &S,
        rec: &DbRecord,
        cmp: Comparator,
        key: &[u8],
    ) -> Result<bool> {
        let (frames, exact) = btree::search(src, rec, cmp, key)?;
        self.frames = frames;
        if let Some(leaf) = self.leaf() {
            if leaf.idx >= src.page(leaf.pgno)?.num_keys() {
                self.step_leaf(src, false)?;
            }
        }
        Ok(exact)
    }

    /// The node under the cursor, `None` when unset or at the end.
    pub(crate) fn node<'a, S: PageSource + ?Sized>(&self, src: &'a S) -> Result<Option<NodeRef<'a>>> {
        let Some(leaf) = self.leaf() else {
            return Ok(None);
        };
        let page = src.page(leaf.pgno)?;
        if leaf.idx < page.num_keys() {
            page.node(leaf.idx).map(Some)
        } else {
            Ok(None)
        }
    }

    /// Steps forward. On the last node the position is kept.
    pub(crate) fn next<S: PageSource + ?Sized>(&mut self, src: &S) -> Result<bool> {
        let Some(leaf) = self.leaf() else {
            return Ok(false);
        };
        let n = src.page(leaf.pgno)?.num_keys();
        if leaf.idx >= n {
            return Ok(false);
        }
        if leaf.idx + 1 < n {
            self.set_leaf_idx(leaf.idx + 1);
            return Ok(true);
        }
        self.step_leaf(src, false)
    }

    /// Steps back. From the end position this lands on the last node.
    pub(crate) fn prev<S: PageSource + ?Sized>(&mut self, src: &S) -> Result<bool> {
        let Some(leaf) = self.leaf() else {
            return Ok(false);
        };
        if leaf.idx > 0 {
            self.set_leaf_idx(leaf.idx - 1);
            return Ok(true);
        }
        self.step_leaf(src, true)
    }

    /// Moves past the last node of the current leaf.
    pub(crate) fn to_end<S: PageSource + ?Sized>(&mut self, src: &S) -> Result<()> {
        if let Some(leaf) = self.leaf() {
            let n = src.page(leaf.pgno)?.num_keys();
            self.set_leaf_idx(n);
        }
        Ok(())
    }

    /// Moves to the first node of the next leaf or the last node of the
    /// previous one, leaving the position alone if there is none.
    fn step_leaf<S: PageSource + ?Sized>(&mut self, src: &S, back: bool) -> Result<bool> {
        for level in (0..self.frames.len().saturating_sub(1)).rev() {
            let Frame { pgno, idx } = self.frames[level];
            let page = src.page(pgno)?;
            let target = if back {
                idx.checked_sub(1)
            } else {
                Some(idx + 1).filter(|&i| i < page.num_keys())
            };
            let Some(target) = target else {
                continue;
            };
            let child = page.node(target)?.pgno();
            self.frames.truncate(level + 1);
            self.frames[level].idx = target;
            btree::descend(src, &mut self.frames, child, back)?;
            return Ok(true);
        }
        Ok(false)
    }
}

/// Cursor state shared by read-only and read-write cursors.
pub(crate) struct CursorCore {
    dbi: u32,
    db: TxnDb,
    main: TreeCursor,
    sub: TreeCursor,
    /// Duplicate tree of the current key
    sub_rec: Option<DbRecord>,
    /// The current item was deleted and the position holds its successor
    pending: bool,
}

impl CursorCore {
    pub(crate) fn new<S: TxnAccess + ?Sized>(txn: &S, dbi: u32) -> Result<Self> {
        Ok(CursorCore {
            dbi,
            db: txn.txn_db(dbi)?,
            main: TreeCursor::default(),
            sub: TreeCursor::default(),
            sub_rec: None,
            pending: false,
        })
    }

    fn refresh<S: TxnAccess + ?Sized>(&mut self, txn: &S) -> Result<()> {
        self.db = txn.txn_db(self.dbi)?;
        Ok(())
    }

    fn sync_sub<S: PageSource + ?Sized>(&mut self, src: &S, last: bool) -> Result<()> {
        self.sub.reset();
        self.sub_rec = None;
        let rec = match self.main.node(src)? {
            Some(node) if node.is_dup() => DbRecord::decode(node.data)?,
            _ => return Ok(()),
        };
        if last {
            self.sub.last(src, &rec)?;
        } else {
            self.sub.first(src, &rec)?;
        }
        self.sub_rec = Some(rec);
        Ok(())
    }

    fn require_dupsort(&self) -> Result<()> {
        if self.db.is_dupsort() {
            Ok(())
        } else {
            Err(Error::Incompatible)
        }
    }

    fn current<'a, S: PageSource + ?Sized>(&self, src: &'a S) -> Result<Item<'a>> {
        let Some(node) = self.main.node(src)? else {
            return Ok(None);
        };
        if self.sub_rec.is_some() {
            return Ok(self.sub.node(src)?.map(|dup| (node.key, dup.key)));
        }
        Ok(Some((node.key, btree::node_value(src, &node)?)))
    }

    fn count<S: PageSource + ?Sized>(&self, src: &S) -> Result<usize> {
        if self.main.node(src)?.is_none() {
            return Err(Error::Invalid("cursor is not positioned"));
        }
        Ok(self.sub_rec.map_or(1, |rec| rec.entries as usize))
    }

    fn first<'a, S: PageSource + ?Sized>(&mut self, src: &'a S) -> Result<Item<'a>> {
        self.pending = false;
        self.main.first(src, &self.db.rec)?;
        self.sync_sub(src, false)?;
        self.current(src)
    }

    fn last<'a, S: PageSource + ?Sized>(&mut self, src: &'a S) -> Result<Item<'a>> {
        self.pending = false;
        self.main.last(src, &self.db.rec)?;
        self.sync_sub(src, true)?;
        self.current(src)
    }

    fn next<'a, S: PageSource + ?Sized>(&mut self, src: &'a S) -> Result<Item<'a>> {
        if !self.main.is_set() {
            return self.first(src);
        }
        if std::mem::take(&mut self.pending) {
            return self.current(src);
        }
        if self.sub_rec.is_some() && self.sub.next(src)? {
            return self.current(src);
        }
        self.next_nodup(src)
    }

    fn prev<'a, S: PageSource + ?Sized>(&mut self, src: &'a S) -> Result<Item<'a>> {
        self.pending = false;
        if !self.main.is_set() {
            return self.last(src);
        }
        if self.sub_rec.is_some() && self.sub.prev(src)? {
            return self.current(src);
        }
        self.prev_nodup(src)
    }

    fn next_nodup<'a, S: PageSource + ?Sized>(&mut self, src: &'a S) -> Result<Item<'a>> {
        self.pending = false;
        if !self.main.is_set() {
            return self.first(src);
        }
        if !self.main.next(src)? {
            self.main.to_end(src)?;
        }
        self.sync_sub(src, false)?;
        self.current(src)
    }

    /// Moves to the previous key, on its last duplicate.
    fn prev_nodup<'a, S: PageSource + ?Sized>(&mut self, src: &'a S) -> Result<Item<'a>> {
        self.pending = false;
        if !self.main.is_set() {
            return self.last(src);
        }
        if !self.main.prev(src)? {
            return Ok(None);
        }
        self.sync_sub(src, true)?;
        self.current(src)
    }

    fn next_dup<'a, S: PageSource + ?Sized>(&mut self, src: &'a S) -> Result<Item<'a>> {
        self.require_dupsort()?;
        self.pending = false;
        if self.sub_rec.is_none() || !self.sub.next(src)? {
            return Ok(None);
        }
        self.current(src)
    }

    fn prev_dup<'a, S: PageSource + ?Sized>(&mut self, src: &'a S) -> Result<Item<'a>> {
        self.require_dupsort()?;
        self.pending = false;
        if self.sub_rec.is_none() || !self.sub.prev(src)? {
            return Ok(None);
        }
        self.current(src)
    }

    fn first_dup<'a, S: PageSource + ?Sized>(&mut self, src: &'a S) -> Result<Item<'a>> {
        self.require_dupsort()?;
        self.pending = false;
        if let Some(rec) = self.sub_rec {
            self.sub.first(src, &rec)?;
        }
        self.current(src)
    }

    fn last_dup<'a, S: PageSource + ?Sized>(&mut self, src: &'a S) -> Result<Item<'a>> {
        self.require_dupsort()?;
        self.pending = false;
        if let Some(rec) = self.sub_rec {
            self.sub.last(src, &rec)?;
        }
        self.current(src)
    }

    fn set<'a, S: PageSource + ?Sized>(&mut self, src: &'a S, key: &[u8]) -> Result<Item<'a>> {
        self.pending = false;
        if !self.main.seek(src, &self.db.rec, self.db.cmp, key)? {
            self.main.reset();
            self.sub.reset();
            self.sub_rec = None;
            return Ok(None);
        }
        self.sync_sub(src, false)?;
        self.current(src)
    }

    fn set_range<'a, S: PageSource + ?Sized>(&mut self, src: &'a S, key: &[u8]) -> Result<Item<'a>> {
        self.pending = false;
        self.main.seek(src, &self.db.rec, self.db.cmp, key)?;
        self.sync_sub(src, false)?;
        self.current(src)
    }

    fn get_both<'a, S: PageSource + ?Sized>(&mut self, src: &'a S, key: &[u8], data: &[u8]) -> Result<Item<'a>> {
        let Some((_, value)) = self.set(src, key)? else {
            return Ok(None);
        };
        match self.sub_rec {
            Some(rec) => {
                if !self.sub.seek(src, &rec, self.db.dcmp, data)? {
                    return Ok(None);
                }
            }
            None => {
                if (self.db.dcmp)(value, data) != Ordering::Equal {
                    return Ok(None);
                }
            }
        }
        self.current(src)
    }

    fn get_both_range<'a, S: PageSource + ?Sized>(
        &mut self,
        src: &'a S,
        key: &[u8],
        data: &[u8],
    ) -> Result<Item<'a>> {
        let Some((_, value)) = self.set(src, key)? else {
            return Ok(None);
        };
        match self.sub_rec {
            Some(rec) => {
                self.sub.seek(src, &rec, self.db.dcmp, data)?;
            }
            None => {
                if (self.db.dcmp)(value, data) == Ordering::Less {
                    return Ok(None);
                }
            }
        }
        self.current(src)
    }

    pub(crate) fn get<'a, S: PageSource + ?Sized>(
        &mut self,
        src: &'a S,
        key: Option<&[u8]>,
        data: Option<&[u8]>,
        op: CursorOp,
    ) -> Result<Item<'a>> {
        let need_key = || key.ok_or(Error::Invalid("cursor operation needs a key"));
        let need_data = || data.ok_or(Error::Invalid("cursor operation needs a value"));
        match op {
            CursorOp::First => self.first(src),
            CursorOp::FirstDup => self.first_dup(src),
            CursorOp::GetBoth => self.get_both(src, need_key()?, need_data()?),
            CursorOp::GetBothRange => self.get_both_range(src, need_key()?, need_data()?),
            CursorOp::GetCurrent => self.current(src),
            CursorOp::Last => self.last(src),
            CursorOp::LastDup => self.last_dup(src),
            CursorOp::Next => self.next(src),
            CursorOp::NextDup => self.next_dup(src),
            CursorOp::NextNoDup => self.next_nodup(src),
            CursorOp::Prev => self.prev(src),
            CursorOp::PrevDup => self.prev_dup(src),
            CursorOp::PrevNoDup => self.prev_nodup(src),
            CursorOp::Set | CursorOp::SetKey => self.set(src, need_key()?),
            CursorOp::SetRange => self.set_range(src, need_key()?),
        }
    }

    /// Repositions after the item at `key` (and `data`) was removed: on
    /// its successor, which the next `Next` returns.
    fn seek_after_delete<S: PageSource + ?Sized>(&mut self, src: &S, key: &[u8], data: Option<&[u8]>) -> Result<()> {
        let exact = self.main.seek(src, &self.db.rec, self.db.cmp, key)?;
        self.sync_sub(src, false)?;
        if let (true, Some(data), Some(rec)) = (exact, data, self.sub_rec) {
            self.sub.seek(src, &rec, self.db.dcmp, data)?;
            if self.sub.node(src)?.is_none() {
                if !self.main.next(src)? {
                    self.main.to_end(src)?;
                }
                self.sync_sub(src, false)?;
            }
        }
        self.pending = true;
        Ok(())
    }
}

macro_rules! navigation {
    ($item:ty) => {
        pub fn first(&mut self) -> Result<Option<$item>> {
            self.op(None, None, CursorOp::First)
        }

        pub fn last(&mut self) -> Result<Option<$item>> {
            self.op(None, None, CursorOp::Last)
        }

        pub fn next(&mut self) -> Result<Option<$item>> {
            self.op(None, None, CursorOp::Next)
        }

        pub fn prev(&mut self) -> Result<Option<$item>> {
            self.op(None, None, CursorOp::Prev)
        }

        pub fn current(&mut self) -> Result<Option<$item>> {
            self.op(None, None, CursorOp::GetCurrent)
        }

        pub fn first_dup(&mut self) -> Result<Option<$item>> {
            self.op(None, None, CursorOp::FirstDup)
        }

        pub fn last_dup(&mut self) -> Result<Option<$item>> {
            self.op(None, None, CursorOp::LastDup)
        }

        pub fn next_dup(&mut self) -> Result<Option<$item>> {
            self.op(None, None, CursorOp::NextDup)
        }

        pub fn prev_dup(&mut self) -> Result<Option<$item>> {
            self.op(None, None, CursorOp::PrevDup)
        }

        pub fn next_nodup(&mut self) -> Result<Option<$item>> {
            self.op(None, None, CursorOp::NextNoDup)
        }

        pub fn prev_nodup(&mut self) -> Result<Option<$item>> {
            self.op(None, None, CursorOp::PrevNoDup)
        }

        /// Positions at `key`, on its first duplicate.
        pub fn set(&mut self, key: &[u8]) -> Result<Option<$item>> {
            self.op(Some(key), None, CursorOp::Set)
        }

        /// Positions at the first key greater than or equal to `key`.
        pub fn set_range(&mut self, key: &[u8]) -> Result<Option<$item>> {
            self.op(Some(key), None, CursorOp::SetRange)
        }

        pub fn get_both(&mut self, key: &[u8], data: &[u8]) -> Result<Option<$item>> {
            self.op(Some(key), Some(data), CursorOp::GetBoth)
        }

        /// Positions at `key` on the first duplicate not less than `data`.
        pub fn get_both_range(&mut self, key: &[u8], data: &[u8]) -> Result<Option<$item>> {
            self.op(Some(key), Some(data), CursorOp::GetBothRange)
        }
    };
}

/// Read-only cursor. Returned slices live as long as the transaction.
pub struct RoCursor<'txn> {
    txn: &'txn dyn TxnAccess,
    core: CursorCore,
}

impl<'txn> RoCursor<'txn> {
    pub(crate) fn new(txn: &'txn dyn TxnAccess, dbi: u32) -> Result<Self> {
        let core = CursorCore::new(txn, dbi)?;
        Ok(RoCursor { txn, core })
    }

    fn op(&mut self, key: Option<&[u8]>, data: Option<&[u8]>, op: CursorOp) -> Result<Item<'txn>> {
        let txn = self.txn;
        self.core.get(txn, key, data, op)
    }

    /// Runs a raw cursor operation, failing with `NotFound` when nothing is
    /// there.
    pub fn get(
        &mut self,
        key: Option<&[u8]>,
        data: Option<&[u8]>,
        op: CursorOp,
    ) -> Result<(&'txn [u8], &'txn [u8])> {
        self.op(key, data, op)?.ok_or(Error::NotFound)
    }

    navigation!((&'txn [u8], &'txn [u8]));

    /// Number of duplicates of the current key.
    pub fn count(&self) -> Result<usize> {
        self.core.count(self.txn)
    }

    /// Iterates onwards from the current position, or from the first item
    /// if the cursor is not positioned yet.
    pub fn iter(&mut self) -> Iter<'_, 'txn> {
        self.iter_with(None, CursorOp::Next)
    }

    /// Iterates over the whole database.
    pub fn iter_start(&mut self) -> Iter<'_, 'txn> {
        let head = self.op(None, None, CursorOp::First);
        self.iter_with(Some(head), CursorOp::Next)
    }

    /// Iterates from the first key greater than or equal to `key`.
    pub fn iter_from(&mut self, key: &[u8]) -> Iter<'_, 'txn> {
        let head = self.op(Some(key), None, CursorOp::SetRange);
        self.iter_with(Some(head), CursorOp::Next)
    }

    /// Iterates over the duplicates of `key`.
    pub fn iter_dup_of(&mut self, key: &[u8]) -> Iter<'_, 'txn> {
        let head = self.op(Some(key), None, CursorOp::Set);
        self.iter_with(Some(head), CursorOp::NextDup)
    }

    fn iter_with(&mut self, head: Option<Result<Item<'txn>>>, op: CursorOp) -> Iter<'_, 'txn> {
        Iter {
            txn: self.txn,
            core: &mut self.core,
            head,
            op,
            done: false,
        }
    }
}

/// Iterator over the items of a [`RoCursor`]
pub struct Iter<'c, 'txn> {
    txn: &'txn dyn TxnAccess,
    core: &'c mut CursorCore,
    head: Option<Result<Item<'txn>>>,
    op: CursorOp,
    done: bool,
}

impl<'txn> Iterator for Iter<'_, 'txn> {
    type Item = Result<(&'txn [u8], &'txn [u8])>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let step = match self.head.take() {
            Some(head) => head,
            None => self.core.get(self.txn, None, None, self.op),
        };
        match step {
            Ok(Some(item)) => Some(Ok(item)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Cursor of a write transaction. It borrows the transaction mutably, so
/// returned slices only live until the next call.
pub struct RwCursor<'txn, 'env> {
    txn: &'txn mut RwTransaction<'env>,
    core: CursorCore,
}

impl<'txn, 'env> RwCursor<'txn, 'env> {
    pub(crate) fn new(txn: &'txn mut RwTransaction<'env>, dbi: u32) -> Result<Self> {
        txn.check_usable()?;
        let core = CursorCore::new(&*txn, dbi)?;
        Ok(RwCursor { txn, core })
    }

    fn op(&mut self, key: Option<&[u8]>, data: Option<&[u8]>, op: CursorOp) -> Result<Item<'_>> {
        self.core.get(&*self.txn, key, data, op)
    }

    pub fn get(&mut self, key: Option<&[u8]>, data: Option<&[u8]>, op: CursorOp) -> Result<(&[u8], &[u8])> {
        self.op(key, data, op)?.ok_or(Error::NotFound)
    }

    navigation!((&[u8], &[u8]));

    pub fn count(&self) -> Result<usize> {
        self.core.count(&*self.txn)
    }

    /// Stores a key/value pair and positions the cursor on it.
    ///
    /// With `CURRENT` the current item is replaced and `key` is ignored; in
    /// a DUPSORT database the new value must sort equal to the old one.
    pub fn put(&mut self, key: &[u8], data: &[u8], flags: WriteFlags) -> Result<()> {
        let current_key: Vec<u8>;
        let key = if flags.contains(WriteFlags::CURRENT) {
            let (cur_key, cur_value) = self.core.current(&*self.txn)?.ok_or(Error::NotFound)?;
            if self.core.db.is_dupsort() && (self.core.db.dcmp)(cur_value, data) != Ordering::Equal {
                return Err(Error::Invalid("replacing a duplicate must keep its sort position"));
            }
            current_key = cur_key.to_vec();
            &current_key[..]
        } else {
            key
        };
        let dbi = self.core.dbi;
        self.txn.with_db(dbi, |txn, db| btree::put(txn, db, key, data, flags))?;
        self.core.refresh(&*self.txn)?;
        if self.core.db.is_dupsort() {
            self.core.get_both(&*self.txn, key, data)?;
        } else {
            self.core.set(&*self.txn, key)?;
        }
        Ok(())
    }

    /// Deletes the current item. `NODUPDATA` removes every duplicate of
    /// the current key. The following `next` returns the item after it.
    pub fn del(&mut self, flags: WriteFlags) -> Result<()> {
        let (key, value) = {
            let (k, v) = self.core.current(&*self.txn)?.ok_or(Error::NotFound)?;
            (k.to_vec(), v.to_vec())
        };
        let data = if self.core.db.is_dupsort() && !flags.contains(WriteFlags::NODUPDATA) {
            Some(&value[..])
        } else {
            None
        };
        let dbi = self.core.dbi;
        self.txn.with_db(dbi, |txn, db| btree::del(txn, db, &key, data))?;
        self.core.refresh(&*self.txn)?;
        self.core.seek_after_delete(&*self.txn, &key, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::DbFlags;
    use crate::{Database, Environment, Transaction};
    use tempfile::TempDir;

    fn key(i: u32) -> Vec<u8> {
        format!("key{:06}", i).into_bytes()
    }

    fn small_env(dir: &TempDir) -> Environment {
        Environment::new()
            .set_page_size(512)
            .set_map_size(16 << 20)
            .set_max_dbs(4)
            .open(dir.path())
            .unwrap()
    }

    #[test]
    fn test_walks_across_leaves_both_ways() {
        let dir = TempDir::new().unwrap();
        let env = small_env(&dir);
        let mut txn = env.begin_txn().unwrap();
        let db = Database::open(&txn, None).unwrap();
        for i in (0..300).rev() {
            txn.put(db, &key(i), b"v", WriteFlags::empty()).unwrap();
        }

        let mut cursor = txn.open_ro_cursor(db).unwrap();
        let forward: Vec<Vec<u8>> = cursor.iter_start().map(|r| r.unwrap().0.to_vec()).collect();
        assert_eq!(forward, (0..300).map(key).collect::<Vec<_>>());

        let mut backward = Vec::new();
        let mut item = cursor.last().unwrap();
        while let Some((k, _)) = item {
            backward.push(k.to_vec());
            item = cursor.prev().unwrap();
        }
        backward.reverse();
        assert_eq!(backward, forward);
    }

    #[test]
    fn test_range_seeks_and_end_position() {
        let dir = TempDir::new().unwrap();
        let env = small_env(&dir);
        let mut txn = env.begin_txn().unwrap();
        let db = Database::open(&txn, None).unwrap();
        for i in 0..300 {
            txn.put(db, &key(i), b"v", WriteFlags::empty()).unwrap();
        }

        let mut cursor = txn.open_ro_cursor(db).unwrap();
        assert_eq!(cursor.set_range(b"key000150x").unwrap().unwrap().0, &key(151)[..]);
        assert!(cursor.set_range(b"zzz").unwrap().is_none());
        assert_eq!(cursor.prev().unwrap().unwrap().0, &key(299)[..]);
        assert!(matches!(
            cursor.get(Some(b"nope"), None, CursorOp::Set),
            Err(Error::NotFound)
        ));
        assert!(matches!(
            cursor.get(None, None, CursorOp::SetRange),
            Err(Error::Invalid(_))
        ));

        let tail: Vec<Vec<u8>> = cursor.iter_from(&key(297)).map(|r| r.unwrap().0.to_vec()).collect();
        assert_eq!(tail, vec![key(297), key(298), key(299)]);
    }

    #[test]
    fn test_duplicate_navigation() {
        let dir = TempDir::new().unwrap();
        let env = small_env(&dir);
        let mut txn = env.begin_txn().unwrap();
        let db = Database::create(&mut txn, Some("dups"), DbFlags::DUPSORT).unwrap();
        for (k, v) in [("a", "1"), ("a", "3"), ("a", "2"), ("b", "1"), ("c", "9"), ("c", "8")] {
            txn.put(db, k.as_bytes(), v.as_bytes(), WriteFlags::empty()).unwrap();
        }

        let mut cursor = txn.open_ro_cursor(db).unwrap();
        let all: Vec<(Vec<u8>, Vec<u8>)> = cursor
            .iter_start()
            .map(|r| {
                let (k, v) = r.unwrap();
                (k.to_vec(), v.to_vec())
            })
            .collect();
        let expected: Vec<(Vec<u8>, Vec<u8>)> = [("a", "1"), ("a", "2"), ("a", "3"), ("b", "1"), ("c", "8"), ("c", "9")]
            .iter()
            .map(|(k, v)| (k.as_bytes().to_vec(), v.as_bytes().to_vec()))
            .collect();
        assert_eq!(all, expected);

        assert_eq!(cursor.set(b"a").unwrap().unwrap(), (&b"a"[..], &b"1"[..]));
        assert_eq!(cursor.count().unwrap(), 3);
        assert_eq!(cursor.last_dup().unwrap().unwrap().1, b"3");
        assert_eq!(cursor.next_dup().unwrap(), None);
        assert_eq!(cursor.next_nodup().unwrap().unwrap(), (&b"b"[..], &b"1"[..]));
        assert_eq!(cursor.count().unwrap(), 1);
        assert_eq!(cursor.prev_nodup().unwrap().unwrap(), (&b"a"[..], &b"3"[..]));
        assert_eq!(cursor.get_both_range(b"c", b"85").unwrap().unwrap().1, b"9");
        assert!(cursor.get_both(b"c", b"7").unwrap().is_none());

        let dups: Vec<Vec<u8>> = cursor.iter_dup_of(b"c").map(|r| r.unwrap().1.to_vec()).collect();
        assert_eq!(dups, vec![b"8".to_vec(), b"9".to_vec()]);
    }

    #[test]
    fn test_dup_ops_need_dupsort() {
        let dir = TempDir::new().unwrap();
        let env = small_env(&dir);
        let mut txn = env.begin_txn().unwrap();
        let db = Database::open(&txn, None).unwrap();
        txn.put(db, b"k", b"v", WriteFlags::empty()).unwrap();
        let mut cursor = txn.open_ro_cursor(db).unwrap();
        cursor.first().unwrap();
        assert!(matches!(cursor.next_dup(), Err(Error::Incompatible)));
        assert_eq!(cursor.count().unwrap(), 1);
    }

    #[test]
    fn test_delete_while_iterating() {
        let dir = TempDir::new().unwrap();
        let env = small_env(&dir);
        let mut txn = env.begin_txn().unwrap();
        let db = Database::open(&txn, None).unwrap();
        for i in 0..120 {
            txn.put(db, &key(i), &[1u8; 20], WriteFlags::empty()).unwrap();
        }

        let mut seen = 0;
        {
            let mut cursor = txn.open_rw_cursor(db).unwrap();
            let mut item = cursor.first().unwrap().map(|(k, _)| k.to_vec());
            while let Some(k) = item {
                if k[k.len() - 1] % 2 == 0 {
                    cursor.del(WriteFlags::empty()).unwrap();
                }
                seen += 1;
                item = cursor.next().unwrap().map(|(k, _)| k.to_vec());
            }
        }
        assert_eq!(seen, 120);

        let mut cursor = txn.open_ro_cursor(db).unwrap();
        let left: Vec<Vec<u8>> = cursor.iter_start().map(|r| r.unwrap().0.to_vec()).collect();
        assert_eq!(left.len(), 60);
        assert!(left.iter().all(|k| k[k.len() - 1] % 2 == 1));
    }

    #[test]
    fn test_put_current_replaces_in_place() {
        let dir = TempDir::new().unwrap();
        let env = small_env(&dir);
        let mut txn = env.begin_txn().unwrap();
        let db = Database::open(&txn, None).unwrap();
        txn.put(db, b"a", b"1", WriteFlags::empty()).unwrap();
        txn.put(db, b"b", b"2", WriteFlags::empty()).unwrap();
        {
            let mut cursor = txn.open_rw_cursor(db).unwrap();
            cursor.set(b"b").unwrap();
            cursor.put(b"ignored", b"22", WriteFlags::CURRENT).unwrap();
            assert_eq!(cursor.current().unwrap().unwrap(), (&b"b"[..], &b"22"[..]));
            cursor.put(b"c", b"3", WriteFlags::empty()).unwrap();
            assert_eq!(cursor.current().unwrap().unwrap().0, b"c");
        }
        assert_eq!(txn.get(db, b"b").unwrap(), b"22");
        assert!(matches!(txn.get(db, b"ignored"), Err(Error::NotFound)));
    }

    #[test]
    fn test_deleting_a_duplicate_moves_to_the_next_one() {
        let dir = TempDir::new().unwrap();
        let env = small_env(&dir);
        let mut txn = env.begin_txn().unwrap();
        let db = Database::create(&mut txn, Some("dups"), DbFlags::DUPSORT).unwrap();
        for v in [b"1", b"2", b"3"] {
            txn.put(db, b"k", v, WriteFlags::empty()).unwrap();
        }
        txn.put(db, b"z", b"0", WriteFlags::empty()).unwrap();

        let mut cursor = txn.open_rw_cursor(db).unwrap();
        cursor.get_both(b"k", b"2").unwrap();
        cursor.del(WriteFlags::empty()).unwrap();
        assert_eq!(cursor.next().unwrap().unwrap(), (&b"k"[..], &b"3"[..]));
        cursor.del(WriteFlags::NODUPDATA).unwrap();
        assert_eq!(cursor.next().unwrap().unwrap(), (&b"z"[..], &b"0"[..]));
        assert_eq!(cursor.prev().unwrap(), None);
    }
}
