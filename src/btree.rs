//! Copy-on-write B+tree operations.
//!
//! Readers walk pages through any [`PageSource`]. Writers first touch every
//! page on the root-to-leaf path, so each modification below lands in pages
//! that belong to the current write transaction; pages of committed
//! snapshots are never written.

use std::cmp::Ordering;

use crate::constants::{DbFlags, NodeFlags, PageFlags, WriteFlags, FILL_THRESHOLD, P_INVALID};
use crate::error::{Error, Result};
use crate::meta::DbRecord;
use crate::page::{
    node_max, overflow_pages, page_capacity, NodeBuf, NodeRef, PageRef, PageSource, Pgno,
    NODE_HEADER_SIZE, PAGE_HEADER_SIZE,
};
use crate::transaction::{RwTransaction, TxnAccess, TxnDb};
use crate::value::{valid_int, Comparator};

/// Deepest tree we are willing to walk; anything deeper is a cycle.
const MAX_DEPTH: usize = 64;

/// One step of a root-to-leaf path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Frame {
    pub(crate) pgno: Pgno,
    pub(crate) idx: usize,
}

/// Searches a single page. Leaves give the lower bound of `key` and whether
/// it matched exactly; branches give the child covering `key`.
pub(crate) fn search_page(page: &PageRef<'_>, key: &[u8], cmp: Comparator) -> Result<(usize, bool)> {
    let n = page.num_keys();
    if page.is_branch() {
        let (mut lo, mut hi) = (1, n);
        while lo < hi {
            let mid = (lo + hi) / 2;
            if cmp(page.node(mid)?.key, key) == Ordering::Greater {
                hi = mid;
            } else {
                lo = mid + 1;
            }
        }
        return Ok((lo.saturating_sub(1), false));
    }
    let (mut lo, mut hi) = (0, n);
    while lo < hi {
        let mid = (lo + hi) / 2;
        match cmp(page.node(mid)?.key, key) {
            Ordering::Less => lo = mid + 1,
            Ordering::Equal => return Ok((mid, true)),
            Ordering::Greater => hi = mid,
        }
    }
    Ok((lo, false))
}

/// Walks from the root to the leaf where `key` is or would be.
pub(crate) fn search<S: PageSource + ?Sized>(
    src: &S,
    rec: &DbRecord,
    cmp: Comparator,
    key: &[u8],
) -> Result<(Vec<Frame>, bool)> {
    let mut frames = Vec::new();
    if rec.is_empty() {
        return Ok((frames, false));
    }
    let mut pgno = rec.root;
    loop {
        let page = src.page(pgno)?;
        let (idx, exact) = search_page(&page, key, cmp)?;
        frames.push(Frame { pgno, idx });
        if page.is_leaf() {
            return Ok((frames, exact));
        }
        if !page.is_branch() || frames.len() > MAX_DEPTH {
            return Err(Error::corrupted(format!("unexpected page {} in tree", pgno)));
        }
        pgno = page.node(idx)?.pgno();
    }
}

/// Descends from `pgno` along the first or last child down to a leaf.
pub(crate) fn descend<S: PageSource + ?Sized>(
    src: &S,
    frames: &mut Vec<Frame>,
    mut pgno: Pgno,
    last: bool,
) -> Result<()> {
    loop {
        let page = src.page(pgno)?;
        let n = page.num_keys();
        let idx = if last { n.saturating_sub(1) } else { 0 };
        frames.push(Frame { pgno, idx });
        if page.is_leaf() {
            return Ok(());
        }
        if n == 0 || frames.len() > MAX_DEPTH {
            return Err(Error::corrupted(format!("bad branch page {}", pgno)));
        }
        pgno = page.node(idx)?.pgno();
    }
}

fn leaf_at<'a, S: PageSource + ?Sized>(src: &'a S, frames: &[Frame]) -> Result<NodeRef<'a>> {
    let frame = frames
        .last()
        .ok_or_else(|| Error::corrupted("empty search path"))?;
    src.page(frame.pgno)?.node(frame.idx)
}

/// Returns the value bytes of a leaf node, following overflow runs.
pub(crate) fn node_value<'a, S: PageSource + ?Sized>(src: &'a S, node: &NodeRef<'a>) -> Result<&'a [u8]> {
    if !node.is_big() {
        return Ok(node.data);
    }
    let run = src.page_run(node.pgno())?;
    run.get(PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + node.dsize)
        .ok_or_else(|| Error::corrupted(format!("overflow run {} too short", node.pgno())))
}

fn run_pages<S: PageSource + ?Sized>(src: &S, pgno: Pgno) -> Result<usize> {
    Ok(PageRef::new(src.page_run(pgno)?)?.overflow_pages())
}

/// Smallest or largest key of a tree.
pub(crate) fn edge_key<'a, S: PageSource + ?Sized>(src: &'a S, rec: &DbRecord, last: bool) -> Result<Option<&'a [u8]>> {
    if rec.is_empty() {
        return Ok(None);
    }
    let mut frames = Vec::new();
    descend(src, &mut frames, rec.root, last)?;
    let frame = frames[frames.len() - 1];
    let page = src.page(frame.pgno)?;
    if page.num_keys() == 0 {
        return Ok(None);
    }
    Ok(Some(page.node(frame.idx)?.key))
}

/// Looks up `key`. DUPSORT databases yield their first duplicate.
pub(crate) fn get<'a, S: PageSource + ?Sized>(src: &'a S, db: &TxnDb, key: &[u8]) -> Result<Option<&'a [u8]>> {
    let (frames, exact) = search(src, &db.rec, db.cmp, key)?;
    if !exact {
        return Ok(None);
    }
    let node = leaf_at(src, &frames)?;
    if node.is_dup() {
        let sub = DbRecord::decode(node.data)?;
        return edge_key(src, &sub, false);
    }
    node_value(src, &node).map(Some)
}

/// Finds the record of a named database stored in the main tree.
pub(crate) fn find_record<S: PageSource + ?Sized>(src: &S, main: &TxnDb, name: &[u8]) -> Result<Option<DbRecord>> {
    let (frames, exact) = search(src, &main.rec, main.cmp, name)?;
    if !exact {
        return Ok(None);
    }
    let node = leaf_at(src, &frames)?;
    if !node.is_sub() || node.is_dup() {
        return Err(Error::Incompatible);
    }
    DbRecord::decode(node.data).map(Some)
}

fn check_key(txn: &RwTransaction, db: &TxnDb, key: &[u8]) -> Result<()> {
    if key.is_empty() || key.len() > txn.txn_env().max_key_size() {
        return Err(Error::BadValSize);
    }
    if db.flags().contains(DbFlags::INTEGERKEY) && !valid_int(key) {
        return Err(Error::BadValSize);
    }
    Ok(())
}

fn check_dup(txn: &RwTransaction, db: &TxnDb, data: &[u8]) -> Result<()> {
    if data.len() > txn.txn_env().max_key_size() {
        return Err(Error::BadValSize);
    }
    if db.flags().contains(DbFlags::INTEGERDUP) && !valid_int(data) {
        return Err(Error::BadValSize);
    }
    Ok(())
}

/// Stores `data` under `key`.
pub(crate) fn put(txn: &mut RwTransaction, db: &mut TxnDb, key: &[u8], data: &[u8], flags: WriteFlags) -> Result<()> {
    check_key(txn, db, key)?;
    let dupsort = db.is_dupsort();
    if dupsort {
        check_dup(txn, db, data)?;
    }
    if flags.contains(WriteFlags::APPEND) {
        if let Some(last) = edge_key(&*txn, &db.rec, true)? {
            let order = (db.cmp)(key, last);
            if order == Ordering::Less || (order == Ordering::Equal && !dupsort) {
                return Err(Error::KeyExist);
            }
        }
    }

    let (mut frames, exact) = search(&*txn, &db.rec, db.cmp, key)?;
    if !exact {
        if flags.contains(WriteFlags::CURRENT) {
            return Err(Error::NotFound);
        }
        let node = make_leaf(txn, &mut db.rec, key, data)?;
        if frames.is_empty() {
            let root = txn.page_alloc(1)?;
            txn.page_mut(root)?.init(root, PageFlags::LEAF);
            db.rec.root = root;
            db.rec.depth = 1;
            db.rec.leaf_pages += 1;
            frames.push(Frame { pgno: root, idx: 0 });
        } else {
            touch_path(txn, &mut db.rec, &mut frames)?;
        }
        insert_at(txn, &mut db.rec, &mut frames, node)?;
        db.rec.entries += 1;
        return Ok(());
    }

    let old = leaf_at(&*txn, &frames)?.to_buf();
    if old.flags.contains(NodeFlags::SUBDATA) && !old.flags.contains(NodeFlags::DUPDATA) {
        return Err(Error::Incompatible);
    }
    if flags.contains(WriteFlags::NOOVERWRITE) {
        return Err(Error::KeyExist);
    }
    if dupsort {
        return put_dup(txn, db, frames, key, old, data, flags);
    }

    touch_path(txn, &mut db.rec, &mut frames)?;
    let leaf = frames[frames.len() - 1];
    if old.flags.contains(NodeFlags::BIGDATA) {
        let run = old.pgno();
        let pages = run_pages(&*txn, run)?;
        let psize = txn.txn_env().page_size();
        let still_big = NODE_HEADER_SIZE + key.len() + data.len() > node_max(psize);
        if still_big && txn.is_dirty_top(run) && overflow_pages(psize, data.len()) <= pages {
            txn.page_mut(run)?.init_overflow(run, pages, data);
            txn.page_mut(leaf.pgno)?.set_node_dsize(leaf.idx, data.len());
            return Ok(());
        }
        txn.page_free(run, pages);
        db.rec.overflow_pages -= pages as u64;
    }
    let node = make_leaf(txn, &mut db.rec, key, data)?;
    replace_at(txn, &mut db.rec, &mut frames, node)
}

fn put_dup(
    txn: &mut RwTransaction,
    db: &mut TxnDb,
    mut frames: Vec<Frame>,
    key: &[u8],
    old: NodeBuf,
    data: &[u8],
    flags: WriteFlags,
) -> Result<()> {
    let dcmp = db.dcmp;
    let mut sub = if old.flags.contains(NodeFlags::DUPDATA) {
        let sub = DbRecord::decode(&old.data)?;
        let (_, exact) = search(&*txn, &sub, dcmp, data)?;
        if exact {
            return if flags.contains(WriteFlags::NODUPDATA) {
                Err(Error::KeyExist)
            } else {
                Ok(())
            };
        }
        if flags.contains(WriteFlags::APPENDDUP) {
            if let Some(last) = edge_key(&*txn, &sub, true)? {
                if dcmp(data, last) != Ordering::Greater {
                    return Err(Error::KeyExist);
                }
            }
        }
        touch_path(txn, &mut db.rec, &mut frames)?;
        sub
    } else {
        let value = {
            let node = leaf_at(&*txn, &frames)?;
            node_value(&*txn, &node)?.to_vec()
        };
        match dcmp(data, &value) {
            Ordering::Equal => {
                return if flags.contains(WriteFlags::NODUPDATA) {
                    Err(Error::KeyExist)
                } else {
                    Ok(())
                };
            }
            Ordering::Less if flags.contains(WriteFlags::APPENDDUP) => return Err(Error::KeyExist),
            _ => {}
        }
        touch_path(txn, &mut db.rec, &mut frames)?;
        if old.flags.contains(NodeFlags::BIGDATA) {
            let run = old.pgno();
            let pages = run_pages(&*txn, run)?;
            txn.page_free(run, pages);
            db.rec.overflow_pages -= pages as u64;
        }
        let mut sub = DbRecord::default();
        sub_insert(txn, &mut sub, dcmp, &value)?;
        sub
    };

    sub_insert(txn, &mut sub, dcmp, data)?;
    let leaf = frames[frames.len() - 1];
    if old.flags.contains(NodeFlags::DUPDATA) {
        txn.page_mut(leaf.pgno)?.set_node_data(leaf.idx, &sub.encode());
    } else {
        let node = NodeBuf::record(key, NodeFlags::DUPDATA | NodeFlags::SUBDATA, &sub.encode());
        replace_at(txn, &mut db.rec, &mut frames, node)?;
    }
    db.rec.entries += 1;
    Ok(())
}

/// Adds `value` as a key of a duplicate sub-tree.
fn sub_insert(txn: &mut RwTransaction, sub: &mut DbRecord, dcmp: Comparator, value: &[u8]) -> Result<()> {
    let (mut frames, exact) = search(&*txn, sub, dcmp, value)?;
    if exact {
        return Ok(());
    }
    if frames.is_empty() {
        let root = txn.page_alloc(1)?;
        txn.page_mut(root)?.init(root, PageFlags::LEAF);
        sub.root = root;
        sub.depth = 1;
        sub.leaf_pages += 1;
        frames.push(Frame { pgno: root, idx: 0 });
    } else {
        touch_path(txn, sub, &mut frames)?;
    }
    insert_at(txn, sub, &mut frames, NodeBuf::leaf(value, &[]))?;
    sub.entries += 1;
    Ok(())
}

/// Writes a named database record into the main tree.
pub(crate) fn put_record(txn: &mut RwTransaction, main: &mut TxnDb, name: &[u8], rec: &DbRecord) -> Result<()> {
    let (mut frames, exact) = search(&*txn, &main.rec, main.cmp, name)?;
    if exact {
        let node = leaf_at(&*txn, &frames)?;
        if !node.is_sub() || node.is_dup() {
            return Err(Error::Incompatible);
        }
        touch_path(txn, &mut main.rec, &mut frames)?;
        let leaf = frames[frames.len() - 1];
        txn.page_mut(leaf.pgno)?.set_node_data(leaf.idx, &rec.encode());
        return Ok(());
    }
    if frames.is_empty() {
        let root = txn.page_alloc(1)?;
        txn.page_mut(root)?.init(root, PageFlags::LEAF);
        main.rec.root = root;
        main.rec.depth = 1;
        main.rec.leaf_pages += 1;
        frames.push(Frame { pgno: root, idx: 0 });
    } else {
        touch_path(txn, &mut main.rec, &mut frames)?;
    }
    let node = NodeBuf::record(name, NodeFlags::SUBDATA, &rec.encode());
    insert_at(txn, &mut main.rec, &mut frames, node)?;
    main.rec.entries += 1;
    Ok(())
}

/// Deletes `key`, or with `data` a single duplicate of a DUPSORT database.
pub(crate) fn del(txn: &mut RwTransaction, db: &mut TxnDb, key: &[u8], data: Option<&[u8]>) -> Result<()> {
    let (mut frames, exact) = search(&*txn, &db.rec, db.cmp, key)?;
    if !exact {
        return Err(Error::NotFound);
    }
    let old = leaf_at(&*txn, &frames)?.to_buf();
    if old.flags.contains(NodeFlags::SUBDATA) && !old.flags.contains(NodeFlags::DUPDATA) {
        return Err(Error::Incompatible);
    }
    if let (true, Some(data)) = (db.is_dupsort(), data) {
        let dcmp = db.dcmp;
        if old.flags.contains(NodeFlags::DUPDATA) {
            let mut sub = DbRecord::decode(&old.data)?;
            let (mut sub_frames, found) = search(&*txn, &sub, dcmp, data)?;
            if !found {
                return Err(Error::NotFound);
            }
            touch_path(txn, &mut db.rec, &mut frames)?;
            touch_path(txn, &mut sub, &mut sub_frames)?;
            delete_at(txn, &mut sub, &mut sub_frames)?;
            sub.entries -= 1;
            db.rec.entries -= 1;
            if sub.is_empty() {
                return delete_at(txn, &mut db.rec, &mut frames);
            }
            let leaf = frames[frames.len() - 1];
            txn.page_mut(leaf.pgno)?.set_node_data(leaf.idx, &sub.encode());
            return Ok(());
        }
        let value = {
            let node = leaf_at(&*txn, &frames)?;
            node_value(&*txn, &node)?.to_vec()
        };
        if dcmp(&value, data) != Ordering::Equal {
            return Err(Error::NotFound);
        }
    }
    remove_at(txn, &mut db.rec, &mut frames, &old)
}

/// Deletes `key` and everything stored under it, whatever the node holds.
pub(crate) fn remove_key(txn: &mut RwTransaction, db: &mut TxnDb, key: &[u8]) -> Result<()> {
    let (mut frames, exact) = search(&*txn, &db.rec, db.cmp, key)?;
    if !exact {
        return Err(Error::NotFound);
    }
    let old = leaf_at(&*txn, &frames)?.to_buf();
    remove_at(txn, &mut db.rec, &mut frames, &old)
}

fn remove_at(txn: &mut RwTransaction, rec: &mut DbRecord, frames: &mut Vec<Frame>, old: &NodeBuf) -> Result<()> {
    touch_path(txn, rec, frames)?;
    let mut removed = 1;
    if old.flags.contains(NodeFlags::BIGDATA) {
        let run = old.pgno();
        let pages = run_pages(&*txn, run)?;
        txn.page_free(run, pages);
        rec.overflow_pages -= pages as u64;
    } else if old.flags.contains(NodeFlags::DUPDATA) {
        let sub = DbRecord::decode(&old.data)?;
        free_tree(txn, &sub)?;
        removed = sub.entries;
    }
    delete_at(txn, rec, frames)?;
    rec.entries -= removed;
    Ok(())
}

/// Releases every page of a tree: branches, leaves, overflow runs and the
/// trees hanging off its nodes.
pub(crate) fn free_tree(txn: &mut RwTransaction, rec: &DbRecord) -> Result<()> {
    if rec.is_empty() {
        return Ok(());
    }
    let mut stack = vec![rec.root];
    while let Some(pgno) = stack.pop() {
        let mut runs = Vec::new();
        let mut subs = Vec::new();
        {
            let page = txn.page(pgno)?;
            for i in 0..page.num_keys() {
                let node = page.node(i)?;
                if page.is_branch() {
                    stack.push(node.pgno());
                } else if node.is_big() {
                    runs.push(node.pgno());
                } else if node.is_sub() {
                    subs.push(DbRecord::decode(node.data)?);
                }
            }
        }
        for run in runs {
            let pages = run_pages(&*txn, run)?;
            txn.page_free(run, pages);
        }
        for sub in subs {
            free_tree(txn, &sub)?;
        }
        txn.page_free(pgno, 1);
    }
    Ok(())
}

fn make_leaf(txn: &mut RwTransaction, rec: &mut DbRecord, key: &[u8], data: &[u8]) -> Result<NodeBuf> {
    let psize = txn.txn_env().page_size();
    if NODE_HEADER_SIZE + key.len() + data.len() <= node_max(psize) {
        return Ok(NodeBuf::leaf(key, data));
    }
    let pages = overflow_pages(psize, data.len());
    let pgno = txn.page_alloc(pages)?;
    txn.page_mut(pgno)?.init_overflow(pgno, pages, data);
    rec.overflow_pages += pages as u64;
    Ok(NodeBuf::big(key, data.len(), pgno))
}

/// Makes every page on the path writable, repointing parents (or the root)
/// at the copies.
pub(crate) fn touch_path(txn: &mut RwTransaction, rec: &mut DbRecord, frames: &mut [Frame]) -> Result<()> {
    for i in 0..frames.len() {
        let new = txn.page_touch(frames[i].pgno)?;
        if new == frames[i].pgno {
            continue;
        }
        frames[i].pgno = new;
        if i == 0 {
            rec.root = new;
        } else {
            let parent = frames[i - 1];
            txn.page_mut(parent.pgno)?.set_child(parent.idx, new);
        }
    }
    Ok(())
}

fn touch_child(txn: &mut RwTransaction, parent: Pgno, idx: usize) -> Result<Pgno> {
    let child = txn.page(parent)?.node(idx)?.pgno();
    let new = txn.page_touch(child)?;
    if new != child {
        txn.page_mut(parent)?.set_child(idx, new);
    }
    Ok(new)
}

fn rebuild(txn: &mut RwTransaction, pgno: Pgno, flags: PageFlags, nodes: &[NodeBuf]) -> Result<()> {
    if txn.page_mut(pgno)?.rebuild(pgno, flags, nodes) {
        Ok(())
    } else {
        Err(Error::corrupted(format!("nodes do not fit page {}", pgno)))
    }
}

fn insert_at(txn: &mut RwTransaction, rec: &mut DbRecord, frames: &mut Vec<Frame>, node: NodeBuf) -> Result<()> {
    let leaf = frames[frames.len() - 1];
    if txn.page_mut(leaf.pgno)?.insert_node(leaf.idx, &node) {
        return Ok(());
    }
    split(txn, rec, frames, frames.len() - 1, node, leaf.idx)
}

fn replace_at(txn: &mut RwTransaction, rec: &mut DbRecord, frames: &mut Vec<Frame>, node: NodeBuf) -> Result<()> {
    let leaf = frames[frames.len() - 1];
    txn.page_mut(leaf.pgno)?.remove_node(leaf.idx);
    insert_at(txn, rec, frames, node)
}

/// Splits the page at `level` to make room for `node` at `idx`, promoting a
/// separator into the parent and growing a new root when needed. The path
/// is stale afterwards.
fn split(
    txn: &mut RwTransaction,
    rec: &mut DbRecord,
    frames: &mut Vec<Frame>,
    level: usize,
    node: NodeBuf,
    idx: usize,
) -> Result<()> {
    let pgno = frames[level].pgno;
    let (flags, mut nodes) = {
        let page = txn.page(pgno)?;
        (page.flags() & (PageFlags::LEAF | PageFlags::BRANCH), page.nodes()?)
    };
    nodes.insert(idx, node);
    let is_branch = flags.contains(PageFlags::BRANCH);
    let cap = page_capacity(txn.txn_env().page_size());

    let total = nodes_size(&nodes);
    let mut best: Option<(usize, usize)> = None;
    let mut left = 0;
    for k in 1..nodes.len() {
        left += nodes[k - 1].size();
        let mut right = total - left;
        if is_branch {
            right -= nodes[k].key.len();
        }
        if left <= cap && right <= cap {
            let diff = left.abs_diff(right);
            if best.map_or(true, |(_, d)| diff < d) {
                best = Some((k, diff));
            }
        }
    }
    let (k, _) = best.ok_or_else(|| Error::corrupted(format!("no split point for page {}", pgno)))?;

    let mut right_nodes = nodes.split_off(k);
    let sep = right_nodes[0].key.clone();
    if is_branch {
        right_nodes[0].key.clear();
    }
    let right = txn.page_alloc(1)?;
    if is_branch {
        rec.branch_pages += 1;
    } else {
        rec.leaf_pages += 1;
    }
    rebuild(txn, pgno, flags, &nodes)?;
    rebuild(txn, right, flags, &right_nodes)?;

    let sep_node = NodeBuf::branch(&sep, right);
    if level == 0 {
        let root = txn.page_alloc(1)?;
        rebuild(txn, root, PageFlags::BRANCH, &[NodeBuf::branch(&[], pgno), sep_node])?;
        rec.root = root;
        rec.depth += 1;
        rec.branch_pages += 1;
        frames.insert(0, Frame { pgno: root, idx: 0 });
        return Ok(());
    }
    let parent = frames[level - 1];
    if txn.page_mut(parent.pgno)?.insert_node(parent.idx + 1, &sep_node) {
        return Ok(());
    }
    split(txn, rec, frames, level - 1, sep_node, parent.idx + 1)
}

/// Removes the leaf node the path points at and restores the fill invariant.
/// The path is stale afterwards.
fn delete_at(txn: &mut RwTransaction, rec: &mut DbRecord, frames: &mut Vec<Frame>) -> Result<()> {
    let leaf = frames[frames.len() - 1];
    txn.page_mut(leaf.pgno)?.remove_node(leaf.idx);
    rebalance(txn, rec, frames, frames.len() - 1)
}

fn nodes_size(nodes: &[NodeBuf]) -> usize {
    nodes.iter().map(NodeBuf::size).sum()
}

fn count_page(rec: &mut DbRecord, is_leaf: bool, delta: i64) {
    let counter = if is_leaf {
        &mut rec.leaf_pages
    } else {
        &mut rec.branch_pages
    };
    *counter = counter.saturating_add_signed(delta);
}

/// Removes branch node `idx`, keeping the first key of the page empty.
fn remove_branch_node(txn: &mut RwTransaction, pgno: Pgno, idx: usize) -> Result<()> {
    let mut page = txn.page_mut(pgno)?;
    page.remove_node(idx);
    if idx == 0 && page.as_ref().num_keys() > 0 {
        let mut first = page.as_ref().node(0)?.to_buf();
        if !first.key.is_empty() {
            first.key.clear();
            page.remove_node(0);
            page.insert_node(0, &first);
        }
    }
    Ok(())
}

fn collapse_root(txn: &mut RwTransaction, rec: &mut DbRecord) -> Result<()> {
    loop {
        let root = rec.root;
        let (is_leaf, n, only_child) = {
            let page = txn.page(root)?;
            let n = page.num_keys();
            let child = if page.is_branch() && n == 1 {
                Some(page.node(0)?.pgno())
            } else {
                None
            };
            (page.is_leaf(), n, child)
        };
        if is_leaf {
            if n == 0 {
                txn.page_free(root, 1);
                rec.root = P_INVALID;
                rec.depth = 0;
                count_page(rec, true, -1);
            }
            return Ok(());
        }
        match only_child {
            Some(child) => {
                txn.page_free(root, 1);
                count_page(rec, false, -1);
                rec.root = child;
                rec.depth -= 1;
            }
            None => return Ok(()),
        }
    }
}

fn rebalance(txn: &mut RwTransaction, rec: &mut DbRecord, frames: &mut Vec<Frame>, level: usize) -> Result<()> {
    if level == 0 {
        return collapse_root(txn, rec);
    }
    let pgno = frames[level].pgno;
    let (n, is_leaf, fill) = {
        let page = txn.page(pgno)?;
        (page.num_keys(), page.is_leaf(), page.fill())
    };
    let parent = frames[level - 1];

    if n == 0 {
        txn.page_free(pgno, 1);
        count_page(rec, is_leaf, -1);
        remove_branch_node(txn, parent.pgno, parent.idx)?;
        return rebalance(txn, rec, frames, level - 1);
    }
    if fill >= FILL_THRESHOLD && (is_leaf || n >= 2) {
        return Ok(());
    }
    if txn.page(parent.pgno)?.num_keys() < 2 {
        return Ok(());
    }

    let (left_idx, right_idx) = if parent.idx == 0 {
        (0, 1)
    } else {
        (parent.idx - 1, parent.idx)
    };
    let left = touch_child(txn, parent.pgno, left_idx)?;
    let right = touch_child(txn, parent.pgno, right_idx)?;
    let sep = txn.page(parent.pgno)?.node(right_idx)?.key.to_vec();
    let mut lnodes = txn.page(left)?.nodes()?;
    let mut rnodes = txn.page(right)?.nodes()?;
    let flags = if is_leaf { PageFlags::LEAF } else { PageFlags::BRANCH };
    if !is_leaf {
        rnodes[0].key = sep.clone();
    }
    let cap = page_capacity(txn.txn_env().page_size());

    if nodes_size(&lnodes) + nodes_size(&rnodes) <= cap {
        lnodes.append(&mut rnodes);
        rebuild(txn, left, flags, &lnodes)?;
        txn.page_free(right, 1);
        count_page(rec, is_leaf, -1);
        txn.page_mut(parent.pgno)?.remove_node(right_idx);
        return rebalance(txn, rec, frames, level - 1);
    }

    // Too big to merge: borrow one node from the sibling instead.
    let keep = if is_leaf { 1 } else { 2 };
    let new_sep = if parent.idx == left_idx {
        if rnodes.len() <= keep {
            return Ok(());
        }
        let moved = rnodes.remove(0);
        let new_sep = rnodes[0].key.clone();
        if !is_leaf {
            rnodes[0].key.clear();
        }
        lnodes.push(moved);
        new_sep
    } else {
        if lnodes.len() <= keep {
            return Ok(());
        }
        let Some(mut moved) = lnodes.pop() else {
            return Ok(());
        };
        let new_sep = moved.key.clone();
        if !is_leaf {
            moved.key.clear();
        }
        rnodes.insert(0, moved);
        new_sep
    };
    if nodes_size(&lnodes) > cap || nodes_size(&rnodes) > cap {
        return Ok(());
    }
    let sep_node = NodeBuf::branch(&new_sep, right);
    let old_size = NodeBuf::branch(&sep, right).size();
    if txn.page(parent.pgno)?.free_space() + old_size < sep_node.size() {
        return Ok(());
    }
    rebuild(txn, left, flags, &lnodes)?;
    rebuild(txn, right, flags, &rnodes)?;
    let mut page = txn.page_mut(parent.pgno)?;
    page.remove_node(right_idx);
    if !page.insert_node(right_idx, &sep_node) {
        return Err(Error::corrupted("separator no longer fits"));
    }
    Ok(())
}
