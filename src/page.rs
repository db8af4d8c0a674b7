//! On-disk page and node layout.
//!
//! Every page starts with a fixed header:
//!
//! ```text
//! [pgno: u64][flags: u16][lower: u16][upper: u16][reserved: u16][overflow pages: u32][crc32: u32]
//! [node pointers: u16 each, growing up from the header ...]
//! ... free space ...
//! [nodes, packed down from the end of the page]
//! ```
//!
//! A node is `[flags: u16][key size: u16][data size: u32][key][data]`. Branch
//! nodes carry their child page number as 8 bytes of data and the first node
//! of a branch page has an empty key. Leaf nodes flagged `BIGDATA` carry the
//! first page number of an overflow run while `data size` keeps the length of
//! the real value.

use crate::constants::{NodeFlags, PageFlags};
use crate::error::{Error, Result};

/// Page number
pub type Pgno = u64;

pub const PAGE_HEADER_SIZE: usize = 24;
pub const NODE_HEADER_SIZE: usize = 8;
const PTR_SIZE: usize = 2;

const PGNO_OFFSET: usize = 0;
const FLAGS_OFFSET: usize = 8;
const LOWER_OFFSET: usize = 10;
const UPPER_OFFSET: usize = 12;
const OVERFLOW_OFFSET: usize = 16;
const CHECKSUM_OFFSET: usize = 20;

#[inline]
pub(crate) fn read_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([buf[off], buf[off + 1]])
}

#[inline]
pub(crate) fn read_u32(buf: &[u8], off: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&buf[off..off + 4]);
    u32::from_le_bytes(b)
}

#[inline]
pub(crate) fn read_u64(buf: &[u8], off: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[off..off + 8]);
    u64::from_le_bytes(b)
}

#[inline]
pub(crate) fn write_u16(buf: &mut [u8], off: usize, v: u16) {
    buf[off..off + 2].copy_from_slice(&v.to_le_bytes());
}

#[inline]
pub(crate) fn write_u32(buf: &mut [u8], off: usize, v: u32) {
    buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

#[inline]
pub(crate) fn write_u64(buf: &mut [u8], off: usize, v: u64) {
    buf[off..off + 8].copy_from_slice(&v.to_le_bytes());
}

/// Largest node that may be stored inline so that any page holds two nodes.
pub(crate) fn node_max(page_size: usize) -> usize {
    (((page_size - PAGE_HEADER_SIZE) / 2) & !1) - PTR_SIZE
}

/// Number of pages needed to hold `len` bytes of overflow data.
pub(crate) fn overflow_pages(page_size: usize, len: usize) -> usize {
    (PAGE_HEADER_SIZE + len).div_ceil(page_size)
}

/// crc32 of a page or overflow run, skipping the checksum field itself.
pub(crate) fn page_checksum(buf: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&buf[..CHECKSUM_OFFSET]);
    hasher.update(&buf[CHECKSUM_OFFSET + 4..]);
    hasher.finalize()
}

pub(crate) fn stamp_checksum(buf: &mut [u8]) {
    let sum = page_checksum(buf);
    write_u32(buf, CHECKSUM_OFFSET, sum);
}

pub(crate) fn verify_checksum(buf: &[u8]) -> bool {
    read_u32(buf, CHECKSUM_OFFSET) == page_checksum(buf)
}

/// Read access to pages as seen by one transaction.
///
/// Implemented by read-only snapshots (straight out of the memory map) and by
/// write transactions (dirty pages first, then the map).
pub trait PageSource {
    /// Returns a single page.
    fn page(&self, pgno: Pgno) -> Result<PageRef<'_>>;

    /// Returns a whole overflow run, header included.
    fn page_run(&self, pgno: Pgno) -> Result<&[u8]>;
}

/// Read-only view of a page
#[derive(Clone, Copy)]
pub struct PageRef<'a> {
    data: &'a [u8],
}

impl<'a> PageRef<'a> {
    /// Wraps raw page bytes after sanity checking the header.
    pub fn new(data: &'a [u8]) -> Result<Self> {
        if data.len() < PAGE_HEADER_SIZE {
            return Err(Error::corrupted("page shorter than its header"));
        }
        let page = PageRef { data };
        if !page.flags().contains(PageFlags::OVERFLOW) {
            let (lower, upper) = (page.lower(), page.upper());
            if lower < PAGE_HEADER_SIZE || lower > upper || upper > data.len() {
                return Err(Error::corrupted(format!(
                    "page {} has bad bounds {}..{}",
                    page.pgno(),
                    lower,
                    upper
                )));
            }
        }
        Ok(page)
    }

    pub fn bytes(&self) -> &'a [u8] {
        self.data
    }

    pub fn pgno(&self) -> Pgno {
        read_u64(self.data, PGNO_OFFSET)
    }

    pub(crate) fn flags(&self) -> PageFlags {
        PageFlags::from_bits_truncate(read_u16(self.data, FLAGS_OFFSET))
    }

    pub fn is_leaf(&self) -> bool {
        self.flags().contains(PageFlags::LEAF)
    }

    pub fn is_branch(&self) -> bool {
        self.flags().contains(PageFlags::BRANCH)
    }

    pub fn lower(&self) -> usize {
        read_u16(self.data, LOWER_OFFSET) as usize
    }

    pub fn upper(&self) -> usize {
        read_u16(self.data, UPPER_OFFSET) as usize
    }

    pub fn overflow_pages(&self) -> usize {
        read_u32(self.data, OVERFLOW_OFFSET) as usize
    }

    pub fn num_keys(&self) -> usize {
        (self.lower() - PAGE_HEADER_SIZE) / PTR_SIZE
    }

    pub fn free_space(&self) -> usize {
        self.upper() - self.lower()
    }

    /// Bytes taken by node pointers and nodes.
    pub fn used_space(&self) -> usize {
        self.data.len() - PAGE_HEADER_SIZE - self.free_space()
    }

    /// Fill factor in per-mille of the usable page area.
    pub fn fill(&self) -> usize {
        self.used_space() * 1000 / (self.data.len() - PAGE_HEADER_SIZE)
    }

    fn node_offset(&self, idx: usize) -> usize {
        read_u16(self.data, PAGE_HEADER_SIZE + idx * PTR_SIZE) as usize
    }

    pub fn node(&self, idx: usize) -> Result<NodeRef<'a>> {
        if idx >= self.num_keys() {
            return Err(Error::corrupted(format!(
                "node {} out of range on page {}",
                idx,
                self.pgno()
            )));
        }
        let off = self.node_offset(idx);
        let data = self.data;
        let bad = || Error::corrupted(format!("node {} overruns page {}", idx, read_u64(data, 0)));
        let header = data.get(off..off + NODE_HEADER_SIZE).ok_or_else(bad)?;
        let flags = NodeFlags::from_bits_truncate(read_u16(header, 0));
        let ksize = read_u16(header, 2) as usize;
        let dsize = read_u32(header, 4) as usize;
        let inline = if flags.contains(NodeFlags::BIGDATA) || self.is_branch() {
            8
        } else {
            dsize
        };
        let key_start = off + NODE_HEADER_SIZE;
        let key = data.get(key_start..key_start + ksize).ok_or_else(bad)?;
        let body = data
            .get(key_start + ksize..key_start + ksize + inline)
            .ok_or_else(bad)?;
        Ok(NodeRef {
            flags,
            key,
            dsize,
            data: body,
        })
    }

    /// Copies every node of the page.
    pub fn nodes(&self) -> Result<Vec<NodeBuf>> {
        (0..self.num_keys())
            .map(|i| self.node(i).map(|n| n.to_buf()))
            .collect()
    }
}

/// A node borrowed from a page
#[derive(Clone, Copy, Debug)]
pub struct NodeRef<'a> {
    pub(crate) flags: NodeFlags,
    pub key: &'a [u8],
    /// Logical data size; the real value length for BIGDATA nodes.
    pub dsize: usize,
    /// Inline data bytes.
    pub data: &'a [u8],
}

impl<'a> NodeRef<'a> {
    /// Child page of a branch node, or first page of an overflow run.
    pub fn pgno(&self) -> Pgno {
        read_u64(self.data, 0)
    }

    pub fn is_big(&self) -> bool {
        self.flags.contains(NodeFlags::BIGDATA)
    }

    pub fn is_dup(&self) -> bool {
        self.flags.contains(NodeFlags::DUPDATA)
    }

    pub fn is_sub(&self) -> bool {
        self.flags.contains(NodeFlags::SUBDATA)
    }

    pub fn to_buf(&self) -> NodeBuf {
        NodeBuf {
            flags: self.flags,
            key: self.key.to_vec(),
            dsize: self.dsize,
            data: self.data.to_vec(),
        }
    }
}

/// An owned node, ready to be written into a page
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeBuf {
    pub(crate) flags: NodeFlags,
    pub key: Vec<u8>,
    pub dsize: usize,
    pub data: Vec<u8>,
}

impl NodeBuf {
    pub fn leaf(key: &[u8], data: &[u8]) -> Self {
        NodeBuf {
            flags: NodeFlags::empty(),
            key: key.to_vec(),
            dsize: data.len(),
            data: data.to_vec(),
        }
    }

    pub fn big(key: &[u8], dsize: usize, pgno: Pgno) -> Self {
        NodeBuf {
            flags: NodeFlags::BIGDATA,
            key: key.to_vec(),
            dsize,
            data: pgno.to_le_bytes().to_vec(),
        }
    }

    pub fn branch(key: &[u8], child: Pgno) -> Self {
        NodeBuf {
            flags: NodeFlags::empty(),
            key: key.to_vec(),
            dsize: 8,
            data: child.to_le_bytes().to_vec(),
        }
    }

    pub(crate) fn record(key: &[u8], flags: NodeFlags, record: &[u8]) -> Self {
        NodeBuf {
            flags,
            key: key.to_vec(),
            dsize: record.len(),
            data: record.to_vec(),
        }
    }

    /// Bytes the node takes on a page, its pointer included.
    pub fn size(&self) -> usize {
        NODE_HEADER_SIZE + self.key.len() + self.data.len() + PTR_SIZE
    }

    pub fn pgno(&self) -> Pgno {
        read_u64(&self.data, 0)
    }
}

/// Mutable view of a dirty page
pub struct PageMut<'a> {
    data: &'a mut [u8],
}

impl<'a> PageMut<'a> {
    pub fn new(data: &'a mut [u8]) -> Self {
        PageMut { data }
    }

    pub fn as_ref(&self) -> PageRef<'_> {
        PageRef { data: self.data }
    }

    /// Resets the page to an empty page of the given kind.
    pub(crate) fn init(&mut self, pgno: Pgno, flags: PageFlags) {
        self.data[..PAGE_HEADER_SIZE].fill(0);
        let len = self.data.len();
        write_u64(self.data, PGNO_OFFSET, pgno);
        write_u16(self.data, FLAGS_OFFSET, flags.bits());
        write_u16(self.data, LOWER_OFFSET, PAGE_HEADER_SIZE as u16);
        write_u16(self.data, UPPER_OFFSET, len as u16);
    }

    /// Lays out an overflow run holding `value`.
    pub fn init_overflow(&mut self, pgno: Pgno, pages: usize, value: &[u8]) {
        self.data[..PAGE_HEADER_SIZE].fill(0);
        write_u64(self.data, PGNO_OFFSET, pgno);
        write_u16(self.data, FLAGS_OFFSET, PageFlags::OVERFLOW.bits());
        write_u32(self.data, OVERFLOW_OFFSET, pages as u32);
        self.data[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + value.len()].copy_from_slice(value);
    }

    pub fn set_pgno(&mut self, pgno: Pgno) {
        write_u64(self.data, PGNO_OFFSET, pgno);
    }

    fn set_lower(&mut self, v: usize) {
        write_u16(self.data, LOWER_OFFSET, v as u16);
    }

    fn set_upper(&mut self, v: usize) {
        write_u16(self.data, UPPER_OFFSET, v as u16);
    }

    /// Inserts `node` at `idx`. Returns false when the page lacks room.
    pub fn insert_node(&mut self, idx: usize, node: &NodeBuf) -> bool {
        let page = self.as_ref();
        let (lower, upper, n) = (page.lower(), page.upper(), page.num_keys());
        debug_assert!(idx <= n);
        if node.size() > upper - lower {
            return false;
        }
        let body = node.size() - PTR_SIZE;
        let off = upper - body;
        write_u16(self.data, off, node.flags.bits());
        write_u16(self.data, off + 2, node.key.len() as u16);
        write_u32(self.data, off + 4, node.dsize as u32);
        let key_start = off + NODE_HEADER_SIZE;
        self.data[key_start..key_start + node.key.len()].copy_from_slice(&node.key);
        let data_start = key_start + node.key.len();
        self.data[data_start..data_start + node.data.len()].copy_from_slice(&node.data);

        let ptr = PAGE_HEADER_SIZE + idx * PTR_SIZE;
        self.data.copy_within(ptr..lower, ptr + PTR_SIZE);
        write_u16(self.data, ptr, off as u16);
        self.set_lower(lower + PTR_SIZE);
        self.set_upper(off);
        true
    }

    /// Removes the node at `idx`, compacting the node area.
    pub fn remove_node(&mut self, idx: usize) {
        let page = self.as_ref();
        let (lower, upper, n) = (page.lower(), page.upper(), page.num_keys());
        debug_assert!(idx < n);
        let off = page.node_offset(idx);
        let size = match page.node(idx) {
            Ok(node) => NODE_HEADER_SIZE + node.key.len() + node.data.len(),
            Err(_) => return,
        };

        for i in 0..n {
            let p = PAGE_HEADER_SIZE + i * PTR_SIZE;
            let o = read_u16(self.data, p) as usize;
            if o < off {
                write_u16(self.data, p, (o + size) as u16);
            }
        }
        let ptr = PAGE_HEADER_SIZE + idx * PTR_SIZE;
        self.data.copy_within(ptr + PTR_SIZE..lower, ptr);
        self.data.copy_within(upper..off, upper + size);
        self.set_lower(lower - PTR_SIZE);
        self.set_upper(upper + size);
    }

    /// Overwrites the inline data of node `idx`; the length must not change.
    pub fn set_node_data(&mut self, idx: usize, bytes: &[u8]) {
        let off = self.as_ref().node_offset(idx);
        let ksize = read_u16(self.data, off + 2) as usize;
        let start = off + NODE_HEADER_SIZE + ksize;
        self.data[start..start + bytes.len()].copy_from_slice(bytes);
    }

    pub fn set_node_dsize(&mut self, idx: usize, dsize: usize) {
        let off = self.as_ref().node_offset(idx);
        write_u32(self.data, off + 4, dsize as u32);
    }

    /// Points branch node `idx` at a new child.
    pub fn set_child(&mut self, idx: usize, child: Pgno) {
        self.set_node_data(idx, &child.to_le_bytes());
    }

    /// Rewrites the page from scratch with `nodes`. Returns false when they
    /// do not fit, leaving the page in an unspecified state.
    pub(crate) fn rebuild(&mut self, pgno: Pgno, flags: PageFlags, nodes: &[NodeBuf]) -> bool {
        self.init(pgno, flags);
        nodes
            .iter()
            .enumerate()
            .all(|(i, node)| self.insert_node(i, node))
    }
}

/// Bytes of page area available to nodes.
pub(crate) fn page_capacity(page_size: usize) -> usize {
    page_size - PAGE_HEADER_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf_page(size: usize) -> Vec<u8> {
        let mut buf = vec![0u8; size];
        PageMut::new(&mut buf).init(7, PageFlags::LEAF);
        buf
    }

    #[test]
    fn test_insert_keeps_order_of_pointers() {
        let mut buf = leaf_page(512);
        let mut page = PageMut::new(&mut buf);
        assert!(page.insert_node(0, &NodeBuf::leaf(b"b", b"2")));
        assert!(page.insert_node(0, &NodeBuf::leaf(b"a", b"1")));
        assert!(page.insert_node(2, &NodeBuf::leaf(b"c", b"3")));

        let view = page.as_ref();
        assert_eq!(view.pgno(), 7);
        assert_eq!(view.num_keys(), 3);
        let keys: Vec<&[u8]> = (0..3).map(|i| view.node(i).unwrap().key).collect();
        assert_eq!(keys, vec![&b"a"[..], b"b", b"c"]);
        assert_eq!(view.node(1).unwrap().data, b"2");
    }

    #[test]
    fn test_remove_compacts_node_area() {
        let mut buf = leaf_page(512);
        let mut page = PageMut::new(&mut buf);
        for (i, k) in [b"k1", b"k2", b"k3"].iter().enumerate() {
            assert!(page.insert_node(i, &NodeBuf::leaf(*k, b"value")));
        }
        let free_before = page.as_ref().free_space();
        page.remove_node(1);

        let view = page.as_ref();
        assert_eq!(view.num_keys(), 2);
        assert_eq!(view.node(0).unwrap().key, b"k1");
        assert_eq!(view.node(1).unwrap().key, b"k3");
        assert_eq!(view.node(1).unwrap().data, b"value");
        assert_eq!(
            view.free_space(),
            free_before + NODE_HEADER_SIZE + 2 + 5 + PTR_SIZE
        );
    }

    #[test]
    fn test_insert_reports_full_page() {
        let mut buf = leaf_page(512);
        let mut page = PageMut::new(&mut buf);
        let big = vec![9u8; 200];
        assert!(page.insert_node(0, &NodeBuf::leaf(b"a", &big)));
        assert!(page.insert_node(1, &NodeBuf::leaf(b"b", &big)));
        assert!(!page.insert_node(2, &NodeBuf::leaf(b"c", &big)));
        assert_eq!(page.as_ref().num_keys(), 2);
    }

    #[test]
    fn test_branch_nodes_carry_children() {
        let mut buf = vec![0u8; 512];
        let mut page = PageMut::new(&mut buf);
        page.init(3, PageFlags::BRANCH);
        assert!(page.insert_node(0, &NodeBuf::branch(b"", 10)));
        assert!(page.insert_node(1, &NodeBuf::branch(b"m", 11)));
        page.set_child(1, 12);

        let view = page.as_ref();
        assert!(view.is_branch());
        assert_eq!(view.node(0).unwrap().pgno(), 10);
        assert_eq!(view.node(1).unwrap().pgno(), 12);
        assert_eq!(view.node(1).unwrap().key, b"m");
    }

    #[test]
    fn test_checksum_detects_flipped_byte() {
        let mut buf = leaf_page(512);
        PageMut::new(&mut buf).insert_node(0, &NodeBuf::leaf(b"key", b"val"));
        stamp_checksum(&mut buf);
        assert!(verify_checksum(&buf));
        buf[400] ^= 0xff;
        assert!(!verify_checksum(&buf));
    }

    #[test]
    fn test_node_max_leaves_room_for_two_nodes() {
        for size in [512usize, 4096, 32768] {
            let max = node_max(size);
            assert!(2 * (max + PTR_SIZE) <= page_capacity(size));
        }
        assert_eq!(overflow_pages(4096, 100), 1);
        assert_eq!(overflow_pages(4096, 4096), 2);
    }
}
