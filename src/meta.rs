use crate::constants::{PageFlags, DATA_VERSION, MDB_MAGIC, P_INVALID};
use crate::error::{Error, Result};
use crate::page::{read_u32, read_u64, write_u16, write_u32, write_u64, Pgno, PAGE_HEADER_SIZE};

/// Encoded size of a [`DbRecord`]
pub(crate) const DB_RECORD_SIZE: usize = 48;

const META_OFFSET: usize = PAGE_HEADER_SIZE;
const MAGIC_OFFSET: usize = META_OFFSET;
const VERSION_OFFSET: usize = META_OFFSET + 4;
const PSIZE_OFFSET: usize = META_OFFSET + 8;
const FLAGS_OFFSET: usize = META_OFFSET + 12;
const MAPSIZE_OFFSET: usize = META_OFFSET + 16;
const FREE_DB_OFFSET: usize = META_OFFSET + 24;
const MAIN_DB_OFFSET: usize = FREE_DB_OFFSET + DB_RECORD_SIZE;
const LAST_PGNO_OFFSET: usize = MAIN_DB_OFFSET + DB_RECORD_SIZE;
const TXNID_OFFSET: usize = LAST_PGNO_OFFSET + 8;
const CHECKSUM_OFFSET: usize = TXNID_OFFSET + 8;

/// Bytes of a meta page that carry information, page header included.
pub(crate) const META_SIZE: usize = CHECKSUM_OFFSET + 4;

/// Persistent description of one B+tree: the freelist, the main tree, a
/// named database, or a duplicate sub-tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DbRecord {
    /// Persistent database flags
    pub flags: u32,
    /// Depth (height) of the tree, 0 when empty
    pub depth: u32,
    pub branch_pages: u64,
    pub leaf_pages: u64,
    pub overflow_pages: u64,
    pub entries: u64,
    /// Root page, or `P_INVALID` for an empty tree
    pub root: Pgno,
}

impl Default for DbRecord {
    fn default() -> Self {
        DbRecord {
            flags: 0,
            depth: 0,
            branch_pages: 0,
            leaf_pages: 0,
            overflow_pages: 0,
            entries: 0,
            root: P_INVALID,
        }
    }
}

impl DbRecord {
    pub(crate) fn with_flags(flags: u32) -> Self {
        DbRecord {
            flags,
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.root == P_INVALID
    }

    pub(crate) fn encode(&self) -> [u8; DB_RECORD_SIZE] {
        let mut buf = [0u8; DB_RECORD_SIZE];
        self.write_to(&mut buf);
        buf
    }

    pub(crate) fn write_to(&self, buf: &mut [u8]) {
        write_u32(buf, 0, self.flags);
        write_u32(buf, 4, self.depth);
        write_u64(buf, 8, self.branch_pages);
        write_u64(buf, 16, self.leaf_pages);
        write_u64(buf, 24, self.overflow_pages);
        write_u64(buf, 32, self.entries);
        write_u64(buf, 40, self.root);
    }

    pub(crate) fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < DB_RECORD_SIZE {
            return Err(Error::corrupted("short database record"));
        }
        Ok(DbRecord {
            flags: read_u32(buf, 0),
            depth: read_u32(buf, 4),
            branch_pages: read_u64(buf, 8),
            leaf_pages: read_u64(buf, 16),
            overflow_pages: read_u64(buf, 24),
            entries: read_u64(buf, 32),
            root: read_u64(buf, 40),
        })
    }
}

/// Contents of a meta page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct MetaHeader {
    pub(crate) page_size: u32,
    /// Persistent environment flags (only `CHECKSUM` today)
    pub(crate) flags: u32,
    pub(crate) mapsize: u64,
    /// Freelist and main tree records
    pub(crate) dbs: [DbRecord; 2],
    /// Highest page number in use
    pub(crate) last_pgno: Pgno,
    /// Transaction that wrote this meta page
    pub(crate) txnid: u64,
}

impl MetaHeader {
    /// Meta of a freshly created environment.
    pub(crate) fn new(page_size: u32, mapsize: u64, flags: u32) -> Self {
        MetaHeader {
            page_size,
            flags,
            mapsize,
            dbs: [DbRecord::default(), DbRecord::default()],
            last_pgno: 1,
            txnid: 0,
        }
    }

    /// Meta slot a transaction id commits into.
    pub(crate) fn slot_for(txnid: u64) -> Pgno {
        txnid % 2
    }

    /// Writes this meta as page `slot` into `page`.
    pub(crate) fn encode_into(&self, slot: Pgno, page: &mut [u8]) {
        page[..META_SIZE].fill(0);
        write_u64(page, 0, slot);
        write_u16(page, 8, PageFlags::META.bits());
        write_u32(page, MAGIC_OFFSET, MDB_MAGIC);
        write_u32(page, VERSION_OFFSET, DATA_VERSION);
        write_u32(page, PSIZE_OFFSET, self.page_size);
        write_u32(page, FLAGS_OFFSET, self.flags);
        write_u64(page, MAPSIZE_OFFSET, self.mapsize);
        self.dbs[0].write_to(&mut page[FREE_DB_OFFSET..MAIN_DB_OFFSET]);
        self.dbs[1].write_to(&mut page[MAIN_DB_OFFSET..LAST_PGNO_OFFSET]);
        write_u64(page, LAST_PGNO_OFFSET, self.last_pgno);
        write_u64(page, TXNID_OFFSET, self.txnid);
        let sum = crc32fast::hash(&page[META_OFFSET..CHECKSUM_OFFSET]);
        write_u32(page, CHECKSUM_OFFSET, sum);
    }

    /// Parses a meta page, rejecting foreign files, other format versions
    /// and torn writes.
    pub(crate) fn decode(page: &[u8]) -> Result<Self> {
        if page.len() < META_SIZE {
            return Err(Error::Invalid("file too short for a meta page"));
        }
        if read_u32(page, MAGIC_OFFSET) != MDB_MAGIC {
            return Err(Error::Invalid("not a lumodb data file"));
        }
        let version = read_u32(page, VERSION_OFFSET);
        if version != DATA_VERSION {
            return Err(Error::VersionMismatch {
                found: version,
                expected: DATA_VERSION,
            });
        }
        if read_u32(page, CHECKSUM_OFFSET) != crc32fast::hash(&page[META_OFFSET..CHECKSUM_OFFSET]) {
            return Err(Error::corrupted(format!(
                "meta page {} checksum mismatch",
                read_u64(page, 0)
            )));
        }
        Ok(MetaHeader {
            page_size: read_u32(page, PSIZE_OFFSET),
            flags: read_u32(page, FLAGS_OFFSET),
            mapsize: read_u64(page, MAPSIZE_OFFSET),
            dbs: [
                DbRecord::decode(&page[FREE_DB_OFFSET..MAIN_DB_OFFSET])?,
                DbRecord::decode(&page[MAIN_DB_OFFSET..LAST_PGNO_OFFSET])?,
            ],
            last_pgno: read_u64(page, LAST_PGNO_OFFSET),
            txnid: read_u64(page, TXNID_OFFSET),
        })
    }

    /// Picks the newest valid meta out of the two slots.
    ///
    /// A slot with a bad magic or checksum is skipped as long as the other
    /// one decodes. A format version mismatch in either slot is reported.
    pub(crate) fn pick(slot0: &[u8], slot1: &[u8]) -> Result<Self> {
        let a = MetaHeader::decode(slot0);
        let b = MetaHeader::decode(slot1);
        match (a, b) {
            (Ok(a), Ok(b)) => Ok(if b.txnid > a.txnid { b } else { a }),
            (Err(e @ Error::VersionMismatch { .. }), _)
            | (_, Err(e @ Error::VersionMismatch { .. })) => Err(e),
            (Ok(m), Err(_)) | (Err(_), Ok(m)) => Ok(m),
            (Err(Error::Invalid(msg)), Err(Error::Invalid(_))) => Err(Error::Invalid(msg)),
            (Err(_), Err(_)) => Err(Error::corrupted("no valid meta page")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded(meta: &MetaHeader, slot: Pgno) -> Vec<u8> {
        let mut page = vec![0u8; 4096];
        meta.encode_into(slot, &mut page);
        page
    }

    #[test]
    fn test_newer_meta_wins() {
        let mut meta = MetaHeader::new(4096, 1 << 20, 0);
        let old = encoded(&meta, 0);
        meta.txnid = 1;
        meta.last_pgno = 9;
        meta.dbs[1].root = 4;
        let new = encoded(&meta, 1);

        let picked = MetaHeader::pick(&old, &new).unwrap();
        assert_eq!(picked.txnid, 1);
        assert_eq!(picked.last_pgno, 9);
        assert_eq!(picked.dbs[1].root, 4);
        assert!(picked.dbs[0].is_empty());
    }

    #[test]
    fn test_torn_meta_falls_back_to_other_slot() {
        let mut meta = MetaHeader::new(4096, 1 << 20, 0);
        meta.txnid = 6;
        let older = encoded(&meta, 0);
        meta.txnid = 7;
        let mut newer = encoded(&meta, 1);
        newer[TXNID_OFFSET] ^= 0x55;

        let picked = MetaHeader::pick(&older, &newer).unwrap();
        assert_eq!(picked.txnid, 6);

        let mut both_bad = older.clone();
        both_bad[MAPSIZE_OFFSET] ^= 1;
        assert!(matches!(
            MetaHeader::pick(&both_bad, &newer),
            Err(Error::Corrupted(_))
        ));
    }

    #[test]
    fn test_bad_magic_in_one_slot_is_skipped() {
        let mut meta = MetaHeader::new(4096, 1 << 20, 0);
        meta.txnid = 1;
        let older = encoded(&meta, 1);
        meta.txnid = 2;
        let mut newer = encoded(&meta, 0);
        newer[MAGIC_OFFSET..MAGIC_OFFSET + 4].fill(0);

        let picked = MetaHeader::pick(&newer, &older).unwrap();
        assert_eq!(picked.txnid, 1);

        let mut foreign = older.clone();
        foreign[MAGIC_OFFSET] ^= 0xff;
        assert!(matches!(MetaHeader::pick(&newer, &foreign), Err(Error::Invalid(_))));

        let mut torn = older.clone();
        torn[TXNID_OFFSET] ^= 1;
        assert!(matches!(MetaHeader::pick(&newer, &torn), Err(Error::Corrupted(_))));

        let mut future = older.clone();
        write_u32(&mut future, VERSION_OFFSET, DATA_VERSION + 1);
        assert!(matches!(
            MetaHeader::pick(&encoded(&meta, 0), &future),
            Err(Error::VersionMismatch { .. })
        ));
    }

    #[test]
    fn test_foreign_and_future_files_are_rejected() {
        let meta = MetaHeader::new(4096, 1 << 20, 0);
        let mut page = encoded(&meta, 0);
        page[MAGIC_OFFSET] ^= 0xff;
        assert!(matches!(MetaHeader::decode(&page), Err(Error::Invalid(_))));

        let mut page = encoded(&meta, 0);
        write_u32(&mut page, VERSION_OFFSET, DATA_VERSION + 1);
        assert!(matches!(
            MetaHeader::decode(&page),
            Err(Error::VersionMismatch { .. })
        ));
    }
}
