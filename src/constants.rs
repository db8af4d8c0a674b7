use bitflags::bitflags;

// Environment flags
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct EnvFlags: u32 {
        /// The path names the data file itself; the lock file is `<path>-lock`
        const NOSUBDIR = 0x4000;
        /// Don't fsync after commit
        const NOSYNC = 0x10000;
        /// Open the environment read-only
        const RDONLY = 0x20000;
        /// Don't fsync the meta page after commit
        const NOMETASYNC = 0x40000;
        /// Write dirty pages straight into a writable memory map
        const WRITEMAP = 0x80000;
        /// With WRITEMAP, flush asynchronously
        const MAPASYNC = 0x100000;
        /// Store and verify a crc32 in every data page (fixed at creation)
        const CHECKSUM = 0x4000_0000;
    }
}

// Database flags
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct DbFlags: u32 {
        const REVERSEKEY = 0x02;
        const DUPSORT = 0x04;
        const INTEGERKEY = 0x08;
        const INTEGERDUP = 0x20;
        const REVERSEDUP = 0x40;
        const CREATE = 0x40000;
    }
}

// Write operation flags
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct WriteFlags: u32 {
        const NOOVERWRITE = 0x10;
        const NODUPDATA = 0x20;
        const CURRENT = 0x40;
        const APPEND = 0x20000;
        const APPENDDUP = 0x40000;
    }
}

// Transaction state flags
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct TransactionFlags: u32 {
        const FINISHED = 0x01;
        const ERROR = 0x02;
    }
}

// Copy operation flags
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CopyFlags: u32 {
        const COMPACT = 0x01;
    }
}

// Internal node flags
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct NodeFlags: u16 {
        /// Data lives in an overflow run
        const BIGDATA = 0x01;
        /// Data is a database record
        const SUBDATA = 0x02;
        /// Data is the record of a duplicate sub-tree
        const DUPDATA = 0x04;
    }
}

// Page flags
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct PageFlags: u16 {
        const BRANCH = 0x01;
        const LEAF = 0x02;
        const OVERFLOW = 0x04;
        const META = 0x08;
    }
}

/// Magic number for lumodb data files
pub const MDB_MAGIC: u32 = 0xBEEF_C0DE;
/// Magic number for lumodb lock files
pub const LOCK_MAGIC: u32 = 0xBEEF_10C4;
/// On-disk format version of the data file
pub const DATA_VERSION: u32 = 1;
/// On-disk format version of the lock file
pub const LOCK_VERSION: u32 = 1;
/// Version numbers major
pub const VERSION_MAJOR: u32 = 0;
/// Version numbers minor
pub const VERSION_MINOR: u32 = 9;
/// Version numbers patch
pub const VERSION_PATCH: u32 = 70;

/// Database slot of the freelist tree
pub(crate) const FREE_DBI: u32 = 0;
/// Database slot of the main tree
pub(crate) const MAIN_DBI: u32 = 1;
/// Core database identifiers reserved by the engine
pub(crate) const CORE_DBS: u32 = 2;
/// Number of meta pages at the start of the data file
pub(crate) const META_PAGES: u64 = 2;

/// Page number meaning "no page"
pub(crate) const P_INVALID: u64 = u64::MAX;
/// Smallest supported page size
pub const MIN_PAGE_SIZE: usize = 512;
/// Largest supported page size; page offsets are 16 bits wide
pub const MAX_PAGE_SIZE: usize = 32768;
/// Upper bound on key length regardless of page size
pub const MAX_KEY_SIZE: usize = 511;
/// Pages filled below this many per-mille get rebalanced after deletes
pub(crate) const FILL_THRESHOLD: usize = 250;

pub const DEFAULT_MAP_SIZE: usize = 1 << 20;
pub const DEFAULT_MAX_READERS: u32 = 126;
pub const DEFAULT_MAX_DBS: u32 = 0;
pub const DEFAULT_FILE_MODE: u32 = 0o644;

pub(crate) const DATA_NAME: &str = "data.mdb";
pub(crate) const LOCK_NAME: &str = "lock.mdb";
pub(crate) const LOCK_SUFFIX: &str = "-lock";
