/// Cursor positioning operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorOp {
    /// First item of the database
    First,
    /// First duplicate of the current key
    FirstDup,
    /// Exact key and value
    GetBoth,
    /// Exact key, first duplicate not less than the value
    GetBothRange,
    GetCurrent,
    Last,
    LastDup,
    Next,
    NextDup,
    /// First duplicate of the next key
    NextNoDup,
    Prev,
    PrevDup,
    /// Last duplicate of the previous key
    PrevNoDup,
    /// Exact key
    Set,
    /// Exact key; same as `Set`
    SetKey,
    /// First key greater than or equal to the given one
    SetRange,
}

/// Statistics of one database or of the main tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stat {
    /// Page size of the environment
    pub psize: u32,
    /// Height of the B+tree
    pub depth: u32,
    pub branch_pages: usize,
    pub leaf_pages: usize,
    pub overflow_pages: usize,
    pub entries: usize,
}

/// Environment information, read from the newest meta page
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvInfo {
    pub mapsize: usize,
    /// Highest page number in use
    pub last_pgno: usize,
    pub last_txnid: usize,
    pub max_readers: u32,
    /// Reader slots ever used since the lock file was reset
    pub num_readers: u32,
}

/// A snapshot of one used reader slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReaderInfo {
    /// Process owning the slot
    pub pid: u32,
    /// Thread that claimed the slot
    pub thread: u64,
    /// Pinned transaction id, `None` between transactions
    pub txnid: Option<u64>,
}
