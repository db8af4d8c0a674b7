use std::io;
use std::result;

use thiserror::Error;

/// Custom result type for lumodb operations
pub type Result<T> = result::Result<T, Error>;

/// Errors returned by the storage engine
#[derive(Debug, Error)]
pub enum Error {
    /// Key/data pair already exists
    #[error("Key/data pair already exists")]
    KeyExist,
    /// No matching key/data pair found
    #[error("No matching key/data pair found")]
    NotFound,
    /// Requested page not found
    #[error("Requested page {0} not found")]
    PageNotFound(u64),
    /// Database file is corrupted
    #[error("Database file is corrupted: {0}")]
    Corrupted(String),
    /// Database version mismatch
    #[error("Database version mismatch: found {found}, expected {expected}")]
    VersionMismatch { found: u32, expected: u32 },
    /// File is not a valid database file, or the call is not valid here
    #[error("Invalid argument or file: {0}")]
    Invalid(&'static str),
    /// Environment mapsize limit reached
    #[error("Environment mapsize limit reached")]
    MapFull,
    /// Another handle grew the data past this handle's map
    #[error("Database contents grew beyond environment mapsize")]
    MapResized,
    /// Environment maxdbs limit reached
    #[error("Environment maxdbs limit reached")]
    DbsFull,
    /// Environment maxreaders limit reached
    #[error("Environment maxreaders limit reached")]
    ReadersFull,
    /// Non-blocking lock acquisition failed
    #[error("Write lock is held by another transaction")]
    WouldBlock,
    /// Operation and DB incompatible
    #[error("Operation and DB incompatible")]
    Incompatible,
    /// Transaction must abort, has a child, or is invalid
    #[error("Transaction must abort, has a child, or is invalid")]
    BadTxn,
    /// Unsupported size of key/DB name/data
    #[error("Unsupported size of key/DB name/data")]
    BadValSize,
    /// The specified DBI is not valid in this transaction
    #[error("The specified DBI is not valid in this transaction")]
    BadDbi,
    /// Environment is read-only
    #[error("Environment is read-only")]
    EnvReadOnly,
    /// Environment flags cannot be modified
    #[error("Environment flags cannot be modified after open")]
    EnvFlagsImmutable,
    /// Storage I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Whether the error was raised before any page was modified.
    ///
    /// Any other failure inside a write operation leaves the transaction
    /// unusable for commit.
    pub(crate) fn is_benign(&self) -> bool {
        matches!(
            self,
            Error::KeyExist
                | Error::NotFound
                | Error::BadValSize
                | Error::BadDbi
                | Error::Incompatible
                | Error::Invalid(_)
        )
    }

    pub(crate) fn corrupted(what: impl Into<String>) -> Error {
        Error::Corrupted(what.into())
    }
}
