//! An embedded key/value store over a memory-mapped, copy-on-write B+tree.
//!
//! One [`Environment`] holds a data file and a lock file. Inside it live the
//! main database and optionally named databases, each its own sorted tree.
//! A single [`RwTransaction`] writes at a time while any number of
//! [`RoTransaction`]s read consistent snapshots without blocking it.
mod btree;
mod constants;
mod cursor;
mod database;
mod env;
mod error;
mod freelist;
mod lock;
mod meta;
mod midl;
mod page;
mod transaction;
mod types;
mod value;

pub use constants::{
    CopyFlags, DbFlags, EnvFlags, WriteFlags, DEFAULT_MAP_SIZE, DEFAULT_MAX_READERS, MAX_KEY_SIZE,
    MAX_PAGE_SIZE, MIN_PAGE_SIZE,
};
pub use cursor::{Iter, RoCursor, RwCursor};
pub use database::Database;
pub use env::{Environment, EnvironmentBuilder};
pub use error::{Error, Result};
pub use transaction::{NestedTransaction, RoTransaction, RwTransaction, Transaction};
pub use types::{CursorOp, EnvInfo, ReaderInfo, Stat};
pub use value::{cmp_int, cmp_lexical, cmp_reverse, Comparator};
