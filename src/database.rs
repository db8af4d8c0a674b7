use crate::btree;
use crate::constants::{DbFlags, WriteFlags, CORE_DBS, MAIN_DBI};
use crate::cursor::{RoCursor, RwCursor};
use crate::error::{Error, Result};
use crate::meta::DbRecord;
use crate::transaction::{RwTransaction, Transaction, TxnAccess, TxnDb};
use crate::types::Stat;
use crate::value::Comparator;

/// Flags kept in a database record
const PERSISTENT_FLAGS: DbFlags = DbFlags::REVERSEKEY
    .union(DbFlags::DUPSORT)
    .union(DbFlags::INTEGERKEY)
    .union(DbFlags::INTEGERDUP)
    .union(DbFlags::REVERSEDUP);

/// Database handle
///
/// A plain index into the environment's table of open databases. Handles
/// stay valid across transactions until the database is dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Database {
    dbi: u32,
}

impl Database {
    pub(crate) fn dbi(&self) -> u32 {
        self.dbi
    }

    /// Open an existing database: the main database for `None`, otherwise
    /// a named one, failing with `NotFound` if it does not exist.
    pub fn open<T: Transaction>(txn: &T, name: Option<&str>) -> Result<Self> {
        let Some(name) = name else {
            return Ok(Database { dbi: MAIN_DBI });
        };
        let main = txn.txn_db(MAIN_DBI)?;
        let rec = btree::find_record(txn, &main, name.as_bytes())?.ok_or(Error::NotFound)?;
        let dbi = txn
            .txn_env()
            .register_db(name, DbFlags::from_bits_truncate(rec.flags))?;
        Ok(Database { dbi })
    }

    /// Open a database, creating it if needed.
    ///
    /// An existing database keeps its stored flags; asking for different
    /// ones fails with `Incompatible`. The flags of the main database can
    /// only change while it is empty.
    pub fn create(txn: &mut RwTransaction, name: Option<&str>, flags: DbFlags) -> Result<Self> {
        let flags = flags & PERSISTENT_FLAGS;
        let Some(name) = name else {
            return Self::create_main(txn, flags);
        };
        if name.is_empty() || name.len() > txn.txn_env().max_key_size() {
            return Err(Error::BadValSize);
        }
        let main = txn.txn_db(MAIN_DBI)?;
        if let Some(rec) = btree::find_record(&*txn, &main, name.as_bytes())? {
            let stored = DbFlags::from_bits_truncate(rec.flags);
            if !flags.is_empty() && flags != stored {
                return Err(Error::Incompatible);
            }
            let dbi = txn.txn_env().register_db(name, stored)?;
            return Ok(Database { dbi });
        }

        let dbi = txn.txn_env().register_db(name, flags)?;
        let rec = DbRecord::with_flags(flags.bits());
        let created = txn.with_db(MAIN_DBI, |t, main| btree::put_record(t, main, name.as_bytes(), &rec));
        if let Err(e) = created {
            txn.txn_env().close_db(dbi);
            return Err(e);
        }
        let slot = txn.txn_env().db_slot(dbi)?;
        txn.set_db(dbi, Some(TxnDb::new(rec, &slot)));
        Ok(Database { dbi })
    }

    fn create_main(txn: &mut RwTransaction, flags: DbFlags) -> Result<Self> {
        let main = txn.txn_db(MAIN_DBI)?;
        if main.flags() != flags {
            if !main.rec.is_empty() {
                return Err(Error::Incompatible);
            }
            txn.with_db(MAIN_DBI, |_, db| {
                db.rec.flags = flags.bits();
                Ok(())
            })?;
            txn.txn_env().set_db_flags(MAIN_DBI, flags)?;
        }
        Ok(Database { dbi: MAIN_DBI })
    }

    /// Get database statistics
    pub fn stat<T: Transaction>(&self, txn: &T) -> Result<Stat> {
        txn.stat(*self)
    }

    /// Get database flags
    pub fn flags<T: Transaction>(&self, txn: &T) -> Result<DbFlags> {
        txn.db_flags(*self)
    }

    /// Get a value by key, the first duplicate in DUPSORT databases.
    pub fn get<'t, T: Transaction>(&self, txn: &'t T, key: &[u8]) -> Result<Option<&'t [u8]>> {
        match txn.get(*self, key) {
            Ok(value) => Ok(Some(value)),
            Err(Error::NotFound) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Put a key/value pair
    pub fn put(&self, txn: &mut RwTransaction, key: &[u8], data: &[u8], flags: WriteFlags) -> Result<()> {
        txn.put(*self, key, data, flags)
    }

    /// Delete a key, or a single duplicate when `data` is given
    pub fn del(&self, txn: &mut RwTransaction, key: &[u8], data: Option<&[u8]>) -> Result<()> {
        txn.del(*self, key, data)
    }

    /// Create a cursor for this database
    pub fn cursor<'t, T: Transaction>(&self, txn: &'t T) -> Result<RoCursor<'t>> {
        txn.open_ro_cursor(*self)
    }

    /// Create a writing cursor for this database
    pub fn rw_cursor<'t, 'env>(&self, txn: &'t mut RwTransaction<'env>) -> Result<RwCursor<'t, 'env>> {
        txn.open_rw_cursor(*self)
    }

    /// Empty the database, or with `del` delete it and close the handle.
    /// The main database can only be emptied.
    pub fn drop(self, txn: &mut RwTransaction, del: bool) -> Result<()> {
        if del && self.dbi >= CORE_DBS {
            txn.drop_db(self)
        } else {
            txn.clear_db(self)
        }
    }

    /// Set a custom key comparison function.
    ///
    /// Must be set before the database is written and every time it is
    /// opened; the order is not stored in the file.
    pub fn set_compare<T: Transaction>(&self, txn: &T, cmp: Comparator) -> Result<()> {
        txn.txn_env().set_compare(self.dbi, cmp)
    }

    /// Set a custom duplicate comparison function for a DUPSORT database.
    pub fn set_dupsort<T: Transaction>(&self, txn: &T, cmp: Comparator) -> Result<()> {
        txn.txn_env().set_dup_compare(self.dbi, cmp)
    }
}
