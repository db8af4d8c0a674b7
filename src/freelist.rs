//! The freelist tree: database slot 0, keyed by the id of the transaction
//! that released the pages (8 bytes, big-endian) with the released page
//! numbers as value (little-endian u64s, ascending).

use log::{debug, trace};

use crate::btree;
use crate::constants::{WriteFlags, FREE_DBI};
use crate::cursor::TreeCursor;
use crate::error::{Error, Result};
use crate::midl::Idl;
use crate::page::{read_u64, Pgno};
use crate::transaction::{RwTransaction, TxnAccess};

/// Rewrites of the record before allocation stops reusing pages.
const SAVE_ROUNDS: usize = 4;

pub(crate) fn record_key(txnid: u64) -> [u8; 8] {
    txnid.to_be_bytes()
}

fn decode_key(key: &[u8]) -> Result<u64> {
    let bytes: [u8; 8] = key
        .try_into()
        .map_err(|_| Error::corrupted("freelist key is not 8 bytes"))?;
    Ok(u64::from_be_bytes(bytes))
}

pub(crate) fn encode(ids: &[Pgno]) -> Vec<u8> {
    ids.iter().flat_map(|id| id.to_le_bytes()).collect()
}

pub(crate) fn decode(buf: &[u8]) -> Result<Vec<Pgno>> {
    if buf.len() % 8 != 0 {
        return Err(Error::corrupted("freelist record length"));
    }
    Ok((0..buf.len() / 8).map(|i| read_u64(buf, i * 8)).collect())
}

/// Pulls the next freelist record no reader can still need into the
/// transaction's reclaimed pages. Returns false when there is none.
pub(crate) fn reclaim_next(txn: &mut RwTransaction) -> Result<bool> {
    let oldest = txn.oldest_reader();
    let free = txn.txn_db(FREE_DBI)?;
    let start = record_key(txn.state.last_reclaimed + 1);

    let found = {
        let mut cursor = TreeCursor::default();
        cursor.seek(&*txn, &free.rec, free.cmp, &start)?;
        match cursor.node(&*txn)? {
            Some(node) => {
                let value = btree::node_value(&*txn, &node)?;
                Some((decode_key(node.key)?, decode(value)?))
            }
            None => None,
        }
    };

    let Some((id, pages)) = found else {
        return Ok(false);
    };
    if id >= oldest {
        return Ok(false);
    }
    trace!("reclaimed {} page(s) freed by txn {}", pages.len(), id);
    txn.state.reclaimed.merge(&pages);
    txn.state.reclaimed_keys.push(id);
    txn.state.last_reclaimed = id;
    Ok(true)
}

fn pending(txn: &RwTransaction) -> Idl {
    let mut set = txn.state.free_pgs.clone();
    set.merge(Idl::from_unsorted(txn.state.loose.clone()).as_slice());
    set.merge(txn.state.reclaimed.as_slice());
    set
}

/// Writes this transaction's freelist record.
///
/// Consumed records are deleted first. Writing the record can itself touch,
/// allocate and release pages, so it is rewritten until the set of pages it
/// holds no longer changes.
pub(crate) fn save(txn: &mut RwTransaction) -> Result<()> {
    txn.saving = true;
    let consumed = std::mem::take(&mut txn.state.reclaimed_keys);
    for id in &consumed {
        txn.with_db(FREE_DBI, |t, db| btree::remove_key(t, db, &record_key(*id)))?;
    }

    let key = record_key(txn.txn_id());
    let mut written: Option<Idl> = None;
    let mut rounds = 0;
    loop {
        let set = pending(txn);
        if written.as_ref() == Some(&set) || (written.is_none() && set.is_empty()) {
            break;
        }
        rounds += 1;
        if rounds > SAVE_ROUNDS {
            txn.extend_only = true;
        }
        let value = encode(set.as_slice());
        txn.with_db(FREE_DBI, |t, db| btree::put(t, db, &key, &value, WriteFlags::empty()))?;
        written = Some(set);
    }
    debug!(
        "saved freelist for txn {}: {} page(s), {} record(s) consumed",
        txn.txn_id(),
        written.map_or(0, |set| set.len()),
        consumed.len()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_sort_by_txnid() {
        assert!(record_key(2) < record_key(256));
        assert_eq!(decode_key(&record_key(77)).unwrap(), 77);
    }

    #[test]
    fn test_record_values() {
        let ids = vec![3, 4, 90];
        assert_eq!(decode(&encode(&ids)).unwrap(), ids);
        assert!(decode(&[1, 2, 3]).is_err());
    }
}
