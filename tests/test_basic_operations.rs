use lumodb::{Database, DbFlags, Environment, Error, Transaction, WriteFlags};
use tempfile::TempDir;

// Common test setup
fn setup_test_env() -> (TempDir, Environment) {
    let temp_dir = TempDir::new().unwrap();
    let env = Environment::new()
        .set_max_dbs(4)
        .open(temp_dir.path())
        .unwrap();
    (temp_dir, env)
}

#[test]
fn test_database_open_close() {
    let (_dir, env) = setup_test_env();
    let mut txn = env.begin_txn().unwrap();

    // Test opening default database
    let db = Database::open(&txn, None).unwrap();
    assert!(db.flags(&txn).unwrap().is_empty());

    // Named databases have to be created first
    assert!(matches!(Database::open(&txn, Some("testdb")), Err(Error::NotFound)));
    let named = Database::create(&mut txn, Some("testdb"), DbFlags::CREATE).unwrap();
    assert_ne!(named, db);
    txn.commit().unwrap();

    let txn = env.begin_ro_txn().unwrap();
    assert_eq!(Database::open(&txn, Some("testdb")).unwrap(), named);
}

#[test]
fn test_basic_put_get() {
    let (_dir, env) = setup_test_env();
    let mut txn = env.begin_txn().unwrap();
    let db = Database::open(&txn, None).unwrap();

    // Test putting and getting data
    let key = b"test_key";
    let value = b"test_value";

    db.put(&mut txn, key, value, WriteFlags::empty()).unwrap();
    let result = db.get(&txn, key).unwrap();
    assert_eq!(result.unwrap(), value);

    // Overwrite
    db.put(&mut txn, key, b"other", WriteFlags::empty()).unwrap();
    assert_eq!(txn.get(db, key).unwrap(), b"other");
}

#[test]
fn test_delete_operations() {
    let (_dir, env) = setup_test_env();
    let mut txn = env.begin_txn().unwrap();
    let db = Database::open(&txn, None).unwrap();

    // Insert and then delete data
    let key = b"delete_key";
    let value = b"delete_value";

    db.put(&mut txn, key, value, WriteFlags::empty()).unwrap();
    assert!(db.get(&txn, key).unwrap().is_some());

    db.del(&mut txn, key, None).unwrap();
    assert!(db.get(&txn, key).unwrap().is_none());
    assert!(matches!(db.del(&mut txn, key, None), Err(Error::NotFound)));
}

#[test]
fn test_database_stats() {
    let (_dir, env) = setup_test_env();
    let mut txn = env.begin_txn().unwrap();
    let db = Database::open(&txn, None).unwrap();

    // Get initial stats
    let stats = db.stat(&txn).unwrap();
    assert_eq!(stats.entries, 0);
    assert_eq!(stats.depth, 0);

    // Add some entries and check stats
    for i in 0..5 {
        let key = format!("key_{}", i);
        let value = format!("value_{}", i);
        db.put(&mut txn, key.as_bytes(), value.as_bytes(), WriteFlags::empty())
            .unwrap();
    }

    let stats = db.stat(&txn).unwrap();
    assert_eq!(stats.entries, 5);
    assert_eq!(stats.depth, 1);
    assert_eq!(stats.leaf_pages, 1);
    assert_eq!(stats.psize as usize, env.page_size());
}

#[test]
fn test_error_handling() {
    let (_dir, env) = setup_test_env();
    let mut txn = env.begin_txn().unwrap();
    let db = Database::open(&txn, None).unwrap();

    // Test key not found
    let result = db.get(&txn, b"nonexistent_key").unwrap();
    assert!(result.is_none());
    assert!(matches!(txn.get(db, b"nonexistent_key"), Err(Error::NotFound)));

    // Test duplicate key with NOOVERWRITE flag
    let key = b"unique_key";
    let value1 = b"value1";
    let value2 = b"value2";

    db.put(&mut txn, key, value1, WriteFlags::empty()).unwrap();
    let result = db.put(&mut txn, key, value2, WriteFlags::NOOVERWRITE);
    assert!(matches!(result, Err(Error::KeyExist)));
    assert_eq!(db.get(&txn, key).unwrap().unwrap(), value1);

    // Empty and oversized keys
    let long_key = vec![b'k'; env.max_key_size() + 1];
    assert!(matches!(
        db.put(&mut txn, b"", b"v", WriteFlags::empty()),
        Err(Error::BadValSize)
    ));
    assert!(matches!(
        db.put(&mut txn, &long_key, b"v", WriteFlags::empty()),
        Err(Error::BadValSize)
    ));

    // None of these poisoned the transaction
    txn.commit().unwrap();
}

#[test]
fn test_transaction_isolation() {
    let (_dir, env) = setup_test_env();

    // Write transaction
    let mut write_txn = env.begin_txn().unwrap();
    let db = Database::open(&write_txn, None).unwrap();
    db.put(&mut write_txn, b"key", b"value", WriteFlags::empty())
        .unwrap();

    // Read transaction shouldn't see uncommitted changes
    let read_txn = env.begin_ro_txn().unwrap();
    let result = db.get(&read_txn, b"key").unwrap();
    assert!(result.is_none());

    // After commit, changes should be visible
    write_txn.commit().unwrap();
    assert!(db.get(&read_txn, b"key").unwrap().is_none());
    let read_txn = env.begin_ro_txn().unwrap();
    let result = db.get(&read_txn, b"key").unwrap();
    assert_eq!(result.unwrap(), b"value");
}

#[test]
fn test_abort_discards_changes() {
    let (_dir, env) = setup_test_env();
    let mut txn = env.begin_txn().unwrap();
    let db = Database::open(&txn, None).unwrap();
    db.put(&mut txn, b"kept", b"1", WriteFlags::empty()).unwrap();
    txn.commit().unwrap();

    let mut txn = env.begin_txn().unwrap();
    db.put(&mut txn, b"dropped", b"2", WriteFlags::empty()).unwrap();
    db.del(&mut txn, b"kept", None).unwrap();
    txn.abort();

    let txn = env.begin_ro_txn().unwrap();
    assert_eq!(db.get(&txn, b"kept").unwrap(), Some(&b"1"[..]));
    assert!(db.get(&txn, b"dropped").unwrap().is_none());
}

#[test]
fn test_large_values_use_overflow_pages() {
    let (_dir, env) = setup_test_env();
    let big: Vec<u8> = (0..3 * env.page_size()).map(|i| (i % 251) as u8).collect();

    let mut txn = env.begin_txn().unwrap();
    let db = Database::open(&txn, None).unwrap();
    db.put(&mut txn, b"big", &big, WriteFlags::empty()).unwrap();
    db.put(&mut txn, b"small", b"s", WriteFlags::empty()).unwrap();
    txn.commit().unwrap();

    let txn = env.begin_ro_txn().unwrap();
    assert_eq!(db.get(&txn, b"big").unwrap().unwrap(), &big[..]);
    assert_eq!(db.stat(&txn).unwrap().overflow_pages, 4);

    let mut txn = env.begin_txn().unwrap();
    db.put(&mut txn, b"big", b"now small", WriteFlags::empty()).unwrap();
    assert_eq!(db.stat(&txn).unwrap().overflow_pages, 0);
    assert_eq!(db.get(&txn, b"big").unwrap().unwrap(), b"now small");
}

#[test]
fn test_dupsort_database() {
    let (_dir, env) = setup_test_env();
    let mut txn = env.begin_txn().unwrap();
    let db = Database::create(&mut txn, Some("dups"), DbFlags::DUPSORT).unwrap();
    for v in [&b"cherry"[..], b"apple", b"banana"] {
        db.put(&mut txn, b"fruit", v, WriteFlags::empty()).unwrap();
    }
    db.put(&mut txn, b"veg", b"leek", WriteFlags::empty()).unwrap();

    // The same pair again is accepted unless NODUPDATA asks otherwise
    db.put(&mut txn, b"fruit", b"apple", WriteFlags::empty()).unwrap();
    assert!(matches!(
        db.put(&mut txn, b"fruit", b"apple", WriteFlags::NODUPDATA),
        Err(Error::KeyExist)
    ));
    txn.commit().unwrap();

    let txn = env.begin_ro_txn().unwrap();
    assert_eq!(db.stat(&txn).unwrap().entries, 4);
    assert_eq!(db.get(&txn, b"fruit").unwrap(), Some(&b"apple"[..]));

    let mut cursor = db.cursor(&txn).unwrap();
    let values: Vec<&[u8]> = cursor
        .iter_dup_of(b"fruit")
        .map(|r| r.unwrap().1)
        .collect();
    assert_eq!(values, vec![&b"apple"[..], b"banana", b"cherry"]);
    cursor.set(b"fruit").unwrap();
    assert_eq!(cursor.count().unwrap(), 3);
    drop(cursor);
    drop(txn);

    let mut txn = env.begin_txn().unwrap();
    db.del(&mut txn, b"fruit", Some(b"banana")).unwrap();
    assert!(matches!(
        db.del(&mut txn, b"fruit", Some(b"durian")),
        Err(Error::NotFound)
    ));
    assert_eq!(db.stat(&txn).unwrap().entries, 3);
    db.del(&mut txn, b"fruit", None).unwrap();
    assert!(db.get(&txn, b"fruit").unwrap().is_none());
    assert_eq!(db.stat(&txn).unwrap().entries, 1);
}

#[test]
fn test_append_requires_order() {
    let (_dir, env) = setup_test_env();
    let mut txn = env.begin_txn().unwrap();
    let db = Database::open(&txn, None).unwrap();
    for i in 0..100u32 {
        db.put(&mut txn, &i.to_be_bytes(), b"v", WriteFlags::APPEND).unwrap();
    }
    assert!(matches!(
        db.put(&mut txn, &50u32.to_be_bytes(), b"v", WriteFlags::APPEND),
        Err(Error::KeyExist)
    ));
    assert_eq!(db.stat(&txn).unwrap().entries, 100);
}

#[test]
fn test_cursor_writes() {
    let (_dir, env) = setup_test_env();
    let mut txn = env.begin_txn().unwrap();
    let db = Database::open(&txn, None).unwrap();
    {
        let mut cursor = db.rw_cursor(&mut txn).unwrap();
        for k in [&b"a"[..], b"b", b"c"] {
            cursor.put(k, b"old", WriteFlags::empty()).unwrap();
        }
        cursor.set(b"b").unwrap();
        cursor.put(b"ignored", b"new", WriteFlags::CURRENT).unwrap();
        assert_eq!(cursor.current().unwrap(), Some((&b"b"[..], &b"new"[..])));

        // Deleting moves on to the following item
        cursor.first().unwrap();
        cursor.del(WriteFlags::empty()).unwrap();
        assert_eq!(cursor.next().unwrap(), Some((&b"b"[..], &b"new"[..])));
    }
    txn.commit().unwrap();

    let txn = env.begin_ro_txn().unwrap();
    let items: Vec<(&[u8], &[u8])> = db
        .cursor(&txn)
        .unwrap()
        .iter_start()
        .map(Result::unwrap)
        .collect();
    assert_eq!(items, vec![(&b"b"[..], &b"new"[..]), (&b"c"[..], &b"old"[..])]);
}
