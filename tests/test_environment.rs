use std::fs::OpenOptions;
use std::os::unix::fs::FileExt;
use std::path::Path;

use lumodb::{CopyFlags, Database, DbFlags, EnvFlags, Environment, Error, Transaction, WriteFlags};
use tempfile::TempDir;

fn open_env(path: &Path) -> Environment {
    Environment::new()
        .set_page_size(4096)
        .set_max_dbs(4)
        .set_map_size(16 << 20)
        .open(path)
        .unwrap()
}

/// User entries of the main db; the named db records hold page numbers
/// that differ between copies.
fn contents<T: Transaction>(txn: &T, db: Database) -> Vec<(Vec<u8>, Vec<u8>)> {
    db.cursor(txn)
        .unwrap()
        .iter_start()
        .map(|r| {
            let (k, v) = r.unwrap();
            (k.to_vec(), v.to_vec())
        })
        .filter(|(k, _)| k.starts_with(b"key"))
        .collect()
}

/// Main db with 300 keys (every third removed again), a DUPSORT db and a
/// plain named db holding a large value.
fn fill(env: &Environment) {
    let mut txn = env.begin_txn().unwrap();
    let main = Database::open(&txn, None).unwrap();
    let dups = Database::create(&mut txn, Some("dups"), DbFlags::DUPSORT).unwrap();
    let blobs = Database::create(&mut txn, Some("blobs"), DbFlags::empty()).unwrap();
    for i in 0..300u32 {
        main.put(&mut txn, format!("key{:05}", i).as_bytes(), &[i as u8; 50], WriteFlags::empty())
            .unwrap();
    }
    for i in 0..40u32 {
        dups.put(&mut txn, b"many", &i.to_be_bytes(), WriteFlags::empty()).unwrap();
    }
    dups.put(&mut txn, b"one", b"single", WriteFlags::empty()).unwrap();
    blobs.put(&mut txn, b"blob", &vec![9u8; 20_000], WriteFlags::empty()).unwrap();
    txn.commit().unwrap();

    let mut txn = env.begin_txn().unwrap();
    for i in (0..300u32).step_by(3) {
        main.del(&mut txn, format!("key{:05}", i).as_bytes(), None).unwrap();
    }
    txn.commit().unwrap();
}

fn check_filled(env: &Environment) {
    let txn = env.begin_ro_txn().unwrap();
    let main = Database::open(&txn, None).unwrap();
    let dups = Database::open(&txn, Some("dups")).unwrap();
    let blobs = Database::open(&txn, Some("blobs")).unwrap();

    // Named database records live in the main db next to the user keys
    assert_eq!(main.stat(&txn).unwrap().entries, 200 + 2);
    assert_eq!(main.get(&txn, b"key00001").unwrap(), Some(&[1u8; 50][..]));
    assert!(main.get(&txn, b"key00003").unwrap().is_none());

    assert_eq!(dups.flags(&txn).unwrap(), DbFlags::DUPSORT);
    let mut cursor = dups.cursor(&txn).unwrap();
    let many: Vec<Vec<u8>> = cursor
        .iter_dup_of(b"many")
        .map(|r| r.unwrap().1.to_vec())
        .collect();
    let expected: Vec<Vec<u8>> = (0..40u32).map(|i| i.to_be_bytes().to_vec()).collect();
    assert_eq!(many, expected);
    assert_eq!(dups.get(&txn, b"one").unwrap(), Some(&b"single"[..]));

    assert_eq!(blobs.get(&txn, b"blob").unwrap().unwrap(), &vec![9u8; 20_000][..]);
}

#[test]
fn test_data_survives_reopen() {
    let dir = TempDir::new().unwrap();
    {
        let env = open_env(dir.path());
        fill(&env);
        env.close();
    }
    let env = open_env(dir.path());
    check_filled(&env);
    assert_eq!(env.info().unwrap().last_txnid, 2);
    assert_eq!(env.page_size(), 4096);
}

#[test]
fn test_torn_meta_falls_back_to_previous_commit() {
    let dir = TempDir::new().unwrap();
    {
        let env = open_env(dir.path());
        let mut txn = env.begin_txn().unwrap();
        let db = Database::open(&txn, None).unwrap();
        db.put(&mut txn, b"k", b"first", WriteFlags::empty()).unwrap();
        txn.commit().unwrap();
        let mut txn = env.begin_txn().unwrap();
        db.put(&mut txn, b"k", b"second", WriteFlags::empty()).unwrap();
        txn.commit().unwrap();
    }

    // Txn 2 went to meta page 0; damage it as an interrupted write would
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(dir.path().join("data.mdb"))
        .unwrap();
    let mut byte = [0u8; 1];
    file.read_exact_at(&mut byte, 100).unwrap();
    byte[0] ^= 0xff;
    file.write_all_at(&byte, 100).unwrap();
    drop(file);

    let env = open_env(dir.path());
    assert_eq!(env.info().unwrap().last_txnid, 1);
    let txn = env.begin_ro_txn().unwrap();
    let db = Database::open(&txn, None).unwrap();
    assert_eq!(db.get(&txn, b"k").unwrap(), Some(&b"first"[..]));
    drop(txn);

    // The next commit reuses the damaged slot
    let mut txn = env.begin_txn().unwrap();
    db.put(&mut txn, b"k", b"third", WriteFlags::empty()).unwrap();
    txn.commit().unwrap();
    drop(env);

    let env = open_env(dir.path());
    assert_eq!(env.info().unwrap().last_txnid, 2);
    let txn = env.begin_ro_txn().unwrap();
    assert_eq!(db.get(&txn, b"k").unwrap(), Some(&b"third"[..]));
}

#[test]
fn test_bad_magic_in_newest_meta_falls_back() {
    let dir = TempDir::new().unwrap();
    {
        let env = open_env(dir.path());
        let mut txn = env.begin_txn().unwrap();
        let db = Database::open(&txn, None).unwrap();
        db.put(&mut txn, b"k", b"first", WriteFlags::empty()).unwrap();
        txn.commit().unwrap();
        let mut txn = env.begin_txn().unwrap();
        db.put(&mut txn, b"k", b"second", WriteFlags::empty()).unwrap();
        txn.commit().unwrap();
    }

    // Wipe the magic of meta page 0, which holds txn 2
    let path = dir.path().join("data.mdb");
    let file = OpenOptions::new().read(true).write(true).open(&path).unwrap();
    file.write_all_at(&[0u8; 4], 24).unwrap();
    drop(file);

    let env = open_env(dir.path());
    assert_eq!(env.info().unwrap().last_txnid, 1);
    let txn = env.begin_ro_txn().unwrap();
    let db = Database::open(&txn, None).unwrap();
    assert_eq!(db.get(&txn, b"k").unwrap(), Some(&b"first"[..]));
    drop(txn);
    drop(env);

    // With both magics gone the file is no longer recognized
    let file = OpenOptions::new().read(true).write(true).open(&path).unwrap();
    file.write_all_at(&[0u8; 4], 4096 + 24).unwrap();
    drop(file);
    assert!(matches!(Environment::new().open(dir.path()), Err(Error::Invalid(_))));
}

#[test]
fn test_foreign_file_is_rejected() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("data.mdb"), vec![0x5au8; 8192]).unwrap();
    let result = Environment::new().open(dir.path());
    assert!(matches!(result, Err(Error::Invalid(_))));
}

#[test]
fn test_copy_and_compact_copy() {
    let dir = TempDir::new().unwrap();
    let env = open_env(dir.path());
    fill(&env);

    let raw = TempDir::new().unwrap();
    env.copy(raw.path(), CopyFlags::empty()).unwrap();
    let compact = TempDir::new().unwrap();
    env.copy(compact.path(), CopyFlags::COMPACT).unwrap();

    // The destination file must not exist yet
    assert!(matches!(env.copy(raw.path(), CopyFlags::empty()), Err(Error::Io(_))));

    let raw_len = std::fs::metadata(raw.path().join("data.mdb")).unwrap().len();
    let compact_len = std::fs::metadata(compact.path().join("data.mdb")).unwrap().len();
    assert!(compact_len < raw_len, "{} >= {}", compact_len, raw_len);
    assert!(!raw.path().join("lock.mdb").exists());

    let source = {
        let txn = env.begin_ro_txn().unwrap();
        contents(&txn, Database::open(&txn, None).unwrap())
    };
    for path in [raw.path(), compact.path()] {
        let copy = open_env(path);
        check_filled(&copy);
        let txn = copy.begin_ro_txn().unwrap();
        assert_eq!(contents(&txn, Database::open(&txn, None).unwrap()), source);
        assert_eq!(copy.info().unwrap().last_txnid, 2);
    }

    // A compacted copy keeps working as a normal environment
    let copy = open_env(compact.path());
    let mut txn = copy.begin_txn().unwrap();
    let dups = Database::open(&txn, Some("dups")).unwrap();
    dups.put(&mut txn, b"many", &1000u32.to_be_bytes(), WriteFlags::empty()).unwrap();
    dups.drop(&mut txn, true).unwrap();
    txn.commit().unwrap();
    let txn = copy.begin_ro_txn().unwrap();
    assert!(matches!(Database::open(&txn, Some("dups")), Err(Error::NotFound)));
}

#[test]
fn test_reader_table_limits() {
    let dir = TempDir::new().unwrap();
    let env = Environment::new()
        .set_max_readers(2)
        .open(dir.path())
        .unwrap();
    assert_eq!(env.max_readers(), 2);
    let first = env.begin_ro_txn().unwrap();
    let second = env.begin_ro_txn().unwrap();
    assert!(matches!(env.begin_ro_txn(), Err(Error::ReadersFull)));
    assert_eq!(env.reader_list().unwrap().len(), 2);
    assert_eq!(env.reader_check().unwrap(), 0);

    drop(first);
    let third = env.begin_ro_txn().unwrap();
    assert_eq!(third.id(), second.id());
    assert_eq!(env.info().unwrap().num_readers, 2);
}

#[test]
fn test_smaller_map_is_refused_until_remapped() {
    let dir = TempDir::new().unwrap();
    let mut small = Environment::new()
        .set_page_size(4096)
        .set_map_size(1 << 20)
        .open(dir.path())
        .unwrap();
    let big = Environment::new()
        .set_map_size(64 << 20)
        .open(dir.path())
        .unwrap();

    let mut txn = big.begin_txn().unwrap();
    let db = Database::open(&txn, None).unwrap();
    for i in 0..4000u32 {
        db.put(&mut txn, &i.to_be_bytes(), &[5u8; 600], WriteFlags::empty())
            .unwrap();
    }
    txn.commit().unwrap();
    assert!(big.info().unwrap().last_pgno * 4096 > 1 << 20);

    assert!(matches!(small.begin_ro_txn(), Err(Error::MapResized)));
    assert!(matches!(small.begin_txn(), Err(Error::MapResized)));
    assert!(small.reader_list().unwrap().is_empty());

    small.set_map_size(0).unwrap();
    assert_eq!(small.info().unwrap().mapsize, 64 << 20);
    let txn = small.begin_ro_txn().unwrap();
    assert_eq!(db.get(&txn, &3999u32.to_be_bytes()).unwrap(), Some(&[5u8; 600][..]));
    assert_eq!(db.stat(&txn).unwrap().entries, 4000);
}

#[test]
fn test_second_handle_shares_readers() {
    let dir = TempDir::new().unwrap();
    let env = open_env(dir.path());
    let other = open_env(dir.path());

    let mut txn = env.begin_txn().unwrap();
    let db = Database::open(&txn, None).unwrap();
    db.put(&mut txn, b"k", b"v", WriteFlags::empty()).unwrap();
    txn.commit().unwrap();

    let reader = other.begin_ro_txn().unwrap();
    assert_eq!(db.get(&reader, b"k").unwrap(), Some(&b"v"[..]));
    assert_eq!(env.reader_list().unwrap().len(), 1);

    // The writer lock is shared too
    let _writer = other.begin_txn().unwrap();
    assert!(matches!(env.try_begin_txn(), Err(Error::WouldBlock)));
}

#[test]
fn test_read_only_environment() {
    let dir = TempDir::new().unwrap();
    {
        let env = open_env(dir.path());
        fill(&env);
    }
    let env = Environment::new()
        .set_flags(EnvFlags::RDONLY)
        .set_max_dbs(4)
        .open(dir.path())
        .unwrap();
    assert!(matches!(env.begin_txn(), Err(Error::EnvReadOnly)));
    assert!(matches!(env.sync(true), Err(Error::EnvReadOnly)));
    check_filled(&env);
}

#[test]
fn test_read_only_open_needs_existing_files() {
    let dir = TempDir::new().unwrap();
    let result = Environment::new()
        .set_flags(EnvFlags::RDONLY)
        .open(dir.path());
    assert!(matches!(result, Err(Error::Io(_))));
}

#[test]
fn test_write_map_and_checksums() {
    let dir = TempDir::new().unwrap();
    {
        let env = Environment::new()
            .set_flags(EnvFlags::WRITEMAP | EnvFlags::CHECKSUM)
            .set_page_size(4096)
            .set_max_dbs(4)
            .open(dir.path())
            .unwrap();
        fill(&env);
        check_filled(&env);
        env.sync(true).unwrap();
    }
    // Checksums stay on for the file even when not asked for again
    let env = open_env(dir.path());
    assert!(env.get_flags().contains(EnvFlags::CHECKSUM));
    check_filled(&env);
}

#[test]
fn test_durability_flags_toggle() {
    let dir = TempDir::new().unwrap();
    let env = open_env(dir.path());
    env.set_flags(EnvFlags::NOSYNC, true).unwrap();
    let mut txn = env.begin_txn().unwrap();
    let db = Database::open(&txn, None).unwrap();
    db.put(&mut txn, b"k", b"v", WriteFlags::empty()).unwrap();
    txn.commit().unwrap();
    env.sync(true).unwrap();
    env.set_flags(EnvFlags::NOSYNC, false).unwrap();
    assert!(!env.get_flags().contains(EnvFlags::NOSYNC));
    assert!(matches!(
        env.set_flags(EnvFlags::WRITEMAP, true),
        Err(Error::EnvFlagsImmutable)
    ));
}

#[test]
fn test_version() {
    let (major, minor, patch) = Environment::version();
    assert_eq!(
        Environment::version_string(),
        format!("lumodb {}.{}.{}", major, minor, patch)
    );
}
