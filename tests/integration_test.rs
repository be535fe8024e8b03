//! End-to-end tests against a real temp-file database: these exercise the
//! pager, journal, and btree layers together the way a caller actually
//! would, rather than each module in isolation.

use sqlitecore::pager::{Pager, Storage};
use sqlitecore::record::Value;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn varint_boundary_values_round_trip() {
    use sqlitecore::varint;
    for (value, expect_len) in [
        (0i64, 1usize),
        (127, 1),
        (128, 2),
        (16383, 2),
        (16384, 3),
        (-1, 9),
        (i64::MAX, 9),
        (i64::MIN, 9),
    ] {
        let mut buf = [0u8; varint::MAX_LEN];
        let written = varint::write(&mut buf, value).unwrap();
        assert_eq!(written, expect_len);
        let (decoded, consumed) = varint::read(&buf).unwrap();
        assert_eq!(decoded, value);
        assert_eq!(consumed, written);
    }
}

#[test]
fn record_round_trips_mixed_column_types() {
    let row = vec![
        Value::Null,
        Value::Integer(42),
        Value::Real(2.5),
        Value::Text(b"a row".to_vec()),
        Value::Blob(vec![1, 2, 3]),
    ];
    let encoded = sqlitecore::record::encode(&row);
    let decoded = sqlitecore::record::decode(&encoded).unwrap();
    assert_eq!(decoded, row);
}

#[test]
fn insert_enough_rows_to_force_a_split_and_keeps_root_stable() {
    init_logging();
    let mut pager = Pager::create(Storage::Memory(Vec::new()), 512).unwrap();
    for i in 0..300i64 {
        sqlitecore::btree::table_mutator::insert(&mut pager, 1, i, format!("row-{i}").as_bytes(), |p| Ok(p.extend()))
            .unwrap();
    }

    let mut cursor = sqlitecore::btree::table::Cursor::new(&mut pager, 1);
    assert!(cursor.move_first().unwrap());
    assert_eq!(cursor.current_rowid(), Some(0));
    assert!(cursor.move_last().unwrap());
    assert_eq!(cursor.current_rowid(), Some(299));

    let mut cursor = sqlitecore::btree::table::Cursor::new(&mut pager, 1);
    assert!(cursor.seek(150).unwrap());
    assert_eq!(cursor.current_payload().unwrap().unwrap(), b"row-150");
}

#[test]
fn overflow_payload_round_trips_at_the_inline_boundary() {
    init_logging();
    let mut pager = Pager::create(Storage::Memory(Vec::new()), 512).unwrap();
    // Comfortably past the ~470-byte inline threshold for a 512-byte table leaf page.
    let payload: Vec<u8> = (0u32..3000).map(|i| (i % 251) as u8).collect();
    sqlitecore::btree::table_mutator::insert(&mut pager, 1, 1, &payload, |p| Ok(p.extend())).unwrap();

    let mut cursor = sqlitecore::btree::table::Cursor::new(&mut pager, 1);
    assert!(cursor.seek(1).unwrap());
    assert_eq!(cursor.current_payload().unwrap().unwrap(), payload);
}

#[test]
fn crash_recovery_restores_the_pre_commit_state() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("crash.db");

    {
        let mut pager = sqlitecore::create(db_path.to_str().unwrap(), 4096).unwrap();
        sqlitecore::btree::table_mutator::insert(&mut pager, 1, 1, b"committed", |p| Ok(p.extend())).unwrap();
        let mut txn = sqlitecore::transaction::Transaction::begin(&mut pager, db_path.to_str().unwrap());
        txn.write_page(1, &pager_page_copy(&mut pager, 1)).unwrap();
        txn.commit().unwrap();
    }

    // Simulate a transaction that journaled its pre-image, wrote the
    // post-image to the database, but crashed before deleting the journal
    // (the torn window between the two fsyncs the journal exists to cover).
    {
        let mut pager = Pager::open(db_path.to_str().unwrap()).unwrap();
        let pre_image = pager.get_page_owned(1).unwrap();
        let journal_path = sqlitecore::journal::Journal::path_for_database(db_path.to_str().unwrap());
        let mut journal = sqlitecore::journal::Journal::new(journal_path, pager.page_size());
        journal.record_pre_image(1, &pre_image).unwrap();
        journal.sync().unwrap();

        let mut mutated = pre_image.clone();
        mutated[50] = 0xFF;
        pager.write_page(1, &mutated).unwrap();
        pager.flush().unwrap();
        // No journal.delete(): this is the crash.
    }

    let recovered = sqlitecore::journal::Journal::recover(db_path.to_str().unwrap(), 4096).unwrap();
    assert!(recovered);
    let mut pager = Pager::open(db_path.to_str().unwrap()).unwrap();
    let page = pager.get_page_owned(1).unwrap();
    assert_ne!(page[50], 0xFF);
}

#[test]
fn index_ordering_handles_mixed_types_with_rowid_tiebreak() {
    init_logging();
    let mut pager = Pager::create(Storage::Memory(Vec::new()), 4096).unwrap();
    let rows: Vec<(i64, Value)> = vec![
        (1, Value::Null),
        (2, Value::Integer(5)),
        (3, Value::Real(5.5)),
        (4, Value::Text(b"abc".to_vec())),
        (5, Value::Blob(vec![0, 1])),
        (6, Value::Integer(5)), // same value as rowid 2, tiebreak by rowid
    ];
    for (rowid, v) in &rows {
        let key = vec![v.clone(), Value::Integer(*rowid)];
        sqlitecore::btree::index::insert(&mut pager, 1, &key, |p| Ok(p.extend())).unwrap();
    }

    let mut cursor = sqlitecore::btree::index::Cursor::new(&mut pager, 1);
    assert!(cursor.move_first().unwrap());
    let mut seen = vec![];
    loop {
        seen.push(cursor.current_key().unwrap());
        if !cursor.move_next().unwrap() {
            break;
        }
    }
    assert_eq!(seen.len(), rows.len());
    for w in seen.windows(2) {
        assert_ne!(sqlitecore::btree::index::compare_index_keys(&w[0], &w[1]), std::cmp::Ordering::Greater);
    }
    // The two rows with value Integer(5) must appear in rowid order.
    let fives: Vec<i64> = seen
        .iter()
        .filter_map(|k| match (&k[0], &k[1]) {
            (Value::Integer(5), Value::Integer(rowid)) => Some(*rowid),
            _ => None,
        })
        .collect();
    assert_eq!(fives, vec![2, 6]);
}

fn pager_page_copy(pager: &mut Pager, pn: sqlitecore::pager::PageNum) -> Vec<u8> {
    pager.get_page_owned(pn).unwrap()
}
