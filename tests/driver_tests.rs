mod common;

use chrono::{TimeZone, Utc};
use common::{KIND, file_ids, ids_forward, ids_reverse, line_count, log_path, open_ledger, open_with, tick, write_n};
use eventledger::{
    DiskDriver, LedgerConfig, LedgerError, LockMode, PersistenceDriver, Record, Strategy,
};
use serde_json::{Value, json};
use std::fs;
use std::io::Write;
use tempfile::tempdir;

#[test]
fn test_records_are_one_json_line_each() {
    let dir = tempdir().unwrap();
    let ledger = open_ledger(dir.path(), Strategy::Disk);
    let ts = Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap();
    ledger.write(json!({"note": "two\nlines"}), ts).unwrap();
    ledger.flush().unwrap();

    let contents = fs::read_to_string(log_path(dir.path())).unwrap();
    assert_eq!(contents.lines().count(), 1);

    let line: Value = serde_json::from_str(contents.lines().next().unwrap()).unwrap();
    assert_eq!(line["kind"], json!(KIND));
    assert_eq!(line["timestamp"], json!("2024-05-01T12:30:00Z"));
    assert_eq!(line["sequence_id"], json!(1));
    assert_eq!(line["payload"]["note"], json!("two\nlines"));
}

#[test]
fn test_every_write_flush_is_visible_immediately() {
    let dir = tempdir().unwrap();
    let ledger = open_ledger(dir.path(), Strategy::Disk);
    let path = log_path(dir.path());

    for i in 1..=5 {
        ledger.write_now(tick(i)).unwrap();
        assert_eq!(line_count(&path), i as usize);
    }
}

#[test]
fn test_batched_flush_waits_for_write_threshold() {
    let dir = tempdir().unwrap();
    let config = LedgerConfig {
        auto_flush: false,
        flush_interval_writes: 5,
        flush_interval_seconds: 3600.0,
        flush_before_read: false,
        ..LedgerConfig::default()
    };
    let ledger = open_with(dir.path(), Strategy::Disk, &config);
    let path = log_path(dir.path());

    write_n(&ledger, 4);
    assert_eq!(line_count(&path), 0);

    ledger.write_now(tick(5)).unwrap();
    assert_eq!(line_count(&path), 5);

    ledger.write_now(tick(6)).unwrap();
    assert_eq!(line_count(&path), 5);
    ledger.flush().unwrap();
    assert_eq!(line_count(&path), 6);
}

#[test]
fn test_flush_before_read_sees_buffered_writes() {
    let dir = tempdir().unwrap();
    let config = LedgerConfig {
        auto_flush: false,
        flush_interval_seconds: 3600.0,
        ..LedgerConfig::default()
    };
    let ledger = open_with(dir.path(), Strategy::Disk, &config);
    write_n(&ledger, 3);
    assert_eq!(ids_forward(&ledger, None), vec![1, 2, 3]);
}

#[test]
fn test_corrupt_lines_are_skipped_both_directions() {
    let dir = tempdir().unwrap();
    {
        let ledger = open_ledger(dir.path(), Strategy::Disk);
        write_n(&ledger, 2);
    }
    {
        let mut file = fs::OpenOptions::new()
            .append(true)
            .open(log_path(dir.path()))
            .unwrap();
        file.write_all(b"not json at all\n").unwrap();
        file.write_all(b"\n   \n").unwrap();
        file.write_all(&[0xff, 0xfe, b'{', b'\n']).unwrap();
        let foreign = Record::new("trade_placed", Utc::now(), json!({}));
        writeln!(file, "{}", serde_json::to_string(&foreign).unwrap()).unwrap();
    }

    let ledger = open_ledger(dir.path(), Strategy::Disk);
    assert_eq!(ledger.write_now(tick(3)).unwrap(), 3);
    assert_eq!(ids_forward(&ledger, None), vec![1, 2, 3]);
    assert_eq!(ids_reverse(&ledger, None), vec![3, 2, 1]);
}

#[test]
fn test_partial_last_line_is_ignored() {
    let dir = tempdir().unwrap();
    {
        let ledger = open_ledger(dir.path(), Strategy::Disk);
        write_n(&ledger, 2);
    }
    {
        let mut file = fs::OpenOptions::new()
            .append(true)
            .open(log_path(dir.path()))
            .unwrap();
        write!(file, r#"{{"kind":"price_update","timestamp":"2024-"#).unwrap();
    }

    let config = LedgerConfig::default();
    let driver: DiskDriver<Value> =
        DiskDriver::open(KIND.into(), log_path(dir.path()), &config).unwrap();
    assert_eq!(driver.last_sequence_id().unwrap(), 2);

    let mut ids = Vec::new();
    driver
        .read_reverse(None, &mut |r| {
            ids.push(r.sequence_id().unwrap());
            true
        })
        .unwrap();
    assert_eq!(ids, vec![2, 1]);
}

#[test]
fn test_reverse_read_spans_many_chunks() {
    let dir = tempdir().unwrap();
    let ledger = open_ledger(dir.path(), Strategy::Disk);
    let padding = "p".repeat(700);
    for i in 0..200 {
        ledger.write_now(json!({"i": i, "padding": padding})).unwrap();
    }
    assert!(fs::metadata(log_path(dir.path())).unwrap().len() > 8 * 1024 * 10);

    let forward = ids_forward(&ledger, None);
    let mut reverse = ids_reverse(&ledger, None);
    reverse.reverse();
    assert_eq!(forward, reverse);
    assert_eq!(forward.len(), 200);
}

#[test]
fn test_restart_after_record_wider_than_recovery_window() {
    for strategy in [Strategy::Disk, Strategy::Memory, Strategy::WriteBehind] {
        let dir = tempdir().unwrap();
        {
            let ledger = open_ledger(dir.path(), strategy);
            ledger.write_now(json!({"n": 1})).unwrap();
            ledger.write_now(json!({"n": 2, "blob": "x".repeat(10_000)})).unwrap();
            ledger.close().unwrap();
        }

        let ledger = open_ledger(dir.path(), strategy);
        assert_eq!(ledger.sequence(), 2, "{strategy:?}");
        assert_eq!(ledger.write_now(json!({"n": 3})).unwrap(), 3, "{strategy:?}");
        ledger.flush().unwrap();
        assert_eq!(file_ids(&log_path(dir.path())), vec![1, 2, 3], "{strategy:?}");
    }
}

#[test]
fn test_recovery_walks_past_a_wide_corrupt_tail() {
    let dir = tempdir().unwrap();
    {
        let ledger = open_ledger(dir.path(), Strategy::Disk);
        write_n(&ledger, 3);
    }
    {
        let mut file = fs::OpenOptions::new()
            .append(true)
            .open(log_path(dir.path()))
            .unwrap();
        writeln!(file, "{}", "#".repeat(20_000)).unwrap();
    }

    let driver: DiskDriver<Value> =
        DiskDriver::open(KIND.into(), log_path(dir.path()), &LedgerConfig::default()).unwrap();
    assert_eq!(driver.last_sequence_id().unwrap(), 3);
}

#[test]
fn test_empty_file_recovers_zero() {
    let dir = tempdir().unwrap();
    let driver: DiskDriver<Value> =
        DiskDriver::open(KIND.into(), log_path(dir.path()), &LedgerConfig::default()).unwrap();
    assert_eq!(driver.last_sequence_id().unwrap(), 0);
    assert_eq!(driver.count().unwrap(), 0);
    assert!(driver.path().exists());
}

#[test]
fn test_second_writer_is_locked_out() {
    let dir = tempdir().unwrap();
    let path = log_path(dir.path());
    let config = LedgerConfig::default();
    let first: DiskDriver<Value> = DiskDriver::open(KIND.into(), &path, &config).unwrap();

    let err = DiskDriver::<Value>::open(KIND.into(), &path, &config).unwrap_err();
    assert!(matches!(err, LedgerError::Locked { .. }));
    assert!(err.to_string().contains("price_update.log"), "{err}");

    first.close().unwrap();
    DiskDriver::<Value>::open(KIND.into(), &path, &config).unwrap();
}

#[test]
fn test_lock_mode_none_allows_second_handle() {
    let dir = tempdir().unwrap();
    let path = log_path(dir.path());
    let config = LedgerConfig {
        lock_mode: LockMode::None,
        ..LedgerConfig::default()
    };
    let _first: DiskDriver<Value> = DiskDriver::open(KIND.into(), &path, &config).unwrap();
    let _second: DiskDriver<Value> = DiskDriver::open(KIND.into(), &path, &config).unwrap();
}

#[test]
fn test_ledger_holds_lock_until_closed() {
    let dir = tempdir().unwrap();
    let ledger = open_ledger(dir.path(), Strategy::Memory);
    let err = eventledger::Ledger::<Value>::open_file(
        KIND,
        log_path(dir.path()),
        eventledger::LedgerOptions::new(Strategy::Memory),
        &LedgerConfig::default(),
    )
    .unwrap_err();
    assert!(matches!(err, LedgerError::Locked { .. }));

    ledger.close().unwrap();
    let reopened = open_ledger(dir.path(), Strategy::Memory);
    assert_eq!(reopened.sequence(), 0);
}
