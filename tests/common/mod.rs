#![allow(dead_code)]

use chrono::Utc;
use eventledger::{
    DispatchMode, Dispatcher, Ledger, LedgerConfig, LedgerOptions, PersistenceDriver, Record,
    Result, Strategy,
};
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

pub const KIND: &str = "price_update";

pub const STRATEGIES: [Strategy; 3] = [Strategy::Disk, Strategy::Memory, Strategy::WriteBehind];

pub fn log_path(dir: &Path) -> PathBuf {
    dir.join(format!("{KIND}.log"))
}

pub fn open_ledger(dir: &Path, strategy: Strategy) -> Ledger<Value> {
    open_with(dir, strategy, &LedgerConfig::default())
}

pub fn open_with(dir: &Path, strategy: Strategy, config: &LedgerConfig) -> Ledger<Value> {
    Ledger::open_file(KIND, log_path(dir), LedgerOptions::new(strategy), config).unwrap()
}

pub fn tick(i: u64) -> Value {
    json!({"symbol": "ABC", "price": 100.0 + i as f64 / 4.0, "volume": i})
}

pub fn write_n(ledger: &Ledger<Value>, n: u64) -> Vec<u64> {
    (0..n).map(|i| ledger.write_now(tick(i)).unwrap()).collect()
}

pub fn ids_forward(ledger: &Ledger<Value>, from: Option<u64>) -> Vec<u64> {
    let mut ids = Vec::new();
    ledger
        .read(from, None, |r| {
            ids.push(r.sequence_id().unwrap());
            true
        })
        .unwrap();
    ids
}

pub fn ids_reverse(ledger: &Ledger<Value>, from: Option<u64>) -> Vec<u64> {
    let mut ids = Vec::new();
    ledger
        .read_reverse(from, None, |r| {
            ids.push(r.sequence_id().unwrap());
            true
        })
        .unwrap();
    ids
}

/// Non-empty lines currently in the file, as seen by an outside reader.
pub fn line_count(path: &Path) -> usize {
    match fs::read(path) {
        Ok(bytes) => bytes
            .split(|b| *b == b'\n')
            .filter(|line| !line.trim_ascii().is_empty())
            .count(),
        Err(_) => 0,
    }
}

/// Sequence ids in the order their lines appear in the file.
pub fn file_ids(path: &Path) -> Vec<u64> {
    fs::read_to_string(path)
        .unwrap_or_default()
        .lines()
        .filter_map(|line| serde_json::from_str::<Value>(line).ok())
        .filter_map(|record| record["sequence_id"].as_u64())
        .collect()
}

pub fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    done()
}

/// An in-process driver that remembers which ids it was asked to write.
#[derive(Clone, Default)]
pub struct RecordingDriver {
    pub written: Arc<Mutex<Vec<u64>>>,
    pub delay: Duration,
}

impl RecordingDriver {
    pub fn slow(delay: Duration) -> Self {
        RecordingDriver {
            written: Arc::default(),
            delay,
        }
    }

    pub fn written(&self) -> Vec<u64> {
        self.written.lock().clone()
    }
}

impl PersistenceDriver<Value> for RecordingDriver {
    fn write(&self, record: &Record<Value>) -> Result<()> {
        thread::sleep(self.delay);
        self.written.lock().push(record.sequence_id().unwrap_or(0));
        Ok(())
    }

    fn read(&self, _from: Option<u64>, _callback: &mut dyn FnMut(Record<Value>) -> bool) -> Result<()> {
        Ok(())
    }

    fn read_reverse(
        &self,
        _from: Option<u64>,
        _callback: &mut dyn FnMut(Record<Value>) -> bool,
    ) -> Result<()> {
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }

    fn count(&self) -> Result<u64> {
        Ok(self.written.lock().len() as u64)
    }

    fn last_sequence_id(&self) -> Result<u64> {
        Ok(self.written.lock().iter().copied().max().unwrap_or(0))
    }

    fn set_bulk(&self, _bulk: bool) -> Result<()> {
        Ok(())
    }
}

pub fn open_on(driver: &RecordingDriver, strategy: Strategy, config: &LedgerConfig) -> Ledger<Value> {
    let dispatcher = Arc::new(Dispatcher::new(DispatchMode::Ordered).unwrap());
    Ledger::open(
        KIND,
        Arc::new(driver.clone()),
        LedgerOptions::new(strategy),
        config,
        dispatcher,
    )
    .unwrap()
}

pub fn now_record(payload: Value) -> Record<Value> {
    Record::new(KIND, Utc::now(), payload)
}
