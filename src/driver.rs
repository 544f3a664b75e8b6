use crate::config::{FlushPolicy, LedgerConfig, LockMode};
use crate::error::{LedgerError, Result};
use crate::record::{self, Record, RecordKind};
use crate::reverse::{self, ReverseLines};
use fs2::FileExt;
use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::time::Instant;

/// Bytes read from the end of the log when recovering the last sequence id.
const RECOVERY_WINDOW: u64 = 8 * 1024;

const WRITE_BUFFER: usize = 64 * 1024;

/// Durable storage for one record kind.
///
/// `from` bounds are exclusive: a forward read yields ids greater than
/// `from`, a reverse read yields ids smaller than `from`. `None` reads from
/// the beginning (forward) or from the end (reverse). A callback returning
/// `false` stops the read early.
pub trait PersistenceDriver<P>: Send + Sync {
    /// Append one committed record.
    fn write(&self, record: &Record<P>) -> Result<()>;

    fn read(&self, from: Option<u64>, callback: &mut dyn FnMut(Record<P>) -> bool) -> Result<()>;

    fn read_reverse(
        &self,
        from: Option<u64>,
        callback: &mut dyn FnMut(Record<P>) -> bool,
    ) -> Result<()>;

    /// Push buffered bytes out regardless of the flush policy.
    fn flush(&self) -> Result<()>;

    fn close(&self) -> Result<()>;

    /// Number of non-empty lines in the log.
    fn count(&self) -> Result<u64>;

    /// Highest sequence id found at the tail of the log, or 0.
    fn last_sequence_id(&self) -> Result<u64>;

    /// Suspend (`true`) or resume (`false`) policy-driven flushes.
    fn set_bulk(&self, bulk: bool) -> Result<()>;
}

struct WriterState {
    writer: Option<BufWriter<File>>,
    dirty: bool,
    writes_since_flush: u64,
    last_flush: Instant,
    bulk_depth: usize,
}

/// A [`PersistenceDriver`] over a JSON-lines file.
///
/// One record per line. Writes go through a buffered writer guarded by a
/// single mutex and are pushed to the OS according to the [`FlushPolicy`].
/// Reads open their own handle, so they never contend with the writer beyond
/// an optional flush-before-read.
pub struct DiskDriver<P> {
    kind: RecordKind,
    path: PathBuf,
    policy: FlushPolicy,
    flush_before_read: bool,
    sync_data: bool,
    state: Mutex<WriterState>,
    _payload: PhantomData<fn() -> P>,
}

impl<P> std::fmt::Debug for DiskDriver<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskDriver")
            .field("kind", &self.kind)
            .field("path", &self.path)
            .field("policy", &self.policy)
            .finish()
    }
}

impl<P> DiskDriver<P>
where
    P: Serialize + DeserializeOwned,
{
    /// Open or create the log file at `path` for `kind`.
    ///
    /// Creates parent directories. With [`LockMode::Exclusive`] the file is
    /// locked for the lifetime of the driver; a second driver on the same
    /// file fails with [`LedgerError::Locked`].
    pub fn open(kind: RecordKind, path: impl AsRef<Path>, config: &LedgerConfig) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        if config.lock_mode == LockMode::Exclusive {
            if let Err(e) = file.try_lock_exclusive() {
                if e.kind() == fs2::lock_contended_error().kind() {
                    return Err(LedgerError::Locked { path });
                }
                return Err(e.into());
            }
        }

        log::debug!("eventledger: opened {} for '{}'", path.display(), kind);

        Ok(DiskDriver {
            kind,
            path,
            policy: config.flush_policy(),
            flush_before_read: config.flush_before_read,
            sync_data: config.sync_data,
            state: Mutex::new(WriterState {
                writer: Some(BufWriter::with_capacity(WRITE_BUFFER, file)),
                dirty: false,
                writes_since_flush: 0,
                last_flush: Instant::now(),
                bulk_depth: 0,
            }),
            _payload: PhantomData,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn kind(&self) -> &RecordKind {
        &self.kind
    }

    /// Returns the current size in bytes of the log file.
    pub fn file_size(&self) -> Result<u64> {
        Ok(fs::metadata(&self.path)?.len())
    }

    fn parse(&self, line: &[u8]) -> Option<Record<P>> {
        match serde_json::from_slice::<Record<P>>(line) {
            Ok(record) if record.kind() == &self.kind => Some(record),
            Ok(record) => {
                log::debug!(
                    "eventledger: skipping '{}' record in {}",
                    record.kind(),
                    self.path.display()
                );
                None
            }
            Err(e) => {
                log::debug!("eventledger: skipping unparsable line in {}: {e}", self.path.display());
                None
            }
        }
    }

    fn open_for_read(&self) -> Result<Option<File>> {
        if self.flush_before_read {
            let mut state = self.state.lock();
            if state.dirty {
                self.flush_locked(&mut state)?;
            }
        }
        match File::open(&self.path) {
            Ok(file) => Ok(Some(file)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn flush_locked(&self, state: &mut WriterState) -> io::Result<()> {
        if let Some(writer) = state.writer.as_mut() {
            writer.flush()?;
            if self.sync_data {
                writer.get_ref().sync_data()?;
            }
        }
        state.dirty = false;
        state.writes_since_flush = 0;
        state.last_flush = Instant::now();
        Ok(())
    }
}

impl<P> PersistenceDriver<P> for DiskDriver<P>
where
    P: Serialize + DeserializeOwned,
{
    fn write(&self, record: &Record<P>) -> Result<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let mut state = self.state.lock();
        let Some(writer) = state.writer.as_mut() else {
            return Err(LedgerError::Closed {
                path: self.path.clone(),
            });
        };
        writer.write_all(&line)?;
        state.dirty = true;
        state.writes_since_flush += 1;

        if state.bulk_depth > 0 {
            return Ok(());
        }
        let due = match self.policy {
            FlushPolicy::EveryWrite => true,
            FlushPolicy::Batched { writes, interval } => {
                state.writes_since_flush >= writes || state.last_flush.elapsed() >= interval
            }
        };
        if due {
            self.flush_locked(&mut state)?;
        }
        Ok(())
    }

    fn read(&self, from: Option<u64>, callback: &mut dyn FnMut(Record<P>) -> bool) -> Result<()> {
        let Some(file) = self.open_for_read()? else {
            return Ok(());
        };
        let mut reader = BufReader::new(file);
        let mut line = Vec::new();
        loop {
            line.clear();
            if reader.read_until(b'\n', &mut line)? == 0 {
                return Ok(());
            }
            let trimmed = line.trim_ascii_end();
            if trimmed.is_empty() {
                continue;
            }
            let Some(record) = self.parse(trimmed) else {
                continue;
            };
            if !record::after(from, record.sequence_id()) {
                continue;
            }
            if !callback(record) {
                return Ok(());
            }
        }
    }

    fn read_reverse(
        &self,
        from: Option<u64>,
        callback: &mut dyn FnMut(Record<P>) -> bool,
    ) -> Result<()> {
        let Some(file) = self.open_for_read()? else {
            return Ok(());
        };
        for line in ReverseLines::new(file)? {
            let line = line?;
            let trimmed = line.trim_ascii_end();
            if trimmed.is_empty() {
                continue;
            }
            let Some(record) = self.parse(trimmed) else {
                continue;
            };
            if !record::before(from, record.sequence_id()) {
                continue;
            }
            if !callback(record) {
                break;
            }
        }
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.dirty {
            self.flush_locked(&mut state)?;
        }
        Ok(())
    }

    fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.writer.is_none() {
            return Ok(());
        }
        let flushed = if state.dirty {
            self.flush_locked(&mut state)
        } else {
            Ok(())
        };
        // Dropping the handle releases the advisory lock.
        state.writer = None;
        log::debug!("eventledger: closed {}", self.path.display());
        Ok(flushed?)
    }

    fn count(&self) -> Result<u64> {
        let Some(file) = self.open_for_read()? else {
            return Ok(0);
        };
        let mut reader = BufReader::new(file);
        let mut line = Vec::new();
        let mut count = 0;
        loop {
            line.clear();
            if reader.read_until(b'\n', &mut line)? == 0 {
                return Ok(count);
            }
            if !line.trim_ascii().is_empty() {
                count += 1;
            }
        }
    }

    fn last_sequence_id(&self) -> Result<u64> {
        // Recovery sees only what reached the file.
        self.flush()?;
        let mut file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let lines = reverse::tail_lines(&mut file, RECOVERY_WINDOW)?;
        // Unlocked files can be shared by several writers, so lines need not
        // be in id order: take the highest id in the window.
        let last = lines
            .iter()
            .filter_map(|line| self.parse(line))
            .filter_map(|record| record.sequence_id())
            .max();
        if let Some(id) = last {
            return Ok(id);
        }

        // The newest record is wider than the window, or the tail is corrupt:
        // keep walking backward until some line carries an id.
        let mut scanned = false;
        for line in ReverseLines::new(file)? {
            scanned = true;
            if let Some(id) = self.parse(&line?).and_then(|record| record.sequence_id()) {
                return Ok(id);
            }
        }
        if scanned {
            log::warn!(
                "eventledger: no sequence id anywhere in {}, restarting at 0",
                self.path.display()
            );
        }
        Ok(0)
    }

    fn set_bulk(&self, bulk: bool) -> Result<()> {
        let mut state = self.state.lock();
        if bulk {
            state.bulk_depth += 1;
            return Ok(());
        }
        state.bulk_depth = state.bulk_depth.saturating_sub(1);
        if state.bulk_depth == 0 && state.dirty {
            self.flush_locked(&mut state)?;
        }
        Ok(())
    }
}

impl<P> Drop for DiskDriver<P> {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if let Some(writer) = state.writer.as_mut() {
            if let Err(e) = writer.flush() {
                log::error!("eventledger: flush on drop failed for {}: {e}", self.path.display());
            }
        }
    }
}
