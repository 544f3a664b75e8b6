use crate::config::LedgerConfig;
use crate::dispatch::{DispatchMode, Dispatcher};
use crate::driver::{DiskDriver, PersistenceDriver};
use crate::error::{LedgerError, Result};
use crate::ledger::{Ledger, LedgerOps, LedgerOptions};
use crate::record::RecordKind;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::any::Any;
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

type OpenFn = Box<dyn FnOnce(&Path, &LedgerConfig, &Arc<Dispatcher>) -> Result<Entry>>;

struct Entry {
    kind: RecordKind,
    ops: Arc<dyn LedgerOps>,
    typed: Arc<dyn Any + Send + Sync>,
}

impl Entry {
    fn new<P>(ledger: Arc<Ledger<P>>) -> Self
    where
        P: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        Entry {
            kind: ledger.kind().clone(),
            ops: Arc::clone(&ledger) as Arc<dyn LedgerOps>,
            typed: ledger,
        }
    }
}

/// One ledger per record kind, all in one directory and sharing one
/// notification dispatcher.
///
/// The set of ledgers is fixed when the registry is opened.
///
/// # Examples
///
/// ```
/// use eventledger::{LedgerOptions, LedgerRegistry, Strategy};
/// use serde_json::{Value, json};
///
/// let dir = tempfile::tempdir().unwrap();
/// let registry = LedgerRegistry::builder(dir.path())
///     .ledger::<Value>("price_update", LedgerOptions::new(Strategy::WriteBehind))
///     .ledger::<Value>("trade_placed", LedgerOptions::new(Strategy::Disk))
///     .open()
///     .unwrap();
///
/// let prices = registry.ledger::<Value>("price_update").unwrap();
/// prices.write_now(json!({"symbol": "ABC", "price": 1.25})).unwrap();
///
/// assert!(registry.ledger::<Value>("unknown").is_none());
/// assert!(dir.path().join("trade_placed.log").exists());
/// registry.close().unwrap();
/// ```
pub struct LedgerRegistry {
    dir: PathBuf,
    config: LedgerConfig,
    dispatcher: Arc<Dispatcher>,
    entries: Vec<Entry>,
}

impl std::fmt::Debug for LedgerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LedgerRegistry")
            .field("dir", &self.dir)
            .field("kinds", &self.entries.iter().map(|e| e.kind.as_str()).collect::<Vec<_>>())
            .field("dispatcher", &self.dispatcher)
            .finish()
    }
}

impl LedgerRegistry {
    /// Start configuring a registry rooted at `dir`.
    pub fn builder(dir: impl AsRef<Path>) -> LedgerRegistryBuilder {
        LedgerRegistryBuilder {
            dir: dir.as_ref().to_path_buf(),
            config: LedgerConfig::default(),
            dispatch: DispatchMode::default(),
            ledgers: Vec::new(),
        }
    }

    /// The typed ledger for `kind`, if one is registered with payload type `P`.
    pub fn ledger<P>(&self, kind: &str) -> Option<Arc<Ledger<P>>>
    where
        P: Send + Sync + 'static,
    {
        let entry = self.entry(kind)?;
        Arc::clone(&entry.typed).downcast::<Ledger<P>>().ok()
    }

    /// The ledger for `kind` regardless of its payload type.
    pub fn ledger_ops(&self, kind: &str) -> Option<Arc<dyn LedgerOps>> {
        self.entry(kind).map(|e| Arc::clone(&e.ops))
    }

    /// Every ledger, in registration order.
    pub fn all_ledgers(&self) -> impl Iterator<Item = &Arc<dyn LedgerOps>> {
        self.entries.iter().map(|e| &e.ops)
    }

    pub fn kinds(&self) -> impl Iterator<Item = &RecordKind> {
        self.entries.iter().map(|e| &e.kind)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Health of every ledger, keyed by kind.
    pub fn health_check(&self) -> BTreeMap<String, Value> {
        self.entries
            .iter()
            .map(|e| {
                let health: serde_json::Map<String, Value> = e.ops.health_check().into_iter().collect();
                (e.kind.to_string(), Value::Object(health))
            })
            .collect()
    }

    /// Close every ledger, then stop the dispatcher.
    ///
    /// All ledgers are closed even if one fails; the first error is returned.
    pub fn close(&self) -> Result<()> {
        let mut first_error = None;
        for entry in &self.entries {
            if let Err(e) = entry.ops.close() {
                log::error!("eventledger: failed to close '{}': {e}", entry.kind);
                first_error.get_or_insert(e);
            }
        }
        self.dispatcher.shutdown();
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn entry(&self, kind: &str) -> Option<&Entry> {
        self.entries.iter().find(|e| e.kind.as_str() == kind)
    }
}

impl Drop for LedgerRegistry {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::error!("eventledger: registry close on drop failed: {e}");
        }
    }
}

/// Builder for a [`LedgerRegistry`]. Created by [`LedgerRegistry::builder`].
pub struct LedgerRegistryBuilder {
    dir: PathBuf,
    config: LedgerConfig,
    dispatch: DispatchMode,
    ledgers: Vec<(RecordKind, OpenFn)>,
}

impl std::fmt::Debug for LedgerRegistryBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LedgerRegistryBuilder")
            .field("dir", &self.dir)
            .field("config", &self.config)
            .field("dispatch", &self.dispatch)
            .field("kinds", &self.ledgers.iter().map(|(k, _)| k.as_str()).collect::<Vec<_>>())
            .finish()
    }
}

impl LedgerRegistryBuilder {
    /// Settings applied to every ledger.
    pub fn config(mut self, config: LedgerConfig) -> Self {
        self.config = config;
        self
    }

    /// How subscriber notifications are scheduled. Defaults to ordered.
    pub fn dispatch(mut self, mode: DispatchMode) -> Self {
        self.dispatch = mode;
        self
    }

    /// Register a ledger for `kind` with payload type `P`.
    pub fn ledger<P>(mut self, kind: impl Into<RecordKind>, options: LedgerOptions<P>) -> Self
    where
        P: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        let kind = kind.into();
        let open_kind = kind.clone();
        let open: OpenFn = Box::new(move |dir, config, dispatcher| {
            let path = dir.join(options.file_name_for(&open_kind));
            let driver: Arc<dyn PersistenceDriver<P>> =
                Arc::new(DiskDriver::open(open_kind.clone(), path, config)?);
            let ledger = Ledger::open(open_kind, driver, options, config, Arc::clone(dispatcher))?;
            Ok(Entry::new(Arc::new(ledger)))
        });
        self.ledgers.push((kind, open));
        self
    }

    /// Create the directory and open every registered ledger.
    ///
    /// Fails on an invalid config, a kind registered twice, or any ledger
    /// that cannot be opened.
    pub fn open(self) -> Result<LedgerRegistry> {
        self.config.validate()?;

        let mut seen = HashSet::new();
        for (kind, _) in &self.ledgers {
            if !seen.insert(kind.clone()) {
                return Err(LedgerError::InvalidConfig(format!(
                    "ledger '{kind}' registered more than once"
                )));
            }
        }

        fs::create_dir_all(&self.dir)?;
        let dispatcher = Arc::new(Dispatcher::new(self.dispatch)?);

        let mut entries = Vec::with_capacity(self.ledgers.len());
        for (_, open) in self.ledgers {
            // Ledgers opened so far are closed when `entries` drops.
            entries.push(open(&self.dir, &self.config, &dispatcher)?);
        }

        log::info!(
            "eventledger: registry at {} opened {} ledgers",
            self.dir.display(),
            entries.len()
        );

        Ok(LedgerRegistry {
            dir: self.dir,
            config: self.config,
            dispatcher,
            entries,
        })
    }
}
