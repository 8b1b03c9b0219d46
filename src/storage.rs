//! ==============================================================================
//! storage.rs - durable energy total
//! ==============================================================================
//!
//! purpose:
//!     keeps the cumulative generated energy across power cycles. the store is
//!     the single source of truth; the orchestrator's running total is a cache
//!     re-read from here on boot.
//!
//! layout:
//!     one namespaced record, `energyData.energy_generated`, inside a small
//!     json document. FileStore replaces the document with write-temp + fsync
//!     + rename, so after a crash the last completed save is what you read.
//!
//! relationships:
//!     - used by: agent.rs (load on start, save every n ticks, clear on command)
//!
//! ==============================================================================

use crate::config::StorageConfig;
use crate::error::{AgentError, Result};

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

type Document = BTreeMap<String, BTreeMap<String, f64>>;

/// namespaced float key/value store with atomic writes
pub trait KeyValueStore {
    fn get_f64(&self, namespace: &str, key: &str) -> Result<Option<f64>>;
    fn put_f64(&mut self, namespace: &str, key: &str, value: f64) -> Result<()>;
    fn clear(&mut self, namespace: &str) -> Result<()>;
}

// ==============================================================================
// file store
// ==============================================================================

pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_document(&self) -> Result<Document> {
        let raw = match fs::read(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Document::new()),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&raw).map_err(|e| {
            AgentError::Storage(format!("{} is unreadable: {}", self.path.display(), e))
        })
    }

    fn write_document(&self, doc: &Document) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let tmp = self.path.with_extension("tmp");
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&serde_json::to_vec_pretty(doc)?)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        // make the rename itself durable
        if let Some(parent) = self.path.parent() {
            if let Ok(dir) = File::open(parent) {
                let _ = dir.sync_all();
            }
        }
        Ok(())
    }

    /// current document, or an empty one if the old file cannot be parsed
    fn document_for_update(&self) -> Result<Document> {
        match self.read_document() {
            Ok(doc) => Ok(doc),
            Err(AgentError::Storage(reason)) => {
                warn!(%reason, "replacing unreadable store");
                Ok(Document::new())
            }
            Err(e) => Err(e),
        }
    }
}

impl KeyValueStore for FileStore {
    fn get_f64(&self, namespace: &str, key: &str) -> Result<Option<f64>> {
        let doc = self.read_document()?;
        Ok(doc.get(namespace).and_then(|ns| ns.get(key)).copied())
    }

    fn put_f64(&mut self, namespace: &str, key: &str, value: f64) -> Result<()> {
        let mut doc = self.document_for_update()?;
        doc.entry(namespace.to_string())
            .or_default()
            .insert(key.to_string(), value);
        self.write_document(&doc)
    }

    fn clear(&mut self, namespace: &str) -> Result<()> {
        let mut doc = self.document_for_update()?;
        doc.remove(namespace);
        self.write_document(&doc)
    }
}

// ==============================================================================
// memory store
// ==============================================================================

/// in-memory store; clones share contents, so dropping one accumulator and
/// building another over a clone behaves like a reboot
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Document>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn doc(&self) -> std::sync::MutexGuard<'_, Document> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl KeyValueStore for MemoryStore {
    fn get_f64(&self, namespace: &str, key: &str) -> Result<Option<f64>> {
        Ok(self.doc().get(namespace).and_then(|ns| ns.get(key)).copied())
    }

    fn put_f64(&mut self, namespace: &str, key: &str, value: f64) -> Result<()> {
        self.doc()
            .entry(namespace.to_string())
            .or_default()
            .insert(key.to_string(), value);
        Ok(())
    }

    fn clear(&mut self, namespace: &str) -> Result<()> {
        self.doc().remove(namespace);
        Ok(())
    }
}

// ==============================================================================
// accumulator
// ==============================================================================

/// what the store holds for the energy record
#[derive(Clone, Debug, PartialEq)]
pub enum StoredEnergy {
    Stored(f64),
    /// never written, or cleared
    Empty,
    Unreadable(String),
}

pub struct EnergyAccumulator<S> {
    store: S,
    namespace: String,
    key: String,
    loaded: bool,
    last_saved: Option<f64>,
}

impl<S: KeyValueStore> EnergyAccumulator<S> {
    pub fn new(store: S, namespace: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            store,
            namespace: namespace.into(),
            key: key.into(),
            loaded: false,
            last_saved: None,
        }
    }

    pub fn from_config(store: S, cfg: &StorageConfig) -> Self {
        Self::new(store, cfg.namespace.clone(), cfg.key.clone())
    }

    pub fn inspect(&self) -> StoredEnergy {
        match self.store.get_f64(&self.namespace, &self.key) {
            Ok(Some(v)) if v.is_finite() && v >= 0.0 => StoredEnergy::Stored(v),
            Ok(Some(v)) => StoredEnergy::Unreadable(format!("invalid stored total {}", v)),
            Ok(None) => StoredEnergy::Empty,
            Err(e) => StoredEnergy::Unreadable(e.to_string()),
        }
    }

    /// stored total, 0.0 when nothing usable is stored
    ///
    /// must be called before the first save.
    pub fn load(&mut self) -> f64 {
        self.loaded = true;
        let total = match self.inspect() {
            StoredEnergy::Stored(v) => v,
            StoredEnergy::Empty => 0.0,
            StoredEnergy::Unreadable(reason) => {
                warn!(%reason, "[Storage] stored energy unreadable, starting from 0");
                0.0
            }
        };
        info!(total_kwh = total, "[Storage] loaded energy");
        total
    }

    pub fn save(&mut self, total: f64) -> Result<()> {
        if !self.loaded {
            return Err(AgentError::Storage("save before load".into()));
        }
        if !total.is_finite() || total < 0.0 {
            return Err(AgentError::Storage(format!("refusing to store total {}", total)));
        }
        self.store.put_f64(&self.namespace, &self.key, total)?;
        self.last_saved = Some(total);
        debug!(total_kwh = total, "[Storage] energy saved");
        Ok(())
    }

    pub fn clear(&mut self) -> Result<()> {
        self.store.clear(&self.namespace)?;
        self.last_saved = None;
        info!("[Storage] cleared stored data");
        Ok(())
    }

    pub fn last_saved(&self) -> Option<f64> {
        self.last_saved
    }
}
