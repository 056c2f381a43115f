//! veilpay-state
//!
//! On-disk state for the gateway: versioned JSON documents mapping
//! identifiers to records. Writes are debounced (~500 ms) and replaced
//! atomically (write-to-temp, rename). Sensitive fields reach this layer
//! only as sealed ciphertext blobs.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use veilpay_core::constants::{PERSIST_DEBOUNCE_MS, SCHEMA_VERSION};
use veilpay_core::types::now_ms;
use veilpay_core::GatewayError;

/// Serialized document shape: one schema-version tag, one record map.
#[derive(Serialize, Deserialize)]
struct Document<T> {
    schema_version: u32,
    updated_at_ms: i64,
    records: HashMap<String, T>,
}

/// A persisted mapping from identifier to record.
///
/// All reads and writes go through the in-memory map; mutations signal a
/// background flusher that debounces and atomically replaces the file.
/// `flush_now` is for shutdown paths.
#[derive(Debug)]
pub struct DocumentStore<T> {
    path: PathBuf,
    records: RwLock<HashMap<String, T>>,
    dirty_tx: mpsc::Sender<()>,
}

impl<T> DocumentStore<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    /// Load the document at `path`, or start empty if it does not exist.
    /// Must run inside a tokio runtime; spawns the debounced flusher.
    pub fn load(path: impl AsRef<Path>) -> Result<Arc<Self>, GatewayError> {
        let path = path.as_ref().to_path_buf();
        let records = if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .map_err(|e| GatewayError::Storage(format!("{}: {e}", path.display())))?;
            let doc: Document<T> = serde_json::from_str(&raw)
                .map_err(|e| GatewayError::Storage(format!("{}: {e}", path.display())))?;
            if doc.schema_version != SCHEMA_VERSION {
                return Err(GatewayError::Storage(format!(
                    "{}: schema version {} (expected {})",
                    path.display(),
                    doc.schema_version,
                    SCHEMA_VERSION
                )));
            }
            doc.records
        } else {
            HashMap::new()
        };
        debug!(path = %path.display(), count = records.len(), "document loaded");

        let (dirty_tx, mut dirty_rx) = mpsc::channel(1);
        let store = Arc::new(Self {
            path,
            records: RwLock::new(records),
            dirty_tx,
        });

        let weak = Arc::downgrade(&store);
        tokio::spawn(async move {
            while dirty_rx.recv().await.is_some() {
                tokio::time::sleep(Duration::from_millis(PERSIST_DEBOUNCE_MS)).await;
                // Marks that landed during the sleep are covered by this
                // flush; drain them so they don't trigger another.
                while dirty_rx.try_recv().is_ok() {}
                let Some(store) = weak.upgrade() else { break };
                if let Err(e) = store.flush_now() {
                    warn!(path = %store.path.display(), "debounced flush failed: {e}");
                }
            }
        });

        Ok(store)
    }

    pub fn get(&self, id: &str) -> Option<T> {
        self.records.read().expect("store lock poisoned").get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.records.read().expect("store lock poisoned").contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.records.read().expect("store lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of every record.
    pub fn all(&self) -> Vec<(String, T)> {
        self.records
            .read()
            .expect("store lock poisoned")
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn insert(&self, id: String, record: T) {
        self.records
            .write()
            .expect("store lock poisoned")
            .insert(id, record);
        self.mark_dirty();
    }

    pub fn remove(&self, id: &str) -> Option<T> {
        let removed = self.records.write().expect("store lock poisoned").remove(id);
        if removed.is_some() {
            self.mark_dirty();
        }
        removed
    }

    /// Run `f` against the record map under the write lock, then schedule a
    /// flush. Returns whatever `f` returns.
    pub fn modify<R>(&self, f: impl FnOnce(&mut HashMap<String, T>) -> R) -> R {
        let out = f(&mut self.records.write().expect("store lock poisoned"));
        self.mark_dirty();
        out
    }

    /// Signal the debounced flusher. Coalesces with any pending signal.
    pub fn mark_dirty(&self) {
        let _ = self.dirty_tx.try_send(());
    }

    /// Serialize and atomically replace the document on disk.
    pub fn flush_now(&self) -> Result<(), GatewayError> {
        let doc = {
            let records = self.records.read().expect("store lock poisoned");
            Document {
                schema_version: SCHEMA_VERSION,
                updated_at_ms: now_ms(),
                records: records.clone(),
            }
        };
        let raw = serde_json::to_string_pretty(&doc)
            .map_err(|e| GatewayError::Serialization(e.to_string()))?;

        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir)
                .map_err(|e| GatewayError::Storage(format!("{}: {e}", dir.display())))?;
        }
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, raw)
            .map_err(|e| GatewayError::Storage(format!("{}: {e}", tmp.display())))?;
        std::fs::rename(&tmp, &self.path)
            .map_err(|e| GatewayError::Storage(format!("{}: {e}", self.path.display())))?;
        debug!(path = %self.path.display(), "document flushed");
        Ok(())
    }
}
