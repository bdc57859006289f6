//! Pending out-of-band context, optionally persisted as JSON.

use crate::error::{Result, VoxError};
use crate::events::ContextPayload;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Context received while no session was ready.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingContext {
    #[serde(flatten)]
    pub payload: ContextPayload,
    pub timestamp: DateTime<Utc>,
    /// Insertion order; breaks timestamp ties.
    #[serde(default)]
    pub seq: u64,
}

/// Keyed store of [`PendingContext`] entries.
#[derive(Debug, Default)]
pub struct ContextStore {
    path: Option<PathBuf>,
    entries: BTreeMap<String, PendingContext>,
    next_seq: u64,
}

impl ContextStore {
    /// In-memory store.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Open a store backed by `path`, loading existing entries if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn open(path: &Path) -> Result<Self> {
        let entries: BTreeMap<String, PendingContext> = if path.exists() {
            let raw = std::fs::read_to_string(path)?;
            if raw.trim().is_empty() {
                BTreeMap::new()
            } else {
                serde_json::from_str(&raw).map_err(|e| {
                    VoxError::Config(format!("corrupt context store {}: {e}", path.display()))
                })?
            }
        } else {
            BTreeMap::new()
        };
        let next_seq = entries.values().map(|e| e.seq + 1).max().unwrap_or(0);
        if !entries.is_empty() {
            info!(count = entries.len(), path = %path.display(), "loaded pending context");
        }
        Ok(Self {
            path: Some(path.to_path_buf()),
            entries,
            next_seq,
        })
    }

    /// Store `payload` and return its storage key.
    pub fn insert(&mut self, payload: ContextPayload, timestamp: DateTime<Utc>) -> String {
        let key = Uuid::new_v4().to_string();
        let entry = PendingContext {
            payload,
            timestamp,
            seq: self.next_seq,
        };
        self.next_seq += 1;
        self.entries.insert(key.clone(), entry);
        debug!(storage_key = %key, pending = self.entries.len(), "context stored");
        self.persist();
        key
    }

    /// Most recent entry by timestamp.
    #[must_use]
    pub fn latest(&self) -> Option<(&str, &PendingContext)> {
        self.entries
            .iter()
            .max_by_key(|(_, e)| (e.timestamp, e.seq))
            .map(|(k, e)| (k.as_str(), e))
    }

    pub fn clear(&mut self) {
        if self.entries.is_empty() {
            return;
        }
        self.entries.clear();
        self.persist();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn persist(&self) {
        let Some(path) = &self.path else {
            return;
        };
        if let Err(e) = self.write_to(path) {
            warn!(path = %path.display(), error = %e, "failed to persist pending context");
        }
    }

    fn write_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&self.entries)
            .map_err(|e| VoxError::Config(format!("serialize context store: {e}")))?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}
