//! Persisted scan progress and dedup state of the registry watcher

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::error::Error;
use std::fmt;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Debug)]
pub enum CheckpointError {
    Io { path: PathBuf, source: std::io::Error },
    Corrupt { path: PathBuf, source: serde_json::Error },
}

impl fmt::Display for CheckpointError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckpointError::Io { path, source } => {
                write!(f, "checkpoint I/O error at {}: {source}", path.display())
            }
            CheckpointError::Corrupt { path, source } => {
                write!(f, "checkpoint at {} is not valid JSON: {source}", path.display())
            }
        }
    }
}

impl Error for CheckpointError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            CheckpointError::Io { source, .. } => Some(source),
            CheckpointError::Corrupt { source, .. } => Some(source),
        }
    }
}

/// Scan progress plus every entity id ever handed out.
///
/// `last_processed_block` never moves backwards. An id leaves the seen set
/// only if it was marked but never handed downstream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatcherCheckpoint {
    #[serde(rename = "last_block", default)]
    last_processed_block: Option<u64>,
    #[serde(rename = "seen_agents", default)]
    seen_entity_ids: BTreeSet<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    saved_at: Option<DateTime<Utc>>,
}

impl WatcherCheckpoint {
    pub fn last_processed_block(&self) -> Option<u64> {
        self.last_processed_block
    }

    pub fn seen_count(&self) -> usize {
        self.seen_entity_ids.len()
    }

    pub fn saved_at(&self) -> Option<DateTime<Utc>> {
        self.saved_at
    }

    pub fn is_seen(&self, entity_id: u64) -> bool {
        self.seen_entity_ids.contains(&entity_id)
    }

    /// Record an id as seen, returning false if it was already known
    pub fn mark_seen(&mut self, entity_id: u64) -> bool {
        self.seen_entity_ids.insert(entity_id)
    }

    /// Unmark an id that was never delivered, returning false if it was not seen
    pub fn forget(&mut self, entity_id: u64) -> bool {
        self.seen_entity_ids.remove(&entity_id)
    }

    /// Move scan progress forward to `block`; lower values are ignored
    pub fn advance_to(&mut self, block: u64) {
        self.last_processed_block = Some(match self.last_processed_block {
            Some(current) => current.max(block),
            None => block,
        });
    }

    /// Block range the next poll should cover, or `None` when caught up.
    ///
    /// Without progress the scan starts `lookback_blocks` behind the head.
    pub fn next_scan_range(&self, chain_head: u64, lookback_blocks: u64) -> Option<RangeInclusive<u64>> {
        let from_block = match self.last_processed_block {
            None => chain_head.saturating_sub(lookback_blocks),
            Some(last) => last.checked_add(1)?,
        };

        if from_block > chain_head {
            return None;
        }

        Some(from_block..=chain_head)
    }

    /// Load a checkpoint; a missing file yields the empty checkpoint
    pub async fn load(path: &Path) -> Result<Self, CheckpointError> {
        let json = match tokio::fs::read_to_string(path).await {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(source) => {
                return Err(CheckpointError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        serde_json::from_str(&json).map_err(|source| CheckpointError::Corrupt {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Load a checkpoint, starting fresh if it cannot be read
    pub async fn load_or_default(path: &Path) -> Self {
        match Self::load(path).await {
            Ok(checkpoint) => {
                info!(
                    path = %path.display(),
                    last_block = ?checkpoint.last_processed_block,
                    seen_count = checkpoint.seen_count(),
                    "Loaded watcher checkpoint"
                );
                checkpoint
            }
            Err(e) => {
                warn!("Failed to load watcher checkpoint, starting fresh: {}", e);
                Self::default()
            }
        }
    }

    /// Write the checkpoint through a temporary file and rename it into place
    pub async fn save(&mut self, path: &Path) -> Result<(), CheckpointError> {
        let io_err = |source| CheckpointError::Io {
            path: path.to_path_buf(),
            source,
        };

        self.saved_at = Some(Utc::now());
        let json = serde_json::to_string_pretty(self).map_err(|source| CheckpointError::Corrupt {
            path: path.to_path_buf(),
            source,
        })?;

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
            }
        }

        let tmp_path = path.with_extension("json.tmp");
        tokio::fs::write(&tmp_path, json).await.map_err(io_err)?;
        tokio::fs::rename(&tmp_path, path).await.map_err(io_err)?;
        Ok(())
    }
}
