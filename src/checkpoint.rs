//! Checkpoint persistence for resumable harvests.
//!
//! The checkpoint records which queries finished and, for queries that stopped
//! part-way, the continuation token after the last page whose records reached
//! the output. Every change rewrites the whole file through a temp file in the
//! same directory followed by a rename, so a crash leaves either the previous
//! or the new checkpoint on disk and never a mix.

use crate::error::{HarvestError, IoResultExt, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

/// Format version written into every checkpoint
pub const CHECKPOINT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletedQuery {
    pub records_written: u64,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryProgress {
    /// Token of the next page to fetch
    pub token: String,
    pub records_written: u64,
}

/// Durable harvest progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub version: u32,
    #[serde(default)]
    pub completed: BTreeMap<String, CompletedQuery>,
    #[serde(default)]
    pub in_progress: BTreeMap<String, QueryProgress>,
    /// Last failure message of queries that did not finish
    #[serde(default)]
    pub failed: BTreeMap<String, String>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Default for Checkpoint {
    fn default() -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            completed: BTreeMap::new(),
            in_progress: BTreeMap::new(),
            failed: BTreeMap::new(),
            updated_at: None,
        }
    }
}

impl Checkpoint {
    pub fn is_complete(&self, query_id: &str) -> bool {
        self.completed.contains_key(query_id)
    }

    /// Where to resume `query_id`, if it stopped part-way.
    pub fn resume_token(&self, query_id: &str) -> Option<&str> {
        self.in_progress.get(query_id).map(|p| p.token.as_str())
    }

    /// Records already written for a partially fetched query.
    pub fn records_so_far(&self, query_id: &str) -> u64 {
        self.in_progress
            .get(query_id)
            .map(|p| p.records_written)
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.completed.is_empty() && self.in_progress.is_empty() && self.failed.is_empty()
    }
}

/// Owns the checkpoint file and its in-memory state.
pub struct CheckpointStore {
    path: PathBuf,
    state: Checkpoint,
}

impl CheckpointStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            state: Checkpoint::default(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn state(&self) -> &Checkpoint {
        &self.state
    }

    /// Read the checkpoint from disk.
    ///
    /// A missing file is an empty checkpoint. An unreadable document is
    /// discarded with a warning: it cannot vouch for any progress.
    pub fn load(&mut self) -> Result<Checkpoint> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No checkpoint found");
                self.state = Checkpoint::default();
                return Ok(self.state.clone());
            }
            Err(e) => return Err(HarvestError::storage(&self.path, e)),
        };

        self.state = match serde_json::from_str::<Checkpoint>(&content) {
            Ok(checkpoint) if checkpoint.version == CHECKPOINT_VERSION => {
                info!(
                    path = %self.path.display(),
                    completed = checkpoint.completed.len(),
                    in_progress = checkpoint.in_progress.len(),
                    "Loaded checkpoint"
                );
                checkpoint
            }
            Ok(checkpoint) => {
                warn!(
                    path = %self.path.display(),
                    version = checkpoint.version,
                    "Unsupported checkpoint version, ignoring it"
                );
                Checkpoint::default()
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Unreadable checkpoint, ignoring it");
                Checkpoint::default()
            }
        };
        Ok(self.state.clone())
    }

    /// Remember that `query_id` continues at `token`.
    pub fn record_progress(&mut self, query_id: &str, token: &str, records_written: u64) -> Result<()> {
        self.state.in_progress.insert(
            query_id.to_string(),
            QueryProgress {
                token: token.to_string(),
                records_written,
            },
        );
        self.persist()
    }

    pub fn record_complete(&mut self, query_id: &str, records_written: u64) -> Result<()> {
        self.state.in_progress.remove(query_id);
        self.state.failed.remove(query_id);
        self.state.completed.insert(
            query_id.to_string(),
            CompletedQuery {
                records_written,
                completed_at: Utc::now(),
            },
        );
        self.persist()
    }

    /// Note a failed query. Its progress is kept so a later run resumes it.
    pub fn record_failure(&mut self, query_id: &str, message: &str) -> Result<()> {
        self.state
            .failed
            .insert(query_id.to_string(), message.to_string());
        self.persist()
    }

    /// Forget all progress and delete the file.
    pub fn clear(&mut self) -> Result<()> {
        self.state = Checkpoint::default();
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                info!(path = %self.path.display(), "Cleared checkpoint");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(HarvestError::storage(&self.path, e)),
        }
    }

    fn persist(&mut self) -> Result<()> {
        self.state.updated_at = Some(Utc::now());
        let content = serde_json::to_vec_pretty(&self.state)?;
        write_atomic(&self.path, &content)
    }
}

/// Replace `path` with `content` via a synced temp file and a rename.
pub(crate) fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir).storage_at(dir)?;

    let mut tmp = NamedTempFile::new_in(dir).storage_at(dir)?;
    tmp.write_all(content).storage_at(tmp.path())?;
    tmp.flush().storage_at(path)?;
    tmp.as_file().sync_all().storage_at(path)?;
    tmp.persist(path)
        .map_err(|e| HarvestError::storage(path, e.error))?;

    #[cfg(unix)]
    std::fs::File::open(dir)
        .and_then(|d| d.sync_all())
        .storage_at(dir)?;

    Ok(())
}
