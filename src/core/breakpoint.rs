//! Breakpoint persistence for resumable downloads
//!
//! A breakpoint is a durable snapshot of a task's block layout plus the
//! origin validators needed to decide whether resuming is still safe. It is
//! stored as a JSON sidecar next to the destination file and deleted when the
//! task completes.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::warn;
use serde::{Deserialize, Serialize};

use crate::core::block::Block;
use crate::core::error::Result;
use crate::core::probe::ProbeResult;
use crate::core::task::{Task, TaskId};

/// Why a resume attempt was rejected. This is a classification consumed by
/// restart policy, not an error: the task continues from the beginning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeFailedCause {
    /// Origin validators (etag / last-modified) no longer match
    ValidatorMismatch,

    /// The partially downloaded local file is gone
    LocalFileMissing,

    /// The stored metadata can no longer be trusted or validated
    MetadataExpired,
}

impl fmt::Display for ResumeFailedCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResumeFailedCause::ValidatorMismatch => "validator mismatch",
            ResumeFailedCause::LocalFileMissing => "local file missing",
            ResumeFailedCause::MetadataExpired => "metadata expired",
        };
        write!(f, "{name}")
    }
}

/// Persisted progress of one block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockSnapshot {
    pub index: u32,
    pub start: u64,
    pub end: u64,
    pub bytes_completed: u64,
}

/// Durable snapshot of a task's layout and validators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakpointInfo {
    pub task_id: TaskId,
    pub url: String,
    pub path: PathBuf,
    pub content_length: u64,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub blocks: Vec<BlockSnapshot>,
}

impl BreakpointInfo {
    /// Snapshot the live block layout of `task`. Only called for tasks with a
    /// known content length and a range-capable origin.
    pub fn capture(
        task: &Task,
        content_length: u64,
        probe: &ProbeResult,
        blocks: &[Arc<Block>],
    ) -> Self {
        let blocks = blocks
            .iter()
            .map(|block| BlockSnapshot {
                index: block.index,
                start: block.start,
                end: block.end.unwrap_or(content_length.saturating_sub(1)),
                bytes_completed: block.bytes_completed(),
            })
            .collect();

        Self {
            task_id: task.id,
            url: task.url.clone(),
            path: task.path.clone(),
            content_length,
            etag: probe.etag.clone(),
            last_modified: probe.last_modified.clone(),
            blocks,
        }
    }

    /// Total bytes already on disk according to this snapshot.
    pub fn total_completed(&self) -> u64 {
        self.blocks.iter().map(|b| b.bytes_completed).sum()
    }

    /// Rebuild live blocks with their saved progress.
    pub fn restore_blocks(&self) -> Vec<Block> {
        self.blocks
            .iter()
            .map(|snapshot| {
                let block = Block::new(snapshot.index, snapshot.start, Some(snapshot.end));
                block.set_completed(snapshot.bytes_completed);
                block
            })
            .collect()
    }

    /// Decide whether this snapshot can seed a resume against a fresh probe
    /// of the origin. `None` means the layout is reusable as-is.
    pub fn validate(&self, task: &Task, probe: &ProbeResult) -> Option<ResumeFailedCause> {
        if self.url != task.url || self.path != task.path {
            return Some(ResumeFailedCause::MetadataExpired);
        }
        if !self.layout_is_sane() {
            return Some(ResumeFailedCause::MetadataExpired);
        }
        if !self.path.exists() {
            return Some(ResumeFailedCause::LocalFileMissing);
        }
        if !probe.resumable {
            return Some(ResumeFailedCause::MetadataExpired);
        }
        if probe.content_length != Some(self.content_length) {
            return Some(ResumeFailedCause::ValidatorMismatch);
        }

        // etag wins over last-modified when both are present
        match (&self.etag, &probe.etag) {
            (Some(stored), Some(live)) if stored != live => {
                Some(ResumeFailedCause::ValidatorMismatch)
            }
            (Some(_), Some(_)) => None,
            (Some(_), None) => Some(ResumeFailedCause::MetadataExpired),
            (None, _) => match (&self.last_modified, &probe.last_modified) {
                (Some(stored), Some(live)) if stored != live => {
                    Some(ResumeFailedCause::ValidatorMismatch)
                }
                (Some(_), Some(_)) => None,
                // a snapshot without any validator is never resumed blind
                _ => Some(ResumeFailedCause::MetadataExpired),
            },
        }
    }

    fn layout_is_sane(&self) -> bool {
        if self.blocks.is_empty() || self.blocks[0].start != 0 {
            return false;
        }
        for pair in self.blocks.windows(2) {
            if pair[0].end + 1 != pair[1].start {
                return false;
            }
        }
        let last = match self.blocks.last() {
            Some(last) => last,
            None => return false,
        };
        if last.end + 1 != self.content_length {
            return false;
        }
        self.blocks
            .iter()
            .all(|b| b.end >= b.start && b.bytes_completed <= b.end - b.start + 1)
    }
}

/// Reads and writes breakpoint sidecar files.
pub struct BreakpointStore;

impl BreakpointStore {
    /// Sidecar file path for a destination.
    pub fn sidecar_path(dest: &Path) -> PathBuf {
        let mut name = dest.as_os_str().to_os_string();
        name.push(".resume");
        PathBuf::from(name)
    }

    /// Load the breakpoint for `dest`, if one exists. A missing or corrupt
    /// sidecar is not an error: it simply means there is nothing to resume.
    pub async fn load(dest: &Path) -> Result<Option<BreakpointInfo>> {
        let sidecar = Self::sidecar_path(dest);
        let data = match tokio::fs::read(&sidecar).await {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        match serde_json::from_slice(&data) {
            Ok(info) => Ok(Some(info)),
            Err(err) => {
                warn!("ignoring corrupt breakpoint {}: {err}", sidecar.display());
                Ok(None)
            }
        }
    }

    /// Persist `info` for its destination, replacing any previous snapshot.
    pub async fn save(info: &BreakpointInfo) -> Result<()> {
        let sidecar = Self::sidecar_path(&info.path);
        let data = serde_json::to_vec_pretty(info)
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))?;
        tokio::fs::write(&sidecar, data).await?;
        Ok(())
    }

    /// Delete the sidecar for `dest`. Missing files are fine.
    pub async fn remove(dest: &Path) -> Result<()> {
        let sidecar = Self::sidecar_path(dest);
        match tokio::fs::remove_file(&sidecar).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}
