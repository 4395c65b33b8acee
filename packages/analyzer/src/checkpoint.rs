//! Durable per-item progress ledger.
//!
//! One JSON document keyed by company code, rewritten atomically after each
//! terminal outcome via a temp file and rename on the same filesystem. A
//! crash mid-write leaves either the previous complete ledger or a stray
//! temp file, never a truncated ledger.

use crate::types::{CheckpointEntry, CompanyCode, FieldMap, TaskStatus};
use anyhow::{Context, Result};
use chrono::Utc;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub struct CheckpointStore {
    path: PathBuf,
    entries: BTreeMap<CompanyCode, CheckpointEntry>,
}

impl CheckpointStore {
    /// Open the ledger at `path`, loading prior progress if the file exists.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let entries = if path.exists() {
            let raw = fs::read_to_string(&path)
                .with_context(|| format!("reading checkpoint file {}", path.display()))?;
            let entries: BTreeMap<CompanyCode, CheckpointEntry> = serde_json::from_str(&raw)
                .with_context(|| format!("parsing checkpoint file {}", path.display()))?;
            info!(
                path = %path.display(),
                entries = entries.len(),
                "resuming from checkpoint"
            );
            entries
        } else {
            BTreeMap::new()
        };

        Ok(Self { path, entries })
    }

    /// Whether the item already reached a terminal state in a prior run.
    ///
    /// Failed items are not terminal: a re-run retries them.
    pub fn is_done(&self, code: &CompanyCode) -> bool {
        matches!(
            self.entries.get(code).map(|e| e.status),
            Some(TaskStatus::Done) | Some(TaskStatus::Skipped)
        )
    }

    pub fn get(&self, code: &CompanyCode) -> Option<&CheckpointEntry> {
        self.entries.get(code)
    }

    /// All recorded entries, keyed by company code.
    pub fn load_all(&self) -> &BTreeMap<CompanyCode, CheckpointEntry> {
        &self.entries
    }

    /// Current status of an item; unrecorded items are pending.
    pub fn status(&self, code: &CompanyCode) -> TaskStatus {
        self.entries
            .get(code)
            .map(|e| e.status)
            .unwrap_or(TaskStatus::Pending)
    }

    /// Record that processing of an item has started. An in-progress entry
    /// left behind by a crash is retried on resume, and tells a human which
    /// item the crashed run was working on.
    pub fn mark_in_progress(&mut self, code: &CompanyCode) -> Result<()> {
        self.record(code, TaskStatus::InProgress, FieldMap::new(), None)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn mark_done(&mut self, code: &CompanyCode, fields: FieldMap) -> Result<()> {
        self.record(code, TaskStatus::Done, fields, None)
    }

    pub fn mark_skipped(&mut self, code: &CompanyCode, reason: String) -> Result<()> {
        self.record(code, TaskStatus::Skipped, FieldMap::new(), Some(reason))
    }

    /// Record a failure with whatever partial state was accumulated, so a
    /// human can inspect it before the re-run retries the item.
    pub fn mark_failed(&mut self, code: &CompanyCode, partial: FieldMap, reason: String) -> Result<()> {
        self.record(code, TaskStatus::Failed, partial, Some(reason))
    }

    fn record(
        &mut self,
        code: &CompanyCode,
        status: TaskStatus,
        fields: FieldMap,
        reason: Option<String>,
    ) -> Result<()> {
        self.entries.insert(
            code.clone(),
            CheckpointEntry {
                status,
                fields,
                reason,
                finished_at: Utc::now(),
            },
        );
        self.flush()?;
        debug!(company = %code, ?status, "checkpoint recorded");
        Ok(())
    }

    /// Write the full ledger to a sibling temp file, then rename over the
    /// live path.
    fn flush(&self) -> Result<()> {
        let serialized = serde_json::to_string_pretty(&self.entries)
            .context("serializing checkpoint ledger")?;

        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serialized)
            .with_context(|| format!("writing checkpoint temp file {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("committing checkpoint file {}", self.path.display()))?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
