use std::collections::HashSet;
use std::fs;
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{io_error, Phase, PatchError};
use crate::fs_utils::{copy_path, remove_file_if_exists, remove_path_if_exists, unique_suffix, write_atomic};
use crate::layout::InstallationLayout;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionOperation {
    Apply,
    Rollback,
}

impl TransactionOperation {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Apply => "apply",
            Self::Rollback => "rollback",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionMetadata {
    pub txid: String,
    pub operation: TransactionOperation,
    pub patch_ids: Vec<String>,
    pub started_at_unix: u64,
}

/// One write-ahead journal line. Replayed newest first to undo a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum JournalStep {
    /// `live` is about to change; its previous content was copied to `staged`
    /// (`None` when nothing existed at `live`).
    StageLive {
        live: PathBuf,
        staged: Option<PathBuf>,
    },
    /// `path` is about to be created and must be removed on undo.
    CreatePath { path: PathBuf },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionJournalEntry {
    pub seq: u64,
    #[serde(flatten)]
    pub step: JournalStep,
}

/// In-flight undo log for the live-tree writes of one apply or rollback.
///
/// Every mutation of a live path is preceded by a pre-image in the staging
/// directory and a journal line, so the writes can be reverted on discard or
/// after a crash.
#[derive(Debug)]
pub(crate) struct Transaction {
    layout: InstallationLayout,
    metadata: TransactionMetadata,
    next_seq: u64,
    staged: HashSet<PathBuf>,
    closed: bool,
}

impl Transaction {
    pub(crate) fn begin(
        layout: &InstallationLayout,
        operation: TransactionOperation,
        patch_ids: Vec<String>,
    ) -> Result<Self, PatchError> {
        let txid = format!("{}-{}", operation.as_str(), unique_suffix());
        let metadata = TransactionMetadata {
            txid: txid.clone(),
            operation,
            patch_ids,
            started_at_unix: current_unix_timestamp(),
        };

        let staging = layout.transaction_staging_path(&txid);
        fs::create_dir_all(&staging).map_err(io_error(Phase::BackingUp, staging.display()))?;
        write_transaction_metadata(layout, &metadata)
            .map_err(io_error(Phase::BackingUp, format!("transaction {txid}")))?;
        set_active_transaction(layout, &txid)?;
        debug!(%txid, "transaction started");

        Ok(Self {
            layout: layout.clone(),
            metadata,
            next_seq: 1,
            staged: HashSet::new(),
            closed: false,
        })
    }

    pub(crate) fn txid(&self) -> &str {
        &self.metadata.txid
    }

    /// Saves the current content of `live` before it is overwritten. Only the
    /// first call per path stages anything, so undo always returns the
    /// pre-transaction state.
    pub(crate) fn stage_live(&mut self, live: &Path) -> io::Result<()> {
        if !self.staged.insert(live.to_path_buf()) {
            return Ok(());
        }

        let staged = if fs::symlink_metadata(live).is_ok() {
            let staged = self
                .layout
                .transaction_staging_path(&self.metadata.txid)
                .join(self.next_seq.to_string());
            copy_path(live, &staged)?;
            Some(staged)
        } else {
            None
        };
        self.append(JournalStep::StageLive {
            live: live.to_path_buf(),
            staged,
        })
    }

    pub(crate) fn record_created(&mut self, path: &Path) -> io::Result<()> {
        self.append(JournalStep::CreatePath {
            path: path.to_path_buf(),
        })
    }

    fn append(&mut self, step: JournalStep) -> io::Result<()> {
        let entry = TransactionJournalEntry {
            seq: self.next_seq,
            step,
        };
        append_transaction_journal_entry(&self.layout, &self.metadata.txid, &entry)?;
        self.next_seq += 1;
        Ok(())
    }

    /// Undoes every journaled step, newest first, then clears the transaction.
    pub(crate) fn revert(&mut self) -> io::Result<usize> {
        if self.closed {
            return Ok(0);
        }
        let undone = replay_journal(&self.layout, &self.metadata.txid)?;
        self.finish()?;
        Ok(undone)
    }

    /// Drops the journal and pre-images; the live tree stays as it is.
    pub(crate) fn finish(&mut self) -> io::Result<()> {
        if self.closed {
            return Ok(());
        }
        discard_transaction_files(&self.layout, &self.metadata.txid)?;
        self.closed = true;
        Ok(())
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.closed {
            warn!(
                txid = %self.metadata.txid,
                "transaction dropped while open; journal kept for recovery"
            );
        }
    }
}

pub(crate) fn set_active_transaction(
    layout: &InstallationLayout,
    txid: &str,
) -> Result<PathBuf, PatchError> {
    let path = layout.transaction_active_path();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_error(Phase::BackingUp, parent.display()))?;
    }

    let mut file = match fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&path)
    {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
            let existing = read_active_transaction(layout)
                .ok()
                .flatten()
                .unwrap_or_else(|| "unknown".to_string());
            return Err(PatchError::InterruptedTransaction { txid: existing });
        }
        Err(err) => return Err(io_error(Phase::BackingUp, path.display())(err)),
    };

    file.write_all(format!("{txid}\n").as_bytes())
        .and_then(|()| file.flush())
        .map_err(io_error(Phase::BackingUp, path.display()))?;
    Ok(path)
}

pub fn read_active_transaction(layout: &InstallationLayout) -> io::Result<Option<String>> {
    let path = layout.transaction_active_path();
    let raw = match fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err),
    };

    let txid = raw.trim();
    if txid.is_empty() {
        return Ok(None);
    }
    Ok(Some(txid.to_string()))
}

pub(crate) fn clear_active_transaction(layout: &InstallationLayout) -> io::Result<()> {
    remove_file_if_exists(&layout.transaction_active_path())
}

/// Fails when a previous process left a transaction behind.
pub(crate) fn ensure_no_active_transaction(layout: &InstallationLayout) -> Result<(), PatchError> {
    match read_active_transaction(layout) {
        Ok(None) => Ok(()),
        Ok(Some(txid)) => Err(PatchError::InterruptedTransaction { txid }),
        Err(err) => Err(io_error(
            Phase::Validating,
            layout.transaction_active_path().display(),
        )(err)),
    }
}

fn write_transaction_metadata(
    layout: &InstallationLayout,
    metadata: &TransactionMetadata,
) -> io::Result<()> {
    let payload = serde_json::to_vec_pretty(metadata)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    write_atomic(&layout.transaction_metadata_path(&metadata.txid), &payload)
}

pub fn read_transaction_metadata(
    layout: &InstallationLayout,
    txid: &str,
) -> io::Result<Option<TransactionMetadata>> {
    let path = layout.transaction_metadata_path(txid);
    let raw = match fs::read(&path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err),
    };
    serde_json::from_slice(&raw)
        .map(Some)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
}

fn append_transaction_journal_entry(
    layout: &InstallationLayout,
    txid: &str,
    entry: &TransactionJournalEntry,
) -> io::Result<()> {
    let path = layout.transaction_journal_path(txid);
    let mut line = serde_json::to_vec(entry)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    line.push(b'\n');

    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)?;
    file.write_all(&line)?;
    file.sync_data()
}

pub fn read_transaction_journal(
    layout: &InstallationLayout,
    txid: &str,
) -> io::Result<Vec<TransactionJournalEntry>> {
    let path = layout.transaction_journal_path(txid);
    let file = match fs::File::open(&path) {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err),
    };

    let mut entries = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        match serde_json::from_str(trimmed) {
            Ok(entry) => entries.push(entry),
            // A torn final line means the step it describes never started.
            Err(err) if err.is_eof() => break,
            Err(err) => return Err(io::Error::new(io::ErrorKind::InvalidData, err)),
        }
    }
    Ok(entries)
}

/// Undoes the journaled steps of `txid`, newest first. Returns how many steps ran.
pub(crate) fn replay_journal(layout: &InstallationLayout, txid: &str) -> io::Result<usize> {
    let mut entries = read_transaction_journal(layout, txid)?;
    entries.sort_by(|left, right| right.seq.cmp(&left.seq));

    for entry in &entries {
        match &entry.step {
            JournalStep::StageLive { live, staged } => {
                remove_path_if_exists(live)?;
                if let Some(staged) = staged {
                    copy_path(staged, live)?;
                }
            }
            JournalStep::CreatePath { path } => {
                remove_path_if_exists(path)?;
            }
        }
        debug!(txid, seq = entry.seq, "reverted journal step");
    }
    Ok(entries.len())
}

pub(crate) fn discard_transaction_files(layout: &InstallationLayout, txid: &str) -> io::Result<()> {
    remove_path_if_exists(&layout.transaction_staging_path(txid))?;
    remove_file_if_exists(&layout.transaction_journal_path(txid))?;
    remove_file_if_exists(&layout.transaction_metadata_path(txid))?;
    clear_active_transaction(layout)
}

pub fn current_unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default()
}
