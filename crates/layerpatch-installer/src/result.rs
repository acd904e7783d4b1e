use std::path::PathBuf;

use layerpatch_core::{ItemTarget, ModificationKind};
use tracing::{info, warn};

use crate::error::{io_error, Phase, PatchError};
use crate::fs_utils::remove_path_if_exists;
use crate::history::{HistoryManifest, HistoryStore};
use crate::identity::{write_identity, InstalledIdentity};
use crate::layout::InstallationLayout;
use crate::lock::InstallationLock;
use crate::transactions::Transaction;
use crate::verification::Outcome;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchOperation {
    Apply,
    Rollback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultState {
    Committable,
    Committed,
    Discarded,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedModification {
    pub patch_id: String,
    pub target: ItemTarget,
    pub layer: Option<String>,
    pub kind: ModificationKind,
    pub outcome: Outcome,
}

/// Work that only happens once the caller commits.
#[derive(Debug)]
pub(crate) enum Finalization {
    Apply {
        manifest: HistoryManifest,
    },
    Rollback {
        history_ids: Vec<String>,
        overlays: Vec<PathBuf>,
    },
}

/// Outcome of an apply or rollback that has touched disk but not yet replaced
/// the installed identity.
///
/// Until [`commit`](Self::commit) runs, the previously persisted identity is
/// authoritative. Dropping a committable result discards it.
#[derive(Debug)]
pub struct PatchingResult {
    operation: PatchOperation,
    patch_ids: Vec<String>,
    applied: Vec<AppliedModification>,
    identity_before: InstalledIdentity,
    identity_after: InstalledIdentity,
    state: ResultState,
    layout: InstallationLayout,
    finalization: Finalization,
    transaction: Transaction,
    lock: Option<InstallationLock>,
}

impl PatchingResult {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        operation: PatchOperation,
        patch_ids: Vec<String>,
        applied: Vec<AppliedModification>,
        identity_before: InstalledIdentity,
        identity_after: InstalledIdentity,
        layout: &InstallationLayout,
        finalization: Finalization,
        transaction: Transaction,
        lock: InstallationLock,
    ) -> Self {
        Self {
            operation,
            patch_ids,
            applied,
            identity_before,
            identity_after,
            state: ResultState::Committable,
            layout: layout.clone(),
            finalization,
            transaction,
            lock: Some(lock),
        }
    }

    pub fn operation(&self) -> PatchOperation {
        self.operation
    }

    /// Patches applied or rolled back, in the order they were processed.
    pub fn patch_ids(&self) -> &[String] {
        &self.patch_ids
    }

    pub fn applied_modifications(&self) -> &[AppliedModification] {
        &self.applied
    }

    pub fn identity_before(&self) -> &InstalledIdentity {
        &self.identity_before
    }

    pub fn identity_after(&self) -> &InstalledIdentity {
        &self.identity_after
    }

    pub fn state(&self) -> ResultState {
        self.state
    }

    pub fn count(&self, outcome: Outcome) -> usize {
        self.applied
            .iter()
            .filter(|modification| modification.outcome == outcome)
            .count()
    }

    /// Persists the new identity. Calling it again after success is a no-op.
    pub fn commit(&mut self) -> Result<(), PatchError> {
        match self.state {
            ResultState::Committed => return Ok(()),
            ResultState::Discarded => {
                return Err(PatchError::InvalidState(
                    "cannot commit a discarded patching result".to_string(),
                ))
            }
            ResultState::Committable => {}
        }

        let history = HistoryStore::new(&self.layout);
        if let Finalization::Apply { manifest } = &self.finalization {
            history
                .write_manifest(manifest)
                .map_err(io_error(Phase::Committing, format!("history of {}", manifest.patch_id)))?;
        }

        write_identity(&self.layout, &self.identity_after)?;
        self.state = ResultState::Committed;
        info!(
            operation = ?self.operation,
            patches = ?self.patch_ids,
            version = %self.identity_after.version,
            "committed"
        );

        // The identity is the source of truth from here on; anything left
        // behind below is unreferenced and only costs disk space.
        if let Finalization::Rollback {
            history_ids,
            overlays,
        } = &self.finalization
        {
            for overlay in overlays {
                if let Err(err) = remove_path_if_exists(overlay) {
                    warn!(path = %overlay.display(), %err, "failed to remove rolled back overlay");
                }
            }
            for patch_id in history_ids {
                if let Err(err) = history.remove_entry(patch_id) {
                    warn!(patch_id, %err, "failed to remove consumed history entry");
                }
            }
        }
        if let Err(err) = self.transaction.finish() {
            warn!(txid = self.transaction.txid(), %err, "failed to clear committed transaction");
        }
        self.lock = None;
        Ok(())
    }

    /// Undoes the on-disk work of this result; the installation keeps the
    /// identity it had before. A no-op once discarded.
    pub fn discard(&mut self) -> Result<(), PatchError> {
        match self.state {
            ResultState::Discarded => return Ok(()),
            ResultState::Committed => {
                return Err(PatchError::InvalidState(
                    "cannot discard a committed patching result".to_string(),
                ))
            }
            ResultState::Committable => {}
        }

        let txid = self.transaction.txid().to_string();
        self.transaction
            .revert()
            .map_err(io_error(Phase::Discarding, format!("transaction {txid}")))?;
        if let Finalization::Apply { manifest } = &self.finalization {
            HistoryStore::new(&self.layout)
                .remove_entry(&manifest.patch_id)
                .map_err(io_error(Phase::Discarding, format!("history of {}", manifest.patch_id)))?;
        }
        self.state = ResultState::Discarded;
        self.lock = None;
        info!(operation = ?self.operation, patches = ?self.patch_ids, "discarded");
        Ok(())
    }
}

impl Drop for PatchingResult {
    fn drop(&mut self) {
        if self.state == ResultState::Committable {
            if let Err(err) = self.discard() {
                warn!(%err, "failed to discard uncommitted patching result");
            }
        }
    }
}
