use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::anyhow;
use layerpatch_core::{ContentHash, ItemTarget};
use tracing::{debug, info, info_span, warn};

use crate::config::PatchToolConfig;
use crate::error::{io_error, Conflict, Phase, PatchError};
use crate::fs_utils::remove_empty_dirs;
use crate::history::{HistoryManifest, HistoryRecord, HistoryStore};
use crate::identity::InstalledIdentity;
use crate::layout::InstallationLayout;
use crate::lock::InstallationLock;
use crate::result::{AppliedModification, Finalization, PatchOperation, PatchingResult};
use crate::transactions::{Transaction, TransactionOperation};
use crate::verification::{classify, Classification, ContentVerificationPolicy, Outcome};

/// Which part of the applied stack a rollback removes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RollbackMode {
    /// Only the named patch, which must be the newest one applied.
    #[default]
    Single,
    /// The named patch and everything applied after it.
    To,
}

impl RollbackMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Single => "single",
            Self::To => "to",
        }
    }
}

impl fmt::Display for RollbackMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RollbackMode {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "single" => Ok(Self::Single),
            "to" => Ok(Self::To),
            other => Err(anyhow!("unknown rollback mode '{other}'; expected single or to")),
        }
    }
}

/// A misc item that will be written back from a history entry.
struct PlannedRestore<'a> {
    patch_id: &'a str,
    record: &'a HistoryRecord,
    outcome: Outcome,
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn rollback_patch(
    layout: &InstallationLayout,
    config: &PatchToolConfig,
    lock: InstallationLock,
    identity: InstalledIdentity,
    patch_id: &str,
    mode: RollbackMode,
    policy: ContentVerificationPolicy,
) -> Result<PatchingResult, PatchError> {
    let span = info_span!("rollback", patch = patch_id, %mode, %policy);
    let _entered = span.enter();

    let position = identity
        .applied
        .iter()
        .position(|patch| patch.id == patch_id)
        .ok_or_else(|| PatchError::not_found(format!("applied patch '{patch_id}'")))?;
    if mode == RollbackMode::Single && position + 1 != identity.applied.len() {
        let newest = identity
            .newest()
            .map(|patch| patch.id.clone())
            .unwrap_or_default();
        return Err(PatchError::StackOrder {
            requested: patch_id.to_string(),
            newest,
        });
    }

    let popped: Vec<String> = identity.applied[position..]
        .iter()
        .rev()
        .map(|patch| patch.id.clone())
        .collect();
    info!(patches = ?popped, "rolling back");

    let history = HistoryStore::new(layout);
    let manifests = popped
        .iter()
        .map(|id| history.verify(id))
        .collect::<Result<Vec<_>, _>>()?;

    let (restores, preserved) = plan_restores(layout, &manifests, patch_id, policy)?;

    let mut transaction =
        Transaction::begin(layout, TransactionOperation::Rollback, popped.clone())?;
    if let Err(err) = restore_live(layout, config, &history, &manifests, &restores, &mut transaction) {
        match transaction.revert() {
            Ok(undone) => info!(undone, "reverted partial rollback"),
            Err(revert) => warn!(
                txid = transaction.txid(),
                %revert,
                "failed to revert partial rollback; run recover"
            ),
        }
        return Err(err);
    }

    let mut identity_after = identity.clone();
    identity_after.applied.truncate(position);
    identity_after.version = identity.applied[position].version_before.clone();

    let mut overlays = Vec::new();
    for manifest in &manifests {
        for element in manifest.elements.iter().filter(|element| element.overlay) {
            if let Some(layer) = identity_after.layer_mut(&element.layer) {
                layer.overlays.retain(|overlay| overlay != &element.id);
            }
            overlays.push(layout.overlay_dir(&element.layer, element.add_on, &element.id));
        }
    }

    let applied = describe(&manifests, &restores, &preserved);
    info!(version = %identity_after.version, "rollback ready to commit");
    Ok(PatchingResult::new(
        PatchOperation::Rollback,
        popped.clone(),
        applied,
        identity,
        identity_after,
        layout,
        Finalization::Rollback {
            history_ids: popped,
            overlays,
        },
        transaction,
        lock,
    ))
}

/// Decides, newest patch first, which misc items go back to their recorded
/// pre-patch bytes. Later restores see the content earlier restores will
/// leave behind.
fn plan_restores<'a>(
    layout: &InstallationLayout,
    manifests: &'a [HistoryManifest],
    requested: &str,
    policy: ContentVerificationPolicy,
) -> Result<(Vec<PlannedRestore<'a>>, Vec<(&'a str, &'a HistoryRecord)>), PatchError> {
    let mut simulated: HashMap<ItemTarget, Option<ContentHash>> = HashMap::new();
    let mut restores = Vec::new();
    let mut preserved = Vec::new();
    let mut conflicts = Vec::new();

    for manifest in manifests {
        let misc = manifest
            .records
            .iter()
            .filter(|record| record.layer.is_none() && record.outcome.mutated());
        for record in misc {
            let current = match simulated.get(&record.target) {
                Some(current) => current.clone(),
                None => ContentHash::of_path(&layout.misc_path(&record.target))
                    .map_err(io_error(Phase::Checking, &record.target))?,
            };

            match classify(record.after.as_ref(), current.as_ref(), policy) {
                Classification::Apply => {
                    let outcome = if record.after == current {
                        Outcome::Applied
                    } else {
                        Outcome::Overridden
                    };
                    simulated.insert(record.target.clone(), record.before.clone());
                    restores.push(PlannedRestore {
                        patch_id: &manifest.patch_id,
                        record,
                        outcome,
                    });
                }
                Classification::Skip => {
                    debug!(target = %record.target, "keeping locally changed content");
                    preserved.push((manifest.patch_id.as_str(), record));
                }
                Classification::Conflict => conflicts.push(Conflict {
                    target: record.target.clone(),
                    layer: None,
                    expected: record.after.clone(),
                    actual: current,
                }),
            }
        }
    }

    if !conflicts.is_empty() {
        info!(count = conflicts.len(), "rollback rejected with conflicts");
        return Err(PatchError::ContentConflict {
            patch_id: requested.to_string(),
            conflicts,
        });
    }
    Ok((restores, preserved))
}

fn restore_live(
    layout: &InstallationLayout,
    config: &PatchToolConfig,
    history: &HistoryStore,
    manifests: &[HistoryManifest],
    restores: &[PlannedRestore<'_>],
    transaction: &mut Transaction,
) -> Result<(), PatchError> {
    for restore in restores {
        let target = &restore.record.target;
        let live = layout.misc_path(target);
        transaction
            .stage_live(&live)
            .map_err(io_error(Phase::Mutating, target))?;
        history
            .restore(restore.patch_id, restore.record, &live)
            .map_err(io_error(Phase::Mutating, target))?;
        if restore.record.backup.is_none() {
            let created: Vec<PathBuf> = restore
                .record
                .created_dirs
                .iter()
                .map(|relative| layout.root().join(relative))
                .collect();
            remove_empty_dirs(&created).map_err(io_error(Phase::Mutating, target))?;
        }
        debug!(%target, patch = restore.patch_id, "restored");
    }

    if !config.rollback.restore_configuration {
        return Ok(());
    }
    // The oldest popped patch holds the configuration as it was before the
    // whole popped range.
    let Some(oldest) = manifests.last() else {
        return Ok(());
    };
    for relative_dir in &oldest.configuration {
        let live: PathBuf = layout.root().join(relative_dir);
        transaction
            .stage_live(&live)
            .map_err(io_error(Phase::Mutating, live.display()))?;
        history
            .restore_configuration(&oldest.patch_id, relative_dir, &live)
            .map_err(io_error(Phase::Mutating, live.display()))?;
        debug!(directory = relative_dir.as_str(), "restored configuration");
    }
    Ok(())
}

fn describe(
    manifests: &[HistoryManifest],
    restores: &[PlannedRestore<'_>],
    preserved: &[(&str, &HistoryRecord)],
) -> Vec<AppliedModification> {
    let mut applied = Vec::new();
    for manifest in manifests {
        let modules = manifest
            .records
            .iter()
            .filter(|record| record.layer.is_some() && record.outcome.mutated());
        for record in modules {
            applied.push(AppliedModification {
                patch_id: manifest.patch_id.clone(),
                target: record.target.clone(),
                layer: record.layer.clone(),
                kind: record.kind,
                outcome: Outcome::Applied,
            });
        }
    }
    for restore in restores {
        applied.push(AppliedModification {
            patch_id: restore.patch_id.to_string(),
            target: restore.record.target.clone(),
            layer: None,
            kind: restore.record.kind,
            outcome: restore.outcome,
        });
    }
    for (patch_id, record) in preserved {
        applied.push(AppliedModification {
            patch_id: patch_id.to_string(),
            target: record.target.clone(),
            layer: None,
            kind: record.kind,
            outcome: Outcome::Skipped,
        });
    }
    applied
}
