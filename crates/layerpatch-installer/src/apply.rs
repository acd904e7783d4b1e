use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use layerpatch_core::{payload_path, ContentHash, ItemTarget, ModificationKind, PatchDescriptor};
use tracing::{debug, info, info_span, warn};

use crate::config::PatchToolConfig;
use crate::error::{io_error, Phase, PatchError};
use crate::fs_utils::{install_path, remove_path_if_exists};
use crate::history::{
    ElementRecord, HistoryManifest, HistoryRecord, HistoryStore, HISTORY_FORMAT_VERSION,
};
use crate::identity::{AppliedPatch, InstalledIdentity};
use crate::layout::{InstallationLayout, ABSENT_MARKER};
use crate::lock::InstallationLock;
use crate::result::{AppliedModification, Finalization, PatchOperation, PatchingResult};
use crate::transactions::{current_unix_timestamp, Transaction, TransactionOperation};
use crate::verification::{
    check_patch, CheckReport, CheckedModification, ContentVerificationPolicy, Outcome, Scope,
};

/// Called right before each live mutation with its position in the apply
/// order; an error aborts the apply as if the write itself had failed.
pub(crate) type MutationHook<'a> = &'a mut dyn FnMut(usize, &ItemTarget) -> io::Result<()>;

#[allow(clippy::too_many_arguments)]
pub(crate) fn apply_patch(
    layout: &InstallationLayout,
    config: &PatchToolConfig,
    lock: InstallationLock,
    identity: InstalledIdentity,
    patch_dir: &Path,
    descriptor: PatchDescriptor,
    policy: ContentVerificationPolicy,
    hook: MutationHook<'_>,
) -> Result<PatchingResult, PatchError> {
    let span = info_span!("apply", patch = %descriptor.id, %policy);
    let _entered = span.enter();

    validate_patch(layout, &identity, patch_dir, &descriptor)?;

    let report = check_patch(layout, &identity, &descriptor, policy)?;
    if report.has_conflicts() {
        let conflicts = report.conflicts();
        info!(count = conflicts.len(), "patch rejected with conflicts");
        return Err(PatchError::ContentConflict {
            patch_id: descriptor.id.clone(),
            conflicts,
        });
    }
    info!(
        applied = report.count(Outcome::Applied),
        overridden = report.count(Outcome::Overridden),
        skipped = report.count(Outcome::Skipped),
        omitted = report.omitted.len(),
        "check complete"
    );

    let history = HistoryStore::new(layout);
    let (records, configuration) =
        match back_up(layout, config, &identity, &descriptor, &report, &history) {
            Ok(backed_up) => backed_up,
            Err(err) => {
                if let Err(cleanup) = history.remove_entry(&descriptor.id) {
                    warn!(%cleanup, "failed to remove partial history entry");
                }
                return Err(err);
            }
        };

    let mut transaction = match Transaction::begin(
        layout,
        TransactionOperation::Apply,
        vec![descriptor.id.clone()],
    ) {
        Ok(transaction) => transaction,
        Err(err) => {
            if let Err(cleanup) = history.remove_entry(&descriptor.id) {
                warn!(%cleanup, "failed to remove history entry");
            }
            return Err(err);
        }
    };

    let overlays = match mutate(layout, patch_dir, &descriptor, &report, &mut transaction, hook) {
        Ok(overlays) => overlays,
        Err(err) => {
            // Backups stay where they are so the failed attempt can be inspected;
            // the identity still points at the previous state.
            match transaction.revert() {
                Ok(undone) => info!(undone, "reverted partial apply"),
                Err(revert) => warn!(
                    txid = transaction.txid(),
                    %revert,
                    "failed to revert partial apply; run recover"
                ),
            }
            return Err(err);
        }
    };

    let mut identity_after = identity.clone();
    identity_after.version = descriptor.resulting_version.clone();
    identity_after.applied.push(AppliedPatch {
        id: descriptor.id.clone(),
        kind: descriptor.kind,
        description: descriptor.description.clone(),
        version_before: identity.version.clone(),
        version_after: descriptor.resulting_version.clone(),
        applied_at_unix: current_unix_timestamp(),
    });

    let mut elements = Vec::with_capacity(descriptor.elements.len());
    for element in &descriptor.elements {
        let overlay = overlays.contains_key(&element.id);
        if overlay {
            if let Some(layer) = identity_after.layer_mut(&element.layer) {
                layer.overlays.push(element.id.clone());
            }
        }
        elements.push(ElementRecord {
            id: element.id.clone(),
            layer: element.layer.clone(),
            add_on: element.add_on,
            overlay,
        });
    }

    let manifest = HistoryManifest {
        format: HISTORY_FORMAT_VERSION,
        patch_id: descriptor.id.clone(),
        kind: descriptor.kind,
        identity: descriptor.identity.clone(),
        version_before: identity.version.clone(),
        version_after: descriptor.resulting_version.clone(),
        created_at_unix: current_unix_timestamp(),
        elements,
        records,
        configuration,
    };

    let applied = manifest
        .records
        .iter()
        .map(|record| AppliedModification {
            patch_id: descriptor.id.clone(),
            target: record.target.clone(),
            layer: record.layer.clone(),
            kind: record.kind,
            outcome: record.outcome,
        })
        .collect();

    info!(version = %identity_after.version, "patch ready to commit");
    Ok(PatchingResult::new(
        PatchOperation::Apply,
        vec![descriptor.id.clone()],
        applied,
        identity,
        identity_after,
        layout,
        Finalization::Apply { manifest },
        transaction,
        lock,
    ))
}

/// Checks that need nothing but the identity and the patch directory.
pub(crate) fn validate_patch(
    layout: &InstallationLayout,
    identity: &InstalledIdentity,
    patch_dir: &Path,
    descriptor: &PatchDescriptor,
) -> Result<(), PatchError> {
    if descriptor.identity != identity.name || descriptor.applies_to != identity.version {
        return Err(PatchError::VersionMismatch {
            patch_id: descriptor.id.clone(),
            expected_identity: descriptor.identity.clone(),
            expected_version: descriptor.applies_to.clone(),
            installed_identity: identity.name.clone(),
            installed_version: identity.version.clone(),
        });
    }
    if identity.is_applied(&descriptor.id) {
        return Err(PatchError::AlreadyApplied {
            patch_id: descriptor.id.clone(),
        });
    }

    for element in &descriptor.elements {
        let layer = identity.layer(&element.layer).ok_or_else(|| {
            PatchError::InvalidPatch(format!(
                "element '{}' targets unknown layer '{}'",
                element.id, element.layer
            ))
        })?;
        if layer.add_on != element.add_on {
            return Err(PatchError::InvalidPatch(format!(
                "element '{}' declares add_on={} but layer '{}' has add_on={}",
                element.id, element.add_on, element.layer, layer.add_on
            )));
        }
        if identity.overlay_in_use(&element.id) {
            return Err(PatchError::InvalidPatch(format!(
                "element id '{}' is already used by an applied patch",
                element.id
            )));
        }
        if !layout.layer_dir(&element.layer, element.add_on).is_dir() {
            return Err(PatchError::InvalidState(format!(
                "directory of layer '{}' is missing",
                element.layer
            )));
        }
        for modification in &element.modifications {
            verify_payload(
                patch_dir,
                &element.id,
                modification.kind,
                &modification.target(),
                modification.item.hash(),
            )?;
        }
    }

    for modification in &descriptor.modifications {
        verify_payload(
            patch_dir,
            &descriptor.id,
            modification.kind,
            &modification.target(),
            modification.item.hash(),
        )?;
    }
    Ok(())
}

fn verify_payload(
    patch_dir: &Path,
    element_id: &str,
    kind: ModificationKind,
    target: &ItemTarget,
    expected: Option<&ContentHash>,
) -> Result<(), PatchError> {
    if kind == ModificationKind::Remove {
        return Ok(());
    }
    let path = payload_path(patch_dir, element_id, target);
    let actual =
        ContentHash::of_path(&path).map_err(io_error(Phase::Validating, path.display()))?;
    match actual {
        None => Err(PatchError::InvalidPatch(format!(
            "content for {target} is missing at {}",
            path.display()
        ))),
        Some(actual) if Some(&actual) != expected => Err(PatchError::InvalidPatch(format!(
            "content for {target} at {} hashes to {} but the descriptor declares {}",
            path.display(),
            actual.short(),
            expected.map(ContentHash::short).unwrap_or("nothing")
        ))),
        Some(_) => Ok(()),
    }
}

/// Copies everything the patch is about to change into a fresh history entry.
/// Completes before the first live write.
fn back_up(
    layout: &InstallationLayout,
    config: &PatchToolConfig,
    identity: &InstalledIdentity,
    descriptor: &PatchDescriptor,
    report: &CheckReport,
    history: &HistoryStore,
) -> Result<(Vec<HistoryRecord>, Vec<String>), PatchError> {
    let patch_id = descriptor.id.as_str();
    history
        .prepare_entry(patch_id)
        .map_err(io_error(Phase::BackingUp, format!("history of {patch_id}")))?;

    let mut records = Vec::with_capacity(report.checked.len());
    for checked in &report.checked {
        let target = checked.target();
        let outcome = checked.outcome().ok_or_else(|| {
            PatchError::InvalidState(format!("unresolved conflict on {target}"))
        })?;

        let backup = if outcome.mutated() {
            let current = current_location(layout, identity, checked);
            history
                .snapshot(patch_id, checked.scope.layer(), &target, current.as_deref())
                .map_err(io_error(Phase::BackingUp, &target))?
        } else {
            None
        };
        let adds_content = checked.modification.kind != ModificationKind::Remove;
        let created_dirs = if outcome.mutated() && adds_content {
            missing_parent_dirs(layout, &target)
        } else {
            Vec::new()
        };
        debug!(%target, %outcome, backed_up = backup.is_some(), "recorded history");

        records.push(HistoryRecord {
            target,
            layer: checked.scope.layer().map(str::to_string),
            kind: checked.modification.kind,
            before: checked.current.clone(),
            after: checked.modification.resulting_hash().cloned(),
            outcome,
            backup,
            created_dirs,
        });
    }

    let mut configuration = Vec::new();
    for relative_dir in &config.configuration.directories {
        let live = layout.root().join(relative_dir);
        let copied = history
            .snapshot_configuration(patch_id, relative_dir, &live)
            .map_err(io_error(Phase::BackingUp, live.display()))?;
        if copied {
            configuration.push(relative_dir.clone());
        }
    }

    Ok((records, configuration))
}

fn current_location(
    layout: &InstallationLayout,
    identity: &InstalledIdentity,
    checked: &CheckedModification,
) -> Option<PathBuf> {
    let target = checked.target();
    match checked.scope.layer() {
        Some(layer) => identity
            .overlay_chain(layout, layer)
            .and_then(|chain| chain.effective_path(&target.relative_path())),
        None => {
            let live = layout.misc_path(&target);
            live.exists().then_some(live)
        }
    }
}

/// Performs the live writes. Returns the overlay directory created per element id.
fn mutate(
    layout: &InstallationLayout,
    patch_dir: &Path,
    descriptor: &PatchDescriptor,
    report: &CheckReport,
    transaction: &mut Transaction,
    hook: MutationHook<'_>,
) -> Result<HashMap<String, PathBuf>, PatchError> {
    let mut overlays: HashMap<String, PathBuf> = HashMap::new();
    let to_apply = report
        .checked
        .iter()
        .filter(|checked| checked.outcome().is_some_and(Outcome::mutated));

    for (position, checked) in to_apply.enumerate() {
        let target = checked.target();
        hook(position, &target).map_err(io_error(Phase::Mutating, &target))?;

        match &checked.scope {
            Scope::Element {
                element_id,
                layer,
                add_on,
            } => {
                let overlay = match overlays.get(element_id) {
                    Some(overlay) => overlay.clone(),
                    None => {
                        let overlay = layout.overlay_dir(layer, *add_on, element_id);
                        create_overlay(&overlay, transaction)?;
                        overlays.insert(element_id.clone(), overlay.clone());
                        overlay
                    }
                };
                let destination = overlay.join(target.relative_path());
                write_module(patch_dir, element_id, checked, &destination)
                    .map_err(io_error(Phase::Mutating, &target))?;
            }
            Scope::Root => {
                let live = layout.misc_path(&target);
                if checked.modification.kind != ModificationKind::Remove {
                    for relative in missing_parent_dirs(layout, &target) {
                        transaction
                            .record_created(&layout.root().join(relative))
                            .map_err(io_error(Phase::Mutating, &target))?;
                    }
                }
                transaction
                    .stage_live(&live)
                    .map_err(io_error(Phase::Mutating, &target))?;
                write_misc(patch_dir, &descriptor.id, checked, &live)
                    .map_err(io_error(Phase::Mutating, &target))?;
            }
        }
        debug!(%target, kind = %checked.modification.kind, "mutated");
    }

    Ok(overlays)
}

fn create_overlay(overlay: &Path, transaction: &mut Transaction) -> Result<(), PatchError> {
    let subject = overlay.display();
    transaction
        .record_created(overlay)
        .map_err(io_error(Phase::Mutating, &subject))?;
    // Unreferenced leftovers of an attempt that never committed.
    remove_path_if_exists(overlay).map_err(io_error(Phase::Mutating, &subject))?;
    fs::create_dir_all(overlay).map_err(io_error(Phase::Mutating, &subject))
}

fn write_module(
    patch_dir: &Path,
    element_id: &str,
    checked: &CheckedModification,
    destination: &Path,
) -> io::Result<()> {
    match checked.modification.kind {
        ModificationKind::Add | ModificationKind::Modify => {
            let payload = payload_path(patch_dir, element_id, &checked.target());
            install_path(&payload, destination)
        }
        ModificationKind::Remove => {
            fs::create_dir_all(destination)?;
            fs::write(destination.join(ABSENT_MARKER), b"")
        }
    }
}

/// Directories above a misc item that do not exist yet, outermost first.
fn missing_parent_dirs(layout: &InstallationLayout, target: &ItemTarget) -> Vec<String> {
    let ItemTarget::Misc { path, .. } = target else {
        return Vec::new();
    };
    (1..=path.len())
        .map(|depth| path[..depth].join("/"))
        .filter(|relative| !layout.root().join(relative).exists())
        .collect()
}

fn write_misc(
    patch_dir: &Path,
    patch_id: &str,
    checked: &CheckedModification,
    live: &Path,
) -> io::Result<()> {
    match checked.modification.kind {
        ModificationKind::Add | ModificationKind::Modify => {
            let payload = payload_path(patch_dir, patch_id, &checked.target());
            install_path(&payload, live)
        }
        ModificationKind::Remove => remove_path_if_exists(live).map(|_| ()),
    }
}
