use std::io;
use std::path::{Path, PathBuf};

use layerpatch_core::{ItemTarget, PatchDescriptor, PatchKind};
use semver::Version;
use tracing::{info, warn};

use crate::apply::{apply_patch, validate_patch};
use crate::config::PatchToolConfig;
use crate::error::{io_error, Phase, PatchError};
use crate::fs_utils::remove_path_if_exists;
use crate::history::HistoryStore;
use crate::identity::{read_identity, write_identity, InstalledIdentity, LayerState};
use crate::layout::InstallationLayout;
use crate::lock::InstallationLock;
use crate::result::PatchingResult;
use crate::rollback::{rollback_patch, RollbackMode};
use crate::transactions::{
    discard_transaction_files, ensure_no_active_transaction, read_active_transaction,
    read_transaction_metadata, replay_journal, TransactionOperation,
};
use crate::verification::{check_patch, CheckReport, ContentVerificationPolicy};

const DEFAULT_LAYER: &str = "base";

/// One row of [`PatchTool::list_history`], oldest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchSummary {
    pub id: String,
    pub kind: PatchKind,
    pub description: String,
    pub version_before: Version,
    pub version_after: Version,
    pub applied_at_unix: u64,
    /// Whether a usable history entry exists, i.e. whether rollback is possible.
    pub history_available: bool,
}

/// Entry point for patching one installation.
///
/// Every write operation takes the installation lock for its whole duration;
/// apply and rollback hand the lock over to the returned [`PatchingResult`].
#[derive(Debug, Clone)]
pub struct PatchTool {
    layout: InstallationLayout,
    config: PatchToolConfig,
}

impl PatchTool {
    /// Opens the installation at `root`, reading `.layerpatch/patching.toml` if present.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, PatchError> {
        let layout = InstallationLayout::new(root);
        let config = PatchToolConfig::load(&layout)?;
        Ok(Self { layout, config })
    }

    pub fn with_config(root: impl Into<PathBuf>, config: PatchToolConfig) -> Self {
        Self {
            layout: InstallationLayout::new(root),
            config,
        }
    }

    pub fn layout(&self) -> &InstallationLayout {
        &self.layout
    }

    pub fn config(&self) -> &PatchToolConfig {
        &self.config
    }

    /// Records the installation's identity for the first time.
    pub fn initialize(&self, name: &str, version: Version) -> Result<InstalledIdentity, PatchError> {
        if name.trim().is_empty() {
            return Err(PatchError::InvalidState(
                "identity name must not be empty".to_string(),
            ));
        }
        self.layout.ensure_state_dirs()?;
        let _lock = self.lock()?;
        if self.layout.identity_path().exists() {
            return Err(PatchError::InvalidState(format!(
                "installation at {} is already initialized",
                self.layout.root().display()
            )));
        }

        let discovered = self
            .layout
            .discover_layers()
            .map_err(io_error(Phase::Validating, self.layout.system_modules_dir().display()))?;
        let layers = if discovered.is_empty() {
            let base = self.layout.layer_dir(DEFAULT_LAYER, false);
            std::fs::create_dir_all(&base).map_err(io_error(Phase::Validating, base.display()))?;
            vec![LayerState::new(DEFAULT_LAYER, false)]
        } else {
            discovered
                .into_iter()
                .map(|(name, add_on)| LayerState::new(name, add_on))
                .collect()
        };

        let identity = InstalledIdentity::new(name, version, layers);
        write_identity(&self.layout, &identity)?;
        info!(
            name = identity.name.as_str(),
            version = %identity.version,
            layers = identity.layers.len(),
            "initialized installation"
        );
        Ok(identity)
    }

    pub fn identity(&self) -> Result<InstalledIdentity, PatchError> {
        read_identity(&self.layout)
    }

    /// Validates and classifies a patch without changing anything on disk.
    pub fn check_patch(
        &self,
        patch_dir: &Path,
        policy: ContentVerificationPolicy,
    ) -> Result<CheckReport, PatchError> {
        let _lock = self.lock()?;
        let identity = read_identity(&self.layout)?;
        let descriptor = load_descriptor(patch_dir)?;
        validate_patch(&self.layout, &identity, patch_dir, &descriptor)?;
        check_patch(&self.layout, &identity, &descriptor, policy)
    }

    /// Applies the patch extracted at `patch_dir`. Nothing becomes
    /// authoritative until the returned result is committed.
    pub fn apply_patch(
        &self,
        patch_dir: &Path,
        policy: ContentVerificationPolicy,
    ) -> Result<PatchingResult, PatchError> {
        self.apply_patch_with_hook(patch_dir, policy, &mut |_, _| Ok(()))
    }

    pub(crate) fn apply_patch_with_hook(
        &self,
        patch_dir: &Path,
        policy: ContentVerificationPolicy,
        hook: &mut dyn FnMut(usize, &ItemTarget) -> io::Result<()>,
    ) -> Result<PatchingResult, PatchError> {
        let lock = self.lock()?;
        ensure_no_active_transaction(&self.layout)?;
        let descriptor = load_descriptor(patch_dir)?;
        let identity = read_identity(&self.layout)?;
        self.layout.ensure_state_dirs()?;
        apply_patch(
            &self.layout,
            &self.config,
            lock,
            identity,
            patch_dir,
            descriptor,
            policy,
            hook,
        )
    }

    /// Removes `patch_id` (and, with [`RollbackMode::To`], every newer patch)
    /// from the installation.
    pub fn rollback(
        &self,
        patch_id: &str,
        mode: RollbackMode,
        policy: ContentVerificationPolicy,
    ) -> Result<PatchingResult, PatchError> {
        let lock = self.lock()?;
        ensure_no_active_transaction(&self.layout)?;
        let identity = read_identity(&self.layout)?;
        rollback_patch(
            &self.layout,
            &self.config,
            lock,
            identity,
            patch_id,
            mode,
            policy,
        )
    }

    pub fn list_history(&self) -> Result<Vec<PatchSummary>, PatchError> {
        let identity = read_identity(&self.layout)?;
        let history = HistoryStore::new(&self.layout);
        Ok(identity
            .applied
            .iter()
            .map(|patch| PatchSummary {
                id: patch.id.clone(),
                kind: patch.kind,
                description: patch.description.clone(),
                version_before: patch.version_before.clone(),
                version_after: patch.version_after.clone(),
                applied_at_unix: patch.applied_at_unix,
                history_available: history.has_manifest(&patch.id),
            })
            .collect())
    }

    /// Finishes a transaction left behind by a process that died mid-operation.
    ///
    /// If the identity already reflects the transaction it committed and only
    /// the bookkeeping is cleared; otherwise its live writes are undone.
    /// Returns the recovered transaction id, or `None` when there was nothing to do.
    pub fn recover(&self) -> Result<Option<String>, PatchError> {
        let _lock = self.lock()?;
        let Some(txid) = read_active_transaction(&self.layout).map_err(io_error(
            Phase::Recovering,
            self.layout.transaction_active_path().display(),
        ))?
        else {
            return Ok(None);
        };

        let metadata = read_transaction_metadata(&self.layout, &txid)
            .map_err(io_error(Phase::Recovering, format!("transaction {txid}")))?;
        let identity = read_identity(&self.layout)?;
        let committed = metadata.as_ref().is_some_and(|metadata| {
            let applied = metadata.patch_ids.iter().all(|id| identity.is_applied(id));
            match metadata.operation {
                TransactionOperation::Apply => applied,
                TransactionOperation::Rollback => {
                    !metadata.patch_ids.iter().any(|id| identity.is_applied(id))
                }
            }
        });

        if committed {
            info!(%txid, "transaction had committed; clearing its journal");
            if let Some(metadata) = metadata
                .as_ref()
                .filter(|metadata| metadata.operation == TransactionOperation::Rollback)
            {
                let history = HistoryStore::new(&self.layout);
                for patch_id in &metadata.patch_ids {
                    self.remove_rolled_back_overlays(&history, patch_id);
                    if let Err(err) = history.remove_entry(patch_id) {
                        warn!(patch_id = patch_id.as_str(), %err, "failed to remove consumed history entry");
                    }
                }
            }
        } else {
            let undone = replay_journal(&self.layout, &txid)
                .map_err(io_error(Phase::Recovering, format!("transaction {txid}")))?;
            info!(%txid, undone, "reverted interrupted transaction");
            if let Some(metadata) = &metadata {
                if metadata.operation == TransactionOperation::Apply {
                    let history = HistoryStore::new(&self.layout);
                    for patch_id in &metadata.patch_ids {
                        if let Err(err) = history.remove_entry(patch_id) {
                            warn!(patch_id = patch_id.as_str(), %err, "failed to remove history entry");
                        }
                    }
                }
            }
        }

        discard_transaction_files(&self.layout, &txid)
            .map_err(io_error(Phase::Recovering, format!("transaction {txid}")))?;
        Ok(Some(txid))
    }

    /// Effective directory of module `name`/`slot` in `layer`, after overlays.
    pub fn module_path(
        &self,
        layer: &str,
        name: &str,
        slot: &str,
    ) -> Result<Option<PathBuf>, PatchError> {
        let identity = read_identity(&self.layout)?;
        let chain = identity
            .overlay_chain(&self.layout, layer)
            .ok_or_else(|| PatchError::not_found(format!("layer '{layer}'")))?;
        Ok(chain.effective_path(&ItemTarget::module(name, slot).relative_path()))
    }

    /// Overlay directories of a rolled back patch, as listed in its history manifest.
    fn remove_rolled_back_overlays(&self, history: &HistoryStore, patch_id: &str) {
        let manifest = match history.read_manifest(patch_id) {
            Ok(manifest) => manifest,
            Err(err) => {
                warn!(patch_id, %err, "history manifest unavailable; overlays left in place");
                return;
            }
        };
        for element in manifest.elements.iter().filter(|element| element.overlay) {
            let overlay = self
                .layout
                .overlay_dir(&element.layer, element.add_on, &element.id);
            if let Err(err) = remove_path_if_exists(&overlay) {
                warn!(path = %overlay.display(), %err, "failed to remove rolled back overlay");
            }
        }
    }

    fn lock(&self) -> Result<InstallationLock, PatchError> {
        InstallationLock::acquire(&self.layout, self.config.lock.wait)
    }
}

fn load_descriptor(patch_dir: &Path) -> Result<PatchDescriptor, PatchError> {
    PatchDescriptor::load(patch_dir).map_err(|err| PatchError::InvalidPatch(format!("{err:#}")))
}
