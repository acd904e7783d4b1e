use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use layerpatch_core::{ContentHash, ItemTarget, ModificationKind, PatchKind};
use semver::Version;
use serde::{Deserialize, Serialize};

use crate::error::PatchError;
use crate::fs_utils::{copy_path, install_path, remove_path_if_exists, write_atomic};
use crate::layout::InstallationLayout;
use crate::verification::Outcome;

pub const HISTORY_MANIFEST_FILE: &str = "manifest.json";
pub const HISTORY_FORMAT_VERSION: u32 = 1;
const ITEMS_DIR: &str = "items";
const CONFIGURATION_DIR: &str = "configuration";

/// Everything rollback needs to invert one applied patch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryManifest {
    pub format: u32,
    pub patch_id: String,
    pub kind: PatchKind,
    pub identity: String,
    pub version_before: Version,
    pub version_after: Version,
    pub created_at_unix: u64,
    #[serde(default)]
    pub elements: Vec<ElementRecord>,
    #[serde(default)]
    pub records: Vec<HistoryRecord>,
    /// Configuration directories copied in full, relative to the installation root.
    #[serde(default)]
    pub configuration: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElementRecord {
    pub id: String,
    pub layer: String,
    pub add_on: bool,
    /// Whether the element produced an overlay directory.
    pub overlay: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub target: ItemTarget,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layer: Option<String>,
    pub kind: ModificationKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<ContentHash>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<ContentHash>,
    pub outcome: Outcome,
    /// Backup location relative to the history entry; `None` when the item was absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup: Option<String>,
    /// Parent directories the patch created for this item, outermost first,
    /// relative to the installation root.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub created_dirs: Vec<String>,
}

/// Per-patch backup directories under `.layerpatch/history`.
#[derive(Debug, Clone)]
pub struct HistoryStore {
    layout: InstallationLayout,
}

impl HistoryStore {
    pub fn new(layout: &InstallationLayout) -> Self {
        Self {
            layout: layout.clone(),
        }
    }

    pub fn entry_dir(&self, patch_id: &str) -> PathBuf {
        self.layout.history_entry_dir(patch_id)
    }

    pub fn manifest_path(&self, patch_id: &str) -> PathBuf {
        self.entry_dir(patch_id).join(HISTORY_MANIFEST_FILE)
    }

    pub fn has_manifest(&self, patch_id: &str) -> bool {
        self.manifest_path(patch_id).is_file()
    }

    /// Creates an empty entry, clearing leftovers of an attempt that never committed.
    pub(crate) fn prepare_entry(&self, patch_id: &str) -> io::Result<PathBuf> {
        let dir = self.entry_dir(patch_id);
        remove_path_if_exists(&dir)?;
        fs::create_dir_all(dir.join(ITEMS_DIR))?;
        Ok(dir)
    }

    pub(crate) fn remove_entry(&self, patch_id: &str) -> io::Result<bool> {
        remove_path_if_exists(&self.entry_dir(patch_id))
    }

    /// Copies the current content of `target` into the entry. Returns the backup's
    /// relative location, or `None` when there was nothing to copy.
    pub fn snapshot(
        &self,
        patch_id: &str,
        layer: Option<&str>,
        target: &ItemTarget,
        current: Option<&Path>,
    ) -> io::Result<Option<String>> {
        let Some(current) = current else {
            return Ok(None);
        };
        let relative = backup_relative_path(layer, target);
        copy_path(current, &self.entry_dir(patch_id).join(&relative))?;
        Ok(Some(relative))
    }

    /// Writes the recorded pre-patch state of `record` back to `live`.
    pub fn restore(&self, patch_id: &str, record: &HistoryRecord, live: &Path) -> io::Result<()> {
        match &record.backup {
            Some(relative) => install_path(&self.entry_dir(patch_id).join(relative), live),
            None => remove_path_if_exists(live).map(|_| ()),
        }
    }

    pub fn snapshot_configuration(
        &self,
        patch_id: &str,
        relative_dir: &str,
        live: &Path,
    ) -> io::Result<bool> {
        if !live.is_dir() {
            return Ok(false);
        }
        let backup = self
            .entry_dir(patch_id)
            .join(CONFIGURATION_DIR)
            .join(relative_dir);
        copy_path(live, &backup)?;
        Ok(true)
    }

    pub fn restore_configuration(
        &self,
        patch_id: &str,
        relative_dir: &str,
        live: &Path,
    ) -> io::Result<()> {
        let backup = self
            .entry_dir(patch_id)
            .join(CONFIGURATION_DIR)
            .join(relative_dir);
        install_path(&backup, live)
    }

    pub(crate) fn write_manifest(&self, manifest: &HistoryManifest) -> io::Result<PathBuf> {
        let path = self.manifest_path(&manifest.patch_id);
        let mut payload = serde_json::to_vec_pretty(manifest)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        payload.push(b'\n');
        write_atomic(&path, &payload)?;
        Ok(path)
    }

    pub fn read_manifest(&self, patch_id: &str) -> Result<HistoryManifest, PatchError> {
        let path = self.manifest_path(patch_id);
        let raw = fs::read(&path).map_err(|err| PatchError::MissingHistory {
            patch_id: patch_id.to_string(),
            reason: format!("cannot read {}: {err}", path.display()),
        })?;
        let manifest: HistoryManifest =
            serde_json::from_slice(&raw).map_err(|err| PatchError::MissingHistory {
                patch_id: patch_id.to_string(),
                reason: format!("corrupted manifest {}: {err}", path.display()),
            })?;
        if manifest.format != HISTORY_FORMAT_VERSION || manifest.patch_id != patch_id {
            return Err(PatchError::MissingHistory {
                patch_id: patch_id.to_string(),
                reason: format!(
                    "manifest {} describes '{}' (format {})",
                    path.display(),
                    manifest.patch_id,
                    manifest.format
                ),
            });
        }
        Ok(manifest)
    }

    /// Reads the manifest and checks that every backup it references is present
    /// and still hashes to the recorded pre-patch hash.
    pub fn verify(&self, patch_id: &str) -> Result<HistoryManifest, PatchError> {
        let manifest = self.read_manifest(patch_id)?;
        let entry = self.entry_dir(patch_id);
        let missing = |reason: String| PatchError::MissingHistory {
            patch_id: patch_id.to_string(),
            reason,
        };

        for record in manifest.records.iter().filter(|record| record.outcome.mutated()) {
            match (&record.before, &record.backup) {
                (None, None) => {}
                (Some(before), Some(relative)) => {
                    let backup = entry.join(relative);
                    let actual = ContentHash::of_path(&backup).map_err(|err| {
                        missing(format!("cannot read backup {}: {err}", backup.display()))
                    })?;
                    if actual.as_ref() != Some(before) {
                        return Err(missing(format!(
                            "backup of {} does not match its recorded hash",
                            record.target
                        )));
                    }
                }
                _ => {
                    return Err(missing(format!(
                        "record for {} is inconsistent with its backup",
                        record.target
                    )))
                }
            }
        }

        for relative_dir in &manifest.configuration {
            let backup = entry.join(CONFIGURATION_DIR).join(relative_dir);
            if !backup.is_dir() {
                return Err(missing(format!(
                    "configuration backup {} is missing",
                    backup.display()
                )));
            }
        }

        Ok(manifest)
    }
}

fn backup_relative_path(layer: Option<&str>, target: &ItemTarget) -> String {
    let relative = target.relative_path();
    let relative = relative
        .components()
        .map(|component| component.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/");
    match layer {
        Some(layer) => format!("{ITEMS_DIR}/modules/{layer}/{relative}"),
        None => format!("{ITEMS_DIR}/misc/{relative}"),
    }
}
