use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use layerpatch_core::{ItemTarget, MODULES_DIR_NAME};

use crate::error::{io_error, Phase, PatchError};

pub use layerpatch_core::STATE_DIR_NAME;

pub const OVERLAYS_DIR_NAME: &str = ".overlays";
/// Marker file that masks a module inside an overlay.
pub const ABSENT_MARKER: &str = ".absent";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallationLayout {
    root: PathBuf,
}

impl InstallationLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn modules_dir(&self) -> PathBuf {
        self.root.join(MODULES_DIR_NAME)
    }

    pub fn system_modules_dir(&self) -> PathBuf {
        self.modules_dir().join("system")
    }

    pub fn layers_dir(&self) -> PathBuf {
        self.system_modules_dir().join("layers")
    }

    pub fn add_ons_dir(&self) -> PathBuf {
        self.system_modules_dir().join("add-ons")
    }

    pub fn layer_dir(&self, name: &str, add_on: bool) -> PathBuf {
        if add_on {
            self.add_ons_dir().join(name)
        } else {
            self.layers_dir().join(name)
        }
    }

    pub fn overlays_dir(&self, layer: &str, add_on: bool) -> PathBuf {
        self.layer_dir(layer, add_on).join(OVERLAYS_DIR_NAME)
    }

    pub fn overlay_dir(&self, layer: &str, add_on: bool, element_id: &str) -> PathBuf {
        self.overlays_dir(layer, add_on).join(element_id)
    }

    /// Live location of a misc item under the installation root.
    pub fn misc_path(&self, target: &ItemTarget) -> PathBuf {
        self.root.join(target.relative_path())
    }

    pub fn state_dir(&self) -> PathBuf {
        self.root.join(STATE_DIR_NAME)
    }

    pub fn identity_path(&self) -> PathBuf {
        self.state_dir().join("identity.json")
    }

    pub fn config_path(&self) -> PathBuf {
        self.state_dir().join("patching.toml")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.state_dir().join("lock")
    }

    pub fn tmp_state_dir(&self) -> PathBuf {
        self.state_dir().join("tmp")
    }

    pub fn history_dir(&self) -> PathBuf {
        self.state_dir().join("history")
    }

    pub fn history_entry_dir(&self, patch_id: &str) -> PathBuf {
        self.history_dir().join(patch_id)
    }

    pub fn transactions_dir(&self) -> PathBuf {
        self.state_dir().join("transactions")
    }

    pub fn transactions_staging_dir(&self) -> PathBuf {
        self.transactions_dir().join("staging")
    }

    pub fn transaction_active_path(&self) -> PathBuf {
        self.transactions_dir().join("active")
    }

    pub fn transaction_metadata_path(&self, txid: &str) -> PathBuf {
        self.transactions_dir().join(format!("{txid}.json"))
    }

    pub fn transaction_journal_path(&self, txid: &str) -> PathBuf {
        self.transactions_dir().join(format!("{txid}.journal"))
    }

    pub fn transaction_staging_path(&self, txid: &str) -> PathBuf {
        self.transactions_staging_dir().join(txid)
    }

    pub fn ensure_state_dirs(&self) -> Result<(), PatchError> {
        for dir in [
            self.state_dir(),
            self.tmp_state_dir(),
            self.history_dir(),
            self.transactions_dir(),
            self.transactions_staging_dir(),
        ] {
            fs::create_dir_all(&dir).map_err(io_error(Phase::Validating, dir.display()))?;
        }
        Ok(())
    }

    /// Layer directories present on disk as `(name, is_add_on)`, sorted by name
    /// with base layers first.
    pub fn discover_layers(&self) -> io::Result<Vec<(String, bool)>> {
        let mut layers = Vec::new();
        for (dir, add_on) in [(self.layers_dir(), false), (self.add_ons_dir(), true)] {
            let entries = match fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
                Err(err) => return Err(err),
            };

            let mut names = Vec::new();
            for entry in entries {
                let entry = entry?;
                if !entry.file_type()?.is_dir() {
                    continue;
                }
                let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                    continue;
                };
                if name.starts_with('.') {
                    continue;
                }
                names.push(name);
            }
            names.sort();
            layers.extend(names.into_iter().map(|name| (name, add_on)));
        }
        Ok(layers)
    }
}
