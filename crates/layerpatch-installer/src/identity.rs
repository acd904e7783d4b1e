use std::fs;
use std::io;

use layerpatch_core::PatchKind;
use semver::Version;
use serde::{Deserialize, Serialize};

use crate::error::{io_error, Phase, PatchError};
use crate::fs_utils::write_atomic;
use crate::layout::InstallationLayout;
use crate::overlay::OverlayChain;

pub const IDENTITY_FORMAT_VERSION: u32 = 1;

fn identity_format_version() -> u32 {
    IDENTITY_FORMAT_VERSION
}

/// Persisted record of what is installed. Replaced wholesale on commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledIdentity {
    #[serde(default = "identity_format_version")]
    pub format: u32,
    pub name: String,
    pub base_version: Version,
    pub version: Version,
    /// Applied patches, oldest first.
    #[serde(default)]
    pub applied: Vec<AppliedPatch>,
    #[serde(default)]
    pub layers: Vec<LayerState>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedPatch {
    pub id: String,
    pub kind: PatchKind,
    #[serde(default)]
    pub description: String,
    pub version_before: Version,
    pub version_after: Version,
    pub applied_at_unix: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerState {
    pub name: String,
    #[serde(default)]
    pub add_on: bool,
    /// Overlay element ids, oldest first.
    #[serde(default)]
    pub overlays: Vec<String>,
}

impl InstalledIdentity {
    pub fn new(name: impl Into<String>, version: Version, layers: Vec<LayerState>) -> Self {
        Self {
            format: IDENTITY_FORMAT_VERSION,
            name: name.into(),
            base_version: version.clone(),
            version,
            applied: Vec::new(),
            layers,
        }
    }

    pub fn applied_ids(&self) -> Vec<&str> {
        self.applied.iter().map(|patch| patch.id.as_str()).collect()
    }

    pub fn is_applied(&self, patch_id: &str) -> bool {
        self.applied.iter().any(|patch| patch.id == patch_id)
    }

    pub fn newest(&self) -> Option<&AppliedPatch> {
        self.applied.last()
    }

    pub fn layer(&self, name: &str) -> Option<&LayerState> {
        self.layers.iter().find(|layer| layer.name == name)
    }

    pub fn layer_mut(&mut self, name: &str) -> Option<&mut LayerState> {
        self.layers.iter_mut().find(|layer| layer.name == name)
    }

    pub fn overlay_in_use(&self, element_id: &str) -> bool {
        self.layers
            .iter()
            .any(|layer| layer.overlays.iter().any(|overlay| overlay == element_id))
    }

    pub fn overlay_chain(&self, layout: &InstallationLayout, layer: &str) -> Option<OverlayChain> {
        self.layer(layer)
            .map(|state| OverlayChain::for_layer(layout, state))
    }
}

impl LayerState {
    pub fn new(name: impl Into<String>, add_on: bool) -> Self {
        Self {
            name: name.into(),
            add_on,
            overlays: Vec::new(),
        }
    }
}

pub fn read_identity(layout: &InstallationLayout) -> Result<InstalledIdentity, PatchError> {
    let path = layout.identity_path();
    let raw = match fs::read(&path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return Err(PatchError::not_found(format!(
                "installed identity at {}",
                path.display()
            )))
        }
        Err(err) => return Err(io_error(Phase::Validating, path.display())(err)),
    };

    let identity: InstalledIdentity = serde_json::from_slice(&raw).map_err(|err| {
        PatchError::InvalidState(format!("failed to parse {}: {err}", path.display()))
    })?;
    if identity.format != IDENTITY_FORMAT_VERSION {
        return Err(PatchError::InvalidState(format!(
            "unsupported identity format {} in {}",
            identity.format,
            path.display()
        )));
    }
    Ok(identity)
}

pub(crate) fn write_identity(
    layout: &InstallationLayout,
    identity: &InstalledIdentity,
) -> Result<(), PatchError> {
    let path = layout.identity_path();
    let mut payload = serde_json::to_vec_pretty(identity)
        .map_err(|err| PatchError::InvalidState(format!("failed to encode identity: {err}")))?;
    payload.push(b'\n');
    write_atomic(&path, &payload).map_err(io_error(Phase::Committing, path.display()))
}
