use std::io;
use std::path::{Path, PathBuf};

use layerpatch_core::ContentHash;

use crate::identity::LayerState;
use crate::layout::{InstallationLayout, ABSENT_MARKER};

/// What a layer currently exposes for a relative module path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Present(PathBuf),
    Absent,
}

/// Base directory of a layer plus the overlay roots stacked on top of it.
///
/// Lookups walk the overlays newest first and fall back to the base
/// directory. A tombstone in an overlay stops the walk and reports the item
/// as absent, so older content stays on disk but is masked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlayChain {
    base: PathBuf,
    overlays: Vec<PathBuf>,
}

impl OverlayChain {
    pub fn new(base: impl Into<PathBuf>, overlays: Vec<PathBuf>) -> Self {
        Self {
            base: base.into(),
            overlays,
        }
    }

    pub fn for_layer(layout: &InstallationLayout, layer: &LayerState) -> Self {
        let overlays = layer
            .overlays
            .iter()
            .map(|element_id| layout.overlay_dir(&layer.name, layer.add_on, element_id))
            .collect();
        Self::new(layout.layer_dir(&layer.name, layer.add_on), overlays)
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn overlays(&self) -> &[PathBuf] {
        &self.overlays
    }

    pub fn resolve(&self, relative: &Path) -> Resolution {
        for overlay in self.overlays.iter().rev() {
            let candidate = overlay.join(relative);
            if candidate.join(ABSENT_MARKER).exists() {
                return Resolution::Absent;
            }
            if candidate.exists() {
                return Resolution::Present(candidate);
            }
        }

        let candidate = self.base.join(relative);
        if candidate.exists() {
            Resolution::Present(candidate)
        } else {
            Resolution::Absent
        }
    }

    pub fn effective_path(&self, relative: &Path) -> Option<PathBuf> {
        match self.resolve(relative) {
            Resolution::Present(path) => Some(path),
            Resolution::Absent => None,
        }
    }

    pub fn effective_hash(&self, relative: &Path) -> io::Result<Option<ContentHash>> {
        match self.resolve(relative) {
            Resolution::Present(path) => ContentHash::of_path(&path),
            Resolution::Absent => Ok(None),
        }
    }
}
