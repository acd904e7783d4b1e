use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use semver::Version;
use serde::{Deserialize, Serialize};

use crate::item::ItemTarget;
use crate::modification::ContentModification;

pub const DESCRIPTOR_FILE_NAME: &str = "patch.toml";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum PatchKind {
    OneOff,
    Cumulative,
}

impl PatchKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OneOff => "one-off",
            Self::Cumulative => "cumulative",
        }
    }
}

impl fmt::Display for PatchKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Module changes for one layer of the installation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PatchElement {
    pub id: String,
    pub layer: String,
    #[serde(default)]
    pub add_on: bool,
    #[serde(default)]
    pub modifications: Vec<ContentModification>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PatchDescriptor {
    pub id: String,
    #[serde(default)]
    pub description: String,
    pub kind: PatchKind,
    pub identity: String,
    pub applies_to: Version,
    pub resulting_version: Version,
    /// Misc file changes relative to the installation root.
    #[serde(default)]
    pub modifications: Vec<ContentModification>,
    #[serde(default)]
    pub elements: Vec<PatchElement>,
}

impl PatchDescriptor {
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let descriptor: Self = toml::from_str(input).context("failed to parse patch descriptor")?;
        descriptor.validate()?;
        Ok(descriptor)
    }

    /// Reads `patch.toml` from an extracted patch directory.
    pub fn load(patch_dir: &Path) -> Result<Self> {
        let path = patch_dir.join(DESCRIPTOR_FILE_NAME);
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("failed to read patch descriptor: {}", path.display()))?;
        Self::from_toml_str(&raw)
            .with_context(|| format!("invalid patch descriptor: {}", path.display()))
    }

    pub fn modification_count(&self) -> usize {
        self.modifications.len()
            + self
                .elements
                .iter()
                .map(|element| element.modifications.len())
                .sum::<usize>()
    }

    fn validate(&self) -> Result<()> {
        validate_identifier("patch id", &self.id)?;
        if self.identity.trim().is_empty() {
            return Err(anyhow!("patch '{}' must name the identity it targets", self.id));
        }

        let mut seen = HashSet::new();
        for modification in &self.modifications {
            modification.validate()?;
            let target = modification.target();
            if target.is_module() {
                return Err(anyhow!(
                    "{target} must be declared inside a layer element, not at the installation root"
                ));
            }
            if modification
                .condition
                .as_ref()
                .is_some_and(|condition| condition.target().is_module())
            {
                return Err(anyhow!(
                    "condition on {target} cannot reference a module outside a layer element"
                ));
            }
            if !seen.insert(target.clone()) {
                return Err(anyhow!("duplicate modification of {target}"));
            }
        }

        let mut element_ids = HashSet::new();
        let mut layers = HashSet::new();
        for element in &self.elements {
            validate_identifier("element id", &element.id)?;
            if element.id == self.id {
                return Err(anyhow!(
                    "element id '{}' collides with the patch id",
                    element.id
                ));
            }
            if !element_ids.insert(element.id.as_str()) {
                return Err(anyhow!("duplicate element id '{}'", element.id));
            }
            validate_identifier("layer name", &element.layer)?;
            if !layers.insert(element.layer.as_str()) {
                return Err(anyhow!(
                    "layer '{}' is patched by more than one element",
                    element.layer
                ));
            }

            let mut seen = HashSet::new();
            for modification in &element.modifications {
                modification
                    .validate()
                    .with_context(|| format!("invalid modification in element '{}'", element.id))?;
                let target = modification.target();
                if !target.is_module() {
                    return Err(anyhow!(
                        "{target} in element '{}' must be declared at the installation root",
                        element.id
                    ));
                }
                if !seen.insert(target.clone()) {
                    return Err(anyhow!(
                        "duplicate modification of {target} in element '{}'",
                        element.id
                    ));
                }
            }
        }

        Ok(())
    }
}

/// Ids end up as directory names, so they are limited to a conservative alphabet.
pub fn validate_identifier(kind: &str, value: &str) -> Result<()> {
    if value.is_empty() || value == "." || value == ".." {
        return Err(anyhow!("{kind} must not be empty"));
    }
    if value.starts_with('.') {
        return Err(anyhow!("{kind} must not start with '.': {value}"));
    }
    if !value
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '.' | '-' | '_'))
    {
        return Err(anyhow!("{kind} contains invalid character(s): {value}"));
    }
    Ok(())
}

/// Location of the new content for `target` inside an extracted patch directory.
///
/// Root misc items use the patch id as their element id.
pub fn payload_path(patch_dir: &Path, element_id: &str, target: &ItemTarget) -> PathBuf {
    let section = if target.is_module() { "modules" } else { "misc" };
    patch_dir
        .join(element_id)
        .join(section)
        .join(target.relative_path())
}
