use std::fmt;
use std::path::PathBuf;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use crate::hash::ContentHash;

pub const DEFAULT_SLOT: &str = "main";
/// Root directory holding layer and add-on module content.
pub const MODULES_DIR_NAME: &str = "modules";
/// Root directory holding the engine's own state.
pub const STATE_DIR_NAME: &str = ".layerpatch";

/// Top-level names a misc item may not live under.
const RESERVED_ROOT_NAMES: [&str; 2] = [MODULES_DIR_NAME, STATE_DIR_NAME];

fn default_slot() -> String {
    DEFAULT_SLOT.to_string()
}

/// A component module, addressed by dotted name and loadable slot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModuleItem {
    pub name: String,
    #[serde(default = "default_slot")]
    pub slot: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<ContentHash>,
}

/// A single file addressed by its directory segments under the installation root.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MiscItem {
    pub name: String,
    #[serde(default)]
    pub path: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<ContentHash>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ContentItem {
    Module(ModuleItem),
    Misc(MiscItem),
}

/// Identity of a content item with its state (the hash) stripped off.
///
/// Two items refer to the same target iff their targets compare equal.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ItemTarget {
    Module {
        name: String,
        #[serde(default = "default_slot")]
        slot: String,
    },
    Misc {
        name: String,
        #[serde(default)]
        path: Vec<String>,
    },
}

impl ModuleItem {
    pub fn new(name: impl Into<String>, slot: impl Into<String>, hash: Option<ContentHash>) -> Self {
        Self {
            name: name.into(),
            slot: slot.into(),
            hash,
        }
    }
}

impl MiscItem {
    pub fn new<S: Into<String>>(
        name: impl Into<String>,
        path: impl IntoIterator<Item = S>,
        hash: Option<ContentHash>,
    ) -> Self {
        Self {
            name: name.into(),
            path: path.into_iter().map(Into::into).collect(),
            hash,
        }
    }
}

impl ContentItem {
    pub fn target(&self) -> ItemTarget {
        match self {
            Self::Module(module) => ItemTarget::Module {
                name: module.name.clone(),
                slot: module.slot.clone(),
            },
            Self::Misc(misc) => ItemTarget::Misc {
                name: misc.name.clone(),
                path: misc.path.clone(),
            },
        }
    }

    pub fn hash(&self) -> Option<&ContentHash> {
        match self {
            Self::Module(module) => module.hash.as_ref(),
            Self::Misc(misc) => misc.hash.as_ref(),
        }
    }

    pub fn is_module(&self) -> bool {
        matches!(self, Self::Module(_))
    }
}

impl ItemTarget {
    pub fn module(name: impl Into<String>, slot: impl Into<String>) -> Self {
        Self::Module {
            name: name.into(),
            slot: slot.into(),
        }
    }

    pub fn misc<S: Into<String>>(name: impl Into<String>, path: impl IntoIterator<Item = S>) -> Self {
        Self::Misc {
            name: name.into(),
            path: path.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_module(&self) -> bool {
        matches!(self, Self::Module { .. })
    }

    /// Location relative to a module root (`org/acme/auth/main`) or to the
    /// installation root (`bin/run.sh`).
    pub fn relative_path(&self) -> PathBuf {
        match self {
            Self::Module { name, slot } => {
                let mut path: PathBuf = name.split('.').collect();
                path.push(slot);
                path
            }
            Self::Misc { name, path } => {
                let mut relative: PathBuf = path.iter().collect();
                relative.push(name);
                relative
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Module { name, slot } => {
                if name.is_empty() || name.split('.').any(|part| !is_safe_segment(part)) {
                    return Err(anyhow!("invalid module name '{name}'"));
                }
                if !is_safe_segment(slot) {
                    return Err(anyhow!("invalid slot '{slot}' for module '{name}'"));
                }
            }
            Self::Misc { name, path } => {
                if !is_safe_segment(name) {
                    return Err(anyhow!("invalid misc file name '{name}'"));
                }
                if let Some(segment) = path.iter().find(|segment| !is_safe_segment(segment)) {
                    return Err(anyhow!(
                        "invalid path segment '{segment}' for misc item '{name}'"
                    ));
                }
                let top = path.first().unwrap_or(name);
                if RESERVED_ROOT_NAMES.contains(&top.as_str()) {
                    return Err(anyhow!(
                        "misc item '{name}' cannot live under reserved directory '{top}'"
                    ));
                }
            }
        }
        Ok(())
    }
}

impl fmt::Display for ItemTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Module { name, slot } => write!(f, "module {name}:{slot}"),
            Self::Misc { name, path } => {
                if path.is_empty() {
                    write!(f, "misc {name}")
                } else {
                    write!(f, "misc {}/{name}", path.join("/"))
                }
            }
        }
    }
}

fn is_safe_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment != "."
        && segment != ".."
        && !segment.contains(['/', '\\', '\0'])
}
