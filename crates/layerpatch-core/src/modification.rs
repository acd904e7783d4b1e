use std::fmt;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

use crate::hash::ContentHash;
use crate::item::{ContentItem, ItemTarget};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ModificationKind {
    Add,
    Modify,
    Remove,
}

impl ModificationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Modify => "modify",
            Self::Remove => "remove",
        }
    }
}

impl fmt::Display for ModificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Guard evaluated before classification; a false guard drops the modification.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Precondition {
    Present(ItemTarget),
}

impl Precondition {
    pub fn target(&self) -> &ItemTarget {
        match self {
            Self::Present(target) => target,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContentModification {
    pub kind: ModificationKind,
    pub item: ContentItem,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub existing_hash: Option<ContentHash>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Precondition>,
}

impl ContentModification {
    pub fn add(item: ContentItem) -> Self {
        Self {
            kind: ModificationKind::Add,
            item,
            existing_hash: None,
            condition: None,
        }
    }

    pub fn modify(item: ContentItem, existing_hash: ContentHash) -> Self {
        Self {
            kind: ModificationKind::Modify,
            item,
            existing_hash: Some(existing_hash),
            condition: None,
        }
    }

    pub fn remove(item: ContentItem, existing_hash: ContentHash) -> Self {
        Self {
            kind: ModificationKind::Remove,
            item,
            existing_hash: Some(existing_hash),
            condition: None,
        }
    }

    pub fn with_condition(mut self, condition: Precondition) -> Self {
        self.condition = Some(condition);
        self
    }

    pub fn target(&self) -> ItemTarget {
        self.item.target()
    }

    /// Hash the item will have once the modification is applied.
    pub fn resulting_hash(&self) -> Option<&ContentHash> {
        match self.kind {
            ModificationKind::Remove => None,
            ModificationKind::Add | ModificationKind::Modify => self.item.hash(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        let target = self.target();
        target.validate()?;
        if let Some(condition) = &self.condition {
            condition
                .target()
                .validate()
                .with_context(|| format!("invalid condition on {target}"))?;
        }

        match self.kind {
            ModificationKind::Add => {
                if self.existing_hash.is_some() {
                    return Err(anyhow!("add of {target} must not declare an existing hash"));
                }
                if self.item.hash().is_none() {
                    return Err(anyhow!("add of {target} must declare the new content hash"));
                }
            }
            ModificationKind::Modify => {
                if self.existing_hash.is_none() || self.item.hash().is_none() {
                    return Err(anyhow!(
                        "modify of {target} must declare both the existing and new content hash"
                    ));
                }
            }
            ModificationKind::Remove => {
                if self.existing_hash.is_none() {
                    return Err(anyhow!("remove of {target} must declare the existing hash"));
                }
                if self.item.hash().is_some() {
                    return Err(anyhow!("remove of {target} must not declare a new content hash"));
                }
            }
        }
        Ok(())
    }
}
