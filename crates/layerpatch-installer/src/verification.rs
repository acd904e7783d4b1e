use std::fmt;
use std::str::FromStr;

use anyhow::anyhow;
use layerpatch_core::{
    ContentHash, ContentModification, ItemTarget, PatchDescriptor, Precondition,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{io_error, Conflict, Phase, PatchError};
use crate::identity::InstalledIdentity;
use crate::layout::InstallationLayout;
use crate::overlay::OverlayChain;

/// How mismatches between expected and actual pre-patch content are resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ContentVerificationPolicy {
    #[default]
    Strict,
    OverrideAll,
    PreserveAll,
}

impl ContentVerificationPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Strict => "strict",
            Self::OverrideAll => "override-all",
            Self::PreserveAll => "preserve-all",
        }
    }
}

impl fmt::Display for ContentVerificationPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContentVerificationPolicy {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "strict" => Ok(Self::Strict),
            "override-all" | "override" => Ok(Self::OverrideAll),
            "preserve-all" | "preserve" => Ok(Self::PreserveAll),
            other => Err(anyhow!(
                "unknown verification policy '{other}'; expected strict, override-all or preserve-all"
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Apply,
    Skip,
    Conflict,
}

/// What finally happened to a modification, as recorded in history manifests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Applied,
    Skipped,
    Overridden,
}

impl Outcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Applied => "applied",
            Self::Skipped => "skipped",
            Self::Overridden => "overridden",
        }
    }

    pub fn mutated(self) -> bool {
        !matches!(self, Self::Skipped)
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn classify(
    expected: Option<&ContentHash>,
    current: Option<&ContentHash>,
    policy: ContentVerificationPolicy,
) -> Classification {
    if expected == current {
        return Classification::Apply;
    }
    match policy {
        ContentVerificationPolicy::Strict => Classification::Conflict,
        ContentVerificationPolicy::OverrideAll => Classification::Apply,
        ContentVerificationPolicy::PreserveAll => Classification::Skip,
    }
}

/// Where a modification lives inside a patch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    Root,
    Element {
        element_id: String,
        layer: String,
        add_on: bool,
    },
}

impl Scope {
    pub fn layer(&self) -> Option<&str> {
        match self {
            Self::Root => None,
            Self::Element { layer, .. } => Some(layer),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckedModification {
    pub scope: Scope,
    pub modification: ContentModification,
    pub current: Option<ContentHash>,
    pub classification: Classification,
}

impl CheckedModification {
    pub fn target(&self) -> ItemTarget {
        self.modification.target()
    }

    pub fn matched_expectation(&self) -> bool {
        self.modification.existing_hash == self.current
    }

    pub fn outcome(&self) -> Option<Outcome> {
        match self.classification {
            Classification::Apply if self.matched_expectation() => Some(Outcome::Applied),
            Classification::Apply => Some(Outcome::Overridden),
            Classification::Skip => Some(Outcome::Skipped),
            Classification::Conflict => None,
        }
    }
}

/// Result of the side-effect free check pass over a whole patch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckReport {
    pub patch_id: String,
    pub policy: ContentVerificationPolicy,
    pub checked: Vec<CheckedModification>,
    /// Modifications dropped because their precondition did not hold.
    pub omitted: Vec<(Scope, ItemTarget)>,
}

impl CheckReport {
    pub fn conflicts(&self) -> Vec<Conflict> {
        self.checked
            .iter()
            .filter(|checked| checked.classification == Classification::Conflict)
            .map(|checked| Conflict {
                target: checked.target(),
                layer: checked.scope.layer().map(str::to_string),
                expected: checked.modification.existing_hash.clone(),
                actual: checked.current.clone(),
            })
            .collect()
    }

    pub fn has_conflicts(&self) -> bool {
        self.checked
            .iter()
            .any(|checked| checked.classification == Classification::Conflict)
    }

    pub fn count(&self, outcome: Outcome) -> usize {
        self.checked
            .iter()
            .filter(|checked| checked.outcome() == Some(outcome))
            .count()
    }
}

/// Classifies every modification of `descriptor` against the effective
/// content of the installation. Reads only.
pub(crate) fn check_patch(
    layout: &InstallationLayout,
    identity: &InstalledIdentity,
    descriptor: &PatchDescriptor,
    policy: ContentVerificationPolicy,
) -> Result<CheckReport, PatchError> {
    let mut report = CheckReport {
        patch_id: descriptor.id.clone(),
        policy,
        checked: Vec::with_capacity(descriptor.modification_count()),
        omitted: Vec::new(),
    };

    for modification in &descriptor.modifications {
        check_one(layout, None, Scope::Root, modification, policy, &mut report)?;
    }

    for element in &descriptor.elements {
        let chain = identity
            .overlay_chain(layout, &element.layer)
            .ok_or_else(|| PatchError::not_found(format!("layer '{}'", element.layer)))?;
        let scope = Scope::Element {
            element_id: element.id.clone(),
            layer: element.layer.clone(),
            add_on: element.add_on,
        };
        for modification in &element.modifications {
            check_one(
                layout,
                Some(&chain),
                scope.clone(),
                modification,
                policy,
                &mut report,
            )?;
        }
    }

    Ok(report)
}

fn check_one(
    layout: &InstallationLayout,
    chain: Option<&OverlayChain>,
    scope: Scope,
    modification: &ContentModification,
    policy: ContentVerificationPolicy,
    report: &mut CheckReport,
) -> Result<(), PatchError> {
    let target = modification.target();
    if let Some(condition) = &modification.condition {
        if !precondition_holds(layout, chain, condition) {
            debug!(%target, "precondition not met; omitting modification");
            report.omitted.push((scope, target));
            return Ok(());
        }
    }

    let current = current_hash(layout, chain, &target)?;
    let classification = classify(modification.existing_hash.as_ref(), current.as_ref(), policy);
    debug!(%target, ?classification, "classified modification");
    report.checked.push(CheckedModification {
        scope,
        modification: modification.clone(),
        current,
        classification,
    });
    Ok(())
}

fn precondition_holds(
    layout: &InstallationLayout,
    chain: Option<&OverlayChain>,
    condition: &Precondition,
) -> bool {
    match condition {
        Precondition::Present(target) => match (target.is_module(), chain) {
            (true, Some(chain)) => chain.effective_path(&target.relative_path()).is_some(),
            (true, None) => false,
            (false, _) => layout.misc_path(target).exists(),
        },
    }
}

pub(crate) fn current_hash(
    layout: &InstallationLayout,
    chain: Option<&OverlayChain>,
    target: &ItemTarget,
) -> Result<Option<ContentHash>, PatchError> {
    let hashed = match (target.is_module(), chain) {
        (true, Some(chain)) => chain.effective_hash(&target.relative_path()),
        (true, None) => Ok(None),
        (false, _) => ContentHash::of_path(&layout.misc_path(target)),
    };
    hashed.map_err(io_error(Phase::Checking, target))
}
