use std::fmt;
use std::io;
use std::path::PathBuf;

use layerpatch_core::{ContentHash, ItemTarget};
use semver::Version;
use thiserror::Error;

/// Stage of an apply or rollback in which an I/O failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Validating,
    Checking,
    BackingUp,
    Mutating,
    Committing,
    Discarding,
    Recovering,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Validating => "validating",
            Self::Checking => "checking",
            Self::BackingUp => "backing up",
            Self::Mutating => "mutating",
            Self::Committing => "committing",
            Self::Discarding => "discarding",
            Self::Recovering => "recovering",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One item whose on-disk content disagrees with what a patch expects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conflict {
    pub target: ItemTarget,
    pub layer: Option<String>,
    pub expected: Option<ContentHash>,
    pub actual: Option<ContentHash>,
}

impl fmt::Display for Conflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.target)?;
        if let Some(layer) = &self.layer {
            write!(f, " in layer '{layer}'")?;
        }
        write!(
            f,
            " (expected {}, found {})",
            describe_hash(self.expected.as_ref()),
            describe_hash(self.actual.as_ref())
        )
    }
}

fn describe_hash(hash: Option<&ContentHash>) -> &str {
    hash.map(ContentHash::short).unwrap_or("absent")
}

fn format_conflicts(conflicts: &[Conflict]) -> String {
    conflicts
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Error)]
pub enum PatchError {
    #[error(
        "patch '{patch_id}' applies to {expected_identity} {expected_version}, but the installation is {installed_identity} {installed_version}"
    )]
    VersionMismatch {
        patch_id: String,
        expected_identity: String,
        expected_version: Version,
        installed_identity: String,
        installed_version: Version,
    },

    #[error("patch '{patch_id}' is already applied")]
    AlreadyApplied { patch_id: String },

    #[error("patch '{patch_id}' conflicts with installed content: {}", format_conflicts(.conflicts))]
    ContentConflict {
        patch_id: String,
        conflicts: Vec<Conflict>,
    },

    #[error("history for patch '{patch_id}' is unusable: {reason}")]
    MissingHistory { patch_id: String, reason: String },

    #[error("cannot roll back '{requested}' while newer patch '{newest}' is applied")]
    StackOrder { requested: String, newest: String },

    #[error("{what} not found")]
    NotFound { what: String },

    #[error("installation is locked by another process: {}", .path.display())]
    Locked { path: PathBuf },

    #[error("interrupted transaction '{txid}' must be recovered before patching again")]
    InterruptedTransaction { txid: String },

    #[error("invalid patch: {0}")]
    InvalidPatch(String),

    #[error("invalid installation state: {0}")]
    InvalidState(String),

    #[error("{phase} {subject} failed: {source}")]
    Io {
        phase: Phase,
        subject: String,
        #[source]
        source: io::Error,
    },
}

/// Flat classification of [`PatchError`] for callers that map errors to codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchErrorKind {
    VersionMismatch,
    AlreadyApplied,
    ContentConflict,
    MissingHistory,
    NotFound,
    IoFailure,
    Structural,
}

impl PatchError {
    pub fn kind(&self) -> PatchErrorKind {
        match self {
            Self::VersionMismatch { .. } => PatchErrorKind::VersionMismatch,
            Self::AlreadyApplied { .. } => PatchErrorKind::AlreadyApplied,
            Self::ContentConflict { .. } => PatchErrorKind::ContentConflict,
            Self::MissingHistory { .. } => PatchErrorKind::MissingHistory,
            Self::NotFound { .. } => PatchErrorKind::NotFound,
            Self::Io { .. } => PatchErrorKind::IoFailure,
            Self::StackOrder { .. }
            | Self::Locked { .. }
            | Self::InterruptedTransaction { .. }
            | Self::InvalidPatch(_)
            | Self::InvalidState(_) => PatchErrorKind::Structural,
        }
    }

    /// True when the error was raised before anything on disk changed, so the
    /// caller may retry (for example with a different verification policy).
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            Self::Io { .. } | Self::MissingHistory { .. } | Self::InvalidState(_)
        )
    }

    pub fn conflicts(&self) -> &[Conflict] {
        match self {
            Self::ContentConflict { conflicts, .. } => conflicts,
            _ => &[],
        }
    }

    pub(crate) fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }
}

/// Adapter for `map_err` that tags an I/O error with the phase and subject.
pub(crate) fn io_error(phase: Phase, subject: impl fmt::Display) -> impl FnOnce(io::Error) -> PatchError {
    let subject = subject.to_string();
    move |source| PatchError::Io {
        phase,
        subject,
        source,
    }
}
