mod apply;
mod config;
mod error;
mod fs_utils;
mod history;
mod identity;
mod layout;
mod lock;
mod overlay;
mod result;
mod rollback;
mod tool;
mod transactions;
mod verification;

pub use config::{ConfigurationDirs, LockConfig, PatchToolConfig, RollbackConfig};
pub use error::{Conflict, PatchError, PatchErrorKind, Phase};
pub use history::{
    ElementRecord, HistoryManifest, HistoryRecord, HistoryStore, HISTORY_FORMAT_VERSION,
    HISTORY_MANIFEST_FILE,
};
pub use identity::{
    read_identity, AppliedPatch, InstalledIdentity, LayerState, IDENTITY_FORMAT_VERSION,
};
pub use layout::{InstallationLayout, ABSENT_MARKER, OVERLAYS_DIR_NAME, STATE_DIR_NAME};
pub use lock::InstallationLock;
pub use overlay::{OverlayChain, Resolution};
pub use result::{AppliedModification, PatchOperation, PatchingResult, ResultState};
pub use rollback::RollbackMode;
pub use tool::{PatchSummary, PatchTool};
pub use transactions::{
    current_unix_timestamp, read_active_transaction, read_transaction_journal,
    read_transaction_metadata, JournalStep, TransactionJournalEntry, TransactionMetadata,
    TransactionOperation,
};
pub use verification::{
    classify, CheckReport, CheckedModification, Classification, ContentVerificationPolicy,
    Outcome, Scope,
};
