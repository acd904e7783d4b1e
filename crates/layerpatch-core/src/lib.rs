mod descriptor;
mod hash;
mod item;
mod modification;

pub use descriptor::{
    payload_path, validate_identifier, PatchDescriptor, PatchElement, PatchKind,
    DESCRIPTOR_FILE_NAME,
};
pub use hash::ContentHash;
pub use item::{
    ContentItem, ItemTarget, MiscItem, ModuleItem, DEFAULT_SLOT, MODULES_DIR_NAME, STATE_DIR_NAME,
};
pub use modification::{ContentModification, ModificationKind, Precondition};

#[cfg(test)]
mod tests;
