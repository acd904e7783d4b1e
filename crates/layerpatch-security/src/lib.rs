mod checksum;
mod tree;

pub use checksum::sha256_hex;
pub use tree::{hash_path, hash_tree};
