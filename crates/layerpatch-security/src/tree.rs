use std::fs;
use std::io;
use std::path::{Component, Path};

use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::checksum::sha256_file;

/// Hashes a file or directory tree, returning `None` when nothing exists at `path`.
///
/// Files hash to the SHA-256 of their bytes. Directories hash to a digest over
/// every entry's relative path (with `/` separators) and, for files, the digest
/// of the file's bytes, visited in file-name order so the result does not depend
/// on the platform's directory iteration order.
pub fn hash_path(path: &Path) -> io::Result<Option<String>> {
    let metadata = match fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err),
    };

    if metadata.is_dir() {
        hash_tree(path).map(Some)
    } else {
        sha256_file(path).map(Some)
    }
}

pub fn hash_tree(root: &Path) -> io::Result<String> {
    let mut hasher = Sha256::new();
    for entry in WalkDir::new(root)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name()
    {
        let entry = entry?;
        let relative = entry
            .path()
            .strip_prefix(root)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        let normalized = normalize_relative(relative);

        if entry.file_type().is_dir() {
            hasher.update(b"d ");
            hasher.update(normalized.as_bytes());
            hasher.update([0]);
            continue;
        }

        hasher.update(b"f ");
        hasher.update(normalized.as_bytes());
        hasher.update([0]);
        hasher.update(sha256_file(entry.path())?.as_bytes());
        hasher.update([0]);
    }
    Ok(hex::encode(hasher.finalize()))
}

fn normalize_relative(path: &Path) -> String {
    path.components()
        .filter_map(|component| match component {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sha256_hex;

    #[test]
    fn hash_path_returns_none_for_missing_path() {
        let dir = tempfile::tempdir().expect("must create temp dir");
        let hash = hash_path(&dir.path().join("missing")).expect("must hash");
        assert!(hash.is_none());
    }

    #[test]
    fn hash_path_of_file_is_plain_sha256() {
        let dir = tempfile::tempdir().expect("must create temp dir");
        let file = dir.path().join("run.sh");
        fs::write(&file, b"#!/bin/sh\n").expect("must write file");

        let hash = hash_path(&file).expect("must hash").expect("file exists");
        assert_eq!(hash, sha256_hex(b"#!/bin/sh\n"));
    }

    #[test]
    fn tree_hash_tracks_content_and_names() {
        let dir = tempfile::tempdir().expect("must create temp dir");
        let left = dir.path().join("left");
        let right = dir.path().join("right");
        for root in [&left, &right] {
            fs::create_dir_all(root.join("lib")).expect("must create lib dir");
            fs::write(root.join("module.xml"), b"<module/>").expect("must write descriptor");
            fs::write(root.join("lib").join("auth.jar"), b"jar-v1").expect("must write jar");
        }

        let first = hash_tree(&left).expect("must hash left");
        assert_eq!(first, hash_tree(&right).expect("must hash right"));

        fs::write(right.join("lib").join("auth.jar"), b"jar-v2").expect("must rewrite jar");
        assert_ne!(first, hash_tree(&right).expect("must rehash right"));

        fs::write(right.join("lib").join("auth.jar"), b"jar-v1").expect("must restore jar");
        fs::rename(right.join("lib"), right.join("libs")).expect("must rename dir");
        assert_ne!(first, hash_tree(&right).expect("must hash renamed tree"));
    }

    #[test]
    fn empty_directories_still_contribute_to_the_tree_hash() {
        let dir = tempfile::tempdir().expect("must create temp dir");
        let root = dir.path().join("module");
        fs::create_dir_all(&root).expect("must create module dir");
        let bare = hash_tree(&root).expect("must hash bare tree");

        fs::create_dir_all(root.join("empty")).expect("must create empty dir");
        assert_ne!(bare, hash_tree(&root).expect("must hash tree with empty dir"));
    }
}
