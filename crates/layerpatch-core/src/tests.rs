use std::path::{Path, PathBuf};

use semver::Version;

use super::*;

const H0: &str = "1111111111111111111111111111111111111111111111111111111111111111";
const H1: &str = "2222222222222222222222222222222222222222222222222222222222222222";

fn hash(value: &str) -> ContentHash {
    ContentHash::parse(value).expect("valid hash")
}

#[test]
fn parse_descriptor() {
    let content = format!(
        r#"
id = "P1"
description = "Fix auth session leak"
kind = "one-off"
identity = "acme-server"
applies_to = "1.0.0"
resulting_version = "1.0.1"

[[modifications]]
kind = "add"
item = {{ type = "misc", name = "README-P1.txt", path = ["docs"], hash = "{H1}" }}

[[elements]]
id = "P1-base"
layer = "base"

[[elements.modifications]]
kind = "modify"
existing_hash = "{H0}"
item = {{ type = "module", name = "org.acme.auth", hash = "{H1}" }}
condition = {{ present = {{ type = "module", name = "org.acme.core" }} }}
"#
    );

    let parsed = PatchDescriptor::from_toml_str(&content).expect("descriptor should parse");
    assert_eq!(parsed.id, "P1");
    assert_eq!(parsed.kind, PatchKind::OneOff);
    assert_eq!(parsed.applies_to, Version::new(1, 0, 0));
    assert_eq!(parsed.resulting_version, Version::new(1, 0, 1));
    assert_eq!(parsed.modification_count(), 2);

    let root = &parsed.modifications[0];
    assert_eq!(root.kind, ModificationKind::Add);
    assert_eq!(root.target(), ItemTarget::misc("README-P1.txt", ["docs"]));

    let element = &parsed.elements[0];
    assert_eq!(element.layer, "base");
    assert!(!element.add_on);
    let module = &element.modifications[0];
    assert_eq!(module.kind, ModificationKind::Modify);
    assert_eq!(module.existing_hash, Some(hash(H0)));
    assert_eq!(
        module.item,
        ContentItem::Module(ModuleItem::new("org.acme.auth", DEFAULT_SLOT, Some(hash(H1))))
    );
    assert_eq!(
        module.condition,
        Some(Precondition::Present(ItemTarget::module(
            "org.acme.core",
            DEFAULT_SLOT
        )))
    );
}

#[test]
fn descriptor_rejects_add_with_existing_hash() {
    let content = format!(
        r#"
id = "P1"
kind = "one-off"
identity = "acme-server"
applies_to = "1.0.0"
resulting_version = "1.0.1"

[[modifications]]
kind = "add"
existing_hash = "{H0}"
item = {{ type = "misc", name = "run.sh", path = ["bin"], hash = "{H1}" }}
"#
    );

    let err = PatchDescriptor::from_toml_str(&content).expect_err("must reject");
    assert!(format!("{err:#}").contains("must not declare an existing hash"));
}

#[test]
fn descriptor_rejects_remove_with_new_hash() {
    let content = format!(
        r#"
id = "P1"
kind = "one-off"
identity = "acme-server"
applies_to = "1.0.0"
resulting_version = "1.0.1"

[[elements]]
id = "P1-base"
layer = "base"

[[elements.modifications]]
kind = "remove"
existing_hash = "{H0}"
item = {{ type = "module", name = "org.acme.auth", hash = "{H1}" }}
"#
    );

    let err = PatchDescriptor::from_toml_str(&content).expect_err("must reject");
    assert!(format!("{err:#}").contains("must not declare a new content hash"));
}

fn root_misc_patch(kind: &str, existing: Option<&str>, name: &str, path: &[&str]) -> String {
    let existing = existing
        .map(|value| format!("existing_hash = \"{value}\"\n"))
        .unwrap_or_default();
    let path = path
        .iter()
        .map(|segment| format!("\"{segment}\""))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        r#"
id = "P1"
kind = "one-off"
identity = "acme-server"
applies_to = "1.0.0"
resulting_version = "1.0.1"

[[modifications]]
kind = "{kind}"
{existing}item = {{ type = "misc", name = "{name}", path = [{path}], hash = "{H1}" }}
"#
    )
}

#[test]
fn descriptor_rejects_misc_items_inside_layer_content() {
    let content = root_misc_patch(
        "modify",
        Some(H0),
        "module.jar",
        &["modules", "system", "layers", "base", "org", "acme", "auth", "main"],
    );
    let err = PatchDescriptor::from_toml_str(&content).expect_err("must reject");
    assert!(format!("{err:#}").contains("reserved directory 'modules'"));

    let content = root_misc_patch("add", None, "modules", &[]);
    let err = PatchDescriptor::from_toml_str(&content).expect_err("must reject");
    assert!(format!("{err:#}").contains("reserved directory 'modules'"));
}

#[test]
fn descriptor_rejects_misc_items_inside_state_dir() {
    let content = root_misc_patch("add", None, "lock", &[".layerpatch"]);
    let err = PatchDescriptor::from_toml_str(&content).expect_err("must reject");
    assert!(format!("{err:#}").contains("reserved directory '.layerpatch'"));

    let nested = root_misc_patch("add", None, "identity.json", &["bin", ".layerpatch"]);
    PatchDescriptor::from_toml_str(&nested).expect("only the top-level name is reserved");
}

#[test]
fn descriptor_rejects_modules_at_root_and_misc_in_elements() {
    let root_module = format!(
        r#"
id = "P1"
kind = "one-off"
identity = "acme-server"
applies_to = "1.0.0"
resulting_version = "1.0.1"

[[modifications]]
kind = "add"
item = {{ type = "module", name = "org.acme.auth", hash = "{H1}" }}
"#
    );
    assert!(PatchDescriptor::from_toml_str(&root_module).is_err());

    let element_misc = format!(
        r#"
id = "P1"
kind = "one-off"
identity = "acme-server"
applies_to = "1.0.0"
resulting_version = "1.0.1"

[[elements]]
id = "P1-base"
layer = "base"

[[elements.modifications]]
kind = "add"
item = {{ type = "misc", name = "run.sh", hash = "{H1}" }}
"#
    );
    assert!(PatchDescriptor::from_toml_str(&element_misc).is_err());
}

#[test]
fn descriptor_rejects_duplicate_targets_and_elements() {
    let duplicate_target = format!(
        r#"
id = "P1"
kind = "one-off"
identity = "acme-server"
applies_to = "1.0.0"
resulting_version = "1.0.1"

[[modifications]]
kind = "add"
item = {{ type = "misc", name = "run.sh", path = ["bin"], hash = "{H1}" }}

[[modifications]]
kind = "modify"
existing_hash = "{H0}"
item = {{ type = "misc", name = "run.sh", path = ["bin"], hash = "{H1}" }}
"#
    );
    let err = PatchDescriptor::from_toml_str(&duplicate_target).expect_err("must reject");
    assert!(format!("{err:#}").contains("duplicate modification"));

    let duplicate_layer = r#"
id = "P1"
kind = "one-off"
identity = "acme-server"
applies_to = "1.0.0"
resulting_version = "1.0.1"

[[elements]]
id = "P1-a"
layer = "base"

[[elements]]
id = "P1-b"
layer = "base"
"#;
    let err = PatchDescriptor::from_toml_str(duplicate_layer).expect_err("must reject");
    assert!(format!("{err:#}").contains("more than one element"));
}

#[test]
fn descriptor_rejects_unsafe_identifiers() {
    for id in ["", "..", ".hidden", "a/b", "p 1"] {
        assert!(validate_identifier("patch id", id).is_err(), "{id:?}");
    }
    for id in ["P1", "cp-1.1.0", "one_off.2"] {
        assert!(validate_identifier("patch id", id).is_ok(), "{id:?}");
    }
}

#[test]
fn content_hash_normalizes_and_validates() {
    let upper = H1.to_ascii_uppercase();
    assert_eq!(hash(&upper).as_str(), H1);
    assert_eq!(hash(H1).short(), "222222222222");
    assert!(ContentHash::parse("abc").is_err());
    assert!(ContentHash::parse(&"z".repeat(64)).is_err());
}

#[test]
fn content_hash_of_path_matches_bytes() {
    let dir = tempfile::tempdir().expect("must create temp dir");
    let file = dir.path().join("standalone.sh");
    std::fs::write(&file, b"exec java").expect("must write file");

    let hashed = ContentHash::of_path(&file)
        .expect("must hash")
        .expect("file exists");
    assert_eq!(hashed, ContentHash::of_bytes(b"exec java"));
    assert!(ContentHash::of_path(&dir.path().join("missing"))
        .expect("must hash")
        .is_none());
}

#[test]
fn target_identity_ignores_content_hash() {
    let before = ContentItem::Module(ModuleItem::new("org.acme.auth", "main", Some(hash(H0))));
    let after = ContentItem::Module(ModuleItem::new("org.acme.auth", "main", Some(hash(H1))));
    let other_slot = ContentItem::Module(ModuleItem::new("org.acme.auth", "v2", Some(hash(H0))));
    let misc = ContentItem::Misc(MiscItem::new("auth", Vec::<String>::new(), Some(hash(H0))));

    assert_eq!(before.target(), after.target());
    assert_ne!(before.target(), other_slot.target());
    assert_ne!(before.target(), misc.target());
}

#[test]
fn target_relative_paths() {
    assert_eq!(
        ItemTarget::module("org.acme.auth", "main").relative_path(),
        PathBuf::from("org").join("acme").join("auth").join("main")
    );
    assert_eq!(
        ItemTarget::misc("run.sh", ["bin"]).relative_path(),
        PathBuf::from("bin").join("run.sh")
    );
    assert_eq!(
        payload_path(
            Path::new("/patches/P1"),
            "P1-base",
            &ItemTarget::module("auth", "main")
        ),
        Path::new("/patches/P1")
            .join("P1-base")
            .join("modules")
            .join("auth")
            .join("main")
    );
}

#[test]
fn target_display_is_human_readable() {
    assert_eq!(
        ItemTarget::module("org.acme.auth", "main").to_string(),
        "module org.acme.auth:main"
    );
    assert_eq!(
        ItemTarget::misc("run.sh", ["bin"]).to_string(),
        "misc bin/run.sh"
    );
}

#[test]
fn modification_resulting_hash_follows_kind() {
    let added = ContentModification::add(ContentItem::Misc(MiscItem::new(
        "run.sh",
        ["bin"],
        Some(hash(H1)),
    )));
    assert_eq!(added.resulting_hash(), Some(&hash(H1)));

    let removed = ContentModification::remove(
        ContentItem::Misc(MiscItem::new("run.sh", ["bin"], None)),
        hash(H0),
    );
    assert!(removed.resulting_hash().is_none());
    assert!(removed.validate().is_ok());
}
