use std::ffi::OsString;
use std::path::PathBuf;

use clap::Parser;
use layerpatch_installer::{
    ContentVerificationPolicy, PatchError, PatchSummary, PatchTool, RollbackMode,
};
use layerpatch_core::PatchKind;
use semver::Version;

use super::*;
use crate::completion::write_completions_script;
use crate::dispatch::{
    exit_code_for, resolve_root, run_cli, EXIT_CONFLICT, EXIT_FAILURE, EXIT_IO_FAILURE,
    EXIT_NOT_FOUND, EXIT_VERSION_MISMATCH,
};
use crate::render::{
    format_error_lines, format_history_lines, output_style_for, render_status_line, OutputStyle,
};

fn parse(args: &[&str]) -> Cli {
    Cli::try_parse_from(args).expect("arguments must parse")
}

#[test]
fn rollback_parses_mode_and_policy() {
    let cli = parse(&[
        "layerpatch",
        "--root",
        "/srv/app",
        "rollback",
        "P1",
        "--to",
        "--policy",
        "override-all",
    ]);
    assert_eq!(cli.root, Some(PathBuf::from("/srv/app")));
    match cli.command {
        Commands::Rollback {
            patch_id,
            to,
            policy,
        } => {
            assert_eq!(patch_id, "P1");
            assert!(to);
            assert_eq!(
                ContentVerificationPolicy::from(policy),
                ContentVerificationPolicy::OverrideAll
            );
        }
        other => panic!("unexpected command: {other:?}"),
    }
}

#[test]
fn apply_defaults_to_strict_policy() {
    let cli = parse(&["layerpatch", "apply", "patches/P1"]);
    match cli.command {
        Commands::Apply { patch_dir, policy } => {
            assert_eq!(patch_dir, PathBuf::from("patches/P1"));
            assert_eq!(policy, CliPolicy::Strict);
        }
        other => panic!("unexpected command: {other:?}"),
    }
}

#[test]
fn unknown_policy_is_rejected() {
    assert!(Cli::try_parse_from(["layerpatch", "check", "p", "--policy", "lenient"]).is_err());
}

#[test]
fn info_defaults_to_base_layer_and_main_slot() {
    let cli = parse(&["layerpatch", "info", "org.acme.auth"]);
    match cli.command {
        Commands::Info {
            module,
            layer,
            slot,
        } => {
            assert_eq!(module.as_deref(), Some("org.acme.auth"));
            assert_eq!(layer, "base");
            assert_eq!(slot, "main");
        }
        other => panic!("unexpected command: {other:?}"),
    }
}

#[test]
fn root_resolution_prefers_flag_then_env() {
    let explicit = resolve_root(
        Some(PathBuf::from("/flag")),
        Some(OsString::from("/env")),
    )
    .expect("root must resolve");
    assert_eq!(explicit, PathBuf::from("/flag"));

    let from_env = resolve_root(None, Some(OsString::from("/env"))).expect("root must resolve");
    assert_eq!(from_env, PathBuf::from("/env"));

    let fallback = resolve_root(None, Some(OsString::new())).expect("root must resolve");
    assert_eq!(
        fallback,
        std::env::current_dir().expect("current dir must resolve")
    );
}

#[test]
fn exit_codes_follow_error_kind() {
    let conflict = anyhow::Error::new(PatchError::ContentConflict {
        patch_id: "P2".to_string(),
        conflicts: Vec::new(),
    });
    assert_eq!(exit_code_for(&conflict), EXIT_CONFLICT);

    let mismatch = anyhow::Error::new(PatchError::VersionMismatch {
        patch_id: "P2".to_string(),
        expected_identity: "acme-server".to_string(),
        expected_version: Version::new(1, 0, 1),
        installed_identity: "acme-server".to_string(),
        installed_version: Version::new(1, 0, 0),
    });
    assert_eq!(exit_code_for(&mismatch), EXIT_VERSION_MISMATCH);

    let missing = anyhow::Error::new(PatchError::NotFound {
        what: "applied patch 'P9'".to_string(),
    });
    assert_eq!(exit_code_for(&missing), EXIT_NOT_FOUND);

    let io_failure = anyhow::Error::new(PatchError::Io {
        phase: layerpatch_installer::Phase::Mutating,
        subject: "misc bin/run.sh".to_string(),
        source: std::io::Error::other("disk full"),
    });
    assert_eq!(exit_code_for(&io_failure), EXIT_IO_FAILURE);

    let structural = anyhow::Error::new(PatchError::StackOrder {
        requested: "P1".to_string(),
        newest: "P2".to_string(),
    });
    assert_eq!(exit_code_for(&structural), EXIT_FAILURE);
    assert_eq!(exit_code_for(&anyhow::anyhow!("bad input")), EXIT_FAILURE);
}

#[test]
fn output_style_requires_terminal_without_no_color() {
    assert_eq!(output_style_for(true, false), OutputStyle::Rich);
    assert_eq!(output_style_for(true, true), OutputStyle::Plain);
    assert_eq!(output_style_for(false, false), OutputStyle::Plain);
}

#[test]
fn render_status_line_plain_is_unadorned() {
    assert_eq!(
        render_status_line(OutputStyle::Plain, "ok", "applied P1 (1.0.0 -> 1.0.1)"),
        "applied P1 (1.0.0 -> 1.0.1)"
    );
}

#[test]
fn render_status_line_rich_includes_ascii_badge() {
    assert_eq!(
        render_status_line(OutputStyle::Rich, "ok", "applied P1 (1.0.0 -> 1.0.1)"),
        "[OK] applied P1 (1.0.0 -> 1.0.1)"
    );
    assert_eq!(
        render_status_line(OutputStyle::Rich, "err", "installation is locked"),
        "[ERR] installation is locked"
    );
}

#[test]
fn history_lines_list_patches_in_order() {
    assert_eq!(
        format_history_lines(&[], OutputStyle::Plain),
        vec!["no patches applied".to_string()]
    );

    let history = vec![
        PatchSummary {
            id: "P1".to_string(),
            kind: PatchKind::OneOff,
            description: "auth fix".to_string(),
            version_before: Version::new(1, 0, 0),
            version_after: Version::new(1, 0, 1),
            applied_at_unix: 10,
            history_available: true,
        },
        PatchSummary {
            id: "P2".to_string(),
            kind: PatchKind::Cumulative,
            description: String::new(),
            version_before: Version::new(1, 0, 1),
            version_after: Version::new(1, 1, 0),
            applied_at_unix: 20,
            history_available: false,
        },
    ];
    assert_eq!(
        format_history_lines(&history, OutputStyle::Plain),
        vec![
            "P1 one-off 1.0.0 -> 1.0.1 applied_at_unix=10 rollback=ok - auth fix".to_string(),
            "P2 cumulative 1.0.1 -> 1.1.0 applied_at_unix=20 rollback=unavailable".to_string(),
        ]
    );
}

#[test]
fn conflict_errors_render_one_line_per_item() {
    let err = anyhow::Error::new(PatchError::ContentConflict {
        patch_id: "P2".to_string(),
        conflicts: vec![layerpatch_installer::Conflict {
            target: layerpatch_core::ItemTarget::misc("auth.conf", ["bin"]),
            layer: None,
            expected: None,
            actual: None,
        }],
    });
    let lines = format_error_lines(&err, OutputStyle::Plain);
    assert_eq!(lines.len(), 3);
    assert_eq!(
        lines[0],
        "patch 'P2' conflicts with installed content (1 item(s))"
    );
    assert!(lines[1].contains("misc bin/auth.conf"));
}

#[test]
fn completions_script_names_the_binary() {
    let mut output = Vec::new();
    write_completions_script(completion::CliCompletionShell::Bash, &mut output)
        .expect("completions must render");
    let script = String::from_utf8(output).expect("script must be utf-8");
    assert!(script.contains("layerpatch"));
}

#[test]
fn run_cli_initializes_and_reports_missing_patches() {
    let temp = tempfile::tempdir().expect("must create temp dir");
    let root = temp.path().to_string_lossy().into_owned();

    run_cli(parse(&["layerpatch", "--root", &root, "init", "acme-server", "1.0.0"]))
        .expect("init must succeed");
    let identity = PatchTool::open(temp.path())
        .expect("must open installation")
        .identity()
        .expect("identity must load");
    assert_eq!(identity.version, Version::new(1, 0, 0));

    run_cli(parse(&["layerpatch", "--root", &root, "history"])).expect("history must list");
    run_cli(parse(&["layerpatch", "--root", &root, "recover"])).expect("recover must run");

    let err = run_cli(parse(&["layerpatch", "--root", &root, "rollback", "P1"]))
        .expect_err("nothing is applied");
    assert_eq!(exit_code_for(&err), EXIT_NOT_FOUND);

    let err = PatchTool::open(temp.path())
        .expect("must open installation")
        .rollback("P1", RollbackMode::To, ContentVerificationPolicy::Strict)
        .expect_err("nothing is applied");
    assert!(matches!(err, PatchError::NotFound { .. }));

    let err = run_cli(parse(&["layerpatch", "--root", &root, "init", "acme-server", "1.0.0"]))
        .expect_err("second init must fail");
    assert_eq!(exit_code_for(&err), EXIT_FAILURE);
}
