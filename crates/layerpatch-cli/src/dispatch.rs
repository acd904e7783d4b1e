use std::env;
use std::ffi::OsString;
use std::io;
use std::path::PathBuf;

use anyhow::{Context, Result};
use layerpatch_installer::{PatchError, PatchErrorKind, PatchTool, RollbackMode};
use semver::Version;
use tracing::debug;

use crate::completion::write_completions_script;
use crate::render::{
    current_output_style, format_check_lines, format_history_lines, format_identity_lines,
    format_result_lines, render_status_line,
};
use crate::{Cli, Commands, HOME_ENV};

pub(crate) const EXIT_FAILURE: u8 = 1;
pub(crate) const EXIT_CONFLICT: u8 = 2;
pub(crate) const EXIT_VERSION_MISMATCH: u8 = 3;
pub(crate) const EXIT_NOT_FOUND: u8 = 4;
pub(crate) const EXIT_IO_FAILURE: u8 = 5;

pub(crate) fn run_cli(cli: Cli) -> Result<()> {
    let style = current_output_style();

    if let Commands::Completions { shell } = cli.command {
        let mut stdout = io::stdout().lock();
        return write_completions_script(shell, &mut stdout);
    }

    let root = resolve_root(cli.root, env::var_os(HOME_ENV))?;
    debug!(root = %root.display(), "resolved installation root");
    let tool = PatchTool::open(root)?;

    match cli.command {
        Commands::Init { name, version } => {
            let version = Version::parse(&version)
                .with_context(|| format!("invalid installation version '{version}'"))?;
            let identity = tool.initialize(&name, version)?;
            println!(
                "{}",
                render_status_line(
                    style,
                    "ok",
                    &format!(
                        "initialized {} {} ({} layer(s))",
                        identity.name,
                        identity.version,
                        identity.layers.len()
                    ),
                )
            );
        }
        Commands::Apply { patch_dir, policy } => {
            let mut result = tool.apply_patch(&patch_dir, policy.into())?;
            result.commit()?;
            print_lines(&format_result_lines(&result, style));
        }
        Commands::Check { patch_dir, policy } => {
            let report = tool.check_patch(&patch_dir, policy.into())?;
            print_lines(&format_check_lines(&report, style));
            if report.has_conflicts() {
                return Err(PatchError::ContentConflict {
                    patch_id: report.patch_id.clone(),
                    conflicts: report.conflicts(),
                }
                .into());
            }
        }
        Commands::Rollback {
            patch_id,
            to,
            policy,
        } => {
            let mode = if to {
                RollbackMode::To
            } else {
                RollbackMode::Single
            };
            let mut result = tool.rollback(&patch_id, mode, policy.into())?;
            result.commit()?;
            print_lines(&format_result_lines(&result, style));
        }
        Commands::History => {
            let history = tool.list_history()?;
            print_lines(&format_history_lines(&history, style));
        }
        Commands::Info {
            module,
            layer,
            slot,
        } => {
            let identity = tool.identity()?;
            print_lines(&format_identity_lines(&identity, style));
            if let Some(module) = module {
                match tool.module_path(&layer, &module, &slot)? {
                    Some(path) => println!("module {module}:{slot} -> {}", path.display()),
                    None => println!("module {module}:{slot} is absent from layer '{layer}'"),
                }
            }
        }
        Commands::Recover => match tool.recover()? {
            Some(txid) => println!(
                "{}",
                render_status_line(style, "ok", &format!("recovered transaction {txid}"))
            ),
            None => println!(
                "{}",
                render_status_line(style, "info", "no interrupted transaction")
            ),
        },
        Commands::Completions { .. } => {}
    }

    Ok(())
}

/// `--root` wins, then `$LAYERPATCH_HOME`, then the working directory.
pub(crate) fn resolve_root(explicit: Option<PathBuf>, home: Option<OsString>) -> Result<PathBuf> {
    if let Some(root) = explicit {
        return Ok(root);
    }
    if let Some(home) = home.filter(|value| !value.is_empty()) {
        return Ok(PathBuf::from(home));
    }
    env::current_dir().context("failed to determine current directory")
}

pub(crate) fn exit_code_for(err: &anyhow::Error) -> u8 {
    let Some(patch_error) = err.downcast_ref::<PatchError>() else {
        return EXIT_FAILURE;
    };
    match patch_error.kind() {
        PatchErrorKind::ContentConflict => EXIT_CONFLICT,
        PatchErrorKind::VersionMismatch => EXIT_VERSION_MISMATCH,
        PatchErrorKind::NotFound => EXIT_NOT_FOUND,
        PatchErrorKind::IoFailure => EXIT_IO_FAILURE,
        PatchErrorKind::AlreadyApplied
        | PatchErrorKind::MissingHistory
        | PatchErrorKind::Structural => EXIT_FAILURE,
    }
}

fn print_lines(lines: &[String]) {
    for line in lines {
        println!("{line}");
    }
}
