mod completion;
mod dispatch;
mod render;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand, ValueEnum};
use layerpatch_core::DEFAULT_SLOT;
use layerpatch_installer::ContentVerificationPolicy;
use tracing_subscriber::EnvFilter;

use crate::completion::CliCompletionShell;
use crate::dispatch::{exit_code_for, run_cli};
use crate::render::{current_stderr_style, format_error_lines};

const LOG_ENV: &str = "LAYERPATCH_LOG";
const HOME_ENV: &str = "LAYERPATCH_HOME";

#[derive(Parser, Debug)]
#[command(name = "layerpatch")]
#[command(about = "Apply and roll back content patches on layered installations", long_about = None)]
struct Cli {
    /// Installation root; falls back to $LAYERPATCH_HOME, then the current directory.
    #[arg(long, global = true)]
    root: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Record the identity of an unpatched installation.
    Init { name: String, version: String },
    /// Apply an extracted patch directory and commit it.
    Apply {
        patch_dir: PathBuf,
        #[arg(long, value_enum, default_value_t = CliPolicy::Strict)]
        policy: CliPolicy,
    },
    /// Report how a patch would apply without changing anything.
    Check {
        patch_dir: PathBuf,
        #[arg(long, value_enum, default_value_t = CliPolicy::Strict)]
        policy: CliPolicy,
    },
    /// Roll back the newest patch, or everything down to a patch with --to.
    Rollback {
        patch_id: String,
        #[arg(long)]
        to: bool,
        #[arg(long, value_enum, default_value_t = CliPolicy::Strict)]
        policy: CliPolicy,
    },
    History,
    Info {
        /// Resolve the effective directory of this module.
        module: Option<String>,
        #[arg(long, default_value = "base")]
        layer: String,
        #[arg(long, default_value = DEFAULT_SLOT)]
        slot: String,
    },
    /// Finish a transaction left behind by an interrupted run.
    Recover,
    Completions {
        #[arg(value_enum)]
        shell: CliCompletionShell,
    },
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum CliPolicy {
    Strict,
    OverrideAll,
    PreserveAll,
}

impl From<CliPolicy> for ContentVerificationPolicy {
    fn from(value: CliPolicy) -> Self {
        match value {
            CliPolicy::Strict => Self::Strict,
            CliPolicy::OverrideAll => Self::OverrideAll,
            CliPolicy::PreserveAll => Self::PreserveAll,
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    match run_cli(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            for line in format_error_lines(&err, current_stderr_style()) {
                eprintln!("{line}");
            }
            ExitCode::from(exit_code_for(&err))
        }
    }
}

#[cfg(test)]
mod tests;
