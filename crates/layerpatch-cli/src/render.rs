use std::io::IsTerminal;

use anstyle::{AnsiColor, Effects, Style};
use layerpatch_installer::{
    CheckReport, InstalledIdentity, Outcome, PatchError, PatchOperation, PatchSummary,
    PatchingResult,
};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum OutputStyle {
    Plain,
    Rich,
}

pub(crate) fn current_output_style() -> OutputStyle {
    output_style_for(std::io::stdout().is_terminal(), no_color_requested())
}

pub(crate) fn current_stderr_style() -> OutputStyle {
    output_style_for(std::io::stderr().is_terminal(), no_color_requested())
}

fn no_color_requested() -> bool {
    std::env::var_os("NO_COLOR").is_some_and(|value| !value.is_empty())
}

pub(crate) fn output_style_for(is_terminal: bool, no_color: bool) -> OutputStyle {
    if is_terminal && !no_color {
        OutputStyle::Rich
    } else {
        OutputStyle::Plain
    }
}

fn status_badge(status: &str) -> &'static str {
    match status {
        "ok" => "[OK]",
        "warn" => "[WARN]",
        "err" => "[ERR]",
        "skip" => "[SKIP]",
        _ => "[..]",
    }
}

pub(crate) fn render_status_line(style: OutputStyle, status: &str, message: &str) -> String {
    match style {
        OutputStyle::Plain => message.to_string(),
        OutputStyle::Rich => format!("{} {message}", status_badge(status)),
    }
}

fn header_style() -> Style {
    Style::new()
        .fg_color(Some(AnsiColor::BrightBlue.into()))
        .effects(Effects::BOLD)
}

fn outcome_style(outcome: Outcome) -> Style {
    let color = match outcome {
        Outcome::Applied => AnsiColor::Green,
        Outcome::Overridden => AnsiColor::Yellow,
        Outcome::Skipped => AnsiColor::BrightBlack,
    };
    Style::new().fg_color(Some(color.into()))
}

fn conflict_style() -> Style {
    Style::new()
        .fg_color(Some(AnsiColor::Red.into()))
        .effects(Effects::BOLD)
}

fn colorize(style: Style, text: &str) -> String {
    format!("{}{}{}", style.render(), text, style.render_reset())
}

fn paint(output: OutputStyle, style: Style, text: &str) -> String {
    match output {
        OutputStyle::Plain => text.to_string(),
        OutputStyle::Rich => colorize(style, text),
    }
}

fn location(target: &impl std::fmt::Display, layer: Option<&str>) -> String {
    match layer {
        Some(layer) => format!("{target} [{layer}]"),
        None => target.to_string(),
    }
}

pub(crate) fn format_result_lines(result: &PatchingResult, style: OutputStyle) -> Vec<String> {
    let verb = match result.operation() {
        PatchOperation::Apply => "applied",
        PatchOperation::Rollback => "rolled back",
    };
    let mut lines = vec![render_status_line(
        style,
        "ok",
        &format!(
            "{verb} {} ({} -> {})",
            result.patch_ids().join(", "),
            result.identity_before().version,
            result.identity_after().version
        ),
    )];

    for modification in result.applied_modifications() {
        let outcome = format!("{:<10}", modification.outcome.as_str());
        lines.push(format!(
            "  {} {:<6} {}",
            paint(style, outcome_style(modification.outcome), &outcome),
            modification.kind.as_str(),
            location(&modification.target, modification.layer.as_deref())
        ));
    }

    lines.push(format!(
        "applied={} overridden={} skipped={}",
        result.count(Outcome::Applied),
        result.count(Outcome::Overridden),
        result.count(Outcome::Skipped)
    ));
    lines
}

pub(crate) fn format_check_lines(report: &CheckReport, style: OutputStyle) -> Vec<String> {
    let conflicts = report.conflicts().len();
    let status = if conflicts == 0 { "ok" } else { "err" };
    let mut lines = vec![render_status_line(
        style,
        status,
        &format!(
            "patch {} under {}: {} change(s), {} conflict(s), {} omitted",
            report.patch_id,
            report.policy,
            report.checked.len() - conflicts,
            conflicts,
            report.omitted.len()
        ),
    )];

    for checked in &report.checked {
        let label = match checked.outcome() {
            Some(outcome) => paint(
                style,
                outcome_style(outcome),
                &format!("{:<10}", outcome.as_str()),
            ),
            None => paint(style, conflict_style(), &format!("{:<10}", "conflict")),
        };
        lines.push(format!(
            "  {label} {:<6} {}",
            checked.modification.kind.as_str(),
            location(&checked.target(), checked.scope.layer())
        ));
    }
    for (scope, target) in &report.omitted {
        lines.push(format!(
            "  {:<10} {} (precondition not met)",
            "omitted",
            location(target, scope.layer())
        ));
    }
    lines
}

pub(crate) fn format_history_lines(history: &[PatchSummary], style: OutputStyle) -> Vec<String> {
    if history.is_empty() {
        return vec!["no patches applied".to_string()];
    }

    let mut lines = Vec::with_capacity(history.len() + 1);
    if style == OutputStyle::Rich {
        lines.push(colorize(header_style(), "== applied patches (oldest first) =="));
    }
    for summary in history {
        let rollback = if summary.history_available {
            "rollback=ok"
        } else {
            "rollback=unavailable"
        };
        let mut line = format!(
            "{} {} {} -> {} applied_at_unix={} {rollback}",
            summary.id,
            summary.kind,
            summary.version_before,
            summary.version_after,
            summary.applied_at_unix
        );
        if !summary.description.is_empty() {
            line.push_str(&format!(" - {}", summary.description));
        }
        lines.push(line);
    }
    lines
}

pub(crate) fn format_identity_lines(identity: &InstalledIdentity, style: OutputStyle) -> Vec<String> {
    let mut lines = Vec::new();
    if style == OutputStyle::Rich {
        lines.push(colorize(header_style(), "== installation =="));
    }
    lines.push(format!("identity: {}", identity.name));
    lines.push(format!("version: {}", identity.version));
    lines.push(format!("base version: {}", identity.base_version));
    let applied = identity.applied_ids();
    lines.push(format!(
        "applied: {}",
        if applied.is_empty() {
            "none".to_string()
        } else {
            applied.join(", ")
        }
    ));
    for layer in &identity.layers {
        let kind = if layer.add_on { "add-on" } else { "layer" };
        let overlays = if layer.overlays.is_empty() {
            "none".to_string()
        } else {
            layer.overlays.join(", ")
        };
        lines.push(format!("{kind} {}: overlays {overlays}", layer.name));
    }
    lines
}

/// Error report for stderr; content conflicts get one line per item.
pub(crate) fn format_error_lines(err: &anyhow::Error, style: OutputStyle) -> Vec<String> {
    match err.downcast_ref::<PatchError>() {
        Some(PatchError::ContentConflict {
            patch_id,
            conflicts,
        }) => {
            let mut lines = vec![render_status_line(
                style,
                "err",
                &format!(
                    "patch '{patch_id}' conflicts with installed content ({} item(s))",
                    conflicts.len()
                ),
            )];
            for conflict in conflicts {
                lines.push(format!(
                    "  {} {conflict}",
                    paint(style, conflict_style(), "conflict")
                ));
            }
            lines.push(
                "rerun with --policy override-all or --policy preserve-all to resolve".to_string(),
            );
            lines
        }
        _ => vec![render_status_line(style, "err", &format!("{err:#}"))],
    }
}
