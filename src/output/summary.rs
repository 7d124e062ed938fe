use std::fmt::Write;

use comfy_table::{Cell, Color as TableColor};

use crate::report::RunReport;

use super::styling::{dim, failure, heading, highlight, outcome, value};
use super::tables::{color_coded_duration_cell, create_table, status_cell};

/// Prints a human-readable summary of a run to stdout.
///
/// Displays:
/// - Overview: command, outcome, total duration, start time
/// - Steps: every step in execution order with status and duration
/// - Artifact / Image / Dispatch sections when the run produced them
pub fn print_summary(report: &RunReport) {
    println!("{}", render_summary(report));
}

fn create_cyan_header(labels: &[&str]) -> Vec<Cell> {
    labels
        .iter()
        .map(|label| Cell::new(*label).fg(TableColor::Cyan))
        .collect()
}

fn add_section_header(output: &mut String, emoji: &str, title: &str) {
    let _ = writeln!(output, "{emoji} {}", heading(title));
}

fn add_field(output: &mut String, label: &str, value: impl std::fmt::Display) {
    let _ = writeln!(output, "  {} {}", dim(label), value);
}

pub fn render_summary(report: &RunReport) -> String {
    let mut output = String::new();

    add_section_header(&mut output, "📊", "Overview");

    add_field(&mut output, "Command:", value(&report.command));
    add_field(&mut output, "Outcome:", outcome(report.outcome));
    add_field(
        &mut output,
        "Duration:",
        highlight(format!("{:.1}s", report.total_duration_secs())),
    );
    add_field(
        &mut output,
        "Started:",
        dim(report.started_at.format("%Y-%m-%d %H:%M UTC")),
    );
    if let Some(error) = &report.error {
        add_field(&mut output, "Error:", failure(error));
    }
    output.push('\n');

    if !report.steps.is_empty() {
        add_section_header(&mut output, "⚙️", "Steps");

        let mut table = create_table();
        table.set_header(create_cyan_header(&["Step", "Status", "Duration", "Detail"]));
        for step in &report.steps {
            table.add_row(vec![
                Cell::new(&step.name),
                status_cell(step.status),
                color_coded_duration_cell(step.duration_secs),
                Cell::new(
                    step.detail
                        .as_deref()
                        .and_then(|detail| detail.lines().next())
                        .unwrap_or(""),
                ),
            ]);
        }
        let _ = writeln!(output, "{table}\n");
    }

    if !report.toolchain.is_empty() {
        add_section_header(&mut output, "🦀", "Toolchain");
        for version in &report.toolchain {
            let _ = writeln!(output, "  {}", dim(version));
        }
        output.push('\n');
    }

    if let Some(artifact) = &report.artifact {
        add_section_header(&mut output, "📦", "Artifact");
        add_field(&mut output, "Path:", value(artifact.path.display()));
        add_field(&mut output, "Size:", highlight(format!("{} bytes", artifact.size)));
        add_field(&mut output, "SHA-256:", dim(&artifact.sha256));
        output.push('\n');
    }

    if let Some(image) = &report.image {
        add_section_header(&mut output, "🐳", "Runtime Image");
        add_field(&mut output, "Directory:", value(image.dir.display()));
        add_field(&mut output, "Base:", &image.manifest.base_image);
        add_field(&mut output, "Command:", highlight(image.manifest.cmd.join(" ")));
        add_field(
            &mut output,
            "Ports:",
            image
                .manifest
                .exposed_ports
                .keys()
                .cloned()
                .collect::<Vec<_>>()
                .join(", "),
        );
        output.push('\n');
    }

    if report.substitution.is_some() || report.remote_build.is_some() {
        add_section_header(&mut output, "🚀", "Dispatch");
        if let Some(substitution) = &report.substitution {
            add_field(&mut output, "BRANCH_NAME:", value(substitution));
        }
        if let Some(build) = &report.remote_build {
            add_field(&mut output, "Remote build:", &build.id);
            add_field(&mut output, "Status:", build.status.as_str());
            if let Some(url) = &build.log_url {
                add_field(&mut output, "Logs:", dim(url));
            }
        }
        output.push('\n');
    }

    output
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::error::ReleaseError;
    use crate::report::StepStatus;

    fn strip(text: &str) -> String {
        console::strip_ansi_codes(text).into_owned()
    }

    #[test]
    fn test_summary_lists_steps_and_error() {
        let mut report = RunReport::new("build");
        report.record("fetch", StepStatus::Succeeded, Duration::from_secs(3), None);
        report.record(
            "test",
            StepStatus::Failed,
            Duration::from_secs(90),
            Some("Test suite failed".into()),
        );
        report.finish::<(), _>(&Err(ReleaseError::TestFailed("1 failed".into())));

        let rendered = strip(&render_summary(&report));
        assert!(rendered.contains("Command: build"));
        assert!(rendered.contains("Outcome: failed"));
        assert!(rendered.contains("Error: Test suite failed: 1 failed"));
        assert!(rendered.contains("fetch"));
        assert!(rendered.contains("1.5min"));
        assert!(!rendered.contains("Runtime Image"));
    }

    #[test]
    fn test_summary_shows_substitution() {
        let mut report = RunReport::new("substitution");
        report.substitution = Some("org/zebra/main".into());
        report.finish::<(), ReleaseError>(&Ok(()));

        let rendered = strip(&render_summary(&report));
        assert!(rendered.contains("BRANCH_NAME: org/zebra/main"));
        assert!(!rendered.contains("Steps"));
    }
}
