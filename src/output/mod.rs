mod progress;
mod styling;
mod summary;
mod tables;

pub use progress::StepProgress;
use styling::{banner, dim};
pub use summary::{print_summary, render_summary};

/// Prints the zebrad-release banner to stderr.
///
/// Displays the tool name, version, and description at the start of execution.
pub fn print_banner() {
    eprintln!(
        r"
{} {}
  {}
",
        banner("🦓 zebrad-release"),
        dim(env!("CARGO_PKG_VERSION")),
        dim("Build, package and dispatch zebrad images")
    );
}
