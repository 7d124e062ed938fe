use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};

use super::styling::{failure, highlight, success};

/// Spinner for one pipeline step, e.g. `Step 3/6: fetch`.
///
/// Draws to stderr only when it is a terminal, so logs and piped output stay clean.
pub struct StepProgress {
    pb: ProgressBar,
    label: String,
}

impl StepProgress {
    pub fn start(index: usize, total: usize, name: &str) -> Self {
        let label = format!("Step {index}/{total}: {name}");
        let pb = create_spinner(highlight(&label).to_string());
        Self { pb, label }
    }

    pub fn succeed(self) {
        self.pb
            .finish_with_message(success(format!("{} ✓", self.label)).to_string());
    }

    pub fn fail(self) {
        self.pb
            .finish_with_message(failure(format!("{} ✗", self.label)).to_string());
    }
}

fn create_spinner(message: String) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_draw_target(ProgressDrawTarget::stderr());
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("  {msg} {spinner}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.set_message(message);
    pb.enable_steady_tick(std::time::Duration::from_millis(100));
    pb
}
