//! Child process execution for pipeline steps.

use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;

use indexmap::IndexMap;
use log::{debug, info};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;

/// Output lines kept in a failure detail, after the headline.
const FAILURE_TAIL_LINES: usize = 60;

/// A fully described command: program, arguments, working directory and the
/// environment variables set on top of the inherited ones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: IndexMap<String, String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: cwd.into(),
            env: IndexMap::new(),
        }
    }

    /// Runs `script` through `/bin/sh -c`.
    pub fn shell(script: impl Into<String>, cwd: impl Into<PathBuf>) -> Self {
        Self::new("/bin/sh", cwd).args(["-c".to_string(), script.into()])
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn envs(self, vars: &IndexMap<String, String>) -> Self {
        vars.iter()
            .fold(self, |spec, (key, value)| spec.env(key.as_str(), value.as_str()))
    }

    /// Command line as a shell would show it. Shell scripts render as the bare script.
    pub fn command_line(&self) -> String {
        if self.program == "/bin/sh" && self.args.len() == 2 && self.args[0] == "-c" {
            return self.args[1].clone();
        }
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.command_line())
    }
}

/// Captured result of a finished command.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    /// Exit code, `None` when the process was killed by a signal
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Failure description: a headline with the exit code and the last
    /// stderr line, followed by the tail of stdout and stderr.
    ///
    /// Panics and backtraces printed by `cargo test` land on stdout, so both
    /// streams are kept.
    pub fn failure_detail(&self, spec: &CommandSpec) -> String {
        let code = self
            .code
            .map_or_else(|| "signal".to_string(), |code| code.to_string());
        let mut detail = match self.stderr.lines().rev().find(|line| !line.trim().is_empty()) {
            Some(line) => format!("`{spec}` exited with {code}: {}", line.trim()),
            None => format!("`{spec}` exited with {code}"),
        };

        let lines: Vec<&str> = self
            .stdout
            .lines()
            .chain(self.stderr.lines())
            .filter(|line| !line.trim().is_empty())
            .collect();
        let tail = &lines[lines.len().saturating_sub(FAILURE_TAIL_LINES)..];
        if tail.len() > 1 || tail.first().is_some_and(|line| !detail.ends_with(line.trim())) {
            for line in tail {
                detail.push('\n');
                detail.push_str(line);
            }
        }
        detail
    }
}

/// Executes command specs. Pipeline stages are generic over this so tests can
/// script outcomes without spawning processes.
#[allow(async_fn_in_trait)]
pub trait CommandRunner {
    async fn run(&self, spec: &CommandSpec) -> std::io::Result<CommandOutput>;
}

/// Runs commands as real child processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRunner;

impl CommandRunner for ProcessRunner {
    async fn run(&self, spec: &CommandSpec) -> std::io::Result<CommandOutput> {
        debug!(
            "Spawning `{}` in {} with {} extra env vars",
            spec,
            spec.cwd.display(),
            spec.env.len()
        );

        let mut child = Command::new(&spec.program)
            .args(&spec.args)
            .current_dir(&spec.cwd)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| std::io::Error::other("failed to capture stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| std::io::Error::other("failed to capture stderr"))?;

        let (stdout, stderr, status) = tokio::try_join!(
            forward_lines(stdout, &spec.program),
            forward_lines(stderr, &spec.program),
            child.wait(),
        )?;

        Ok(CommandOutput {
            code: status.code(),
            stdout,
            stderr,
        })
    }
}

/// Logs every line of `reader` as it arrives and returns everything read.
async fn forward_lines<R: AsyncRead + Unpin>(reader: R, program: &str) -> std::io::Result<String> {
    let mut segments = BufReader::new(reader).split(b'\n');
    let mut captured = String::new();
    while let Some(segment) = segments.next_segment().await? {
        let line = String::from_utf8_lossy(&segment);
        let line = line.trim_end_matches('\r');
        info!("[{program}] {line}");
        captured.push_str(line);
        captured.push('\n');
    }
    Ok(captured)
}


#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_shell_spec_renders_script() {
        let spec = CommandSpec::shell("apt-get update && apt-get install -y gcc", "/zebra");
        assert_eq!(spec.program, "/bin/sh");
        assert_eq!(spec.command_line(), "apt-get update && apt-get install -y gcc");
    }

    #[test]
    fn test_command_line_joins_args() {
        let spec = CommandSpec::new("cargo", "/zebra").args(["test", "--all"]);
        assert_eq!(spec.to_string(), "cargo test --all");
    }

    #[test]
    fn test_failure_detail_uses_last_stderr_line() {
        let spec = CommandSpec::new("cargo", "/zebra").arg("fetch");
        let output = CommandOutput {
            code: Some(101),
            stdout: String::new(),
            stderr: "Updating index\nerror: failed to fetch `zebra-chain`\n\n".to_string(),
        };
        let detail = output.failure_detail(&spec);
        assert!(detail.starts_with(
            "`cargo fetch` exited with 101: error: failed to fetch `zebra-chain`\n"
        ));
        assert!(detail.contains("Updating index"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_runner_passes_explicit_env() {
        let temp_dir = TempDir::new().unwrap();
        let spec = CommandSpec::shell("echo $RUST_BACKTRACE", temp_dir.path())
            .env("RUST_BACKTRACE", "1");

        let output = ProcessRunner.run(&spec).await.unwrap();

        assert!(output.success());
        assert_eq!(output.stdout.trim(), "1");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_runner_reports_exit_code() {
        let temp_dir = TempDir::new().unwrap();
        let spec = CommandSpec::shell("echo boom >&2; exit 3", temp_dir.path());

        let output = ProcessRunner.run(&spec).await.unwrap();

        assert!(!output.success());
        assert_eq!(output.code, Some(3));
        assert_eq!(output.stderr.trim(), "boom");
    }

    #[test]
    fn test_failure_detail_without_extra_output_is_one_line() {
        let spec = CommandSpec::new("cargo", "/zebra").arg("fetch");
        let output = CommandOutput {
            code: Some(101),
            stdout: String::new(),
            stderr: "error: no network\n".to_string(),
        };
        assert_eq!(
            output.failure_detail(&spec),
            "`cargo fetch` exited with 101: error: no network"
        );
    }

    #[test]
    fn test_failure_detail_keeps_only_the_tail() {
        let spec = CommandSpec::new("cargo", "/zebra").args(["test", "--all"]);
        let stdout = (0..500).map(|i| format!("line {i}\n")).collect::<String>();
        let output = CommandOutput {
            code: Some(101),
            stdout,
            stderr: String::new(),
        };

        let detail = output.failure_detail(&spec);
        assert_eq!(detail.lines().count(), FAILURE_TAIL_LINES + 1);
        assert!(detail.ends_with("line 499"));
        assert!(!detail.contains("line 0\n"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failing_test_run_keeps_backtrace() {
        let temp_dir = TempDir::new().unwrap();
        let script = "echo \"thread 'sync::tests::tip' panicked at zebrad/src/sync.rs:42:9\"; \
            echo 'stack backtrace:'; \
            echo '   0: zebrad::components::sync::tests::tip'; \
            echo 'error: test failed, to rerun pass `--lib`' >&2; \
            exit 101";
        let spec = CommandSpec::shell(script, temp_dir.path());

        let output = ProcessRunner.run(&spec).await.unwrap();
        let detail = output.failure_detail(&spec);

        assert_eq!(output.code, Some(101));
        assert!(detail.contains("error: test failed"));
        assert!(detail.contains("stack backtrace:"));
        assert!(detail.contains("0: zebrad::components::sync::tests::tip"));
        assert!(detail.contains("panicked at zebrad/src/sync.rs:42:9"));
    }
}
