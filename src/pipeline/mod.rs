mod build;
mod runner;
mod runtime;

use std::fmt;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::config::{BuildConfig, Config};
use crate::error::{ReleaseError, Result};
use crate::report::RunReport;

pub use build::{BuildArtifact, BuildStage};
pub use runner::{CommandOutput, CommandRunner, CommandSpec, ProcessRunner};
pub use runtime::{AssembledImage, RuntimeStage};

#[cfg(test)]
pub use runner::testing;

/// The build stage's steps, in the only order they may run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BuildStep {
    Provision,
    MaterializeCache,
    Fetch,
    ToolchainVersions,
    Test,
    Compile,
}

impl BuildStep {
    pub const ORDER: [BuildStep; 6] = [
        BuildStep::Provision,
        BuildStep::MaterializeCache,
        BuildStep::Fetch,
        BuildStep::ToolchainVersions,
        BuildStep::Test,
        BuildStep::Compile,
    ];

    pub fn label(self) -> &'static str {
        match self {
            BuildStep::Provision => "provision",
            BuildStep::MaterializeCache => "materialize-cache",
            BuildStep::Fetch => "fetch",
            BuildStep::ToolchainVersions => "toolchain-versions",
            BuildStep::Test => "test",
            BuildStep::Compile => "compile",
        }
    }

    /// Maps a failure of this step onto the error taxonomy.
    pub fn failure(self, detail: String) -> ReleaseError {
        match self {
            BuildStep::Provision => ReleaseError::ProvisionFailed(detail),
            BuildStep::MaterializeCache => ReleaseError::CacheUnavailable(detail),
            BuildStep::Fetch => ReleaseError::FetchFailed(detail),
            BuildStep::ToolchainVersions => ReleaseError::ToolchainUnavailable(detail),
            BuildStep::Test => ReleaseError::TestFailed(detail),
            BuildStep::Compile => ReleaseError::CompileFailed(detail),
        }
    }

    /// Commands this step runs inside `workdir`.
    ///
    /// Shared by the local build stage and the rendered container recipe so
    /// both execute the same thing. `MaterializeCache` is a filesystem
    /// operation locally and renders as `mkdir -p` in the recipe.
    pub fn commands(self, config: &BuildConfig, workdir: &Path) -> Vec<CommandSpec> {
        match self {
            BuildStep::Provision => vec![CommandSpec::shell(provision_script(config), workdir)],
            BuildStep::MaterializeCache => Vec::new(),
            BuildStep::Fetch => vec![cargo(workdir, ["fetch"])],
            BuildStep::ToolchainVersions => vec![
                CommandSpec::new("rustc", workdir).arg("-V"),
                cargo(workdir, ["-V"]),
                CommandSpec::new("rustup", workdir).arg("-V"),
            ],
            BuildStep::Test => vec![cargo(workdir, ["test", "--all"])],
            BuildStep::Compile => vec![cargo(workdir, ["build", "--release", "--bin"])
                .arg(config.binary.as_str())],
        }
    }
}

impl fmt::Display for BuildStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Environment every build command receives, independent of the caller's environment.
pub fn build_env(config: &BuildConfig, cargo_home: &Path) -> IndexMap<String, String> {
    let mut env = IndexMap::new();
    env.insert("RUST_BACKTRACE".to_string(), config.rust_backtrace.clone());
    env.insert(
        "CARGO_HOME".to_string(),
        cargo_home.to_string_lossy().into_owned(),
    );
    env
}

/// Where a local release run reads sources from and writes the image to.
#[derive(Debug, Clone)]
pub struct ReleaseRun {
    pub source_dir: PathBuf,
    pub image_dir: PathBuf,
    pub skip_provision: bool,
}

/// Build stage followed by runtime stage.
///
/// The runtime stage only starts once the build stage returned an artifact,
/// so a failed fetch, test or compile leaves no image behind.
pub async fn run_release<R: CommandRunner>(
    config: &Config,
    runner: &R,
    run: &ReleaseRun,
    report: &mut RunReport,
) -> Result<AssembledImage> {
    let artifact = BuildStage::new(config, runner, &run.source_dir)
        .skip_provision(run.skip_provision)
        .run(report)
        .await?;

    RuntimeStage::new(config, &run.image_dir)
        .assemble(&artifact.path, report)
        .await
}

/// Runs blocking filesystem work off the async runtime.
pub(crate) async fn blocking<T, F>(task: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(task)
        .await
        .map_err(|e| ReleaseError::Io(std::io::Error::other(e)))?
}

fn provision_script(config: &BuildConfig) -> String {
    if let Some(command) = &config.provision_command {
        return command.clone();
    }
    format!(
        "apt-get update && apt-get install -y --no-install-recommends {}",
        config.system_packages.join(" ")
    )
}

fn cargo<const N: usize>(workdir: &Path, args: [&str; N]) -> CommandSpec {
    CommandSpec::new("cargo", workdir).args(args)
}
