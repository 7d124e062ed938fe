use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Instant;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::Config;
use crate::error::{ReleaseError, Result};
use crate::output::StepProgress;
use crate::report::{RunReport, StepStatus};

use super::runner::{CommandRunner, CommandSpec};
use super::{blocking, build_env, BuildStep};

/// The single binary handed from the build stage to the runtime stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildArtifact {
    pub path: PathBuf,
    pub sha256: String,
    pub size: u64,
}

impl BuildArtifact {
    /// Describes the file at `path`, hashing its contents.
    ///
    /// # Errors
    ///
    /// Returns `ArtifactMissing` if `path` is not a regular file.
    pub fn from_path(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Err(ReleaseError::ArtifactMissing(path.to_path_buf()));
        }

        let mut file = File::open(path)?;
        let mut hasher = Sha256::new();
        let mut buffer = [0u8; 64 * 1024];
        let mut size = 0u64;
        loop {
            let read = file.read(&mut buffer)?;
            if read == 0 {
                break;
            }
            hasher.update(&buffer[..read]);
            size += read as u64;
        }

        Ok(Self {
            path: path.to_path_buf(),
            sha256: format!("{:x}", hasher.finalize()),
            size,
        })
    }

    /// [`BuildArtifact::from_path`] on the blocking pool.
    pub async fn hash(path: &Path) -> Result<Self> {
        let path = path.to_path_buf();
        blocking(move || Self::from_path(&path)).await
    }
}

/// Compiles a source checkout into one tested release binary.
///
/// Steps run strictly in [`BuildStep::ORDER`]; the first failure ends the run
/// and nothing after it executes. There is no switch to skip the test step.
pub struct BuildStage<'a, R> {
    config: &'a Config,
    runner: &'a R,
    source_dir: PathBuf,
    cargo_home: PathBuf,
    skip_provision: bool,
}

impl<'a, R: CommandRunner> BuildStage<'a, R> {
    pub fn new(config: &'a Config, runner: &'a R, source_dir: impl Into<PathBuf>) -> Self {
        let source_dir = source_dir.into();
        let cargo_home = config.build.local_cargo_home(&source_dir);
        Self {
            config,
            runner,
            source_dir,
            cargo_home,
            skip_provision: false,
        }
    }

    /// Skips installing system packages, for hosts that already have them.
    pub fn skip_provision(mut self, skip: bool) -> Self {
        self.skip_provision = skip;
        self
    }

    /// Runs every step and returns the release binary.
    ///
    /// # Errors
    ///
    /// Returns the error of the first failing step, mapped through
    /// [`BuildStep::failure`], or `ArtifactMissing` if compilation succeeded
    /// without producing the expected binary.
    pub async fn run(&self, report: &mut RunReport) -> Result<BuildArtifact> {
        info!(
            "Building {} from {}",
            self.config.build.binary,
            self.source_dir.display()
        );

        let total = BuildStep::ORDER.len();
        for (index, step) in BuildStep::ORDER.into_iter().enumerate() {
            if step == BuildStep::Provision && self.skip_provision {
                info!("Skipping {step}: provisioning disabled");
                report.record(step.label(), StepStatus::Skipped, Default::default(), None);
                continue;
            }

            let progress = StepProgress::start(index + 1, total, step.label());
            let started = Instant::now();

            match self.run_step(step, report).await {
                Ok(()) => {
                    progress.succeed();
                    report.record(step.label(), StepStatus::Succeeded, started.elapsed(), None);
                }
                Err(err) => {
                    progress.fail();
                    warn!("Step {step} failed: {err}");
                    report.record(
                        step.label(),
                        StepStatus::Failed,
                        started.elapsed(),
                        Some(err.to_string()),
                    );
                    return Err(err);
                }
            }
        }

        let artifact_path = self.config.build.artifact_path(&self.source_dir);
        let artifact = BuildArtifact::hash(&artifact_path).await?;
        info!(
            "Built {} ({} bytes, sha256 {})",
            artifact.path.display(),
            artifact.size,
            artifact.sha256
        );
        report.artifact = Some(artifact.clone());
        Ok(artifact)
    }

    async fn run_step(&self, step: BuildStep, report: &mut RunReport) -> Result<()> {
        if step == BuildStep::MaterializeCache {
            return self.materialize_cache().await;
        }

        let env = build_env(&self.config.build, &self.cargo_home);
        for spec in step.commands(&self.config.build, &self.source_dir) {
            let spec = spec.envs(&env);
            let stdout = self.execute(step, &spec).await?;

            if step == BuildStep::ToolchainVersions {
                let version = stdout.trim().to_string();
                info!("{version}");
                report.toolchain.push(version);
            }
        }
        Ok(())
    }

    async fn execute(&self, step: BuildStep, spec: &CommandSpec) -> Result<String> {
        debug!("[{step}] {spec}");
        let output = self
            .runner
            .run(spec)
            .await
            .map_err(|e| step.failure(format!("could not start `{spec}`: {e}")))?;

        if !output.success() {
            return Err(step.failure(output.failure_detail(spec)));
        }
        Ok(output.stdout)
    }

    async fn materialize_cache(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.cargo_home).await.map_err(|e| {
            ReleaseError::CacheUnavailable(format!("{}: {e}", self.cargo_home.display()))
        })?;
        debug!("Dependency cache at {}", self.cargo_home.display());
        Ok(())
    }
}
