mod cloud_build;
mod dispatch;
mod gcloud;

use std::fmt;
use std::path::Path;

use indexmap::IndexMap;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::auth::Credential;
use crate::config::{BranchNaming, Config, Dispatcher};
use crate::error::{ReleaseError, Result};
use crate::pipeline::CommandRunner;
use crate::recipe::RemoteBuildConfig;
use crate::report::RunReport;

pub use cloud_build::CloudBuildApi;
pub use dispatch::{dispatch, BuildSubmission, RemoteBuild};
pub use gcloud::GcloudCli;

/// Substitution key the remote build configuration reads the identifier from.
pub const BRANCH_NAME_KEY: &str = "BRANCH_NAME";

const REF_PREFIXES: [&str; 3] = ["refs/heads/", "refs/tags/", "refs/"];

/// Hex digits of the ref digest appended to rewritten branch names.
const REF_DIGEST_LEN: usize = 8;

/// A source-control push: which repository, which ref.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushEvent {
    /// Repository in `owner/name` form
    pub repository: String,
    /// Full ref, e.g. `refs/heads/main`
    pub git_ref: String,
}

impl PushEvent {
    /// # Errors
    ///
    /// Returns `InvalidEvent` unless `repository` is `owner/name` and `git_ref`
    /// names a branch or tag.
    pub fn new(repository: impl Into<String>, git_ref: impl Into<String>) -> Result<Self> {
        let repository = repository.into();
        let git_ref = git_ref.into();

        let parts: Vec<&str> = repository.split('/').collect();
        if parts.len() != 2 || parts.iter().any(|part| part.is_empty()) {
            return Err(ReleaseError::InvalidEvent(format!(
                "repository must be in format 'owner/name', got '{repository}'"
            )));
        }
        if git_ref.trim().is_empty() || git_ref.ends_with('/') {
            return Err(ReleaseError::InvalidEvent(format!(
                "ref '{git_ref}' does not name a branch"
            )));
        }

        Ok(Self {
            repository,
            git_ref,
        })
    }

    /// Branch (or tag) name with the `refs/heads/` style prefix removed.
    pub fn branch(&self) -> &str {
        REF_PREFIXES
            .iter()
            .find_map(|prefix| self.git_ref.strip_prefix(prefix))
            .unwrap_or(&self.git_ref)
    }

    /// Whether the ref names a branch: `refs/heads/...` or a bare name.
    pub fn is_branch(&self) -> bool {
        self.git_ref.starts_with("refs/heads/") || !self.git_ref.starts_with("refs/")
    }

    /// The ref with bare branch names expanded to `refs/heads/<name>`.
    fn canonical_ref(&self) -> String {
        if self.git_ref.starts_with("refs/") {
            self.git_ref.clone()
        } else {
            format!("refs/heads/{}", self.git_ref)
        }
    }
}

/// Lowercased `owner/name/branch` key passed to the remote build as `BRANCH_NAME`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Substitution(String);

impl Substitution {
    /// Derives the identifier for a push.
    ///
    /// With [`BranchNaming::Full`] a lowercase branch without `/` is used as
    /// is (`main`, `feature-foo`). Anything the id cannot carry verbatim, i.e.
    /// a `/`, an uppercase letter or a tag ref, is flattened to lowercase with
    /// `/` turned into `-` and suffixed with the first hex digits of the ref's
    /// SHA-256, so `feature/foo` never meets `feature-foo` and tag `v1` never
    /// meets branch `v1`.
    ///
    /// With [`BranchNaming::LastSegment`] only the final segment survives and
    /// a warning is logged whenever that drops part of the branch name.
    pub fn derive(event: &PushEvent, naming: BranchNaming) -> Self {
        let branch = event.branch();
        let branch = match naming {
            BranchNaming::Full => {
                let flattened = branch.replace('/', "-").to_lowercase();
                if event.is_branch() && flattened == branch {
                    flattened
                } else {
                    format!("{flattened}-{}", ref_digest(&event.canonical_ref()))
                }
            }
            BranchNaming::LastSegment => {
                let last = branch.rsplit('/').next().unwrap_or(branch);
                if last != branch {
                    warn!(
                        "Branch '{branch}' collapsed to '{last}'; other branches ending in '{last}' share this identifier"
                    );
                }
                last.to_string()
            }
        };

        Self(format!("{}/{}", event.repository, branch).to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Substitution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn ref_digest(git_ref: &str) -> String {
    let digest = format!("{:x}", Sha256::digest(git_ref.as_bytes()));
    digest[..REF_DIGEST_LEN].to_string()
}

/// Reacts to a push: derives the identifier, authenticates and dispatches
/// one remote build.
pub struct Trigger<'a, R> {
    config: &'a Config,
    runner: &'a R,
    dispatcher: Dispatcher,
    naming: BranchNaming,
}

impl<'a, R: CommandRunner> Trigger<'a, R> {
    pub fn new(config: &'a Config, runner: &'a R) -> Self {
        Self {
            config,
            runner,
            dispatcher: config.trigger.dispatcher,
            naming: config.trigger.branch_naming,
        }
    }

    pub fn dispatcher(mut self, dispatcher: Option<Dispatcher>) -> Self {
        if let Some(dispatcher) = dispatcher {
            self.dispatcher = dispatcher;
        }
        self
    }

    pub fn naming(mut self, naming: Option<BranchNaming>) -> Self {
        if let Some(naming) = naming {
            self.naming = naming;
        }
        self
    }

    /// Runs the trigger for `event` with sources at `source_dir`.
    ///
    /// # Errors
    ///
    /// Returns `AuthFailed` without contacting the service when `credential`
    /// is missing; otherwise the first authentication, submission or remote
    /// build failure.
    pub async fn run(
        &self,
        event: &PushEvent,
        source_dir: &Path,
        credential: Option<Credential>,
        report: &mut RunReport,
    ) -> Result<RemoteBuild> {
        let substitution = Substitution::derive(event, self.naming);
        info!("{BRANCH_NAME_KEY}={substitution}");
        report.substitution = Some(substitution.to_string());

        let credential = credential.ok_or_else(|| {
            ReleaseError::AuthFailed(format!(
                "{} is not set",
                self.config.trigger.credential_env
            ))
        })?;

        let mut substitutions = IndexMap::new();
        substitutions.insert(BRANCH_NAME_KEY.to_string(), substitution.to_string());
        let submission = BuildSubmission {
            project: self.config.trigger.project.clone(),
            repository: event.repository.clone(),
            git_ref: event.git_ref.clone(),
            source_dir: source_dir.to_path_buf(),
            config: RemoteBuildConfig::load_or_default(self.config, source_dir)?,
            substitutions,
        };

        let trigger = &self.config.trigger;
        let build = match self.dispatcher {
            Dispatcher::Api => {
                let api = report
                    .track("authenticate", CloudBuildApi::connect(trigger, credential))
                    .await?;
                report.track("dispatch", dispatch(&api, &submission)).await?
            }
            Dispatcher::Gcloud => {
                let cli = report
                    .track(
                        "authenticate",
                        GcloudCli::connect(self.runner, trigger, &credential),
                    )
                    .await?;
                report.track("dispatch", dispatch(&cli, &submission)).await?
            }
        };

        report.remote_build = Some(build.clone());
        Ok(build)
    }
}
