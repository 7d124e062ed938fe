use std::io::Write;
use std::path::Path;

use indexmap::IndexMap;
use log::{debug, info};
use tempfile::NamedTempFile;

use crate::auth::Credential;
use crate::config::TriggerConfig;
use crate::error::{ReleaseError, Result};
use crate::pipeline::{CommandOutput, CommandRunner, CommandSpec};

use super::dispatch::{BuildSubmission, RemoteBuild, RemoteBuildService, RemoteBuildStatus};

const GCLOUD: &str = "gcloud";

/// Alternate list delimiters for `--substitutions`. Git forbids `~` and `:`
/// in ref names.
const LIST_DELIMITERS: [char; 5] = ['~', ':', '|', ';', '@'];

/// Dispatches remote builds through `gcloud builds submit`.
///
/// The installed SDK must report exactly the pinned version, and the
/// credential is a service account key activated before any submission.
pub struct GcloudCli<'a, R> {
    runner: &'a R,
    tool_version: String,
}

impl<'a, R: CommandRunner> GcloudCli<'a, R> {
    /// Checks the pinned tool version and activates `credential`.
    ///
    /// # Errors
    ///
    /// Returns `ToolVersionMismatch` if the installed SDK differs from
    /// `trigger.tool-version`, `AuthFailed` if the key is rejected.
    pub async fn connect(runner: &'a R, trigger: &TriggerConfig, credential: &Credential) -> Result<Self> {
        let cli = Self {
            runner,
            tool_version: trigger.tool_version.clone(),
        };
        cli.check_version().await?;
        cli.activate(credential).await?;
        Ok(cli)
    }

    async fn check_version(&self) -> Result<()> {
        let spec = CommandSpec::new(GCLOUD, ".").arg("--version");
        let output = self.run(&spec).await?;
        if !output.success() {
            return Err(ReleaseError::DispatchFailed(output.failure_detail(&spec)));
        }

        let found = parse_sdk_version(&output.stdout).unwrap_or_default();
        if found != self.tool_version {
            return Err(ReleaseError::ToolVersionMismatch {
                expected: self.tool_version.clone(),
                found: if found.is_empty() { "unknown".to_string() } else { found },
            });
        }

        debug!("Using Google Cloud SDK {found}");
        Ok(())
    }

    async fn activate(&self, credential: &Credential) -> Result<()> {
        let mut key_file = NamedTempFile::new()?;
        key_file.write_all(credential.as_str().as_bytes())?;
        key_file.flush()?;

        let spec = CommandSpec::new(GCLOUD, ".")
            .args(["auth", "activate-service-account", "--key-file"])
            .arg(key_file.path().to_string_lossy());
        let output = self.run(&spec).await?;
        if !output.success() {
            return Err(ReleaseError::AuthFailed(output.failure_detail(&spec)));
        }

        info!("Activated service account for gcloud");
        Ok(())
    }

    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        self.runner
            .run(spec)
            .await
            .map_err(|e| ReleaseError::DispatchFailed(format!("could not run `{spec}`: {e}")))
    }
}

impl<R: CommandRunner> RemoteBuildService for GcloudCli<'_, R> {
    async fn submit(&self, submission: &BuildSubmission) -> Result<RemoteBuild> {
        let mut config_file = tempfile::Builder::new().suffix(".yaml").tempfile()?;
        config_file.write_all(submission.config.to_yaml()?.as_bytes())?;
        config_file.flush()?;

        let substitutions = substitutions_arg(&submission.substitutions)?;

        let spec = submit_spec(
            config_file.path(),
            &substitutions,
            &submission.project,
            &submission.source_dir,
        );
        let output = self.run(&spec).await?;
        let transcript = format!("{}\n{}", output.stdout, output.stderr);

        match (output.success(), parse_build_id(&transcript)) {
            (true, Some(id)) => Ok(RemoteBuild {
                id,
                status: RemoteBuildStatus::Success,
                log_url: parse_log_url(&transcript),
            }),
            (true, None) => Ok(RemoteBuild {
                id: "unknown".to_string(),
                status: RemoteBuildStatus::Success,
                log_url: parse_log_url(&transcript),
            }),
            (false, Some(id)) => Ok(RemoteBuild {
                id,
                status: RemoteBuildStatus::Failure,
                log_url: parse_log_url(&transcript),
            }),
            (false, None) => Err(ReleaseError::DispatchFailed(output.failure_detail(&spec))),
        }
    }
}

fn submit_spec(config: &Path, substitutions: &str, project: &str, source_dir: &Path) -> CommandSpec {
    CommandSpec::new(GCLOUD, source_dir)
        .args(["builds", "submit", "--config"])
        .arg(config.to_string_lossy())
        .arg("--substitutions")
        .arg(substitutions)
        .arg("--project")
        .arg(project)
        .arg(".")
}

/// Renders `KEY=value` pairs for `--substitutions`.
///
/// Pairs are joined with `,` unless a value contains one, in which case the
/// list switches to gcloud's `^<delimiter>^` form with a delimiter no pair uses.
fn substitutions_arg(substitutions: &IndexMap<String, String>) -> Result<String> {
    let pairs: Vec<String> = substitutions
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect();
    if !pairs.iter().any(|pair| pair.contains(',')) {
        return Ok(pairs.join(","));
    }

    let delimiter = LIST_DELIMITERS
        .into_iter()
        .find(|delimiter| !pairs.iter().any(|pair| pair.contains(*delimiter)))
        .ok_or_else(|| {
            ReleaseError::DispatchFailed(format!(
                "no list delimiter is free in substitutions {}",
                pairs.join(" ")
            ))
        })?;
    Ok(format!(
        "^{delimiter}^{}",
        pairs.join(&delimiter.to_string())
    ))
}

/// Extracts `295.0.0` from `Google Cloud SDK 295.0.0`.
fn parse_sdk_version(output: &str) -> Option<String> {
    output
        .lines()
        .find_map(|line| line.trim().strip_prefix("Google Cloud SDK "))
        .map(|version| version.trim().to_string())
}

/// Extracts the build id from `Created [https://.../builds/<id>].`
fn parse_build_id(transcript: &str) -> Option<String> {
    transcript.lines().find_map(|line| {
        let url = bracketed(line.trim().strip_prefix("Created ")?)?;
        let (_, id) = url.rsplit_once("/builds/")?;
        Some(id.to_string())
    })
}

/// Extracts the URL from `Logs are available at [<url>].`
fn parse_log_url(transcript: &str) -> Option<String> {
    transcript.lines().find_map(|line| {
        bracketed(line.trim().strip_prefix("Logs are available at ")?).map(ToString::to_string)
    })
}

fn bracketed(text: &str) -> Option<&str> {
    let start = text.find('[')? + 1;
    let end = start + text[start..].find(']')?;
    Some(&text[start..end])
}
