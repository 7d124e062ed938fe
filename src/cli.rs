use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use log::info;
use std::path::{Path, PathBuf};

use crate::auth::Credential;
use crate::config::{BranchNaming, Config, Dispatcher, OutputFormat};
use crate::output::{print_summary, render_summary};
use crate::pipeline::{run_release, ProcessRunner, ReleaseRun, RuntimeStage};
use crate::recipe::{render_dockerfile, render_workflow, RemoteBuildConfig};
use crate::report::RunReport;
use crate::trigger::{PushEvent, Substitution, Trigger, BRANCH_NAME_KEY};

#[derive(Parser)]
#[command(name = "zebrad-release")]
#[command(author, version, about = "Build, package and dispatch zebrad release images", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (defaults to ./zebrad-release.{toml,json,yaml,yml})
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Write the report here instead of stdout
    #[arg(short, long, global = true)]
    output: Option<PathBuf>,

    /// Report format, overrides `output.format`
    #[arg(short, long, global = true, value_enum)]
    format: Option<OutputFormat>,

    #[arg(short, long, global = true, default_value_t = false)]
    pretty: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Provision, fetch, test and compile, then assemble the runtime image
    Build {
        #[arg(short, long, default_value = ".")]
        source: PathBuf,

        #[arg(short, long, default_value = "image")]
        image_dir: PathBuf,

        /// Skip installing system packages (toolchain host already provisioned)
        #[arg(long, default_value_t = false)]
        skip_provision: bool,
    },
    /// Assemble the runtime image from an already compiled binary
    Assemble {
        #[arg(short, long)]
        artifact: PathBuf,

        #[arg(short, long, default_value = "image")]
        image_dir: PathBuf,
    },
    /// Print the BRANCH_NAME substitution for a push
    Substitution {
        #[arg(short, long, env = "GITHUB_REPOSITORY")]
        repository: String,

        #[arg(long = "ref", env = "GITHUB_REF")]
        git_ref: String,

        #[arg(short, long, value_enum)]
        branch_naming: Option<BranchNaming>,
    },
    /// Dispatch one remote build for a push
    Trigger {
        #[arg(short, long, env = "GITHUB_REPOSITORY")]
        repository: String,

        #[arg(long = "ref", env = "GITHUB_REF")]
        git_ref: String,

        #[arg(short, long, default_value = ".")]
        source: PathBuf,

        #[arg(short, long, value_enum)]
        dispatcher: Option<Dispatcher>,

        #[arg(short, long, value_enum)]
        branch_naming: Option<BranchNaming>,
    },
    /// Print the container recipe, the remote build configuration or the push workflow
    Render {
        #[arg(value_enum)]
        target: RenderTarget,

        #[arg(short, long, default_value = ".")]
        source: PathBuf,
    },
    /// Write the default configuration to a file
    Init {
        #[arg(default_value = "zebrad-release.toml")]
        path: PathBuf,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum RenderTarget {
    Dockerfile,
    RemoteConfig,
    /// CI workflow dispatching a remote build on every branch push
    Workflow,
}

impl Cli {
    async fn execute_build(
        &self,
        config: &Config,
        source: &Path,
        image_dir: &Path,
        skip_provision: bool,
    ) -> Result<()> {
        info!("Building {} from {}", config.build.binary, source.display());

        let run = ReleaseRun {
            source_dir: source.to_path_buf(),
            image_dir: image_dir.to_path_buf(),
            skip_provision,
        };
        let mut report = RunReport::new("build");
        let result = run_release(config, &ProcessRunner, &run, &mut report).await;
        report.finish(&result);
        self.emit(config, &report)?;

        let image = result.context("Release build failed")?;
        info!(
            "Runtime image assembled at {} (config {})",
            image.rootfs().display(),
            image.manifest_path().display()
        );
        Ok(())
    }

    async fn execute_assemble(
        &self,
        config: &Config,
        artifact: &Path,
        image_dir: &Path,
    ) -> Result<()> {
        let mut report = RunReport::new("assemble");
        let result = RuntimeStage::new(config, image_dir)
            .assemble(artifact, &mut report)
            .await;
        report.finish(&result);
        self.emit(config, &report)?;

        result.context("Image assembly failed")?;
        Ok(())
    }

    fn execute_substitution(
        &self,
        config: &Config,
        repository: &str,
        git_ref: &str,
        naming: Option<BranchNaming>,
    ) -> Result<()> {
        let mut report = RunReport::new("substitution");
        let result = PushEvent::new(repository, git_ref).map(|event| {
            Substitution::derive(&event, naming.unwrap_or(config.trigger.branch_naming))
        });
        if let Ok(substitution) = &result {
            report.substitution = Some(substitution.to_string());
        }
        report.finish(&result);

        let substitution = result.context("Invalid push event")?;
        if self.output.is_none() && self.format(config) == OutputFormat::Summary {
            println!("{BRANCH_NAME_KEY}={substitution}");
            return Ok(());
        }
        self.emit(config, &report)
    }

    async fn execute_trigger(
        &self,
        config: &Config,
        repository: &str,
        git_ref: &str,
        source: &Path,
        dispatcher: Option<Dispatcher>,
        naming: Option<BranchNaming>,
    ) -> Result<()> {
        info!("Triggering remote build for {repository} at {git_ref}");

        let event = PushEvent::new(repository, git_ref).context("Invalid push event")?;
        let credential = Credential::from_env(&config.trigger.credential_env);

        let mut report = RunReport::new("trigger");
        let result = Trigger::new(config, &ProcessRunner)
            .dispatcher(dispatcher)
            .naming(naming)
            .run(&event, source, credential, &mut report)
            .await;
        report.finish(&result);
        self.emit(config, &report)?;

        let build = result.context("Remote build dispatch failed")?;
        info!("Remote build {} finished: {}", build.id, build.status.as_str());
        Ok(())
    }

    fn execute_render(&self, config: &Config, target: RenderTarget, source: &Path) -> Result<()> {
        let rendered = match target {
            RenderTarget::Dockerfile => render_dockerfile(config),
            RenderTarget::RemoteConfig => {
                RemoteBuildConfig::load_or_default(config, source)?.to_yaml()?
            }
            RenderTarget::Workflow => render_workflow(config)?,
        };
        self.write(&rendered)
    }

    fn format(&self, config: &Config) -> OutputFormat {
        self.format.unwrap_or(config.output.format)
    }

    fn emit(&self, config: &Config, report: &RunReport) -> Result<()> {
        let rendered = match self.format(config) {
            OutputFormat::Json if self.pretty || config.output.pretty => {
                serde_json::to_string_pretty(report)?
            }
            OutputFormat::Json => serde_json::to_string(report)?,
            OutputFormat::Summary if self.output.is_some() => {
                console::strip_ansi_codes(&render_summary(report)).into_owned()
            }
            OutputFormat::Summary => {
                print_summary(report);
                return Ok(());
            }
        };
        self.write(&rendered)
    }

    fn write(&self, contents: &str) -> Result<()> {
        if let Some(output_path) = &self.output {
            std::fs::write(output_path, contents)
                .with_context(|| format!("Failed to write {}", output_path.display()))?;
            info!("Report written to: {}", output_path.display());
        } else {
            println!("{contents}");
        }
        Ok(())
    }

    pub async fn execute(&self) -> Result<()> {
        if let Commands::Init { path } = &self.command {
            Config::default().save(path)?;
            info!("Default configuration written to: {}", path.display());
            return Ok(());
        }

        let config = Config::load(self.config.as_deref())?;

        match &self.command {
            Commands::Build {
                source,
                image_dir,
                skip_provision,
            } => {
                self.execute_build(&config, source, image_dir, *skip_provision)
                    .await
            }
            Commands::Assemble {
                artifact,
                image_dir,
            } => self.execute_assemble(&config, artifact, image_dir).await,
            Commands::Substitution {
                repository,
                git_ref,
                branch_naming,
            } => self.execute_substitution(&config, repository, git_ref, *branch_naming),
            Commands::Trigger {
                repository,
                git_ref,
                source,
                dispatcher,
                branch_naming,
            } => {
                self.execute_trigger(
                    &config,
                    repository,
                    git_ref,
                    source,
                    *dispatcher,
                    *branch_naming,
                )
                .await
            }
            Commands::Render { target, source } => self.execute_render(&config, *target, source),
            Commands::Init { .. } => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_definition_is_valid() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_trigger_flags() {
        let cli = Cli::try_parse_from([
            "zebrad-release",
            "--format",
            "json",
            "trigger",
            "--repository",
            "org/zebra",
            "--ref",
            "refs/heads/main",
            "--dispatcher",
            "gcloud",
            "--branch-naming",
            "last-segment",
        ])
        .unwrap();

        assert!(matches!(cli.format, Some(OutputFormat::Json)));
        match cli.command {
            Commands::Trigger {
                repository,
                git_ref,
                dispatcher,
                branch_naming,
                ..
            } => {
                assert_eq!(repository, "org/zebra");
                assert_eq!(git_ref, "refs/heads/main");
                assert_eq!(dispatcher, Some(Dispatcher::Gcloud));
                assert_eq!(branch_naming, Some(BranchNaming::LastSegment));
            }
            _ => panic!("expected trigger command"),
        }
    }

    #[test]
    fn test_parse_render_target() {
        let cli = Cli::try_parse_from(["zebrad-release", "render", "remote-config"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Render {
                target: RenderTarget::RemoteConfig,
                ..
            }
        ));
    }

    #[test]
    fn test_parse_render_workflow() {
        let cli = Cli::try_parse_from(["zebrad-release", "render", "workflow"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Render {
                target: RenderTarget::Workflow,
                ..
            }
        ));
    }
}
