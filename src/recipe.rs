//! Declarative renditions of the pipeline.
//!
//! The container recipe and the remote build configuration are generated from
//! the same [`Config`] and [`BuildStep`] commands the local pipeline runs. The
//! push workflow runs `zebrad-release trigger` with the same settings.

use std::fmt::Write;
use std::path::Path;
use std::time::Duration;

use indexmap::IndexMap;
use log::debug;
use serde::{Deserialize, Serialize};

use crate::config::{Config, Dispatcher};
use crate::error::{ReleaseError, Result};
use crate::pipeline::BuildStep;

/// Remote build timeout used when the configuration does not set one.
const DEFAULT_REMOTE_TIMEOUT: Duration = Duration::from_secs(600);

/// Branch filter matching every pushed branch, including nested names.
const ALL_BRANCHES: &str = "**";

/// Remote build configuration, in the Cloud Build YAML shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteBuildConfig {
    pub steps: Vec<RemoteStep>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteStep {
    /// Builder image running this step
    pub name: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,
}

impl RemoteBuildConfig {
    /// Default remote build: build the container recipe and push it as
    /// `<registry>/$PROJECT_ID/$BRANCH_NAME`.
    pub fn from_config(config: &Config) -> Self {
        let image = format!("{}/$PROJECT_ID/$BRANCH_NAME", config.trigger.registry);
        Self {
            steps: vec![RemoteStep {
                name: "gcr.io/cloud-builders/docker".to_string(),
                args: vec![
                    "build".to_string(),
                    "-t".to_string(),
                    image.clone(),
                    ".".to_string(),
                ],
                env: Vec::new(),
            }],
            images: vec![image],
            timeout: Some("3600s".to_string()),
        }
    }

    /// Loads `trigger.remote-config` from the checkout, or renders the default
    /// configuration when the file does not exist.
    pub fn load_or_default(config: &Config, source_dir: &Path) -> Result<Self> {
        let path = source_dir.join(&config.trigger.remote_config);
        if !path.exists() {
            debug!(
                "No remote build config at {}, using rendered default",
                path.display()
            );
            return Ok(Self::from_config(config));
        }

        let contents = std::fs::read_to_string(&path)?;
        let parsed: Self = serde_yaml::from_str(&contents)?;
        if parsed.steps.is_empty() {
            return Err(ReleaseError::Config(format!(
                "{} declares no steps",
                path.display()
            )));
        }
        Ok(parsed)
    }

    /// The build's timeout, from the `"<seconds>s"` duration format.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for anything but a non-negative number
    /// of seconds followed by `s`.
    pub fn timeout_duration(&self) -> Result<Duration> {
        let Some(timeout) = &self.timeout else {
            return Ok(DEFAULT_REMOTE_TIMEOUT);
        };
        timeout
            .trim()
            .strip_suffix('s')
            .and_then(|secs| secs.parse::<f64>().ok())
            .filter(|secs| secs.is_finite() && *secs >= 0.0)
            .map(Duration::from_secs_f64)
            .ok_or_else(|| ReleaseError::Config(format!("invalid remote build timeout '{timeout}'")))
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Whether `$KEY` or `${KEY}` appears anywhere in the configuration.
    ///
    /// The remote service rejects builds that pass substitutions the
    /// configuration never uses.
    pub fn references(&self, key: &str) -> bool {
        let bare = format!("${key}");
        let braced = format!("${{{key}}}");
        let uses = |text: &str| {
            text.contains(&braced)
                || text.match_indices(&bare).any(|(at, _)| {
                    !text[at + bare.len()..]
                        .chars()
                        .next()
                        .is_some_and(|c| c.is_ascii_alphanumeric() || c == '_')
                })
        };

        self.images.iter().any(|image| uses(image.as_str()))
            || self.steps.iter().any(|step| {
                uses(step.name.as_str())
                    || step.args.iter().any(|arg| uses(arg.as_str()))
                    || step.env.iter().any(|env| uses(env.as_str()))
            })
    }
}

/// Renders the two-stage container recipe.
///
/// The builder stage provisions tools, materializes the dependency cache and
/// runs every build step in order. The runtime stage receives only the
/// release binary.
pub fn render_dockerfile(config: &Config) -> String {
    let build = &config.build;
    let runtime = &config.runtime;
    let workdir = build.workdir.as_path();
    let cargo_home = build.container_cargo_home();
    let artifact = build.artifact_path(workdir);

    let mut out = String::new();
    let _ = writeln!(out, "# Builder stage: fetch, test and compile {}", build.binary);
    let _ = writeln!(out, "FROM {} AS builder", build.toolchain_image);
    let _ = writeln!(out);

    for step in BuildStep::ORDER {
        match step {
            BuildStep::Provision => {
                for spec in step.commands(build, workdir) {
                    let _ = writeln!(out, "RUN {spec}");
                }
                let _ = writeln!(out);
                let _ = writeln!(out, "WORKDIR {}", workdir.display());
                let _ = writeln!(out, "ENV RUST_BACKTRACE={}", build.rust_backtrace);
                let _ = writeln!(out, "ENV CARGO_HOME={}", cargo_home.display());
                let _ = writeln!(out);
            }
            BuildStep::MaterializeCache => {
                let _ = writeln!(out, "RUN mkdir -p {}", cargo_home.display());
                let _ = writeln!(out, "COPY . .");
            }
            _ => {
                let line = step
                    .commands(build, workdir)
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(" && ");
                let _ = writeln!(out, "RUN {line}");
            }
        }
    }

    let cmd = runtime
        .entry_command(&build.binary)
        .iter()
        .map(|arg| format!("\"{}\"", arg.replace('"', "\\\"")))
        .collect::<Vec<_>>()
        .join(", ");

    let _ = writeln!(out);
    let _ = writeln!(out, "# Runtime stage: the release binary and nothing else");
    let _ = writeln!(out, "FROM {}", runtime.base_image);
    let _ = writeln!(
        out,
        "COPY --from=builder {} /{}",
        artifact.display(),
        build.binary
    );
    let _ = writeln!(out, "ENV PORT={}", runtime.port);
    let _ = writeln!(out, "EXPOSE {}", runtime.port);
    let _ = writeln!(out, "CMD [{cmd}]");
    out
}

#[derive(Debug, Serialize)]
struct Workflow {
    name: String,
    on: IndexMap<String, PushFilter>,
    jobs: IndexMap<String, WorkflowJob>,
}

#[derive(Debug, Serialize)]
struct PushFilter {
    branches: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "kebab-case")]
struct WorkflowJob {
    runs_on: String,
    steps: Vec<WorkflowStep>,
}

#[derive(Debug, Default, Serialize)]
struct WorkflowStep {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    uses: Option<String>,
    #[serde(skip_serializing_if = "IndexMap::is_empty")]
    with: IndexMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    run: Option<String>,
    #[serde(skip_serializing_if = "IndexMap::is_empty")]
    env: IndexMap<String, String>,
}

/// Renders the CI workflow that dispatches a remote build on every push.
///
/// Each push to any branch checks out the repository, installs the pinned
/// `gcloud` release and this tool, then runs `zebrad-release trigger`. The
/// runner supplies `GITHUB_REPOSITORY` and `GITHUB_REF`; the stored
/// credential comes from the repository secret of the same name.
pub fn render_workflow(config: &Config) -> Result<String> {
    let trigger = &config.trigger;
    let dispatcher = match trigger.dispatcher {
        Dispatcher::Api => "api",
        Dispatcher::Gcloud => "gcloud",
    };

    let steps = vec![
        WorkflowStep {
            name: "Checkout".to_string(),
            uses: Some("actions/checkout@v4".to_string()),
            ..Default::default()
        },
        WorkflowStep {
            name: "Set up gcloud".to_string(),
            uses: Some("google-github-actions/setup-gcloud@v2".to_string()),
            with: IndexMap::from([("version".to_string(), trigger.tool_version.clone())]),
            ..Default::default()
        },
        WorkflowStep {
            name: "Install zebrad-release".to_string(),
            run: Some(format!(
                "cargo install --locked zebrad-release --version {}",
                env!("CARGO_PKG_VERSION")
            )),
            ..Default::default()
        },
        WorkflowStep {
            name: "Dispatch remote build".to_string(),
            run: Some(format!("zebrad-release trigger --dispatcher {dispatcher}")),
            env: IndexMap::from([(
                trigger.credential_env.clone(),
                format!("${{{{ secrets.{} }}}}", trigger.credential_env),
            )]),
            ..Default::default()
        },
    ];

    let workflow = Workflow {
        name: "zebrad-release".to_string(),
        on: IndexMap::from([(
            "push".to_string(),
            PushFilter {
                branches: vec![ALL_BRANCHES.to_string()],
            },
        )]),
        jobs: IndexMap::from([(
            "trigger".to_string(),
            WorkflowJob {
                runs_on: "ubuntu-latest".to_string(),
                steps,
            },
        )]),
    };
    Ok(serde_yaml::to_string(&workflow)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_dockerfile_has_two_stages() {
        let dockerfile = render_dockerfile(&Config::default());
        let stages: Vec<_> = dockerfile
            .lines()
            .filter(|line| line.starts_with("FROM "))
            .collect();
        assert_eq!(stages, vec!["FROM rust:buster AS builder", "FROM debian:buster-slim"]);
    }

    #[test]
    fn test_dockerfile_build_environment() {
        let dockerfile = render_dockerfile(&Config::default());
        assert!(dockerfile.contains("ENV RUST_BACKTRACE=1\n"));
        assert!(dockerfile.contains("ENV CARGO_HOME=/zebra/.cargo\n"));
        assert!(dockerfile.contains("WORKDIR /zebra\n"));
        assert!(dockerfile
            .contains("RUN apt-get update && apt-get install -y --no-install-recommends make cmake g++ gcc\n"));
    }

    #[test]
    fn test_dockerfile_orders_fetch_test_compile() {
        let dockerfile = render_dockerfile(&Config::default());
        let at = |needle: &str| dockerfile.find(needle).unwrap();

        assert!(at("COPY . .") < at("RUN cargo fetch"));
        assert!(at("RUN cargo fetch") < at("cargo test --all"));
        assert!(at("rustc -V && cargo -V && rustup -V") < at("cargo test --all"));
        assert!(at("cargo test --all") < at("cargo build --release --bin zebrad"));
    }

    #[test]
    fn test_dockerfile_runtime_stage_copies_only_binary() {
        let dockerfile = render_dockerfile(&Config::default());
        let runtime_stage = dockerfile.split("FROM debian:buster-slim").nth(1).unwrap();

        let copies: Vec<_> = runtime_stage
            .lines()
            .filter(|line| line.starts_with("COPY"))
            .collect();
        assert_eq!(
            copies,
            vec!["COPY --from=builder /zebra/target/release/zebrad /zebrad"]
        );
        assert!(runtime_stage.contains("ENV PORT=8233\n"));
        assert!(runtime_stage.contains("EXPOSE 8233\n"));
        assert!(runtime_stage.contains("CMD [\"/zebrad\", \"seed\"]\n"));
        assert!(!runtime_stage.contains("RUN "));
    }

    #[test]
    fn test_default_remote_config_references_branch_name() {
        let remote = RemoteBuildConfig::from_config(&Config::default());
        assert_eq!(remote.images, vec!["gcr.io/$PROJECT_ID/$BRANCH_NAME"]);
        assert!(remote.references("BRANCH_NAME"));
        assert!(!remote.references("BRANCH"));
        assert!(!remote.references("SHORT_SHA"));
    }

    #[test]
    fn test_references_braced_form() {
        let remote = RemoteBuildConfig {
            steps: vec![RemoteStep {
                name: "gcr.io/cloud-builders/docker".into(),
                args: vec!["build".into(), "-t".into(), "img:${BRANCH_NAME}-x".into()],
                env: Vec::new(),
            }],
            images: Vec::new(),
            timeout: None,
        };
        assert!(remote.references("BRANCH_NAME"));
    }

    #[test]
    fn test_load_or_default_reads_checkout_file() {
        let temp = TempDir::new().unwrap();
        std::fs::write(
            temp.path().join("cloudbuild.yaml"),
            r#"
steps:
- name: gcr.io/cloud-builders/docker
  args: ["build", "-t", "gcr.io/$PROJECT_ID/$BRANCH_NAME", "."]
images: ["gcr.io/$PROJECT_ID/$BRANCH_NAME"]
timeout: 7200s
"#,
        )
        .unwrap();

        let remote = RemoteBuildConfig::load_or_default(&Config::default(), temp.path()).unwrap();
        assert_eq!(remote.timeout.as_deref(), Some("7200s"));
        assert_eq!(remote.steps[0].args[0], "build");
    }

    #[test]
    fn test_load_or_default_without_file() {
        let temp = TempDir::new().unwrap();
        let config = Config::default();
        let remote = RemoteBuildConfig::load_or_default(&config, temp.path()).unwrap();
        assert_eq!(remote, RemoteBuildConfig::from_config(&config));
    }

    #[test]
    fn test_load_rejects_empty_steps() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("cloudbuild.yaml"), "steps: []\n").unwrap();

        let result = RemoteBuildConfig::load_or_default(&Config::default(), temp.path());
        assert!(matches!(result, Err(ReleaseError::Config(_))));
    }

    #[test]
    fn test_yaml_round_trip_keeps_images() {
        let remote = RemoteBuildConfig::from_config(&Config::default());
        let yaml = remote.to_yaml().unwrap();
        assert!(yaml.contains("gcr.io/cloud-builders/docker"));
        assert!(yaml.contains("$BRANCH_NAME"));
    }

    fn parse_workflow(config: &Config) -> serde_yaml::Value {
        serde_yaml::from_str(&render_workflow(config).unwrap()).unwrap()
    }

    #[test]
    fn test_workflow_runs_on_every_branch_push() {
        let workflow = parse_workflow(&Config::default());
        let push = &workflow["on"]["push"];

        let branches = push["branches"].as_sequence().unwrap();
        assert_eq!(branches.len(), 1);
        assert_eq!(branches[0].as_str(), Some("**"));
        assert!(push.get("tags").is_none());
        assert!(push.get("paths").is_none());
    }

    #[test]
    fn test_workflow_passes_credential_secret_to_trigger() {
        let workflow = parse_workflow(&Config::default());
        let steps = workflow["jobs"]["trigger"]["steps"].as_sequence().unwrap();
        let dispatch = steps.last().unwrap();

        assert_eq!(
            dispatch["run"].as_str(),
            Some("zebrad-release trigger --dispatcher api")
        );
        assert_eq!(
            dispatch["env"]["GCLOUD_AUTH"].as_str(),
            Some("${{ secrets.GCLOUD_AUTH }}")
        );
    }

    #[test]
    fn test_workflow_pins_tool_versions() {
        let mut config = Config::default();
        config.trigger.tool_version = "300.0.0".to_string();
        config.trigger.dispatcher = Dispatcher::Gcloud;
        config.trigger.credential_env = "DEPLOY_KEY".to_string();
        let workflow = parse_workflow(&config);
        let steps = workflow["jobs"]["trigger"]["steps"].as_sequence().unwrap();

        assert_eq!(steps[0]["uses"].as_str(), Some("actions/checkout@v4"));
        assert_eq!(steps[1]["with"]["version"].as_str(), Some("300.0.0"));
        assert!(steps[2]["run"]
            .as_str()
            .unwrap()
            .ends_with(&format!("--version {}", env!("CARGO_PKG_VERSION"))));
        assert_eq!(
            steps[3]["run"].as_str(),
            Some("zebrad-release trigger --dispatcher gcloud")
        );
        assert_eq!(
            steps[3]["env"]["DEPLOY_KEY"].as_str(),
            Some("${{ secrets.DEPLOY_KEY }}")
        );
    }

    #[test]
    fn test_timeout_duration() {
        let mut remote = RemoteBuildConfig::from_config(&Config::default());
        assert_eq!(remote.timeout_duration().unwrap(), Duration::from_secs(3600));

        remote.timeout = Some("90.5s".to_string());
        assert_eq!(remote.timeout_duration().unwrap(), Duration::from_millis(90_500));

        remote.timeout = None;
        assert_eq!(remote.timeout_duration().unwrap(), DEFAULT_REMOTE_TIMEOUT);

        remote.timeout = Some("1h".to_string());
        assert!(matches!(remote.timeout_duration(), Err(ReleaseError::Config(_))));
    }
}
