use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Configuration file structure for zebrad-release.
///
/// Built once at startup and handed to every stage by reference. Nothing in
/// the pipeline reads the ambient process environment for these values.
/// Configuration files are loaded from the current directory or specified path.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    /// Build environment descriptor
    #[serde(default)]
    pub build: BuildConfig,

    /// Runtime image descriptor
    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// Remote build dispatch settings
    #[serde(default)]
    pub trigger: TriggerConfig,

    /// Output format preferences
    #[serde(default)]
    pub output: OutputConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct BuildConfig {
    /// Toolchain image used by the builder stage of the container recipe
    #[serde(default = "default_toolchain_image")]
    pub toolchain_image: String,

    /// Native build tools installed during provisioning
    #[serde(default = "default_system_packages")]
    pub system_packages: Vec<String>,

    /// Overrides the provisioning command derived from `system-packages`
    pub provision_command: Option<String>,

    /// Working directory inside the builder stage
    #[serde(default = "default_workdir")]
    pub workdir: PathBuf,

    /// Dependency cache (`CARGO_HOME`). Local runs fall back to the user cache dir.
    pub cargo_home: Option<PathBuf>,

    /// Value exported as `RUST_BACKTRACE` to every build command
    #[serde(default = "default_rust_backtrace")]
    pub rust_backtrace: String,

    /// Name of the binary produced by the release build
    #[serde(default = "default_binary")]
    pub binary: String,

    /// Cargo target directory, relative to the source checkout when not absolute
    #[serde(default = "default_target_dir")]
    pub target_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RuntimeConfig {
    /// Minimal base image the artifact is copied into
    #[serde(default = "default_base_image")]
    pub base_image: String,

    /// Documented listening port. Metadata only, the image does not bind it.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Arguments of the default entry command (operating mode selector)
    #[serde(default = "default_command_args")]
    pub command_args: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TriggerConfig {
    /// Project namespace the remote build runs in
    #[serde(default = "default_project")]
    pub project: String,

    /// Remote build configuration file, rendered from defaults when missing
    #[serde(default = "default_remote_config")]
    pub remote_config: PathBuf,

    /// Environment variable holding the stored credential
    #[serde(default = "default_credential_env")]
    pub credential_env: String,

    /// Exact version of the remote build tool
    #[serde(default = "default_tool_version")]
    pub tool_version: String,

    /// Base URL of the remote build REST API
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// Registry host images are pushed to
    #[serde(default = "default_registry")]
    pub registry: String,

    /// How the branch part of the substitution identifier is derived
    #[serde(default)]
    pub branch_naming: BranchNaming,

    /// Which dispatcher submits the remote build
    #[serde(default)]
    pub dispatcher: Dispatcher,

    /// Seconds between remote build status polls
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct OutputConfig {
    /// Default output format
    #[serde(default)]
    pub format: OutputFormat,

    /// Pretty-print JSON output
    #[serde(default)]
    pub pretty: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Summary,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum BranchNaming {
    /// Keep the whole branch name, flattening its slashes to dashes
    #[default]
    Full,
    /// Keep only the final path segment of the ref
    LastSegment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Dispatcher {
    /// Cloud Build REST API
    #[default]
    Api,
    /// `gcloud builds submit`
    Gcloud,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            toolchain_image: default_toolchain_image(),
            system_packages: default_system_packages(),
            provision_command: None,
            workdir: default_workdir(),
            cargo_home: None,
            rust_backtrace: default_rust_backtrace(),
            binary: default_binary(),
            target_dir: default_target_dir(),
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            base_image: default_base_image(),
            port: default_port(),
            command_args: default_command_args(),
        }
    }
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            project: default_project(),
            remote_config: default_remote_config(),
            credential_env: default_credential_env(),
            tool_version: default_tool_version(),
            api_url: default_api_url(),
            registry: default_registry(),
            branch_naming: BranchNaming::default(),
            dispatcher: Dispatcher::default(),
            poll_interval_secs: default_poll_interval_secs(),
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            format: OutputFormat::Summary,
            pretty: false,
        }
    }
}

fn default_toolchain_image() -> String {
    "rust:buster".to_string()
}

fn default_system_packages() -> Vec<String> {
    ["make", "cmake", "g++", "gcc"]
        .iter()
        .map(|pkg| (*pkg).to_string())
        .collect()
}

fn default_workdir() -> PathBuf {
    PathBuf::from("/zebra")
}

fn default_rust_backtrace() -> String {
    "1".to_string()
}

fn default_binary() -> String {
    "zebrad".to_string()
}

fn default_target_dir() -> PathBuf {
    PathBuf::from("target")
}

fn default_base_image() -> String {
    "debian:buster-slim".to_string()
}

fn default_port() -> u16 {
    8233
}

fn default_command_args() -> Vec<String> {
    vec!["seed".to_string()]
}

fn default_project() -> String {
    "zealous-zebra".to_string()
}

fn default_remote_config() -> PathBuf {
    PathBuf::from("cloudbuild.yaml")
}

fn default_credential_env() -> String {
    "GCLOUD_AUTH".to_string()
}

fn default_tool_version() -> String {
    "295.0.0".to_string()
}

fn default_api_url() -> String {
    "https://cloudbuild.googleapis.com".to_string()
}

fn default_registry() -> String {
    "gcr.io".to_string()
}

fn default_poll_interval_secs() -> u64 {
    10
}

impl BuildConfig {
    /// Dependency cache used by local runs.
    ///
    /// The configured `cargo-home` wins; otherwise a per-user cache directory
    /// (e.g. `~/.cache/zebrad-release/cargo` on Linux) is used, falling back to
    /// `<source>/.cargo` on platforms without one.
    pub fn local_cargo_home(&self, source_dir: &Path) -> PathBuf {
        if let Some(cargo_home) = &self.cargo_home {
            return cargo_home.clone();
        }

        dirs::cache_dir()
            .map(|dir| dir.join("zebrad-release").join("cargo"))
            .unwrap_or_else(|| source_dir.join(".cargo"))
    }

    /// Cargo home baked into the container recipe.
    pub fn container_cargo_home(&self) -> PathBuf {
        self.cargo_home
            .clone()
            .unwrap_or_else(|| self.workdir.join(".cargo"))
    }

    /// Location of the release binary for a build rooted at `source_dir`.
    pub fn artifact_path(&self, source_dir: &Path) -> PathBuf {
        source_dir
            .join(&self.target_dir)
            .join("release")
            .join(&self.binary)
    }
}

impl RuntimeConfig {
    /// Entry command of the runtime image: the binary at the image root and its mode arguments.
    pub fn entry_command(&self, binary: &str) -> Vec<String> {
        std::iter::once(format!("/{binary}"))
            .chain(self.command_args.iter().cloned())
            .collect()
    }
}

impl Config {
    /// Load configuration from a file.
    ///
    /// Searches for configuration files in this order:
    /// 1. Specified path
    /// 2. ./zebrad-release.toml
    /// 3. ./zebrad-release.json
    /// 4. ./zebrad-release.yaml
    /// 5. ./zebrad-release.yml
    ///
    /// Returns default configuration if no file is found.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::load_from_path(path);
        }

        let candidates = [
            "zebrad-release.toml",
            "zebrad-release.json",
            "zebrad-release.yaml",
            "zebrad-release.yml",
        ];

        for candidate in &candidates {
            let path = Path::new(candidate);
            if path.exists() {
                return Self::load_from_path(path);
            }
        }

        Ok(Self::default())
    }

    /// Load configuration from a specific file path.
    fn load_from_path(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let extension = path.extension().and_then(|ext| ext.to_str()).unwrap_or("");

        let config: Self = match extension {
            "toml" => toml::from_str(&contents)
                .with_context(|| format!("Failed to parse TOML config: {}", path.display()))?,
            "json" => serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse JSON config: {}", path.display()))?,
            "yaml" | "yml" => serde_yaml::from_str(&contents)
                .with_context(|| format!("Failed to parse YAML config: {}", path.display()))?,
            _ => toml::from_str(&contents)
                .or_else(|_| serde_json::from_str(&contents))
                .or_else(|_| serde_yaml::from_str(&contents))
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Rejects configurations the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.build.binary.is_empty() || self.build.binary.contains('/') {
            anyhow::bail!("build.binary must be a bare file name");
        }
        if self.trigger.project.is_empty() {
            anyhow::bail!("trigger.project must not be empty");
        }
        if self.trigger.tool_version.is_empty() {
            anyhow::bail!("trigger.tool-version must pin an exact version");
        }
        Ok(())
    }

    /// Save configuration to a file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let contents = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::to_string_pretty(self)?,
            Some("yaml") | Some("yml") => serde_yaml::to_string(self)?,
            _ => toml::to_string_pretty(self)?,
        };

        std::fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.build.rust_backtrace, "1");
        assert_eq!(config.build.binary, "zebrad");
        assert_eq!(config.runtime.port, 8233);
        assert_eq!(config.runtime.command_args, vec!["seed".to_string()]);
        assert_eq!(config.trigger.project, "zealous-zebra");
        assert_eq!(config.trigger.branch_naming, BranchNaming::Full);
        assert!(matches!(config.output.format, OutputFormat::Summary));
    }

    #[test]
    fn test_load_toml_config() {
        let mut temp_file = NamedTempFile::with_suffix(".toml").unwrap();
        let toml_content = r#"
[build]
toolchain-image = "rust:1.44-buster"
system-packages = ["clang", "cmake"]
cargo-home = "/cache/cargo"

[runtime]
port = 18233
command-args = ["start"]

[trigger]
project = "zebra-staging"
branch-naming = "last-segment"
dispatcher = "gcloud"

[output]
format = "json"
pretty = true
"#;
        write!(temp_file, "{}", toml_content).unwrap();

        let config = Config::load_from_path(temp_file.path()).unwrap();
        assert_eq!(config.build.toolchain_image, "rust:1.44-buster");
        assert_eq!(config.build.system_packages, vec!["clang", "cmake"]);
        assert_eq!(config.build.cargo_home, Some(PathBuf::from("/cache/cargo")));
        assert_eq!(config.build.binary, "zebrad");
        assert_eq!(config.runtime.port, 18233);
        assert_eq!(config.runtime.command_args, vec!["start"]);
        assert_eq!(config.trigger.project, "zebra-staging");
        assert_eq!(config.trigger.branch_naming, BranchNaming::LastSegment);
        assert_eq!(config.trigger.dispatcher, Dispatcher::Gcloud);
        assert_eq!(config.trigger.tool_version, "295.0.0");
        assert!(matches!(config.output.format, OutputFormat::Json));
        assert!(config.output.pretty);
    }

    #[test]
    fn test_load_json_config() {
        let mut temp_file = NamedTempFile::with_suffix(".json").unwrap();
        let json_content = r#"{
  "runtime": {
    "base-image": "gcr.io/distroless/cc"
  },
  "output": {
    "format": "json"
  }
}"#;
        write!(temp_file, "{}", json_content).unwrap();

        let config = Config::load_from_path(temp_file.path()).unwrap();
        assert_eq!(config.runtime.base_image, "gcr.io/distroless/cc");
        assert_eq!(config.runtime.port, 8233);
        assert!(matches!(config.output.format, OutputFormat::Json));
    }

    #[test]
    fn test_load_yaml_config() {
        let mut temp_file = NamedTempFile::with_suffix(".yaml").unwrap();
        write!(temp_file, "trigger:\n  poll-interval-secs: 2\n").unwrap();

        let config = Config::load_from_path(temp_file.path()).unwrap();
        assert_eq!(config.trigger.poll_interval_secs, 2);
    }

    #[test]
    fn test_load_missing_explicit_config_fails() {
        let result = Config::load(Some(Path::new("nonexistent-zebrad-release.toml")));
        assert!(result.is_err());
    }

    #[test]
    fn test_rejects_binary_with_path() {
        let mut temp_file = NamedTempFile::with_suffix(".toml").unwrap();
        write!(temp_file, "[build]\nbinary = \"bin/zebrad\"\n").unwrap();

        let err = Config::load_from_path(temp_file.path()).unwrap_err();
        assert!(err.to_string().contains("bare file name"));
    }

    #[test]
    fn test_save_and_reload() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("zebrad-release.toml");

        let mut config = Config::default();
        config.runtime.port = 9999;
        config.save(&path).unwrap();

        let reloaded = Config::load(Some(&path)).unwrap();
        assert_eq!(reloaded.runtime.port, 9999);
        assert_eq!(reloaded.build.system_packages, config.build.system_packages);
    }

    #[test]
    fn test_artifact_and_cache_paths() {
        let config = BuildConfig {
            cargo_home: Some(PathBuf::from("/cache")),
            ..BuildConfig::default()
        };
        let source = Path::new("/src/zebra");

        assert_eq!(
            config.artifact_path(source),
            PathBuf::from("/src/zebra/target/release/zebrad")
        );
        assert_eq!(config.local_cargo_home(source), PathBuf::from("/cache"));
        assert_eq!(
            BuildConfig::default().container_cargo_home(),
            PathBuf::from("/zebra/.cargo")
        );
    }

    #[test]
    fn test_entry_command_runs_binary_in_seed_mode() {
        let runtime = RuntimeConfig::default();
        assert_eq!(runtime.entry_command("zebrad"), vec!["/zebrad", "seed"]);
    }
}
