use std::path::{Path, PathBuf};

use tokio::fs;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::error::{ReleaseError, Result};
use crate::report::RunReport;

use super::blocking;
use super::build::BuildArtifact;

const ROOTFS_DIR: &str = "rootfs";
const MANIFEST_FILE: &str = "config.json";
const STAGED_MANIFEST_FILE: &str = "config.json.partial";

/// Image configuration written next to the image root.
///
/// Field names follow the container image config format so the file can be
/// fed to image tooling as-is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ImageManifest {
    pub base_image: String,
    pub created: DateTime<Utc>,
    pub env: Vec<String>,
    /// Documented ports, e.g. `{"8233/tcp": {}}`. Metadata only.
    pub exposed_ports: IndexMap<String, serde_json::Map<String, serde_json::Value>>,
    pub cmd: Vec<String>,
    pub working_dir: String,
    pub artifact: ImageArtifact,
}

/// Where the binary lives inside the image and what it must hash to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ImageArtifact {
    pub path: String,
    pub sha256: String,
    pub size: u64,
}

/// A runtime image laid out on disk: `rootfs/` plus `config.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssembledImage {
    pub dir: PathBuf,
    pub manifest: ImageManifest,
}

impl AssembledImage {
    pub fn rootfs(&self) -> PathBuf {
        self.dir.join(ROOTFS_DIR)
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.dir.join(MANIFEST_FILE)
    }
}

/// Assembles the smallest deployable image: the compiled binary and nothing else.
pub struct RuntimeStage<'a> {
    config: &'a Config,
    image_dir: PathBuf,
}

impl<'a> RuntimeStage<'a> {
    pub fn new(config: &'a Config, image_dir: impl Into<PathBuf>) -> Self {
        Self {
            config,
            image_dir: image_dir.into(),
        }
    }

    /// Copies `artifact` into a fresh image root, writes the image config and
    /// verifies the result.
    ///
    /// The previous `config.json` is removed before anything else changes and
    /// the new one is only moved into place once the root is complete, so an
    /// image directory with a manifest always describes a finished image.
    ///
    /// # Errors
    ///
    /// Returns `ArtifactMissing` when the binary does not exist (an upstream
    /// build failure), `ImageContaminated` if verification finds anything
    /// besides the binary, or an I/O error.
    pub async fn assemble(&self, artifact: &Path, report: &mut RunReport) -> Result<AssembledImage> {
        let image = report
            .track("assemble", self.assemble_image(artifact))
            .await?;
        report.image = Some(image.clone());

        let dir = image.dir.clone();
        report
            .track("verify-image", blocking(move || verify_image(&dir)))
            .await?;
        Ok(image)
    }

    async fn assemble_image(&self, artifact: &Path) -> Result<AssembledImage> {
        let built = BuildArtifact::hash(artifact).await?;
        let binary = &self.config.build.binary;
        let runtime = &self.config.runtime;

        fs::create_dir_all(&self.image_dir).await?;
        self.clear_previous().await?;

        let rootfs = self.image_dir.join(ROOTFS_DIR);
        fs::create_dir_all(&rootfs).await?;

        let target = rootfs.join(binary);
        fs::copy(&built.path, &target).await?;
        make_executable(&target).await?;

        let mut exposed_ports = IndexMap::new();
        exposed_ports.insert(format!("{}/tcp", runtime.port), serde_json::Map::new());

        let manifest = ImageManifest {
            base_image: runtime.base_image.clone(),
            created: Utc::now(),
            env: vec![format!("PORT={}", runtime.port)],
            exposed_ports,
            cmd: runtime.entry_command(binary),
            working_dir: "/".to_string(),
            artifact: ImageArtifact {
                path: format!("/{binary}"),
                sha256: built.sha256,
                size: built.size,
            },
        };

        let staged = self.image_dir.join(STAGED_MANIFEST_FILE);
        fs::write(&staged, serde_json::to_string_pretty(&manifest)?).await?;
        fs::rename(&staged, self.image_dir.join(MANIFEST_FILE)).await?;

        info!(
            "Assembled image at {} ({} on {})",
            self.image_dir.display(),
            manifest.cmd.join(" "),
            manifest.base_image
        );

        Ok(AssembledImage {
            dir: self.image_dir.clone(),
            manifest,
        })
    }

    /// Drops the previous manifest first, then the previous root.
    async fn clear_previous(&self) -> Result<()> {
        let manifest = self.image_dir.join(MANIFEST_FILE);
        if fs::try_exists(&manifest).await? {
            fs::remove_file(&manifest).await?;
        }

        let rootfs = self.image_dir.join(ROOTFS_DIR);
        if fs::try_exists(&rootfs).await? {
            debug!("Clearing previous image root {}", rootfs.display());
            fs::remove_dir_all(&rootfs).await?;
        }
        Ok(())
    }
}

/// Checks that an assembled image root holds exactly the declared artifact.
///
/// # Errors
///
/// Returns `ImageContaminated` if the root contains any other entry, the
/// artifact is missing, or its digest differs from the one in `config.json`.
pub fn verify_image(image_dir: &Path) -> Result<()> {
    let manifest: ImageManifest =
        serde_json::from_str(&std::fs::read_to_string(image_dir.join(MANIFEST_FILE))?)?;
    let rootfs = image_dir.join(ROOTFS_DIR);

    let mut entries = Vec::new();
    collect_entries(&rootfs, &rootfs, &mut entries)?;

    let expected = manifest.artifact.path.trim_start_matches('/');
    if let Some(extra) = entries.iter().find(|entry| entry.as_str() != expected) {
        return Err(ReleaseError::ImageContaminated(format!(
            "unexpected entry /{extra}"
        )));
    }
    if entries.is_empty() {
        return Err(ReleaseError::ImageContaminated(format!(
            "artifact {} is missing",
            manifest.artifact.path
        )));
    }

    let actual = BuildArtifact::from_path(&rootfs.join(expected))?;
    if actual.sha256 != manifest.artifact.sha256 {
        return Err(ReleaseError::ImageContaminated(format!(
            "artifact digest {} does not match {}",
            actual.sha256, manifest.artifact.sha256
        )));
    }

    debug!("Image {} verified", image_dir.display());
    Ok(())
}

fn collect_entries(root: &Path, dir: &Path, entries: &mut Vec<String>) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let relative = path
            .strip_prefix(root)
            .unwrap_or(&path)
            .to_string_lossy()
            .into_owned();

        if path.is_dir() && !path.is_symlink() {
            entries.push(format!("{relative}/"));
            collect_entries(root, &path, entries)?;
        } else {
            entries.push(relative);
        }
    }
    Ok(())
}

#[cfg(unix)]
async fn make_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn make_executable(_path: &Path) -> Result<()> {
    Ok(())
}
