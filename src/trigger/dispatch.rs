use std::path::PathBuf;

use indexmap::IndexMap;
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::error::{ReleaseError, Result};
use crate::recipe::RemoteBuildConfig;

/// Everything the remote build service needs for one run.
#[derive(Debug, Clone)]
pub struct BuildSubmission {
    /// Project namespace the build runs in and publishes to
    pub project: String,
    /// Repository in `owner/name` form
    pub repository: String,
    pub git_ref: String,
    /// Local checkout uploaded by dispatchers that ship sources themselves
    pub source_dir: PathBuf,
    pub config: RemoteBuildConfig,
    pub substitutions: IndexMap<String, String>,
}

/// Terminal or in-flight state of a remote build, as reported by the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RemoteBuildStatus {
    Pending,
    Queued,
    Working,
    Success,
    Failure,
    InternalError,
    Timeout,
    Cancelled,
    Expired,
    #[serde(other)]
    StatusUnknown,
}

impl RemoteBuildStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(
            self,
            RemoteBuildStatus::Pending
                | RemoteBuildStatus::Queued
                | RemoteBuildStatus::Working
                | RemoteBuildStatus::StatusUnknown
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RemoteBuildStatus::Pending => "PENDING",
            RemoteBuildStatus::Queued => "QUEUED",
            RemoteBuildStatus::Working => "WORKING",
            RemoteBuildStatus::Success => "SUCCESS",
            RemoteBuildStatus::Failure => "FAILURE",
            RemoteBuildStatus::InternalError => "INTERNAL_ERROR",
            RemoteBuildStatus::Timeout => "TIMEOUT",
            RemoteBuildStatus::Cancelled => "CANCELLED",
            RemoteBuildStatus::Expired => "EXPIRED",
            RemoteBuildStatus::StatusUnknown => "STATUS_UNKNOWN",
        }
    }
}

/// A remote build as last seen by the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteBuild {
    pub id: String,
    pub status: RemoteBuildStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_url: Option<String>,
}

/// A remote service that builds, tests and publishes an image.
///
/// Implementations return once the build reached a terminal status. Retrying
/// and isolating concurrent pushes is the service's job, not the caller's.
#[allow(async_fn_in_trait)]
pub trait RemoteBuildService {
    async fn submit(&self, submission: &BuildSubmission) -> Result<RemoteBuild>;
}

/// Submits a build and turns any non-successful outcome into an error.
///
/// # Errors
///
/// Returns `DispatchFailed` if a substitution is not referenced by the remote
/// configuration, the service's own error if submission fails, and
/// `RemoteBuildFailed` if the build ends in any status but `SUCCESS`.
pub async fn dispatch<S: RemoteBuildService>(
    service: &S,
    submission: &BuildSubmission,
) -> Result<RemoteBuild> {
    if let Some(unused) = submission
        .substitutions
        .keys()
        .find(|key| !submission.config.references(key))
    {
        return Err(ReleaseError::DispatchFailed(format!(
            "substitution {unused} is not used by the remote build configuration"
        )));
    }

    info!(
        "Dispatching remote build of {}@{} to project {}",
        submission.repository, submission.git_ref, submission.project
    );

    let build = service.submit(submission).await?;

    if build.status != RemoteBuildStatus::Success {
        warn!("Remote build {} ended with {}", build.id, build.status.as_str());
        return Err(ReleaseError::RemoteBuildFailed {
            id: build.id,
            status: build.status.as_str().to_string(),
        });
    }

    info!("Remote build {} succeeded", build.id);
    Ok(build)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::config::Config;

    struct FakeService {
        status: RemoteBuildStatus,
        submitted: Mutex<Vec<IndexMap<String, String>>>,
    }

    impl FakeService {
        fn new(status: RemoteBuildStatus) -> Self {
            Self {
                status,
                submitted: Mutex::new(Vec::new()),
            }
        }
    }

    impl RemoteBuildService for FakeService {
        async fn submit(&self, submission: &BuildSubmission) -> Result<RemoteBuild> {
            self.submitted
                .lock()
                .unwrap()
                .push(submission.substitutions.clone());
            Ok(RemoteBuild {
                id: "b-1".to_string(),
                status: self.status,
                log_url: None,
            })
        }
    }

    fn submission(key: &str) -> BuildSubmission {
        let mut substitutions = IndexMap::new();
        substitutions.insert(key.to_string(), "org/zebra/main".to_string());
        BuildSubmission {
            project: "zealous-zebra".to_string(),
            repository: "org/zebra".to_string(),
            git_ref: "refs/heads/main".to_string(),
            source_dir: PathBuf::from("."),
            config: RemoteBuildConfig::from_config(&Config::default()),
            substitutions,
        }
    }

    #[tokio::test]
    async fn test_successful_dispatch() {
        let service = FakeService::new(RemoteBuildStatus::Success);
        let build = dispatch(&service, &submission("BRANCH_NAME")).await.unwrap();

        assert_eq!(build.id, "b-1");
        let submitted = service.submitted.lock().unwrap();
        assert_eq!(submitted.len(), 1);
        assert_eq!(submitted[0]["BRANCH_NAME"], "org/zebra/main");
    }

    #[tokio::test]
    async fn test_failed_remote_build_is_an_error() {
        let service = FakeService::new(RemoteBuildStatus::Failure);
        let result = dispatch(&service, &submission("BRANCH_NAME")).await;

        match result {
            Err(ReleaseError::RemoteBuildFailed { id, status }) => {
                assert_eq!(id, "b-1");
                assert_eq!(status, "FAILURE");
            }
            other => panic!("expected RemoteBuildFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unused_substitution_is_not_submitted() {
        let service = FakeService::new(RemoteBuildStatus::Success);
        let result = dispatch(&service, &submission("_UNUSED")).await;

        assert!(matches!(result, Err(ReleaseError::DispatchFailed(_))));
        assert!(service.submitted.lock().unwrap().is_empty());
    }

    #[test]
    fn test_status_parsing() {
        let status: RemoteBuildStatus = serde_json::from_str("\"INTERNAL_ERROR\"").unwrap();
        assert_eq!(status, RemoteBuildStatus::InternalError);
        assert!(status.is_terminal());

        let status: RemoteBuildStatus = serde_json::from_str("\"SOMETHING_NEW\"").unwrap();
        assert_eq!(status, RemoteBuildStatus::StatusUnknown);
        assert!(!status.is_terminal());

        assert!(!RemoteBuildStatus::Working.is_terminal());
    }
}
