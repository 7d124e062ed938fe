use std::time::Duration;

use indexmap::IndexMap;
use log::{debug, info, warn};
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use url::Url;

use crate::auth::Credential;
use crate::config::TriggerConfig;
use crate::error::{ReleaseError, Result};
use crate::recipe::RemoteStep;

use super::dispatch::{BuildSubmission, RemoteBuild, RemoteBuildService, RemoteBuildStatus};

/// Cloud Build REST API client.
///
/// Submits builds with `POST v1/projects/{project}/builds` and polls the
/// created build until it reaches a terminal status, the build's own timeout
/// passes, or the service reports a status it cannot name. Requests are never
/// retried: a failed submission fails the run.
pub struct CloudBuildApi {
    client: Client,
    api_url: Url,
    credential: Credential,
    poll_interval: Duration,
}

impl CloudBuildApi {
    /// Creates a client pinned to `trigger.tool-version`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the API URL is invalid or the HTTP
    /// client cannot be built.
    pub fn new(trigger: &TriggerConfig, credential: Credential) -> Result<Self> {
        let client = Client::builder()
            .user_agent(format!(
                "zebrad-release/{} google-cloud-sdk/{}",
                env!("CARGO_PKG_VERSION"),
                trigger.tool_version
            ))
            .build()
            .map_err(|e| ReleaseError::Config(format!("Failed to create HTTP client: {e}")))?;

        let api_url = Url::parse(&trigger.api_url)
            .map_err(|e| ReleaseError::Config(format!("Invalid API base URL: {e}")))?;

        Ok(Self {
            client,
            api_url,
            credential,
            poll_interval: Duration::from_secs(trigger.poll_interval_secs),
        })
    }

    /// Creates a client and checks the credential against `project`.
    pub async fn connect(trigger: &TriggerConfig, credential: Credential) -> Result<Self> {
        let api = Self::new(trigger, credential)?;
        api.authenticate(&trigger.project).await?;
        Ok(api)
    }

    /// Verifies the credential may list builds in `project`.
    ///
    /// # Errors
    ///
    /// Returns `AuthFailed` on 401/403, `ApiError` on any other failure status.
    pub async fn authenticate(&self, project: &str) -> Result<()> {
        let mut url = self.builds_url(project)?;
        url.query_pairs_mut().append_pair("pageSize", "1");

        let response = self
            .client
            .get(url)
            .bearer_auth(self.credential.as_str())
            .send()
            .await?;
        check_status(response).await?;

        info!("Authenticated to remote build project {project}");
        Ok(())
    }

    fn builds_url(&self, project: &str) -> Result<Url> {
        self.api_url
            .join(&format!("v1/projects/{project}/builds"))
            .map_err(|e| ReleaseError::Config(format!("Invalid builds URL: {e}")))
    }

    fn build_url(&self, project: &str, id: &str) -> Result<Url> {
        self.api_url
            .join(&format!("v1/projects/{project}/builds/{id}"))
            .map_err(|e| ReleaseError::Config(format!("Invalid build URL: {e}")))
    }

    async fn create_build(&self, submission: &BuildSubmission) -> Result<RemoteBuild> {
        let request = BuildRequest {
            source: BuildSource {
                git_source: GitSource {
                    url: format!("https://github.com/{}.git", submission.repository),
                    revision: &submission.git_ref,
                },
            },
            steps: &submission.config.steps,
            images: &submission.config.images,
            timeout: submission.config.timeout.as_deref(),
            substitutions: &submission.substitutions,
        };

        let response = self
            .client
            .post(self.builds_url(&submission.project)?)
            .bearer_auth(self.credential.as_str())
            .json(&request)
            .send()
            .await?;
        let operation: Operation = check_status(response).await?.json().await?;

        let build = operation
            .metadata
            .and_then(|metadata| metadata.build)
            .ok_or_else(|| {
                ReleaseError::DispatchFailed(format!(
                    "operation {} did not describe a build",
                    operation.name
                ))
            })?;

        Ok(build.into())
    }

    async fn fetch_build(&self, project: &str, id: &str) -> Result<RemoteBuild> {
        let response = self
            .client
            .get(self.build_url(project, id)?)
            .bearer_auth(self.credential.as_str())
            .send()
            .await?;
        let build: BuildResource = check_status(response).await?.json().await?;
        Ok(build.into())
    }
}

impl RemoteBuildService for CloudBuildApi {
    async fn submit(&self, submission: &BuildSubmission) -> Result<RemoteBuild> {
        let timeout = submission.config.timeout_duration()?;
        let deadline = Instant::now() + timeout;
        let mut build = self.create_build(submission).await?;
        info!(
            "Remote build {} created{}",
            build.id,
            build
                .log_url
                .as_deref()
                .map(|url| format!(", logs at {url}"))
                .unwrap_or_default()
        );

        while !build.status.is_terminal() {
            if Instant::now() >= deadline {
                warn!(
                    "Remote build {} still {} after {}s",
                    build.id,
                    build.status.as_str(),
                    timeout.as_secs()
                );
                return Err(ReleaseError::RemoteBuildFailed {
                    id: build.id,
                    status: RemoteBuildStatus::Timeout.as_str().to_string(),
                });
            }

            tokio::time::sleep(self.poll_interval).await;
            build = self.fetch_build(&submission.project, &build.id).await?;
            debug!("Remote build {} is {}", build.id, build.status.as_str());

            if build.status == RemoteBuildStatus::StatusUnknown {
                warn!("Remote build {} reports no known status", build.id);
                break;
            }
        }

        Ok(build)
    }
}

async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let message = response
        .text()
        .await
        .unwrap_or_else(|_| "Unable to read error response".to_string());

    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(ReleaseError::AuthFailed(format!("{status}: {message}")));
    }

    Err(ReleaseError::ApiError {
        status: status.as_u16(),
        message,
    })
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct BuildRequest<'a> {
    source: BuildSource<'a>,
    steps: &'a [RemoteStep],
    #[serde(skip_serializing_if = "<[String]>::is_empty")]
    images: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    timeout: Option<&'a str>,
    substitutions: &'a IndexMap<String, String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct BuildSource<'a> {
    git_source: GitSource<'a>,
}

#[derive(Serialize)]
struct GitSource<'a> {
    url: String,
    revision: &'a str,
}

#[derive(Deserialize)]
struct Operation {
    name: String,
    metadata: Option<OperationMetadata>,
}

#[derive(Deserialize)]
struct OperationMetadata {
    build: Option<BuildResource>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BuildResource {
    id: String,
    status: Option<RemoteBuildStatus>,
    log_url: Option<String>,
}

impl From<BuildResource> for RemoteBuild {
    fn from(build: BuildResource) -> Self {
        Self {
            id: build.id,
            status: build.status.unwrap_or(RemoteBuildStatus::StatusUnknown),
            log_url: build.log_url,
        }
    }
}
