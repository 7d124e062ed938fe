use std::future::Future;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::pipeline::{AssembledImage, BuildArtifact};
use crate::trigger::RemoteBuild;

/// Everything a single `build`, `assemble` or `trigger` run did.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub command: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub outcome: Outcome,
    pub steps: Vec<StepRecord>,
    /// `rustc -V`, `cargo -V`, `rustup -V` as reported before the tests ran
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub toolchain: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact: Option<BuildArtifact>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<AssembledImage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub substitution: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_build: Option<RemoteBuild>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Running,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Succeeded,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub name: String,
    pub status: StepStatus,
    pub duration_secs: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl RunReport {
    pub fn new(command: &str) -> Self {
        Self {
            command: command.to_string(),
            started_at: Utc::now(),
            finished_at: None,
            outcome: Outcome::Running,
            steps: Vec::new(),
            toolchain: Vec::new(),
            artifact: None,
            image: None,
            substitution: None,
            remote_build: None,
            error: None,
        }
    }

    pub fn record(
        &mut self,
        name: impl Into<String>,
        status: StepStatus,
        elapsed: Duration,
        detail: Option<String>,
    ) {
        self.steps.push(StepRecord {
            name: name.into(),
            status,
            duration_secs: elapsed.as_secs_f64(),
            detail,
        });
    }

    /// Seals the report with the run's final result.
    pub fn finish<T, E: std::fmt::Display>(&mut self, result: &Result<T, E>) {
        self.finished_at = Some(Utc::now());
        match result {
            Ok(_) => self.outcome = Outcome::Succeeded,
            Err(err) => {
                self.outcome = Outcome::Failed;
                self.error = Some(err.to_string());
            }
        }
    }

    /// Awaits `step` and records it under `name` with its duration and outcome.
    pub async fn track<T, E, F>(&mut self, name: &str, step: F) -> Result<T, E>
    where
        E: std::fmt::Display,
        F: Future<Output = Result<T, E>>,
    {
        let started = Instant::now();
        let result = step.await;
        match &result {
            Ok(_) => self.record(name, StepStatus::Succeeded, started.elapsed(), None),
            Err(err) => self.record(
                name,
                StepStatus::Failed,
                started.elapsed(),
                Some(err.to_string()),
            ),
        }
        result
    }

    pub fn step(&self, name: &str) -> Option<&StepRecord> {
        self.steps.iter().find(|step| step.name == name)
    }

    pub fn total_duration_secs(&self) -> f64 {
        self.steps.iter().map(|step| step.duration_secs).sum()
    }
}
