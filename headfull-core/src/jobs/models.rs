use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle of a single page-fetch job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    InProgress,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::InProgress => "in_progress",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a finished job produced: content on success, an error message on
/// failure, plus free-form metadata such as the rendered content length.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    pub url: String,
    pub content: Option<String>,
    pub error: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

/// One url fetch inside a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub session_id: String,
    pub url: String,
    pub status: JobStatus,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub execution_time_ms: Option<i64>,
    pub result: Option<JobResult>,
}

impl Job {
    pub fn new(
        id: impl Into<String>,
        session_id: impl Into<String>,
        url: impl Into<String>,
        queued_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            session_id: session_id.into(),
            url: url.into(),
            status: JobStatus::Queued,
            queued_at,
            started_at: None,
            completed_at: None,
            execution_time_ms: None,
            result: None,
        }
    }

    pub fn mark_started(&mut self) {
        self.status = JobStatus::InProgress;
        self.started_at = Some(Utc::now());
    }

    pub fn mark_completed(&mut self, result: JobResult) {
        self.status = JobStatus::Completed;
        self.result = Some(result);
        self.finish();
    }

    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.status = JobStatus::Failed;
        self.result = Some(JobResult {
            url: self.url.clone(),
            content: None,
            error: Some(error.into()),
            metadata: HashMap::new(),
        });
        self.finish();
    }

    /// Stamps completion time. The duration is only derivable for jobs
    /// that actually started.
    fn finish(&mut self) {
        let completed_at = Utc::now();
        self.completed_at = Some(completed_at);
        if let Some(started_at) = self.started_at {
            self.execution_time_ms = Some((completed_at - started_at).num_milliseconds());
        }
    }
}

/// Lifecycle of a session, the unit of browser ownership.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Created,
    Running,
    Completed,
    Failed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Created => "created",
            SessionStatus::Running => "running",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::Failed)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-session knobs chosen by the submitter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default)]
    pub delay_between_requests: u64,
    #[serde(default)]
    pub proxy_server: Option<String>,
}

/// A url with the id of the job that will fetch it. The order of these
/// within a session is the order the jobs run in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageJob {
    pub url: String,
    pub id: String,
}

/// A batch of jobs sharing one browser process and one config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub status: SessionStatus,
    pub config: SessionConfig,
    pub pages: Vec<PageJob>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn new(
        id: impl Into<String>,
        config: SessionConfig,
        pages: Vec<PageJob>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            status: SessionStatus::Created,
            config,
            pages,
            created_at,
            started_at: None,
            completed_at: None,
        }
    }
}
