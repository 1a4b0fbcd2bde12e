use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::browser::{BrowserBackend, BrowserResult};

use super::models::{Job, JobResult, JobStatus, Session, SessionStatus};
use super::store::{JobStore, SessionStore};

/// Runs one session end to end: browser up, jobs strictly in order,
/// browser down. Failures are recorded on the session and its jobs,
/// never propagated out of the worker.
pub struct SessionWorker {
    session_id: String,
    jobs: Arc<JobStore>,
    sessions: Arc<SessionStore>,
    browser: Arc<dyn BrowserBackend>,
}

impl SessionWorker {
    pub fn new(
        session_id: String,
        jobs: Arc<JobStore>,
        sessions: Arc<SessionStore>,
        browser: Arc<dyn BrowserBackend>,
    ) -> Self {
        Self {
            session_id,
            jobs,
            sessions,
            browser,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub async fn run(&self) {
        let Some(session) = self.sessions.get(&self.session_id) else {
            error!(session_id = %self.session_id, "no session record for worker");
            return;
        };
        info!(session_id = %self.session_id, jobs = session.pages.len(), "session starting");
        self.sessions.update(&self.session_id, |record| {
            record.status = SessionStatus::Running;
            record.started_at = Some(Utc::now());
        });

        match self.process_session(&session).await {
            Ok(()) => {
                self.sessions.update(&self.session_id, |record| {
                    record.status = SessionStatus::Completed;
                    record.completed_at = Some(Utc::now());
                });
                info!(session_id = %self.session_id, "session completed");
            }
            Err(err) => {
                error!(session_id = %self.session_id, error = %err, "session failed");
                self.sessions.update(&self.session_id, |record| {
                    record.status = SessionStatus::Failed;
                    record.completed_at = Some(Utc::now());
                });
                // every job that never got its turn fails with the session
                let message = format!("session failed: {err}");
                for job in self.jobs.get_by_session(&self.session_id) {
                    if matches!(job.status, JobStatus::Queued | JobStatus::InProgress) {
                        self.jobs
                            .update(&job.id, |record| record.mark_failed(message.clone()));
                    }
                }
            }
        }

        self.browser.close_session(&self.session_id).await;
    }

    /// Establishment failure aborts the whole session; a job failure is
    /// recorded on that job alone and the loop moves on.
    async fn process_session(&self, session: &Session) -> BrowserResult<()> {
        self.browser
            .start_session(&self.session_id, &session.config)
            .await?;
        let delay = Duration::from_secs(session.config.delay_between_requests);
        for (index, page) in session.pages.iter().enumerate() {
            self.process_job(&page.id, delay).await;
            let is_last = index + 1 == session.pages.len();
            if !is_last && !delay.is_zero() {
                debug!(session_id = %self.session_id, delay_s = delay.as_secs(), "pausing between jobs");
                sleep(delay).await;
            }
        }
        Ok(())
    }

    async fn process_job(&self, job_id: &str, delay: Duration) {
        let Some(job) = self.jobs.get(job_id) else {
            warn!(job_id, "no job record, skipping");
            return;
        };
        info!(job_id, url = %job.url, "job starting");
        self.jobs.update(job_id, Job::mark_started);

        match self
            .browser
            .fetch_page(&self.session_id, &job.url, delay)
            .await
        {
            Ok(content) => {
                let content_length = content.len();
                let mut metadata = HashMap::new();
                metadata.insert("content_length".to_string(), json!(content_length));
                let result = JobResult {
                    url: job.url.clone(),
                    content: Some(content),
                    error: None,
                    metadata,
                };
                self.jobs
                    .update(job_id, |record| record.mark_completed(result));
                info!(job_id, content_length, "job completed");
            }
            Err(err) => {
                error!(job_id, error = %err, "job failed");
                self.jobs
                    .update(job_id, |record| record.mark_failed(err.to_string()));
            }
        }
    }
}
