use std::collections::HashMap;
use std::sync::Mutex;

use tracing::debug;

use super::models::{Job, Session};

/// In-memory job records. Accessors copy data in and out; callers never
/// hold references into the map, so a returned record is a snapshot.
#[derive(Default)]
pub struct JobStore {
    jobs: Mutex<HashMap<String, Job>>,
}

impl JobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, job: Job) {
        self.jobs.lock().unwrap().insert(job.id.clone(), job);
    }

    pub fn get(&self, id: &str) -> Option<Job> {
        self.jobs.lock().unwrap().get(id).cloned()
    }

    /// Applies `mutate` to the stored record under the lock. Unknown ids
    /// are ignored.
    pub fn update<F>(&self, id: &str, mutate: F)
    where
        F: FnOnce(&mut Job),
    {
        let mut jobs = self.jobs.lock().unwrap();
        match jobs.get_mut(id) {
            Some(job) => mutate(job),
            None => debug!(id, "update for unknown job"),
        }
    }

    pub fn get_by_session(&self, session_id: &str) -> Vec<Job> {
        self.jobs
            .lock()
            .unwrap()
            .values()
            .filter(|job| job.session_id == session_id)
            .cloned()
            .collect()
    }

    pub fn count(&self) -> usize {
        self.jobs.lock().unwrap().len()
    }
}

/// In-memory session records, same access rules as [`JobStore`].
#[derive(Default)]
pub struct SessionStore {
    sessions: Mutex<HashMap<String, Session>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, session: Session) {
        self.sessions
            .lock()
            .unwrap()
            .insert(session.id.clone(), session);
    }

    pub fn get(&self, id: &str) -> Option<Session> {
        self.sessions.lock().unwrap().get(id).cloned()
    }

    pub fn update<F>(&self, id: &str, mutate: F)
    where
        F: FnOnce(&mut Session),
    {
        let mut sessions = self.sessions.lock().unwrap();
        match sessions.get_mut(id) {
            Some(session) => mutate(session),
            None => debug!(id, "update for unknown session"),
        }
    }

    pub fn remove(&self, id: &str) -> Option<Session> {
        self.sessions.lock().unwrap().remove(id)
    }

    pub fn count(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }
}
