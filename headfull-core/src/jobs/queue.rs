use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::browser::BrowserBackend;

use super::models::{Job, PageJob, Session, SessionConfig};
use super::store::{JobStore, SessionStore};
use super::worker::SessionWorker;

const DISPATCH_IDLE_POLL: Duration = Duration::from_secs(1);

type WorkerTable = Arc<Mutex<HashMap<String, JoinHandle<()>>>>;

/// Accepts url batches as sessions and dispatches them to workers, at
/// most `max_concurrent_sessions` at a time, in submission order.
pub struct JobQueue {
    jobs: Arc<JobStore>,
    sessions: Arc<SessionStore>,
    browser: Arc<dyn BrowserBackend>,
    submit_tx: UnboundedSender<String>,
    submit_rx: Mutex<Option<UnboundedReceiver<String>>>,
    semaphore: Arc<Semaphore>,
    workers: WorkerTable,
    running: Arc<AtomicBool>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl JobQueue {
    pub fn new(
        jobs: Arc<JobStore>,
        sessions: Arc<SessionStore>,
        browser: Arc<dyn BrowserBackend>,
        max_concurrent_sessions: usize,
    ) -> Self {
        let (submit_tx, submit_rx) = mpsc::unbounded_channel();
        Self {
            jobs,
            sessions,
            browser,
            submit_tx,
            submit_rx: Mutex::new(Some(submit_rx)),
            semaphore: Arc::new(Semaphore::new(max_concurrent_sessions)),
            workers: Arc::new(Mutex::new(HashMap::new())),
            running: Arc::new(AtomicBool::new(false)),
            dispatcher: Mutex::new(None),
        }
    }

    /// Registers a batch of urls as one session with one job per url and
    /// enqueues it. Jobs enter the store in submission order, sharing one
    /// enqueue timestamp with the session.
    pub fn create_session(&self, urls: Vec<String>, config: SessionConfig) -> Session {
        let session_id = Uuid::new_v4().to_string();
        let created_at = Utc::now();
        let mut pages = Vec::with_capacity(urls.len());
        for url in urls {
            let job_id = Uuid::new_v4().to_string();
            self.jobs.add(Job::new(
                job_id.clone(),
                session_id.clone(),
                url.clone(),
                created_at,
            ));
            pages.push(PageJob { url, id: job_id });
        }
        let session = Session::new(session_id.clone(), config, pages, created_at);
        self.sessions.add(session.clone());
        if self.submit_tx.send(session_id.clone()).is_err() {
            warn!(session_id = %session_id, "queue is not accepting sessions");
        }
        info!(session_id = %session_id, jobs = session.pages.len(), "session queued");
        session
    }

    /// Spawns the dispatch loop. A queue that was already started, or
    /// was stopped before, stays as it is.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("job queue already running");
            return;
        }
        let Some(submit_rx) = self.submit_rx.lock().unwrap().take() else {
            warn!("job queue cannot restart after stop");
            self.running.store(false, Ordering::SeqCst);
            return;
        };
        let context = DispatchContext {
            jobs: Arc::clone(&self.jobs),
            sessions: Arc::clone(&self.sessions),
            browser: Arc::clone(&self.browser),
            semaphore: Arc::clone(&self.semaphore),
            workers: Arc::clone(&self.workers),
            running: Arc::clone(&self.running),
        };
        let task = tokio::spawn(dispatch_loop(submit_rx, context));
        *self.dispatcher.lock().unwrap() = Some(task);
        info!("job queue started");
    }

    /// Stops dispatching and waits for the active workers to finish.
    /// Sessions still waiting in the queue stay in their created state.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let dispatcher = self.dispatcher.lock().unwrap().take();
        if let Some(task) = dispatcher {
            task.abort();
            let _ = task.await;
        }
        let drained: Vec<(String, JoinHandle<()>)> = {
            let mut workers = self.workers.lock().unwrap();
            workers.drain().collect()
        };
        if !drained.is_empty() {
            info!(active = drained.len(), "draining active session workers");
        }
        for (session_id, handle) in drained {
            if let Err(err) = handle.await {
                if !err.is_cancelled() {
                    error!(session_id = %session_id, error = %err, "session worker panicked");
                }
            }
        }
        info!("job queue stopped");
    }

    pub fn get_job(&self, id: &str) -> Option<Job> {
        self.jobs.get(id)
    }

    pub fn get_session(&self, id: &str) -> Option<Session> {
        self.sessions.get(id)
    }

    /// Number of sessions currently held by a worker.
    pub fn active_sessions(&self) -> usize {
        self.workers.lock().unwrap().len()
    }
}

struct DispatchContext {
    jobs: Arc<JobStore>,
    sessions: Arc<SessionStore>,
    browser: Arc<dyn BrowserBackend>,
    semaphore: Arc<Semaphore>,
    workers: WorkerTable,
    running: Arc<AtomicBool>,
}

async fn dispatch_loop(mut submit_rx: UnboundedReceiver<String>, context: DispatchContext) {
    debug!("dispatch loop running");
    while context.running.load(Ordering::SeqCst) {
        // the recv timeout keeps the loop checking the running flag
        let session_id = match timeout(DISPATCH_IDLE_POLL, submit_rx.recv()).await {
            Err(_) => continue,
            Ok(None) => break,
            Ok(Some(session_id)) => session_id,
        };
        let permit = match Arc::clone(&context.semaphore).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };
        let worker = SessionWorker::new(
            session_id.clone(),
            Arc::clone(&context.jobs),
            Arc::clone(&context.sessions),
            Arc::clone(&context.browser),
        );
        let workers = Arc::clone(&context.workers);
        // the table entry must exist before the worker can remove it, so
        // the lock is held across the spawn
        let mut table = context.workers.lock().unwrap();
        let handle = tokio::spawn(async move {
            worker.run().await;
            drop(permit);
            workers.lock().unwrap().remove(worker.session_id());
        });
        table.insert(session_id, handle);
        debug!(active = table.len(), "session dispatched");
    }
    debug!("dispatch loop exited");
}
