mod models;
mod queue;
mod store;
mod worker;

pub use models::{Job, JobResult, JobStatus, PageJob, Session, SessionConfig, SessionStatus};
pub use queue::JobQueue;
pub use store::{JobStore, SessionStore};
pub use worker::SessionWorker;
