use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};
use headfull_core::browser::{BrowserBackend, BrowserManager, ChromeLauncher, ResourcePool};
use headfull_core::config::{load_headfull_config, HeadfullConfig};
use headfull_core::jobs::{
    Job, JobQueue, JobStatus, JobStore, SessionConfig, SessionStatus, SessionStore,
};
use serde::Serialize;
use thiserror::Error;
use tokio::time::{sleep, Instant};
use tracing_subscriber::EnvFilter;

const SESSION_POLL_INTERVAL: Duration = Duration::from_millis(500);

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] headfull_core::error::ConfigError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("session {0} did not finish within the timeout")]
    Timeout(String),
    #[error("session {session_id} finished as {status}")]
    Session { session_id: String, status: String },
    #[error("required resource missing: {0}")]
    MissingResource(String),
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Headfull command-line control interface", long_about = None)]
pub struct Cli {
    /// Path to the main headfull.toml
    #[arg(long, default_value = "configs/headfull.toml")]
    pub config: PathBuf,
    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Fetch a batch of urls through one browser session
    Fetch(FetchArgs),
    /// Run environment checks
    Check,
}

#[derive(Args, Debug)]
pub struct FetchArgs {
    /// Urls to fetch, in order
    #[arg(required = true)]
    pub urls: Vec<String>,
    /// Seconds to wait between pages
    #[arg(long, default_value_t = 0)]
    pub delay: u64,
    /// Proxy server handed to the browser
    #[arg(long)]
    pub proxy: Option<String>,
    /// Deadline in seconds for the whole batch
    #[arg(long, default_value_t = 600)]
    pub timeout: u64,
    /// Directory to write fetched page content into
    #[arg(long)]
    pub output: Option<PathBuf>,
}

pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

pub async fn run(cli: Cli) -> Result<()> {
    match &cli.command {
        Commands::Fetch(args) => {
            let config = load_headfull_config(&cli.config)?;
            let report = fetch_batch(&config, args).await?;
            render(&report, cli.format)?;
            if report.session_status != SessionStatus::Completed {
                return Err(AppError::Session {
                    session_id: report.session_id,
                    status: report.session_status.to_string(),
                });
            }
        }
        Commands::Check => {
            let report = environment_check(&cli.config);
            render(&report, cli.format)?;
            if report
                .iter()
                .any(|entry| matches!(entry.status, CheckStatus::Error))
            {
                return Err(AppError::MissingResource(
                    "one or more checks failed".to_string(),
                ));
            }
        }
    }

    Ok(())
}

fn render<T>(value: &T, format: OutputFormat) -> Result<()>
where
    T: Serialize + DisplayFallback,
{
    match format {
        OutputFormat::Text => {
            println!("{}", value.display());
            Ok(())
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{}", json);
            Ok(())
        }
    }
}

trait DisplayFallback {
    fn display(&self) -> String;
}

/// Stands up the full stack for one batch, waits for the session to
/// finish, and tears everything down again.
async fn fetch_batch(config: &HeadfullConfig, args: &FetchArgs) -> Result<FetchReport> {
    let ports = Arc::new(ResourcePool::new(
        "devtools",
        config.devtools.port_base,
        config.service.max_concurrent_sessions,
    ));
    let launcher = Arc::new(ChromeLauncher::new(
        config.chrome.clone(),
        config.display.clone(),
    ));
    let manager = Arc::new(BrowserManager::new(ports, launcher));
    let queue = JobQueue::new(
        Arc::new(JobStore::new()),
        Arc::new(SessionStore::new()),
        Arc::clone(&manager) as Arc<dyn BrowserBackend>,
        config.service.max_concurrent_sessions,
    );

    queue.start();
    let session = queue.create_session(
        args.urls.clone(),
        SessionConfig {
            delay_between_requests: args.delay,
            proxy_server: args.proxy.clone(),
        },
    );

    let deadline = Instant::now() + Duration::from_secs(args.timeout);
    let record = loop {
        if let Some(record) = queue.get_session(&session.id) {
            if record.status.is_terminal() {
                break record;
            }
        }
        if Instant::now() >= deadline {
            // kill the browsers first so the worker cannot hang the drain
            manager.cleanup().await;
            queue.stop().await;
            return Err(AppError::Timeout(session.id.clone()));
        }
        sleep(SESSION_POLL_INTERVAL).await;
    };

    queue.stop().await;
    manager.cleanup().await;

    if let Some(dir) = &args.output {
        std::fs::create_dir_all(dir)?;
    }
    let jobs: Vec<Option<Job>> = record
        .pages
        .iter()
        .map(|page| queue.get_job(&page.id))
        .collect();
    build_report(&record, &jobs, args.output.as_deref())
}

fn build_report(
    session: &headfull_core::jobs::Session,
    jobs: &[Option<Job>],
    output: Option<&Path>,
) -> Result<FetchReport> {
    let mut pages = Vec::with_capacity(session.pages.len());
    let mut completed = 0;
    let mut failed = 0;
    for (index, page) in session.pages.iter().enumerate() {
        let Some(job) = jobs.get(index).and_then(|job| job.as_ref()) else {
            pages.push(PageReport {
                url: page.url.clone(),
                status: JobStatus::Queued,
                content_bytes: None,
                execution_time_ms: None,
                error: None,
                output: None,
            });
            continue;
        };
        match job.status {
            JobStatus::Completed => completed += 1,
            JobStatus::Failed => failed += 1,
            _ => {}
        }
        let content = job
            .result
            .as_ref()
            .and_then(|result| result.content.as_deref());
        let mut written = None;
        if let (Some(dir), Some(content)) = (output, content) {
            let path = dir.join(format!("page-{}.html", index + 1));
            std::fs::write(&path, content)?;
            written = Some(path.display().to_string());
        }
        pages.push(PageReport {
            url: page.url.clone(),
            status: job.status,
            content_bytes: content.map(|content| content.len() as u64),
            execution_time_ms: job.execution_time_ms,
            error: job.result.as_ref().and_then(|result| result.error.clone()),
            output: written,
        });
    }

    let elapsed_ms = match (session.started_at, session.completed_at) {
        (Some(started_at), Some(completed_at)) => {
            Some((completed_at - started_at).num_milliseconds())
        }
        _ => None,
    };

    Ok(FetchReport {
        session_id: session.id.clone(),
        session_status: session.status,
        requested: session.pages.len(),
        completed,
        failed,
        elapsed_ms,
        pages,
    })
}

#[derive(Debug, Serialize)]
pub struct FetchReport {
    pub session_id: String,
    pub session_status: SessionStatus,
    pub requested: usize,
    pub completed: usize,
    pub failed: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elapsed_ms: Option<i64>,
    pub pages: Vec<PageReport>,
}

#[derive(Debug, Serialize)]
pub struct PageReport {
    pub url: String,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_time_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

impl DisplayFallback for FetchReport {
    fn display(&self) -> String {
        let mut lines = vec![format!(
            "session {}: {} ({} of {} pages fetched)",
            self.session_id, self.session_status, self.completed, self.requested
        )];
        for page in &self.pages {
            let mut line = format!("  [{}] {}", page.status, page.url);
            if let Some(bytes) = page.content_bytes {
                line.push_str(&format!(" {bytes} bytes"));
            }
            if let Some(ms) = page.execution_time_ms {
                line.push_str(&format!(" in {ms} ms"));
            }
            if let Some(error) = &page.error {
                line.push_str(&format!(": {error}"));
            }
            if let Some(path) = &page.output {
                line.push_str(&format!(" -> {path}"));
            }
            lines.push(line);
        }
        if let Some(elapsed) = self.elapsed_ms {
            lines.push(format!("  elapsed: {elapsed} ms"));
        }
        lines.join("\n")
    }
}

/// Static checks for the pieces a fetch needs: a readable config, a
/// browser binary, an X display, and a writable profile base.
pub fn environment_check(config_path: &Path) -> Vec<CheckEntry> {
    let config = match load_headfull_config(config_path) {
        Ok(config) => config,
        Err(err) => return vec![CheckEntry::error("config", err.to_string())],
    };

    vec![
        CheckEntry::ok("config", config_path.display().to_string()),
        check_binary(&config.chrome.binary),
        check_display(),
        check_profile_base(&config.chrome.profile_base),
    ]
}

fn check_binary(binary: &str) -> CheckEntry {
    match std::fs::metadata(binary) {
        Ok(meta) if meta.is_file() => {
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                if meta.permissions().mode() & 0o111 == 0 {
                    return CheckEntry::warn("chrome binary", format!("{binary} is not executable"));
                }
            }
            CheckEntry::ok("chrome binary", binary.to_string())
        }
        Ok(_) => CheckEntry::error("chrome binary", format!("{binary} is not a file")),
        Err(_) => CheckEntry::error("chrome binary", format!("{binary} not found")),
    }
}

fn check_display() -> CheckEntry {
    match std::env::var("DISPLAY") {
        Ok(value) if !value.is_empty() => CheckEntry::ok("display", value),
        _ => CheckEntry::warn(
            "display",
            "DISPLAY not set, sessions will assume :99".to_string(),
        ),
    }
}

fn check_profile_base(base: &str) -> CheckEntry {
    let path = Path::new(base);
    if let Err(err) = std::fs::create_dir_all(path) {
        return CheckEntry::error("profile base", format!("cannot create {base}: {err}"));
    }
    let probe = path.join(".headfullctl-probe");
    match std::fs::write(&probe, b"probe") {
        Ok(()) => {
            let _ = std::fs::remove_file(&probe);
            CheckEntry::ok("profile base", base.to_string())
        }
        Err(err) => CheckEntry::error("profile base", format!("{base} is not writable: {err}")),
    }
}

#[derive(Debug, Serialize)]
pub struct CheckEntry {
    pub name: String,
    pub status: CheckStatus,
    pub detail: String,
}

#[derive(Debug, Serialize)]
pub enum CheckStatus {
    #[serde(rename = "ok")]
    Ok,
    #[serde(rename = "warn")]
    Warn,
    #[serde(rename = "error")]
    Error,
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CheckStatus::Ok => "OK",
            CheckStatus::Warn => "WARN",
            CheckStatus::Error => "ERROR",
        };
        write!(f, "{}", label)
    }
}

impl CheckEntry {
    fn ok(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Ok,
            detail: detail.into(),
        }
    }

    fn warn(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Warn,
            detail: detail.into(),
        }
    }

    fn error(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Error,
            detail: detail.into(),
        }
    }
}

impl DisplayFallback for Vec<CheckEntry> {
    fn display(&self) -> String {
        let mut lines = Vec::new();
        for entry in self {
            lines.push(format!(
                "[{status}] {name}: {detail}",
                status = entry.status,
                name = entry.name,
                detail = entry.detail
            ));
        }
        lines.join("\n")
    }
}
