use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::jobs::SessionConfig;

use super::cdp::CdpClient;
use super::chrome::ChromeLauncher;
use super::error::{BrowserError, BrowserResult};
use super::pool::ResourcePool;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_DISPLAY: u32 = 99;

fn display_from_env() -> u32 {
    std::env::var("DISPLAY")
        .ok()
        .and_then(|display| {
            display
                .trim_start_matches(':')
                .split('.')
                .next()?
                .parse::<u32>()
                .ok()
        })
        .unwrap_or(DEFAULT_DISPLAY)
}

/// One session's browser: a debug port, a chrome process and a protocol
/// client, owned together so establishment can roll back cleanly.
#[derive(Debug)]
pub struct BrowserSession {
    session_id: String,
    config: SessionConfig,
    ports: Arc<ResourcePool>,
    launcher: Arc<ChromeLauncher>,
    devtools_port: Mutex<Option<u16>>,
    client: Mutex<Option<Arc<CdpClient>>>,
}

impl BrowserSession {
    pub fn new(
        session_id: impl Into<String>,
        config: SessionConfig,
        ports: Arc<ResourcePool>,
        launcher: Arc<ChromeLauncher>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            config,
            ports,
            launcher,
            devtools_port: Mutex::new(None),
            client: Mutex::new(None),
        }
    }

    /// Acquires a debug port, launches the browser on the shared display
    /// and connects the protocol client. Any failure releases whatever
    /// was already acquired before the error is returned.
    pub async fn start(&self) -> BrowserResult<()> {
        let display_num = display_from_env();
        let Some(port) = self.ports.acquire() else {
            return Err(BrowserError::PortsExhausted);
        };
        *self.devtools_port.lock().unwrap() = Some(port);

        if let Err(err) = self.establish(display_num, port).await {
            warn!(session_id = %self.session_id, error = %err, "session establishment failed");
            self.stop().await;
            return Err(err);
        }
        info!(session_id = %self.session_id, port, display = display_num, "browser session started");
        Ok(())
    }

    async fn establish(&self, display_num: u32, port: u16) -> BrowserResult<()> {
        self.launcher
            .launch(
                &self.session_id,
                display_num,
                port,
                self.config.proxy_server.as_deref(),
            )
            .await?;
        let client = CdpClient::new(port);
        client.connect(CONNECT_TIMEOUT).await?;
        *self.client.lock().unwrap() = Some(Arc::new(client));
        Ok(())
    }

    /// Best-effort teardown: disconnect the client, terminate the
    /// process, release the port. Safe to call twice and on a partially
    /// started session.
    pub async fn stop(&self) {
        let client = self.client.lock().unwrap().take();
        if let Some(client) = client {
            client.disconnect().await;
        }
        self.launcher.terminate(&self.session_id).await;
        let port = self.devtools_port.lock().unwrap().take();
        if let Some(port) = port {
            self.ports.release(port);
        }
        debug!(session_id = %self.session_id, "browser session stopped");
    }

    /// Navigates, waits for the load to finish, optionally settles, then
    /// extracts the rendered markup.
    pub async fn navigate_and_get_content(
        &self,
        url: &str,
        delay: Duration,
    ) -> BrowserResult<String> {
        let client = self
            .client
            .lock()
            .unwrap()
            .clone()
            .ok_or(BrowserError::NotConnected)?;
        client.navigate(url).await?;
        client.wait_for_load().await?;
        if !delay.is_zero() {
            debug!(session_id = %self.session_id, delay_s = delay.as_secs(), "settling after load");
            sleep(delay).await;
        }
        client.get_content().await
    }
}

/// Registry of active browser sessions keyed by session id. The registry
/// lock covers only lookups, inserts and removals; establishment runs
/// under a dedicated startup lock instead, so fetches and closes on
/// running sessions never wait behind an admission.
pub struct BrowserManager {
    ports: Arc<ResourcePool>,
    launcher: Arc<ChromeLauncher>,
    sessions: Mutex<HashMap<String, Arc<BrowserSession>>>,
    startup: AsyncMutex<()>,
}

impl BrowserManager {
    pub fn new(ports: Arc<ResourcePool>, launcher: Arc<ChromeLauncher>) -> Self {
        Self {
            ports,
            launcher,
            sessions: Mutex::new(HashMap::new()),
            startup: AsyncMutex::new(()),
        }
    }

    /// Starts a browser for the session and registers it. Startups
    /// serialize on the startup lock; the registry lock is never held
    /// across establishment.
    pub async fn create_session(
        &self,
        session_id: &str,
        config: &SessionConfig,
    ) -> BrowserResult<Arc<BrowserSession>> {
        let _startup = self.startup.lock().await;
        if self.sessions.lock().unwrap().contains_key(session_id) {
            return Err(BrowserError::SessionExists(session_id.to_string()));
        }
        let session = Arc::new(BrowserSession::new(
            session_id,
            config.clone(),
            Arc::clone(&self.ports),
            Arc::clone(&self.launcher),
        ));
        session.start().await?;
        let active = {
            let mut sessions = self.sessions.lock().unwrap();
            sessions.insert(session_id.to_string(), Arc::clone(&session));
            sessions.len()
        };
        info!(session_id, active, "browser session registered");
        Ok(session)
    }

    /// Stops and forgets the session. Unknown ids are a no-op.
    pub async fn close_session(&self, session_id: &str) {
        let session = self.sessions.lock().unwrap().remove(session_id);
        if let Some(session) = session {
            session.stop().await;
            debug!(session_id, "browser session closed");
        }
    }

    /// Closes every active session. Shutdown path.
    pub async fn cleanup(&self) {
        let session_ids: Vec<String> = self.sessions.lock().unwrap().keys().cloned().collect();
        if !session_ids.is_empty() {
            info!(count = session_ids.len(), "closing all browser sessions");
        }
        for session_id in session_ids {
            self.close_session(&session_id).await;
        }
    }

    pub fn active_session_count(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }
}

/// Seam between the job scheduler and the browser layer.
#[async_trait]
pub trait BrowserBackend: Send + Sync {
    async fn start_session(&self, session_id: &str, config: &SessionConfig) -> BrowserResult<()>;
    async fn fetch_page(
        &self,
        session_id: &str,
        url: &str,
        delay: Duration,
    ) -> BrowserResult<String>;
    async fn close_session(&self, session_id: &str);
}

#[async_trait]
impl BrowserBackend for BrowserManager {
    async fn start_session(&self, session_id: &str, config: &SessionConfig) -> BrowserResult<()> {
        self.create_session(session_id, config).await?;
        Ok(())
    }

    async fn fetch_page(
        &self,
        session_id: &str,
        url: &str,
        delay: Duration,
    ) -> BrowserResult<String> {
        let session = self
            .sessions
            .lock()
            .unwrap()
            .get(session_id)
            .cloned()
            .ok_or_else(|| BrowserError::SessionNotFound(session_id.to_string()))?;
        session.navigate_and_get_content(url, delay).await
    }

    async fn close_session(&self, session_id: &str) {
        BrowserManager::close_session(self, session_id).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ChromeSection, DisplaySection};

    fn dead_end_launcher(profile_base: &std::path::Path) -> Arc<ChromeLauncher> {
        Arc::new(ChromeLauncher::new(
            ChromeSection {
                binary: "/bin/false".to_string(),
                profile_base: profile_base.display().to_string(),
            },
            DisplaySection {
                width: 800,
                height: 600,
            },
        ))
    }

    #[tokio::test]
    async fn start_fails_cleanly_when_ports_exhausted() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ports = Arc::new(ResourcePool::new("devtools-port", 9800, 0));
        let session = BrowserSession::new(
            "s-empty",
            SessionConfig::default(),
            Arc::clone(&ports),
            dead_end_launcher(dir.path()),
        );
        let err = session.start().await.unwrap_err();
        assert!(matches!(err, BrowserError::PortsExhausted));
        assert_eq!(ports.in_use_count(), 0);
    }

    #[tokio::test]
    async fn failed_launch_releases_the_port() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ports = Arc::new(ResourcePool::new("devtools-port", 9800, 1));
        let session = BrowserSession::new(
            "s-dead",
            SessionConfig::default(),
            Arc::clone(&ports),
            dead_end_launcher(dir.path()),
        );
        let err = session.start().await.unwrap_err();
        assert!(matches!(err, BrowserError::LaunchFailed { .. }));
        assert_eq!(ports.in_use_count(), 0);
        assert_eq!(ports.available_count(), 1);
        assert!(std::fs::read_dir(dir.path()).expect("read profile base").next().is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn connect_timeout_rolls_back_port_and_process() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().expect("tempdir");
        let script = dir.path().join("fake-chrome.sh");
        std::fs::write(&script, "#!/bin/sh\nexec sleep 600\n").expect("write stub");
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).expect("chmod");

        let profiles = dir.path().join("profiles");
        let ports = Arc::new(ResourcePool::new("devtools-port", 9840, 1));
        let launcher = Arc::new(ChromeLauncher::new(
            ChromeSection {
                binary: script.display().to_string(),
                profile_base: profiles.display().to_string(),
            },
            DisplaySection {
                width: 800,
                height: 600,
            },
        ));
        let session = BrowserSession::new(
            "s-silent",
            SessionConfig::default(),
            Arc::clone(&ports),
            Arc::clone(&launcher),
        );

        // the stub stays alive but never opens a debug endpoint
        let err = session.start().await.unwrap_err();
        assert!(matches!(err, BrowserError::ConnectTimeout { .. }));
        assert_eq!(ports.in_use_count(), 0);
        assert!(launcher.get("s-silent").is_none());
        assert!(!profiles.join("chrome-s-silent").exists());
    }

    #[tokio::test]
    async fn manager_rejects_fetch_for_unknown_session() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ports = Arc::new(ResourcePool::new("devtools-port", 9800, 1));
        let manager = BrowserManager::new(ports, dead_end_launcher(dir.path()));
        let err = manager
            .fetch_page("missing", "https://example.com", Duration::ZERO)
            .await
            .unwrap_err();
        assert!(matches!(err, BrowserError::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn failed_create_leaves_no_registry_entry() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ports = Arc::new(ResourcePool::new("devtools-port", 9800, 1));
        let manager = BrowserManager::new(Arc::clone(&ports), dead_end_launcher(dir.path()));
        let err = manager
            .create_session("s-dead", &SessionConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, BrowserError::LaunchFailed { .. }));
        assert_eq!(manager.active_session_count(), 0);
        assert_eq!(ports.in_use_count(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn lookups_are_not_blocked_by_establishment() {
        use std::os::unix::fs::PermissionsExt;
        use std::time::Instant;

        let dir = tempfile::tempdir().expect("tempdir");
        let script = dir.path().join("fake-chrome.sh");
        std::fs::write(&script, "#!/bin/sh\nexec sleep 600\n").expect("write stub");
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).expect("chmod");

        let profiles = dir.path().join("profiles");
        let ports = Arc::new(ResourcePool::new("devtools-port", 9860, 2));
        let launcher = Arc::new(ChromeLauncher::new(
            ChromeSection {
                binary: script.display().to_string(),
                profile_base: profiles.display().to_string(),
            },
            DisplaySection {
                width: 800,
                height: 600,
            },
        ));
        let manager = Arc::new(BrowserManager::new(ports, launcher));

        let establishing = Arc::clone(&manager);
        let establishment = tokio::spawn(async move {
            establishing
                .create_session("s-establishing", &SessionConfig::default())
                .await
        });
        // let the admission reach its settle period
        sleep(Duration::from_millis(300)).await;

        let lookup_started = Instant::now();
        let err = manager
            .fetch_page("unrelated", "https://example.com", Duration::ZERO)
            .await
            .unwrap_err();
        assert!(matches!(err, BrowserError::SessionNotFound(_)));
        manager.close_session("unrelated").await;
        assert!(lookup_started.elapsed() < Duration::from_secs(1));

        establishment.abort();
        let _ = establishment.await;
        assert_eq!(manager.active_session_count(), 0);
    }
}
