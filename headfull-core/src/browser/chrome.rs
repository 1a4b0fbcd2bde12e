use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::{ChromeSection, DisplaySection};

use super::error::{BrowserError, BrowserResult};

const SETTLE_PERIOD: Duration = Duration::from_secs(2);
const TERM_GRACE: Duration = Duration::from_secs(1);

/// Runtime facts about a launched browser process.
#[derive(Debug, Clone)]
pub struct ChromeProcess {
    pub pid: u32,
    pub display_num: u32,
    pub devtools_port: u16,
    pub profile_dir: PathBuf,
}

#[derive(Debug)]
struct TrackedChrome {
    child: Child,
    info: ChromeProcess,
}

/// Launches browser processes with isolated profile dirs and supervises
/// their shutdown, keyed by session id.
#[derive(Debug)]
pub struct ChromeLauncher {
    chrome: ChromeSection,
    display: DisplaySection,
    processes: Mutex<HashMap<String, TrackedChrome>>,
}

impl ChromeLauncher {
    pub fn new(chrome: ChromeSection, display: DisplaySection) -> Self {
        Self {
            chrome,
            display,
            processes: Mutex::new(HashMap::new()),
        }
    }

    /// Spawns a browser for the session and waits out the settle period.
    /// A process that dies while settling is reported with its exit
    /// status and stderr, and its profile dir is removed.
    pub async fn launch(
        &self,
        session_id: &str,
        display_num: u32,
        devtools_port: u16,
        proxy_server: Option<&str>,
    ) -> BrowserResult<ChromeProcess> {
        let profile_dir =
            PathBuf::from(&self.chrome.profile_base).join(format!("chrome-{session_id}"));
        std::fs::create_dir_all(&profile_dir)?;

        let args = self.build_args(&profile_dir, devtools_port, proxy_server);
        debug!(session_id, binary = %self.chrome.binary, devtools_port, "spawning chrome");
        let spawned = Command::new(&self.chrome.binary)
            .args(&args)
            .env("DISPLAY", format!(":{display_num}"))
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();
        let mut child = match spawned {
            Ok(child) => child,
            Err(err) => {
                remove_profile_dir(&profile_dir);
                return Err(err.into());
            }
        };

        sleep(SETTLE_PERIOD).await;

        if let Ok(Some(status)) = child.try_wait() {
            let stderr = read_stderr(&mut child).await;
            remove_profile_dir(&profile_dir);
            return Err(BrowserError::LaunchFailed { status, stderr });
        }

        let pid = child.id().unwrap_or_default();
        let info = ChromeProcess {
            pid,
            display_num,
            devtools_port,
            profile_dir,
        };
        info!(session_id, pid, devtools_port, display = display_num, "chrome started");
        self.processes
            .lock()
            .unwrap()
            .insert(session_id.to_string(), TrackedChrome { child, info: info.clone() });
        Ok(info)
    }

    /// Stops the session's browser: sigterm, a grace period, then a hard
    /// kill if it is still up. Unknown ids are a no-op. The profile dir
    /// is removed however the process went down.
    pub async fn terminate(&self, session_id: &str) {
        let tracked = self.processes.lock().unwrap().remove(session_id);
        let Some(mut tracked) = tracked else {
            warn!(session_id, "no chrome process to terminate");
            return;
        };
        let pid = tracked.info.pid;
        debug!(session_id, pid, "terminating chrome");

        send_sigterm(&mut tracked.child, pid);
        sleep(TERM_GRACE).await;

        match tracked.child.try_wait() {
            Ok(Some(status)) => debug!(session_id, pid, %status, "chrome exited"),
            _ => {
                warn!(session_id, pid, "chrome still up after sigterm, killing");
                if let Err(err) = tracked.child.kill().await {
                    warn!(session_id, pid, error = %err, "chrome kill failed");
                }
            }
        }

        remove_profile_dir(&tracked.info.profile_dir);
        info!(session_id, pid, "chrome terminated");
    }

    /// Terminates every tracked browser. Shutdown path.
    pub async fn terminate_all(&self) {
        let session_ids: Vec<String> = self.processes.lock().unwrap().keys().cloned().collect();
        for session_id in session_ids {
            self.terminate(&session_id).await;
        }
    }

    pub fn get(&self, session_id: &str) -> Option<ChromeProcess> {
        self.processes
            .lock()
            .unwrap()
            .get(session_id)
            .map(|tracked| tracked.info.clone())
    }

    fn build_args(
        &self,
        profile_dir: &Path,
        devtools_port: u16,
        proxy_server: Option<&str>,
    ) -> Vec<String> {
        let mut args = vec![
            format!("--remote-debugging-port={devtools_port}"),
            format!("--user-data-dir={}", profile_dir.display()),
            format!("--window-size={},{}", self.display.width, self.display.height),
            "--start-maximized".to_string(),
            "--no-first-run".to_string(),
            "--no-default-browser-check".to_string(),
            "--disable-background-networking".to_string(),
            "--disable-client-side-phishing-detection".to_string(),
            "--disable-default-apps".to_string(),
            "--disable-extensions".to_string(),
            "--disable-hang-monitor".to_string(),
            "--disable-popup-blocking".to_string(),
            "--disable-prompt-on-repost".to_string(),
            "--disable-sync".to_string(),
            "--disable-translate".to_string(),
            "--metrics-recording-only".to_string(),
            "--safebrowsing-disable-auto-update".to_string(),
            "--disable-dev-shm-usage".to_string(),
            "--disable-gpu".to_string(),
            "--disable-software-rasterizer".to_string(),
            "--lang=en-US".to_string(),
        ];
        if let Some(proxy) = proxy_server {
            args.push(format!("--proxy-server={proxy}"));
        }
        args
    }
}

#[cfg(unix)]
fn send_sigterm(_child: &mut Child, pid: u32) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    if let Err(err) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        debug!(pid, error = %err, "sigterm not delivered");
    }
}

#[cfg(not(unix))]
fn send_sigterm(child: &mut Child, pid: u32) {
    if let Err(err) = child.start_kill() {
        debug!(pid, error = %err, "kill not delivered");
    }
}

async fn read_stderr(child: &mut Child) -> String {
    let Some(mut stderr) = child.stderr.take() else {
        return String::new();
    };
    let mut buffer = String::new();
    if stderr.read_to_string(&mut buffer).await.is_err() {
        return String::new();
    }
    buffer.trim().to_string()
}

fn remove_profile_dir(path: &Path) {
    if let Err(err) = std::fs::remove_dir_all(path) {
        if err.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %err, "profile dir cleanup failed");
        }
    }
}
