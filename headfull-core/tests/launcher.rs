#![cfg(unix)]

use std::path::{Path, PathBuf};
use std::time::Duration;

use headfull_core::browser::ChromeLauncher;
use headfull_core::config::{ChromeSection, DisplaySection};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::time::sleep;

fn stub_browser(dir: &Path, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join("fake-chrome.sh");
    std::fs::write(&path, body).expect("write stub script");
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).expect("chmod stub");
    path
}

fn launcher_for(binary: &Path, profile_base: &Path) -> ChromeLauncher {
    ChromeLauncher::new(
        ChromeSection {
            binary: binary.display().to_string(),
            profile_base: profile_base.display().to_string(),
        },
        DisplaySection {
            width: 1280,
            height: 720,
        },
    )
}

#[tokio::test]
async fn launch_reports_startup_failure_with_stderr() {
    let dir = tempfile::tempdir().expect("tempdir");
    let script = stub_browser(
        dir.path(),
        "#!/bin/sh\necho 'cannot open display :99' >&2\nexit 7\n",
    );
    let profiles = dir.path().join("profiles");
    let launcher = launcher_for(&script, &profiles);

    let err = launcher
        .launch("session-a", 99, 9321, None)
        .await
        .expect_err("script exits immediately");
    let message = err.to_string();
    assert!(
        message.contains("cannot open display :99"),
        "stderr missing from: {message}"
    );
    assert!(!profiles.join("chrome-session-a").exists());
    assert!(launcher.get("session-a").is_none());
}

#[tokio::test]
async fn terminate_stops_the_process_and_removes_the_profile() {
    let dir = tempfile::tempdir().expect("tempdir");
    let script = stub_browser(dir.path(), "#!/bin/sh\nexec sleep 600\n");
    let profiles = dir.path().join("profiles");
    let launcher = launcher_for(&script, &profiles);

    let process = launcher
        .launch("session-b", 99, 9322, None)
        .await
        .expect("stub keeps running");
    assert!(process.pid > 0);
    assert_eq!(process.devtools_port, 9322);
    assert_eq!(process.display_num, 99);
    assert!(profiles.join("chrome-session-b").is_dir());
    assert!(launcher.get("session-b").is_some());

    launcher.terminate("session-b").await;
    assert!(launcher.get("session-b").is_none());
    assert!(!profiles.join("chrome-session-b").exists());
    assert!(kill(Pid::from_raw(process.pid as i32), None).is_err());
}

#[tokio::test]
async fn terminate_escalates_when_sigterm_is_ignored() {
    let dir = tempfile::tempdir().expect("tempdir");
    let script = stub_browser(
        dir.path(),
        "#!/bin/sh\ntrap '' TERM\nwhile true; do sleep 1; done\n",
    );
    let profiles = dir.path().join("profiles");
    let launcher = launcher_for(&script, &profiles);

    let process = launcher
        .launch("session-c", 99, 9323, None)
        .await
        .expect("stub keeps running");

    launcher.terminate("session-c").await;
    assert!(launcher.get("session-c").is_none());
    assert!(!profiles.join("chrome-session-c").exists());
    assert!(kill(Pid::from_raw(process.pid as i32), None).is_err());
}

#[tokio::test]
async fn terminate_unknown_session_is_a_noop() {
    let dir = tempfile::tempdir().expect("tempdir");
    let profiles = dir.path().join("profiles");
    let launcher = launcher_for(Path::new("/bin/true"), &profiles);

    launcher.terminate("ghost").await;
    assert!(launcher.get("ghost").is_none());
    assert!(!profiles.exists());
}

#[tokio::test]
async fn terminate_handles_a_process_that_already_died() {
    let dir = tempfile::tempdir().expect("tempdir");
    let script = stub_browser(dir.path(), "#!/bin/sh\nexec sleep 600\n");
    let profiles = dir.path().join("profiles");
    let launcher = launcher_for(&script, &profiles);

    let process = launcher
        .launch("session-d", 99, 9324, None)
        .await
        .expect("stub keeps running");
    kill(Pid::from_raw(process.pid as i32), Signal::SIGKILL).expect("kill stub");
    sleep(Duration::from_millis(200)).await;

    launcher.terminate("session-d").await;
    assert!(launcher.get("session-d").is_none());
    assert!(!profiles.join("chrome-session-d").exists());
}

#[tokio::test]
async fn terminate_all_sweeps_every_session() {
    let dir = tempfile::tempdir().expect("tempdir");
    let script = stub_browser(dir.path(), "#!/bin/sh\nexec sleep 600\n");
    let profiles = dir.path().join("profiles");
    let launcher = launcher_for(&script, &profiles);

    launcher
        .launch("session-e", 99, 9331, None)
        .await
        .expect("first stub");
    launcher
        .launch("session-f", 99, 9332, None)
        .await
        .expect("second stub");

    launcher.terminate_all().await;
    assert!(launcher.get("session-e").is_none());
    assert!(launcher.get("session-f").is_none());
    assert!(!profiles.join("chrome-session-e").exists());
    assert!(!profiles.join("chrome-session-f").exists());
}
