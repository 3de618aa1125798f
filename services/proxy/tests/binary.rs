//! Runs the `hostmux` binary against a generated site file.

use std::process::Stdio;
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

fn write_sites(dir: &tempfile::TempDir) -> std::path::PathBuf {
    let path = dir.path().join("sites.json");
    let sites = serde_json::json!({
        "http_addr": "127.0.0.1:0",
        "sites": [
            { "name": "fallback", "command": "sleep", "args": ["5"] },
            { "name": "blog", "aliases": ["blog.test"], "command": "sleep", "args": ["5"] }
        ]
    });
    std::fs::write(&path, sites.to_string()).unwrap();
    path
}

#[tokio::test]
async fn sigterm_closes_proxy_and_exits_cleanly() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_sites(&dir);

    let mut child = Command::new(env!("CARGO_BIN_EXE_hostmux"))
        .env("HOSTMUX_CONFIG", &path)
        .env("HOSTMUX_LOG_LEVEL", "info")
        .env_remove("RUST_LOG")
        .stdout(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .unwrap();

    let stdout = child.stdout.take().unwrap();
    let mut lines = BufReader::new(stdout).lines();
    tokio::time::timeout(Duration::from_secs(10), async {
        while let Some(line) = lines.next_line().await.unwrap() {
            if line.contains("Proxy started") {
                return;
            }
        }
        panic!("hostmux exited before starting");
    })
    .await
    .unwrap();

    let pid = Pid::from_raw(child.id().unwrap() as i32);
    kill(pid, Signal::SIGTERM).unwrap();

    let status = tokio::time::timeout(Duration::from_secs(10), child.wait())
        .await
        .unwrap()
        .unwrap();
    assert!(status.success(), "exit status: {status}");
}

#[tokio::test]
async fn missing_config_fails() {
    let status = Command::new(env!("CARGO_BIN_EXE_hostmux"))
        .env_remove("HOSTMUX_CONFIG")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .unwrap();
    assert!(!status.success());
}
