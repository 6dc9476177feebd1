//! The daemon exits when its launcher is gone.
//!
//! This is a separate test binary because the daemon signals its own
//! process on shutdown.

use nix::unistd::{getuid, Pid};
use privd::{supervisor, Client, Config, Secret};
use std::{process::Command, time::Duration};
use tokio::time::{sleep, timeout};

#[tokio::test(flavor = "multi_thread")]
async fn test_launcher_exit() {
    if !getuid().is_root() {
        return;
    }

    let dir = tempfile::tempdir().unwrap();
    let config = Config {
        socket_path: dir.path().join("privd.sock"),
        pid_file: dir.path().join("privd.pid"),
        probe_interval: Duration::from_millis(100),
        socket_user: None,
        socket_group: None,
        ..Default::default()
    };
    let secret = Secret::new("abc123").unwrap();

    let mut launcher = Command::new("sleep").arg("30").spawn().unwrap();
    let pid = Pid::from_raw(launcher.id() as i32);

    let daemon = tokio::spawn(supervisor::run(config.clone(), secret.clone(), pid));

    while !config.socket_path.exists() {
        sleep(Duration::from_millis(10)).await;
    }
    let mut client = Client::connect(&config.socket_path, &secret).await.unwrap();
    client
        .validate_access("root", &[], dir.path().to_str().unwrap(), "rx")
        .await
        .unwrap();
    assert!(config.pid_file.exists());

    launcher.kill().unwrap();
    launcher.wait().unwrap();

    timeout(Duration::from_secs(5), daemon)
        .await
        .expect("daemon did not exit")
        .unwrap()
        .unwrap();

    assert!(!config.socket_path.exists());
    assert!(!config.pid_file.exists());
}
