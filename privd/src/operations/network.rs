//! Host network configuration through the external network helper.

use crate::{error::Fault, value::Value};
use privd_log::debug;
use std::{io, path::Path, process::Stdio};
use tokio::{io::AsyncWriteExt, process::Command};

/// Actions understood by the network helper, named like the operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NetworkAction {
    Add,
    Delete,
    Edit,
    Setup,
    SetSafeConfig,
}

impl AsRef<str> for NetworkAction {
    fn as_ref(&self) -> &str {
        match self {
            Self::Add => "addNetwork",
            Self::Delete => "delNetwork",
            Self::Edit => "editNetwork",
            Self::Setup => "setupNetworks",
            Self::SetSafeConfig => "setSafeNetworkConfig",
        }
    }
}

/// Run `<helper> <action>` with the JSON arguments on standard input.
pub(super) async fn run_helper(
    helper: &Path,
    action: NetworkAction,
    arguments: &Value,
) -> Result<Value, Fault> {
    let input = serde_json::to_vec(&arguments.to_json())
        .map_err(|err| Fault::InvalidArgument(err.to_string()))?;

    debug!("Running {} {}", helper.display(), action.as_ref());

    let mut child = Command::new(helper)
        .arg(action.as_ref())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    // Feed stdin while the output is collected, the helper may write
    // before it reads or exit without reading at all.
    let stdin = child.stdin.take();
    let writer = async move {
        let mut stdin = match stdin {
            Some(stdin) => stdin,
            None => return Ok(()),
        };
        match stdin.write_all(&input).await {
            Err(err) if err.kind() == io::ErrorKind::BrokenPipe => {
                debug!("Network helper closed its input early");
                Ok(())
            }
            // Closing stdin signals the end of the document.
            result => result,
        }
    };

    let (written, output) = tokio::join!(writer, child.wait_with_output());
    let output = output?;
    if !output.status.success() {
        return Err(Fault::Operation(format!(
            "network helper {} failed ({}): {}",
            action.as_ref(),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    written?;

    Ok(String::from_utf8_lossy(&output.stdout).into_owned().into())
}

#[cfg(test)]
mod tests {
    use super::{run_helper, NetworkAction};
    use crate::{error::Fault, value::Value};
    use std::{fs, os::unix::fs::PermissionsExt, path::PathBuf, time::Duration};
    use tempfile::TempDir;
    use tokio::time::timeout;

    fn helper(dir: &TempDir, script: &str) -> PathBuf {
        let path = dir.path().join("network-helper");
        fs::write(&path, format!("#!/bin/sh\n{}\n", script)).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[tokio::test]
    async fn test_helper_receives_arguments() {
        let dir = tempfile::tempdir().unwrap();
        let helper = helper(&dir, "echo \"$1\"; cat");

        let mut arguments = std::collections::BTreeMap::new();
        arguments.insert("bridge".to_string(), Value::from("ovirtmgmt"));

        let reply = run_helper(&helper, NetworkAction::Add, &arguments.into())
            .await
            .unwrap();
        assert_eq!(reply, Value::from("addNetwork\n{\"bridge\":\"ovirtmgmt\"}"));
    }

    #[tokio::test]
    async fn test_helper_failure() {
        let dir = tempfile::tempdir().unwrap();
        let helper = helper(&dir, "echo 'no such bridge' >&2; exit 3");

        let fault = run_helper(&helper, NetworkAction::Delete, &Value::Null)
            .await
            .unwrap_err();
        match fault {
            Fault::Operation(message) => assert!(message.contains("no such bridge")),
            fault => panic!("unexpected fault {:?}", fault),
        }
    }

    fn large_arguments() -> Value {
        let mut arguments = std::collections::BTreeMap::new();
        arguments.insert("nics".to_string(), Value::from("x".repeat(1 << 20)));
        arguments.into()
    }

    #[tokio::test]
    async fn test_helper_ignores_input() {
        let dir = tempfile::tempdir().unwrap();
        let helper = helper(&dir, "echo 'bad action' >&2; exit 3");

        // Larger than a pipe buffer, the write fails with EPIPE.
        let fault = run_helper(&helper, NetworkAction::Setup, &large_arguments())
            .await
            .unwrap_err();
        match fault {
            Fault::Operation(message) => assert!(message.contains("bad action")),
            fault => panic!("unexpected fault {:?}", fault),
        }
    }

    #[tokio::test]
    async fn test_helper_writes_before_reading() {
        let dir = tempfile::tempdir().unwrap();
        let helper = helper(&dir, "head -c 200000 /dev/zero; cat >/dev/null");

        let reply = timeout(
            Duration::from_secs(10),
            run_helper(&helper, NetworkAction::Edit, &large_arguments()),
        )
        .await
        .expect("network helper deadlocked")
        .unwrap();
        assert_eq!(reply, Value::from("\0".repeat(200_000)));
    }

    #[tokio::test]
    async fn test_missing_helper() {
        let fault = run_helper(
            std::path::Path::new("/nonexistent/network-helper"),
            NetworkAction::SetSafeConfig,
            &Value::Null,
        )
        .await
        .unwrap_err();
        assert_eq!(fault.errno(), Some(libc::ENOENT));
    }
}
