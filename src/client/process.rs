//! Host child-process lifecycle management.
//!
//! When the client is configured with a host binary it spawns the host
//! itself, passing the endpoint on the command line and the shared secret
//! through the environment. The child is killed on any construction-phase
//! failure and on [`ProcessManager::kill`]; `kill_on_drop` covers the rest.

use std::io;
use std::path::Path;
use std::process::Stdio;

use tokio::process::{Child, Command};
use tokio::sync::Mutex;

use crate::config::{Device, StdioPolicy};
use crate::log_info;

/// Manages the spawned host child process.
#[derive(Debug)]
pub struct ProcessManager {
    child: Mutex<Option<Child>>,
}

impl ProcessManager {
    /// Spawn the host binary pointed at `socket_path`.
    pub fn spawn(
        binary: &Path,
        socket_path: &Path,
        auth_token: Option<&str>,
        device: Option<Device>,
        stdio: StdioPolicy,
    ) -> io::Result<Self> {
        let mut command = Command::new(binary);
        command
            .arg("--socket")
            .arg(socket_path)
            .env("SOCKET_PATH", socket_path)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(token) = auth_token {
            command.env("AUTH_TOKEN", token);
        }
        if let Some(device) = device {
            command.env("DEVICE", device.as_str());
        }
        match stdio {
            StdioPolicy::Inherit => {
                command.stdout(Stdio::inherit()).stderr(Stdio::inherit());
            }
            StdioPolicy::Null => {
                command.stdout(Stdio::null()).stderr(Stdio::null());
            }
        }

        let child = command.spawn()?;
        log_info!(
            "PROCESS_MGR",
            "spawned host {} (pid={:?})",
            binary.display(),
            child.id()
        );
        Ok(ProcessManager {
            child: Mutex::new(Some(child)),
        })
    }

    /// Kill the host process and reap it. Idempotent.
    pub async fn kill(&self) {
        let mut guard = self.child.lock().await;
        if let Some(mut child) = guard.take() {
            log_info!("PROCESS_MGR", "killing host process (pid={:?})", child.id());
            let _ = child.kill().await;
        }
    }
}
