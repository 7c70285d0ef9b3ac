//! Binds the unix-domain endpoint and accepts connections.

use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;

use anyhow::Context;
use tokio::net::UnixListener;

use crate::config::HostConfig;
use crate::engine::Engine;
use crate::{log_info, log_warn};

use super::connection;

/// Run the host: bind, accept, and serve until the process exits.
///
/// Accepts are serialized; each accepted socket gets its own connection and
/// dispatcher and is handled concurrently.
pub async fn serve(config: HostConfig, engine: Arc<dyn Engine>) -> anyhow::Result<()> {
    let path = &config.socket_path;

    // A previous host instance may have left its endpoint file behind.
    if path.exists() {
        std::fs::remove_file(path)
            .with_context(|| format!("failed to remove stale socket {}", path.display()))?;
    }
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
    }

    let listener = UnixListener::bind(path)
        .with_context(|| format!("failed to bind {}", path.display()))?;

    // Local user only; the auth token is a shared secret, not a substitute
    // for filesystem permissions.
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .with_context(|| format!("failed to restrict permissions on {}", path.display()))?;

    log_info!(
        "HOST",
        "listening on {} (auth: {})",
        path.display(),
        if config.auth_token.is_some() { "token" } else { "none" }
    );

    let mut next_conn_id: u64 = 0;
    loop {
        match listener.accept().await {
            Ok((stream, _addr)) => {
                next_conn_id += 1;
                log_info!("HOST", "accepted connection {next_conn_id}");
                connection::spawn(
                    stream,
                    next_conn_id,
                    engine.clone(),
                    config.auth_token.clone(),
                );
            }
            Err(e) => {
                log_warn!("HOST", "accept failed: {e}");
            }
        }
    }
}
