//! Unix-domain socket setup for broker and workers.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, warn};

/// Default socket path.
///
/// Prefers `XDG_RUNTIME_DIR`, which is private to the user.
pub fn default_socket_path() -> PathBuf {
    std::env::var_os("XDG_RUNTIME_DIR").map_or_else(
        || PathBuf::from("/tmp/ipc-broker.sock"),
        |dir| PathBuf::from(dir).join("ipc-broker.sock"),
    )
}

/// Bind a listening socket, replacing any stale socket file.
///
/// `mode` is applied to the socket file (owner+group read/write by default).
pub fn bind_listener(path: &Path, mode: u32) -> Result<UnixListener> {
    match std::fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "Removed stale socket"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to remove stale socket {}", path.display()))
        }
    }

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create socket directory {}", parent.display()))?;
        }
    }

    let listener = UnixListener::bind(path)
        .with_context(|| format!("Failed to bind socket {}", path.display()))?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .with_context(|| format!("Failed to set permissions on {}", path.display()))?;

    Ok(listener)
}

/// Connect to the broker, retrying while the socket is not there yet.
pub async fn connect(path: &Path, attempts: u32, delay: Duration) -> Result<UnixStream> {
    let mut last_error = None;
    for attempt in 1..=attempts.max(1) {
        match UnixStream::connect(path).await {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                debug!(path = %path.display(), attempt, error = %e, "Connect failed");
                last_error = Some(e);
                tokio::time::sleep(delay).await;
            }
        }
    }
    let error = last_error.map_or_else(|| anyhow::anyhow!("no connection attempt made"), anyhow::Error::from);
    warn!(path = %path.display(), error = %error, "Giving up connecting to broker");
    Err(error).with_context(|| format!("Failed to connect to {}", path.display()))
}
