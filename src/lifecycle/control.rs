//! Marker-file coordination.
//!
//! A stop marker ends both roles; ready markers tell external tooling that
//! the worker is listening or the master is subscribed.

use std::path::{Path, PathBuf};
use std::time::Duration;

use super::shutdown::Shutdown;

pub fn stop_requested(stop_marker: &Path) -> bool {
    stop_marker.exists()
}

pub fn write_ready_marker(path: &Path) -> std::io::Result<()> {
    std::fs::write(path, b"ready\n")?;
    tracing::info!(marker = %path.display(), "Ready marker written");
    Ok(())
}

/// Remove a marker if present.
pub fn clear_marker(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => tracing::debug!(marker = %path.display(), "Marker removed"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(marker = %path.display(), error = %e, "Failed to remove marker"),
    }
}

/// Poll for the stop marker and trigger shutdown once it appears.
pub async fn watch_stop_marker(stop_marker: PathBuf, interval: Duration, shutdown: Shutdown) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if stop_requested(&stop_marker) {
                    tracing::info!(marker = %stop_marker.display(), "Stop marker found");
                    shutdown.trigger();
                    return;
                }
            }
            _ = shutdown.cancelled() => return,
        }
    }
}
