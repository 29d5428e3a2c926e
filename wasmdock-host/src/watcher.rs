//! Internal artifact watcher.
//!
//! Watches the artifact directory for `.wasm` writes and feeds debounced
//! paths to the server's swap path. The server drops the watcher once an
//! external notifier starts driving `on_file_event`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use thiserror::Error;
use tokio::sync::mpsc;

/// Errors that can occur while setting up the watcher.
#[derive(Debug, Error)]
pub enum WatcherError {
    #[error("failed to initialize watcher: {0}")]
    Init(#[source] notify::Error),

    #[error("failed to watch {path}: {source}")]
    Watch {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },
}

/// Callback invoked (on a blocking thread) with each debounced artifact path.
pub type ArtifactHandler = Arc<dyn Fn(PathBuf) + Send + Sync>;

/// Watches one directory for `.wasm` artifacts.
pub struct ArtifactWatcher {
    _watcher: RecommendedWatcher,
    shutdown_tx: mpsc::Sender<()>,
}

impl ArtifactWatcher {
    /// Starts watching `dir`. Events are debounced by `debounce` and handed
    /// to `on_artifact` in batches on the blocking pool.
    pub fn spawn(
        dir: &Path,
        debounce: Duration,
        on_artifact: ArtifactHandler,
    ) -> Result<Self, WatcherError> {
        let (event_tx, mut event_rx) = mpsc::channel::<Event>(100);
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

        let mut watcher =
            notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
                if let Ok(event) = res {
                    let _ = event_tx.blocking_send(event);
                }
            })
            .map_err(WatcherError::Init)?;

        watcher
            .watch(dir, RecursiveMode::NonRecursive)
            .map_err(|source| WatcherError::Watch {
                path: dir.to_path_buf(),
                source,
            })?;
        tracing::info!(dir = %dir.display(), "watching artifact directory");

        tokio::spawn(async move {
            let mut pending: Vec<PathBuf> = Vec::new();
            let mut deadline: Option<tokio::time::Instant> = None;

            loop {
                tokio::select! {
                    // Fires on explicit shutdown and when the watcher half
                    // is dropped.
                    _ = shutdown_rx.recv() => {
                        tracing::debug!("artifact watcher shutting down");
                        break;
                    }

                    Some(event) = event_rx.recv() => {
                        if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                            continue;
                        }
                        for path in event.paths {
                            if is_wasm_file(&path) && !pending.contains(&path) {
                                pending.push(path);
                            }
                        }
                        if !pending.is_empty() {
                            deadline = Some(tokio::time::Instant::now() + debounce);
                        }
                    }

                    _ = async {
                        match deadline {
                            Some(d) => tokio::time::sleep_until(d).await,
                            None => std::future::pending().await,
                        }
                    } => {
                        let batch: Vec<PathBuf> = pending.drain(..).collect();
                        deadline = None;
                        let handler = on_artifact.clone();
                        let _ = tokio::task::spawn_blocking(move || {
                            for path in batch {
                                handler(path);
                            }
                        })
                        .await;
                    }
                }
            }
        });

        Ok(Self {
            _watcher: watcher,
            shutdown_tx,
        })
    }

    /// Stops the event loop. Dropping the watcher has the same effect.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(()).await;
    }
}

fn is_wasm_file(path: &Path) -> bool {
    path.extension().map(|ext| ext == "wasm").unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc as std_mpsc;
    use tempfile::TempDir;

    #[tokio::test(flavor = "multi_thread")]
    async fn test_watcher_reports_wasm_writes() {
        let tmp = TempDir::new().unwrap();
        let (tx, rx) = std_mpsc::channel::<PathBuf>();
        let watcher = ArtifactWatcher::spawn(
            tmp.path(),
            Duration::from_millis(50),
            Arc::new(move |path| {
                let _ = tx.send(path);
            }),
        )
        .unwrap();

        std::fs::write(tmp.path().join("mod.wasm"), b"(module)").unwrap();
        std::fs::write(tmp.path().join("ignored.txt"), b"nope").unwrap();

        let seen = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(seen.file_name().unwrap(), "mod.wasm");
        assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());

        watcher.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_watcher_stops_after_shutdown() {
        let tmp = TempDir::new().unwrap();
        let (tx, rx) = std_mpsc::channel::<PathBuf>();
        let watcher = ArtifactWatcher::spawn(
            tmp.path(),
            Duration::from_millis(50),
            Arc::new(move |path| {
                let _ = tx.send(path);
            }),
        )
        .unwrap();

        watcher.shutdown().await;
        std::fs::write(tmp.path().join("late.wasm"), b"(module)").unwrap();
        assert!(rx.recv_timeout(Duration::from_millis(500)).is_err());
    }
}
