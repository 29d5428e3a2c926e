//! Host configuration.
//!
//! Everything has a default; a `HostServer` runs without any explicit setup.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::builder::BuilderConfig;

#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Root directory relative paths resolve against. Defaults to the
    /// current working directory.
    pub app_root_dir: PathBuf,

    /// Directory of module sources (`<name>/wasm/...`, `<name>/rule.txt`).
    pub modules_dir: PathBuf,

    /// Directory of `.wasm` artifacts loaded at startup and on file events.
    pub output_dir: PathBuf,

    /// HTTP port. `0` binds an ephemeral port.
    pub port: u16,

    /// Wall-clock budget for draining a module before it is closed.
    pub drain_timeout: Duration,

    /// When true the internal artifact watcher is never started; an external
    /// notifier drives `on_file_event`.
    pub external_watcher: bool,

    /// Debounce window for the internal artifact watcher.
    pub watch_debounce: Duration,

    /// Outbound queue depth per WebSocket client; messages beyond it are
    /// dropped for that client.
    pub ws_queue_capacity: usize,

    /// Per-frame write timeout on WebSocket clients.
    pub ws_write_timeout: Duration,

    /// Maximum guest stack size in bytes.
    pub max_wasm_stack: usize,

    /// Fuel budget per guest entry. `None` disables metering.
    pub fuel_limit: Option<u64>,

    /// External guest builder configuration.
    pub builder: BuilderConfig,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            app_root_dir: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            modules_dir: PathBuf::from("modules"),
            output_dir: PathBuf::from("modules/dist"),
            port: 6060,
            drain_timeout: Duration::from_secs(5),
            external_watcher: false,
            watch_debounce: Duration::from_millis(200),
            ws_queue_capacity: 256,
            ws_write_timeout: Duration::from_secs(5),
            max_wasm_stack: 1024 * 1024,
            fuel_limit: None,
            builder: BuilderConfig::default(),
        }
    }
}

impl HostConfig {
    /// Absolute path of the module source directory.
    pub fn modules_root(&self) -> PathBuf {
        resolve(&self.app_root_dir, &self.modules_dir)
    }

    /// Absolute path of the artifact directory.
    pub fn output_root(&self) -> PathBuf {
        resolve(&self.app_root_dir, &self.output_dir)
    }
}

fn resolve(root: &Path, dir: &Path) -> PathBuf {
    if dir.is_absolute() {
        dir.to_path_buf()
    } else {
        root.join(dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relative_dirs_resolve_against_root() {
        let config = HostConfig {
            app_root_dir: PathBuf::from("/srv/app"),
            ..HostConfig::default()
        };
        assert_eq!(config.modules_root(), PathBuf::from("/srv/app/modules"));
        assert_eq!(config.output_root(), PathBuf::from("/srv/app/modules/dist"));
    }

    #[test]
    fn test_absolute_dirs_win() {
        let config = HostConfig {
            app_root_dir: PathBuf::from("/srv/app"),
            output_dir: PathBuf::from("/var/artifacts"),
            ..HostConfig::default()
        };
        assert_eq!(config.output_root(), PathBuf::from("/var/artifacts"));
    }
}
