//! External guest builder.
//!
//! The host never compiles guest code itself; it shells out to a configured
//! toolchain that emits `<name>.wasm` into the artifact directory. The
//! default pipeline builds a cargo crate at `<module>/wasm/` for
//! `wasm32-unknown-unknown` and copies the artifact out of the cargo target
//! directory.

use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

/// Errors from the external build pipeline. Builds are advisory: the server
/// logs these and keeps running.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("build command failed for module '{module}': {reason}")]
    CommandFailed { module: String, reason: String },

    #[error("build io error for module '{module}': {source}")]
    Io {
        module: String,
        #[source]
        source: std::io::Error,
    },

    #[error("build timed out for module '{module}' after {timeout:?}")]
    Timeout { module: String, timeout: Duration },
}

/// Configuration for the external guest builder.
#[derive(Debug, Clone)]
pub struct BuilderConfig {
    /// Command to invoke inside `<module>/wasm/`.
    pub command: String,

    /// Arguments passed to the command.
    pub args: Vec<String>,

    /// Where the command leaves the artifact, relative to `<module>/wasm/`.
    pub target_subdir: PathBuf,

    /// Guest source extension that triggers a rebuild on file events.
    pub source_ext: String,

    /// Wall-clock budget for one build.
    pub timeout: Duration,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            command: "cargo".to_string(),
            args: vec![
                "build".to_string(),
                "--release".to_string(),
                "--target".to_string(),
                "wasm32-unknown-unknown".to_string(),
            ],
            target_subdir: PathBuf::from("target/wasm32-unknown-unknown/release"),
            source_ext: "rs".to_string(),
            timeout: Duration::from_secs(60),
        }
    }
}

/// Invokes the external toolchain and places artifacts into the output
/// directory.
pub struct GuestBuilder {
    config: BuilderConfig,
}

impl GuestBuilder {
    pub fn new(config: BuilderConfig) -> Self {
        Self { config }
    }

    /// Whether `module_dir` carries a buildable guest crate.
    pub fn has_guest_source(&self, module_dir: &Path) -> bool {
        module_dir.join("wasm").join("Cargo.toml").exists()
    }

    /// Whether `ext` (with or without the leading dot) is the configured
    /// guest source extension.
    pub fn is_source_ext(&self, ext: &str) -> bool {
        ext.trim_start_matches('.') == self.config.source_ext
    }

    /// Runs the build command in `<module_dir>/wasm/` and copies the
    /// resulting artifact to `<output_dir>/<name>.wasm`.
    pub async fn build(
        &self,
        name: &str,
        module_dir: &Path,
        output_dir: &Path,
    ) -> Result<PathBuf, BuildError> {
        let cwd = module_dir.join("wasm");
        tracing::info!(module = %name, command = %self.config.command, "building guest module");

        let mut cmd = tokio::process::Command::new(&self.config.command);
        cmd.args(&self.config.args)
            .current_dir(&cwd)
            .kill_on_drop(true);

        let output = tokio::time::timeout(self.config.timeout, cmd.output())
            .await
            .map_err(|_| BuildError::Timeout {
                module: name.to_string(),
                timeout: self.config.timeout,
            })?
            .map_err(|source| BuildError::Io {
                module: name.to_string(),
                source,
            })?;

        if !output.status.success() {
            return Err(BuildError::CommandFailed {
                module: name.to_string(),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        // Cargo normalizes hyphens to underscores in artifact names.
        let artifact = cwd
            .join(&self.config.target_subdir)
            .join(format!("{}.wasm", name.replace('-', "_")));
        let dest = output_dir.join(format!("{name}.wasm"));

        tokio::fs::create_dir_all(output_dir)
            .await
            .map_err(|source| BuildError::Io {
                module: name.to_string(),
                source,
            })?;
        tokio::fs::copy(&artifact, &dest)
            .await
            .map_err(|source| BuildError::Io {
                module: name.to_string(),
                source,
            })?;

        tracing::info!(module = %name, artifact = %dest.display(), "guest module built");
        Ok(dest)
    }
}
