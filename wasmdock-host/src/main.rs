//! The `wasmdock` binary: run a module host over a directory tree.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use wasmdock_host::{HostConfig, HostServer};

#[derive(Debug, Parser)]
#[command(name = "wasmdock", version, about = "Dynamic WebAssembly module host")]
struct Args {
    /// Root directory relative paths resolve against.
    #[arg(long, default_value = ".")]
    root: PathBuf,

    /// Module source directory (holds `<name>/wasm/` and `<name>/rule.txt`).
    #[arg(long, default_value = "modules")]
    modules_dir: PathBuf,

    /// Artifact directory scanned for `<name>.wasm`.
    #[arg(long, default_value = "modules/dist")]
    output_dir: PathBuf,

    /// HTTP port (0 binds an ephemeral port).
    #[arg(long, default_value_t = 6060)]
    port: u16,

    /// Drain budget per module in milliseconds.
    #[arg(long, default_value_t = 5000)]
    drain_timeout_ms: u64,

    /// Disable the internal artifact watcher; an external notifier drives
    /// reloads.
    #[arg(long)]
    external_watcher: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let config = HostConfig {
        app_root_dir: args.root,
        modules_dir: args.modules_dir,
        output_dir: args.output_dir,
        port: args.port,
        drain_timeout: Duration::from_millis(args.drain_timeout_ms),
        external_watcher: args.external_watcher,
        ..HostConfig::default()
    };

    let server = match HostServer::new(config) {
        Ok(server) => server,
        Err(e) => {
            eprintln!("failed to build host: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = server.run().await {
        eprintln!("host error: {e}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
