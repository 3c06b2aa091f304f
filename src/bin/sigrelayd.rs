//! sigrelay Daemon - WebSocket signaling relay
//!
//! This binary runs the relay: clients reserve short channel codes,
//! join them, and exchange opaque signaling payloads with the other
//! members of their channel.
//!
//! # Usage
//!
//! ```bash
//! # Start the relay (foreground)
//! sigrelayd start
//!
//! # Start the relay (background/daemonized)
//! sigrelayd start -d
//!
//! # Stop the relay
//! sigrelayd stop
//!
//! # Check relay status
//! sigrelayd status
//!
//! # Start on a custom address with a config file
//! sigrelayd start --listen 127.0.0.1:9000 --config /etc/sigrelay.toml
//!
//! # Enable debug logging
//! RUST_LOG=sigrelayd=debug sigrelayd start
//! ```
//!
//! # Signal Handling
//!
//! - SIGTERM/SIGINT: Graceful shutdown

use std::env;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use sigrelayd::config::{RelayConfig, ENV_CONFIG};
use sigrelayd::registry::spawn_registry;
use sigrelayd::server::RelayServer;

/// Log filter used when `RUST_LOG` is not set
const DEFAULT_LOG_FILTER: &str = "sigrelayd=info,sigrelay_core=info,sigrelay_protocol=info";

/// sigrelay daemon - WebSocket signaling relay
#[derive(Parser, Debug)]
#[command(name = "sigrelayd", version, about)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the relay
    Start {
        /// Run as a background daemon (fork to background)
        #[arg(short = 'd', long)]
        daemon: bool,

        /// Address to listen on (overrides config and environment)
        #[arg(long)]
        listen: Option<SocketAddr>,

        /// Path to a TOML config file
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Stop the running relay
    Stop,
    /// Show relay status
    Status {
        /// Path to a TOML config file
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

/// Returns the state directory used for the PID and log files.
fn state_dir() -> PathBuf {
    dirs::state_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("sigrelay")
}

/// Returns the path to the PID file.
fn pid_file_path() -> PathBuf {
    state_dir().join("sigrelayd.pid")
}

/// Returns the path to the log file.
fn log_file_path() -> PathBuf {
    state_dir().join("sigrelayd.log")
}

/// Reads the PID from the PID file, if it exists.
fn read_pid() -> Option<u32> {
    let mut file = File::open(pid_file_path()).ok()?;
    let mut contents = String::new();
    file.read_to_string(&mut contents).ok()?;
    contents.trim().parse().ok()
}

/// Writes the current PID to the PID file.
fn write_pid() -> Result<()> {
    let path = pid_file_path();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).context("Failed to create state directory")?;
    }
    let mut file = File::create(&path).context("Failed to create PID file")?;
    write!(file, "{}", process::id()).context("Failed to write PID")?;
    Ok(())
}

fn remove_pid_file() {
    let _ = fs::remove_file(pid_file_path());
}

/// Checks if a process with the given PID is running.
fn is_process_running(pid: u32) -> bool {
    #[cfg(unix)]
    {
        // Signal 0 probes for existence without delivering anything
        unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        false
    }
}

/// Checks if the relay is already running.
fn is_daemon_running() -> Option<u32> {
    if let Some(pid) = read_pid() {
        if is_process_running(pid) {
            return Some(pid);
        }
        // Stale PID file
        remove_pid_file();
    }
    None
}

/// Sends SIGTERM to the relay process.
fn stop_daemon(pid: u32) -> Result<()> {
    #[cfg(unix)]
    {
        let result = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
        if result != 0 {
            bail!("Failed to send SIGTERM to process {}", pid);
        }
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        bail!("Stop command is only supported on Unix systems");
    }
    Ok(())
}

/// Resolves the effective configuration.
///
/// Precedence, lowest first: defaults, TOML file (`--config` or
/// `SIGRELAY_CONFIG`), environment, `--listen`.
fn load_config(config_path: Option<&Path>, listen: Option<SocketAddr>) -> Result<RelayConfig> {
    let env_path = env::var_os(ENV_CONFIG).map(PathBuf::from);

    let mut config = match config_path.map(Path::to_path_buf).or(env_path) {
        Some(path) => RelayConfig::load(&path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => RelayConfig::default(),
    };

    config
        .apply_env()
        .context("Invalid environment override")?;

    if let Some(listen) = listen {
        config.listen = listen;
    }

    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Default to 'start' if no subcommand given
    let command = args.command.unwrap_or(Command::Start {
        daemon: false,
        listen: None,
        config: None,
    });

    match command {
        Command::Start {
            daemon,
            listen,
            config,
        } => {
            if let Some(pid) = is_daemon_running() {
                eprintln!("Relay is already running (PID {})", pid);
                eprintln!("Use 'sigrelayd stop' to stop it first.");
                process::exit(1);
            }

            // Resolve config before forking so errors reach the terminal
            let config = load_config(config.as_deref(), listen)?;

            if daemon {
                // Daemonize before starting tokio runtime
                daemonize()?;
            }

            write_pid()?;

            let result = run_daemon(config);

            remove_pid_file();

            result
        }
        Command::Stop => {
            if let Some(pid) = is_daemon_running() {
                println!("Stopping relay (PID {})...", pid);
                stop_daemon(pid)?;

                // Wait for process to exit (up to 5 seconds)
                for _ in 0..50 {
                    if !is_process_running(pid) {
                        println!("Relay stopped.");
                        return Ok(());
                    }
                    std::thread::sleep(std::time::Duration::from_millis(100));
                }

                eprintln!("Relay did not stop within 5 seconds.");
                process::exit(1);
            } else {
                println!("Relay is not running.");
                Ok(())
            }
        }
        Command::Status { config } => {
            if let Some(pid) = is_daemon_running() {
                println!("Relay is running (PID {})", pid);

                if let Ok(config) = load_config(config.as_deref(), None) {
                    println!("Listening: ws://{}{}", config.listen, config.path);
                }

                Ok(())
            } else {
                println!("Relay is not running.");
                process::exit(1);
            }
        }
    }
}

/// Daemonizes the current process.
fn daemonize() -> Result<()> {
    use daemonize::Daemonize;

    let log_path = log_file_path();

    if let Some(parent) = log_path.parent() {
        fs::create_dir_all(parent).context("Failed to create log directory")?;
    }

    let stdout = File::create(&log_path).context("Failed to create log file for stdout")?;
    let stderr = stdout
        .try_clone()
        .context("Failed to create log file for stderr")?;

    Daemonize::new()
        .working_directory("/")
        .stdout(stdout)
        .stderr(stderr)
        .start()
        .context("Failed to daemonize")?;

    Ok(())
}

/// Builds the log filter from `RUST_LOG`, falling back to the defaults
/// when it is unset or unparsable.
fn log_filter(rust_log: Option<&str>) -> EnvFilter {
    rust_log
        .filter(|directives| !directives.trim().is_empty())
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_LOG_FILTER))
}

/// Runs the relay (async entry point).
#[tokio::main]
async fn run_daemon(config: RelayConfig) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(log_filter(env::var("RUST_LOG").ok().as_deref()))
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = process::id(),
        "sigrelay daemon starting"
    );

    let cancel_token = CancellationToken::new();

    let shutdown_token = cancel_token.clone();
    tokio::spawn(async move {
        if let Err(e) = wait_for_shutdown_signal().await {
            error!(error = %e, "Error waiting for shutdown signal");
        }
        info!("Shutdown signal received");
        shutdown_token.cancel();
    });

    let registry = spawn_registry(config.registry_settings());
    info!(max_channels = config.max_channels, "Channel registry started");

    let server = RelayServer::bind(&config, registry, cancel_token)
        .await
        .context("Failed to start server")?;

    if let Err(e) = server.run().await {
        error!(error = %e, "Server error");
        return Err(e.into());
    }

    info!("sigrelay daemon stopped");
    Ok(())
}

/// Waits for a shutdown signal (SIGTERM or SIGINT).
async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_filter_defaults() {
        let filter = log_filter(None).to_string();
        assert!(filter.contains("sigrelayd=info"));

        let filter = log_filter(Some("")).to_string();
        assert!(filter.contains("sigrelayd=info"));
    }

    #[test]
    fn test_rust_log_overrides_defaults() {
        let filter = log_filter(Some("sigrelayd=debug")).to_string();
        assert!(filter.contains("sigrelayd=debug"));
        assert!(!filter.contains("sigrelayd=info"));
    }
}
