//! Daemon Lifecycle Management
//!
//! Handles daemon startup, shutdown, and single-instance guarantees.

use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::config::Config;

use super::handler::RequestHandler;
use super::registry::DaemonState;
use super::server::GatewayServer;

/// Daemon instance owning the state, handler, and server.
pub struct Daemon {
    state: Arc<DaemonState>,
    handler: Arc<RequestHandler>,
    socket_path: PathBuf,
    shutdown_tx: broadcast::Sender<()>,
    pid_file_path: PathBuf,
}

impl Daemon {
    /// Start the daemon: acquire the single-instance lock and build the
    /// process-wide state. Backends stay unconstructed until first use.
    pub async fn start(config: Config) -> Result<Self> {
        info!("Starting gateway daemon");

        std::fs::create_dir_all(&config.daemon.state_dir).with_context(|| {
            format!("failed to create state dir {}", config.daemon.state_dir.display())
        })?;

        let pid_file_path = config.pid_path();
        acquire_lock(&pid_file_path)?;

        let socket_path = config.socket_path();
        let (shutdown_tx, _) = broadcast::channel(16);
        let state = Arc::new(DaemonState::new(config));
        let handler = Arc::new(RequestHandler::new(Arc::clone(&state), shutdown_tx.clone()));

        info!("State directory: {}", state.config().daemon.state_dir.display());
        info!("Socket path: {}", socket_path.display());

        Ok(Self {
            state,
            handler,
            socket_path,
            shutdown_tx,
            pid_file_path,
        })
    }

    /// Run until Ctrl+C, SIGTERM, or an IPC shutdown request, then drain
    /// and release the lock.
    pub async fn run(&self) -> Result<()> {
        let server = GatewayServer::new(self.socket_path.clone(), Arc::clone(&self.handler));
        let server_shutdown = self.shutdown_tx.subscribe();
        let server_handle = tokio::spawn(async move { server.run(server_shutdown).await });

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down");
            }
            _ = wait_for_sigterm() => {
                info!("Received SIGTERM, shutting down");
            }
            _ = shutdown_rx.recv() => {
                info!("Shutdown requested via IPC");
            }
        }

        let _ = self.shutdown_tx.send(());

        // The server drains in-flight connections itself; this timeout is
        // the backstop for a server task that never returns.
        let grace = Duration::from_secs(self.state.config().daemon.shutdown_grace_secs + 5);
        let abort = server_handle.abort_handle();
        match tokio::time::timeout(grace, server_handle).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => warn!("Server exited with error: {}", e),
            Ok(Err(e)) => warn!("Server task panicked: {}", e),
            Err(_) => {
                warn!("Server did not stop within {:?}, aborting", grace);
                abort.abort();
            }
        }

        release_lock(&self.pid_file_path)?;
        info!("Daemon shutdown complete");
        Ok(())
    }

    pub fn state(&self) -> Arc<DaemonState> {
        Arc::clone(&self.state)
    }
}

/// Acquire single-instance lock via pid file.
///
/// Uses `create_new(true)` for atomic creation to avoid TOCTOU races
/// where two processes could interleave exists/read/remove/create.
fn acquire_lock(pid_file_path: &Path) -> Result<()> {
    use std::fs::OpenOptions;

    match OpenOptions::new().write(true).create_new(true).open(pid_file_path) {
        Ok(mut file) => {
            writeln!(file, "{}", std::process::id())?;
            return Ok(());
        }
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
            // File exists; stale-pid check below.
        }
        Err(e) => {
            return Err(e).context("Failed to create pid file");
        }
    }

    let mut contents = String::new();
    File::open(pid_file_path)?.read_to_string(&mut contents)?;
    if let Ok(pid) = contents.trim().parse::<u32>() {
        if process_exists(pid) {
            anyhow::bail!(
                "Daemon is already running (pid {}). Stop it first or remove {}",
                pid,
                pid_file_path.display()
            );
        }
    }

    // Stale pid file: remove and retry once.
    std::fs::remove_file(pid_file_path)?;
    match OpenOptions::new().write(true).create_new(true).open(pid_file_path) {
        Ok(mut file) => {
            writeln!(file, "{}", std::process::id())?;
            Ok(())
        }
        Err(e) => Err(e).context("Failed to create pid file after removing stale lock"),
    }
}

fn release_lock(pid_file_path: &Path) -> Result<()> {
    if pid_file_path.exists() {
        std::fs::remove_file(pid_file_path)?;
    }
    Ok(())
}

/// Check whether a process with the given pid exists.
fn process_exists(pid: u32) -> bool {
    #[cfg(unix)]
    {
        // Signal 0 performs the existence check without delivering anything.
        unsafe { libc::kill(pid as i32, 0) == 0 }
    }

    #[cfg(not(unix))]
    {
        let _ = pid;
        true
    }
}

#[cfg(unix)]
async fn wait_for_sigterm() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            warn!("Failed to register SIGTERM handler: {}. Falling back to pending future.", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_sigterm() {
    std::future::pending::<()>().await
}

/// Check if the daemon is running, judged by a live pid in the pid file.
pub fn is_daemon_running(config: &Config) -> bool {
    daemon_pid(config).is_some()
}

/// Pid of the running daemon, if any.
pub fn daemon_pid(config: &Config) -> Option<u32> {
    let pid_file_path = config.pid_path();
    if !pid_file_path.exists() {
        return None;
    }

    File::open(&pid_file_path)
        .ok()
        .and_then(|mut file| {
            let mut contents = String::new();
            file.read_to_string(&mut contents).ok()?;
            contents.trim().parse().ok()
        })
        .filter(|&pid| process_exists(pid))
}

/// Send SIGTERM to a running daemon identified by its pid file. Used as
/// the fallback when the IPC socket is gone but the process is not.
pub fn signal_stop(config: &Config) -> Result<bool> {
    let Some(pid) = daemon_pid(config) else {
        return Ok(false);
    };
    #[cfg(unix)]
    {
        let rc = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
        if rc != 0 {
            anyhow::bail!("failed to signal pid {}", pid);
        }
        Ok(true)
    }
    #[cfg(not(unix))]
    {
        anyhow::bail!("signal-based stop is not supported on this platform");
    }
}
