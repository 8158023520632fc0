//! Daemon management commands.

use std::time::Duration;

use anyhow::Result;
use commgate::client::{self, ClientError, DaemonClient};
use commgate::config::Config;
use commgate::daemon::{self, Daemon};
use serde_json::json;

use crate::DaemonAction;

use super::print_result;

pub async fn run(config: Config, action: DaemonAction, pretty: bool) -> Result<()> {
    match action {
        DaemonAction::Start => {
            if daemon::is_daemon_running(&config) {
                println!("Daemon is already running");
                return Ok(());
            }
            let daemon = Daemon::start(config).await?;
            daemon.run().await
        }
        DaemonAction::Stop => {
            // Prefer a clean IPC shutdown; fall back to SIGTERM when the
            // socket is gone but the process is not.
            let client = DaemonClient::new(&config).with_timeout(Duration::from_secs(5));
            match client::call(&client, "daemon", "shutdown", json!({})).await {
                Ok(_) => {
                    println!("Daemon stopping");
                    Ok(())
                }
                Err(ClientError::ConnectionUnavailable { .. }) => {
                    if daemon::signal_stop(&config)? {
                        println!("Daemon signalled to stop");
                    } else {
                        println!("Daemon is not running");
                    }
                    Ok(())
                }
                Err(e) => anyhow::bail!("Failed to stop daemon: {}", e),
            }
        }
        DaemonAction::Status => {
            let client = DaemonClient::new(&config);
            match client::call(&client, "daemon", "status", json!({})).await {
                Ok(status) => {
                    print_result(&status, pretty);
                    Ok(())
                }
                Err(ClientError::ConnectionUnavailable { .. }) => {
                    println!("Daemon is not running");
                    if let Some(pid) = daemon::daemon_pid(&config) {
                        println!("  Stale socket, but pid {pid} is alive");
                    }
                    std::process::exit(1);
                }
                Err(e) => anyhow::bail!("Failed to get status: {}", e),
            }
        }
    }
}
