//! Configuration for the gateway daemon and its clients.
//!
//! Loaded from a TOML file, with every section optional and defaulted so a
//! fresh install works without any config at all. Validation collects every
//! problem into one report so the user can fix everything in one pass.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main configuration for the gateway.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Daemon configuration
    #[serde(default)]
    pub daemon: DaemonConfig,
    /// Message store configuration
    #[serde(default)]
    pub messages: MessagesConfig,
    /// Contact directory configuration
    #[serde(default)]
    pub contacts: ContactsConfig,
    /// Google API configuration (calendar + email)
    #[serde(default)]
    pub google: GoogleConfig,
    /// Reminders store configuration
    #[serde(default)]
    pub reminders: RemindersConfig,
}

/// Daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Directory for the socket, pid file, and local stores
    pub state_dir: PathBuf,
    /// Socket path override (defaults to `<state_dir>/gateway.sock`)
    pub socket_path: Option<PathBuf>,
    /// Maximum concurrent client connections
    pub max_connections: usize,
    /// Per-request dispatch timeout in milliseconds
    pub request_timeout_ms: u64,
    /// Grace period for in-flight requests during shutdown
    pub shutdown_grace_secs: u64,
    /// Client round-trip timeout in milliseconds
    pub client_timeout_ms: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            socket_path: None,
            max_connections: 64,
            request_timeout_ms: 10_000,
            shutdown_grace_secs: 5,
            client_timeout_ms: 500,
        }
    }
}

/// Message store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MessagesConfig {
    /// Path to the external message database (read-only)
    pub db_path: PathBuf,
    /// Command used for the outbound send automation channel
    pub send_command: String,
}

impl Default for MessagesConfig {
    fn default() -> Self {
        Self {
            db_path: dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("Library/Messages/chat.db"),
            send_command: "osascript".to_string(),
        }
    }
}

/// Contact directory configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContactsConfig {
    /// Path to the contact directory JSON file
    pub path: PathBuf,
    /// Minimum fuzzy-match score accepted by the resolver
    pub fuzzy_threshold: f64,
    /// Country code prepended to bare 10-digit phone numbers
    pub default_country_code: String,
}

impl Default for ContactsConfig {
    fn default() -> Self {
        Self {
            path: default_state_dir().join("contacts.json"),
            fuzzy_threshold: 0.85,
            default_country_code: "1".to_string(),
        }
    }
}

/// Google API configuration shared by the calendar and email backends.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GoogleConfig {
    /// Directory holding `client_secret.json` and per-scope token files
    pub credentials_dir: PathBuf,
    /// OAuth token endpoint
    pub token_endpoint: String,
    /// Calendar API base URL
    pub calendar_api_base: String,
    /// Gmail API base URL
    pub gmail_api_base: String,
    /// Outbound HTTP timeout in seconds
    pub http_timeout_secs: u64,
}

impl Default for GoogleConfig {
    fn default() -> Self {
        Self {
            credentials_dir: default_state_dir().join("google_credentials"),
            token_endpoint: "https://oauth2.googleapis.com/token".to_string(),
            calendar_api_base: "https://www.googleapis.com/calendar/v3".to_string(),
            gmail_api_base: "https://gmail.googleapis.com/gmail/v1".to_string(),
            http_timeout_secs: 30,
        }
    }
}

/// Reminders store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemindersConfig {
    /// Path to the local reminders database
    pub db_path: PathBuf,
}

impl Default for RemindersConfig {
    fn default() -> Self {
        Self {
            db_path: default_state_dir().join("reminders.db"),
        }
    }
}

/// Default state directory: `~/.commgate`, falling back to the working
/// directory when the home directory cannot be determined.
fn default_state_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".commgate")
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file '{}': {}", path.display(), e))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Failed to parse config file '{}': {}", path.display(), e))?;
        config.validate()?;
        Ok(config)
    }

    /// Load the config file if it exists, otherwise fall back to defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Default config file location: `<state_dir>/config.toml`.
    pub fn default_path() -> PathBuf {
        default_state_dir().join("config.toml")
    }

    /// Resolved socket path.
    pub fn socket_path(&self) -> PathBuf {
        self.daemon
            .socket_path
            .clone()
            .unwrap_or_else(|| self.daemon.state_dir.join("gateway.sock"))
    }

    /// Pid file path for the single-instance lock.
    pub fn pid_path(&self) -> PathBuf {
        self.daemon.state_dir.join("gateway.pid")
    }

    /// Validate all configuration fields.
    ///
    /// Collects all validation errors and reports them together so the user
    /// can fix everything in one pass rather than playing whack-a-mole.
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        if self.daemon.state_dir.as_os_str().is_empty() {
            errors.push("daemon.state_dir must not be empty".to_string());
        }
        if self.daemon.max_connections == 0 {
            errors.push("daemon.max_connections must be positive".to_string());
        }
        if self.daemon.request_timeout_ms == 0 {
            errors.push("daemon.request_timeout_ms must be positive".to_string());
        }
        if self.daemon.client_timeout_ms == 0 {
            errors.push("daemon.client_timeout_ms must be positive".to_string());
        }

        if !(0.0..=1.0).contains(&self.contacts.fuzzy_threshold) {
            errors.push("contacts.fuzzy_threshold must be between 0.0 and 1.0".to_string());
        }
        if !self.contacts.default_country_code.chars().all(|c| c.is_ascii_digit())
            || self.contacts.default_country_code.is_empty()
        {
            errors.push("contacts.default_country_code must be digits".to_string());
        }

        if self.google.token_endpoint.is_empty() {
            errors.push("google.token_endpoint must not be empty".to_string());
        }
        if self.google.http_timeout_secs == 0 {
            errors.push("google.http_timeout_secs must be positive".to_string());
        }

        if self.messages.send_command.is_empty() {
            errors.push("messages.send_command must not be empty".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            anyhow::bail!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            );
        }
    }
}
