//! Daemon State & Backend Registry
//!
//! Process-wide state: the lazily-constructed backend registry, the shared
//! credential cache, and the contact directory. Constructed once at daemon
//! start and passed by `Arc`; there are no module-level globals, so tests
//! can run multiple isolated daemons in one process.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tracing::info;

use crate::auth::CredentialCache;
use crate::config::Config;
use crate::contacts::ContactDirectory;
use crate::services::{
    CalendarService, EmailService, MessageService, ReminderService, ServiceBackend, ServiceError,
};

/// Names a request can put in `service`, besides the built-in `daemon`.
pub const SERVICES: &[&str] = &["messages", "contacts", "calendar", "email", "reminders"];

pub struct DaemonState {
    config: Config,
    started_at: Instant,
    started_at_utc: DateTime<Utc>,
    credentials: Arc<CredentialCache>,
    contacts: Arc<ContactDirectory>,
    /// service name -> constructed backend. Construction happens while
    /// holding the map lock, so two concurrent first requests for the same
    /// service cannot both construct it.
    backends: tokio::sync::Mutex<HashMap<&'static str, Arc<dyn ServiceBackend>>>,
}

impl DaemonState {
    pub fn new(config: Config) -> Self {
        let contacts = Arc::new(ContactDirectory::load(&config.contacts));
        Self {
            config,
            started_at: Instant::now(),
            started_at_utc: Utc::now(),
            credentials: Arc::new(CredentialCache::new()),
            contacts,
            backends: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn contacts(&self) -> Arc<ContactDirectory> {
        Arc::clone(&self.contacts)
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    pub fn started_at_utc(&self) -> DateTime<Utc> {
        self.started_at_utc
    }

    /// Look up a backend, constructing it on first use.
    ///
    /// Integration-specific startup cost (opening the message database,
    /// reading credential files) is paid on the first request for that
    /// service, never at daemon start and never for unused services.
    pub async fn backend(&self, service: &str) -> Result<Arc<dyn ServiceBackend>, BackendLookup> {
        let name = match SERVICES.iter().find(|s| **s == service) {
            Some(name) => *name,
            None => return Err(BackendLookup::UnknownService),
        };

        let mut backends = self.backends.lock().await;
        if let Some(backend) = backends.get(name) {
            return Ok(Arc::clone(backend));
        }

        info!("Constructing backend for service '{}'", name);
        let backend = self.construct(name)?;
        backends.insert(name, Arc::clone(&backend));
        Ok(backend)
    }

    fn construct(&self, name: &'static str) -> Result<Arc<dyn ServiceBackend>, BackendLookup> {
        let backend: Arc<dyn ServiceBackend> = match name {
            "messages" => Arc::new(
                MessageService::new(&self.config, self.contacts())
                    .map_err(BackendLookup::Construction)?,
            ),
            "contacts" => Arc::new(ContactService::new(self.contacts())),
            "calendar" => Arc::new(
                CalendarService::new(&self.config, Arc::clone(&self.credentials))
                    .map_err(BackendLookup::Construction)?,
            ),
            "email" => Arc::new(
                EmailService::new(&self.config, Arc::clone(&self.credentials))
                    .map_err(BackendLookup::Construction)?,
            ),
            "reminders" => {
                Arc::new(ReminderService::new(&self.config).map_err(BackendLookup::Construction)?)
            }
            _ => return Err(BackendLookup::UnknownService),
        };
        Ok(backend)
    }

    /// Which services have been constructed so far, for `daemon.status`.
    pub async fn initialized_services(&self) -> Vec<&'static str> {
        let backends = self.backends.lock().await;
        let mut names: Vec<&'static str> = backends.keys().copied().collect();
        names.sort_unstable();
        names
    }
}

/// Why a backend lookup failed.
#[derive(Debug)]
pub enum BackendLookup {
    UnknownService,
    Construction(ServiceError),
}

/// Contact service backend: thin dispatch over the shared directory.
///
/// Lives here rather than under `services/` because it owns no external
/// integration; it exposes the directory the daemon already holds.
pub struct ContactService {
    contacts: Arc<ContactDirectory>,
}

impl ContactService {
    pub fn new(contacts: Arc<ContactDirectory>) -> Self {
        Self { contacts }
    }
}

#[async_trait::async_trait]
impl ServiceBackend for ContactService {
    fn name(&self) -> &'static str {
        "contacts"
    }

    async fn dispatch(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, ServiceError> {
        use crate::services::params;
        use serde_json::json;

        match method {
            "resolve" => {
                let query = params::required_str(&params, "query")?;
                let resolved = self.contacts.resolve(query)?;
                Ok(serde_json::to_value(resolved).map_err(anyhow::Error::from)?)
            }
            "list" => {
                let contacts = self.contacts.list();
                Ok(json!({ "count": contacts.len(), "contacts": contacts }))
            }
            "resync" => {
                let count = self.contacts.resync().map_err(ServiceError::Backend)?;
                Ok(json!({ "resynced": true, "count": count }))
            }
            _ => Err(ServiceError::UnknownMethod(format!("contacts.{method}"))),
        }
    }
}
