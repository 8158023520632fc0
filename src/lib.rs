//! commgate: warm gateway daemon for personal communication data.
//!
//! Low-latency, scriptable access to local communication data (message
//! history, contacts, calendar, reminders, email) without paying the
//! cold-start cost of re-initializing parsers, database handles, and
//! OAuth credentials on every invocation. Featuring:
//! - Thin-client/daemon pairing over a Unix domain socket (NDJSON framing)
//! - Best-effort binary decoding of archived message bodies
//! - Staged exact/partial/fuzzy contact resolution
//! - Lazily-constructed service backends with a shared credential cache

pub mod auth;
pub mod client;
pub mod config;
pub mod contacts;
pub mod daemon;
pub mod services;
pub mod store;
pub mod util;

pub use config::Config;
