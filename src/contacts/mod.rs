//! Contact Directory
//!
//! Loads a local JSON directory of contacts and resolves free-text name
//! queries to canonical identifiers. Resolution is staged: exact match,
//! then substring containment, then fuzzy similarity gated by a threshold.
//! The directory is read once at daemon start and refreshed only by an
//! explicit resync; directory sync from external sources is someone else's
//! job.

pub mod fuzzy;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::ContactsConfig;
use crate::services::ServiceError;

/// One directory entry. The normalized identifier is the dedup key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contact {
    pub name: String,
    pub phone: String,
    #[serde(default = "default_relationship")]
    pub relationship_type: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub notes: String,
}

fn default_relationship() -> String {
    "other".to_string()
}

/// The directory file accepts both `{"contacts": [...]}` and a flat array.
#[derive(Deserialize)]
#[serde(untagged)]
enum DirectoryFile {
    Wrapped { contacts: Vec<Contact> },
    Flat(Vec<Contact>),
}

/// How a query resolved.
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedContact {
    pub name: String,
    pub identifier: String,
    pub relationship_type: String,
    pub matched_via: &'static str,
    pub score: f64,
}

/// In-memory contact directory with staged resolution.
pub struct ContactDirectory {
    path: PathBuf,
    fuzzy_threshold: f64,
    country_code: String,
    entries: RwLock<Vec<Contact>>,
}

impl ContactDirectory {
    /// Load the directory from disk. A missing file is not an error: the
    /// daemon still serves every other service, and resync can pick the
    /// file up later.
    pub fn load(config: &ContactsConfig) -> Self {
        let dir = Self {
            path: config.path.clone(),
            fuzzy_threshold: config.fuzzy_threshold,
            country_code: config.default_country_code.clone(),
            entries: RwLock::new(Vec::new()),
        };
        if let Err(e) = dir.resync() {
            warn!("Contact directory unavailable: {}", e);
        }
        dir
    }

    /// Re-read the directory file, replacing the in-memory entries.
    /// Entries sharing a normalized identifier are deduplicated, keeping
    /// the first occurrence.
    pub fn resync(&self) -> Result<usize> {
        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read contact directory {}", self.path.display()))?;
        let parsed: DirectoryFile = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse contact directory {}", self.path.display()))?;
        let raw = match parsed {
            DirectoryFile::Wrapped { contacts } => contacts,
            DirectoryFile::Flat(contacts) => contacts,
        };

        let mut seen: Vec<String> = Vec::new();
        let mut contacts: Vec<Contact> = Vec::new();
        for contact in raw {
            let key = normalize_identifier(&contact.phone, &self.country_code);
            if seen.contains(&key) {
                warn!("Duplicate contact identifier {} ({}), keeping first", key, contact.name);
                continue;
            }
            seen.push(key);
            contacts.push(contact);
        }

        let count = contacts.len();
        *self.entries.write() = contacts;
        info!("Loaded {} contacts from {}", count, self.path.display());
        Ok(count)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All entries, in directory order.
    pub fn list(&self) -> Vec<Contact> {
        self.entries.read().clone()
    }

    /// Resolve a free-text query to a contact.
    ///
    /// Stages run in order and the first hit wins, which makes resolution
    /// deterministic for a given (directory, query) pair; within a stage,
    /// ties keep the earliest directory entry.
    pub fn resolve(&self, query: &str) -> Result<ResolvedContact, ServiceError> {
        let query = query.trim();
        if query.is_empty() {
            return Err(ServiceError::InvalidParams("query must not be empty".into()));
        }
        let entries = self.entries.read();

        // Identifier lookups normalize both sides first, so
        // "+1 (415) 555-1234" finds the entry stored as "4155551234".
        let normalized_query = normalize_identifier(query, &self.country_code);
        let query_lower = query.to_lowercase();

        // Stage 1: exact match on identifier, name, or alias.
        for contact in entries.iter() {
            let exact = normalize_identifier(&contact.phone, &self.country_code) == normalized_query
                || contact.name.to_lowercase() == query_lower
                || contact.aliases.iter().any(|a| a.to_lowercase() == query_lower);
            if exact {
                return Ok(self.hit(contact, "exact", 1.0));
            }
        }

        // Stage 2: substring containment.
        for contact in entries.iter() {
            if contact.name.to_lowercase().contains(&query_lower)
                || contact.aliases.iter().any(|a| a.to_lowercase().contains(&query_lower))
            {
                let score = fuzzy::similarity(query, &contact.name);
                return Ok(self.hit(contact, "partial", score.max(self.fuzzy_threshold)));
            }
        }

        // Stage 3: fuzzy, accepted only above the threshold. Strictly
        // greater comparison keeps the earliest entry on ties.
        let mut best: Option<(&Contact, f64)> = None;
        for contact in entries.iter() {
            let score = std::iter::once(contact.name.as_str())
                .chain(contact.aliases.iter().map(String::as_str))
                .map(|candidate| fuzzy::similarity(query, candidate))
                .fold(0.0, f64::max);
            if best.map_or(true, |(_, s)| score > s) {
                best = Some((contact, score));
            }
        }
        match best {
            Some((contact, score)) if score >= self.fuzzy_threshold => {
                Ok(self.hit(contact, "fuzzy", score))
            }
            _ => Err(ServiceError::NotFound(format!("no contact matching '{query}'"))),
        }
    }

    fn hit(&self, contact: &Contact, via: &'static str, score: f64) -> ResolvedContact {
        ResolvedContact {
            name: contact.name.clone(),
            identifier: normalize_identifier(&contact.phone, &self.country_code),
            relationship_type: contact.relationship_type.clone(),
            matched_via: via,
            score,
        }
    }
}

/// Normalize an identifier for comparison and storage.
///
/// Emails are lowercased. Phone numbers are stripped to digits and given a
/// consistent country-code representation: a bare 10-digit number gets the
/// default country code prepended, so "+1 (415) 555-1234" and "4155551234"
/// both normalize to "14155551234".
pub fn normalize_identifier(raw: &str, country_code: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.contains('@') {
        return trimmed.to_lowercase();
    }

    let digits: String = trimmed.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() == 10 {
        format!("{country_code}{digits}")
    } else {
        digits
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn directory_with(json: &str) -> (ContactDirectory, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("contacts.json");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(json.as_bytes()).unwrap();

        let config = ContactsConfig {
            path,
            fuzzy_threshold: 0.85,
            default_country_code: "1".to_string(),
        };
        (ContactDirectory::load(&config), dir)
    }

    fn sample() -> (ContactDirectory, tempfile::TempDir) {
        directory_with(
            r#"{"contacts": [
                {"name": "John Doe", "phone": "+1 (415) 555-1234", "relationship_type": "friend", "aliases": ["Johnny"]},
                {"name": "Sarah Jane Smith", "phone": "4155559876", "relationship_type": "family"},
                {"name": "Work Desk", "phone": "ops@example.COM"}
            ]}"#,
        )
    }

    #[test]
    fn normalize_phone_variants_compare_equal() {
        assert_eq!(normalize_identifier("+1 (415) 555-1234", "1"), "14155551234");
        assert_eq!(normalize_identifier("4155551234", "1"), "14155551234");
        assert_eq!(normalize_identifier("14155551234", "1"), "14155551234");
        assert_eq!(normalize_identifier("Ops@Example.com", "1"), "ops@example.com");
    }

    #[test]
    fn exact_name_match_is_stage_one() {
        let (dir, _tmp) = sample();
        let hit = dir.resolve("john doe").unwrap();
        assert_eq!(hit.name, "John Doe");
        assert_eq!(hit.matched_via, "exact");
        assert_eq!(hit.identifier, "14155551234");
    }

    #[test]
    fn alias_and_identifier_match_exactly() {
        let (dir, _tmp) = sample();
        assert_eq!(dir.resolve("Johnny").unwrap().matched_via, "exact");
        assert_eq!(dir.resolve("(415) 555-9876").unwrap().name, "Sarah Jane Smith");
    }

    #[test]
    fn first_name_resolves_with_high_score() {
        let (dir, _tmp) = sample();
        let hit = dir.resolve("John").unwrap();
        assert_eq!(hit.name, "John Doe");
        assert!(hit.score >= 0.85);
    }

    #[test]
    fn fuzzy_match_tolerates_word_order_and_typos() {
        let (dir, _tmp) = sample();
        let hit = dir.resolve("Smith Sarah").unwrap();
        assert_eq!(hit.name, "Sarah Jane Smith");
    }

    #[test]
    fn below_threshold_is_not_found() {
        let (dir, _tmp) = sample();
        let err = dir.resolve("Zzyzx").unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(_)));
    }

    #[test]
    fn resolution_is_deterministic() {
        let (dir, _tmp) = sample();
        let a = dir.resolve("Sarah").unwrap();
        let b = dir.resolve("Sarah").unwrap();
        assert_eq!(a.name, b.name);
        assert_eq!(a.score, b.score);
    }

    #[test]
    fn flat_array_layout_is_accepted() {
        let (dir, _tmp) = directory_with(r#"[{"name": "Ana Lee", "phone": "4155550000"}]"#);
        assert_eq!(dir.list().len(), 1);
        assert_eq!(dir.resolve("Ana Lee").unwrap().identifier, "14155550000");
    }

    #[test]
    fn duplicate_identifiers_keep_first_entry() {
        let (dir, _tmp) = directory_with(
            r#"[{"name": "Ana", "phone": "4155550000"},
                {"name": "Ana Copy", "phone": "+1 415 555 0000"}]"#,
        );
        let contacts = dir.list();
        assert_eq!(contacts.len(), 1);
        assert_eq!(contacts[0].name, "Ana");
    }

    #[test]
    fn missing_file_yields_empty_directory_and_resync_recovers() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("contacts.json");
        let config = ContactsConfig {
            path: path.clone(),
            fuzzy_threshold: 0.85,
            default_country_code: "1".to_string(),
        };
        let dir = ContactDirectory::load(&config);
        assert!(dir.list().is_empty());
        assert!(matches!(dir.resolve("John"), Err(ServiceError::NotFound(_))));

        std::fs::write(&path, r#"[{"name": "John Doe", "phone": "4155551234"}]"#).unwrap();
        assert_eq!(dir.resync().unwrap(), 1);
        assert_eq!(dir.resolve("John Doe").unwrap().identifier, "14155551234");
    }
}
