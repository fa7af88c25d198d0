use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::Row;

/// Label applied when an email matches no configured domain.
pub const UNKNOWN_LABEL: &str = "Unknown";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read domain lookup document: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse domain lookup document: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DomainInfo {
    pub institution: String,
    pub country: String,
}

/// The sanctioned-domain watchlist: domain suffix → institution metadata.
///
/// Loaded once at process start from a static JSON document shaped
/// `{"domains": {"univ.example": {"institution": ..., "country": ...}}}`.
/// Load failure degrades to an empty lookup at the call site; an empty
/// lookup labels every row [`UNKNOWN_LABEL`] and matches no rows at all
/// in the sanctioned-domains report.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DomainLookup {
    domains: BTreeMap<String, DomainInfo>,
}

impl DomainLookup {
    /// Load the lookup document from disk.
    ///
    /// # Errors
    /// Returns an error when the file cannot be read or parsed; callers
    /// fall back to [`DomainLookup::default`] with a warning.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(Self::from_json(&raw)?)
    }

    /// Parse the lookup document from a JSON string.
    ///
    /// # Errors
    /// Returns an error when the document is not valid JSON of the
    /// expected shape.
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.domains.len()
    }

    /// Configured domains, in stable (sorted) order.
    pub fn domains(&self) -> impl Iterator<Item = &str> {
        self.domains.keys().map(String::as_str)
    }

    /// First configured domain contained in the email, case-insensitive.
    #[must_use]
    pub fn find(&self, email: &str) -> Option<(&str, &DomainInfo)> {
        let email = email.to_ascii_lowercase();
        self.domains
            .iter()
            .find(|(domain, _)| email.contains(&domain.to_ascii_lowercase()))
            .map(|(domain, info)| (domain.as_str(), info))
    }

    /// Annotate result rows with institution/country from the lookup,
    /// labeling unmatched rows rather than excluding them.
    pub fn annotate(&self, rows: &mut [Row]) {
        for row in rows {
            let matched = row
                .get("email")
                .and_then(serde_json::Value::as_str)
                .and_then(|email| self.find(email))
                .map(|(_, info)| info.clone());

            let (institution, country) = match matched {
                Some(info) => (info.institution, info.country),
                None => (UNKNOWN_LABEL.to_string(), UNKNOWN_LABEL.to_string()),
            };
            row.insert("institution".to_string(), serde_json::Value::from(institution));
            row.insert("country".to_string(), serde_json::Value::from(country));
        }
    }
}
