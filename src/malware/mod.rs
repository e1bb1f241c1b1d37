//! Malware database client and local cache (C2, C3).

pub mod cache;
pub mod client;

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// A single malware entry. Immutable once loaded; compared on
/// `(package_name, version)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MalwareEntry {
    pub package_name: String,
    pub version: String,
    #[serde(default)]
    pub reason: String,
}

/// A set of entries plus the version (ETag) they were fetched under. This is
/// the on-disk/wire shape; [`IndexedMalwareDatabase`] is the in-memory form
/// `MalwareCache` actually looks entries up against.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MalwareDatabase {
    pub entries: Vec<MalwareEntry>,
    pub version: String,
}

/// A [`MalwareDatabase`] plus a `name -> {versions}` index built once at
/// load time, so `isMalware(name, version)` is a hash lookup rather than a
/// rescan of every entry on each request.
#[derive(Debug, Clone, Default)]
pub struct IndexedMalwareDatabase {
    pub database: MalwareDatabase,
    index: HashMap<String, HashSet<String>>,
}

impl From<MalwareDatabase> for IndexedMalwareDatabase {
    fn from(database: MalwareDatabase) -> Self {
        let mut index: HashMap<String, HashSet<String>> = HashMap::new();
        for entry in &database.entries {
            index
                .entry(entry.package_name.clone())
                .or_default()
                .insert(entry.version.clone());
        }
        Self { database, index }
    }
}

impl IndexedMalwareDatabase {
    pub fn version(&self) -> &str {
        &self.database.version
    }

    /// `isMalware(name, version)`. For PyPI ecosystems, callers additionally
    /// probe the `_`-to-`-` normalized name; this lookup itself is
    /// ecosystem-agnostic and only checks the literal name given.
    pub fn is_malware(&self, name: &str, version: &str) -> bool {
        self.index
            .get(name)
            .map(|versions| versions.contains(version))
            .unwrap_or(false)
    }
}

/// Which ecosystem a malware-list fetch or lookup targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MalwareEcosystem {
    Js,
    Py,
}

impl MalwareEcosystem {
    pub fn as_str(self) -> &'static str {
        match self {
            MalwareEcosystem::Js => "js",
            MalwareEcosystem::Py => "py",
        }
    }

    pub fn source_url(self) -> &'static str {
        match self {
            MalwareEcosystem::Js => "https://malware-list.aikido.dev/malware_predictions.json",
            MalwareEcosystem::Py => "https://malware-list.aikido.dev/malware_pypi.json",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, version: &str) -> MalwareEntry {
        MalwareEntry {
            package_name: name.to_string(),
            version: version.to_string(),
            reason: "test".to_string(),
        }
    }

    #[test]
    fn is_malware_matches_exact_pair() {
        let db: IndexedMalwareDatabase = MalwareDatabase {
            entries: vec![entry("evil-pkg", "1.0.0")],
            version: "v1".into(),
        }
        .into();
        assert!(db.is_malware("evil-pkg", "1.0.0"));
        assert!(!db.is_malware("evil-pkg", "1.0.1"));
        assert!(!db.is_malware("fine-pkg", "1.0.0"));
    }
}
