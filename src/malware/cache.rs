//! On-disk cache over the fetched malware databases (C3).

use super::client;
use super::{IndexedMalwareDatabase, MalwareDatabase, MalwareEcosystem};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

/// Lazily-initialized, process-wide-in-spirit cache. In this crate it is
/// owned by [`crate::runtime::ProxyRuntime`] rather than a true global, so
/// tests can construct several side by side.
pub struct MalwareCache {
    dir: PathBuf,
    http: reqwest::Client,
    databases: RwLock<HashMap<&'static str, IndexedMalwareDatabase>>,
    /// Serializes `open()` so the first caller for a given ecosystem does
    /// the fetch/load and later concurrent callers simply wait for it
    /// guards one-shot synchronization on the database init barrier.
    init_lock: tokio::sync::Mutex<()>,
}

impl MalwareCache {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self::with_scan_timeout(cache_dir, crate::config::DEFAULT_SCAN_TIMEOUT_MS)
    }

    /// Same as [`MalwareCache::new`], but bounds each malware-list request
    /// (GET and HEAD alike) to `scan_timeout_ms` (`scanTimeout` in
    /// `config.json` / `AIKIDO_SCAN_TIMEOUT_MS`).
    pub fn with_scan_timeout(cache_dir: impl Into<PathBuf>, scan_timeout_ms: u64) -> Self {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_millis(scan_timeout_ms))
            .build()
            .unwrap_or_default();
        Self {
            dir: cache_dir.into(),
            http,
            databases: RwLock::new(HashMap::new()),
            init_lock: tokio::sync::Mutex::new(()),
        }
    }

    fn db_path(&self, ecosystem: MalwareEcosystem) -> PathBuf {
        self.dir.join(format!("malwareDatabase_{}.json", ecosystem.as_str()))
    }

    fn version_path(&self, ecosystem: MalwareEcosystem) -> PathBuf {
        self.dir.join(format!("version_{}.txt", ecosystem.as_str()))
    }

    /// Reads the cached copy if present, HEAD-checks the remote, and
    /// refetches only if the ETag changed. A HEAD failure is non-fatal if a
    /// valid cache already exists; otherwise it is surfaced to the caller.
    pub async fn open(&self, ecosystem: MalwareEcosystem) -> anyhow::Result<()> {
        if self.databases.read().unwrap().contains_key(ecosystem.as_str()) {
            return Ok(());
        }

        let _guard = self.init_lock.lock().await;
        if self.databases.read().unwrap().contains_key(ecosystem.as_str()) {
            return Ok(());
        }

        let cached = read_cached(&self.db_path(ecosystem), &self.version_path(ecosystem));

        match client::fetch_database_version(&self.http, ecosystem).await {
            Ok(remote_version) => {
                let up_to_date = cached
                    .as_ref()
                    .map(|db| db.version == remote_version)
                    .unwrap_or(false);

                let db = if up_to_date {
                    cached.unwrap()
                } else {
                    match client::fetch_database(&self.http, ecosystem).await {
                        Ok(db) => {
                            write_cache(&self.db_path(ecosystem), &self.version_path(ecosystem), &db);
                            db
                        }
                        Err(err) => {
                            if let Some(db) = cached {
                                tracing::warn!(
                                    "failed to refresh malware database for {}: {err}; using cache",
                                    ecosystem.as_str()
                                );
                                db
                            } else {
                                return Err(crate::error::ProxyError::MalwareFetch {
                                    ecosystem: ecosystem.as_str().to_string(),
                                    source: err,
                                }
                                .into());
                            }
                        }
                    }
                };
                self.databases
                    .write()
                    .unwrap()
                    .insert(ecosystem.as_str(), db.into());
            }
            Err(err) => {
                if let Some(db) = cached {
                    tracing::warn!(
                        "failed to probe malware database version for {}: {err}; using cache",
                        ecosystem.as_str()
                    );
                    self.databases
                        .write()
                        .unwrap()
                        .insert(ecosystem.as_str(), db.into());
                } else {
                    return Err(crate::error::ProxyError::MalwareFetch {
                        ecosystem: ecosystem.as_str().to_string(),
                        source: err,
                    }
                    .into());
                }
            }
        }

        Ok(())
    }

    /// Test-only seam: installs a database snapshot directly, bypassing the
    /// network fetch, so interceptor-pipeline tests can exercise `isMalware`
    /// without a mock HTTP server.
    #[cfg(test)]
    pub fn seed_for_test(&self, ecosystem: MalwareEcosystem, db: MalwareDatabase) {
        self.databases
            .write()
            .unwrap()
            .insert(ecosystem.as_str(), db.into());
    }

    /// O(1) lookup against the loaded snapshot's precomputed index. For
    /// PyPI, also probes the `_`-to-`-` normalized name (PEP 503-adjacent).
    pub fn is_malware(&self, ecosystem: MalwareEcosystem, name: &str, version: &str) -> bool {
        let guard = self.databases.read().unwrap();
        let Some(db) = guard.get(ecosystem.as_str()) else {
            return false;
        };
        if db.is_malware(name, version) {
            return true;
        }
        if ecosystem == MalwareEcosystem::Py && name.contains('_') {
            let normalized = name.replace('_', "-");
            return db.is_malware(&normalized, version);
        }
        false
    }
}

/// `version` file must pair with the body file: if one is missing, both are
/// considered absent.
fn read_cached(db_path: &Path, version_path: &Path) -> Option<MalwareDatabase> {
    let body = std::fs::read_to_string(db_path).ok()?;
    let version = std::fs::read_to_string(version_path).ok()?;
    let entries = serde_json::from_str(&body).ok()?;
    Some(MalwareDatabase {
        entries,
        version: version.trim().to_string(),
    })
}

/// Atomic temp-then-rename write of both files. Write errors are a warning
/// only — the next invocation simply refetches.
fn write_cache(db_path: &Path, version_path: &Path, db: &MalwareDatabase) {
    if let Some(parent) = db_path.parent() {
        if let Err(err) = std::fs::create_dir_all(parent) {
            tracing::warn!("failed to create malware cache directory: {err}");
            return;
        }
    }
    if let Err(err) = atomic_write(db_path, &serde_json::to_vec(&db.entries).unwrap_or_default()) {
        tracing::warn!("failed to write malware database cache: {err}");
        return;
    }
    if let Err(err) = atomic_write(version_path, db.version.as_bytes()) {
        tracing::warn!("failed to write malware database version: {err}");
    }
}

fn atomic_write(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let tmp_path = path.with_extension("tmp");
    std::fs::write(&tmp_path, contents)?;
    std::fs::rename(&tmp_path, path)
}
