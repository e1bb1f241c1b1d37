//! Per-URL interceptor factory: ecosystem routing, malware-block
//! decisions, and npm metadata-age suppression wiring.

use crate::config::Ecosystem;
use crate::malware::{cache::MalwareCache, MalwareEcosystem};
use crate::registry::{self, npm_rewrite, parsers, RegistryKind};
use std::sync::Arc;
use tokio::sync::broadcast;

#[derive(Debug, Clone)]
pub struct BlockResponse {
    pub status_code: u16,
    pub message: String,
}

/// A frozen, per-request decision: whether to block, and which request /
/// response mutators apply. `build()` in the original design simply means
/// "this value is complete" — represented here by returning an owned,
/// already-final `Interceptor`.
#[derive(Debug, Clone, Default)]
pub struct Interceptor {
    pub block: Option<BlockResponse>,
    pub rewrite_accept_header: bool,
    pub npm_rewrite_cutoff_millis: Option<i64>,
}

impl Interceptor {
    pub fn is_blocked(&self) -> bool {
        self.block.is_some()
    }
}

#[derive(Debug, Clone)]
pub enum InterceptorEvent {
    PackageChecked {
        name: String,
        version: String,
    },
    MalwareBlocked {
        name: String,
        version: String,
        url: String,
        timestamp_millis: i64,
    },
}

pub struct InterceptorPipeline {
    ecosystem: Ecosystem,
    malware: Arc<MalwareCache>,
    npm_custom_registries: Vec<String>,
    pip_custom_registries: Vec<String>,
    minimum_package_age_hours: u64,
    events: broadcast::Sender<InterceptorEvent>,
}

impl InterceptorPipeline {
    pub fn new(
        ecosystem: Ecosystem,
        malware: Arc<MalwareCache>,
        npm_custom_registries: Vec<String>,
        pip_custom_registries: Vec<String>,
        minimum_package_age_hours: u64,
    ) -> Self {
        let (events, _rx) = broadcast::channel(256);
        Self {
            ecosystem,
            malware,
            npm_custom_registries,
            pip_custom_registries,
            minimum_package_age_hours,
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<InterceptorEvent> {
        self.events.subscribe()
    }

    pub fn ecosystem(&self) -> Ecosystem {
        self.ecosystem
    }

    pub fn npm_custom_registries(&self) -> &[String] {
        &self.npm_custom_registries
    }

    pub fn pip_custom_registries(&self) -> &[String] {
        &self.pip_custom_registries
    }

    /// `createInterceptorForUrl(url)`. Returns `None` if the target host
    /// does not belong to a registry consulted under the active ecosystem.
    pub fn create_interceptor_for_url(&self, url: &str, host: &str) -> Option<Interceptor> {
        let kind = registry::registry_kind_for_host(
            host,
            self.ecosystem,
            &self.npm_custom_registries,
            &self.pip_custom_registries,
        )?;

        Some(match kind {
            RegistryKind::Npm => self.build_npm_interceptor(url),
            RegistryKind::PyPi => self.build_pypi_interceptor(url),
        })
    }

    fn build_npm_interceptor(&self, url: &str) -> Interceptor {
        let mut interceptor = Interceptor::default();

        if let Some(pkg) = parsers::parse_npm(url) {
            self.emit_checked(&pkg.name, &pkg.version);
            if self.malware.is_malware(MalwareEcosystem::Js, &pkg.name, &pkg.version) {
                interceptor.block = Some(self.block_response());
                self.emit_blocked(&pkg.name, &pkg.version, url);
                return interceptor;
            }
        }

        let path = path_of(url);
        if npm_rewrite::is_package_info_url(path) {
            interceptor.rewrite_accept_header = true;
            if self.minimum_package_age_hours > 0 {
                interceptor.npm_rewrite_cutoff_millis = Some(self.cutoff_millis());
            }
        }

        interceptor
    }

    fn build_pypi_interceptor(&self, url: &str) -> Interceptor {
        let mut interceptor = Interceptor::default();

        if let Some(pkg) = parsers::parse_pypi(url) {
            self.emit_checked(&pkg.name, &pkg.version);
            if self.malware.is_malware(MalwareEcosystem::Py, &pkg.name, &pkg.version) {
                interceptor.block = Some(self.block_response());
                self.emit_blocked(&pkg.name, &pkg.version, url);
            }
        }

        interceptor
    }

    fn block_response(&self) -> BlockResponse {
        BlockResponse {
            status_code: 403,
            message: "Forbidden - blocked by safe-chain".to_string(),
        }
    }

    fn cutoff_millis(&self) -> i64 {
        chrono::Utc::now().timestamp_millis() - (self.minimum_package_age_hours as i64) * 3_600_000
    }

    fn emit_checked(&self, name: &str, version: &str) {
        let _ = self.events.send(InterceptorEvent::PackageChecked {
            name: name.to_string(),
            version: version.to_string(),
        });
    }

    fn emit_blocked(&self, name: &str, version: &str, url: &str) {
        let _ = self.events.send(InterceptorEvent::MalwareBlocked {
            name: name.to_string(),
            version: version.to_string(),
            url: url.to_string(),
            timestamp_millis: chrono::Utc::now().timestamp_millis(),
        });
    }
}

fn path_of(url: &str) -> &str {
    let without_scheme = url.split_once("://").map(|(_, r)| r).unwrap_or(url);
    without_scheme.split_once('/').map(|(_, r)| r).unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn pipeline_with_blocklist(dir: &std::path::Path) -> InterceptorPipeline {
        InterceptorPipeline::new(
            Ecosystem::All,
            Arc::new(MalwareCache::new(dir)),
            vec![],
            vec![],
            24,
        )
    }

    #[test]
    fn unrelated_host_yields_no_interceptor() {
        let dir = tempdir().unwrap();
        let pipeline = pipeline_with_blocklist(dir.path());
        assert!(pipeline
            .create_interceptor_for_url("https://example.com/whatever", "example.com")
            .is_none());
    }

    #[test]
    fn npm_metadata_request_installs_rewrite_mutators() {
        let dir = tempdir().unwrap();
        let pipeline = pipeline_with_blocklist(dir.path());
        let interceptor = pipeline
            .create_interceptor_for_url("https://registry.npmjs.org/lodash", "registry.npmjs.org")
            .expect("npm registry should be recognized");
        assert!(!interceptor.is_blocked());
        assert!(interceptor.rewrite_accept_header);
        assert!(interceptor.npm_rewrite_cutoff_millis.is_some());
    }

    #[test]
    fn npm_tarball_request_does_not_install_rewrite_mutators() {
        let dir = tempdir().unwrap();
        let pipeline = pipeline_with_blocklist(dir.path());
        let interceptor = pipeline
            .create_interceptor_for_url(
                "https://registry.npmjs.org/lodash/-/lodash-4.17.21.tgz",
                "registry.npmjs.org",
            )
            .unwrap();
        assert!(!interceptor.rewrite_accept_header);
    }

    #[test]
    fn npm_metadata_request_still_rewrites_accept_header_when_age_filter_is_disabled() {
        let dir = tempdir().unwrap();
        let pipeline = InterceptorPipeline::new(
            Ecosystem::All,
            Arc::new(MalwareCache::new(dir.path())),
            vec![],
            vec![],
            0,
        );
        let interceptor = pipeline
            .create_interceptor_for_url("https://registry.npmjs.org/lodash", "registry.npmjs.org")
            .unwrap();
        assert!(interceptor.rewrite_accept_header);
        assert!(interceptor.npm_rewrite_cutoff_millis.is_none());
    }

    #[test]
    fn blocks_known_malicious_npm_tarball() {
        use crate::malware::{MalwareDatabase, MalwareEntry};

        let dir = tempdir().unwrap();
        let malware = Arc::new(MalwareCache::new(dir.path()));
        malware.seed_for_test(
            MalwareEcosystem::Js,
            MalwareDatabase {
                entries: vec![MalwareEntry {
                    package_name: "safe-chain-test".into(),
                    version: "0.0.1-security".into(),
                    reason: "test".into(),
                }],
                version: "v1".into(),
            },
        );
        let pipeline = InterceptorPipeline::new(Ecosystem::All, malware, vec![], vec![], 24);

        let interceptor = pipeline
            .create_interceptor_for_url(
                "https://registry.npmjs.org/safe-chain-test/-/safe-chain-test-0.0.1-security.tgz",
                "registry.npmjs.org",
            )
            .unwrap();
        assert!(interceptor.is_blocked());
        assert_eq!(interceptor.block.unwrap().status_code, 403);
    }

    #[test]
    fn blocks_pypi_wheel_with_underscore_name_via_normalization() {
        use crate::malware::{MalwareDatabase, MalwareEntry};

        let dir = tempdir().unwrap();
        let malware = Arc::new(MalwareCache::new(dir.path()));
        malware.seed_for_test(
            MalwareEcosystem::Py,
            MalwareDatabase {
                entries: vec![MalwareEntry {
                    package_name: "safe-chain-pi-test".into(),
                    version: "0.0.1".into(),
                    reason: "test".into(),
                }],
                version: "v1".into(),
            },
        );
        let pipeline = InterceptorPipeline::new(Ecosystem::All, malware, vec![], vec![], 24);

        let interceptor = pipeline
            .create_interceptor_for_url(
                "https://files.pythonhosted.org/packages/xx/yy/safe_chain_pi_test-0.0.1-py3-none-any.whl",
                "files.pythonhosted.org",
            )
            .unwrap();
        assert!(interceptor.is_blocked());
    }
}
