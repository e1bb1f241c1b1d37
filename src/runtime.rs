//! A single bundle owning the proxy's process-wide state: the certificate
//! authority, the malware cache, the interceptor pipeline, and the blocked
//! request log, each constructed explicitly rather than held in globals.

use crate::blocked::{BlockedRegistry, BlockedRequest};
use crate::certs::CertManager;
use crate::config::ProxyConfig;
use crate::interceptor::InterceptorPipeline;
use crate::malware::cache::MalwareCache;
use crate::malware::MalwareEcosystem;
use crate::proxy::mitm::MitmContext;
use crate::proxy::tunnel::ImdsTimeoutSet;
use anyhow::Context;
use rustls::{ClientConfig, RootCertStore};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

pub struct ProxyRuntime {
    config: ProxyConfig,
    cert_manager: Arc<CertManager>,
    malware: Arc<MalwareCache>,
    pipeline: Arc<InterceptorPipeline>,
    blocked: Arc<BlockedRegistry>,
    server_task: Mutex<Option<JoinHandle<()>>>,
    port: Mutex<Option<u16>>,
    keep_alive: Mutex<bool>,
}

impl ProxyRuntime {
    /// Builds a runtime from resolved configuration, loading/generating the
    /// CA eagerly, at construction time rather than on first connection.
    pub fn new(config: ProxyConfig) -> anyhow::Result<Self> {
        let storage_dir = config.storage_dir.join("certs");
        let cert_manager = Arc::new(
            CertManager::new(&storage_dir.to_string_lossy())
                .context("failed to initialize certificate authority")?,
        );
        let malware = Arc::new(MalwareCache::with_scan_timeout(
            config.cache_dir.clone(),
            config.scan_timeout_ms,
        ));
        let pipeline = Arc::new(InterceptorPipeline::new(
            config.ecosystem,
            malware.clone(),
            config.npm_custom_registries.clone(),
            config.pip_custom_registries.clone(),
            config.minimum_package_age_hours,
        ));

        Ok(Self {
            config,
            cert_manager,
            malware,
            pipeline,
            blocked: Arc::new(BlockedRegistry::new()),
            server_task: Mutex::new(None),
            port: Mutex::new(None),
            keep_alive: Mutex::new(true),
        })
    }

    /// Triggers the one-shot malware-database initializer for every
    /// ecosystem the active setting consults.
    pub async fn warm_malware_cache(&self) -> anyhow::Result<()> {
        use crate::config::Ecosystem;
        if matches!(self.config.ecosystem, Ecosystem::Js | Ecosystem::All) {
            self.malware.open(MalwareEcosystem::Js).await?;
        }
        if matches!(self.config.ecosystem, Ecosystem::Py | Ecosystem::All) {
            self.malware.open(MalwareEcosystem::Py).await?;
        }
        Ok(())
    }

    pub fn ca_cert_path(&self) -> std::path::PathBuf {
        self.cert_manager.ca_cert_path()
    }

    pub async fn set_keep_alive(&self, value: bool) {
        *self.keep_alive.lock().await = value;
    }

    /// Binds `127.0.0.1:<port or 0>` and spawns the accept loop.
    pub async fn start_server(&self, port: Option<u16>) -> anyhow::Result<u16> {
        let addr = format!("127.0.0.1:{}", port.unwrap_or(0));
        let listener = TcpListener::bind(&addr).await.map_err(|source| {
            crate::error::ProxyError::Bind {
                addr: addr.clone(),
                source,
            }
        })?;
        let bound_port = listener.local_addr()?.port();

        let tls_client_config = Arc::new(build_tls_client_config()?);
        let ctx = Arc::new(MitmContext {
            cert_manager: self.cert_manager.clone(),
            tls_client_config,
            pipeline: self.pipeline.clone(),
            blocked: self.blocked.clone(),
            imds_timeouts: Arc::new(ImdsTimeoutSet::new()),
        });

        let handle = tokio::spawn(async move {
            if let Err(err) = crate::proxy::run_server(listener, ctx).await {
                tracing::error!("proxy server loop exited: {err}");
            }
        });

        *self.server_task.lock().await = Some(handle);
        *self.port.lock().await = Some(bound_port);
        tracing::info!("proxy listening on 127.0.0.1:{bound_port}");
        Ok(bound_port)
    }

    /// Aborts the accept loop; waits at most 1s for it to wind down
    /// so a stuck connection handler can't block shutdown indefinitely.
    pub async fn stop_server(&self) {
        if let Some(handle) = self.server_task.lock().await.take() {
            handle.abort();
            let _ = tokio::time::timeout(std::time::Duration::from_secs(1), handle).await;
        }
        *self.port.lock().await = None;
    }

    pub async fn get_port(&self) -> Option<u16> {
        *self.port.lock().await
    }

    pub async fn get_proxy_url(&self) -> Option<String> {
        self.get_port().await.map(|p| format!("http://localhost:{p}"))
    }

    pub async fn get_environment_variables(&self) -> HashMap<String, String> {
        let mut env = HashMap::new();
        if let Some(port) = self.get_port().await {
            let url = format!("http://localhost:{port}");
            env.insert("HTTPS_PROXY".to_string(), url.clone());
            env.insert("GLOBAL_AGENT_HTTP_PROXY".to_string(), url);
        }
        env.insert(
            "NODE_EXTRA_CA_CERTS".to_string(),
            self.ca_cert_path().to_string_lossy().to_string(),
        );
        env
    }

    /// Overlays this runtime's environment variables on a copy of the
    /// caller's environment, with case-insensitive precedence for any
    /// `HTTPS_PROXY` the caller already set.
    pub async fn merge_proxy_env(&self, caller_env: &HashMap<String, String>) -> HashMap<String, String> {
        let mut merged = caller_env.clone();
        for (key, value) in self.get_environment_variables().await {
            let existing_key = merged.keys().find(|k| k.eq_ignore_ascii_case(&key)).cloned();
            if let Some(existing_key) = existing_key {
                merged.remove(&existing_key);
            }
            merged.insert(key, value);
        }
        merged
    }

    pub fn get_blocked_requests(&self) -> Vec<BlockedRequest> {
        self.blocked.snapshot()
    }

    pub fn verify_no_malicious_packages(&self) -> bool {
        self.blocked.verify_no_malicious_packages()
    }
}

fn build_tls_client_config() -> anyhow::Result<ClientConfig> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    Ok(ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Ecosystem;
    use tempfile::tempdir;

    fn test_config(dir: &std::path::Path) -> ProxyConfig {
        ProxyConfig {
            ecosystem: Ecosystem::All,
            scan_timeout_ms: 10_000,
            minimum_package_age_hours: 24,
            npm_custom_registries: vec![],
            pip_custom_registries: vec![],
            install_possibly_malicious: false,
            storage_dir: dir.join("safe-chain"),
            cache_dir: dir.join("aikido"),
        }
    }

    #[tokio::test]
    async fn start_and_stop_assigns_and_releases_a_port() {
        let dir = tempdir().unwrap();
        let runtime = ProxyRuntime::new(test_config(dir.path())).unwrap();

        let port = runtime.start_server(None).await.unwrap();
        assert!(port > 0);
        assert_eq!(runtime.get_port().await, Some(port));

        runtime.stop_server().await;
        assert_eq!(runtime.get_port().await, None);
    }

    #[tokio::test]
    async fn environment_variables_include_proxy_and_ca_bundle() {
        let dir = tempdir().unwrap();
        let runtime = ProxyRuntime::new(test_config(dir.path())).unwrap();
        let port = runtime.start_server(None).await.unwrap();

        let env = runtime.get_environment_variables().await;
        assert_eq!(env.get("HTTPS_PROXY").unwrap(), &format!("http://localhost:{port}"));
        assert_eq!(env.get("GLOBAL_AGENT_HTTP_PROXY").unwrap(), &format!("http://localhost:{port}"));
        assert!(env.contains_key("NODE_EXTRA_CA_CERTS"));

        runtime.stop_server().await;
    }

    #[tokio::test]
    async fn merge_proxy_env_prefers_proxy_https_proxy_case_insensitively() {
        let dir = tempdir().unwrap();
        let runtime = ProxyRuntime::new(test_config(dir.path())).unwrap();
        runtime.start_server(None).await.unwrap();

        let mut caller_env = HashMap::new();
        caller_env.insert("https_proxy".to_string(), "http://should-be-overridden".to_string());
        caller_env.insert("PATH".to_string(), "/usr/bin".to_string());

        let merged = runtime.merge_proxy_env(&caller_env).await;
        assert_eq!(merged.get("PATH").unwrap(), "/usr/bin");
        assert!(merged.get("HTTPS_PROXY").unwrap().starts_with("http://localhost:"));
        assert!(!merged.contains_key("https_proxy"));

        runtime.stop_server().await;
    }

    #[test]
    fn verify_no_malicious_packages_true_when_empty() {
        let dir = tempdir().unwrap();
        let runtime = ProxyRuntime::new(test_config(dir.path())).unwrap();
        assert!(runtime.verify_no_malicious_packages());
    }
}
