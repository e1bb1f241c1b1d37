//! CA & leaf-certificate manager (C1).
//!
//! Produces a long-lived self-signed CA once per storage directory and
//! mints short-lived per-hostname leaf certificates signed by it, caching
//! them for the lifetime of the process.

use anyhow::{anyhow, Context};
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose,
    Ia5String, IsCa, KeyPair, KeyUsagePurpose, SanType,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::server::ServerConfig;
use std::collections::HashMap;
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, RwLock};
use time::{Duration, OffsetDateTime};

/// CA validity window: 24 hours from generation time.
const CA_VALIDITY: Duration = Duration::hours(24);
/// A CA is reused only if it still has at least this much life left.
const CA_MIN_REMAINING: Duration = Duration::hours(1);
/// Leaf validity window: now to now+1h.
const LEAF_VALIDITY: Duration = Duration::hours(1);

pub struct CertManager {
    storage_path: PathBuf,
    pub ca_cert_pem: String,
    ca_cert: rcgen::Certificate,
    ca_key: KeyPair,
    ca_chain: Vec<CertificateDer<'static>>,
    /// hostname -> minted leaf ServerConfig. Insert-if-absent under the
    /// write lock; reads after insertion take only the read lock, so a hot
    /// cache never contends with itself.
    leaf_cache: RwLock<HashMap<String, Arc<ServerConfig>>>,
}

impl CertManager {
    /// Loads `<storage_path>/{ca-key.pem, ca-cert.pem}` if both exist, the
    /// certificate is valid for at least another hour, and it carries the
    /// required extensions; otherwise regenerates both and writes them back.
    pub fn new(storage_path: &str) -> anyhow::Result<Self> {
        let path = Path::new(storage_path);
        let ca_cert_path = path.join("ca-cert.pem");
        let ca_key_path = path.join("ca-key.pem");

        let existing = if ca_cert_path.exists() && ca_key_path.exists() {
            Self::try_load_existing(&ca_cert_path, &ca_key_path)
        } else {
            None
        };

        let (ca_cert, ca_key, ca_cert_pem) = match existing {
            Some(triple) => triple,
            None => {
                let (cert, key) = Self::generate_root();
                let cert_pem = cert.pem();
                let key_pem = key.serialize_pem();

                fs::create_dir_all(path).context("failed to create CA storage directory")?;
                fs::write(&ca_cert_path, &cert_pem).context("failed to write CA certificate")?;
                fs::write(&ca_key_path, &key_pem).context("failed to write CA key")?;
                #[cfg(unix)]
                Self::restrict_permissions(path, &ca_cert_path, &ca_key_path)?;

                (cert, key, cert_pem)
            }
        };

        let ca_chain = vec![ca_cert.der().clone()];

        Ok(Self {
            storage_path: path.to_path_buf(),
            ca_cert_pem,
            ca_cert,
            ca_key,
            ca_chain,
            leaf_cache: RwLock::new(HashMap::new()),
        })
    }

    #[cfg(unix)]
    fn restrict_permissions(dir: &Path, cert: &Path, key: &Path) -> anyhow::Result<()> {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(dir, fs::Permissions::from_mode(0o700))?;
        fs::set_permissions(cert, fs::Permissions::from_mode(0o600))?;
        fs::set_permissions(key, fs::Permissions::from_mode(0o600))?;
        Ok(())
    }

    /// Read errors on the CA files are non-fatal: the manager simply
    /// regenerates.
    fn try_load_existing(
        cert_path: &Path,
        key_path: &Path,
    ) -> Option<(rcgen::Certificate, KeyPair, String)> {
        let cert_pem = fs::read_to_string(cert_path).ok()?;
        let key_pem = fs::read_to_string(key_path).ok()?;

        let key = KeyPair::from_pem(&key_pem).ok()?;
        let params = CertificateParams::from_ca_cert_pem(&cert_pem).ok()?;
        if !Self::has_required_extensions(&params) {
            return None;
        }
        if params.not_after < OffsetDateTime::now_utc() + CA_MIN_REMAINING {
            return None;
        }
        let cert = params.self_signed(&key).ok()?;
        Some((cert, key, cert_pem))
    }

    fn has_required_extensions(params: &CertificateParams) -> bool {
        matches!(params.is_ca, IsCa::Ca(BasicConstraints::Unconstrained) | IsCa::Ca(BasicConstraints::Constrained(_)))
            && params.key_usages.contains(&KeyUsagePurpose::KeyCertSign)
    }

    /// Returns the absolute path of the persisted CA certificate in PEM form.
    pub fn ca_cert_path(&self) -> PathBuf {
        self.storage_path.join("ca-cert.pem")
    }

    fn generate_root() -> (rcgen::Certificate, KeyPair) {
        let hostname = gethostname::gethostname().to_string_lossy().to_string();
        let now = OffsetDateTime::now_utc();
        let date_str = format!("{:04}-{:02}-{:02}", now.year(), now.month() as u8, now.day());
        let common_name = format!("safe-chain local CA ({hostname}, {date_str})");

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, common_name);
        dn.push(DnType::OrganizationName, "safe-chain");

        let mut params = CertificateParams::default();
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];

        params.not_before = now.checked_sub(Duration::minutes(5)).unwrap_or(now);
        params.not_after = now.checked_add(CA_VALIDITY).unwrap_or(now);

        let key_pair = KeyPair::generate().expect("failed to generate CA key");
        let cert = params
            .self_signed(&key_pair)
            .expect("failed to self-sign CA certificate");
        (cert, key_pair)
    }

    /// Returns a cached `ServerConfig` minted for `host`, generating and
    /// inserting one on first request. Concurrent calls for distinct hosts
    /// are safe; calls for the same host race but all see a valid config.
    pub fn server_config_for_host(&self, host: &str) -> anyhow::Result<Arc<ServerConfig>> {
        let cache_key = host.to_ascii_lowercase();
        if let Some(cfg) = self.read_cache()?.get(&cache_key) {
            return Ok(cfg.clone());
        }

        let (cert_chain, key_der) = self.issue_leaf_cert(host)?;
        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(cert_chain, key_der)
            .context("failed to build TLS server config")?;
        config.alpn_protocols = vec![b"http/1.1".to_vec()];

        let arc = Arc::new(config);
        let mut cache = self.write_cache()?;
        let entry = cache.entry(cache_key).or_insert_with(|| arc.clone());
        Ok(entry.clone())
    }

    fn read_cache(&self) -> anyhow::Result<std::sync::RwLockReadGuard<'_, HashMap<String, Arc<ServerConfig>>>> {
        self.leaf_cache
            .read()
            .map_err(|_| anyhow!("leaf certificate cache poisoned"))
    }

    fn write_cache(&self) -> anyhow::Result<std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<ServerConfig>>>> {
        self.leaf_cache
            .write()
            .map_err(|_| anyhow!("leaf certificate cache poisoned"))
    }

    fn issue_leaf_cert(
        &self,
        host: &str,
    ) -> anyhow::Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
        let mut params = CertificateParams::default();

        if let Ok(ip) = IpAddr::from_str(host) {
            params.subject_alt_names = vec![SanType::IpAddress(ip)];
        } else {
            params.subject_alt_names = vec![SanType::DnsName(
                Ia5String::try_from(host).map_err(|_| anyhow!("invalid hostname for certificate: {host}"))?,
            )];
        }

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, host);
        params.distinguished_name = dn;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        let now = OffsetDateTime::now_utc();
        params.not_before = now.checked_sub(Duration::minutes(5)).unwrap_or(now);
        params.not_after = now.checked_add(LEAF_VALIDITY).unwrap_or(now);

        let key_pair = KeyPair::generate().context("failed to generate leaf key")?;
        let cert = params
            .signed_by(&key_pair, &self.ca_cert, &self.ca_key)
            .context("failed to sign leaf certificate")?;

        let mut chain = Vec::with_capacity(2);
        chain.push(cert.der().clone());
        chain.extend(self.ca_chain.iter().cloned());

        let key = PrivateKeyDer::from(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));
        Ok((chain, key))
    }

    #[cfg(test)]
    pub fn test_ca_der(&self) -> CertificateDer<'static> {
        self.ca_cert.der().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn generates_ca_once_and_reuses_existing_files() {
        let dir = tempdir().unwrap();
        let path = dir.path().to_string_lossy().to_string();

        let original_pem = {
            let manager = CertManager::new(&path).expect("initial creation");
            assert!(!manager.ca_cert_pem.is_empty());
            assert!(manager.ca_cert_path().exists());
            manager.ca_cert_pem
        };

        let manager_again = CertManager::new(&path).expect("reuse existing");
        assert_eq!(manager_again.ca_cert_pem, original_pem);
    }

    #[test]
    fn mints_distinct_leaf_certs_for_distinct_hosts() {
        let dir = tempdir().unwrap();
        let manager = CertManager::new(&dir.path().to_string_lossy()).unwrap();

        let a = manager.server_config_for_host("registry.npmjs.org").unwrap();
        let b = manager.server_config_for_host("pypi.org").unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn returns_same_config_for_same_host() {
        let dir = tempdir().unwrap();
        let manager = CertManager::new(&dir.path().to_string_lossy()).unwrap();

        let a = manager.server_config_for_host("registry.npmjs.org").unwrap();
        let b = manager.server_config_for_host("registry.npmjs.org").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }
}
