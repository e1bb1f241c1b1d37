use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Which ecosystems the interceptor pipeline should consult. Process-wide,
/// set once at construction of [`crate::runtime::ProxyRuntime`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Ecosystem {
    Js,
    Py,
    All,
}

impl Default for Ecosystem {
    fn default() -> Self {
        Ecosystem::All
    }
}

/// On-disk shape of `<home>/.aikido/config.json`. All fields optional;
/// invalid or missing values fall back to [`ProxyConfig::default`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(rename = "scanTimeout")]
    pub scan_timeout: Option<u64>,
    #[serde(rename = "minimumPackageAgeHours")]
    pub minimum_package_age_hours: Option<u64>,
    pub npm: Option<RegistryOverrides>,
    pub pip: Option<RegistryOverrides>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryOverrides {
    #[serde(rename = "customRegistries", default)]
    pub custom_registries: Vec<String>,
}

/// Fully resolved runtime configuration: config file values overlaid with
/// environment-variable overrides.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub ecosystem: Ecosystem,
    pub scan_timeout_ms: u64,
    pub minimum_package_age_hours: u64,
    pub npm_custom_registries: Vec<String>,
    pub pip_custom_registries: Vec<String>,
    pub install_possibly_malicious: bool,
    pub storage_dir: PathBuf,
    pub cache_dir: PathBuf,
}

pub const DEFAULT_SCAN_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_MIN_PACKAGE_AGE_HOURS: u64 = 24;

impl ProxyConfig {
    /// Loads `<home>/.aikido/config.json` if present (silently falling back
    /// to defaults on any read or parse error, per §7's cache-I/O policy),
    /// then applies environment-variable overrides.
    pub fn load() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        let storage_dir = home.join(".safe-chain");
        let cache_dir = home.join(".aikido");

        let file: ConfigFile = std::fs::read_to_string(cache_dir.join("config.json"))
            .ok()
            .and_then(|text| serde_json::from_str(&text).ok())
            .unwrap_or_default();

        let mut cfg = ProxyConfig {
            ecosystem: Ecosystem::default(),
            scan_timeout_ms: file.scan_timeout.unwrap_or(DEFAULT_SCAN_TIMEOUT_MS),
            minimum_package_age_hours: file
                .minimum_package_age_hours
                .unwrap_or(DEFAULT_MIN_PACKAGE_AGE_HOURS),
            npm_custom_registries: file
                .npm
                .map(|o| o.custom_registries)
                .unwrap_or_default()
                .into_iter()
                .map(normalize_registry_host)
                .collect(),
            pip_custom_registries: file
                .pip
                .map(|o| o.custom_registries)
                .unwrap_or_default()
                .into_iter()
                .map(normalize_registry_host)
                .collect(),
            install_possibly_malicious: false,
            storage_dir,
            cache_dir,
        };

        cfg.apply_env_overrides();
        cfg
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(raw) = std::env::var("AIKIDO_SCAN_TIMEOUT_MS") {
            if let Ok(ms) = raw.parse::<u64>() {
                self.scan_timeout_ms = ms;
            }
        }
        if let Ok(raw) = std::env::var("SAFE_CHAIN_NPM_CUSTOM_REGISTRIES") {
            self.npm_custom_registries
                .extend(split_csv(&raw).map(normalize_registry_host));
        }
        if let Ok(raw) = std::env::var("SAFE_CHAIN_PIP_CUSTOM_REGISTRIES") {
            self.pip_custom_registries
                .extend(split_csv(&raw).map(normalize_registry_host));
        }
        if std::env::var("INSTALL_A_POSSIBLY_MALICIOUS_PACKAGE").as_deref() == Ok("1") {
            self.install_possibly_malicious = true;
        }
    }
}

fn split_csv(raw: &str) -> impl Iterator<Item = String> + '_ {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// A custom registry entry may be given as `host[/path]` with an optional
/// `http(s)://` prefix, but only the bare `host` is ever compared against a
/// CONNECT target, which never carries a path. Strip both the scheme and
/// anything from the first `/` onward.
fn normalize_registry_host(value: String) -> String {
    let without_scheme = value
        .strip_prefix("https://")
        .or_else(|| value.strip_prefix("http://"))
        .unwrap_or(&value);
    without_scheme
        .split_once('/')
        .map(|(host, _)| host)
        .unwrap_or(without_scheme)
        .to_string()
}
