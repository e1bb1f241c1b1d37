//! # safe-chain-proxy
//!
//! A developer-side supply-chain firewall: a local HTTPS-intercepting
//! proxy that stands between package-manager clients (npm, yarn, pnpm,
//! bun, pip, uv, poetry, ...) and their registries. It mints per-hostname
//! leaf certificates under a locally trusted CA, checks every resolved
//! `(package, version)` against an authoritative malware list, blocks
//! known-malicious transfers, and suppresses npm metadata for versions
//! published too recently to have been audited.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      ProxyRuntime                              │
//! │  ┌───────────┐  ┌────────────┐  ┌─────────────┐  ┌─────────┐ │
//! │  │ CertManager│  │MalwareCache│  │ Interceptor │  │ Blocked │ │
//! │  │ (CA+leaf)  │  │ (C2 + C3)  │  │  Pipeline   │  │Registry │ │
//! │  └─────┬──────┘  └──────┬─────┘  └──────┬──────┘  └────┬────┘ │
//! │        └────────────────┴───────────────┴──────────────┘      │
//! │                         proxy::server (C9)                     │
//! │               CONNECT ──► mitm (C7) | tunnel (C8)               │
//! └──────────────────────────────────────────────────────────────┘
//! ```

pub mod blocked;
pub mod certs;
pub mod config;
pub mod error;
pub mod interceptor;
pub mod malware;
pub mod proxy;
pub mod registry;
pub mod runtime;

pub use config::{Ecosystem, ProxyConfig};
pub use runtime::ProxyRuntime;

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Installs a `tracing_subscriber::fmt` subscriber honoring `RUST_LOG`,
/// defaulting to `info`. Safe to call more than once; later calls are
/// ignored.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
