use thiserror::Error;

/// Caller-visible failure modes. Per-request errors stay internal as
/// `anyhow::Error` and never reach this type; only faults that should be
/// reported to whoever embeds the proxy are represented here.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("failed to fetch malware database for ecosystem {ecosystem}: {source}")]
    MalwareFetch {
        ecosystem: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to bind listener on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}
