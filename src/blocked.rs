//! Process-wide (in this crate: per-[`crate::runtime::ProxyRuntime`])
//! append-only log of blocked requests.

use std::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockedRequest {
    pub package_name: String,
    pub version: String,
    pub url: String,
    pub timestamp_millis: i64,
}

#[derive(Default)]
pub struct BlockedRegistry {
    entries: Mutex<Vec<BlockedRequest>>,
}

impl BlockedRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, entry: BlockedRequest) {
        self.entries.lock().unwrap().push(entry);
    }

    pub fn snapshot(&self) -> Vec<BlockedRequest> {
        self.entries.lock().unwrap().clone()
    }

    /// `verifyNoMaliciousPackages()`: `false` (and a logged summary) if any
    /// request was blocked, else `true`.
    pub fn verify_no_malicious_packages(&self) -> bool {
        let entries = self.entries.lock().unwrap();
        if entries.is_empty() {
            true
        } else {
            tracing::warn!(
                "blocked {} malicious package request(s): {}",
                entries.len(),
                entries
                    .iter()
                    .map(|e| format!("{}@{}", e.package_name, e.version))
                    .collect::<Vec<_>>()
                    .join(", ")
            );
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_is_true_when_nothing_blocked() {
        let registry = BlockedRegistry::new();
        assert!(registry.verify_no_malicious_packages());
    }

    #[test]
    fn verify_is_false_after_a_block() {
        let registry = BlockedRegistry::new();
        registry.record(BlockedRequest {
            package_name: "evil".into(),
            version: "1.0.0".into(),
            url: "https://registry.npmjs.org/evil/-/evil-1.0.0.tgz".into(),
            timestamp_millis: 0,
        });
        assert!(!registry.verify_no_malicious_packages());
        assert_eq!(registry.snapshot().len(), 1);
    }
}
