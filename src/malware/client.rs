//! Versioned fetch of the remote malware lists (C2).

use super::{MalwareDatabase, MalwareEcosystem, MalwareEntry};
use anyhow::{anyhow, Context};
use std::time::Duration;

const RETRY_ATTEMPTS: u32 = 4;
const RETRY_BASE_DELAY_MS: u64 = 500;

/// Fetches the full database for `ecosystem`, retrying transient failures
/// up to `RETRY_ATTEMPTS` times with `500ms · 2^i` backoff.
pub async fn fetch_database(
    client: &reqwest::Client,
    ecosystem: MalwareEcosystem,
) -> anyhow::Result<MalwareDatabase> {
    retry(RETRY_ATTEMPTS, || async {
        let url = ecosystem.source_url();
        let resp = client
            .get(url)
            .send()
            .await
            .with_context(|| format!("GET {url} failed"))?;
        let resp = resp
            .error_for_status()
            .with_context(|| format!("GET {url} returned an error status"))?;

        let version = resp
            .headers()
            .get(reqwest::header::ETAG)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();

        let entries: Vec<MalwareEntry> = resp
            .json()
            .await
            .with_context(|| format!("failed to parse malware list body from {url}"))?;

        Ok(MalwareDatabase { entries, version })
    })
    .await
}

/// HEAD probe for a version/ETag without downloading the body.
pub async fn fetch_database_version(
    client: &reqwest::Client,
    ecosystem: MalwareEcosystem,
) -> anyhow::Result<String> {
    retry(RETRY_ATTEMPTS, || async {
        let url = ecosystem.source_url();
        let resp = client
            .head(url)
            .send()
            .await
            .with_context(|| format!("HEAD {url} failed"))?;
        let resp = resp
            .error_for_status()
            .with_context(|| format!("HEAD {url} returned an error status"))?;

        resp.headers()
            .get(reqwest::header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| anyhow!("HEAD {url} response carried no ETag"))
    })
    .await
}

async fn retry<T, F, Fut>(attempts: u32, mut op: F) -> anyhow::Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = anyhow::Result<T>>,
{
    let mut last_err = None;
    for i in 0..attempts {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                tracing::warn!("malware list request attempt {} failed: {err}", i + 1);
                last_err = Some(err);
                if i + 1 < attempts {
                    let delay = RETRY_BASE_DELAY_MS * (1u64 << i);
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
            }
        }
    }
    Err(last_err.unwrap_or_else(|| anyhow!("retry loop exited without a result")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn retry_gives_up_after_all_attempts_fail() {
        let calls = AtomicU32::new(0);
        let result: anyhow::Result<()> = retry(3, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(anyhow!("boom")) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_returns_first_success() {
        let calls = AtomicU32::new(0);
        let result = retry(4, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(anyhow!("not yet"))
                } else {
                    Ok(42)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(result, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
