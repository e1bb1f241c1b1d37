//! Forces full npm metadata format and suppresses too-recently-published
//! versions.

use serde_json::{Map, Value};

pub const INSTALL_V1_ACCEPT: &str = "application/vnd.npm.install-v1+json";
pub const FULL_METADATA_ACCEPT: &str = "application/json";

/// A URL is a package-info URL iff its path does not end in `.tgz` and does
/// not contain `/-/` (which would make it a tarball or a bulk endpoint like
/// `/-/v1/search`).
pub fn is_package_info_url(path: &str) -> bool {
    !path.ends_with(".tgz") && !path.contains("/-/")
}

/// If the client requested the abbreviated format, rewrite the `Accept`
/// header so the origin returns full time-stamped metadata.
pub fn rewrite_accept_header(value: &str) -> Option<&'static str> {
    if value.contains(INSTALL_V1_ACCEPT) {
        Some(FULL_METADATA_ACCEPT)
    } else {
        None
    }
}

/// Deletes versions published more recently than `cutoff_millis` (epoch
/// milliseconds) from `time`, `versions`, and any dist-tag pointing at
/// them, recomputing `latest` if it was deleted. Returns `None` (meaning:
/// forward the original body unmodified) on any shape mismatch or parse
/// failure.
pub fn rewrite_metadata(body: &[u8], cutoff_millis: i64) -> Option<Vec<u8>> {
    let mut root: Value = serde_json::from_slice(body).ok()?;
    let obj = root.as_object_mut()?;

    if !obj.contains_key("time") || !obj.contains_key("dist-tags") || !obj.contains_key("versions") {
        return None;
    }

    let removed = remove_recent_versions(obj, cutoff_millis);
    if removed.is_empty() {
        return serde_json::to_vec(&root).ok();
    }

    let had_latest_removed = {
        let dist_tags = obj.get("dist-tags")?.as_object()?;
        let latest = dist_tags.get("latest").and_then(Value::as_str);
        latest.map(|v| removed.contains(&v.to_string())).unwrap_or(false)
    };

    if had_latest_removed {
        if let Some(new_latest) = pick_new_latest(obj) {
            if let Some(dist_tags) = obj.get_mut("dist-tags").and_then(Value::as_object_mut) {
                dist_tags.insert("latest".to_string(), Value::String(new_latest));
            }
        }
    }

    serde_json::to_vec(&root).ok()
}

/// Removes every version key `v` (other than `created`/`modified`) whose
/// `time[v] > cutoff`, from `time`, `versions`, and any dist-tag. Returns
/// the set of removed version strings.
fn remove_recent_versions(obj: &mut Map<String, Value>, cutoff_millis: i64) -> Vec<String> {
    let to_remove: Vec<String> = {
        let Some(time) = obj.get("time").and_then(Value::as_object) else {
            return Vec::new();
        };
        time.iter()
            .filter(|(k, _)| k.as_str() != "created" && k.as_str() != "modified")
            .filter_map(|(k, v)| {
                let millis = parse_timestamp_millis(v)?;
                (millis > cutoff_millis).then(|| k.clone())
            })
            .collect()
    };

    if to_remove.is_empty() {
        return to_remove;
    }

    if let Some(time) = obj.get_mut("time").and_then(Value::as_object_mut) {
        for v in &to_remove {
            time.remove(v);
        }
    }
    if let Some(versions) = obj.get_mut("versions").and_then(Value::as_object_mut) {
        for v in &to_remove {
            versions.remove(v);
        }
    }
    if let Some(dist_tags) = obj.get_mut("dist-tags").and_then(Value::as_object_mut) {
        dist_tags.retain(|_, pointee| {
            pointee
                .as_str()
                .map(|p| !to_remove.iter().any(|r| r == p))
                .unwrap_or(true)
        });
    }

    to_remove
}

/// Partitions the remaining versions into stable (no `-`) and preview
/// (contains `-`); picks the stable entry with the largest timestamp,
/// falling back to the preview with the largest timestamp.
fn pick_new_latest(obj: &Map<String, Value>) -> Option<String> {
    let time = obj.get("time")?.as_object()?;
    let versions = obj.get("versions")?.as_object()?;

    let mut stable_best: Option<(String, i64)> = None;
    let mut preview_best: Option<(String, i64)> = None;

    for (version, _) in versions.iter() {
        let Some(millis) = time.get(version).and_then(parse_timestamp_millis) else {
            continue;
        };
        let slot = if version.contains('-') {
            &mut preview_best
        } else {
            &mut stable_best
        };
        if slot.as_ref().map(|(_, best)| millis > *best).unwrap_or(true) {
            *slot = Some((version.clone(), millis));
        }
    }

    stable_best.or(preview_best).map(|(v, _)| v)
}

fn parse_timestamp_millis(value: &Value) -> Option<i64> {
    let text = value.as_str()?;
    chrono::DateTime::parse_from_rfc3339(text)
        .ok()
        .map(|dt| dt.timestamp_millis())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn now_millis() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    fn fixture(latest_time: chrono::DateTime<chrono::Utc>, older_time: chrono::DateTime<chrono::Utc>) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "name": "demo",
            "dist-tags": { "latest": "2.0.0" },
            "time": {
                "created": "2020-01-01T00:00:00.000Z",
                "modified": latest_time.to_rfc3339(),
                "2.0.0": latest_time.to_rfc3339(),
                "1.9.0": older_time.to_rfc3339(),
            },
            "versions": {
                "2.0.0": { "name": "demo", "version": "2.0.0" },
                "1.9.0": { "name": "demo", "version": "1.9.0" },
            }
        }))
        .unwrap()
    }

    #[test]
    fn is_package_info_url_excludes_tarballs_and_dash_routes() {
        assert!(is_package_info_url("/lodash"));
        assert!(!is_package_info_url("/lodash/-/lodash-4.17.21.tgz"));
        assert!(!is_package_info_url("/-/v1/search"));
    }

    #[test]
    fn rewrite_accept_header_swaps_abbreviated_for_full() {
        assert_eq!(
            rewrite_accept_header("application/vnd.npm.install-v1+json"),
            Some("application/json")
        );
        assert_eq!(rewrite_accept_header("application/json"), None);
    }

    #[test]
    fn suppresses_too_recent_version_and_recomputes_latest() {
        let now = chrono::Utc::now();
        let older = now - chrono::Duration::hours(48);
        let body = fixture(now, older);

        let cutoff = (now_millis()) - (24 * 3600 * 1000);
        let rewritten = rewrite_metadata(&body, cutoff).expect("rewrite should succeed");
        let value: Value = serde_json::from_slice(&rewritten).unwrap();

        assert!(value["versions"].get("2.0.0").is_none());
        assert!(value["time"].get("2.0.0").is_none());
        assert_eq!(value["dist-tags"]["latest"], "1.9.0");
    }

    #[test]
    fn returns_none_when_required_fields_missing() {
        let body = serde_json::to_vec(&json!({"name": "demo"})).unwrap();
        assert!(rewrite_metadata(&body, 0).is_none());
    }

    #[test]
    fn leaves_body_untouched_when_nothing_is_too_recent() {
        let now = chrono::Utc::now();
        let older = now - chrono::Duration::hours(1);
        let body = fixture(older, older);
        let rewritten = rewrite_metadata(&body, now_millis() + 1_000_000).unwrap();
        let value: Value = serde_json::from_slice(&rewritten).unwrap();
        assert_eq!(value["dist-tags"]["latest"], "2.0.0");
    }
}
