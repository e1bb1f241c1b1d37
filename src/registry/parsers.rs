//! URL -> (package, version) parsers for npm tarballs and PyPI
//! wheel/sdist artifacts.

const SDIST_EXTENSIONS: &[&str] = &[".tar.gz", ".zip", ".tar.bz2", ".tar.xz"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageRef {
    pub name: String,
    pub version: String,
}

/// Parses an npm tarball URL of the form `.../<pkg>/-/<file>.tgz`. Any
/// other shape (no `.tgz` suffix, no `/-/` separator) yields `None`, which
/// callers treat as "not a package download".
pub fn parse_npm(url: &str) -> Option<PackageRef> {
    let path = path_of(url);
    if !path.ends_with(".tgz") {
        return None;
    }

    let (before, after) = path.split_once("/-/")?;
    let filename = after.rsplit('/').next().unwrap_or(after);

    // Scoped packages (`@scope/name`) contribute only the final segment to
    // the filename prefix; the scope itself never appears in the tarball name.
    let pkg_segment = before.rsplit('/').next().unwrap_or(before);
    let name = pkg_segment.trim_start_matches('@');
    let name = name.rsplit_once('/').map(|(_, n)| n).unwrap_or(name);

    let prefix = format!("{name}-");
    let version = filename
        .strip_prefix(&prefix)?
        .strip_suffix(".tgz")?
        .to_string();

    if name.is_empty() || version.is_empty() {
        return None;
    }

    Some(PackageRef {
        name: name.to_string(),
        version,
    })
}

/// Parses a PyPI wheel or sdist URL. A `version` of the placeholder
/// `"latest"` is treated as "not a package download".
pub fn parse_pypi(url: &str) -> Option<PackageRef> {
    let path = path_of(url);
    let filename = path.rsplit('/').next().unwrap_or(path);

    let parsed = parse_wheel_filename(filename).or_else(|| parse_sdist_filename(filename))?;

    if parsed.version.eq_ignore_ascii_case("latest") {
        return None;
    }
    Some(parsed)
}

/// Wheel grammar: `{distribution}-{version}(-...tags).whl[.metadata]`. The
/// distribution token is returned exactly as it appears in the filename
/// (case and underscores intact) — normalization for lookup purposes
/// happens separately, at `isMalware` time (§4.3), not at parse time.
fn parse_wheel_filename(filename: &str) -> Option<PackageRef> {
    let base = filename
        .strip_suffix(".whl.metadata")
        .or_else(|| filename.strip_suffix(".whl"))?;
    let (dist, rest) = base.split_once('-')?;
    let version = rest.split('-').next()?;
    if dist.is_empty() || version.is_empty() {
        return None;
    }
    Some(PackageRef {
        name: dist.to_string(),
        version: version.to_string(),
    })
}

/// Sdist grammar: `{name}-{version}.{ext}[.metadata]`. Same raw-name
/// contract as [`parse_wheel_filename`].
fn parse_sdist_filename(filename: &str) -> Option<PackageRef> {
    let working = filename.strip_suffix(".metadata").unwrap_or(filename);
    let base = SDIST_EXTENSIONS
        .iter()
        .find_map(|ext| working.strip_suffix(ext))?;
    let (dist, version) = base.rsplit_once('-')?;
    if dist.is_empty() || version.is_empty() {
        return None;
    }
    Some(PackageRef {
        name: dist.to_string(),
        version: version.to_string(),
    })
}

fn path_of(url: &str) -> &str {
    let without_scheme = url
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(url);
    let path_and_query = without_scheme
        .split_once('/')
        .map(|(_, rest)| rest)
        .unwrap_or("");
    path_and_query.split(['?', '#']).next().unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_npm_tarball() {
        let got = parse_npm("https://registry.npmjs.org/lodash/-/lodash-4.17.21.tgz").unwrap();
        assert_eq!(got.name, "lodash");
        assert_eq!(got.version, "4.17.21");
    }

    #[test]
    fn parses_scoped_npm_tarball() {
        let got =
            parse_npm("https://registry.npmjs.org/@babel/core/-/core-7.22.0.tgz").unwrap();
        assert_eq!(got.name, "core");
        assert_eq!(got.version, "7.22.0");
    }

    #[test]
    fn rejects_non_tarball_npm_urls() {
        assert!(parse_npm("https://registry.npmjs.org/lodash").is_none());
        assert!(parse_npm("https://registry.npmjs.org/-/v1/search?text=x").is_none());
    }

    #[test]
    fn parses_pypi_wheel_preserving_raw_name() {
        // The parser yields the literal filename token; underscore/hyphen
        // normalization for lookup purposes happens separately (§4.3), not here.
        let got = parse_pypi(
            "https://files.pythonhosted.org/packages/xx/yy/safe_chain_pi_test-0.0.1-py3-none-any.whl",
        )
        .unwrap();
        assert_eq!(got.name, "safe_chain_pi_test");
        assert_eq!(got.version, "0.0.1");
    }

    #[test]
    fn parses_pypi_wheel_metadata_sidecar() {
        let got = parse_pypi(
            "https://files.pythonhosted.org/packages/xx/yy/requests-2.31.0-py3-none-any.whl.metadata",
        )
        .unwrap();
        assert_eq!(got.name, "requests");
        assert_eq!(got.version, "2.31.0");
    }

    #[test]
    fn parses_pypi_sdist() {
        let got =
            parse_pypi("https://files.pythonhosted.org/packages/xx/yy/numpy-1.26.0.tar.gz").unwrap();
        assert_eq!(got.name, "numpy");
        assert_eq!(got.version, "1.26.0");
    }

    #[test]
    fn parses_pypi_sdist_zip() {
        let got = parse_pypi("https://files.pythonhosted.org/packages/xx/yy/six-1.16.0.zip").unwrap();
        assert_eq!(got.name, "six");
        assert_eq!(got.version, "1.16.0");
    }

    #[test]
    fn latest_placeholder_is_not_a_package() {
        assert!(parse_pypi("https://files.pythonhosted.org/packages/xx/yy/foo-latest.tar.gz").is_none());
    }

    #[test]
    fn unrecognized_pypi_extension_is_not_parsed() {
        assert!(parse_pypi("https://pypi.org/simple/requests/").is_none());
    }
}
