//! Registry recognition, URL parsers, and the npm metadata rewriter
//! (C4, C5).

pub mod npm_rewrite;
pub mod parsers;

use crate::config::Ecosystem;

const NPM_REGISTRIES: &[&str] = &["registry.npmjs.org", "registry.yarnpkg.com"];
const PYPI_REGISTRIES: &[&str] = &[
    "files.pythonhosted.org",
    "pypi.org",
    "pypi.python.org",
    "pythonhosted.org",
];

/// Which package ecosystem, if any, a host belongs to. Matching is by
/// substring against the known registry hostnames plus any configured
/// custom registries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryKind {
    Npm,
    PyPi,
}

pub fn registry_kind_for_host(
    host: &str,
    ecosystem: Ecosystem,
    npm_custom: &[String],
    pip_custom: &[String],
) -> Option<RegistryKind> {
    let try_npm = matches!(ecosystem, Ecosystem::Js | Ecosystem::All);
    let try_pypi = matches!(ecosystem, Ecosystem::Py | Ecosystem::All);

    if try_npm && matches_any(host, NPM_REGISTRIES, npm_custom) {
        return Some(RegistryKind::Npm);
    }
    if try_pypi && matches_any(host, PYPI_REGISTRIES, pip_custom) {
        return Some(RegistryKind::PyPi);
    }
    None
}

fn matches_any(host: &str, known: &[&str], custom: &[String]) -> bool {
    known.iter().any(|r| host.contains(r)) || custom.iter().any(|r| host.contains(r.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_known_npm_host() {
        assert_eq!(
            registry_kind_for_host("registry.npmjs.org", Ecosystem::All, &[], &[]),
            Some(RegistryKind::Npm)
        );
    }

    #[test]
    fn recognizes_known_pypi_host() {
        assert_eq!(
            registry_kind_for_host("files.pythonhosted.org", Ecosystem::All, &[], &[]),
            Some(RegistryKind::PyPi)
        );
    }

    #[test]
    fn ecosystem_js_ignores_pypi_hosts() {
        assert_eq!(
            registry_kind_for_host("pypi.org", Ecosystem::Js, &[], &[]),
            None
        );
    }

    #[test]
    fn custom_registry_is_recognized() {
        assert_eq!(
            registry_kind_for_host("npm.mycorp.internal", Ecosystem::Js, &["npm.mycorp.internal".into()], &[]),
            Some(RegistryKind::Npm)
        );
    }

    #[test]
    fn unrelated_host_is_not_a_registry() {
        assert_eq!(
            registry_kind_for_host("example.com", Ecosystem::All, &[], &[]),
            None
        );
    }
}
