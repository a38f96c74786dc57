//! eTLD+1 normalization and GeoIP lookup are, per spec, pure functions
//! supplied to the core rather than implemented by it. This module defines
//! the seams and a minimal built-in so the crate is runnable standalone.

use std::net::IpAddr;

/// Normalizes a raw host/domain string to its registrable domain
/// (effective-TLD+1), e.g. `"www.google.co.uk"` -> `"google.co.uk"`.
///
/// Implementations should be idempotent: `normalize(normalize(x)) == normalize(x)`.
pub trait DomainNormalizer: Send + Sync {
    fn normalize(&self, raw: &str) -> String;
}

/// Resolves an egress IP to a lowercase ISO 3166-1 alpha-2 region code.
pub trait GeoResolver: Send + Sync {
    fn region_for(&self, ip: IpAddr) -> Option<String>;
}

/// Two-label heuristic: keeps the last two dot-separated labels. This is
/// *not* Public Suffix List correct (it mishandles multi-label suffixes like
/// `.co.uk`) and exists only so the crate has a working default; callers
/// that care about exact PSL semantics inject their own `DomainNormalizer`.
///
/// Callers may pass either a bare host (`"www.example.com"`) or a full
/// routing target (`"https://www.example.com/path"`, scheme/userinfo/port
/// and all) — the router hands `routeRequest`'s `target` straight through
/// uninterpreted, so the normalizer is responsible for extracting the host
/// first.
#[derive(Default)]
pub struct SuffixListNormalizer;

/// Strips scheme, userinfo, port, and path/query/fragment from a routing
/// target, leaving a bare host. A no-op when `raw` is already a bare host.
fn extract_host(raw: &str) -> &str {
    let without_scheme = raw.find("://").map(|i| &raw[i + 3..]).unwrap_or(raw);
    let without_path = without_scheme.split(['/', '?', '#']).next().unwrap_or(without_scheme);
    let without_userinfo = without_path.rsplit('@').next().unwrap_or(without_path);
    if without_userinfo.starts_with('[') {
        // IPv6 literal host, e.g. "[::1]:8443" -> "::1".
        without_userinfo.split(']').next().unwrap_or(without_userinfo).trim_start_matches('[')
    } else {
        without_userinfo.split(':').next().unwrap_or(without_userinfo)
    }
}

impl DomainNormalizer for SuffixListNormalizer {
    fn normalize(&self, raw: &str) -> String {
        let host = extract_host(raw.trim());
        let host = host.trim_end_matches('.').to_ascii_lowercase();
        let labels: Vec<&str> = host.split('.').filter(|l| !l.is_empty()).collect();
        match labels.len() {
            0 => String::new(),
            1 => labels[0].to_string(),
            n => labels[n - 2..].join("."),
        }
    }
}

/// A `GeoResolver` that never resolves anything; region filters degrade to
/// "explicit region only" when no real resolver is injected.
#[derive(Default)]
pub struct NullGeoResolver;

impl GeoResolver for NullGeoResolver {
    fn region_for(&self, _ip: IpAddr) -> Option<String> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn strips_subdomains() {
        let n = SuffixListNormalizer;
        assert_eq!(n.normalize("www.google.com"), "google.com");
        assert_eq!(n.normalize("a.b.c.example.com"), "example.com");
    }

    #[test]
    fn idempotent_over_closed_inputs() {
        let n = SuffixListNormalizer;
        for input in ["example.com", "www.example.com", "a.b.example.com", "localhost", ""] {
            let once = n.normalize(input);
            let twice = n.normalize(&once);
            assert_eq!(once, twice, "not idempotent for {input:?}");
        }
    }

    #[test]
    fn strips_scheme_path_and_port_from_a_full_target() {
        let n = SuffixListNormalizer;
        assert_eq!(n.normalize("https://example.com/path"), "example.com");
        assert_eq!(n.normalize("https://www.example.com:8443/a/b?q=1"), "example.com");
        assert_eq!(n.normalize("user:pass@www.example.com"), "example.com");
    }

    proptest! {
        #[test]
        fn normalize_is_idempotent(
            labels in proptest::collection::vec("[a-z0-9]{1,8}", 1..6),
        ) {
            let n = SuffixListNormalizer;
            let host = labels.join(".");
            let once = n.normalize(&host);
            let twice = n.normalize(&once);
            prop_assert_eq!(once, twice);
        }

        #[test]
        fn normalize_ignores_scheme_userinfo_and_port(
            labels in proptest::collection::vec("[a-z0-9]{1,8}", 2..6),
            port in 1u16..65535,
        ) {
            let n = SuffixListNormalizer;
            let host = labels.join(".");
            let bare = n.normalize(&host);
            let decorated = n.normalize(&format!("https://user:pass@{host}:{port}/x/y?z=1"));
            prop_assert_eq!(bare, decorated);
        }
    }
}
