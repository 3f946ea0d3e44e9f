//! Client address resolution.

use axum::http::HeaderMap;
use std::net::{IpAddr, SocketAddr};

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_REAL_IP: &str = "x-real-ip";

/// Resolve the address used as the client's rate limit identity.
///
/// With `trust_proxy_headers`, the left-most valid `X-Forwarded-For` entry
/// wins, then `X-Real-IP`; otherwise only the peer address is used.
/// IPv4-mapped IPv6 addresses are reduced to plain IPv4 so one client maps to
/// one bucket.
pub fn resolve(headers: &HeaderMap, peer: Option<SocketAddr>, trust_proxy_headers: bool) -> Option<IpAddr> {
    let forwarded = trust_proxy_headers
        .then(|| forwarded_for(headers).or_else(|| real_ip(headers)))
        .flatten();

    forwarded
        .or_else(|| peer.map(|addr| addr.ip()))
        .map(|ip| ip.to_canonical())
}

fn forwarded_for(headers: &HeaderMap) -> Option<IpAddr> {
    let value = headers.get(X_FORWARDED_FOR)?.to_str().ok()?;
    value.split(',').next()?.trim().parse().ok()
}

fn real_ip(headers: &HeaderMap) -> Option<IpAddr> {
    headers.get(X_REAL_IP)?.to_str().ok()?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn peer() -> Option<SocketAddr> {
        Some("192.0.2.10:41000".parse().unwrap())
    }

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_static(value));
        }
        map
    }

    #[test]
    fn test_peer_address() {
        let ip = resolve(&HeaderMap::new(), peer(), false).unwrap();
        assert_eq!(ip.to_string(), "192.0.2.10");
    }

    #[test]
    fn test_proxy_headers_ignored_when_untrusted() {
        let map = headers(&[("x-forwarded-for", "203.0.113.7")]);
        let ip = resolve(&map, peer(), false).unwrap();
        assert_eq!(ip.to_string(), "192.0.2.10");
    }

    #[test]
    fn test_forwarded_for_first_entry() {
        let map = headers(&[("x-forwarded-for", " 203.0.113.7 , 10.0.0.1")]);
        let ip = resolve(&map, peer(), true).unwrap();
        assert_eq!(ip.to_string(), "203.0.113.7");
    }

    #[test]
    fn test_real_ip_fallback() {
        let map = headers(&[("x-forwarded-for", "garbage"), ("x-real-ip", "198.51.100.4")]);
        let ip = resolve(&map, peer(), true).unwrap();
        assert_eq!(ip.to_string(), "198.51.100.4");
    }

    #[test]
    fn test_invalid_headers_fall_back_to_peer() {
        let map = headers(&[("x-real-ip", "not-an-ip")]);
        let ip = resolve(&map, peer(), true).unwrap();
        assert_eq!(ip.to_string(), "192.0.2.10");
    }

    #[test]
    fn test_mapped_ipv6_is_canonicalized() {
        let mapped: SocketAddr = "[::ffff:192.0.2.99]:8000".parse().unwrap();
        let ip = resolve(&HeaderMap::new(), Some(mapped), false).unwrap();
        assert_eq!(ip.to_string(), "192.0.2.99");
    }

    #[test]
    fn test_unresolvable() {
        assert!(resolve(&HeaderMap::new(), None, true).is_none());
    }
}
