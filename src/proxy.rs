//! Client IP resolution behind trusted reverse proxies.
//!
//! Proxy headers are only honored when the direct peer is a trusted proxy.
//! Trusting `X-Forwarded-For` from arbitrary peers would let clients pick
//! their own IP and dodge per-IP throttles.

use crate::error::{Result, ThrottleError};
use crate::utils::get_env_list;
use axum::http::HeaderMap;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

/// An exact address or a CIDR block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpMatcher {
    Exact(IpAddr),
    Cidr { network: IpAddr, prefix: u8 },
}

impl IpMatcher {
    pub fn contains(&self, ip: IpAddr) -> bool {
        let ip = ip.to_canonical();
        match *self {
            Self::Exact(addr) => addr.to_canonical() == ip,
            Self::Cidr { network, prefix } => match (network, ip) {
                (IpAddr::V4(net), IpAddr::V4(addr)) => {
                    let mask = mask_u32(prefix);
                    u32::from(net) & mask == u32::from(addr) & mask
                }
                (IpAddr::V6(net), IpAddr::V6(addr)) => {
                    let mask = mask_u128(prefix);
                    u128::from(net) & mask == u128::from(addr) & mask
                }
                _ => false,
            },
        }
    }
}

impl FromStr for IpMatcher {
    type Err = ThrottleError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let invalid = || ThrottleError::config(format!("Invalid IP address or CIDR block: {}", s));

        match s.split_once('/') {
            None => s.parse().map(Self::Exact).map_err(|_| invalid()),
            Some((addr, prefix)) => {
                let network: IpAddr = addr.parse().map_err(|_| invalid())?;
                let prefix: u8 = prefix.parse().map_err(|_| invalid())?;
                let max = if network.is_ipv4() { 32 } else { 128 };
                if prefix > max {
                    return Err(invalid());
                }
                Ok(Self::Cidr { network, prefix })
            }
        }
    }
}

impl fmt::Display for IpMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact(addr) => write!(f, "{}", addr),
            Self::Cidr { network, prefix } => write!(f, "{}/{}", network, prefix),
        }
    }
}

fn mask_u32(prefix: u8) -> u32 {
    if prefix == 0 { 0 } else { u32::MAX << (32 - u32::from(prefix)) }
}

fn mask_u128(prefix: u8) -> u128 {
    if prefix == 0 { 0 } else { u128::MAX << (128 - u32::from(prefix)) }
}

/// Reverse proxies whose forwarding headers are believed
#[derive(Debug, Clone, Default)]
pub struct TrustedProxies {
    matchers: Vec<IpMatcher>,
}

impl TrustedProxies {
    /// Parse a list of proxies, skipping invalid entries with a warning
    pub fn from_list<S: AsRef<str>>(entries: &[S]) -> Self {
        let matchers = entries
            .iter()
            .filter_map(|entry| match entry.as_ref().parse::<IpMatcher>() {
                Ok(matcher) => Some(matcher),
                Err(e) => {
                    tracing::warn!(entry = entry.as_ref(), error = %e, "Ignoring invalid trusted proxy");
                    None
                }
            })
            .collect();

        Self { matchers }
    }

    /// Load from `TIDEWAY_TRUSTED_PROXIES` / `TRUSTED_PROXIES` (comma-separated)
    pub fn from_env() -> Self {
        let proxies = Self::from_list(get_env_list("TRUSTED_PROXIES").as_slice());
        if !proxies.is_empty() {
            tracing::debug!(count = proxies.len(), "Loaded trusted proxies");
        }
        proxies
    }

    pub fn is_trusted(&self, ip: IpAddr) -> bool {
        self.matchers.iter().any(|m| m.contains(ip))
    }

    pub fn is_empty(&self) -> bool {
        self.matchers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.matchers.len()
    }

    /// Resolve the originating client address
    ///
    /// Without a trusted peer the peer address is the answer. With one, the
    /// forwarding chain is walked right to left and the first untrusted hop
    /// wins; a chain made only of trusted hops yields its leftmost entry.
    pub fn client_ip(&self, peer: Option<IpAddr>, headers: &HeaderMap) -> Option<IpAddr> {
        let peer_trusted = peer.is_some_and(|ip| self.is_trusted(ip));
        if !peer_trusted {
            return peer;
        }

        let chain = forwarded_for(headers);
        if let Some(ip) = chain.iter().rev().find(|ip| !self.is_trusted(**ip)) {
            return Some(*ip);
        }
        if let Some(first) = chain.first() {
            return Some(*first);
        }

        headers
            .get("x-real-ip")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok())
            .or(peer)
    }
}

/// All parseable addresses from every `X-Forwarded-For` header, in order
fn forwarded_for(headers: &HeaderMap) -> Vec<IpAddr> {
    headers
        .get_all("x-forwarded-for")
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|entry| entry.trim().parse().ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(*name, value.parse().unwrap());
        }
        map
    }

    #[test]
    fn test_matcher_parsing() {
        assert_eq!("10.0.0.1".parse::<IpMatcher>().unwrap(), IpMatcher::Exact(ip("10.0.0.1")));
        assert!("10.0.0.0/8".parse::<IpMatcher>().is_ok());
        assert!("fd00::/8".parse::<IpMatcher>().is_ok());
        assert!("10.0.0.0/33".parse::<IpMatcher>().is_err());
        assert!("not-an-ip".parse::<IpMatcher>().is_err());
        assert!("10.0.0.0/x".parse::<IpMatcher>().is_err());
    }

    #[test]
    fn test_cidr_contains() {
        let block: IpMatcher = "192.168.0.0/16".parse().unwrap();
        assert!(block.contains(ip("192.168.44.2")));
        assert!(!block.contains(ip("192.169.0.1")));
        assert!(!block.contains(ip("::1")));

        let v6: IpMatcher = "2001:db8::/32".parse().unwrap();
        assert!(v6.contains(ip("2001:db8::1")));
        assert!(!v6.contains(ip("2001:db9::1")));

        let everything: IpMatcher = "0.0.0.0/0".parse().unwrap();
        assert!(everything.contains(ip("8.8.8.8")));
    }

    #[test]
    fn test_ipv4_mapped_addresses_match() {
        let exact: IpMatcher = "10.1.2.3".parse().unwrap();
        assert!(exact.contains(ip("::ffff:10.1.2.3")));
    }

    #[test]
    fn test_untrusted_peer_ignores_headers() {
        let proxies = TrustedProxies::from_list(&["10.0.0.1"]);
        let h = headers(&[("x-forwarded-for", "1.2.3.4")]);
        assert_eq!(proxies.client_ip(Some(ip("203.0.113.9")), &h), Some(ip("203.0.113.9")));
    }

    #[test]
    fn test_no_proxies_uses_peer() {
        let proxies = TrustedProxies::default();
        let h = headers(&[("x-forwarded-for", "1.2.3.4")]);
        assert_eq!(proxies.client_ip(Some(ip("10.0.0.1")), &h), Some(ip("10.0.0.1")));
        assert_eq!(proxies.client_ip(None, &h), None);
    }

    #[test]
    fn test_trusted_peer_walks_chain() {
        let proxies = TrustedProxies::from_list(&["10.0.0.0/8"]);
        let h = headers(&[("x-forwarded-for", "198.51.100.2, 203.0.113.5, 10.0.0.7")]);
        // Rightmost untrusted hop is the client; anything left of it is client-supplied
        assert_eq!(proxies.client_ip(Some(ip("10.0.0.1")), &h), Some(ip("203.0.113.5")));
    }

    #[test]
    fn test_all_trusted_chain_returns_leftmost() {
        let proxies = TrustedProxies::from_list(&["10.0.0.0/8"]);
        let h = headers(&[("x-forwarded-for", "10.0.0.9, 10.0.0.8")]);
        assert_eq!(proxies.client_ip(Some(ip("10.0.0.1")), &h), Some(ip("10.0.0.9")));
    }

    #[test]
    fn test_multiple_forwarded_headers_are_joined() {
        let proxies = TrustedProxies::from_list(&["10.0.0.1"]);
        let h = headers(&[("x-forwarded-for", "198.51.100.2"), ("x-forwarded-for", "10.0.0.1")]);
        assert_eq!(proxies.client_ip(Some(ip("10.0.0.1")), &h), Some(ip("198.51.100.2")));
    }

    #[test]
    fn test_real_ip_fallback() {
        let proxies = TrustedProxies::from_list(&["10.0.0.1"]);
        let h = headers(&[("x-real-ip", "198.51.100.3")]);
        assert_eq!(proxies.client_ip(Some(ip("10.0.0.1")), &h), Some(ip("198.51.100.3")));

        let empty = HeaderMap::new();
        assert_eq!(proxies.client_ip(Some(ip("10.0.0.1")), &empty), Some(ip("10.0.0.1")));
    }

    #[test]
    fn test_invalid_entries_skipped() {
        let proxies = TrustedProxies::from_list(&["10.0.0.1", "bogus", " "]);
        assert_eq!(proxies.len(), 1);
    }

    #[test]
    fn test_from_env() {
        unsafe {
            std::env::set_var("TIDEWAY_TRUSTED_PROXIES", "10.0.0.1, 172.16.0.0/12");
        }
        let proxies = TrustedProxies::from_env();
        unsafe {
            std::env::remove_var("TIDEWAY_TRUSTED_PROXIES");
        }
        assert_eq!(proxies.len(), 2);
        assert!(proxies.is_trusted(ip("172.20.1.1")));
    }
}
