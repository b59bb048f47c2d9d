//! Outbound destination filtering (SSRF protection).
//!
//! A destination passes only when:
//! 1. the scheme is `http` or `https`,
//! 2. the host matches the operator allow-list (exact or `*.suffix`),
//! 3. every address the host resolves to right now is globally routable and
//!    outside the configured deny CIDRs.
//!
//! Resolution happens on every check and the vetted addresses are handed back
//! to the caller, so the HTTP request can be pinned to exactly what was
//! checked. A hostname that later rebinds to an internal address is caught on
//! the next attempt.

use std::{
    collections::HashMap,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::Arc,
};

use anyhow::{Error, Result, anyhow};
use futures_util::{FutureExt, future::BoxFuture};
use ipnetwork::IpNetwork;
use tracing::debug;
use url::Url;

use crate::error::DeliveryError;

/// DNS lookup seam so tests can control what a hostname resolves to.
pub trait HostResolver: Send + Sync {
    fn resolve<'a>(&'a self, host: &'a str, port: u16)
    -> BoxFuture<'a, Result<Vec<IpAddr>, Error>>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemResolver;

impl HostResolver for SystemResolver {
    fn resolve<'a>(
        &'a self,
        host: &'a str,
        port: u16,
    ) -> BoxFuture<'a, Result<Vec<IpAddr>, Error>> {
        async move {
            let addrs = tokio::net::lookup_host((host, port))
                .await
                .map_err(|e| anyhow!("DNS resolution failed for '{}': {}", host, e))?;
            Ok(addrs.map(|addr| addr.ip()).collect())
        }
        .boxed()
    }
}

/// Fixed hostname table. Unknown hosts fail to resolve.
#[derive(Debug, Clone, Default)]
pub struct StaticResolver {
    records: HashMap<String, Vec<IpAddr>>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_host(mut self, host: &str, addrs: &[IpAddr]) -> Self {
        self.records
            .insert(host.to_ascii_lowercase(), addrs.to_vec());
        self
    }
}

impl HostResolver for StaticResolver {
    fn resolve<'a>(
        &'a self,
        host: &'a str,
        _port: u16,
    ) -> BoxFuture<'a, Result<Vec<IpAddr>, Error>> {
        let result = self
            .records
            .get(&host.to_ascii_lowercase())
            .cloned()
            .ok_or_else(|| anyhow!("No DNS record for '{}'", host));
        async move { result }.boxed()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum HostPattern {
    Any,
    Exact(String),
    /// Stored with the leading dot, e.g. `.example.com`.
    Suffix(String),
}

impl HostPattern {
    fn parse(raw: &str) -> Option<Self> {
        let pattern = raw.trim().trim_end_matches('.').to_ascii_lowercase();
        if pattern.is_empty() {
            return None;
        }
        if pattern == "*" {
            return Some(HostPattern::Any);
        }
        match pattern.strip_prefix("*.") {
            Some(suffix) if !suffix.is_empty() => Some(HostPattern::Suffix(format!(".{}", suffix))),
            _ => Some(HostPattern::Exact(pattern)),
        }
    }

    fn matches(&self, host: &str) -> bool {
        match self {
            HostPattern::Any => true,
            HostPattern::Exact(exact) => host == exact,
            HostPattern::Suffix(suffix) => host.len() > suffix.len() && host.ends_with(suffix),
        }
    }
}

/// A destination that passed the filter, with the addresses it was vetted against.
#[derive(Debug, Clone)]
pub struct VettedDestination {
    pub url: Url,
    pub host: String,
    pub addrs: Vec<SocketAddr>,
}

impl VettedDestination {
    /// True when the URL names a host rather than an IP literal.
    pub fn is_domain(&self) -> bool {
        matches!(self.url.host(), Some(url::Host::Domain(_)))
    }
}

#[derive(Clone)]
pub struct EgressFilter {
    allowed_hosts: Vec<HostPattern>,
    denied_networks: Vec<IpNetwork>,
    allow_private: bool,
    resolver: Arc<dyn HostResolver>,
}

impl EgressFilter {
    pub fn new(allowed_hosts: &[String], denied_cidrs: &[String]) -> Result<Self, Error> {
        let denied_networks = denied_cidrs
            .iter()
            .map(|cidr| cidr.trim())
            .filter(|cidr| !cidr.is_empty())
            .map(|cidr| {
                cidr.parse::<IpNetwork>()
                    .map_err(|e| anyhow!("Invalid deny CIDR '{}': {}", cidr, e))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            allowed_hosts: allowed_hosts
                .iter()
                .filter_map(|raw| HostPattern::parse(raw))
                .collect(),
            denied_networks,
            allow_private: false,
            resolver: Arc::new(SystemResolver),
        })
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn HostResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Permit non-global addresses (local development only). Deny CIDRs still apply.
    pub fn allow_private(mut self, allow: bool) -> Self {
        self.allow_private = allow;
        self
    }

    pub async fn is_allowed(&self, url: &str) -> bool {
        self.check(url).await.is_ok()
    }

    pub async fn check(&self, url: &str) -> Result<VettedDestination, DeliveryError> {
        let parsed = Url::parse(url)
            .map_err(|e| DeliveryError::EgressDenied(format!("invalid URL: {}", e)))?;

        match parsed.scheme() {
            "http" | "https" => {}
            scheme => {
                return Err(DeliveryError::EgressDenied(format!(
                    "unsupported scheme '{}'",
                    scheme
                )));
            }
        }

        let host = match parsed.host() {
            Some(url::Host::Domain(domain)) => domain.trim_end_matches('.').to_ascii_lowercase(),
            Some(url::Host::Ipv4(ip)) => ip.to_string(),
            Some(url::Host::Ipv6(ip)) => ip.to_string(),
            None => return Err(DeliveryError::EgressDenied("URL has no host".to_string())),
        };

        if !self.allowed_hosts.iter().any(|pattern| pattern.matches(&host)) {
            return Err(DeliveryError::EgressDenied(format!(
                "host '{}' is not on the allow-list",
                host
            )));
        }

        let port = parsed.port_or_known_default().unwrap_or(443);
        let ips = match parsed.host() {
            Some(url::Host::Ipv4(ip)) => vec![IpAddr::V4(ip)],
            Some(url::Host::Ipv6(ip)) => vec![IpAddr::V6(ip)],
            _ => self
                .resolver
                .resolve(&host, port)
                .await
                .map_err(|e| DeliveryError::Network(e.to_string()))?,
        };

        // Resolver hiccups are retried; only policy violations are final.
        if ips.is_empty() {
            return Err(DeliveryError::Network(format!(
                "host '{}' resolved to no addresses",
                host
            )));
        }

        for ip in &ips {
            if let Some(network) = self.denied_networks.iter().find(|net| net.contains(*ip)) {
                return Err(DeliveryError::EgressDenied(format!(
                    "host '{}' resolves to {} inside denied range {}",
                    host, ip, network
                )));
            }
            if !self.allow_private && !is_globally_routable(ip) {
                return Err(DeliveryError::EgressDenied(format!(
                    "host '{}' resolves to non-public address {}",
                    host, ip
                )));
            }
        }

        debug!(host = %host, addresses = ips.len(), "Egress destination vetted");

        Ok(VettedDestination {
            addrs: ips.into_iter().map(|ip| SocketAddr::new(ip, port)).collect(),
            url: parsed,
            host,
        })
    }
}

pub fn is_globally_routable(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_global_v4(v4),
        IpAddr::V6(v6) => is_global_v6(v6),
    }
}

fn is_global_v4(ip: &Ipv4Addr) -> bool {
    let [a, b, c, _] = ip.octets();

    !(ip.is_unspecified()
        || ip.is_loopback()
        || ip.is_private()
        || ip.is_link_local()
        || ip.is_broadcast()
        || ip.is_documentation()
        || ip.is_multicast()
        || a == 0
        // 100.64.0.0/10 shared address space
        || (a == 100 && (b & 0xC0) == 64)
        // 192.0.0.0/24 protocol assignments
        || (a == 192 && b == 0 && c == 0)
        // 198.18.0.0/15 benchmarking
        || (a == 198 && (b & 0xFE) == 18)
        // 240.0.0.0/4 reserved
        || a >= 240)
}

fn is_global_v6(ip: &Ipv6Addr) -> bool {
    if let Some(embedded) = embedded_v4(ip) {
        return is_global_v4(&embedded);
    }

    let first = ip.segments()[0];

    !(ip.is_unspecified()
        || ip.is_loopback()
        || ip.is_multicast()
        // fc00::/7 unique local
        || (first & 0xFE00) == 0xFC00
        // fe80::/10 link local
        || (first & 0xFFC0) == 0xFE80
        // fec0::/10 deprecated site local
        || (first & 0xFFC0) == 0xFEC0
        // 2001:db8::/32 documentation
        || (first == 0x2001 && ip.segments()[1] == 0x0DB8)
        // 64:ff9b:1::/48 local-use translation
        || (first == 0x0064 && ip.segments()[1] == 0xFF9B && ip.segments()[2] == 0x0001))
}

/// IPv4 address reachable through an IPv6 one: mapped `::ffff:0:0/96`,
/// NAT64 `64:ff9b::/96` or 6to4 `2002::/16`.
fn embedded_v4(ip: &Ipv6Addr) -> Option<Ipv4Addr> {
    if let Some(mapped) = ip.to_ipv4_mapped() {
        return Some(mapped);
    }

    let segments = ip.segments();
    let octets = ip.octets();
    match segments {
        [0x0064, 0xFF9B, 0, 0, 0, 0, _, _] => {
            Some(Ipv4Addr::new(octets[12], octets[13], octets[14], octets[15]))
        }
        [0x2002, ..] => Some(Ipv4Addr::new(octets[2], octets[3], octets[4], octets[5])),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_private_and_special_ranges_are_not_global() {
        for ip in [
            "10.1.2.3",
            "172.16.0.1",
            "192.168.1.1",
            "127.0.0.1",
            "169.254.169.254",
            "100.64.0.1",
            "0.0.0.0",
            "255.255.255.255",
            "::1",
            "fe80::1",
            "fd00::1",
            "::ffff:10.0.0.1",
            "64:ff9b::a00:1",
            "64:ff9b::7f00:1",
            "2002:a00:1::1",
            "2002:c0a8:101::1",
            "fec0::1",
        ] {
            let ip: IpAddr = ip.parse().unwrap();
            assert!(!is_globally_routable(&ip), "{} should not be global", ip);
        }
    }

    #[test]
    fn test_public_addresses_are_global() {
        for ip in [
            "8.8.8.8",
            "93.184.216.34",
            "2606:4700:4700::1111",
            "64:ff9b::808:808",
            "2002:808:808::1",
        ] {
            let ip: IpAddr = ip.parse().unwrap();
            assert!(is_globally_routable(&ip), "{} should be global", ip);
        }
    }

    #[test]
    fn test_wildcard_pattern_requires_subdomain() {
        let pattern = HostPattern::parse("*.example.com").unwrap();
        assert!(pattern.matches("hooks.example.com"));
        assert!(pattern.matches("a.b.example.com"));
        assert!(!pattern.matches("example.com"));
        assert!(!pattern.matches("badexample.com"));
    }

    #[test]
    fn test_blank_patterns_are_ignored() {
        assert_eq!(HostPattern::parse("  "), None);
        assert_eq!(
            HostPattern::parse("API.Example.com."),
            Some(HostPattern::Exact("api.example.com".to_string()))
        );
    }
}
