use ipnet::IpNet;
use std::net::IpAddr;

use crate::error::{Result, TunnelError};

/// Original client address from an `X-Forwarded-For` header.
///
/// The header reads "client, proxy1, proxy2, ..."; the leftmost entry is the
/// client that reached the first reverse proxy.
#[must_use]
pub fn forwarded_client_ip(xff_header: &str) -> Option<String> {
    xff_header
        .split(',')
        .next()
        .map(|ip| ip.trim().to_string())
        .filter(|ip| !ip.is_empty())
}

/// Peers allowed to connect to the server endpoint, typically the reverse
/// proxies sitting in front of it.
#[derive(Debug, Clone, Default)]
pub struct PeerAllowlist {
    nets: Vec<IpNet>,
}

impl PeerAllowlist {
    /// Parses plain IP addresses and CIDR ranges.
    pub fn parse<S: AsRef<str>>(entries: &[S]) -> Result<Self> {
        let nets = entries
            .iter()
            .map(|entry| parse_entry(entry.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { nets })
    }

    #[must_use]
    pub fn allows(&self, peer: IpAddr) -> bool {
        let peer = peer.to_canonical();
        self.nets.iter().any(|net| net.contains(&peer))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nets.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nets.is_empty()
    }
}

fn parse_entry(entry: &str) -> Result<IpNet> {
    let entry = entry.trim();
    if let Ok(ip) = entry.parse::<IpAddr>() {
        let prefix = if ip.is_ipv4() { 32 } else { 128 };
        return IpNet::new(ip, prefix).map_err(|e| TunnelError::InvalidAddress(e.to_string()));
    }
    entry.parse::<IpNet>().map_err(|_| {
        TunnelError::InvalidAddress(format!(
            "'{entry}' is neither an IP address nor a CIDR range"
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn takes_leftmost_forwarded_address() {
        assert_eq!(
            forwarded_client_ip("203.0.113.7, 10.0.0.1, 10.0.0.2").as_deref(),
            Some("203.0.113.7")
        );
        assert_eq!(forwarded_client_ip(" 198.51.100.1 ").as_deref(), Some("198.51.100.1"));
        assert_eq!(forwarded_client_ip(""), None);
        assert_eq!(forwarded_client_ip(" , 10.0.0.1"), None);
    }

    #[test]
    fn matches_addresses_and_ranges() {
        let allowlist = PeerAllowlist::parse(&["127.0.0.1", "10.0.0.0/8", "::1"]).unwrap();
        assert_eq!(allowlist.len(), 3);

        assert!(allowlist.allows("127.0.0.1".parse().unwrap()));
        assert!(allowlist.allows("10.20.30.40".parse().unwrap()));
        assert!(allowlist.allows("::1".parse().unwrap()));
        assert!(!allowlist.allows("192.168.1.1".parse().unwrap()));
        assert!(!allowlist.allows("127.0.0.2".parse().unwrap()));
    }

    #[test]
    fn mapped_ipv4_peers_match_ipv4_entries() {
        let allowlist = PeerAllowlist::parse(&["127.0.0.1"]).unwrap();
        assert!(allowlist.allows("::ffff:127.0.0.1".parse().unwrap()));
    }

    #[test]
    fn empty_allowlist_allows_nobody() {
        let allowlist = PeerAllowlist::parse::<&str>(&[]).unwrap();
        assert!(allowlist.is_empty());
        assert!(!allowlist.allows("127.0.0.1".parse().unwrap()));
    }

    #[test]
    fn rejects_invalid_entries() {
        let err = PeerAllowlist::parse(&["10.0.0.0/8", "not-an-ip"]).unwrap_err();
        assert!(matches!(err, TunnelError::InvalidAddress(_)));
        assert!(err.to_string().contains("not-an-ip"));
    }
}
