//! CIDR allowlists for tunnel admission.
//!
//! Each HTTP reservation may carry an ordered list of CIDR ranges; an empty
//! list admits every caller. Admission is checked against the caller's
//! socket address, or against the first `X-Forwarded-For` hop when the
//! operator has marked the fronting proxy as trusted.

use std::net::{IpAddr, SocketAddr};

use ipnet::IpNet;

#[derive(Debug, thiserror::Error)]
#[error("invalid CIDR {cidr:?}: {source}")]
pub struct AllowlistError {
    pub cidr: String,
    #[source]
    source: ipnet::AddrParseError,
}

/// A parsed allowlist. Empty means "accept any".
#[derive(Debug, Clone, Default)]
pub struct Allowlist {
    nets: Vec<IpNet>,
}

impl Allowlist {
    /// Parse CIDR strings; blank entries are skipped, malformed ones are a
    /// construction-time error.
    pub fn parse(values: &[String]) -> Result<Self, AllowlistError> {
        let mut nets = Vec::new();
        for value in values {
            let trimmed = value.trim();
            if trimmed.is_empty() {
                continue;
            }
            let net = trimmed.parse::<IpNet>().map_err(|source| AllowlistError {
                cidr: trimmed.to_string(),
                source,
            })?;
            nets.push(net);
        }
        Ok(Self { nets })
    }

    /// Whether `remote_addr` (host or host:port) is admitted. With CIDRs
    /// configured, an unparseable address is rejected.
    #[must_use]
    pub fn allows(&self, remote_addr: &str) -> bool {
        if self.nets.is_empty() {
            return true;
        }
        let Some(ip) = host_ip(remote_addr) else {
            return false;
        };
        self.nets.iter().any(|net| net.contains(&ip))
    }
}

/// Extract the IP from `host:port`, `[v6]:port`, or a bare host string.
fn host_ip(remote_addr: &str) -> Option<IpAddr> {
    if let Ok(sock) = remote_addr.parse::<SocketAddr>() {
        return Some(sock.ip());
    }
    if let Ok(ip) = remote_addr.trim().parse::<IpAddr>() {
        return Some(ip);
    }
    // host:port where host is v4-ish but the whole string didn't parse
    let (host, _port) = remote_addr.rsplit_once(':')?;
    host.trim().parse::<IpAddr>().ok()
}

/// Resolve the address admission should be checked against. The first
/// `X-Forwarded-For` hop wins only when the deployment trusts its fronting
/// proxy; otherwise the socket address is authoritative.
#[must_use]
pub fn client_addr<'a>(
    remote_addr: &'a str,
    forwarded_for: Option<&'a str>,
    trust_forwarded: bool,
) -> &'a str {
    if trust_forwarded {
        if let Some(forwarded) = forwarded_for {
            if let Some(first) = forwarded.split(',').next() {
                let first = first.trim();
                if !first.is_empty() {
                    return first;
                }
            }
        }
    }
    remote_addr
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(values: &[&str]) -> Allowlist {
        let owned: Vec<String> = values.iter().map(ToString::to_string).collect();
        Allowlist::parse(&owned).unwrap()
    }

    #[test]
    fn test_empty_allowlist_admits_everything() {
        let allow = list(&[]);
        assert!(allow.allows("10.0.0.5:1234"));
        assert!(allow.allows("not-an-address"));
    }

    #[test]
    fn test_cidr_match() {
        let allow = list(&["10.0.0.0/24"]);
        assert!(allow.allows("10.0.0.5:1234"));
        assert!(!allow.allows("192.168.1.5:5555"));
    }

    #[test]
    fn test_unparseable_remote_fails_closed() {
        let allow = list(&["10.0.0.0/24"]);
        assert!(!allow.allows("garbage"));
        assert!(!allow.allows(""));
    }

    #[test]
    fn test_ipv6_remote() {
        let allow = list(&["fd00::/8"]);
        assert!(allow.allows("[fd12::1]:9000"));
        assert!(!allow.allows("[2001:db8::1]:9000"));
    }

    #[test]
    fn test_blank_entries_skipped_and_bad_cidr_rejected() {
        let allow = list(&["", "  ", "10.0.0.0/8"]);
        assert!(allow.allows("10.1.2.3"));
        assert!(Allowlist::parse(&["10.0.0.0/40".to_string()]).is_err());
    }

    #[test]
    fn test_forwarded_first_hop_honored_only_when_trusted() {
        let xff = Some("203.0.113.7, 10.0.0.1");
        assert_eq!(client_addr("10.0.0.1:443", xff, true), "203.0.113.7");
        assert_eq!(client_addr("10.0.0.1:443", xff, false), "10.0.0.1:443");
        assert_eq!(client_addr("10.0.0.1:443", None, true), "10.0.0.1:443");
        assert_eq!(client_addr("10.0.0.1:443", Some("  "), true), "10.0.0.1:443");
    }
}
