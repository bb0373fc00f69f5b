//! Outbound URL checks.
//!
//! Webhook targets come from configuration, but a typo or a compromised
//! config must not turn the facilitator into a scanner of its own network.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use url::{Host, Url};

/// Loopback, RFC 1918, link-local, broadcast, unspecified or CGNAT
/// (100.64.0.0/10).
pub fn is_private_ipv4(ip: &Ipv4Addr) -> bool {
    let [a, b, ..] = ip.octets();
    ip.is_loopback()
        || ip.is_private()
        || ip.is_link_local()
        || ip.is_broadcast()
        || ip.is_unspecified()
        || (a == 100 && (b & 0xC0) == 64)
}

/// Loopback, unspecified, unique local (fc00::/7), link-local (fe80::/10),
/// or an IPv4-mapped private address.
pub fn is_private_ipv6(ip: &Ipv6Addr) -> bool {
    let first = ip.segments()[0];
    ip.is_loopback()
        || ip.is_unspecified()
        || (first & 0xFE00) == 0xFC00
        || (first & 0xFFC0) == 0xFE80
        || ip.to_ipv4_mapped().is_some_and(|v4| is_private_ipv4(&v4))
}

pub fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_private_ipv4(v4),
        IpAddr::V6(v6) => is_private_ipv6(v6),
    }
}

/// Parse a webhook URL, requiring HTTPS and a public host.
///
/// Hostnames are not resolved here; only IP literals and `localhost` are
/// rejected.
pub fn validate_webhook_url(raw: &str) -> Result<Url, String> {
    let url = Url::parse(raw).map_err(|e| format!("invalid webhook URL {raw:?}: {e}"))?;
    if url.scheme() != "https" {
        return Err(format!("webhook URL must use https: {raw}"));
    }
    match url.host() {
        None => Err(format!("webhook URL has no host: {raw}")),
        Some(Host::Ipv4(ip)) if is_private_ipv4(&ip) => {
            Err(format!("webhook URL targets a private address: {raw}"))
        }
        Some(Host::Ipv6(ip)) if is_private_ipv6(&ip) => {
            Err(format!("webhook URL targets a private address: {raw}"))
        }
        Some(Host::Domain(d)) if d.eq_ignore_ascii_case("localhost") || d.ends_with(".localhost") => {
            Err(format!("webhook URL targets localhost: {raw}"))
        }
        Some(_) => Ok(url),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn private_ipv4_ranges() {
        for ip in ["127.0.0.1", "10.1.2.3", "172.16.0.1", "192.168.1.1", "169.254.1.1", "100.64.0.1", "0.0.0.0"] {
            assert!(is_private_ipv4(&ip.parse().unwrap()), "{ip}");
        }
        assert!(!is_private_ipv4(&"1.1.1.1".parse().unwrap()));
    }

    #[test]
    fn private_ipv6_ranges() {
        for ip in ["::1", "::", "fd00::1", "fe80::1", "::ffff:10.0.0.1"] {
            assert!(is_private_ipv6(&ip.parse().unwrap()), "{ip}");
        }
        assert!(!is_private_ipv6(&"2606:4700::1111".parse().unwrap()));
    }

    #[test]
    fn webhook_urls() {
        assert!(validate_webhook_url("https://hooks.example.com/x402").is_ok());
        assert!(validate_webhook_url("http://hooks.example.com/x402").is_err());
        assert!(validate_webhook_url("https://127.0.0.1/hook").is_err());
        assert!(validate_webhook_url("https://[::1]/hook").is_err());
        assert!(validate_webhook_url("https://localhost:8443/hook").is_err());
        assert!(validate_webhook_url("not a url").is_err());
    }
}
