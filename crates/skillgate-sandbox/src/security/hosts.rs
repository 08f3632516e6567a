//! SSRF host and address classification.
//!
//! Blocked hostnames, private/link-local/CGNAT address ranges, and cloud
//! metadata endpoints. IPv4-mapped IPv6 (`::ffff:...`, dotted or hex) is
//! classified by its embedded IPv4 address; rejecting the mapped form is an
//! explicit countermeasure against bypass via IPv6 encoding.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Hostnames that always resolve to the local machine or a metadata service.
const BLOCKED_HOSTNAMES: &[&str] = &[
    "localhost",
    "localhost.localdomain",
    "ip6-localhost",
    "ip6-loopback",
    "metadata",
    "metadata.google.internal",
    "instance-data",
];

const BLOCKED_HOST_SUFFIXES: &[&str] = &[".localhost", ".local", ".internal"];

/// Cloud metadata endpoints: AWS/GCP/Azure link-local, ECS task endpoint,
/// Alibaba, and the AWS IPv6 form.
const CLOUD_METADATA_IPS: &[&str] = &[
    "169.254.169.254",
    "169.254.170.2",
    "100.100.100.200",
    "fd00:ec2::254",
];

/// Lowercase, trim the trailing dot, strip IPv6 brackets.
fn normalize_host(host: &str) -> String {
    let host = host.trim().trim_end_matches('.');
    let host = host.strip_prefix('[').unwrap_or(host);
    let host = host.strip_suffix(']').unwrap_or(host);
    host.to_ascii_lowercase()
}

/// Exact membership or suffix match against the blocked hostname tables.
pub fn is_blocked_hostname(host: &str) -> bool {
    let host = normalize_host(host);
    if BLOCKED_HOSTNAMES.iter().any(|h| *h == host) {
        return true;
    }
    BLOCKED_HOST_SUFFIXES.iter().any(|s| host.ends_with(s))
}

fn is_private_v4(addr: Ipv4Addr) -> bool {
    let o = addr.octets();
    match o[0] {
        0 | 10 | 127 => true,
        169 => o[1] == 254,
        172 => (16..=31).contains(&o[1]),
        192 => o[1] == 168,
        // CGNAT 100.64.0.0/10
        100 => (64..=127).contains(&o[1]),
        _ => false,
    }
}

fn is_private_v6(addr: Ipv6Addr) -> bool {
    if let Some(v4) = addr.to_ipv4_mapped() {
        return is_private_v4(v4);
    }
    if addr.is_unspecified() || addr.is_loopback() {
        return true;
    }
    let seg0 = addr.segments()[0];
    // fe80::/10 link-local, fec0::/10 deprecated site-local, fc00::/7 ULA
    (seg0 & 0xffc0) == 0xfe80 || (seg0 & 0xffc0) == 0xfec0 || (seg0 & 0xfe00) == 0xfc00
}

/// Classify a textual address. Recognizes bare IPv4, bare IPv6 (optionally
/// bracketed), and the `::ffff:` IPv4-mapped form in both its dotted-quad
/// and hex representations. Non-addresses are not private.
pub fn is_private_ip(addr: &str) -> bool {
    match normalize_host(addr).parse::<IpAddr>() {
        Ok(IpAddr::V4(v4)) => is_private_v4(v4),
        Ok(IpAddr::V6(v6)) => is_private_v6(v6),
        Err(_) => false,
    }
}

/// Exact match against the metadata-endpoint list, in any representation.
pub fn is_cloud_metadata_ip(addr: &str) -> bool {
    let Ok(parsed) = normalize_host(addr).parse::<IpAddr>() else {
        return false;
    };
    // Compare canonicalized: a mapped ::ffff:169.254.169.254 equals its v4.
    let canonical = match parsed {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(parsed),
        v4 => v4,
    };
    CLOUD_METADATA_IPS
        .iter()
        .filter_map(|s| s.parse::<IpAddr>().ok())
        .any(|m| m == canonical)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocked_hostnames_and_suffixes() {
        assert!(is_blocked_hostname("localhost"));
        assert!(is_blocked_hostname("LOCALHOST"));
        assert!(is_blocked_hostname("localhost."));
        assert!(is_blocked_hostname("metadata.google.internal"));
        assert!(is_blocked_hostname("db.internal"));
        assert!(is_blocked_hostname("printer.local"));
        assert!(is_blocked_hostname("app.localhost"));

        assert!(!is_blocked_hostname("example.com"));
        assert!(!is_blocked_hostname("internal.example.com"));
        assert!(!is_blocked_hostname("localho.st"));
    }

    #[test]
    fn private_ipv4_ranges() {
        for a in [
            "0.1.2.3",
            "10.0.0.1",
            "127.0.0.1",
            "127.255.255.254",
            "169.254.1.1",
            "172.16.0.1",
            "172.31.255.255",
            "192.168.0.10",
            "100.64.0.1",
            "100.127.255.255",
        ] {
            assert!(is_private_ip(a), "not private: {a}");
        }
        for a in ["8.8.8.8", "1.1.1.1", "172.32.0.1", "100.128.0.1", "169.253.0.1"] {
            assert!(!is_private_ip(a), "wrongly private: {a}");
        }
    }

    #[test]
    fn private_ipv6_prefixes() {
        for a in ["::", "::1", "fe80::1", "fec0::1", "fc00::1", "fd12:3456::1"] {
            assert!(is_private_ip(a), "not private: {a}");
        }
        assert!(!is_private_ip("2001:4860:4860::8888"));
    }

    #[test]
    fn ipv4_mapped_ipv6_is_classified_by_embedded_address() {
        // property: private v4 implies private ::ffff: form
        for v4 in ["127.0.0.1", "10.1.2.3", "192.168.1.1", "169.254.169.254"] {
            assert!(is_private_ip(v4));
            assert!(is_private_ip(&format!("::ffff:{v4}")), "mapped form escaped: {v4}");
        }
        // hex representation of the trailing octets
        assert!(is_private_ip("::ffff:7f00:1")); // 127.0.0.1
        assert!(is_private_ip("[::ffff:127.0.0.1]"));
        assert!(!is_private_ip("::ffff:8.8.8.8"));
    }

    #[test]
    fn cloud_metadata_endpoints() {
        assert!(is_cloud_metadata_ip("169.254.169.254"));
        assert!(is_cloud_metadata_ip("169.254.170.2"));
        assert!(is_cloud_metadata_ip("100.100.100.200"));
        assert!(is_cloud_metadata_ip("fd00:ec2::254"));
        assert!(is_cloud_metadata_ip("::ffff:169.254.169.254"));
        assert!(!is_cloud_metadata_ip("169.254.169.253"));
        assert!(!is_cloud_metadata_ip("example.com"));
    }

    #[test]
    fn classification_never_panics_on_garbage() {
        for s in ["", "not-an-ip", "999.999.999.999", ":::::", "[]", "10.0.0"] {
            let _ = is_private_ip(s);
            let _ = is_cloud_metadata_ip(s);
            let _ = is_blocked_hostname(s);
        }
    }
}
