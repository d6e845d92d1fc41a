use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Addresses that can never be located: private, loopback, link-local,
/// shared, documentation, multicast and reserved ranges.
pub fn is_bogon(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_bogon_v4(v4),
        IpAddr::V6(v6) => is_bogon_v6(v6),
    }
}

fn is_bogon_v4(ip: Ipv4Addr) -> bool {
    let [a, b, ..] = ip.octets();
    ip.is_private()
        || ip.is_loopback()
        || ip.is_link_local()
        || ip.is_unspecified()
        || ip.is_broadcast()
        || ip.is_documentation()
        || ip.is_multicast()
        || a == 0
        || a >= 240
        // 100.64.0.0/10 carrier-grade NAT
        || (a == 100 && (64..128).contains(&b))
        // 198.18.0.0/15 benchmarking
        || (a == 198 && (b == 18 || b == 19))
}

fn is_bogon_v6(ip: Ipv6Addr) -> bool {
    if let Some(v4) = ip.to_ipv4_mapped() {
        return is_bogon_v4(v4);
    }
    let first = ip.segments()[0];
    ip.is_loopback()
        || ip.is_unspecified()
        || ip.is_multicast()
        // fc00::/7 unique local
        || (first & 0xfe00) == 0xfc00
        // fe80::/10 link local
        || (first & 0xffc0) == 0xfe80
        // 2001:db8::/32 documentation
        || (first == 0x2001 && ip.segments()[1] == 0x0db8)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bogon(s: &str) -> bool {
        is_bogon(s.parse().unwrap())
    }

    #[test]
    fn test_private_ranges() {
        for ip in [
            "127.0.0.1", "10.0.0.1", "10.255.255.254", "192.168.1.1", "172.16.0.1", "172.31.255.1",
            "169.254.10.10", "100.64.0.1", "0.0.0.0", "255.255.255.255", "::1", "fe80::1",
            "fd12:3456::1", "fc00::1", "::ffff:192.168.0.1",
        ] {
            assert!(bogon(ip), "{ip} should be bogon");
        }
    }

    #[test]
    fn test_public_ranges() {
        for ip in ["1.1.1.1", "8.8.8.8", "172.32.0.1", "100.128.0.1", "2606:4700::1111"] {
            assert!(!bogon(ip), "{ip} should be public");
        }
    }
}
