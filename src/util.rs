//! Small helpers shared across subsystems: name sanitizing, subnet math,
//! and the outbound-address probe used for bounce detection.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::str::FromStr;

use ipnet::IpNet;

/// Strip path and shell special characters from a string so it is safe to use
/// as a filename or command argument. Replacement repeats until the string is
/// stable, so nested sequences like `..../` cannot survive a single pass.
pub fn sanitize(s: &str) -> String {
    const PATTERNS: &[&str] = &[
        "../", "..\\", "/#", "..", "/", "\\", ":", "*", "?", "\"", "<", ">", "|", "&", "%", "$",
        "#", "@", "!",
    ];

    let mut out = s.to_string();
    loop {
        let mut next = out.clone();
        for p in PATTERNS {
            next = next.replace(p, "");
        }
        if next == out {
            return next;
        }
        out = next;
    }
}

/// Enumerate the host's interface subnets.
///
/// While the enumeration is identical on all platforms, the results differ:
/// Windows reports individual addresses as /32s while Linux reports the
/// interface's actual subnet mask.
pub fn local_subnets() -> Vec<IpNet> {
    let mut subnets = Vec::new();
    let Ok(ifaces) = if_addrs::get_if_addrs() else {
        return subnets;
    };
    for iface in ifaces {
        let net = match iface.addr {
            if_addrs::IfAddr::V4(v4) => {
                let prefix = u32::from(v4.netmask).count_ones() as u8;
                IpNet::new(IpAddr::V4(v4.ip), prefix)
            }
            if_addrs::IfAddr::V6(v6) => {
                let prefix = u128::from(v6.netmask).count_ones() as u8;
                IpNet::new(IpAddr::V6(v6.ip), prefix)
            }
        };
        if let Ok(net) = net {
            subnets.push(net);
        }
    }
    subnets
}

/// Parse a CIDR and return its network (host bits cleared).
pub fn network_address(cidr: &str) -> Option<IpNet> {
    IpNet::from_str(cidr.trim()).ok().map(|n| n.trunc())
}

/// The bare address part of a `addr/prefix` string.
pub fn strip_prefix_len(cidr: &str) -> &str {
    cidr.split('/').next().unwrap_or(cidr)
}

/// Local address the OS would use for outbound traffic, discovered by
/// connecting a datagram socket toward a public resolver. No packets are
/// sent; `connect` on UDP only selects a route.
pub fn outbound_ip() -> Option<IpAddr> {
    let socket = UdpSocket::bind(SocketAddr::from(([0, 0, 0, 0], 0))).ok()?;
    socket.connect("8.8.8.8:53").ok()?;
    socket.local_addr().ok().map(|a| a.ip())
}

/// Check if an IP address belongs to a private/reserved network.
pub fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_private_ipv4(v4),
        IpAddr::V6(v6) => is_private_ipv6(v6),
    }
}

fn is_private_ipv4(ip: &Ipv4Addr) -> bool {
    let octets = ip.octets();
    // 10.0.0.0/8
    if octets[0] == 10 {
        return true;
    }
    // 172.16.0.0/12
    if octets[0] == 172 && (16..=31).contains(&octets[1]) {
        return true;
    }
    // 192.168.0.0/16
    if octets[0] == 192 && octets[1] == 168 {
        return true;
    }
    // 127.0.0.0/8
    if octets[0] == 127 {
        return true;
    }
    // 169.254.0.0/16 (link-local)
    if octets[0] == 169 && octets[1] == 254 {
        return true;
    }
    // 0.0.0.0/8
    if octets[0] == 0 {
        return true;
    }
    // 100.64.0.0/10 (CGNAT / shared address space)
    if octets[0] == 100 && (64..=127).contains(&octets[1]) {
        return true;
    }
    // 192.0.0.0/24 (IETF protocol assignments)
    if octets[0] == 192 && octets[1] == 0 && octets[2] == 0 {
        return true;
    }
    // 192.0.2.0/24, 198.51.100.0/24, 203.0.113.0/24 (documentation)
    if octets[0] == 192 && octets[1] == 0 && octets[2] == 2 {
        return true;
    }
    if octets[0] == 198 && octets[1] == 51 && octets[2] == 100 {
        return true;
    }
    if octets[0] == 203 && octets[1] == 0 && octets[2] == 113 {
        return true;
    }
    // 198.18.0.0/15 (benchmark testing)
    if octets[0] == 198 && (18..=19).contains(&octets[1]) {
        return true;
    }
    // 240.0.0.0/4 (reserved for future use)
    if octets[0] >= 240 {
        return true;
    }
    false
}

fn is_private_ipv6(ip: &Ipv6Addr) -> bool {
    if ip.is_loopback() || ip.is_unspecified() {
        return true;
    }
    let segments = ip.segments();
    // fc00::/7 (ULA)
    if segments[0] & 0xfe00 == 0xfc00 {
        return true;
    }
    // fe80::/10 (link-local)
    if segments[0] & 0xffc0 == 0xfe80 {
        return true;
    }
    // 2001:db8::/32 (documentation)
    if segments[0] == 0x2001 && segments[1] == 0x0db8 {
        return true;
    }
    if let Some(v4) = ip.to_ipv4_mapped() {
        return is_private_ipv4(&v4);
    }
    false
}

/// Whether an address is unusable as an externally reachable endpoint.
pub fn is_bogon(ip: &str) -> bool {
    match ip.parse::<IpAddr>() {
        Ok(addr) => addr.is_unspecified() || is_private_ip(&addr),
        Err(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FORBIDDEN: &[char] = &[
        '/', '\\', ':', '*', '?', '"', '<', '>', '|', '&', '%', '$', '#', '@', '!',
    ];

    #[test]
    fn sanitize_removes_special_characters() {
        let inputs = [
            "../../../etc/passwd",
            "host:name*?\"<>|",
            "a&b%c$d#e@f!g",
            "plain-name.example_01",
            "..\\..\\windows",
            "....//....//etc",
            "https#//evil",
        ];
        for input in inputs {
            let out = sanitize(input);
            for c in FORBIDDEN {
                assert!(!out.contains(*c), "{:?} survived in {:?}", c, out);
            }
            assert!(!out.contains(".."), "dotdot survived in {:?}", out);
        }
        assert_eq!(sanitize("plain-name.example_01"), "plain-name.example_01");
    }

    #[test]
    fn sanitize_is_stable_under_reassembly() {
        // Characters removed in one pass must not reassemble a forbidden
        // sequence that then survives.
        assert_eq!(sanitize(".&./.&./secret"), "secret");
        assert_eq!(sanitize("....//"), "");
    }

    #[test]
    fn network_address_truncates_host_bits() {
        let net = network_address("10.1.1.7/24").unwrap();
        assert_eq!(net.to_string(), "10.1.1.0/24");
        assert!(network_address("not-a-cidr").is_none());
    }

    #[test]
    fn strip_prefix_len_returns_bare_address() {
        assert_eq!(strip_prefix_len("10.1.1.2/32"), "10.1.1.2");
        assert_eq!(strip_prefix_len("10.1.1.2"), "10.1.1.2");
    }

    #[test]
    fn private_ranges_are_detected() {
        for ip in ["10.0.0.1", "172.16.0.1", "192.168.1.1", "127.0.0.1", "100.64.0.1"] {
            assert!(is_private_ip(&ip.parse().unwrap()), "{ip}");
        }
        for ip in ["8.8.8.8", "1.1.1.1"] {
            assert!(!is_private_ip(&ip.parse().unwrap()), "{ip}");
        }
        assert!(is_private_ip(&"fe80::1".parse().unwrap()));
        assert!(is_private_ip(&"fd00::1".parse().unwrap()));
        assert!(!is_private_ip(&"2606:4700::1111".parse().unwrap()));
    }

    #[test]
    fn bogon_check() {
        assert!(is_bogon("0.0.0.0"));
        assert!(is_bogon("127.0.0.1"));
        assert!(is_bogon("not-an-ip"));
        assert!(is_bogon("203.0.113.1"));
        assert!(!is_bogon("93.184.216.34"));
    }
}
