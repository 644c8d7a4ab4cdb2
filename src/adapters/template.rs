//! Tunnel config rendering.
//!
//! Produces the `[Interface]`/`[Peer]` text written to `<net>.conf`. A VPN
//! with an endpoint of its own acts as a server and lists every peer; a
//! roaming client only lists peers it can actually reach (those with
//! endpoints). Service-typed VPNs include disabled peers so the service
//! keeps addressing them.

use std::fmt::Write as _;

use crate::model::Vpn;

pub fn render(vpn: &Vpn, peers: &[Vpn]) -> String {
    if !vpn.enable {
        return String::new();
    }

    let c = &vpn.current;
    let mut out = String::new();

    let _ = writeln!(
        out,
        "# {} / Updated: {} / Created: {}",
        vpn.name,
        vpn.updated.as_deref().unwrap_or(""),
        vpn.created.as_deref().unwrap_or("")
    );
    out.push_str("[Interface]\n");
    for addr in &c.address {
        let _ = writeln!(out, "Address = {addr}");
    }
    let _ = writeln!(out, "PrivateKey = {}", c.private_key);
    if c.listen_port != 0 {
        let _ = writeln!(out, "ListenPort = {}", c.listen_port);
    }
    if !c.dns.is_empty() {
        let _ = writeln!(out, "DNS = {}", c.dns.join(", "));
    }
    if c.mtu != 0 {
        let _ = writeln!(out, "MTU = {}", c.mtu);
    }
    if !c.pre_up.is_empty() {
        let _ = writeln!(out, "PreUp = {}", c.pre_up);
    }
    if !c.post_up.is_empty() {
        let _ = writeln!(out, "PostUp = {}", c.post_up);
    }
    if !c.pre_down.is_empty() {
        let _ = writeln!(out, "PreDown = {}", c.pre_down);
    }
    if !c.post_down.is_empty() {
        let _ = writeln!(out, "PostDown = {}", c.post_down);
    }

    let we_are_server = !c.endpoint.is_empty();
    let service = !c.vpn_type.is_empty();

    for peer in peers {
        if !(peer.enable || service) {
            continue;
        }
        // A client without an endpoint of its own cannot dial endpointless
        // peers; skip them instead of writing unreachable stanzas.
        if !we_are_server && peer.current.endpoint.is_empty() {
            continue;
        }
        let p = &peer.current;
        out.push('\n');
        let _ = writeln!(
            out,
            "# {} / Updated: {} / Created: {}",
            peer.name,
            peer.updated.as_deref().unwrap_or(""),
            peer.created.as_deref().unwrap_or("")
        );
        out.push_str("[Peer]\n");
        let _ = writeln!(out, "PublicKey = {}", p.public_key);
        let _ = writeln!(out, "PresharedKey = {}", p.preshared_key);
        let _ = writeln!(out, "AllowedIPs = {}", p.allowed_ips.join(", "));
        if !p.endpoint.is_empty() {
            let _ = writeln!(out, "Endpoint = {}", p.endpoint);
        }
        if p.persistent_keepalive != 0 {
            let _ = writeln!(out, "PersistentKeepalive = {}", p.persistent_keepalive);
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Settings;

    fn vpn(name: &str, enable: bool) -> Vpn {
        Vpn {
            name: name.into(),
            enable,
            current: Settings {
                address: vec!["10.1.1.2/32".into()],
                private_key: "PRIV".into(),
                public_key: "PUB".into(),
                allowed_ips: vec!["10.1.1.0/24".into()],
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn disabled_vpn_renders_empty() {
        assert_eq!(render(&vpn("a", false), &[]), "");
    }

    #[test]
    fn interface_section_has_conditional_lines() {
        let mut v = vpn("a", true);
        v.current.listen_port = 51820;
        v.current.dns = vec!["10.1.1.1".into(), "8.8.8.8".into()];
        v.current.mtu = 1380;
        v.current.post_up = "sysctl -w net.ipv4.ip_forward=1".into();
        let text = render(&v, &[]);
        assert!(text.contains("Address = 10.1.1.2/32"));
        assert!(text.contains("PrivateKey = PRIV"));
        assert!(text.contains("ListenPort = 51820"));
        assert!(text.contains("DNS = 10.1.1.1, 8.8.8.8"));
        assert!(text.contains("MTU = 1380"));
        assert!(text.contains("PostUp = sysctl"));
        assert!(!text.contains("PreUp"));
    }

    #[test]
    fn client_skips_endpointless_peers() {
        let me = vpn("me", true);
        let mut reachable = vpn("gw", true);
        reachable.current.endpoint = "203.0.113.10:51820".into();
        let roaming = vpn("laptop", true);
        let text = render(&me, &[reachable, roaming]);
        assert!(text.contains("# gw"));
        assert!(text.contains("Endpoint = 203.0.113.10:51820"));
        assert!(!text.contains("# laptop"));
    }

    #[test]
    fn server_lists_every_enabled_peer() {
        let mut me = vpn("gw", true);
        me.current.endpoint = "203.0.113.10:51820".into();
        let roaming = vpn("laptop", true);
        let mut disabled = vpn("off", false);
        disabled.current.endpoint = "203.0.113.11:51820".into();
        let text = render(&me, &[roaming, disabled]);
        assert!(text.contains("# laptop"));
        assert!(!text.contains("# off"));
    }

    #[test]
    fn service_type_includes_disabled_peers() {
        let mut me = vpn("svc", true);
        me.current.endpoint = "203.0.113.10:51820".into();
        me.current.vpn_type = "Service".into();
        let disabled = vpn("off", false);
        let text = render(&me, &[disabled]);
        assert!(text.contains("# off"));
    }

    #[test]
    fn keepalive_written_only_when_set() {
        let mut me = vpn("gw", true);
        me.current.endpoint = "203.0.113.10:51820".into();
        let mut peer = vpn("laptop", true);
        peer.current.persistent_keepalive = 25;
        let text = render(&me, &[peer]);
        assert!(text.contains("PersistentKeepalive = 25"));
    }
}
