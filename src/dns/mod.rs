//! Embedded DNS resolver.
//!
//! Authoritative for the names of every VPN in the device's networks and a
//! split-horizon recursive forwarder for everything else. The working state
//! is an immutable [`Snapshot`] rebuilt from the aggregate of all servers'
//! cached Messages and swapped atomically; one UDP+TCP listener runs per
//! DNS-enabled VPN address.

pub mod handler;

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use hickory_server::ServerFuture;
use parking_lot::RwLock;
use tokio::net::{TcpListener, UdpSocket};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::adapters::notify::Notifier;
use crate::model::Message;
use crate::util::strip_prefix_len;

use handler::DnsHandler;

const DNS_PORT: u16 = 53;
const TCP_REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

/// Aggregate DNS state derived from every registered server.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    /// Lowercased name → address CIDRs, plus reverse labels → [name].
    pub table: HashMap<String, Vec<String>>,
    /// Upstream resolvers, in configuration order, deduplicated.
    pub resolvers: Vec<IpAddr>,
    /// Suffixes that must never leak to public resolvers.
    pub search_domains: Vec<String>,
    /// Addresses that should carry a port-53 listener.
    pub listen_addrs: Vec<IpAddr>,
}

/// Build the snapshot from all servers' cached Messages.
pub fn build_snapshot<'a>(messages: impl IntoIterator<Item = &'a Message>) -> Snapshot {
    let mut snapshot = Snapshot::default();

    for msg in messages {
        let Some(device) = msg.device.as_ref() else {
            continue;
        };
        for net in &msg.config {
            let Some(idx) = net.vpn_index_for(&device.id) else {
                continue;
            };
            let ours = &net.vpns[idx];
            if !(ours.enable && ours.current.enable_dns) {
                continue;
            }

            let domain = net.net_name.to_lowercase();
            if !domain.is_empty() && !snapshot.search_domains.contains(&domain) {
                snapshot.search_domains.push(domain);
            }

            add_vpn_records(&mut snapshot.table, ours);
            for (j, peer) in net.vpns.iter().enumerate() {
                if j != idx {
                    add_vpn_records(&mut snapshot.table, peer);
                }
            }

            let own_addr = ours
                .current
                .address
                .first()
                .map(|a| strip_prefix_len(a).to_string())
                .unwrap_or_default();
            for entry in &ours.current.dns {
                match entry.parse::<IpAddr>() {
                    Ok(ip) => {
                        if entry != &own_addr && !snapshot.resolvers.contains(&ip) {
                            snapshot.resolvers.push(ip);
                        }
                    }
                    Err(_) => {
                        let domain = entry.to_lowercase();
                        if !domain.is_empty() && !snapshot.search_domains.contains(&domain) {
                            snapshot.search_domains.push(domain);
                        }
                    }
                }
            }

            if let Ok(ip) = own_addr.parse::<IpAddr>() {
                if !snapshot.listen_addrs.contains(&ip) {
                    snapshot.listen_addrs.push(ip);
                }
            }
        }
    }

    snapshot
}

fn add_vpn_records(table: &mut HashMap<String, Vec<String>>, vpn: &crate::model::Vpn) {
    let name = vpn.name.to_lowercase();
    if name.is_empty() {
        return;
    }
    for addr in &vpn.current.address {
        let entry = table.entry(name.clone()).or_default();
        if !entry.contains(addr) {
            entry.push(addr.clone());
        }
        if let Ok(ip) = strip_prefix_len(addr).parse::<IpAddr>() {
            table.insert(reverse_label(&ip), vec![name.clone()]);
        }
    }
}

/// The reverse-DNS label for an address: reversed octets under
/// `in-addr.arpa` for v4, the 32-nibble expanded form under `ip6.arpa` for
/// v6. Parsing the address first normalizes short v6 forms.
pub fn reverse_label(ip: &IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            format!("{}.{}.{}.{}.in-addr.arpa", o[3], o[2], o[1], o[0])
        }
        IpAddr::V6(v6) => {
            let mut labels = Vec::with_capacity(32);
            for byte in v6.octets().iter().rev() {
                labels.push(format!("{:x}", byte & 0x0f));
                labels.push(format!("{:x}", byte >> 4));
            }
            format!("{}.ip6.arpa", labels.join("."))
        }
    }
}

/// Process-wide DNS service: current snapshot plus the set of live
/// listeners, one per interface address.
pub struct DnsState {
    snapshot: RwLock<Arc<Snapshot>>,
    listeners: tokio::sync::Mutex<HashMap<IpAddr, JoinHandle<()>>>,
    notify: Notifier,
    quiet: bool,
}

impl DnsState {
    pub fn new(notify: Notifier, quiet: bool) -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(Snapshot::default())),
            listeners: tokio::sync::Mutex::new(HashMap::new()),
            notify,
            quiet,
        }
    }

    pub fn snapshot(&self) -> Arc<Snapshot> {
        Arc::clone(&self.snapshot.read())
    }

    /// Swap in a snapshot built from the given Messages, shutting down
    /// listeners whose addresses are no longer needed and starting new ones.
    pub async fn rebuild(self: &Arc<Self>, messages: &[Message]) {
        let snapshot = Arc::new(build_snapshot(messages.iter()));
        info!(
            names = snapshot.table.len(),
            resolvers = snapshot.resolvers.len(),
            listeners = snapshot.listen_addrs.len(),
            "DNS snapshot rebuilt"
        );
        *self.snapshot.write() = Arc::clone(&snapshot);

        let mut listeners = self.listeners.lock().await;
        listeners.retain(|addr, handle| {
            if snapshot.listen_addrs.contains(addr) {
                true
            } else {
                info!(%addr, "stopping DNS listener");
                handle.abort();
                false
            }
        });
        for addr in &snapshot.listen_addrs {
            if !listeners.contains_key(addr) {
                if let Some(handle) = self.start_listener(*addr).await {
                    listeners.insert(*addr, handle);
                }
            }
        }
    }

    /// Shut down the listener for one address, if running.
    pub async fn stop_listener(&self, addr: IpAddr) {
        if let Some(handle) = self.listeners.lock().await.remove(&addr) {
            info!(%addr, "stopping DNS listener");
            handle.abort();
        }
    }

    /// Drop everything: empty snapshot, all listeners down. The next
    /// successful reconcile rebuilds from scratch.
    pub async fn clear(&self) {
        *self.snapshot.write() = Arc::new(Snapshot::default());
        let mut listeners = self.listeners.lock().await;
        for (addr, handle) in listeners.drain() {
            info!(%addr, "stopping DNS listener");
            handle.abort();
        }
    }

    async fn start_listener(self: &Arc<Self>, addr: IpAddr) -> Option<JoinHandle<()>> {
        let socket_addr = SocketAddr::new(addr, DNS_PORT);
        let udp = match UdpSocket::bind(socket_addr).await {
            Ok(udp) => udp,
            Err(e) => {
                warn!(%socket_addr, error = %e, "failed to bind DNS UDP listener");
                return None;
            }
        };
        let tcp = match TcpListener::bind(socket_addr).await {
            Ok(tcp) => tcp,
            Err(e) => {
                warn!(%socket_addr, error = %e, "failed to bind DNS TCP listener");
                return None;
            }
        };
        info!(%socket_addr, "DNS listener started");

        let handler = DnsHandler::new(Arc::clone(self), self.notify.clone(), self.quiet);
        Some(tokio::spawn(async move {
            let mut server = ServerFuture::new(handler);
            server.register_socket(udp);
            server.register_listener(tcp, TCP_REQUEST_TIMEOUT);
            if let Err(e) = server.block_until_done().await {
                error!(error = %e, "DNS server terminated");
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Device, Net, Settings, Vpn};

    fn vpn(name: &str, device_id: &str, addr: &str, enable_dns: bool) -> Vpn {
        Vpn {
            name: name.into(),
            device_id: device_id.into(),
            enable: true,
            current: Settings {
                address: vec![addr.into()],
                enable_dns,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn message() -> Message {
        let mut ours = vpn("Alpha-GW", "d1", "10.1.1.2/32", true);
        ours.current.dns = vec![
            "10.1.1.2".into(),
            "10.1.1.1".into(),
            "corp.internal".into(),
        ];
        Message {
            device: Some(Device {
                id: "d1".into(),
                ..Default::default()
            }),
            config: vec![Net {
                net_name: "eu".into(),
                vpns: vec![ours, vpn("alpha-peer", "d2", "10.1.1.3/32", false)],
                ..Default::default()
            }],
        }
    }

    #[test]
    fn snapshot_contains_all_net_names() {
        let msg = message();
        let snap = build_snapshot([&msg]);
        assert_eq!(snap.table["alpha-gw"], vec!["10.1.1.2/32"]);
        assert_eq!(snap.table["alpha-peer"], vec!["10.1.1.3/32"]);
        assert_eq!(snap.table["2.1.1.10.in-addr.arpa"], vec!["alpha-gw"]);
        assert_eq!(snap.table["3.1.1.10.in-addr.arpa"], vec!["alpha-peer"]);
    }

    #[test]
    fn own_address_excluded_from_resolvers() {
        let msg = message();
        let snap = build_snapshot([&msg]);
        assert_eq!(snap.resolvers, vec!["10.1.1.1".parse::<IpAddr>().unwrap()]);
    }

    #[test]
    fn non_ip_dns_entries_become_search_domains() {
        let msg = message();
        let snap = build_snapshot([&msg]);
        assert_eq!(snap.search_domains, vec!["eu", "corp.internal"]);
    }

    #[test]
    fn listener_on_first_address() {
        let msg = message();
        let snap = build_snapshot([&msg]);
        assert_eq!(snap.listen_addrs, vec!["10.1.1.2".parse::<IpAddr>().unwrap()]);
    }

    #[test]
    fn dns_disabled_vpn_contributes_nothing() {
        let mut msg = message();
        msg.config[0].vpns[0].current.enable_dns = false;
        let snap = build_snapshot([&msg]);
        assert!(snap.table.is_empty());
        assert!(snap.resolvers.is_empty());
        assert!(snap.listen_addrs.is_empty());
    }

    #[test]
    fn reverse_label_v4() {
        assert_eq!(
            reverse_label(&"10.1.1.2".parse().unwrap()),
            "2.1.1.10.in-addr.arpa"
        );
    }

    #[test]
    fn reverse_label_v6_expands_short_forms() {
        let label = reverse_label(&"fd00::1".parse().unwrap());
        assert_eq!(
            label,
            "1.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.d.f.ip6.arpa"
        );
        assert_eq!(label.split('.').count(), 34);
    }

    #[test]
    fn snapshot_aggregates_across_servers() {
        let msg1 = message();
        let mut msg2 = message();
        msg2.config[0].net_name = "us".into();
        msg2.config[0].vpns[0].name = "beta-gw".into();
        msg2.config[0].vpns[0].current.address = vec!["10.2.1.2/32".into()];
        let snap = build_snapshot([&msg1, &msg2]);
        assert!(snap.table.contains_key("alpha-gw"));
        assert!(snap.table.contains_key("beta-gw"));
        assert!(snap.search_domains.contains(&"eu".to_string()));
        assert!(snap.search_domains.contains(&"us".to_string()));
        assert_eq!(snap.listen_addrs.len(), 2);
    }
}
