//! DNS request handling: authoritative answers from the snapshot table,
//! split-horizon forwarding for everything else.
//!
//! Forwarding runs in two passes, private/loopback resolvers first and
//! public ones second, so in-VPN names and reverse zones for private ranges can
//! never leak to the open internet. The first NOERROR response wins.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hickory_proto::op::{Header, Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::{rdata, Name, RData, Record, RecordType};
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable, BinEncoder};
use hickory_proto::xfer::Protocol;
use hickory_server::authority::MessageResponseBuilder;
use hickory_server::server::{Request, RequestHandler, ResponseHandler, ResponseInfo};
use rand::Rng;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::DnsState;
use crate::adapters::notify::Notifier;
use crate::util::{is_private_ip, strip_prefix_len};

/// Per-resolver forwarding deadline.
const FORWARD_TIMEOUT: Duration = Duration::from_secs(1);
const ANSWER_TTL: u32 = 300;

#[derive(Debug, thiserror::Error)]
enum ForwardError {
    #[error("resolver timed out")]
    Timeout,
    #[error("rcode {0:?}")]
    Rcode(ResponseCode),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Proto(#[from] hickory_proto::ProtoError),
}

#[derive(Clone)]
pub struct DnsHandler {
    state: Arc<DnsState>,
    notify: Notifier,
    quiet: bool,
}

impl DnsHandler {
    pub fn new(state: Arc<DnsState>, notify: Notifier, quiet: bool) -> Self {
        Self {
            state,
            notify,
            quiet,
        }
    }

    fn response_header(request: &Request, rcode: ResponseCode, authoritative: bool) -> Header {
        let mut header = *request.header();
        header.set_message_type(MessageType::Response);
        header.set_op_code(OpCode::Query);
        header.set_response_code(rcode);
        header.set_recursion_available(true);
        header.set_authoritative(authoritative);
        header
    }

    async fn send_records<R: ResponseHandler>(
        request: &Request,
        mut response: R,
        rcode: ResponseCode,
        authoritative: bool,
        records: &[Record],
    ) -> ResponseInfo {
        let header = Self::response_header(request, rcode, authoritative);
        let msg = MessageResponseBuilder::from_message_request(request).build(
            header,
            records.iter(),
            std::iter::empty::<&Record>(),
            std::iter::empty::<&Record>(),
            std::iter::empty::<&Record>(),
        );
        response
            .send_response(msg)
            .await
            .unwrap_or_else(|_| ResponseInfo::from(*request.header()))
    }

    /// Answer from the local table: A/AAAA with the addresses of the name
    /// (rotated for a little load balancing), PTR with the stored target.
    fn local_records(&self, qname: &str, qtype: RecordType, values: &[String]) -> Vec<Record> {
        if values.is_empty() {
            return Vec::new();
        }
        let Ok(name) = Name::from_ascii(format!("{qname}.")) else {
            return Vec::new();
        };
        let mut records = Vec::new();
        match qtype {
            RecordType::A | RecordType::AAAA => {
                let want_v6 = qtype == RecordType::AAAA;
                let offset = rand::thread_rng().gen_range(0..values.len());
                for i in 0..values.len() {
                    let value = &values[(offset + i) % values.len()];
                    let Ok(ip) = strip_prefix_len(value).parse::<IpAddr>() else {
                        continue;
                    };
                    match ip {
                        IpAddr::V4(v4) if !want_v6 => {
                            records.push(Record::from_rdata(
                                name.clone(),
                                ANSWER_TTL,
                                RData::A(rdata::A(v4)),
                            ));
                        }
                        IpAddr::V6(v6) if want_v6 => {
                            records.push(Record::from_rdata(
                                name.clone(),
                                ANSWER_TTL,
                                RData::AAAA(rdata::AAAA(v6)),
                            ));
                        }
                        _ => {}
                    }
                }
            }
            RecordType::PTR => {
                if let Some(target) = values.first() {
                    if let Ok(ptr) = Name::from_ascii(format!("{target}.")) {
                        records.push(Record::from_rdata(
                            name,
                            ANSWER_TTL,
                            RData::PTR(rdata::PTR(ptr)),
                        ));
                    }
                }
            }
            _ => {}
        }
        records
    }

    /// Forward to one resolver over the same transport the client used.
    async fn forward_once(
        resolver: IpAddr,
        qname: &Name,
        qtype: RecordType,
        tcp: bool,
    ) -> Result<Message, ForwardError> {
        let mut query = Message::new();
        query.set_id(rand::thread_rng().gen());
        query.set_message_type(MessageType::Query);
        query.set_op_code(OpCode::Query);
        query.set_recursion_desired(true);
        query.add_query(Query::query(qname.clone(), qtype));

        let mut buf = Vec::with_capacity(512);
        let mut encoder = BinEncoder::new(&mut buf);
        query.emit(&mut encoder)?;

        let upstream = SocketAddr::new(resolver, 53);
        let reply = if tcp {
            timeout(FORWARD_TIMEOUT, Self::exchange_tcp(upstream, &buf))
                .await
                .map_err(|_| ForwardError::Timeout)??
        } else {
            timeout(FORWARD_TIMEOUT, Self::exchange_udp(upstream, &buf))
                .await
                .map_err(|_| ForwardError::Timeout)??
        };

        let msg = Message::from_bytes(&reply)?;
        if msg.response_code() != ResponseCode::NoError {
            return Err(ForwardError::Rcode(msg.response_code()));
        }
        Ok(msg)
    }

    async fn exchange_udp(upstream: SocketAddr, request: &[u8]) -> std::io::Result<Vec<u8>> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.send_to(request, upstream).await?;
        let mut buf = vec![0u8; 4096];
        let (len, _) = socket.recv_from(&mut buf).await?;
        buf.truncate(len);
        Ok(buf)
    }

    async fn exchange_tcp(upstream: SocketAddr, request: &[u8]) -> std::io::Result<Vec<u8>> {
        let mut stream = TcpStream::connect(upstream).await?;
        stream.write_all(&(request.len() as u16).to_be_bytes()).await?;
        stream.write_all(request).await?;
        let mut len_buf = [0u8; 2];
        stream.read_exact(&mut len_buf).await?;
        let mut buf = vec![0u8; u16::from_be_bytes(len_buf) as usize];
        stream.read_exact(&mut buf).await?;
        Ok(buf)
    }

    /// Two-pass recursive forward. Returns the first NOERROR response, or
    /// None when every candidate resolver failed or was withheld.
    async fn forward(
        &self,
        qname_str: &str,
        qname: &Name,
        qtype: RecordType,
        tcp: bool,
        blocked_from_public: bool,
    ) -> Option<Message> {
        let snapshot = self.state.snapshot();
        let (private, public): (Vec<IpAddr>, Vec<IpAddr>) = snapshot
            .resolvers
            .iter()
            .copied()
            .partition(is_private_ip);

        for resolver in private {
            match Self::forward_once(resolver, qname, qtype, tcp).await {
                Ok(msg) => return Some(msg),
                Err(e) => debug!(%resolver, query = %qname_str, error = %e, "private resolver failed"),
            }
        }

        if blocked_from_public {
            return None;
        }

        for resolver in public {
            match Self::forward_once(resolver, qname, qtype, tcp).await {
                Ok(msg) => return Some(msg),
                Err(e) => debug!(%resolver, query = %qname_str, error = %e, "public resolver failed"),
            }
        }
        None
    }
}

#[async_trait]
impl RequestHandler for DnsHandler {
    async fn handle_request<R: ResponseHandler>(
        &self,
        request: &Request,
        mut response: R,
    ) -> ResponseInfo {
        let Some(query) = request.queries().first() else {
            let msg = MessageResponseBuilder::from_message_request(request)
                .error_msg(request.header(), ResponseCode::ServFail);
            return response
                .send_response(msg)
                .await
                .unwrap_or_else(|_| ResponseInfo::from(*request.header()));
        };

        let qtype = query.query_type();
        let qname_str = query
            .name()
            .to_string()
            .to_lowercase()
            .trim_matches('.')
            .to_string();
        if !self.quiet {
            info!(query = %qname_str, ?qtype, "DNS query");
        }

        let snapshot = self.state.snapshot();

        if matches!(qtype, RecordType::A | RecordType::AAAA | RecordType::PTR) {
            if let Some(values) = snapshot.table.get(&qname_str) {
                let records = self.local_records(&qname_str, qtype, values);
                self.notify.dns(&qname_str);
                return Self::send_records(request, response, ResponseCode::NoError, true, &records)
                    .await;
            }
        }

        let Ok(qname) = Name::from_ascii(format!("{qname_str}.")) else {
            let msg = MessageResponseBuilder::from_message_request(request)
                .error_msg(request.header(), ResponseCode::FormErr);
            return response
                .send_response(msg)
                .await
                .unwrap_or_else(|_| ResponseInfo::from(*request.header()));
        };

        let tcp = request.protocol() == Protocol::Tcp;
        let blocked = matches_search_domain(&qname_str, &snapshot.search_domains)
            || is_blackhole(&qname_str);

        match self.forward(&qname_str, &qname, qtype, tcp, blocked).await {
            Some(upstream) => {
                self.notify.dns(&qname_str);
                let records: Vec<Record> = upstream.answers().to_vec();
                Self::send_records(request, response, ResponseCode::NoError, false, &records).await
            }
            None => {
                if blocked {
                    Self::send_records(request, response, ResponseCode::NXDomain, true, &[]).await
                } else {
                    warn!(query = %qname_str, "no resolver answered");
                    Self::send_records(request, response, ResponseCode::ServFail, false, &[]).await
                }
            }
        }
    }
}

/// Whether the query name falls under a configured search domain.
pub fn matches_search_domain(qname: &str, domains: &[String]) -> bool {
    domains
        .iter()
        .any(|d| qname == d || qname.ends_with(&format!(".{d}")))
}

/// Whether the name is a reverse-DNS zone for a private/reserved range.
///
/// Rather than enumerating every RFC1918/CGNAT/link-local/documentation
/// zone, decode the reverse labels back into an address prefix (padding
/// missing labels with zero) and test the range directly.
pub fn is_blackhole(qname: &str) -> bool {
    if let Some(prefix) = qname.strip_suffix(".in-addr.arpa") {
        let mut octets = [0u8; 4];
        for (i, label) in prefix.rsplit('.').take(4).enumerate() {
            match label.parse::<u8>() {
                Ok(v) => octets[i] = v,
                Err(_) => return false,
            }
        }
        return is_private_ip(&IpAddr::from(octets));
    }
    if let Some(prefix) = qname.strip_suffix(".ip6.arpa") {
        let mut nibbles = [0u8; 32];
        for (i, label) in prefix.rsplit('.').take(32).enumerate() {
            match u8::from_str_radix(label, 16) {
                Ok(v) if v < 16 => nibbles[i] = v,
                _ => return false,
            }
        }
        let mut octets = [0u8; 16];
        for (i, pair) in nibbles.chunks(2).enumerate() {
            octets[i] = (pair[0] << 4) | pair[1];
        }
        return is_private_ip(&IpAddr::from(octets));
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handler() -> DnsHandler {
        let notify = Notifier::new();
        let state = Arc::new(DnsState::new(notify.clone(), true));
        DnsHandler::new(state, notify, true)
    }

    #[test]
    fn local_a_records_cover_all_v4_addresses() {
        let values = vec![
            "10.1.1.2/32".to_string(),
            "10.1.1.3/32".to_string(),
            "fd00::1/128".to_string(),
        ];
        let records = handler().local_records("alpha.eu", RecordType::A, &values);
        assert_eq!(records.len(), 2);
        for record in &records {
            assert_eq!(record.record_type(), RecordType::A);
            assert_eq!(record.ttl(), ANSWER_TTL);
            assert_eq!(record.name().to_ascii(), "alpha.eu.");
        }
    }

    #[test]
    fn local_aaaa_records_cover_only_v6() {
        let values = vec!["10.1.1.2/32".to_string(), "fd00::1/128".to_string()];
        let records = handler().local_records("alpha.eu", RecordType::AAAA, &values);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].record_type(), RecordType::AAAA);
    }

    #[test]
    fn local_ptr_answers_with_stored_target() {
        let values = vec!["alpha-gw".to_string()];
        let records = handler().local_records("2.1.1.10.in-addr.arpa", RecordType::PTR, &values);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].record_type(), RecordType::PTR);
        assert_eq!(records[0].ttl(), ANSWER_TTL);
    }

    #[test]
    fn local_records_empty_table_entry() {
        assert!(handler()
            .local_records("alpha.eu", RecordType::A, &[])
            .is_empty());
    }

    #[test]
    fn blackhole_covers_private_v4_reverse_zones() {
        assert!(is_blackhole("10.in-addr.arpa"));
        assert!(is_blackhole("2.1.1.10.in-addr.arpa"));
        assert!(is_blackhole("168.192.in-addr.arpa"));
        assert!(is_blackhole("16.172.in-addr.arpa"));
        assert!(is_blackhole("31.172.in-addr.arpa"));
        assert!(is_blackhole("64.100.in-addr.arpa"));
        assert!(is_blackhole("254.169.in-addr.arpa"));
        assert!(is_blackhole("113.0.203.in-addr.arpa"));
    }

    #[test]
    fn blackhole_passes_public_v4_reverse_zones() {
        assert!(!is_blackhole("8.8.8.8.in-addr.arpa"));
        assert!(!is_blackhole("1.1.1.in-addr.arpa"));
        assert!(!is_blackhole("example.com"));
    }

    #[test]
    fn blackhole_covers_private_v6_reverse_zones() {
        // fd00::/8 (ULA)
        assert!(is_blackhole("d.f.ip6.arpa"));
        // fe80::/10 (link-local)
        assert!(is_blackhole("8.e.f.ip6.arpa"));
        // 2001:db8::/32 (documentation)
        assert!(is_blackhole("8.b.d.0.1.0.0.2.ip6.arpa"));
        // 2606::/16 is public space
        assert!(!is_blackhole("6.0.6.2.ip6.arpa"));
    }

    #[test]
    fn blackhole_rejects_malformed_labels() {
        assert!(!is_blackhole("not-a-number.in-addr.arpa"));
        assert!(!is_blackhole("zz.ip6.arpa"));
    }

    #[test]
    fn search_domain_suffix_matching() {
        let domains = vec!["eu".to_string(), "corp.internal".to_string()];
        assert!(matches_search_domain("eu", &domains));
        assert!(matches_search_domain("alpha.eu", &domains));
        assert!(matches_search_domain("db.corp.internal", &domains));
        assert!(!matches_search_domain("corp.internal.example.com", &domains));
        assert!(!matches_search_domain("example.eu.com", &domains));
    }
}
