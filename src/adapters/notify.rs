//! Fire-and-forget notifications to the co-located GUI agent.
//!
//! The agent listens for UDP datagrams on the loopback interface. Delivery
//! is best-effort; a missing agent just means the datagram goes nowhere.
//! Consecutive duplicates are suppressed here so callers don't have to.

use std::net::UdpSocket;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::info;

const AGENT_ADDR: &str = "127.0.0.1:25265";

#[derive(Clone, Default)]
pub struct Notifier {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    last_info: Mutex<String>,
    last_dns: Mutex<String>,
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// User-visible event ("Network alpha has been removed", ...).
    pub fn info(&self, message: &str) {
        {
            let mut last = self.inner.last_info.lock();
            if *last == message {
                return;
            }
            *last = message.to_string();
        }
        info!("notification: {message}");
        send(message.as_bytes());
    }

    /// Answered DNS query, surfaced so the GUI can show live lookups.
    pub fn dns(&self, query: &str) {
        {
            let mut last = self.inner.last_dns.lock();
            if *last == query {
                return;
            }
            *last = query.to_string();
        }
        send(format!("dns:{query}").as_bytes());
    }
}

fn send(payload: &[u8]) {
    if let Ok(socket) = UdpSocket::bind("127.0.0.1:0") {
        let _ = socket.send_to(payload, AGENT_ADDR);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consecutive_duplicates_are_suppressed() {
        let listener = UdpSocket::bind("127.0.0.1:25265");
        // Another process may own the agent port; the dedup state is still
        // observable through the internal slot.
        let notifier = Notifier::new();
        notifier.info("Network alpha has been removed");
        notifier.info("Network alpha has been removed");
        notifier.info("Network beta has been removed");
        assert_eq!(
            *notifier.inner.last_info.lock(),
            "Network beta has been removed"
        );
        drop(listener);
    }

    #[test]
    fn dns_and_info_dedup_independently() {
        let notifier = Notifier::new();
        notifier.info("alpha.eu");
        notifier.dns("alpha.eu");
        assert_eq!(*notifier.inner.last_info.lock(), "alpha.eu");
        assert_eq!(*notifier.inner.last_dns.lock(), "alpha.eu");
    }
}
