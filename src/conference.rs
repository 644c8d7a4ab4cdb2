//! WebSocket signaling relay for small WebRTC conference rooms.
//!
//! A standalone hub: it holds no references to the reconciler or the server
//! registry. Mobile clients on the VPN connect to `/room/{roomId}`, get a
//! peer ID, and exchange offer/answer/ICE envelopes relayed by `to`. Rooms
//! cap at five peers; per-peer outbound buffers drop on overflow rather
//! than ever blocking the hub.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

const LISTEN_ADDR: &str = "0.0.0.0:3000";
const MAX_PEERS_PER_ROOM: usize = 5;
const SEND_BUFFER: usize = 64;
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Envelope for all signaling traffic in both directions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(rename = "peerId", skip_serializing_if = "Option::is_none")]
    pub peer_id: Option<String>,
    #[serde(rename = "existingPeers", skip_serializing_if = "Option::is_none")]
    pub existing_peers: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl SignalMessage {
    fn event(kind: &str, peer_id: &str) -> Self {
        Self {
            kind: kind.into(),
            peer_id: Some(peer_id.into()),
            ..Default::default()
        }
    }

    fn error(message: &str) -> Self {
        Self {
            kind: "error".into(),
            message: Some(message.into()),
            ..Default::default()
        }
    }
}

type PeerSender = mpsc::Sender<String>;

struct Room {
    id: String,
    peers: RwLock<HashMap<String, PeerSender>>,
}

impl Room {
    fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            peers: RwLock::new(HashMap::new()),
        }
    }

    fn add(&self, peer_id: &str, tx: PeerSender) -> bool {
        let mut peers = self.peers.write();
        if peers.len() >= MAX_PEERS_PER_ROOM {
            return false;
        }
        peers.insert(peer_id.to_string(), tx);
        true
    }

    fn remove(&self, peer_id: &str) {
        self.peers.write().remove(peer_id);
    }

    fn len(&self) -> usize {
        self.peers.read().len()
    }

    fn peer_ids(&self, exclude: &str) -> Vec<String> {
        self.peers
            .read()
            .keys()
            .filter(|id| id.as_str() != exclude)
            .cloned()
            .collect()
    }

    /// Enqueue for every peer except `exclude`; overflow drops with a
    /// warning so one slow client cannot stall the room.
    fn broadcast(&self, msg: &SignalMessage, exclude: &str) {
        let Ok(text) = serde_json::to_string(msg) else {
            return;
        };
        for (id, tx) in self.peers.read().iter() {
            if id == exclude {
                continue;
            }
            if tx.try_send(text.clone()).is_err() {
                warn!(room = %self.id, peer = %id, "send buffer full, dropping broadcast");
            }
        }
    }

    /// Enqueue for a single peer.
    fn relay(&self, to: &str, msg: &SignalMessage) {
        let peers = self.peers.read();
        let Some(tx) = peers.get(to) else {
            warn!(room = %self.id, peer = %to, "relay target not found");
            return;
        };
        let Ok(text) = serde_json::to_string(msg) else {
            return;
        };
        if tx.try_send(text).is_err() {
            warn!(room = %self.id, peer = %to, "send buffer full, dropping relay");
        }
    }
}

#[derive(Default)]
struct Hub {
    rooms: DashMap<String, Arc<Room>>,
}

impl Hub {
    fn get_or_create(&self, id: &str) -> Arc<Room> {
        self.rooms
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Room::new(id)))
            .clone()
    }

    fn cleanup(&self, id: &str) {
        let remove = self
            .rooms
            .get(id)
            .map(|room| room.len() == 0)
            .unwrap_or(false);
        if remove {
            self.rooms.remove(id);
            info!(room = %id, "room closed");
        }
    }
}

pub async fn serve(mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
    let hub = Arc::new(Hub::default());
    let app = Router::new()
        .route("/room/{room_id}", get(upgrade))
        .with_state(hub);
    let listener = tokio::net::TcpListener::bind(LISTEN_ADDR).await?;
    info!(addr = %LISTEN_ADDR, "conference signaling listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await?;
    Ok(())
}

async fn upgrade(
    State(hub): State<Arc<Hub>>,
    Path(room_id): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_peer(hub, room_id, socket))
}

fn new_peer_id() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

async fn handle_peer(hub: Arc<Hub>, room_id: String, mut socket: WebSocket) {
    let room_id = crate::util::sanitize(&room_id);
    if room_id.is_empty() {
        let _ = socket
            .send(WsMessage::Text(
                serde_json::to_string(&SignalMessage::error("invalid room ID"))
                    .unwrap_or_default()
                    .into(),
            ))
            .await;
        return;
    }

    let peer_id = new_peer_id();
    let (tx, mut rx) = mpsc::channel::<String>(SEND_BUFFER);
    let room = hub.get_or_create(&room_id);

    if !room.add(&peer_id, tx) {
        info!(room = %room_id, "peer rejected, room is full");
        let _ = socket
            .send(WsMessage::Text(
                serde_json::to_string(&SignalMessage::error("room is full"))
                    .unwrap_or_default()
                    .into(),
            ))
            .await;
        let _ = socket.send(WsMessage::Close(None)).await;
        return;
    }

    info!(
        room = %room_id,
        peer = %peer_id,
        count = room.len(),
        "peer joined"
    );

    let (mut sink, mut stream) = socket.split();

    // All outbound traffic funnels through one writer task so the ping
    // timer and the relay queue never contend on the sink.
    let writer = tokio::spawn(async move {
        let mut ping = tokio::time::interval(PING_INTERVAL);
        ping.tick().await;
        loop {
            tokio::select! {
                msg = rx.recv() => match msg {
                    Some(text) => {
                        if sink.send(WsMessage::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
                _ = ping.tick() => {
                    if sink.send(WsMessage::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
        let _ = sink.close().await;
    });

    let joined = SignalMessage {
        kind: "joined".into(),
        peer_id: Some(peer_id.clone()),
        existing_peers: Some(room.peer_ids(&peer_id)),
        ..Default::default()
    };
    room.relay(&peer_id, &joined);
    room.broadcast(&SignalMessage::event("peer-joined", &peer_id), &peer_id);

    while let Some(Ok(msg)) = stream.next().await {
        match msg {
            WsMessage::Text(text) => {
                let Ok(mut envelope) = serde_json::from_str::<SignalMessage>(&text) else {
                    warn!(room = %room_id, peer = %peer_id, "invalid JSON envelope");
                    continue;
                };
                envelope.from = Some(peer_id.clone());
                match envelope.kind.as_str() {
                    "offer" | "answer" | "ice-candidate" => {
                        let Some(to) = envelope.to.clone() else {
                            warn!(room = %room_id, peer = %peer_id, kind = %envelope.kind, "missing 'to' field");
                            continue;
                        };
                        room.relay(&to, &envelope);
                    }
                    "leave" => break,
                    other => {
                        debug!(room = %room_id, peer = %peer_id, kind = %other, "unknown message type");
                    }
                }
            }
            WsMessage::Close(_) => break,
            _ => {}
        }
    }

    room.remove(&peer_id);
    room.broadcast(&SignalMessage::event("peer-left", &peer_id), &peer_id);
    hub.cleanup(&room_id);
    writer.abort();
    info!(room = %room_id, peer = %peer_id, "peer left");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> (PeerSender, mpsc::Receiver<String>) {
        mpsc::channel(SEND_BUFFER)
    }

    #[test]
    fn sixth_peer_is_rejected() {
        let room = Room::new("r1");
        let mut receivers = Vec::new();
        for i in 0..5 {
            let (tx, rx) = peer();
            assert!(room.add(&format!("p{i}"), tx));
            receivers.push(rx);
        }
        let (tx, _rx) = peer();
        assert!(!room.add("p5", tx));
        assert_eq!(room.len(), 5);
    }

    #[test]
    fn departure_frees_a_slot() {
        let room = Room::new("r1");
        let mut receivers = Vec::new();
        for i in 0..5 {
            let (tx, rx) = peer();
            room.add(&format!("p{i}"), tx);
            receivers.push(rx);
        }
        room.remove("p0");
        let (tx, _rx) = peer();
        assert!(room.add("p5", tx));
    }

    #[tokio::test]
    async fn broadcast_excludes_sender() {
        let room = Room::new("r1");
        let (tx_a, mut rx_a) = peer();
        let (tx_b, mut rx_b) = peer();
        room.add("a", tx_a);
        room.add("b", tx_b);

        room.broadcast(&SignalMessage::event("peer-joined", "a"), "a");

        let got = rx_b.try_recv().unwrap();
        let envelope: SignalMessage = serde_json::from_str(&got).unwrap();
        assert_eq!(envelope.kind, "peer-joined");
        assert_eq!(envelope.peer_id.as_deref(), Some("a"));
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn relay_reaches_only_target() {
        let room = Room::new("r1");
        let (tx_a, mut rx_a) = peer();
        let (tx_b, mut rx_b) = peer();
        room.add("a", tx_a);
        room.add("b", tx_b);

        let mut offer = SignalMessage {
            kind: "offer".into(),
            to: Some("b".into()),
            payload: Some(serde_json::json!({"sdp": "v=0"})),
            ..Default::default()
        };
        offer.from = Some("a".into());
        room.relay("b", &offer);

        let got: SignalMessage = serde_json::from_str(&rx_b.try_recv().unwrap()).unwrap();
        assert_eq!(got.kind, "offer");
        assert_eq!(got.from.as_deref(), Some("a"));
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn overflow_drops_instead_of_blocking() {
        let room = Room::new("r1");
        let (tx, mut rx) = mpsc::channel::<String>(1);
        room.add("slow", tx);

        room.broadcast(&SignalMessage::event("peer-joined", "x"), "");
        // Buffer is full now; the second broadcast must not block.
        room.broadcast(&SignalMessage::event("peer-joined", "y"), "");

        let first: SignalMessage = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(first.peer_id.as_deref(), Some("x"));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn peer_ids_are_sixteen_hex_chars() {
        let id = new_peer_id();
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, new_peer_id());
    }

    #[test]
    fn empty_rooms_are_garbage_collected() {
        let hub = Hub::default();
        let room = hub.get_or_create("r1");
        let (tx, _rx) = peer();
        room.add("a", tx);
        hub.cleanup("r1");
        assert!(hub.rooms.contains_key("r1"));
        room.remove("a");
        hub.cleanup("r1");
        assert!(!hub.rooms.contains_key("r1"));
    }

    #[test]
    fn envelope_uses_wire_field_names() {
        let msg = SignalMessage {
            kind: "joined".into(),
            peer_id: Some("abc".into()),
            existing_peers: Some(vec!["def".into()]),
            ..Default::default()
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "joined");
        assert_eq!(json["peerId"], "abc");
        assert_eq!(json["existingPeers"][0], "def");
        assert!(json.get("to").is_none());
    }
}
