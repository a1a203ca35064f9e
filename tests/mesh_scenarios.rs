//! End-to-end mesh scenarios over an in-memory transport hub.
//!
//! Each node runs a full router; the hub delivers queued frames between
//! adjacent nodes deterministically, with no background tasks.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::mpsc;

use bitchat_mesh::crypto::BitchatIdentity;
use bitchat_mesh::error::Result;
use bitchat_mesh::mesh::{MeshEvent, MeshRouter};
use bitchat_mesh::protocol::binary::BinaryProtocol;
use bitchat_mesh::protocol::tlv::{ChatMessage, MessageContent};
use bitchat_mesh::protocol::{BitchatPacket, PeerId, PACKET_TYPE_MESSAGE};
use bitchat_mesh::session::should_initiate_with_key;
use bitchat_mesh::transport::{Transport, TransportAddress, TransportId};
use bitchat_mesh::ProtocolConfig;

/// Frame queued by a node's transport, waiting for the hub to move it
#[derive(Debug, Clone)]
enum OutFrame {
    Broadcast(Vec<u8>),
    Unicast(TransportAddress, Vec<u8>),
}

/// Transport that queues frames for the test hub
struct HubTransport {
    queue: Mutex<VecDeque<OutFrame>>,
}

impl HubTransport {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(VecDeque::new()),
        })
    }

    fn drain(&self) -> Vec<OutFrame> {
        self.queue.lock().drain(..).collect()
    }
}

#[async_trait]
impl Transport for HubTransport {
    fn name(&self) -> &str {
        "hub"
    }

    async fn send(&self, address: &TransportAddress, data: &[u8]) -> Result<()> {
        self.queue
            .lock()
            .push_back(OutFrame::Unicast(address.clone(), data.to_vec()));
        Ok(())
    }

    async fn broadcast(&self, data: &[u8]) -> Result<()> {
        self.queue
            .lock()
            .push_back(OutFrame::Broadcast(data.to_vec()));
        Ok(())
    }
}

struct Node {
    router: Arc<MeshRouter>,
    events: mpsc::UnboundedReceiver<MeshEvent>,
    identity: Arc<BitchatIdentity>,
    transport: Arc<HubTransport>,
    transport_id: TransportId,
}

impl Node {
    async fn new(config: ProtocolConfig) -> Self {
        let identity = Arc::new(BitchatIdentity::generate());
        let (router, events) = MeshRouter::new(config, Arc::clone(&identity));
        let transport = HubTransport::new();
        let transport_id = router.attach_transport(transport.clone()).await;
        Self {
            router,
            events,
            identity,
            transport,
            transport_id,
        }
    }

    fn peer_id(&self) -> PeerId {
        self.identity.peer_id()
    }

    fn drain_events(&mut self) -> Vec<MeshEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }
}

fn addr(name: &str) -> TransportAddress {
    TransportAddress::Bluetooth(name.to_string())
}

/// Move frames between adjacent nodes until the mesh goes quiet
async fn pump(nodes: &mut HashMap<&'static str, Node>, edges: &[(&'static str, &'static str)]) {
    let neighbors = |name: &str| -> Vec<&'static str> {
        edges
            .iter()
            .filter_map(|(a, b)| {
                if *a == name {
                    Some(*b)
                } else if *b == name {
                    Some(*a)
                } else {
                    None
                }
            })
            .collect()
    };

    loop {
        let mut moved = false;
        let names: Vec<&'static str> = nodes.keys().copied().collect();
        for from in names {
            let frames = nodes[from].transport.drain();
            for frame in frames {
                moved = true;
                match frame {
                    OutFrame::Broadcast(bytes) => {
                        for to in neighbors(from) {
                            let node = nodes.get(to).unwrap();
                            node.router
                                .handle_frame(node.transport_id, addr(from), &bytes)
                                .await;
                        }
                    }
                    OutFrame::Unicast(address, bytes) => {
                        let TransportAddress::Bluetooth(target) = &address else {
                            panic!("unexpected address type");
                        };
                        if let Some((to, node)) = nodes.get_key_value(target.as_str()) {
                            assert!(
                                neighbors(from).contains(to),
                                "unicast to non-neighbor {}",
                                to
                            );
                            node.router
                                .handle_frame(node.transport_id, addr(from), &bytes)
                                .await;
                        }
                    }
                }
            }
        }
        if !moved {
            return;
        }
    }
}

/// Announce both ways so each side binds the other's peer ID to its link
async fn introduce(nodes: &mut HashMap<&'static str, Node>, edges: &[(&'static str, &'static str)]) {
    let names: Vec<&'static str> = nodes.keys().copied().collect();
    for name in names {
        nodes[name].router.send_announce(name).await.unwrap();
    }
    pump(nodes, edges).await;
    for node in nodes.values_mut() {
        node.drain_events();
    }
}

fn chat_frame(sender: PeerId, timestamp: u64, ttl: u8, content: &str) -> Vec<u8> {
    let message = ChatMessage::plain("ext".into(), content.into());
    let mut packet = BitchatPacket::new(PACKET_TYPE_MESSAGE, sender, message.encode().unwrap())
        .with_ttl(ttl);
    packet.timestamp = timestamp;
    BinaryProtocol::encode(&packet).unwrap()
}

fn received_texts(events: &[MeshEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|event| match event {
            MeshEvent::MessageReceived { message, .. } => match &message.content {
                MessageContent::Plain(text) => Some(text.clone()),
                MessageContent::Channel { .. } => None,
            },
            _ => None,
        })
        .collect()
}

/// S1: two nodes handshake (tie-breaker picks the initiator) and exchange
/// an end-to-end encrypted private message.
#[tokio::test]
async fn two_node_private_exchange() {
    let edges = [("A", "B")];
    let mut nodes = HashMap::new();
    nodes.insert("A", Node::new(ProtocolConfig::default()).await);
    nodes.insert("B", Node::new(ProtocolConfig::default()).await);
    introduce(&mut nodes, &edges).await;

    let a_peer = nodes["A"].peer_id();
    let b_peer = nodes["B"].peer_id();

    // Exactly one side initiates
    let a_started = nodes["A"].router.connect_peer(b_peer).await.unwrap();
    let b_started = nodes["B"].router.connect_peer(a_peer).await.unwrap();
    assert_ne!(a_started, b_started, "tie-breaker must pick one initiator");

    pump(&mut nodes, &edges).await;
    assert!(nodes["A"].router.sessions().is_established(&b_peer).await);
    assert!(nodes["B"].router.sessions().is_established(&a_peer).await);

    // Mutual static keys
    assert_eq!(
        nodes["A"].router.sessions().remote_static_public(&b_peer).await,
        Some(nodes["B"].identity.noise_keypair.public_bytes())
    );
    assert_eq!(
        nodes["B"].router.sessions().remote_static_public(&a_peer).await,
        Some(nodes["A"].identity.noise_keypair.public_bytes())
    );

    nodes.get_mut("A").unwrap().drain_events();
    nodes.get_mut("B").unwrap().drain_events();

    // Private "hello" delivered only to B
    nodes["A"]
        .router
        .send_private_message(b_peer, "alice", "hello")
        .await
        .unwrap();
    pump(&mut nodes, &edges).await;

    let delivered = nodes.get_mut("B").unwrap().drain_events();
    let private: Vec<_> = delivered
        .iter()
        .filter_map(|event| match event {
            MeshEvent::PrivateMessageReceived { from, message } => Some((from, message)),
            _ => None,
        })
        .collect();
    assert_eq!(private.len(), 1);
    assert_eq!(*private[0].0, a_peer);
    assert_eq!(private[0].1.content, "hello");
}

/// Tie-breaker literals from the protocol contract: 01.. initiates toward
/// 02.., never the reverse.
#[test]
fn tie_breaker_is_deterministic() {
    let low = [0x01u8; 32];
    let high = [0x02u8; 32];
    assert!(should_initiate_with_key(&low, &high));
    assert!(!should_initiate_with_key(&high, &low));
}

/// S3: TTL-bounded relay along a line A - B - C - D. A sends at TTL 2;
/// B and C see it, D never does.
#[tokio::test]
async fn relay_with_ttl_budget() {
    let edges = [("A", "B"), ("B", "C"), ("C", "D")];
    let mut nodes = HashMap::new();
    let config_ttl2 = ProtocolConfig {
        initial_ttl: 2,
        ..Default::default()
    };
    nodes.insert("A", Node::new(config_ttl2).await);
    nodes.insert("B", Node::new(ProtocolConfig::default()).await);
    nodes.insert("C", Node::new(ProtocolConfig::default()).await);
    nodes.insert("D", Node::new(ProtocolConfig::default()).await);
    introduce(&mut nodes, &edges).await;

    nodes["A"].router.broadcast_message("alice", "hi").await.unwrap();
    pump(&mut nodes, &edges).await;

    assert_eq!(
        received_texts(&nodes.get_mut("B").unwrap().drain_events()),
        vec!["hi"]
    );
    assert_eq!(
        received_texts(&nodes.get_mut("C").unwrap().drain_events()),
        vec!["hi"]
    );
    assert!(
        received_texts(&nodes.get_mut("D").unwrap().drain_events()).is_empty(),
        "TTL must stop the packet before D"
    );
}

/// S4: five copies of the same packet converge on one node; it delivers
/// once and the seen-set grows by one.
#[tokio::test]
async fn dedup_under_flood() {
    let mut nodes = HashMap::new();
    nodes.insert("X", Node::new(ProtocolConfig::default()).await);
    let x = nodes.get_mut("X").unwrap();

    let frame = chat_frame([9u8; 8], 1_700_000_000_000, 5, "once");
    for relay in 0..5 {
        let from = format!("relay-{}", relay);
        x.router
            .handle_frame(x.transport_id, TransportAddress::Bluetooth(from), &frame)
            .await;
    }

    assert_eq!(received_texts(&x.drain_events()), vec!["once"]);
}

/// S5: GCS reconciliation. B holds 100 packets, A holds 96 of them; one
/// sync round replays (modulo rare false positives) the 4 missing ones to
/// A and nothing else.
#[tokio::test]
async fn gcs_sync_reconciliation() {
    let edges = [("A", "B")];
    let mut nodes = HashMap::new();
    nodes.insert("A", Node::new(ProtocolConfig::default()).await);
    nodes.insert("B", Node::new(ProtocolConfig::default()).await);
    introduce(&mut nodes, &edges).await;

    let external: PeerId = [5u8; 8];
    let frames: Vec<Vec<u8>> = (1..=100u64)
        .map(|n| chat_frame(external, 1_700_000_000_000 + n, 1, &format!("msg {}", n)))
        .collect();

    // B holds 1..=100
    for frame in &frames {
        let b = &nodes["B"];
        b.router.handle_frame(b.transport_id, addr("ext"), frame).await;
    }
    // A holds 1..=90 and 95..=100
    for (i, frame) in frames.iter().enumerate() {
        let n = i + 1;
        if n <= 90 || n >= 95 {
            let a = &nodes["A"];
            a.router.handle_frame(a.transport_id, addr("ext"), frame).await;
        }
    }
    for node in nodes.values_mut() {
        node.drain_events();
        node.transport.drain();
    }

    // A summarizes its seen-set and asks B for the difference
    nodes["A"].router.run_sync_round().await;
    pump(&mut nodes, &edges).await;

    let replayed = received_texts(&nodes.get_mut("A").unwrap().drain_events());
    assert!(
        replayed.len() >= 3,
        "expected the missing packets back, got {:?}",
        replayed
    );
    for text in &replayed {
        let n: u64 = text.strip_prefix("msg ").unwrap().parse().unwrap();
        assert!((91..=94).contains(&n), "replayed packet {} was not missing", n);
    }
    assert!(received_texts(&nodes.get_mut("B").unwrap().drain_events()).is_empty());
}

/// S6: both sides race to handshake; the tie-breaker lets exactly one
/// proceed and the mesh still converges to one established session pair.
#[tokio::test]
async fn handshake_storm_resolved() {
    let edges = [("A", "B")];
    let mut nodes = HashMap::new();
    nodes.insert("A", Node::new(ProtocolConfig::default()).await);
    nodes.insert("B", Node::new(ProtocolConfig::default()).await);
    introduce(&mut nodes, &edges).await;

    let a_peer = nodes["A"].peer_id();
    let b_peer = nodes["B"].peer_id();

    // Both queue a connect at the same instant
    let a_started = nodes["A"].router.connect_peer(b_peer).await.unwrap();
    let b_started = nodes["B"].router.connect_peer(a_peer).await.unwrap();
    assert!(a_started ^ b_started);

    pump(&mut nodes, &edges).await;

    assert!(nodes["A"].router.sessions().is_established(&b_peer).await);
    assert!(nodes["B"].router.sessions().is_established(&a_peer).await);

    // And traffic flows both ways afterwards
    nodes["A"]
        .router
        .send_private_message(b_peer, "alice", "post-storm")
        .await
        .unwrap();
    nodes["B"]
        .router
        .send_private_message(a_peer, "bob", "ack")
        .await
        .unwrap();
    pump(&mut nodes, &edges).await;

    assert!(nodes
        .get_mut("B")
        .unwrap()
        .drain_events()
        .iter()
        .any(|event| matches!(event, MeshEvent::PrivateMessageReceived { .. })));
    assert!(nodes
        .get_mut("A")
        .unwrap()
        .drain_events()
        .iter()
        .any(|event| matches!(event, MeshEvent::PrivateMessageReceived { .. })));
}

/// Delivery acks ride the encrypted channel back to the sender.
#[tokio::test]
async fn delivery_ack_round_trip() {
    let edges = [("A", "B")];
    let mut nodes = HashMap::new();
    nodes.insert("A", Node::new(ProtocolConfig::default()).await);
    nodes.insert("B", Node::new(ProtocolConfig::default()).await);
    introduce(&mut nodes, &edges).await;

    let a_peer = nodes["A"].peer_id();
    let b_peer = nodes["B"].peer_id();
    nodes["A"].router.connect_peer(b_peer).await.unwrap();
    nodes["B"].router.connect_peer(a_peer).await.unwrap();
    pump(&mut nodes, &edges).await;

    let message_id = nodes["A"]
        .router
        .send_private_message(b_peer, "alice", "need an ack")
        .await
        .unwrap();
    pump(&mut nodes, &edges).await;
    nodes.get_mut("B").unwrap().drain_events();

    nodes["B"]
        .router
        .send_delivery_ack(a_peer, message_id)
        .await
        .unwrap();
    pump(&mut nodes, &edges).await;

    let acked = nodes.get_mut("A").unwrap().drain_events().iter().any(
        |event| matches!(event, MeshEvent::DeliveryAckReceived { message_id: id, .. } if *id == message_id),
    );
    assert!(acked);
}
