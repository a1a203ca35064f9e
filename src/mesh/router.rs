//! Mesh router: deduplicate, verify, deliver, relay.
//!
//! Inbound frames run through decode, seen-set dedup, signature checks,
//! fragment reassembly, then either local delivery (directed to this node)
//! or TTL-gated relay on every transport except the ingress. Outbound
//! packets are stamped, fragmented when oversized, recorded in the
//! seen-set, and flooded.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use super::cache::{CachedPacket, PacketCache};
use super::seen::SeenSet;
use super::sync::SyncEngine;
use super::MeshEvent;
use crate::config::ProtocolConfig;
use crate::crypto::{BitchatIdentity, ChannelCipher};
use crate::error::{Error, Result};
use crate::protocol::binary::BinaryProtocol;
use crate::protocol::fragmentation::{
    Fragment, MessageFragmenter, MessageReassembler, FRAGMENT_HEADER_SIZE,
};
use crate::protocol::tlv::{
    ChatMessage, FilePayload, IdentityAnnouncement, MessageContent, NoisePayload, PrivateMessage,
    RequestSyncPayload,
};
use crate::protocol::{
    BitchatPacket, PeerId, PACKET_TYPE_ANNOUNCE, PACKET_TYPE_FILE, PACKET_TYPE_FRAGMENT,
    PACKET_TYPE_LEAVE, PACKET_TYPE_MESSAGE, PACKET_TYPE_NOISE_ENCRYPTED,
    PACKET_TYPE_NOISE_HANDSHAKE_FINAL, PACKET_TYPE_NOISE_HANDSHAKE_INIT,
    PACKET_TYPE_NOISE_HANDSHAKE_RESP, PACKET_TYPE_REQUEST_SYNC,
};
use crate::session::{NoiseSessionManager, SessionEvent};
use crate::transport::{Transport, TransportAddress, TransportEvent, TransportId};

/// TTL byte offset within the serialized header; relays patch it in place
const TTL_OFFSET: usize = 2;

/// Identity of a peer learned from a verified announce
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub nickname: String,
    pub noise_public: [u8; 32],
    pub signing_public: Option<[u8; 32]>,
    pub features: Option<u32>,
    pub last_seen: u64,
}

/// One connected link on some transport
#[derive(Debug, Clone)]
struct LinkInfo {
    transport: TransportId,
    peer_id: Option<PeerId>,
    #[allow(dead_code)]
    connected_at: Instant,
}

/// Mesh router coordinating transports, sessions, and delivery
pub struct MeshRouter {
    config: ProtocolConfig,
    identity: Arc<BitchatIdentity>,
    local_peer_id: PeerId,
    sessions: Arc<NoiseSessionManager>,
    sync: SyncEngine,
    seen: Mutex<SeenSet>,
    cache: Mutex<PacketCache>,
    reassembler: Mutex<MessageReassembler>,
    peers: RwLock<HashMap<PeerId, PeerInfo>>,
    links: RwLock<HashMap<TransportAddress, LinkInfo>>,
    transports: RwLock<Vec<Arc<dyn Transport>>>,
    events: mpsc::UnboundedSender<MeshEvent>,
    session_events: Mutex<Option<mpsc::UnboundedReceiver<SessionEvent>>>,
}

impl MeshRouter {
    pub fn new(
        config: ProtocolConfig,
        identity: Arc<BitchatIdentity>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<MeshEvent>) {
        let (sessions, session_events) = NoiseSessionManager::new(
            Arc::clone(&identity),
            config.max_sessions,
            config.pending_handshake_timeout,
        );
        let (events, receiver) = mpsc::unbounded_channel();
        let local_peer_id = identity.peer_id();

        let router = Arc::new(Self {
            seen: Mutex::new(SeenSet::new(config.seen_capacity)),
            cache: Mutex::new(PacketCache::new(config.packet_cache_size)),
            reassembler: Mutex::new(MessageReassembler::new(config.fragment_timeout)),
            sync: SyncEngine::new(config.sync.clone()),
            sessions: Arc::new(sessions),
            identity,
            local_peer_id,
            config,
            peers: RwLock::new(HashMap::new()),
            links: RwLock::new(HashMap::new()),
            transports: RwLock::new(Vec::new()),
            events,
            session_events: Mutex::new(Some(session_events)),
        });

        (router, receiver)
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    pub fn sessions(&self) -> &Arc<NoiseSessionManager> {
        &self.sessions
    }

    pub async fn known_peers(&self) -> HashMap<PeerId, PeerInfo> {
        self.peers.read().await.clone()
    }

    /// Register a transport for fan-out; returns its ID
    pub async fn attach_transport(&self, transport: Arc<dyn Transport>) -> TransportId {
        let mut transports = self.transports.write().await;
        transports.push(transport);
        transports.len() - 1
    }

    /// Spawn the periodic duties: session cleanup, fragment expiry, sync
    pub fn start(self: &Arc<Self>) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = Vec::new();

        handles.push(self.sessions.spawn_cleanup_task(self.config.cleanup_interval));

        let router = Arc::clone(self);
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(router.config.cleanup_interval);
            loop {
                ticker.tick().await;
                router.reassembler.lock().cleanup_expired();
            }
        }));

        let router = Arc::clone(self);
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(router.config.sync.interval);
            loop {
                ticker.tick().await;
                router.run_sync_round().await;
            }
        }));

        // Forward session lifecycle events into the mesh event stream
        if let Some(mut session_events) = self.session_events.lock().take() {
            let router = Arc::clone(self);
            handles.push(tokio::spawn(async move {
                while let Some(event) = session_events.recv().await {
                    let mapped = match event {
                        SessionEvent::Established {
                            peer_id,
                            remote_static_public,
                        } => MeshEvent::SessionEstablished {
                            peer_id,
                            remote_static_public,
                        },
                        SessionEvent::Failed { peer_id, reason } => {
                            MeshEvent::SessionFailed { peer_id, reason }
                        }
                    };
                    if router.events.send(mapped).is_err() {
                        break;
                    }
                }
            }));
        }

        info!(peer = %hex::encode(self.local_peer_id), "Mesh router started");
        handles
    }

    /// Feed a transport event into the router
    pub async fn handle_transport_event(&self, transport: TransportId, event: TransportEvent) {
        match event {
            TransportEvent::Connected { address } => {
                debug!(%address, "Link connected");
                self.links.write().await.insert(
                    address,
                    LinkInfo {
                        transport,
                        peer_id: None,
                        connected_at: Instant::now(),
                    },
                );
            }
            TransportEvent::Disconnected { address, reason } => {
                debug!(%address, %reason, "Link disconnected");
                let link = self.links.write().await.remove(&address);
                if let Some(LinkInfo {
                    peer_id: Some(peer_id),
                    ..
                }) = link
                {
                    self.sessions.remove_session(&peer_id).await;
                    let _ = self.events.send(MeshEvent::PeerDisconnected { peer_id });
                }
            }
            TransportEvent::DataReceived { address, data } => {
                self.handle_frame(transport, address, &data).await;
            }
        }
    }

    /// Process one inbound frame. Malformed or duplicate input is dropped
    /// silently; nothing here replies to unparseable bytes.
    pub async fn handle_frame(&self, transport: TransportId, address: TransportAddress, data: &[u8]) {
        let mut current = data.to_vec();
        let mut from_reassembly = false;

        loop {
            let packet = match BinaryProtocol::decode(&current) {
                Ok(packet) => packet,
                Err(e) => {
                    trace!(%address, "Dropping undecodable frame: {}", e);
                    return;
                }
            };

            let packet_id = packet.packet_id();
            if !self.seen.lock().insert(packet_id) {
                trace!(%address, "Dropping duplicate packet");
                return;
            }
            self.cache.lock().insert(
                packet_id,
                CachedPacket::new(
                    current.clone(),
                    packet.packet_type,
                    packet.timestamp,
                    &packet.payload,
                ),
            );

            if !self.verify_and_bind(&packet, transport, &address).await {
                return;
            }

            if packet.packet_type == PACKET_TYPE_FRAGMENT {
                // Fragments relay as-is; the reassembled packet is only
                // delivered locally (its pieces already flooded).
                if !from_reassembly {
                    self.relay(&current, packet.ttl, transport).await;
                }
                let completed = {
                    let fragment = match Fragment::from_wire_format(&packet.payload) {
                        Ok(fragment) => fragment,
                        Err(e) => {
                            trace!(%address, "Dropping invalid fragment: {}", e);
                            return;
                        }
                    };
                    match self.reassembler.lock().add_fragment(packet.sender_id, fragment) {
                        Ok(completed) => completed,
                        Err(e) => {
                            trace!(%address, "Dropping fragment: {}", e);
                            return;
                        }
                    }
                };
                match completed {
                    Some((bytes, _original_type)) => {
                        current = bytes;
                        from_reassembly = true;
                        continue;
                    }
                    None => return,
                }
            }

            match packet.recipient_id {
                Some(recipient) if recipient == self.local_peer_id => {
                    self.deliver_directed(packet, transport, &address).await;
                }
                Some(_) => {
                    // Directed to someone else: relay only
                    if !from_reassembly {
                        self.relay(&current, packet.ttl, transport).await;
                    }
                }
                None => {
                    if !from_reassembly {
                        self.relay(&current, packet.ttl, transport).await;
                    }
                    self.deliver_broadcast(packet).await;
                }
            }
            return;
        }
    }

    /// Step 4 of the receive path: announce handling and signature checks.
    /// Returns false when the packet must be dropped.
    async fn verify_and_bind(
        &self,
        packet: &BitchatPacket,
        transport: TransportId,
        address: &TransportAddress,
    ) -> bool {
        if packet.packet_type == PACKET_TYPE_ANNOUNCE {
            let announce = match IdentityAnnouncement::decode(&packet.payload) {
                Ok(announce) => announce,
                Err(e) => {
                    trace!(%address, "Dropping malformed announce: {}", e);
                    return false;
                }
            };
            if let Some(signing_public) = announce.signing_public {
                if let Err(e) = packet.verify_signature(&signing_public) {
                    debug!(%address, "Dropping announce with bad signature: {}", e);
                    return false;
                }
            }

            // First announce on a link binds it; relayed announces from
            // further away must not rebind an already-identified neighbor
            let newly_bound = {
                let mut links = self.links.write().await;
                let link = links.entry(address.clone()).or_insert(LinkInfo {
                    transport,
                    peer_id: None,
                    connected_at: Instant::now(),
                });
                if link.peer_id.is_none() {
                    link.peer_id = Some(packet.sender_id);
                    true
                } else {
                    false
                }
            };

            self.peers.write().await.insert(
                packet.sender_id,
                PeerInfo {
                    nickname: announce.nickname.clone(),
                    noise_public: announce.noise_public,
                    signing_public: announce.signing_public,
                    features: announce.features,
                    last_seen: packet.timestamp,
                },
            );
            let _ = self.events.send(MeshEvent::PeerAnnounced {
                peer_id: packet.sender_id,
                nickname: announce.nickname,
                noise_public: announce.noise_public,
            });

            // Link-up: nudge reconciliation toward the fresh neighbor
            if newly_bound {
                self.send_sync_request(packet.sender_id, transport, address)
                    .await;
            }
            return true;
        }

        // A signed packet from a peer with a known signing key must verify
        if packet.signature.is_some() {
            let known_key = self
                .peers
                .read()
                .await
                .get(&packet.sender_id)
                .and_then(|peer| peer.signing_public);
            if let Some(key) = known_key {
                if let Err(e) = packet.verify_signature(&key) {
                    debug!(%address, "Dropping packet with bad signature: {}", e);
                    return false;
                }
            }
        }
        true
    }

    /// Directed packet addressed to this node; never relayed
    async fn deliver_directed(
        &self,
        packet: BitchatPacket,
        transport: TransportId,
        address: &TransportAddress,
    ) {
        let sender = packet.sender_id;
        match packet.packet_type {
            PACKET_TYPE_NOISE_HANDSHAKE_INIT
            | PACKET_TYPE_NOISE_HANDSHAKE_RESP
            | PACKET_TYPE_NOISE_HANDSHAKE_FINAL => {
                match self
                    .sessions
                    .handle_handshake_message(sender, &packet.payload)
                    .await
                {
                    Ok(Some(response)) => {
                        let response_type = match packet.packet_type {
                            PACKET_TYPE_NOISE_HANDSHAKE_INIT => PACKET_TYPE_NOISE_HANDSHAKE_RESP,
                            _ => PACKET_TYPE_NOISE_HANDSHAKE_FINAL,
                        };
                        let reply = BitchatPacket::new(response_type, self.local_peer_id, response)
                            .with_recipient(sender)
                            .with_ttl(self.config.initial_ttl);
                        if let Err(e) = self.send_packet(reply).await {
                            warn!("Failed to send handshake response: {}", e);
                        }
                    }
                    Ok(None) => {}
                    Err(e) => debug!(peer = %hex::encode(sender), "Handshake failed: {}", e),
                }
            }
            PACKET_TYPE_NOISE_ENCRYPTED => {
                let plaintext = match self.sessions.decrypt_from(&sender, &packet.payload).await {
                    Ok(plaintext) => plaintext,
                    Err(e) => {
                        debug!(peer = %hex::encode(sender), "Dropping undecryptable packet: {}", e);
                        return;
                    }
                };
                match NoisePayload::decode(&plaintext) {
                    Ok(NoisePayload::PrivateMessage(message)) => {
                        let _ = self.events.send(MeshEvent::PrivateMessageReceived {
                            from: sender,
                            message,
                        });
                    }
                    Ok(NoisePayload::ReadReceipt { message_id }) => {
                        let _ = self.events.send(MeshEvent::ReadReceiptReceived {
                            from: sender,
                            message_id,
                        });
                    }
                    Ok(NoisePayload::DeliveryAck { message_id }) => {
                        let _ = self.events.send(MeshEvent::DeliveryAckReceived {
                            from: sender,
                            message_id,
                        });
                    }
                    Err(e) => debug!("Dropping malformed inner payload: {}", e),
                }
            }
            PACKET_TYPE_REQUEST_SYNC => {
                self.handle_request_sync(packet, transport, address).await;
            }
            PACKET_TYPE_MESSAGE => match ChatMessage::decode(&packet.payload) {
                Ok(message) => {
                    let _ = self.events.send(MeshEvent::MessageReceived {
                        from: sender,
                        message,
                    });
                }
                Err(e) => trace!("Dropping malformed chat message: {}", e),
            },
            PACKET_TYPE_FILE => match FilePayload::decode(&packet.payload) {
                Ok(file) => {
                    let _ = self.events.send(MeshEvent::FileReceived { from: sender, file });
                }
                Err(e) => trace!("Dropping malformed file payload: {}", e),
            },
            _ => {
                let _ = self.events.send(MeshEvent::PacketReceived { packet });
            }
        }
    }

    /// Local delivery of broadcast packets
    async fn deliver_broadcast(&self, packet: BitchatPacket) {
        let sender = packet.sender_id;
        match packet.packet_type {
            // Announces were already verified, bound, and surfaced
            PACKET_TYPE_ANNOUNCE => {}
            PACKET_TYPE_LEAVE => {
                self.peers.write().await.remove(&sender);
                self.sessions.remove_session(&sender).await;
                let mut links = self.links.write().await;
                for link in links.values_mut() {
                    if link.peer_id == Some(sender) {
                        link.peer_id = None;
                    }
                }
                let _ = self.events.send(MeshEvent::PeerLeft { peer_id: sender });
            }
            PACKET_TYPE_MESSAGE => match ChatMessage::decode(&packet.payload) {
                Ok(message) => {
                    let _ = self.events.send(MeshEvent::MessageReceived {
                        from: sender,
                        message,
                    });
                }
                Err(e) => trace!("Dropping malformed chat message: {}", e),
            },
            PACKET_TYPE_FILE => match FilePayload::decode(&packet.payload) {
                Ok(file) => {
                    let _ = self.events.send(MeshEvent::FileReceived { from: sender, file });
                }
                Err(e) => trace!("Dropping malformed file payload: {}", e),
            },
            PACKET_TYPE_REQUEST_SYNC => {
                // Sync requests are unicast; a flooded one is ignored
                trace!("Ignoring broadcast sync request");
            }
            _ => {
                let _ = self.events.send(MeshEvent::PacketReceived { packet });
            }
        }
    }

    /// Re-emit a frame on every transport except the ingress, with TTL
    /// decremented in place. A frame arriving at TTL <= 1 stops here.
    async fn relay(&self, bytes: &[u8], ttl: u8, ingress: TransportId) {
        if !self.config.relay_enabled {
            return;
        }
        if ttl <= 1 {
            trace!("TTL exhausted; not relaying");
            return;
        }

        let mut relayed = bytes.to_vec();
        relayed[TTL_OFFSET] = ttl - 1;

        let transports = self.transports.read().await;
        for (id, transport) in transports.iter().enumerate() {
            if id == ingress {
                continue;
            }
            if let Err(e) = transport.broadcast(&relayed).await {
                debug!(transport = transport.name(), "Relay emit failed: {}", e);
            }
        }
    }

    /// Send a locally originated packet: record it as seen, fragment when
    /// it exceeds the MTU, and flood it on every transport. A transport
    /// failure drops that transport from this emission without failing
    /// the call.
    pub async fn send_packet(&self, packet: BitchatPacket) -> Result<()> {
        let encoded = BinaryProtocol::encode(&packet)?;
        let packet_id = packet.packet_id();
        self.seen.lock().insert(packet_id);

        if encoded.len() > self.config.fragment_threshold() {
            return self.send_fragmented(&packet, &encoded).await;
        }

        self.cache.lock().insert(
            packet_id,
            CachedPacket::new(
                encoded.clone(),
                packet.packet_type,
                packet.timestamp,
                &packet.payload,
            ),
        );
        self.broadcast_bytes(&encoded, None).await;
        Ok(())
    }

    /// Split an oversized serialized packet into FRAGMENT packets
    async fn send_fragmented(&self, original: &BitchatPacket, encoded: &[u8]) -> Result<()> {
        // Fragment payloads must themselves fit the MTU after the outer
        // FRAGMENT packet header is added
        let overhead = original.wire_size() - original.payload.len();
        let f_max = self
            .config
            .mtu
            .checked_sub(overhead)
            .filter(|budget| *budget > FRAGMENT_HEADER_SIZE)
            .ok_or_else(|| Error::InvalidState("MTU too small for fragmentation".into()))?;

        let fragmenter = MessageFragmenter::new(f_max);
        let fragments = fragmenter.fragment(encoded, original.packet_type)?;
        debug!(
            count = fragments.len(),
            size = encoded.len(),
            "Fragmenting oversized packet"
        );

        for fragment in fragments {
            let mut packet = BitchatPacket::new(
                PACKET_TYPE_FRAGMENT,
                original.sender_id,
                fragment.to_wire_format(),
            )
            .with_ttl(original.ttl);
            if let Some(recipient) = original.recipient_id {
                packet = packet.with_recipient(recipient);
            }

            let bytes = BinaryProtocol::encode(&packet)?;
            let fragment_id = packet.packet_id();
            self.seen.lock().insert(fragment_id);
            self.cache.lock().insert(
                fragment_id,
                CachedPacket::new(bytes.clone(), packet.packet_type, packet.timestamp, &packet.payload),
            );
            self.broadcast_bytes(&bytes, None).await;
        }
        Ok(())
    }

    async fn broadcast_bytes(&self, bytes: &[u8], except: Option<TransportId>) {
        let transports = self.transports.read().await;
        for (id, transport) in transports.iter().enumerate() {
            if Some(id) == except {
                continue;
            }
            if let Err(e) = transport.broadcast(bytes).await {
                debug!(transport = transport.name(), "Broadcast failed: {}", e);
            }
        }
    }

    /// Broadcast a signed identity announcement
    pub async fn send_announce(&self, nickname: &str) -> Result<()> {
        let announce = IdentityAnnouncement::new(
            nickname.to_string(),
            self.identity.noise_keypair.public_bytes(),
            self.identity.signing_keypair.public_bytes(),
        );
        let mut packet = BitchatPacket::new(
            PACKET_TYPE_ANNOUNCE,
            self.local_peer_id,
            announce.encode()?,
        )
        .with_ttl(self.config.initial_ttl);
        packet.sign(&self.identity.signing_keypair)?;
        self.send_packet(packet).await
    }

    /// Broadcast a graceful departure
    pub async fn send_leave(&self) -> Result<()> {
        let packet = BitchatPacket::new(PACKET_TYPE_LEAVE, self.local_peer_id, Vec::new())
            .with_ttl(self.config.initial_ttl);
        self.send_packet(packet).await
    }

    /// Broadcast a plaintext chat message; returns its message ID
    pub async fn broadcast_message(&self, nickname: &str, content: &str) -> Result<Uuid> {
        let message = ChatMessage::plain(nickname.to_string(), content.to_string());
        let id = message.id;
        let packet = BitchatPacket::new(
            PACKET_TYPE_MESSAGE,
            self.local_peer_id,
            message.encode()?,
        )
        .with_ttl(self.config.initial_ttl);
        self.send_packet(packet).await?;
        Ok(id)
    }

    /// Broadcast a channel message encrypted with the channel key
    pub async fn send_channel_message(
        &self,
        nickname: &str,
        channel: &str,
        cipher: &ChannelCipher,
        content: &str,
    ) -> Result<Uuid> {
        let ciphertext = cipher.encrypt(content.as_bytes())?;
        let message = ChatMessage {
            id: Uuid::new_v4(),
            nickname: nickname.to_string(),
            content: MessageContent::Channel {
                channel: channel.to_string(),
                ciphertext,
            },
        };
        let id = message.id;
        let packet = BitchatPacket::new(
            PACKET_TYPE_MESSAGE,
            self.local_peer_id,
            message.encode()?,
        )
        .with_ttl(self.config.initial_ttl);
        self.send_packet(packet).await?;
        Ok(id)
    }

    /// Send an end-to-end encrypted private message; requires an
    /// established session with the peer
    pub async fn send_private_message(
        &self,
        peer_id: PeerId,
        nickname: &str,
        content: &str,
    ) -> Result<Uuid> {
        let message = PrivateMessage {
            id: Uuid::new_v4(),
            nickname: nickname.to_string(),
            content: content.to_string(),
        };
        let id = message.id;
        let payload = NoisePayload::PrivateMessage(message).encode()?;
        self.send_noise_payload(peer_id, payload).await?;
        Ok(id)
    }

    pub async fn send_read_receipt(&self, peer_id: PeerId, message_id: Uuid) -> Result<()> {
        let payload = NoisePayload::ReadReceipt { message_id }.encode()?;
        self.send_noise_payload(peer_id, payload).await
    }

    pub async fn send_delivery_ack(&self, peer_id: PeerId, message_id: Uuid) -> Result<()> {
        let payload = NoisePayload::DeliveryAck { message_id }.encode()?;
        self.send_noise_payload(peer_id, payload).await
    }

    async fn send_noise_payload(&self, peer_id: PeerId, plaintext: Vec<u8>) -> Result<()> {
        let ciphertext = self.sessions.encrypt_for(&peer_id, &plaintext).await?;
        let packet = BitchatPacket::new(PACKET_TYPE_NOISE_ENCRYPTED, self.local_peer_id, ciphertext)
            .with_recipient(peer_id)
            .with_ttl(self.config.initial_ttl);
        self.send_packet(packet).await
    }

    /// Broadcast a file transfer payload
    pub async fn send_file(&self, file: &FilePayload) -> Result<()> {
        let packet = BitchatPacket::new(PACKET_TYPE_FILE, self.local_peer_id, file.encode()?)
            .with_ttl(self.config.initial_ttl);
        self.send_packet(packet).await
    }

    /// Open a Noise handshake toward a peer if the tie-breaker says this
    /// side initiates. Returns true when msg1 went out.
    pub async fn connect_peer(&self, peer_id: PeerId) -> Result<bool> {
        if self.sessions.is_established(&peer_id).await {
            return Ok(false);
        }

        let initiate = match self.peers.read().await.get(&peer_id) {
            Some(peer) => crate::session::should_initiate_with_key(
                &self.identity.noise_keypair.public_bytes(),
                &peer.noise_public,
            ),
            None => self.sessions.should_initiate_to(&peer_id),
        };
        if !initiate {
            return Ok(false);
        }

        let msg1 = self.sessions.initiate_handshake(peer_id).await?;
        let packet = BitchatPacket::new(
            PACKET_TYPE_NOISE_HANDSHAKE_INIT,
            self.local_peer_id,
            msg1,
        )
        .with_recipient(peer_id)
        .with_ttl(self.config.initial_ttl);
        self.send_packet(packet).await?;
        Ok(true)
    }

    /// One sync round: summarize the seen-set and ask each bound neighbor
    /// for anything missing
    pub async fn run_sync_round(&self) {
        let request = {
            let seen = self.seen.lock();
            self.sync.build_request(&seen)
        };
        let Some(request) = request else { return };

        let targets: Vec<(PeerId, TransportId, TransportAddress)> = {
            let links = self.links.read().await;
            links
                .iter()
                .filter_map(|(address, link)| {
                    link.peer_id
                        .map(|peer_id| (peer_id, link.transport, address.clone()))
                })
                .collect()
        };

        for (peer_id, transport, address) in targets {
            self.send_sync_request_payload(&request, peer_id, transport, &address)
                .await;
        }
    }

    async fn send_sync_request(
        &self,
        peer_id: PeerId,
        transport: TransportId,
        address: &TransportAddress,
    ) {
        let request = {
            let seen = self.seen.lock();
            self.sync.build_request(&seen)
        };
        if let Some(request) = request {
            self.send_sync_request_payload(&request, peer_id, transport, address)
                .await;
        }
    }

    async fn send_sync_request_payload(
        &self,
        request: &RequestSyncPayload,
        peer_id: PeerId,
        transport: TransportId,
        address: &TransportAddress,
    ) {
        let payload = match request.encode() {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Failed to encode sync request: {}", e);
                return;
            }
        };
        let packet = BitchatPacket::new(PACKET_TYPE_REQUEST_SYNC, self.local_peer_id, payload)
            .with_recipient(peer_id)
            .with_ttl(1);
        let bytes = match BinaryProtocol::encode(&packet) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Failed to encode sync packet: {}", e);
                return;
            }
        };
        self.seen.lock().insert(packet.packet_id());
        self.send_over_link(transport, address, &bytes).await;
    }

    /// Answer a peer's sync request by replaying missing packets over the
    /// requesting link only
    async fn handle_request_sync(
        &self,
        packet: BitchatPacket,
        transport: TransportId,
        address: &TransportAddress,
    ) {
        let request = match RequestSyncPayload::decode(&packet.payload) {
            Ok(request) => request,
            Err(e) => {
                trace!(%address, "Dropping malformed sync request: {}", e);
                return;
            }
        };

        let snapshot = self.cache.lock().snapshot();
        let replay = match self.sync.plan_replay(&request, &snapshot) {
            Ok(replay) => replay,
            Err(e) => {
                debug!(%address, "Rejecting sync request: {}", e);
                return;
            }
        };

        if replay.is_empty() {
            return;
        }
        debug!(
            peer = %hex::encode(packet.sender_id),
            count = replay.len(),
            "Replaying packets for sync"
        );
        for bytes in replay {
            self.send_over_link(transport, address, &bytes).await;
        }
    }

    async fn send_over_link(&self, transport: TransportId, address: &TransportAddress, bytes: &[u8]) {
        let transport = {
            let transports = self.transports.read().await;
            transports.get(transport).cloned()
        };
        match transport {
            Some(transport) => {
                if let Err(e) = transport.send(address, bytes).await {
                    debug!(%address, "Link send failed: {}", e);
                }
            }
            None => warn!("Unknown transport id for link send"),
        }
    }

    #[cfg(test)]
    pub(crate) fn seen_len(&self) -> usize {
        self.seen.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    /// Captures everything emitted, for assertions
    struct RecordingTransport {
        broadcasts: Mutex<Vec<Vec<u8>>>,
        sends: Mutex<Vec<(TransportAddress, Vec<u8>)>>,
    }

    impl RecordingTransport {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                broadcasts: Mutex::new(Vec::new()),
                sends: Mutex::new(Vec::new()),
            })
        }

        fn broadcast_count(&self) -> usize {
            self.broadcasts.lock().len()
        }

        fn last_broadcast(&self) -> Option<Vec<u8>> {
            self.broadcasts.lock().last().cloned()
        }
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        fn name(&self) -> &str {
            "recording"
        }

        async fn send(&self, address: &TransportAddress, data: &[u8]) -> Result<()> {
            self.sends.lock().push((address.clone(), data.to_vec()));
            Ok(())
        }

        async fn broadcast(&self, data: &[u8]) -> Result<()> {
            self.broadcasts.lock().push(data.to_vec());
            Ok(())
        }
    }

    fn test_router() -> (
        Arc<MeshRouter>,
        mpsc::UnboundedReceiver<MeshEvent>,
        Arc<BitchatIdentity>,
    ) {
        let identity = Arc::new(BitchatIdentity::generate());
        let (router, events) = MeshRouter::new(ProtocolConfig::default(), Arc::clone(&identity));
        (router, events, identity)
    }

    fn addr(name: &str) -> TransportAddress {
        TransportAddress::Bluetooth(name.to_string())
    }

    fn chat_packet(sender: PeerId, ttl: u8, content: &str) -> Vec<u8> {
        let message = ChatMessage::plain("peer".into(), content.into());
        let packet = BitchatPacket::new(PACKET_TYPE_MESSAGE, sender, message.encode().unwrap())
            .with_ttl(ttl);
        BinaryProtocol::encode(&packet).unwrap()
    }

    #[tokio::test]
    async fn test_broadcast_delivered_once_and_relayed() {
        let (router, mut events, _) = test_router();
        let ingress = RecordingTransport::new();
        let egress = RecordingTransport::new();
        let ingress_id = router.attach_transport(ingress.clone()).await;
        router.attach_transport(egress.clone()).await;

        let bytes = chat_packet([9u8; 8], 3, "hello");
        router.handle_frame(ingress_id, addr("a"), &bytes).await;

        // Delivered to the application
        match events.try_recv().unwrap() {
            MeshEvent::MessageReceived { from, message } => {
                assert_eq!(from, [9u8; 8]);
                assert!(matches!(message.content, MessageContent::Plain(text) if text == "hello"));
            }
            other => panic!("unexpected event {:?}", other),
        }

        // Relayed once, on the other transport only, with TTL decremented
        assert_eq!(ingress.broadcast_count(), 0);
        assert_eq!(egress.broadcast_count(), 1);
        let relayed = egress.last_broadcast().unwrap();
        assert_eq!(relayed[TTL_OFFSET], 2);
    }

    #[tokio::test]
    async fn test_duplicate_frames_dropped() {
        let (router, mut events, _) = test_router();
        let ingress = RecordingTransport::new();
        let egress = RecordingTransport::new();
        let ingress_id = router.attach_transport(ingress.clone()).await;
        router.attach_transport(egress.clone()).await;

        let bytes = chat_packet([9u8; 8], 3, "flood");
        let before = router.seen_len();
        for _ in 0..5 {
            router.handle_frame(ingress_id, addr("a"), &bytes).await;
        }

        // One delivery, one relay, one new seen entry
        assert!(events.try_recv().is_ok());
        assert!(events.try_recv().is_err());
        assert_eq!(egress.broadcast_count(), 1);
        assert_eq!(router.seen_len(), before + 1);
    }

    #[tokio::test]
    async fn test_ttl_one_not_relayed_but_delivered() {
        let (router, mut events, _) = test_router();
        let ingress_id = router.attach_transport(RecordingTransport::new()).await;
        let egress = RecordingTransport::new();
        router.attach_transport(egress.clone()).await;

        let bytes = chat_packet([9u8; 8], 1, "edge");
        router.handle_frame(ingress_id, addr("a"), &bytes).await;

        assert!(matches!(
            events.try_recv(),
            Ok(MeshEvent::MessageReceived { .. })
        ));
        assert_eq!(egress.broadcast_count(), 0);
    }

    #[tokio::test]
    async fn test_relay_disabled_by_policy() {
        let identity = Arc::new(BitchatIdentity::generate());
        let config = ProtocolConfig {
            relay_enabled: false,
            ..Default::default()
        };
        let (router, _events) = MeshRouter::new(config, identity);

        let ingress_id = router.attach_transport(RecordingTransport::new()).await;
        let egress = RecordingTransport::new();
        router.attach_transport(egress.clone()).await;

        let bytes = chat_packet([9u8; 8], 5, "kept");
        router.handle_frame(ingress_id, addr("a"), &bytes).await;
        assert_eq!(egress.broadcast_count(), 0);
    }

    #[tokio::test]
    async fn test_directed_to_other_relayed_not_delivered() {
        let (router, mut events, _) = test_router();
        let ingress_id = router.attach_transport(RecordingTransport::new()).await;
        let egress = RecordingTransport::new();
        router.attach_transport(egress.clone()).await;

        let packet = BitchatPacket::new(PACKET_TYPE_NOISE_ENCRYPTED, [9u8; 8], vec![1; 32])
            .with_recipient([7u8; 8])
            .with_ttl(4);
        let bytes = BinaryProtocol::encode(&packet).unwrap();
        router.handle_frame(ingress_id, addr("a"), &bytes).await;

        assert!(events.try_recv().is_err());
        assert_eq!(egress.broadcast_count(), 1);
    }

    #[tokio::test]
    async fn test_announce_binds_peer_and_verifies() {
        let (router, mut events, _) = test_router();
        let remote = BitchatIdentity::generate();
        let ingress_id = router.attach_transport(RecordingTransport::new()).await;

        let announce = IdentityAnnouncement::new(
            "mallory".into(),
            remote.noise_keypair.public_bytes(),
            remote.signing_keypair.public_bytes(),
        );
        let mut packet = BitchatPacket::new(
            PACKET_TYPE_ANNOUNCE,
            remote.peer_id(),
            announce.encode().unwrap(),
        );
        packet.sign(&remote.signing_keypair).unwrap();
        let bytes = BinaryProtocol::encode(&packet).unwrap();

        router.handle_frame(ingress_id, addr("a"), &bytes).await;

        assert!(matches!(
            events.try_recv(),
            Ok(MeshEvent::PeerAnnounced { nickname, .. }) if nickname == "mallory"
        ));
        let peers = router.known_peers().await;
        assert_eq!(
            peers.get(&remote.peer_id()).unwrap().signing_public,
            Some(remote.signing_keypair.public_bytes())
        );
    }

    #[tokio::test]
    async fn test_announce_with_forged_signature_dropped() {
        let (router, mut events, _) = test_router();
        let remote = BitchatIdentity::generate();
        let forger = BitchatIdentity::generate();
        let ingress_id = router.attach_transport(RecordingTransport::new()).await;

        let announce = IdentityAnnouncement::new(
            "evil".into(),
            remote.noise_keypair.public_bytes(),
            remote.signing_keypair.public_bytes(),
        );
        let mut packet = BitchatPacket::new(
            PACKET_TYPE_ANNOUNCE,
            remote.peer_id(),
            announce.encode().unwrap(),
        );
        // Signed by the wrong key
        packet.sign(&forger.signing_keypair).unwrap();
        let bytes = BinaryProtocol::encode(&packet).unwrap();

        router.handle_frame(ingress_id, addr("a"), &bytes).await;
        assert!(events.try_recv().is_err());
        assert!(router.known_peers().await.is_empty());
    }

    #[tokio::test]
    async fn test_send_packet_floods_all_transports() {
        let (router, _events, _) = test_router();
        let t1 = RecordingTransport::new();
        let t2 = RecordingTransport::new();
        router.attach_transport(t1.clone()).await;
        router.attach_transport(t2.clone()).await;

        router.broadcast_message("me", "out").await.unwrap();
        assert_eq!(t1.broadcast_count(), 1);
        assert_eq!(t2.broadcast_count(), 1);
    }

    #[tokio::test]
    async fn test_own_packet_loopback_not_redelivered() {
        let (router, mut events, _) = test_router();
        let transport = RecordingTransport::new();
        let transport_id = router.attach_transport(transport.clone()).await;

        router.broadcast_message("me", "echo").await.unwrap();
        let sent = transport.last_broadcast().unwrap();

        // A neighbor relays our own packet back at us
        router.handle_frame(transport_id, addr("a"), &sent).await;
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_oversized_packet_fragmented_and_reassembled() {
        let (sender_router, _ev, _) = test_router();
        let (receiver_router, mut receiver_events, _) = test_router();

        let transport = RecordingTransport::new();
        sender_router.attach_transport(transport.clone()).await;
        let ingress_id = receiver_router
            .attach_transport(RecordingTransport::new())
            .await;

        // Incompressible content so the payload cannot dodge fragmentation
        let mut raw = vec![0u8; 1500];
        rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut raw);
        let content = hex::encode(raw);
        sender_router.broadcast_message("me", &content).await.unwrap();

        let frames = transport.broadcasts.lock().clone();
        assert!(frames.len() >= 2, "expected multiple fragments");
        for frame in &frames {
            assert!(frame.len() <= ProtocolConfig::default().mtu);
            receiver_router
                .handle_frame(ingress_id, addr("a"), frame)
                .await;
        }

        let delivered = loop {
            match receiver_events.try_recv() {
                Ok(MeshEvent::MessageReceived { message, .. }) => break message,
                Ok(_) => continue,
                Err(e) => panic!("message never delivered: {:?}", e),
            }
        };
        assert!(matches!(delivered.content, MessageContent::Plain(text) if text == content));
    }

    #[tokio::test]
    async fn test_undecodable_frame_dropped_silently() {
        let (router, mut events, _) = test_router();
        let ingress_id = router.attach_transport(RecordingTransport::new()).await;
        router
            .handle_frame(ingress_id, addr("a"), &[0xDE, 0xAD, 0xBE, 0xEF])
            .await;
        assert!(events.try_recv().is_err());
    }
}
