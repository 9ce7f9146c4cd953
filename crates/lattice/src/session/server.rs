//! Authoritative side of the connection lifecycle: per-peer records,
//! initial world dump over the reliable load channel, per-tick update
//! packets with delta-compressed snapshots, and teardown on timeout,
//! request, or unrecoverable sequence gap.

use std::collections::VecDeque;
use std::net::SocketAddr;

use glam::Vec3;
use log::{debug, info, warn};

use crate::config::NetConfig;
use crate::net::endpoint::Transport;
use crate::net::message::{
    FrameCursor, MessageHistory, ReliableChannel, SequenceHistory, frame_advance, read_frames,
    update_rtt,
};
use crate::net::msg::Message;
use crate::net::packet::{
    self, ClientPacket, DisconnectReason, MAX_PACKET_SIZE, ServerPacket,
};
use crate::net::sequence::{
    ACK_PREVIOUS_SEQUENCES, Ack, SEQUENCE_INVALID, SequenceId, sequence_advance,
    sequence_more_recent, sequence_relative_to,
};
use crate::net::stats::NetContext;
use crate::net::wire::{
    BitReader, BitWriter, WireError, read_int, read_sequence, read_sequence_or_invalid,
    write_int, write_sequence, write_sequence_or_invalid,
};
use crate::snapshot::{StateFrame, StateHistory, codec};
use crate::world::{
    EntityDef, EntityKind, MAX_ENTITIES, MAX_PLAYERS, SlotRef, World, read_remote_input,
};

use super::{read_ack, write_ack};

const TIME_SYNC_INTERVAL: f64 = 5.0;

/// Things the embedding layer should react to.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    PeerConnected { addr: SocketAddr },
    PeerLoaded { addr: SocketAddr, player: u8 },
    PeerDisconnected {
        addr: SocketAddr,
        reason: DisconnectReason,
    },
    Command { player: u8, command: String },
    /// Loopback of a message this server broadcast itself.
    Broadcast(Message),
}

/// Per-peer connection record.
struct RemoteClient {
    addr: SocketAddr,
    last_receive: f64,
    rtt: f32,
    /// Most recent ack from this peer for the common channel.
    ack: Ack,
    /// Most recent ack for the load channel.
    ack_load: Ack,
    msgs_in_history: MessageHistory,
    /// World-dump messages, reliable but scoped to this peer.
    load_channel: ReliableChannel,
    recently_resent: SequenceHistory,
    recently_resent_load: SequenceHistory,
    processed_frame: FrameCursor,
    /// First sequence id that carries load data for this peer; nothing
    /// before it is ever resent to them.
    first_load_sequence: SequenceId,
    /// Most recent state frame the peer says it holds (delta baseline).
    acked_state_frame: SequenceId,
    connected: bool,
    loading_done: bool,
    player: Option<u8>,
    avatar: Option<SlotRef>,
    name: String,
}

impl RemoteClient {
    fn new(addr: SocketAddr, first_load_sequence: SequenceId, now: f64) -> Self {
        Self {
            addr,
            last_receive: now,
            rtt: 0.5,
            ack: Ack::default(),
            ack_load: Ack::default(),
            msgs_in_history: MessageHistory::new(),
            load_channel: ReliableChannel::new(),
            recently_resent: SequenceHistory::new(),
            recently_resent_load: SequenceHistory::new(),
            // The peer numbers its own frames from zero.
            processed_frame: FrameCursor::starting_at(0),
            first_load_sequence,
            acked_state_frame: SEQUENCE_INVALID,
            connected: false,
            loading_done: false,
            player: None,
            avatar: None,
            name: String::new(),
        }
    }
}

/// Authoritative session. Single-threaded: drive `update` every frame and
/// `tick` at the fixed tick rate.
pub struct Server<T: Transport> {
    transport: T,
    config: NetConfig,
    ctx: NetContext,
    /// Reliable messages for every connected peer.
    channel: ReliableChannel,
    local_sequence: SequenceId,
    state_history: StateHistory,
    world: World,
    clients: Vec<RemoteClient>,
    events: VecDeque<ServerEvent>,
    match_time: f32,
    time_sync_at: f64,
    recv_buf: Box<[u8; MAX_PACKET_SIZE]>,
}

impl<T: Transport> Server<T> {
    pub fn new(transport: T, config: NetConfig) -> Self {
        Self {
            transport,
            config,
            ctx: NetContext::new(),
            channel: ReliableChannel::new(),
            local_sequence: 0,
            state_history: StateHistory::new(),
            world: World::new(),
            clients: Vec::new(),
            events: VecDeque::new(),
            match_time: 0.0,
            time_sync_at: 0.0,
            recv_buf: Box::new([0; MAX_PACKET_SIZE]),
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.transport.local_addr()
    }

    pub fn world(&self) -> &World {
        &self.world
    }

    pub fn world_mut(&mut self) -> &mut World {
        &mut self.world
    }

    pub fn timestamp(&self) -> f64 {
        self.ctx.timestamp
    }

    pub fn connected_count(&self) -> usize {
        self.clients.iter().filter(|c| c.connected).count()
    }

    pub fn rtt(&self, player: u8) -> Option<f32> {
        self.clients
            .iter()
            .find(|c| c.player == Some(player))
            .map(|c| c.rtt)
    }

    pub fn drain_events(&mut self) -> impl Iterator<Item = ServerEvent> + '_ {
        self.events.drain(..)
    }

    /// Queue a reliable message for every peer; also surfaced locally so
    /// server-side logic observes it the same tick.
    pub fn broadcast(&mut self, message: Message) {
        self.channel.enqueue(&message);
        self.events.push_back(ServerEvent::Broadcast(message));
    }

    /// Spawn an object into the authoritative world and announce it.
    pub fn spawn_entity(&mut self, def: &EntityDef) -> Option<SlotRef> {
        let slot = self.world.spawn(def)?;
        self.channel.enqueue(&Message::EntityCreate {
            id: slot.id,
            revision: slot.revision,
            def: *def,
        });
        Some(slot)
    }

    /// Remove an object and announce the removal.
    pub fn despawn_entity(&mut self, id: u16) -> bool {
        if !self.world.despawn(id) {
            return false;
        }
        self.channel.enqueue(&Message::EntityRemove { id });
        true
    }

    /// Drain the transport and process everything queued. Call once per
    /// render frame.
    pub fn update(&mut self, dt: f64) {
        self.ctx.advance(dt);
        let now = self.ctx.timestamp;

        loop {
            match self.transport.recv_from(&mut self.recv_buf[..]) {
                Ok(Some((size, addr))) => {
                    self.ctx.record_received(size);
                    let datagram = self.recv_buf[..size].to_vec();
                    match packet::open(&datagram) {
                        Ok(body) => {
                            if let Err(e) = self.handle_packet(&body, addr) {
                                debug!("dropping packet from {addr}: {e}");
                            }
                        }
                        Err(e) => debug!("discarding datagram from {addr}: {e}"),
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("transport receive error: {e}");
                    break;
                }
            }
        }

        // Deliver reliable frames in order and act on their messages.
        for index in 0..self.clients.len() {
            loop {
                let payload = {
                    let client = &mut self.clients[index];
                    match frame_advance(
                        &client.msgs_in_history,
                        &mut client.processed_frame,
                        now + 1.0,
                        now,
                        &self.config,
                    ) {
                        Some(frame) => frame.payload.clone(),
                        None => break,
                    }
                };
                match Message::decode_frame(&payload) {
                    Ok(messages) => {
                        for message in messages {
                            self.process_message(index, message);
                        }
                    }
                    Err(e) => warn!("bad reliable frame from client {index}: {e}"),
                }
            }
        }
    }

    /// One fixed-rate tick: consolidate channels, capture the snapshot,
    /// emit one datagram per peer, advance the local sequence.
    pub fn tick(&mut self, dt: f64) {
        let now = self.ctx.timestamp;
        self.match_time += dt as f32;

        if now - self.time_sync_at > TIME_SYNC_INTERVAL {
            self.time_sync_at = now;
            let rtts = self
                .clients
                .iter()
                .filter_map(|c| c.player.map(|p| (p, c.rtt)))
                .collect();
            let message = Message::TimeSync {
                match_time: self.match_time,
                rtts,
            };
            self.channel.enqueue(&message);
        }

        self.channel
            .consolidate(self.local_sequence, now, &self.config);
        for client in &mut self.clients {
            if !client.loading_done {
                client
                    .load_channel
                    .consolidate(self.local_sequence, now, &self.config);
            }
        }

        let frame = StateFrame::build(&self.world, self.local_sequence, now);
        self.state_history.insert(frame);

        // Timeouts first, then sends to the survivors.
        let timeout = f64::from(self.config.timeout);
        let mut index = 0;
        while index < self.clients.len() {
            if now - self.clients[index].last_receive > timeout {
                info!("client {} timed out", self.clients[index].addr);
                self.remove_client(index, DisconnectReason::Timeout, false);
            } else {
                index += 1;
            }
        }

        let Self {
            transport,
            config,
            ctx,
            channel,
            state_history,
            clients,
            ..
        } = self;
        for client in clients.iter_mut() {
            match build_update_packet(channel, state_history, config, ctx.timestamp, client) {
                Ok(body) => match packet::seal(body) {
                    Ok(datagram) => {
                        ctx.record_sent(datagram.len());
                        if let Err(e) = transport.send_to(&datagram, client.addr) {
                            warn!("send to {} failed: {e}", client.addr);
                        }
                    }
                    Err(e) => warn!("update packet for {} not sent: {e}", client.addr),
                },
                Err(e) => warn!("update packet build for {} failed: {e}", client.addr),
            }
        }

        self.local_sequence = sequence_advance(self.local_sequence, 1);
    }

    fn handle_packet(&mut self, body: &[u8], addr: SocketAddr) -> Result<(), WireError> {
        let mut r = BitReader::new(body);
        let kind = ClientPacket::from_index(read_int(&mut r, 0, ClientPacket::COUNT - 1)?)
            .ok_or(WireError::ValueOutOfRange)?;
        match kind {
            ClientPacket::Connect => self.handle_connect(addr),
            ClientPacket::Update => {
                if let Some(index) = self.client_index(addr) {
                    self.handle_update(index, &mut r)?;
                }
                Ok(())
            }
            ClientPacket::Disconnect => {
                if let Some(index) = self.client_index(addr) {
                    info!("client {addr} disconnected");
                    self.remove_client(index, DisconnectReason::RequestedByPeer, false);
                }
                Ok(())
            }
            ClientPacket::Ping => {
                let token = r.read_bits(32)?;
                let mut w = BitWriter::new();
                write_int(&mut w, ServerPacket::PingResponse as i64, 0, ServerPacket::COUNT - 1);
                w.write_bits(token, 32);
                self.send_body(w.finish(), addr);
                Ok(())
            }
        }
    }

    fn handle_connect(&mut self, addr: SocketAddr) -> Result<(), WireError> {
        if self.client_index(addr).is_none() {
            if self.clients.len() >= self.config.max_clients {
                info!("rejecting {addr}: server full");
                let mut w = BitWriter::new();
                write_int(&mut w, ServerPacket::Disconnect as i64, 0, ServerPacket::COUNT - 1);
                write_int(
                    &mut w,
                    DisconnectReason::ServerFull as i64,
                    0,
                    DisconnectReason::COUNT - 1,
                );
                self.send_body(w.finish(), addr);
                return Ok(());
            }

            info!("client {addr} connecting");
            let mut client = RemoteClient::new(addr, self.local_sequence, self.ctx.timestamp);

            // The full world rides the load channel as ordinary reliable
            // messages; snapshots don't exist for this peer yet.
            for (id, entity) in self.world.iter() {
                client.load_channel.enqueue(&Message::EntityCreate {
                    id,
                    revision: self.world.revision(id).unwrap_or(0),
                    def: entity.to_def(),
                });
            }
            client.load_channel.enqueue(&Message::InitDone);

            self.clients.push(client);
            self.events.push_back(ServerEvent::PeerConnected { addr });
        }

        // Idempotent: connect retries re-trigger the init reply.
        let Some(index) = self.client_index(addr) else {
            return Ok(());
        };
        let first_load_sequence = self.clients[index].first_load_sequence;
        let mut w = BitWriter::new();
        write_int(&mut w, ServerPacket::Init as i64, 0, ServerPacket::COUNT - 1);
        write_sequence(&mut w, first_load_sequence);
        write_int(&mut w, i64::from(self.config.tick_rate), 1, 512);
        self.send_body(w.finish(), addr);
        Ok(())
    }

    fn handle_update(&mut self, index: usize, r: &mut BitReader) -> Result<(), WireError> {
        let now = self.ctx.timestamp;
        let config = self.config.clone();

        let (gap_disconnect, most_recent) = {
            let client = &mut self.clients[index];

            // Ack for the common channel.
            let ack_candidate = read_ack(r)?;
            if sequence_more_recent(ack_candidate.sequence_id, client.ack.sequence_id) {
                client.ack = ack_candidate;
            }
            read_frames(r, &mut client.msgs_in_history, now, &config)?;

            // Optional ack for the load channel.
            if r.read_bool()? {
                let ack_candidate = read_ack(r)?;
                if sequence_more_recent(ack_candidate.sequence_id, client.ack_load.sequence_id) {
                    client.ack_load = ack_candidate;
                }
            }

            update_rtt(
                &mut client.rtt,
                &client.ack,
                &self.channel.history,
                now,
                &config,
            );

            client.last_receive = now;
            if !client.connected {
                info!("client {} connected", client.addr);
                client.connected = true;
            }

            // Which state frame the peer holds, for delta baselines.
            client.acked_state_frame = read_sequence_or_invalid(r)?;

            // The current sequence id travels outside the frame stream:
            // the frame itself may not have fit this packet.
            let sequence_id = read_sequence(r)?;
            let gap =
                sequence_relative_to(sequence_id, client.processed_frame.sequence_id).abs();
            let gap_disconnect = gap > config.max_sequence_gap;

            let newest = client.msgs_in_history.most_recent_sequence(now, &config);
            let most_recent = !gap_disconnect
                && (newest == SEQUENCE_INVALID
                    || sequence_relative_to(sequence_id, newest) >= 0);
            (gap_disconnect, most_recent)
        };

        if gap_disconnect {
            warn!(
                "client {} lost to sequence gap",
                self.clients[index].addr
            );
            self.remove_client(index, DisconnectReason::SequenceGap, true);
            return Ok(());
        }

        // Input snapshots for the peer's controlled objects. Stale packets
        // still parse but don't steer.
        let count = read_int(r, 0, MAX_PLAYERS as i64)?;
        for _ in 0..count {
            let id = read_int(r, 0, MAX_ENTITIES as i64 - 1)? as u16;
            let input = read_remote_input(r)?;
            let owner = self.clients[index].player;
            if !most_recent {
                continue;
            }
            if let Some(entity) = self.world.get_mut(id) {
                if entity.kind == EntityKind::Avatar && entity.player == owner {
                    entity.input = input;
                }
            }
        }
        Ok(())
    }

    fn process_message(&mut self, index: usize, message: Message) {
        match message {
            Message::Noop => {}
            Message::ClientSetup { uuid, name } => {
                if self.clients[index].player.is_some() {
                    return; // duplicate setup from a resent frame
                }
                let Some(player) = (0..MAX_PLAYERS as u8)
                    .find(|&p| !self.world.players[usize::from(p)].active)
                else {
                    warn!("no free player slot for {}", self.clients[index].addr);
                    return;
                };
                self.world.players[usize::from(player)].active = true;
                self.world.players[usize::from(player)].energy = 100;

                let spawn = EntityDef::Avatar {
                    player,
                    uuid,
                    position: Vec3::new(2.0 * f32::from(player), 1.0, 0.0),
                    rotation: glam::Quat::IDENTITY,
                };
                let avatar = self.spawn_entity(&spawn);

                let client = &mut self.clients[index];
                client.player = Some(player);
                client.avatar = avatar;
                client.name = name;
                info!(
                    "client {} is player {player} ({})",
                    client.addr, client.name
                );
            }
            Message::LoadingDone => {
                let client = &mut self.clients[index];
                if !client.loading_done {
                    client.loading_done = true;
                    let addr = client.addr;
                    let player = client.player.unwrap_or(0);
                    info!("client {addr} finished loading");
                    self.events
                        .push_back(ServerEvent::PeerLoaded { addr, player });
                }
            }
            Message::DebugCommand { command } => {
                let player = self.clients[index].player.unwrap_or(0);
                self.events.push_back(ServerEvent::Command { player, command });
            }
            // Only the authority originates these; a peer sending them is
            // confused or hostile.
            Message::EntityCreate { .. }
            | Message::EntityRemove { .. }
            | Message::InitDone
            | Message::TimeSync { .. } => {
                warn!(
                    "ignoring authoritative message from client {}",
                    self.clients[index].addr
                );
            }
        }
    }

    fn remove_client(&mut self, index: usize, reason: DisconnectReason, notify: bool) {
        let client = self.clients.remove(index);
        if notify {
            let mut w = BitWriter::new();
            write_int(&mut w, ServerPacket::Disconnect as i64, 0, ServerPacket::COUNT - 1);
            write_int(&mut w, reason as i64, 0, DisconnectReason::COUNT - 1);
            self.send_body(w.finish(), client.addr);
        }
        if let Some(avatar) = client.avatar {
            self.despawn_entity(avatar.id);
        }
        if let Some(player) = client.player {
            self.world.players[usize::from(player)] = Default::default();
        }
        self.events.push_back(ServerEvent::PeerDisconnected {
            addr: client.addr,
            reason,
        });
    }

    fn client_index(&self, addr: SocketAddr) -> Option<usize> {
        self.clients.iter().position(|c| c.addr == addr)
    }

    fn send_body(&mut self, body: Vec<u8>, addr: SocketAddr) {
        match packet::seal(body) {
            Ok(datagram) => {
                self.ctx.record_sent(datagram.len());
                if let Err(e) = self.transport.send_to(&datagram, addr) {
                    warn!("send to {addr} failed: {e}");
                }
            }
            Err(e) => warn!("packet for {addr} not sent: {e}"),
        }
    }
}

fn build_update_packet(
    channel: &ReliableChannel,
    state_history: &StateHistory,
    config: &NetConfig,
    now: f64,
    client: &mut RemoteClient,
) -> Result<Vec<u8>, WireError> {
    let mut w = BitWriter::new();
    write_int(&mut w, ServerPacket::Update as i64, 0, ServerPacket::COUNT - 1);

    // Ack what we've received from this peer.
    write_ack(&mut w, &client.msgs_in_history.ack(now, config));

    // Resend/send the common channel against a view of the peer's ack
    // that pretends everything before they joined was delivered.
    let mut effective_ack = client.ack;
    if effective_ack.sequence_id == SEQUENCE_INVALID {
        effective_ack = Ack {
            sequence_id: sequence_advance(client.first_load_sequence, -1),
            previous_sequences: u64::MAX,
        };
    } else if !client.load_channel.history.is_empty() {
        let legitimate =
            sequence_relative_to(effective_ack.sequence_id, client.first_load_sequence);
        if legitimate >= 0 {
            let mut bit = ACK_PREVIOUS_SEQUENCES;
            while bit > legitimate {
                effective_ack.previous_sequences |= 1u64 << (bit - 1);
                bit -= 1;
            }
        }
    }
    channel.write(
        &mut w,
        &effective_ack,
        &mut client.recently_resent,
        client.rtt,
        now,
        config,
    );

    let has_load = !client.loading_done;
    w.write_bool(has_load);
    if has_load {
        client.load_channel.write(
            &mut w,
            &client.ack_load,
            &mut client.recently_resent_load,
            client.rtt,
            now,
            config,
        );
    } else {
        // Once the peer has acked past the whole load range the load
        // history can never be needed again.
        if !client.load_channel.history.is_empty()
            && client.ack.sequence_id != SEQUENCE_INVALID
            && sequence_relative_to(client.ack.sequence_id, client.first_load_sequence)
                > ACK_PREVIOUS_SEQUENCES
        {
            client.load_channel = ReliableChannel::new();
        }

        // The state frame is optional on the wire; the receiver probes for
        // its presence by remaining length.
        if let Some(frame) = state_history.head() {
            let base = state_history.by_sequence(client.acked_state_frame, now, config);
            let base_id = match base {
                Some(_) => client.acked_state_frame,
                // The peer's baseline fell out of our window; send standalone.
                None => SEQUENCE_INVALID,
            };
            write_sequence_or_invalid(&mut w, base_id);
            codec::encode(&mut w, frame, base);
        }
    }

    Ok(w.finish())
}
