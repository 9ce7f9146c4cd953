//! Client side of the connection lifecycle: connect retries, the bulk
//! load phase, steady-state update exchange, interpolation-delayed world
//! application, and reconnect on teardown.

use std::collections::VecDeque;
use std::net::SocketAddr;

use glam::{Quat, Vec3};
use log::{debug, info, warn};

use crate::config::NetConfig;
use crate::net::endpoint::Transport;
use crate::net::message::{
    FrameCursor, MessageHistory, ReliableChannel, SequenceHistory, frame_advance, read_frames,
    update_rtt,
};
use crate::net::msg::Message;
use crate::net::packet::{self, ClientPacket, DisconnectReason, MAX_PACKET_SIZE, ServerPacket};
use crate::net::sequence::{
    Ack, SEQUENCE_INVALID, SequenceId, sequence_advance, sequence_more_recent,
    sequence_relative_to,
};
use crate::net::stats::{NetContext, rand_u64};
use crate::net::wire::{BitReader, BitWriter, WireError, read_int, write_int, write_sequence};
use crate::snapshot::{ApplyContext, StateFrame, StateHistory, apply, codec, interpolate};
use crate::world::{
    EntityDef, MAX_ENTITIES, MAX_PLAYERS, RemoteInput, SlotRef, World, write_remote_input,
};

use super::{read_ack, write_ack};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientMode {
    Disconnected,
    Connecting,
    Loading,
    Connected,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Connected,
    Disconnected { reason: DisconnectReason },
    /// Our own controllable object was created.
    AvatarAssigned { slot: SlotRef },
    EntityCreated { slot: SlotRef },
    EntityRemoved { id: u16 },
    /// Authoritative state for a locally-controlled object, delivered the
    /// moment it arrives rather than behind the interpolation delay.
    Correction {
        id: u16,
        position: Vec3,
        rotation: Quat,
        parent: SlotRef,
    },
    TimeSync { match_time: f32 },
    Pong { token: u32 },
}

/// Client session. Drive `update` every frame and `tick` at the fixed
/// tick rate.
pub struct Client<T: Transport> {
    transport: T,
    server_addr: SocketAddr,
    config: NetConfig,
    ctx: NetContext,
    mode: ClientMode,
    uuid: u64,
    name: String,
    /// Automatically re-run the handshake after a server-side teardown.
    pub reconnect: bool,
    channel: ReliableChannel,
    local_sequence: SequenceId,
    msgs_in_history: MessageHistory,
    msgs_in_load_history: MessageHistory,
    /// The server's most recent ack of our frames.
    server_ack: Ack,
    recently_resent: SequenceHistory,
    rtt: f32,
    processed_frame: FrameCursor,
    processed_load_frame: FrameCursor,
    state_history: StateHistory,
    world: World,
    last_receive: f64,
    last_connect_send: f64,
    events: VecDeque<ClientEvent>,
    rtts: [f32; MAX_PLAYERS],
    match_time: f32,
    avatar: Option<SlotRef>,
    interpolated: Option<StateFrame>,
    recv_buf: Box<[u8; MAX_PACKET_SIZE]>,
}

impl<T: Transport> Client<T> {
    /// Start connecting to `server_addr`; the first request goes out on
    /// the next `tick`.
    pub fn connect(transport: T, server_addr: SocketAddr, config: NetConfig, name: &str) -> Self {
        Self {
            transport,
            server_addr,
            config,
            ctx: NetContext::new(),
            mode: ClientMode::Connecting,
            uuid: rand_u64(),
            name: name.to_string(),
            reconnect: false,
            channel: ReliableChannel::new(),
            local_sequence: 0,
            msgs_in_history: MessageHistory::new(),
            msgs_in_load_history: MessageHistory::new(),
            server_ack: Ack::default(),
            recently_resent: SequenceHistory::new(),
            rtt: 0.5,
            processed_frame: FrameCursor::starting_at(0),
            processed_load_frame: FrameCursor::starting_at(0),
            state_history: StateHistory::new(),
            world: World::new(),
            last_receive: 0.0,
            last_connect_send: f64::NEG_INFINITY,
            events: VecDeque::new(),
            rtts: [0.0; MAX_PLAYERS],
            match_time: 0.0,
            avatar: None,
            interpolated: None,
            recv_buf: Box::new([0; MAX_PACKET_SIZE]),
        }
    }

    pub fn mode(&self) -> ClientMode {
        self.mode
    }

    pub fn world(&self) -> &World {
        &self.world
    }

    pub fn world_mut(&mut self) -> &mut World {
        &mut self.world
    }

    pub fn avatar(&self) -> Option<SlotRef> {
        self.avatar
    }

    pub fn rtt(&self) -> f32 {
        self.rtt
    }

    pub fn match_time(&self) -> f32 {
        self.match_time
    }

    pub fn peer_rtt(&self, player: u8) -> f32 {
        self.rtts[usize::from(player) % MAX_PLAYERS]
    }

    pub fn timestamp(&self) -> f64 {
        self.ctx.timestamp
    }

    /// The frame most recently applied to the world (already blended to
    /// the delayed render time).
    pub fn interpolated(&self) -> Option<&StateFrame> {
        self.interpolated.as_ref()
    }

    pub fn drain_events(&mut self) -> impl Iterator<Item = ClientEvent> + '_ {
        self.events.drain(..)
    }

    /// Tunnel a console command to the authority.
    pub fn send_command(&mut self, command: &str) {
        self.channel.enqueue(&Message::DebugCommand {
            command: command.to_string(),
        });
    }

    pub fn ping(&mut self, token: u32) {
        let mut w = BitWriter::new();
        write_int(&mut w, ClientPacket::Ping as i64, 0, ClientPacket::COUNT - 1);
        w.write_bits(token, 32);
        self.send_body(w.finish());
    }

    /// Tell the server we're leaving and drop all session state.
    pub fn disconnect(&mut self) {
        if self.mode != ClientMode::Disconnected {
            let mut w = BitWriter::new();
            write_int(
                &mut w,
                ClientPacket::Disconnect as i64,
                0,
                ClientPacket::COUNT - 1,
            );
            self.send_body(w.finish());
            self.mode = ClientMode::Disconnected;
            self.events.push_back(ClientEvent::Disconnected {
                reason: DisconnectReason::RequestedByPeer,
            });
        }
    }

    /// Drain the transport, apply the delayed interpolated state, and
    /// deliver ordered reliable frames. Call once per render frame.
    pub fn update(&mut self, dt: f64) {
        self.ctx.advance(dt);
        let now = self.ctx.timestamp;

        loop {
            match self.transport.recv_from(&mut self.recv_buf[..]) {
                Ok(Some((size, addr))) => {
                    if addr != self.server_addr {
                        continue; // unknown host
                    }
                    self.ctx.record_received(size);
                    let datagram = self.recv_buf[..size].to_vec();
                    match packet::open(&datagram) {
                        Ok(body) => {
                            if let Err(e) = self.handle_packet(&body) {
                                debug!("dropping server packet: {e}");
                            }
                        }
                        Err(e) => debug!("discarding datagram: {e}"),
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("transport receive error: {e}");
                    break;
                }
            }
        }

        let interpolation_time = now - f64::from(self.config.interpolation_delay);

        // Render state always trails the freshest data by the fixed
        // delay; with only one bracketing frame (stream stall) it is
        // shown directly.
        if let Some(frame) = self
            .state_history
            .by_timestamp(interpolation_time, now, &self.config)
        {
            let next = self.state_history.next_after(frame);
            let blended = match next {
                Some(next) => interpolate(
                    frame,
                    next,
                    interpolation_time,
                    self.config.tick_dt(),
                    Some(&self.world),
                ),
                None => frame.clone(),
            };
            let ctx = ApplyContext {
                now,
                rtt: self.rtt,
                interpolation_delay: self.config.interpolation_delay,
                tick_dt: self.config.tick_dt(),
            };
            apply(&blended, frame, next, &mut self.world, &ctx);
            self.interpolated = Some(blended);
        }

        // Ordered reliable delivery. Load frames flow as soon as they
        // arrive; steady-state frames wait for the interpolation horizon
        // so message effects line up with the rendered world.
        loop {
            let payload = {
                let (history, cursor, cutoff) = match self.mode {
                    ClientMode::Loading => {
                        (&self.msgs_in_load_history, &mut self.processed_load_frame, now)
                    }
                    ClientMode::Connected => (
                        &self.msgs_in_history,
                        &mut self.processed_frame,
                        interpolation_time,
                    ),
                    ClientMode::Disconnected | ClientMode::Connecting => break,
                };
                match frame_advance(history, cursor, cutoff, now, &self.config) {
                    Some(frame) => frame.payload.clone(),
                    None => break,
                }
            };
            match Message::decode_frame(&payload) {
                Ok(messages) => {
                    for message in messages {
                        self.process_message(message);
                    }
                }
                Err(e) => warn!("bad reliable frame from server: {e}"),
            }
        }
    }

    /// One fixed-rate tick: retry the handshake, or consolidate and send
    /// this tick's update packet.
    pub fn tick(&mut self, _dt: f64) {
        let now = self.ctx.timestamp;
        match self.mode {
            ClientMode::Disconnected => {}
            ClientMode::Connecting => {
                if now - self.last_connect_send >= f64::from(self.config.connect_retry_interval) {
                    self.last_connect_send = now;
                    info!("connecting to {}...", self.server_addr);
                    let mut w = BitWriter::new();
                    write_int(
                        &mut w,
                        ClientPacket::Connect as i64,
                        0,
                        ClientPacket::COUNT - 1,
                    );
                    self.send_body(w.finish());
                }
            }
            ClientMode::Loading | ClientMode::Connected => {
                if now - self.last_receive > f64::from(self.config.timeout) {
                    info!("connection to {} timed out", self.server_addr);
                    self.handle_disconnect(DisconnectReason::Timeout);
                    return;
                }
                self.channel
                    .consolidate(self.local_sequence, now, &self.config);
                let body = self.build_update_body(now);
                self.send_body(body);
                self.local_sequence = sequence_advance(self.local_sequence, 1);
            }
        }
    }

    fn build_update_body(&mut self, now: f64) -> Vec<u8> {
        let mut w = BitWriter::new();
        write_int(
            &mut w,
            ClientPacket::Update as i64,
            0,
            ClientPacket::COUNT - 1,
        );

        write_ack(&mut w, &self.msgs_in_history.ack(now, &self.config));
        self.channel.write(
            &mut w,
            &self.server_ack,
            &mut self.recently_resent,
            self.rtt,
            now,
            &self.config,
        );

        let has_ack_load = self.mode == ClientMode::Loading;
        w.write_bool(has_ack_load);
        if has_ack_load {
            write_ack(&mut w, &self.msgs_in_load_history.ack(now, &self.config));
        }

        // Which state frame we hold, as the server's delta baseline.
        let most_recent_state = self
            .state_history
            .head()
            .map(|f| f.sequence_id)
            .unwrap_or(SEQUENCE_INVALID);
        crate::net::wire::write_sequence_or_invalid(&mut w, most_recent_state);

        // The current sequence id rides outside the frame stream; the
        // frame itself may not have fit.
        write_sequence(&mut w, self.local_sequence);

        // Input snapshots for our controlled objects.
        let input = if self.mode == ClientMode::Connected {
            self.avatar.and_then(|slot| {
                self.world.resolve(slot).map(|entity| {
                    (
                        slot.id,
                        RemoteInput {
                            movement: entity.input.movement,
                            buttons: entity.input.buttons,
                            parent: entity.parent,
                            position: entity.position,
                            rotation: entity.rotation,
                        },
                    )
                })
            })
        } else {
            None
        };
        match input {
            Some((id, input)) => {
                write_int(&mut w, 1, 0, MAX_PLAYERS as i64);
                write_int(&mut w, i64::from(id), 0, MAX_ENTITIES as i64 - 1);
                write_remote_input(&mut w, &input);
            }
            None => write_int(&mut w, 0, 0, MAX_PLAYERS as i64),
        }

        w.finish()
    }

    fn handle_packet(&mut self, body: &[u8]) -> Result<(), WireError> {
        let mut r = BitReader::new(body);
        let kind = ServerPacket::from_index(read_int(&mut r, 0, ServerPacket::COUNT - 1)?)
            .ok_or(WireError::ValueOutOfRange)?;
        match kind {
            ServerPacket::Init => {
                if self.mode == ClientMode::Connecting {
                    let first_load_sequence = crate::net::wire::read_sequence(&mut r)?;
                    let tick_rate = read_int(&mut r, 1, 512)? as u32;
                    self.config.tick_rate = tick_rate;
                    self.processed_frame = FrameCursor::starting_at(first_load_sequence);
                    self.processed_load_frame = FrameCursor::starting_at(first_load_sequence);
                    self.mode = ClientMode::Loading;
                    self.last_receive = self.ctx.timestamp;
                    info!("loading; stream starts at sequence {first_load_sequence}");
                    let setup = Message::ClientSetup {
                        uuid: self.uuid,
                        name: self.name.clone(),
                    };
                    self.channel.enqueue(&setup);
                }
                Ok(())
            }
            ServerPacket::Update => self.handle_update(&mut r),
            ServerPacket::Disconnect => {
                let reason =
                    DisconnectReason::from_index(read_int(&mut r, 0, DisconnectReason::COUNT - 1)?)
                        .ok_or(WireError::ValueOutOfRange)?;
                info!("connection closed by server: {reason:?}");
                self.handle_disconnect(reason);
                Ok(())
            }
            ServerPacket::PingResponse => {
                let token = r.read_bits(32)?;
                self.events.push_back(ClientEvent::Pong { token });
                Ok(())
            }
        }
    }

    fn handle_update(&mut self, r: &mut BitReader) -> Result<(), WireError> {
        // Need the init packet first; after a teardown the stream is dead.
        if matches!(self.mode, ClientMode::Connecting | ClientMode::Disconnected) {
            return Ok(());
        }
        let now = self.ctx.timestamp;
        let config = self.config.clone();

        let ack_candidate = read_ack(r)?;
        if sequence_more_recent(ack_candidate.sequence_id, self.server_ack.sequence_id) {
            self.server_ack = ack_candidate;
        }
        read_frames(r, &mut self.msgs_in_history, now, &config)?;

        update_rtt(
            &mut self.rtt,
            &self.server_ack,
            &self.channel.history,
            now,
            &config,
        );

        let has_load_msgs = r.read_bool()?;
        if has_load_msgs {
            read_frames(r, &mut self.msgs_in_load_history, now, &config)?;
        }

        // A state frame may follow; probe by remaining length (trailing
        // byte-alignment padding is always under 16 bits).
        if r.bits_remaining() >= 16 {
            let base_id = crate::net::wire::read_sequence_or_invalid(r)?;
            let base = self.state_history.by_sequence(base_id, now, &config);

            // The server must reference a baseline we actually hold; a
            // baseline from the load range (or one we lost) is
            // unrecoverable.
            if (base_id == SEQUENCE_INVALID) != base.is_none() {
                warn!("missing delta baseline {base_id}; connection is desynchronized");
                self.handle_disconnect(DisconnectReason::SequenceGap);
                return Ok(());
            }

            let frame = codec::decode(r, base, now)?;

            let cursor = if has_load_msgs {
                &self.processed_load_frame
            } else {
                &self.processed_frame
            };
            if sequence_relative_to(cursor.sequence_id, frame.sequence_id).abs()
                > config.max_sequence_gap
            {
                warn!(
                    "sequence gap: processed {} vs incoming {}",
                    cursor.sequence_id, frame.sequence_id
                );
                self.handle_disconnect(DisconnectReason::SequenceGap);
                return Ok(());
            }

            let newer = self
                .state_history
                .head()
                .is_none_or(|head| sequence_more_recent(frame.sequence_id, head.sequence_id));
            if newer {
                // Local objects skip the interpolation queue: surface
                // their authoritative state immediately.
                for (id, entity) in self.world.iter() {
                    let index = usize::from(id);
                    if entity.locally_controlled
                        && frame.transforms_active.get(index)
                        && self.world.revision(id)
                            == Some(frame.transforms[index].revision)
                    {
                        let state = &frame.transforms[index];
                        self.events.push_back(ClientEvent::Correction {
                            id,
                            position: state.position,
                            rotation: state.rotation,
                            parent: state.parent,
                        });
                    }
                }
                self.state_history.insert(frame);
            }
        }

        self.last_receive = now;
        Ok(())
    }

    fn process_message(&mut self, message: Message) {
        match message {
            Message::Noop => {}
            Message::EntityCreate { id, revision, def } => {
                let Some(slot) = self.world.net_add(id, revision, &def) else {
                    warn!("entity create for invalid slot {id}");
                    return;
                };
                if let EntityDef::Avatar { uuid, .. } = def {
                    if uuid == self.uuid {
                        if let Some(entity) = self.world.get_mut(id) {
                            entity.locally_controlled = true;
                        }
                        self.avatar = Some(slot);
                        self.events.push_back(ClientEvent::AvatarAssigned { slot });
                    }
                }
                self.events.push_back(ClientEvent::EntityCreated { slot });
            }
            Message::EntityRemove { id } => {
                if self.world.net_remove(id) {
                    if self.avatar.is_some_and(|slot| slot.id == id) {
                        self.avatar = None;
                    }
                    self.events.push_back(ClientEvent::EntityRemoved { id });
                }
            }
            Message::InitDone => {
                if self.mode == ClientMode::Loading {
                    info!("finished loading");
                    self.mode = ClientMode::Connected;
                    self.channel.enqueue(&Message::LoadingDone);
                    self.events.push_back(ClientEvent::Connected);
                }
            }
            Message::TimeSync { match_time, rtts } => {
                self.match_time = match_time;
                for (player, rtt) in rtts {
                    self.rtts[usize::from(player) % MAX_PLAYERS] = rtt;
                }
                self.events.push_back(ClientEvent::TimeSync { match_time });
            }
            Message::ClientSetup { .. } | Message::LoadingDone => {
                warn!("ignoring client-originated message from server");
            }
            Message::DebugCommand { .. } => {}
        }
    }

    fn handle_disconnect(&mut self, reason: DisconnectReason) {
        if self.mode == ClientMode::Disconnected {
            return;
        }
        self.mode = ClientMode::Disconnected;
        self.events.push_back(ClientEvent::Disconnected { reason });
        if self.reconnect {
            info!("reconnecting to {}", self.server_addr);
            self.reset_session();
            self.mode = ClientMode::Connecting;
        }
    }

    /// Discard all per-connection state ahead of a fresh handshake.
    fn reset_session(&mut self) {
        self.channel = ReliableChannel::new();
        self.local_sequence = 0;
        self.msgs_in_history = MessageHistory::new();
        self.msgs_in_load_history = MessageHistory::new();
        self.server_ack = Ack::default();
        self.recently_resent = SequenceHistory::new();
        self.rtt = 0.5;
        self.processed_frame = FrameCursor::starting_at(0);
        self.processed_load_frame = FrameCursor::starting_at(0);
        self.state_history = StateHistory::new();
        self.world = World::new();
        self.avatar = None;
        self.interpolated = None;
        self.last_connect_send = f64::NEG_INFINITY;
        self.uuid = rand_u64();
    }

    fn send_body(&mut self, body: Vec<u8>) {
        match packet::seal(body) {
            Ok(datagram) => {
                self.ctx.record_sent(datagram.len());
                if let Err(e) = self.transport.send_to(&datagram, self.server_addr) {
                    warn!("send failed: {e}");
                }
            }
            Err(e) => warn!("packet not sent: {e}"),
        }
    }
}
