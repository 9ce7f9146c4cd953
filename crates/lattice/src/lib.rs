//! Authoritative state replication and reliable messaging over UDP.
//!
//! A server simulates a world of pooled, revision-tagged objects and
//! streams it to clients as delta-compressed per-tick snapshots against
//! each peer's last acknowledged baseline, alongside a reliable ordered
//! message channel built from per-tick frames, acks with trailing
//! bitmasks, and RTT-paced resends. Clients render a fixed delay behind
//! the stream, blending bracketing snapshots, while their own objects
//! answer to local input immediately.

pub mod config;
pub mod net;
pub mod session;
pub mod snapshot;
pub mod world;

pub use config::NetConfig;
pub use net::{
    Ack, BitReader, BitWriter, ClientPacket, DisconnectReason, FrameCursor, LinkConditions,
    MAX_PACKET_SIZE, Message, MessageFrame, MessageHistory, NetContext, NetworkStats,
    ReliableChannel, Resolution, SequenceHistory, SequenceId, ServerPacket, SimSocket,
    SimulatedNetwork, Transport, UdpTransport, WireError,
};
pub use session::{Client, ClientEvent, ClientMode, Server, ServerEvent};
pub use snapshot::{
    ActiveSet, AgentState, ApplyContext, PlayerState, StateFrame, StateHistory, TransformState,
    WalkerState,
};
pub use world::{
    Buttons, Entity, EntityDef, EntityKind, MAX_ENTITIES, MAX_PLAYERS, PlayerSlot, RemoteInput,
    SlotRef, World,
};
