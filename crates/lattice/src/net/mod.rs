pub mod endpoint;
pub mod message;
pub mod msg;
pub mod packet;
pub mod sequence;
pub mod simulator;
pub mod stats;
pub mod wire;

pub use endpoint::{Transport, UdpTransport};
pub use message::{
    FrameCursor, MessageFrame, MessageHistory, ReliableChannel, SequenceHistory, frame_advance,
    read_frames, update_rtt,
};
pub use msg::Message;
pub use packet::{
    ClientPacket, DisconnectReason, MAX_PACKET_SIZE, PROTOCOL_ID, PROTOCOL_VERSION, PacketError,
    ServerPacket,
};
pub use sequence::{
    ACK_PREVIOUS_SEQUENCES, Ack, SEQUENCE_COUNT, SEQUENCE_INVALID, SequenceId, sequence_advance,
    sequence_more_recent, sequence_relative_to,
};
pub use simulator::{LinkConditions, SimSocket, SimulatedNetwork};
pub use stats::{NetContext, NetworkStats, rand_u64};
pub use wire::{BitReader, BitWriter, Resolution, WireError};
