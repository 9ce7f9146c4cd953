//! Application-level reliable messages. Each tick's worth is packed into a
//! single frame by the channel; individual messages are self-delimiting
//! (type tag + body, byte-aligned) so a frame decodes as a plain sequence.

use crate::net::wire::{
    BitReader, BitWriter, WireError, read_f32_range, read_int, read_string, write_f32_range,
    write_int, write_string,
};
use crate::world::{
    EntityDef, MAX_ENTITIES, MAX_PLAYERS, read_entity_def, write_entity_def,
};

/// Longest accepted name / debug command payloads.
pub const MAX_NAME_LEN: usize = 32;
pub const MAX_COMMAND_LEN: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Placeholder so every tick carries exactly one frame.
    Noop,
    /// Authority materializes an object at a slot.
    EntityCreate {
        id: u16,
        revision: u16,
        def: EntityDef,
    },
    /// Authority removes an object.
    EntityRemove { id: u16 },
    /// End of the initial world dump.
    InitDone,
    /// Client finished applying the dump.
    LoadingDone,
    /// Client introduces itself after the init reply.
    ClientSetup { uuid: u64, name: String },
    /// Match clock plus everyone's smoothed rtt.
    TimeSync {
        match_time: f32,
        rtts: Vec<(u8, f32)>,
    },
    /// Arbitrary console command tunneled to the authority.
    DebugCommand { command: String },
}

const MESSAGE_TYPE_COUNT: i64 = 8;

impl Message {
    fn type_index(&self) -> i64 {
        match self {
            Self::Noop => 0,
            Self::EntityCreate { .. } => 1,
            Self::EntityRemove { .. } => 2,
            Self::InitDone => 3,
            Self::LoadingDone => 4,
            Self::ClientSetup { .. } => 5,
            Self::TimeSync { .. } => 6,
            Self::DebugCommand { .. } => 7,
        }
    }

    /// Encode to a standalone byte-aligned chunk.
    pub fn encode(&self) -> Vec<u8> {
        let mut w = BitWriter::new();
        write_int(&mut w, self.type_index(), 0, MESSAGE_TYPE_COUNT - 1);
        match self {
            Self::Noop | Self::InitDone | Self::LoadingDone => {}
            Self::EntityCreate { id, revision, def } => {
                write_int(&mut w, i64::from(*id), 0, MAX_ENTITIES as i64 - 1);
                w.write_bits(u32::from(*revision), 16);
                write_entity_def(&mut w, def);
            }
            Self::EntityRemove { id } => {
                write_int(&mut w, i64::from(*id), 0, MAX_ENTITIES as i64 - 1);
            }
            Self::ClientSetup { uuid, name } => {
                w.write_u64(*uuid);
                write_string(&mut w, name, MAX_NAME_LEN);
            }
            Self::TimeSync { match_time, rtts } => {
                w.write_f32(*match_time);
                write_int(&mut w, rtts.len() as i64, 0, MAX_PLAYERS as i64);
                for (player, rtt) in rtts {
                    write_int(&mut w, i64::from(*player), 0, MAX_PLAYERS as i64 - 1);
                    write_f32_range(&mut w, *rtt, 0.0, 1.024, 10);
                }
            }
            Self::DebugCommand { command } => {
                write_string(&mut w, command, MAX_COMMAND_LEN);
            }
        }
        w.finish()
    }

    pub fn decode(r: &mut BitReader) -> Result<Self, WireError> {
        let message = match read_int(r, 0, MESSAGE_TYPE_COUNT - 1)? {
            0 => Self::Noop,
            1 => Self::EntityCreate {
                id: read_int(r, 0, MAX_ENTITIES as i64 - 1)? as u16,
                revision: r.read_bits(16)? as u16,
                def: read_entity_def(r)?,
            },
            2 => Self::EntityRemove {
                id: read_int(r, 0, MAX_ENTITIES as i64 - 1)? as u16,
            },
            3 => Self::InitDone,
            4 => Self::LoadingDone,
            5 => Self::ClientSetup {
                uuid: r.read_u64()?,
                name: read_string(r, MAX_NAME_LEN)?,
            },
            6 => {
                let match_time = r.read_f32()?;
                let count = read_int(r, 0, MAX_PLAYERS as i64)?;
                let mut rtts = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let player = read_int(r, 0, MAX_PLAYERS as i64 - 1)? as u8;
                    let rtt = read_f32_range(r, 0.0, 1.024, 10)?;
                    rtts.push((player, rtt));
                }
                Self::TimeSync { match_time, rtts }
            }
            7 => Self::DebugCommand {
                command: read_string(r, MAX_COMMAND_LEN)?,
            },
            _ => return Err(WireError::ValueOutOfRange),
        };
        r.align()?;
        Ok(message)
    }

    /// Decode every message in a frame payload.
    pub fn decode_frame(payload: &[u8]) -> Result<Vec<Self>, WireError> {
        let mut r = BitReader::new(payload);
        let mut messages = Vec::new();
        while r.bits_remaining() >= 8 {
            messages.push(Self::decode(&mut r)?);
        }
        Ok(messages)
    }
}
