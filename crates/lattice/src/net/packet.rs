//! Outer datagram layer: kind discriminators, integrity checksum, optional
//! body compression. Anything that fails here is silently discarded by the
//! caller; a bad checksum must have no ack side effects.

use log::debug;
use thiserror::Error;

use super::wire::{WireError, crc32};

/// Hard ceiling for one datagram on the wire.
pub const MAX_PACKET_SIZE: usize = 1200;

pub const PROTOCOL_ID: u32 = 0x6c61_7463;
pub const PROTOCOL_VERSION: u16 = 1;

/// Bodies at or below this size skip compression entirely.
const COMPRESSION_THRESHOLD: usize = 384;
/// Largest body accepted before compression; bounds the decompression
/// buffer on the receive side.
const MAX_BODY_BYTES: usize = MAX_PACKET_SIZE * 4;
const FLAG_COMPRESSED: u8 = 1 << 0;
/// crc (4 bytes) + flags (1 byte).
const ENVELOPE_BYTES: usize = 5;

/// Checksum seed; folds the protocol id and version together so a peer on
/// a different build fails the checksum without being parsed.
const fn checksum_seed() -> u32 {
    PROTOCOL_ID ^ (PROTOCOL_VERSION as u32).rotate_left(16)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ClientPacket {
    Connect = 0,
    Update = 1,
    Disconnect = 2,
    Ping = 3,
}

impl ClientPacket {
    pub const COUNT: i64 = 4;

    pub fn from_index(index: i64) -> Option<Self> {
        match index {
            0 => Some(Self::Connect),
            1 => Some(Self::Update),
            2 => Some(Self::Disconnect),
            3 => Some(Self::Ping),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ServerPacket {
    Init = 0,
    Update = 1,
    Disconnect = 2,
    PingResponse = 3,
}

impl ServerPacket {
    pub const COUNT: i64 = 4;

    pub fn from_index(index: i64) -> Option<Self> {
        match index {
            0 => Some(Self::Init),
            1 => Some(Self::Update),
            2 => Some(Self::Disconnect),
            3 => Some(Self::PingResponse),
            _ => None,
        }
    }
}

/// Why a connection ended, carried in the dedicated disconnect packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DisconnectReason {
    RequestedByPeer = 0,
    Timeout = 1,
    SequenceGap = 2,
    ServerFull = 3,
}

impl DisconnectReason {
    pub const COUNT: i64 = 4;

    pub fn from_index(index: i64) -> Option<Self> {
        match index {
            0 => Some(Self::RequestedByPeer),
            1 => Some(Self::Timeout),
            2 => Some(Self::SequenceGap),
            3 => Some(Self::ServerFull),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum PacketError {
    #[error("datagram too short ({0} bytes)")]
    Truncated(usize),
    #[error("checksum mismatch")]
    ChecksumMismatch,
    #[error("sealed datagram would exceed {MAX_PACKET_SIZE} bytes ({0})")]
    Oversized(usize),
    #[error("corrupt compressed body")]
    Decompress,
    #[error(transparent)]
    Wire(#[from] WireError),
}

/// Wrap a finished body for the wire: compress when it pays, prefix flags
/// and checksum.
pub fn seal(body: Vec<u8>) -> Result<Vec<u8>, PacketError> {
    let mut flags = 0u8;
    let mut body = body;

    if body.len() > MAX_BODY_BYTES {
        return Err(PacketError::Oversized(body.len()));
    }

    if body.len() > COMPRESSION_THRESHOLD {
        if let Ok(compressed) = zstd::bulk::compress(&body, 1) {
            if compressed.len() < body.len() {
                debug!("compressed body {} -> {} bytes", body.len(), compressed.len());
                body = compressed;
                flags |= FLAG_COMPRESSED;
            }
        }
    }

    let total = ENVELOPE_BYTES + body.len();
    if total > MAX_PACKET_SIZE {
        return Err(PacketError::Oversized(total));
    }

    let mut datagram = Vec::with_capacity(total);
    datagram.extend_from_slice(&[0u8; 4]);
    datagram.push(flags);
    datagram.extend_from_slice(&body);
    let checksum = crc32(&datagram[4..], checksum_seed());
    datagram[..4].copy_from_slice(&checksum.to_le_bytes());
    Ok(datagram)
}

/// Validate and unwrap a received datagram into its body bytes.
pub fn open(datagram: &[u8]) -> Result<Vec<u8>, PacketError> {
    if datagram.len() < ENVELOPE_BYTES {
        return Err(PacketError::Truncated(datagram.len()));
    }
    let stated = u32::from_le_bytes([datagram[0], datagram[1], datagram[2], datagram[3]]);
    if crc32(&datagram[4..], checksum_seed()) != stated {
        return Err(PacketError::ChecksumMismatch);
    }
    let flags = datagram[4];
    let body = &datagram[ENVELOPE_BYTES..];
    if flags & FLAG_COMPRESSED != 0 {
        zstd::bulk::decompress(body, MAX_BODY_BYTES).map_err(|_| PacketError::Decompress)
    } else {
        Ok(body.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_roundtrip_small() {
        let body = b"connect request".to_vec();
        let datagram = seal(body.clone()).unwrap();
        assert_eq!(open(&datagram).unwrap(), body);
    }

    #[test]
    fn large_compressible_body_is_compressed() {
        let body = vec![7u8; 1100];
        let datagram = seal(body.clone()).unwrap();
        assert!(datagram.len() < body.len());
        assert_eq!(open(&datagram).unwrap(), body);
    }

    #[test]
    fn corruption_is_rejected() {
        let mut datagram = seal(b"state".to_vec()).unwrap();
        let last = datagram.len() - 1;
        datagram[last] ^= 0x01;
        assert!(matches!(open(&datagram), Err(PacketError::ChecksumMismatch)));
    }

    #[test]
    fn truncation_is_rejected() {
        let datagram = seal(b"state".to_vec()).unwrap();
        assert!(matches!(
            open(&datagram[..3]),
            Err(PacketError::Truncated(_))
        ));
        assert!(matches!(open(&[]), Err(PacketError::Truncated(0))));
    }

    #[test]
    fn incompressible_oversized_body_errors() {
        // Pseudo-random bytes don't compress; an over-budget body must be
        // reported, not sent.
        let mut state = 0x1234_5678_9abc_def0u64;
        let body: Vec<u8> = (0..MAX_PACKET_SIZE + 64)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                state as u8
            })
            .collect();
        assert!(matches!(seal(body), Err(PacketError::Oversized(_))));
    }
}
