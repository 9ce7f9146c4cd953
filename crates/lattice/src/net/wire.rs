//! Bit-level wire primitives: packing, range-bounded quantization, checksum.
//!
//! Every multi-bit value on the wire is written with an explicit bit count
//! derived from a declared `[min, max]` range, so the format is fully
//! self-describing in code and a corrupted field is caught as an
//! out-of-range read rather than silently misinterpreted.

use glam::{Quat, Vec3};
use thiserror::Error;

use super::sequence::{SEQUENCE_BITS, SEQUENCE_COUNT, SEQUENCE_INVALID, SequenceId};

/// Half-extent of the replicated world along each axis. Positions outside
/// are clamped at encode time.
pub const WORLD_EXTENT: f32 = 256.0;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("bit stream overflow")]
    Overflow,
    #[error("value out of declared range")]
    ValueOutOfRange,
    #[error("malformed string payload")]
    MalformedString,
}

/// Positional precision tier assigned per replicated object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Resolution {
    Low = 0,
    #[default]
    Medium = 1,
    High = 2,
}

impl Resolution {
    pub const COUNT: i64 = 3;

    pub fn from_index(index: i64) -> Option<Self> {
        match index {
            0 => Some(Self::Low),
            1 => Some(Self::Medium),
            2 => Some(Self::High),
            _ => None,
        }
    }

    /// Per-axis bit width for positions in `[-WORLD_EXTENT, WORLD_EXTENT]`.
    /// Each tier's quantization step sits just under its equality tolerance.
    pub fn position_bits(self) -> u32 {
        match self {
            Self::Low => 16,
            Self::Medium => 18,
            Self::High => 19,
        }
    }

    /// Positional equality tolerance: two values closer than this are not
    /// worth retransmitting.
    pub fn position_tolerance(self) -> f32 {
        match self {
            Self::Low => 0.008,
            Self::Medium => 0.002,
            Self::High => 0.001,
        }
    }

    /// Per-component bit width for quaternions in `[-1, 1]`.
    pub fn rotation_bits(self) -> u32 {
        match self {
            Self::Low => 12,
            Self::Medium => 14,
            Self::High => 17,
        }
    }

    /// Rotational equality tolerance as a shortest-arc angle in radians.
    pub fn rotation_tolerance(self) -> f32 {
        match self {
            Self::Low => 0.002,
            Self::Medium => 0.001,
            Self::High => 0.0001,
        }
    }
}

/// Number of bits needed to encode any value in `[min, max]`.
pub fn bits_required(min: i64, max: i64) -> u32 {
    debug_assert!(min < max);
    64 - ((max - min) as u64).leading_zeros()
}

/// Bit-granular writer backed by a growable byte buffer.
#[derive(Debug, Default)]
pub struct BitWriter {
    bytes: Vec<u8>,
    scratch: u64,
    scratch_bits: u32,
}

impl BitWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_bits(&mut self, value: u32, bits: u32) {
        debug_assert!(bits >= 1 && bits <= 32);
        debug_assert!(bits == 32 || u64::from(value) < (1u64 << bits));
        self.scratch |= u64::from(value) << self.scratch_bits;
        self.scratch_bits += bits;
        while self.scratch_bits >= 8 {
            self.bytes.push((self.scratch & 0xff) as u8);
            self.scratch >>= 8;
            self.scratch_bits -= 8;
        }
    }

    pub fn write_bool(&mut self, value: bool) {
        self.write_bits(u32::from(value), 1);
    }

    pub fn write_u64(&mut self, value: u64) {
        self.write_bits((value & 0xffff_ffff) as u32, 32);
        self.write_bits((value >> 32) as u32, 32);
    }

    /// Full-precision f32 (raw bits).
    pub fn write_f32(&mut self, value: f32) {
        self.write_bits(value.to_bits(), 32);
    }

    /// Pad to the next byte boundary with zero bits.
    pub fn align(&mut self) {
        let rem = self.scratch_bits % 8;
        if rem != 0 {
            self.write_bits(0, 8 - rem);
        }
    }

    /// Raw bytes; aligns first so the payload is byte-addressable.
    pub fn write_bytes(&mut self, data: &[u8]) {
        self.align();
        debug_assert_eq!(self.scratch_bits, 0);
        self.bytes.extend_from_slice(data);
    }

    pub fn bits_written(&self) -> usize {
        self.bytes.len() * 8 + self.scratch_bits as usize
    }

    pub fn bytes_written(&self) -> usize {
        self.bytes.len() + self.scratch_bits.div_ceil(8) as usize
    }

    /// Flush and take the buffer.
    pub fn finish(mut self) -> Vec<u8> {
        self.align();
        self.bytes
    }
}

/// Bit-granular reader over a received byte slice.
#[derive(Debug)]
pub struct BitReader<'a> {
    bytes: &'a [u8],
    byte_pos: usize,
    scratch: u64,
    scratch_bits: u32,
}

impl<'a> BitReader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self {
            bytes,
            byte_pos: 0,
            scratch: 0,
            scratch_bits: 0,
        }
    }

    pub fn read_bits(&mut self, bits: u32) -> Result<u32, WireError> {
        debug_assert!(bits >= 1 && bits <= 32);
        while self.scratch_bits < bits {
            let byte = *self.bytes.get(self.byte_pos).ok_or(WireError::Overflow)?;
            self.scratch |= u64::from(byte) << self.scratch_bits;
            self.scratch_bits += 8;
            self.byte_pos += 1;
        }
        let mask = if bits == 32 {
            u32::MAX
        } else {
            (1u32 << bits) - 1
        };
        let value = (self.scratch as u32) & mask;
        self.scratch >>= bits;
        self.scratch_bits -= bits;
        Ok(value)
    }

    pub fn read_bool(&mut self) -> Result<bool, WireError> {
        Ok(self.read_bits(1)? != 0)
    }

    pub fn read_u64(&mut self) -> Result<u64, WireError> {
        let lo = u64::from(self.read_bits(32)?);
        let hi = u64::from(self.read_bits(32)?);
        Ok(lo | (hi << 32))
    }

    pub fn read_f32(&mut self) -> Result<f32, WireError> {
        Ok(f32::from_bits(self.read_bits(32)?))
    }

    pub fn align(&mut self) -> Result<(), WireError> {
        // Unconsumed scratch bits past a byte boundary are exactly the
        // writer's zero padding for the current byte.
        let rem = self.scratch_bits % 8;
        if rem != 0 {
            let padding = self.read_bits(rem)?;
            if padding != 0 {
                return Err(WireError::ValueOutOfRange);
            }
        }
        Ok(())
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], WireError> {
        self.align()?;
        // Any whole bytes sitting in scratch were already consumed from the
        // slice; step back over them.
        let start = self.byte_pos - (self.scratch_bits / 8) as usize;
        let end = start.checked_add(len).ok_or(WireError::Overflow)?;
        if end > self.bytes.len() {
            return Err(WireError::Overflow);
        }
        self.scratch = 0;
        self.scratch_bits = 0;
        self.byte_pos = end;
        Ok(&self.bytes[start..end])
    }

    pub fn bits_remaining(&self) -> usize {
        (self.bytes.len() - self.byte_pos) * 8 + self.scratch_bits as usize
    }
}

/// Write an integer known to lie in `[min, max]` using the minimal bit count.
pub fn write_int(w: &mut BitWriter, value: i64, min: i64, max: i64) {
    debug_assert!(value >= min && value <= max, "{value} not in [{min}, {max}]");
    w.write_bits((value - min) as u32, bits_required(min, max));
}

/// Read an integer in `[min, max]`; values outside the range are a protocol
/// error, not a panic.
pub fn read_int(r: &mut BitReader, min: i64, max: i64) -> Result<i64, WireError> {
    let raw = i64::from(r.read_bits(bits_required(min, max))?);
    let value = min + raw;
    if value > max {
        return Err(WireError::ValueOutOfRange);
    }
    Ok(value)
}

/// Quantize a float into `[min, max]` at the given bit width. Clamps on
/// write; reconstruction error is at most half a quantization step.
pub fn write_f32_range(w: &mut BitWriter, value: f32, min: f32, max: f32, bits: u32) {
    debug_assert!(min < max && bits >= 1 && bits <= 32);
    let clamped = value.clamp(min, max);
    let steps = ((1u64 << bits) - 1) as f32;
    let normalized = (clamped - min) / (max - min);
    w.write_bits((normalized * steps).round() as u32, bits);
}

pub fn read_f32_range(r: &mut BitReader, min: f32, max: f32, bits: u32) -> Result<f32, WireError> {
    let steps = ((1u64 << bits) - 1) as f32;
    let raw = r.read_bits(bits)? as f32;
    Ok(min + (raw / steps) * (max - min))
}

/// Length-prefixed UTF-8 string, byte-aligned payload.
pub fn write_string(w: &mut BitWriter, value: &str, max_len: usize) {
    let bytes = value.as_bytes();
    let len = bytes.len().min(max_len);
    write_int(w, len as i64, 0, max_len as i64);
    w.write_bytes(&bytes[..len]);
}

pub fn read_string(r: &mut BitReader, max_len: usize) -> Result<String, WireError> {
    let len = read_int(r, 0, max_len as i64)? as usize;
    let bytes = r.read_bytes(len)?;
    String::from_utf8(bytes.to_vec()).map_err(|_| WireError::MalformedString)
}

/// Sequence id in the valid range.
pub fn write_sequence(w: &mut BitWriter, id: SequenceId) {
    debug_assert!(id < SEQUENCE_COUNT);
    w.write_bits(u32::from(id), SEQUENCE_BITS);
}

pub fn read_sequence(r: &mut BitReader) -> Result<SequenceId, WireError> {
    Ok(r.read_bits(SEQUENCE_BITS)? as SequenceId)
}

/// Sequence id that may also carry the "nothing yet" sentinel; one extra
/// bit of range.
pub fn write_sequence_or_invalid(w: &mut BitWriter, id: SequenceId) {
    write_int(w, i64::from(id), 0, i64::from(SEQUENCE_COUNT));
}

pub fn read_sequence_or_invalid(r: &mut BitReader) -> Result<SequenceId, WireError> {
    let id = read_int(r, 0, i64::from(SEQUENCE_COUNT))? as SequenceId;
    debug_assert!(id <= SEQUENCE_INVALID);
    Ok(id)
}

/// Position quantized per the slot's resolution tier.
pub fn write_position(w: &mut BitWriter, position: Vec3, resolution: Resolution) {
    let bits = resolution.position_bits();
    for axis in position.to_array() {
        write_f32_range(w, axis, -WORLD_EXTENT, WORLD_EXTENT, bits);
    }
}

pub fn read_position(r: &mut BitReader, resolution: Resolution) -> Result<Vec3, WireError> {
    let bits = resolution.position_bits();
    let x = read_f32_range(r, -WORLD_EXTENT, WORLD_EXTENT, bits)?;
    let y = read_f32_range(r, -WORLD_EXTENT, WORLD_EXTENT, bits)?;
    let z = read_f32_range(r, -WORLD_EXTENT, WORLD_EXTENT, bits)?;
    Ok(Vec3::new(x, y, z))
}

/// Rotation quantized per component, renormalized on read.
pub fn write_rotation(w: &mut BitWriter, rotation: Quat, resolution: Resolution) {
    let bits = resolution.rotation_bits();
    for component in rotation.to_array() {
        write_f32_range(w, component, -1.0, 1.0, bits);
    }
}

pub fn read_rotation(r: &mut BitReader, resolution: Resolution) -> Result<Quat, WireError> {
    let bits = resolution.rotation_bits();
    let x = read_f32_range(r, -1.0, 1.0, bits)?;
    let y = read_f32_range(r, -1.0, 1.0, bits)?;
    let z = read_f32_range(r, -1.0, 1.0, bits)?;
    let w_c = read_f32_range(r, -1.0, 1.0, bits)?;
    let q = Quat::from_xyzw(x, y, z, w_c);
    if q.length_squared() < 1e-6 {
        // Corrupt or degenerate payload; identity is the safe reconstruction.
        return Ok(Quat::IDENTITY);
    }
    Ok(q.normalize())
}

const CRC32_POLYNOMIAL: u32 = 0xedb8_8320;

const fn crc32_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u32;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ CRC32_POLYNOMIAL
            } else {
                crc >> 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

static CRC32_TABLE: [u32; 256] = crc32_table();

/// CRC-32 with an arbitrary seed so the protocol id can be folded in:
/// a peer on a different protocol fails the checksum without a parse.
pub fn crc32(bytes: &[u8], seed: u32) -> u32 {
    let mut crc = !seed;
    for &byte in bytes {
        crc = (crc >> 8) ^ CRC32_TABLE[((crc ^ u32::from(byte)) & 0xff) as usize];
    }
    !crc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bits_roundtrip() {
        let mut w = BitWriter::new();
        w.write_bits(0b101, 3);
        w.write_bool(true);
        w.write_bits(0xdead, 16);
        w.write_u64(0x0123_4567_89ab_cdef);
        w.write_f32(-12.75);
        let bytes = w.finish();

        let mut r = BitReader::new(&bytes);
        assert_eq!(r.read_bits(3).unwrap(), 0b101);
        assert!(r.read_bool().unwrap());
        assert_eq!(r.read_bits(16).unwrap(), 0xdead);
        assert_eq!(r.read_u64().unwrap(), 0x0123_4567_89ab_cdef);
        assert_eq!(r.read_f32().unwrap(), -12.75);
    }

    #[test]
    fn aligned_bytes_roundtrip() {
        let mut w = BitWriter::new();
        w.write_bits(0b11, 2);
        w.write_bytes(b"frame payload");
        w.write_bits(7, 3);
        let bytes = w.finish();

        let mut r = BitReader::new(&bytes);
        assert_eq!(r.read_bits(2).unwrap(), 0b11);
        assert_eq!(r.read_bytes(13).unwrap(), b"frame payload");
        assert_eq!(r.read_bits(3).unwrap(), 7);
    }

    #[test]
    fn read_past_end_is_overflow() {
        let mut w = BitWriter::new();
        w.write_bits(1, 4);
        let bytes = w.finish();
        let mut r = BitReader::new(&bytes);
        assert_eq!(r.read_bits(4).unwrap(), 1);
        assert_eq!(r.read_bits(8), Err(WireError::Overflow));
    }

    #[test]
    fn int_range_roundtrip() {
        let mut w = BitWriter::new();
        write_int(&mut w, -3, -10, 117);
        write_int(&mut w, 117, -10, 117);
        let bytes = w.finish();
        let mut r = BitReader::new(&bytes);
        assert_eq!(read_int(&mut r, -10, 117).unwrap(), -3);
        assert_eq!(read_int(&mut r, -10, 117).unwrap(), 117);
    }

    #[test]
    fn out_of_range_int_rejected() {
        // 7 bits encode [0, 100]; raw value 127 decodes past max.
        let mut w = BitWriter::new();
        w.write_bits(127, 7);
        let bytes = w.finish();
        let mut r = BitReader::new(&bytes);
        assert_eq!(read_int(&mut r, 0, 100), Err(WireError::ValueOutOfRange));
    }

    #[test]
    fn position_roundtrip_within_tolerance() {
        for resolution in [Resolution::Low, Resolution::Medium, Resolution::High] {
            let original = Vec3::new(13.337, -200.01, 0.125);
            let mut w = BitWriter::new();
            write_position(&mut w, original, resolution);
            let bytes = w.finish();
            let mut r = BitReader::new(&bytes);
            let decoded = read_position(&mut r, resolution).unwrap();
            for axis in 0..3 {
                assert!(
                    (original[axis] - decoded[axis]).abs() <= resolution.position_tolerance(),
                    "{resolution:?} axis {axis}: {} vs {}",
                    original[axis],
                    decoded[axis]
                );
            }
        }
    }

    #[test]
    fn rotation_roundtrip_within_tolerance() {
        for resolution in [Resolution::Low, Resolution::Medium, Resolution::High] {
            let original = Quat::from_euler(glam::EulerRot::YXZ, 1.1, -0.4, 0.9);
            let mut w = BitWriter::new();
            write_rotation(&mut w, original, resolution);
            let bytes = w.finish();
            let mut r = BitReader::new(&bytes);
            let decoded = read_rotation(&mut r, resolution).unwrap();
            assert!(original.angle_between(decoded) <= resolution.rotation_tolerance());
        }
    }

    #[test]
    fn string_roundtrip() {
        let mut w = BitWriter::new();
        w.write_bits(1, 1); // force misalignment first
        write_string(&mut w, "observer", 64);
        let bytes = w.finish();
        let mut r = BitReader::new(&bytes);
        assert_eq!(r.read_bits(1).unwrap(), 1);
        assert_eq!(read_string(&mut r, 64).unwrap(), "observer");
    }

    #[test]
    fn crc_detects_corruption_and_seed_mismatch() {
        let payload = b"state frame".to_vec();
        let a = crc32(&payload, 0x1234_5678);
        let mut corrupted = payload.clone();
        corrupted[3] ^= 0x40;
        assert_ne!(a, crc32(&corrupted, 0x1234_5678));
        assert_ne!(a, crc32(&payload, 0x1234_5679));
        assert_eq!(a, crc32(&payload, 0x1234_5678));
    }
}
