pub mod client;
pub mod server;

pub use client::{Client, ClientEvent, ClientMode};
pub use server::{Server, ServerEvent};

use crate::net::sequence::Ack;
use crate::net::wire::{
    BitReader, BitWriter, WireError, read_sequence_or_invalid, write_sequence_or_invalid,
};

pub(crate) fn read_ack(r: &mut BitReader) -> Result<Ack, WireError> {
    Ok(Ack {
        sequence_id: read_sequence_or_invalid(r)?,
        previous_sequences: r.read_u64()?,
    })
}

pub(crate) fn write_ack(w: &mut BitWriter, ack: &Ack) {
    write_sequence_or_invalid(w, ack.sequence_id);
    w.write_u64(ack.previous_sequences);
}
