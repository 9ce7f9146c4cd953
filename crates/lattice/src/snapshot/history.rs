//! Ring buffer of state frames, keyed by sequence id and timestamp.
//! Serves two lookups: the exact frame a peer acknowledged (delta
//! baseline) and the two frames bracketing a render timestamp
//! (interpolation inputs).

use crate::config::NetConfig;
use crate::net::message::HISTORY_SIZE;
use crate::net::sequence::{SequenceId, sequence_more_recent};

use super::state::StateFrame;

#[derive(Debug, Default)]
pub struct StateHistory {
    frames: Vec<StateFrame>,
    current: usize,
}

impl StateHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn head(&self) -> Option<&StateFrame> {
        self.frames.get(self.current)
    }

    /// Store a frame if it is strictly newer than the head, so reordered
    /// network delivery can't corrupt the timeline. Returns whether it was
    /// kept.
    pub fn insert(&mut self, frame: StateFrame) -> bool {
        if let Some(head) = self.head() {
            if !sequence_more_recent(frame.sequence_id, head.sequence_id) {
                return false;
            }
        }
        if self.frames.len() < HISTORY_SIZE {
            self.frames.push(frame);
            self.current = self.frames.len() - 1;
        } else {
            self.current = (self.current + 1) % HISTORY_SIZE;
            self.frames[self.current] = frame;
        }
        true
    }

    /// Walk newest-to-oldest inside the search window and age cutoff.
    fn recent_indices<'a>(
        &'a self,
        now: f64,
        config: &NetConfig,
    ) -> impl Iterator<Item = usize> + 'a {
        let len = self.frames.len();
        let cutoff = now - f64::from(config.timeout);
        let limit = len.min(config.history_search_window);
        (0..limit)
            .map(move |i| (self.current + len - i) % len)
            .enumerate()
            .take_while(move |&(i, index)| i == 0 || self.frames[index].timestamp >= cutoff)
            .map(|(_, index)| index)
    }

    pub fn by_sequence(
        &self,
        sequence_id: SequenceId,
        now: f64,
        config: &NetConfig,
    ) -> Option<&StateFrame> {
        self.recent_indices(now, config)
            .map(|index| &self.frames[index])
            .find(|frame| frame.sequence_id == sequence_id)
    }

    /// Newest stored frame with `timestamp < t`.
    pub fn by_timestamp(&self, t: f64, now: f64, config: &NetConfig) -> Option<&StateFrame> {
        self.recent_indices(now, config)
            .map(|index| &self.frames[index])
            .find(|frame| frame.timestamp < t)
    }

    /// The frame stored immediately after the given one, if it is in fact
    /// newer (the ring slot may have wrapped onto older data).
    pub fn next_after(&self, frame: &StateFrame) -> Option<&StateFrame> {
        if self.frames.len() < 2 {
            return None;
        }
        let index = self
            .frames
            .iter()
            .position(|f| f.sequence_id == frame.sequence_id)?;
        let next = &self.frames[(index + 1) % self.frames.len()];
        if sequence_more_recent(next.sequence_id, frame.sequence_id) {
            Some(next)
        } else {
            None
        }
    }
}
