//! Per-tick replicated state records.
//!
//! A [`StateFrame`] captures every replicated object's quantizable fields
//! for one tick. Category blocks are parallel slot arrays gated by an
//! [`ActiveSet`], which caches its occupied bounds so scans skip the empty
//! tail of the arena.

use glam::{Quat, Vec3};

use crate::net::sequence::{SEQUENCE_INVALID, SequenceId};
use crate::net::wire::Resolution;
use crate::world::{EntityKind, MAX_ENTITIES, MAX_PLAYERS, SlotRef, World};

const WORDS: usize = MAX_ENTITIES / 64;

/// Fixed bitset over arena slots with cached `[start, end)` occupied
/// bounds for fast iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveSet {
    words: [u64; WORDS],
    start: u16,
    end: u16,
}

impl Default for ActiveSet {
    fn default() -> Self {
        Self::new()
    }
}

impl ActiveSet {
    pub fn new() -> Self {
        Self {
            words: [0; WORDS],
            start: MAX_ENTITIES as u16,
            end: 0,
        }
    }

    pub fn get(&self, index: usize) -> bool {
        debug_assert!(index < MAX_ENTITIES);
        self.words[index / 64] & (1u64 << (index % 64)) != 0
    }

    pub fn set(&mut self, index: usize, value: bool) {
        debug_assert!(index < MAX_ENTITIES);
        let bit = 1u64 << (index % 64);
        if value {
            self.words[index / 64] |= bit;
            self.start = self.start.min(index as u16);
            self.end = self.end.max(index as u16 + 1);
        } else {
            self.words[index / 64] &= !bit;
            // Bounds are a superset after clears; scans re-check bits.
        }
    }

    /// First occupied index bound (inclusive).
    pub fn start(&self) -> usize {
        usize::from(self.start)
    }

    /// Last occupied index bound (exclusive).
    pub fn end(&self) -> usize {
        usize::from(self.end)
    }

    pub fn is_empty(&self) -> bool {
        self.start() >= self.end()
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        (self.start()..self.end()).filter(|&i| self.get(i))
    }

    /// Scan range covering both sets' occupied slots.
    pub fn union_bounds(a: &ActiveSet, b: Option<&ActiveSet>) -> std::ops::Range<usize> {
        match b {
            Some(b) => a.start().min(b.start())..a.end().max(b.end()),
            None => a.start()..a.end(),
        }
    }
}

/// Spatial state of one slot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransformState {
    pub revision: u16,
    pub resolution: Resolution,
    pub position: Vec3,
    pub rotation: Quat,
    pub parent: SlotRef,
}

impl Default for TransformState {
    fn default() -> Self {
        Self {
            revision: 0,
            resolution: Resolution::Low,
            position: Vec3::ZERO,
            rotation: Quat::IDENTITY,
            parent: SlotRef::NULL,
        }
    }
}

/// Walker auxiliary block: heading plus gait animation clock.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct WalkerState {
    pub revision: u16,
    pub heading: f32,
    pub gait: u8,
    pub gait_time: f32,
}

/// Agent auxiliary block: ability cooldown.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct AgentState {
    pub revision: u16,
    pub cooldown: f32,
}

/// Per-player roster entry.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PlayerState {
    pub active: bool,
    pub respawn_timer: f32,
    pub energy: i16,
}

/// Everything replicated, captured once per tick.
#[derive(Debug, Clone)]
pub struct StateFrame {
    pub sequence_id: SequenceId,
    pub timestamp: f64,
    pub transforms_active: ActiveSet,
    pub transforms: Vec<TransformState>,
    pub players: [PlayerState; MAX_PLAYERS],
    pub walkers_active: ActiveSet,
    pub walkers: Vec<WalkerState>,
    pub agents_active: ActiveSet,
    pub agents: Vec<AgentState>,
}

impl StateFrame {
    pub fn new(timestamp: f64) -> Self {
        Self {
            sequence_id: SEQUENCE_INVALID,
            timestamp,
            transforms_active: ActiveSet::new(),
            transforms: vec![TransformState::default(); MAX_ENTITIES],
            players: [PlayerState::default(); MAX_PLAYERS],
            walkers_active: ActiveSet::new(),
            walkers: vec![WalkerState::default(); MAX_ENTITIES],
            agents_active: ActiveSet::new(),
            agents: vec![AgentState::default(); MAX_ENTITIES],
        }
    }

    /// Capture the live world. The walker heading is bucketed to its wire
    /// precision here so baseline comparison sees exactly what a peer
    /// would hold.
    pub fn build(world: &World, sequence_id: SequenceId, timestamp: f64) -> Self {
        let mut frame = Self::new(timestamp);
        frame.sequence_id = sequence_id;

        for (id, entity) in world.iter() {
            let index = usize::from(id);
            let revision = world.revision(id).unwrap_or(0);

            frame.transforms_active.set(index, true);
            frame.transforms[index] = TransformState {
                revision,
                resolution: entity.resolution,
                position: entity.position,
                rotation: entity.rotation,
                parent: entity.parent,
            };

            match entity.kind {
                EntityKind::Walker => {
                    frame.walkers_active.set(index, true);
                    frame.walkers[index] = WalkerState {
                        revision,
                        heading: quantize_heading(entity.heading),
                        gait: entity.gait,
                        gait_time: entity.gait_time,
                    };
                }
                EntityKind::Agent => {
                    frame.agents_active.set(index, true);
                    frame.agents[index] = AgentState {
                        revision,
                        cooldown: entity.cooldown,
                    };
                }
                EntityKind::Prop | EntityKind::Avatar => {}
            }
        }

        for (index, player) in world.players.iter().enumerate() {
            frame.players[index] = PlayerState {
                active: player.active,
                respawn_timer: player.respawn_timer,
                energy: player.energy,
            };
        }

        frame
    }
}

/// Snap a heading angle to its 8-bit wire bucket over `[-PI, PI]`.
pub fn quantize_heading(heading: f32) -> f32 {
    use std::f32::consts::PI;
    let wrapped = wrap_angle(heading);
    let bucket = (255.0 * (wrapped + PI) / (2.0 * PI)).round();
    -PI + bucket * (2.0 * PI) / 255.0
}

/// Wrap into `[-PI, PI]`.
pub fn wrap_angle(angle: f32) -> f32 {
    use std::f32::consts::{PI, TAU};
    let mut wrapped = angle % TAU;
    if wrapped > PI {
        wrapped -= TAU;
    } else if wrapped < -PI {
        wrapped += TAU;
    }
    wrapped
}

/// Shortest signed distance between two headings.
pub fn closest_angle(target: f32, reference: f32) -> f32 {
    reference + wrap_angle(target - reference)
}
