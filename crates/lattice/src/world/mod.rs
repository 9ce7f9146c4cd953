//! Replicated-object storage: a fixed-capacity slot arena with per-slot
//! revision tags. Slots are reused; the revision distinguishes
//! reincarnations so a stale reference or a delta against a dead object is
//! detectable instead of silently wrong.

use glam::{Quat, Vec3};
use serde::{Deserialize, Serialize};

use crate::net::wire::{
    BitReader, BitWriter, Resolution, WireError, read_int, read_position, read_rotation,
    write_int, write_position, write_rotation,
};

/// Capacity of the slot arena; slot indices are 10 bits on the wire.
pub const MAX_ENTITIES: usize = 1024;
/// Fixed player roster size.
pub const MAX_PLAYERS: usize = 8;

const SLOT_NULL: u16 = MAX_ENTITIES as u16;

/// Nullable reference to an arena slot, pinned to a revision. Resolving a
/// ref whose revision no longer matches yields nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotRef {
    pub id: u16,
    pub revision: u16,
}

impl SlotRef {
    pub const NULL: SlotRef = SlotRef {
        id: SLOT_NULL,
        revision: 0,
    };

    pub fn is_null(self) -> bool {
        self.id == SLOT_NULL
    }
}

impl Default for SlotRef {
    fn default() -> Self {
        Self::NULL
    }
}

pub fn write_slot_ref(w: &mut BitWriter, value: SlotRef) {
    write_int(w, i64::from(value.id), 0, MAX_ENTITIES as i64);
    w.write_bits(u32::from(value.revision), 16);
}

pub fn read_slot_ref(r: &mut BitReader) -> Result<SlotRef, WireError> {
    let id = read_int(r, 0, MAX_ENTITIES as i64)? as u16;
    let revision = r.read_bits(16)? as u16;
    Ok(SlotRef { id, revision })
}

/// Replicated object category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum EntityKind {
    /// Transform-only scenery or physics prop.
    Prop = 0,
    /// Ground unit with a heading and a gait animation clock.
    Walker = 1,
    /// Autonomous unit with an ability cooldown.
    Agent = 2,
    /// A player's controllable embodiment.
    Avatar = 3,
}

impl EntityKind {
    pub const COUNT: usize = 4;

    fn from_index(index: i64) -> Option<Self> {
        match index {
            0 => Some(Self::Prop),
            1 => Some(Self::Walker),
            2 => Some(Self::Agent),
            3 => Some(Self::Avatar),
            _ => None,
        }
    }
}

bitflags::bitflags! {
    /// Pressed-button set carried in a client input snapshot.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Buttons: u8 {
        const PRIMARY = 1 << 0;
        const SECONDARY = 1 << 1;
        const DASH = 1 << 2;
        const INTERACT = 1 << 3;
    }
}

/// One input snapshot for a locally-controlled object: intent plus the
/// client's own idea of where it is, at full replication precision.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RemoteInput {
    pub movement: Vec3,
    pub buttons: Buttons,
    pub parent: SlotRef,
    pub position: Vec3,
    pub rotation: Quat,
}

impl Default for RemoteInput {
    fn default() -> Self {
        Self {
            movement: Vec3::ZERO,
            buttons: Buttons::empty(),
            parent: SlotRef::NULL,
            position: Vec3::ZERO,
            rotation: Quat::IDENTITY,
        }
    }
}

pub fn write_remote_input(w: &mut BitWriter, input: &RemoteInput) {
    let moving = input.movement.length_squared() > 0.0;
    w.write_bool(moving);
    if moving {
        for axis in input.movement.to_array() {
            crate::net::wire::write_f32_range(w, axis, -1.0, 1.0, 16);
        }
    }
    w.write_bits(u32::from(input.buttons.bits()), 8);
    write_slot_ref(w, input.parent);
    write_position(w, input.position, Resolution::High);
    write_rotation(w, input.rotation, Resolution::High);
}

pub fn read_remote_input(r: &mut BitReader) -> Result<RemoteInput, WireError> {
    let moving = r.read_bool()?;
    let movement = if moving {
        let x = crate::net::wire::read_f32_range(r, -1.0, 1.0, 16)?;
        let y = crate::net::wire::read_f32_range(r, -1.0, 1.0, 16)?;
        let z = crate::net::wire::read_f32_range(r, -1.0, 1.0, 16)?;
        Vec3::new(x, y, z)
    } else {
        Vec3::ZERO
    };
    let buttons = Buttons::from_bits_truncate(r.read_bits(8)? as u8);
    let parent = read_slot_ref(r)?;
    let position = read_position(r, Resolution::High)?;
    let rotation = read_rotation(r, Resolution::High)?;
    Ok(RemoteInput {
        movement,
        buttons,
        parent,
        position,
        rotation,
    })
}

/// Creation payload for a replicated object: one explicit variant per
/// category, so the serializable set is statically enumerable.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EntityDef {
    Prop {
        resolution: Resolution,
        position: Vec3,
        rotation: Quat,
        parent: SlotRef,
    },
    Walker {
        position: Vec3,
        heading: f32,
    },
    Agent {
        position: Vec3,
        rotation: Quat,
        cooldown: f32,
        owner: SlotRef,
    },
    Avatar {
        player: u8,
        uuid: u64,
        position: Vec3,
        rotation: Quat,
    },
}

/// Upper bound on an agent's ability cooldown, for quantization.
pub const COOLDOWN_MAX: f32 = 10.0;

impl EntityDef {
    pub fn kind(&self) -> EntityKind {
        match self {
            Self::Prop { .. } => EntityKind::Prop,
            Self::Walker { .. } => EntityKind::Walker,
            Self::Agent { .. } => EntityKind::Agent,
            Self::Avatar { .. } => EntityKind::Avatar,
        }
    }
}

/// Per-category wire codec, registered in [`DEF_CODECS`] by kind index.
pub struct DefCodec {
    pub write: fn(&mut BitWriter, &EntityDef),
    pub read: fn(&mut BitReader) -> Result<EntityDef, WireError>,
}

fn write_prop(w: &mut BitWriter, def: &EntityDef) {
    let EntityDef::Prop {
        resolution,
        position,
        rotation,
        parent,
    } = def
    else {
        unreachable!("codec registered for Prop");
    };
    write_int(w, *resolution as i64, 0, Resolution::COUNT - 1);
    write_position(w, *position, *resolution);
    write_rotation(w, *rotation, *resolution);
    write_slot_ref(w, *parent);
}

fn read_prop(r: &mut BitReader) -> Result<EntityDef, WireError> {
    let resolution = Resolution::from_index(read_int(r, 0, Resolution::COUNT - 1)?)
        .ok_or(WireError::ValueOutOfRange)?;
    Ok(EntityDef::Prop {
        resolution,
        position: read_position(r, resolution)?,
        rotation: read_rotation(r, resolution)?,
        parent: read_slot_ref(r)?,
    })
}

fn write_walker(w: &mut BitWriter, def: &EntityDef) {
    let EntityDef::Walker { position, heading } = def else {
        unreachable!("codec registered for Walker");
    };
    write_position(w, *position, Resolution::Medium);
    crate::net::wire::write_f32_range(w, *heading, -std::f32::consts::PI, std::f32::consts::PI, 8);
}

fn read_walker(r: &mut BitReader) -> Result<EntityDef, WireError> {
    Ok(EntityDef::Walker {
        position: read_position(r, Resolution::Medium)?,
        heading: crate::net::wire::read_f32_range(
            r,
            -std::f32::consts::PI,
            std::f32::consts::PI,
            8,
        )?,
    })
}

fn write_agent(w: &mut BitWriter, def: &EntityDef) {
    let EntityDef::Agent {
        position,
        rotation,
        cooldown,
        owner,
    } = def
    else {
        unreachable!("codec registered for Agent");
    };
    write_position(w, *position, Resolution::High);
    write_rotation(w, *rotation, Resolution::High);
    crate::net::wire::write_f32_range(w, *cooldown, 0.0, COOLDOWN_MAX, 8);
    write_slot_ref(w, *owner);
}

fn read_agent(r: &mut BitReader) -> Result<EntityDef, WireError> {
    Ok(EntityDef::Agent {
        position: read_position(r, Resolution::High)?,
        rotation: read_rotation(r, Resolution::High)?,
        cooldown: crate::net::wire::read_f32_range(r, 0.0, COOLDOWN_MAX, 8)?,
        owner: read_slot_ref(r)?,
    })
}

fn write_avatar(w: &mut BitWriter, def: &EntityDef) {
    let EntityDef::Avatar {
        player,
        uuid,
        position,
        rotation,
    } = def
    else {
        unreachable!("codec registered for Avatar");
    };
    write_int(w, i64::from(*player), 0, MAX_PLAYERS as i64 - 1);
    w.write_u64(*uuid);
    write_position(w, *position, Resolution::High);
    write_rotation(w, *rotation, Resolution::High);
}

fn read_avatar(r: &mut BitReader) -> Result<EntityDef, WireError> {
    Ok(EntityDef::Avatar {
        player: read_int(r, 0, MAX_PLAYERS as i64 - 1)? as u8,
        uuid: r.read_u64()?,
        position: read_position(r, Resolution::High)?,
        rotation: read_rotation(r, Resolution::High)?,
    })
}

/// Fixed category codec table, indexed by `EntityKind`.
pub static DEF_CODECS: [DefCodec; EntityKind::COUNT] = [
    DefCodec {
        write: write_prop,
        read: read_prop,
    },
    DefCodec {
        write: write_walker,
        read: read_walker,
    },
    DefCodec {
        write: write_agent,
        read: read_agent,
    },
    DefCodec {
        write: write_avatar,
        read: read_avatar,
    },
];

pub fn write_entity_def(w: &mut BitWriter, def: &EntityDef) {
    let kind = def.kind();
    write_int(w, kind as i64, 0, EntityKind::COUNT as i64 - 1);
    (DEF_CODECS[kind as usize].write)(w, def);
}

pub fn read_entity_def(r: &mut BitReader) -> Result<EntityDef, WireError> {
    let kind = EntityKind::from_index(read_int(r, 0, EntityKind::COUNT as i64 - 1)?)
        .ok_or(WireError::ValueOutOfRange)?;
    (DEF_CODECS[kind as usize].read)(r)
}

/// A live replicated object.
#[derive(Debug, Clone)]
pub struct Entity {
    pub kind: EntityKind,
    pub resolution: Resolution,
    pub position: Vec3,
    pub rotation: Quat,
    pub parent: SlotRef,
    /// Walker heading in radians, `[-PI, PI]`.
    pub heading: f32,
    /// Walker gait animation id and clock.
    pub gait: u8,
    pub gait_time: f32,
    /// Agent ability cooldown.
    pub cooldown: f32,
    /// Agent owner.
    pub owner: SlotRef,
    /// Context timestamp of the last local cooldown change; gates how soon
    /// the replicated value may overwrite a predicted one.
    pub cooldown_changed_at: f64,
    /// Owning player for avatars.
    pub player: Option<u8>,
    /// Avatar identity token, matched against the local session's.
    pub uuid: u64,
    /// Driven by the local peer; replication must not stomp it.
    pub locally_controlled: bool,
    /// Most recent input snapshot from the owning client (server side).
    pub input: RemoteInput,
    /// Client-side derived velocity for categories that need it.
    pub velocity: Vec3,
}

impl Entity {
    fn from_def(def: &EntityDef) -> Self {
        let mut entity = Self {
            kind: def.kind(),
            resolution: Resolution::Medium,
            position: Vec3::ZERO,
            rotation: Quat::IDENTITY,
            parent: SlotRef::NULL,
            heading: 0.0,
            gait: 0,
            gait_time: 0.0,
            cooldown: 0.0,
            owner: SlotRef::NULL,
            cooldown_changed_at: 0.0,
            player: None,
            uuid: 0,
            locally_controlled: false,
            input: RemoteInput::default(),
            velocity: Vec3::ZERO,
        };
        match *def {
            EntityDef::Prop {
                resolution,
                position,
                rotation,
                parent,
            } => {
                entity.resolution = resolution;
                entity.position = position;
                entity.rotation = rotation;
                entity.parent = parent;
            }
            EntityDef::Walker { position, heading } => {
                entity.position = position;
                entity.heading = heading;
            }
            EntityDef::Agent {
                position,
                rotation,
                cooldown,
                owner,
            } => {
                entity.resolution = Resolution::High;
                entity.position = position;
                entity.rotation = rotation;
                entity.cooldown = cooldown;
                entity.owner = owner;
            }
            EntityDef::Avatar {
                player,
                uuid,
                position,
                rotation,
            } => {
                entity.resolution = Resolution::High;
                entity.position = position;
                entity.rotation = rotation;
                entity.player = Some(player);
                entity.uuid = uuid;
            }
        }
        entity
    }

    /// Rebuild the creation payload from live state (used for the initial
    /// world dump to a joining peer).
    pub fn to_def(&self) -> EntityDef {
        match self.kind {
            EntityKind::Prop => EntityDef::Prop {
                resolution: self.resolution,
                position: self.position,
                rotation: self.rotation,
                parent: self.parent,
            },
            EntityKind::Walker => EntityDef::Walker {
                position: self.position,
                heading: self.heading,
            },
            EntityKind::Agent => EntityDef::Agent {
                position: self.position,
                rotation: self.rotation,
                cooldown: self.cooldown,
                owner: self.owner,
            },
            EntityKind::Avatar => EntityDef::Avatar {
                player: self.player.unwrap_or(0),
                uuid: self.uuid,
                position: self.position,
                rotation: self.rotation,
            },
        }
    }
}

/// Per-player roster entry replicated in every snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PlayerSlot {
    pub active: bool,
    pub respawn_timer: f32,
    pub energy: i16,
}

/// Upper bound on the respawn timer, for quantization.
pub const RESPAWN_DELAY: f32 = 5.0;

struct Slot {
    revision: u16,
    entity: Option<Entity>,
}

/// The slot arena. Indices are stable for an object's lifetime; freeing
/// bumps the revision so reuse is detectable.
pub struct World {
    slots: Vec<Slot>,
    free: Vec<u16>,
    live: usize,
    pub players: [PlayerSlot; MAX_PLAYERS],
}

impl Default for World {
    fn default() -> Self {
        Self::new()
    }
}

impl World {
    pub fn new() -> Self {
        Self {
            slots: (0..MAX_ENTITIES)
                .map(|_| Slot {
                    revision: 0,
                    entity: None,
                })
                .collect(),
            // Stack of free ids, lowest on top.
            free: (0..MAX_ENTITIES as u16).rev().collect(),
            live: 0,
            players: [PlayerSlot::default(); MAX_PLAYERS],
        }
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Allocate a slot for a new object. Returns `None` when the arena is
    /// full.
    pub fn spawn(&mut self, def: &EntityDef) -> Option<SlotRef> {
        let id = self.free.pop()?;
        let slot = &mut self.slots[usize::from(id)];
        debug_assert!(slot.entity.is_none());
        slot.entity = Some(Entity::from_def(def));
        self.live += 1;
        Some(SlotRef {
            id,
            revision: slot.revision,
        })
    }

    /// Free a slot, bumping its revision so stale refs and deltas miss.
    pub fn despawn(&mut self, id: u16) -> bool {
        let Some(slot) = self.slots.get_mut(usize::from(id)) else {
            return false;
        };
        if slot.entity.take().is_none() {
            return false;
        }
        slot.revision = slot.revision.wrapping_add(1);
        self.free.push(id);
        self.live -= 1;
        true
    }

    /// Materialize an object at a specific slot and revision, as dictated
    /// by the authority. Replaces any current occupant.
    pub fn net_add(&mut self, id: u16, revision: u16, def: &EntityDef) -> Option<SlotRef> {
        let slot = self.slots.get_mut(usize::from(id))?;
        if slot.entity.is_none() {
            self.free.retain(|&f| f != id);
            self.live += 1;
        }
        slot.revision = revision;
        slot.entity = Some(Entity::from_def(def));
        Some(SlotRef { id, revision })
    }

    /// Authority-driven removal; does not bump the revision (the authority
    /// owns the counter and ships it with the next occupant).
    pub fn net_remove(&mut self, id: u16) -> bool {
        let Some(slot) = self.slots.get_mut(usize::from(id)) else {
            return false;
        };
        if slot.entity.take().is_none() {
            return false;
        }
        self.free.push(id);
        self.live -= 1;
        true
    }

    pub fn revision(&self, id: u16) -> Option<u16> {
        self.slots.get(usize::from(id)).map(|s| s.revision)
    }

    pub fn get(&self, id: u16) -> Option<&Entity> {
        self.slots.get(usize::from(id))?.entity.as_ref()
    }

    pub fn get_mut(&mut self, id: u16) -> Option<&mut Entity> {
        self.slots.get_mut(usize::from(id))?.entity.as_mut()
    }

    /// Resolve a revision-pinned reference; a stale ref yields nothing.
    pub fn resolve(&self, slot_ref: SlotRef) -> Option<&Entity> {
        if slot_ref.is_null() {
            return None;
        }
        let slot = self.slots.get(usize::from(slot_ref.id))?;
        if slot.revision != slot_ref.revision {
            return None;
        }
        slot.entity.as_ref()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u16, &Entity)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(id, slot)| slot.entity.as_ref().map(|e| (id as u16, e)))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (u16, &mut Entity)> {
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(|(id, slot)| slot.entity.as_mut().map(|e| (id as u16, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prop_def() -> EntityDef {
        EntityDef::Prop {
            resolution: Resolution::Medium,
            position: Vec3::new(1.0, 2.0, 3.0),
            rotation: Quat::IDENTITY,
            parent: SlotRef::NULL,
        }
    }

    #[test]
    fn spawn_reuses_slots_with_new_revision() {
        let mut world = World::new();
        let first = world.spawn(&prop_def()).unwrap();
        assert!(world.despawn(first.id));
        let second = world.spawn(&prop_def()).unwrap();
        assert_eq!(first.id, second.id);
        assert_ne!(first.revision, second.revision);
    }

    #[test]
    fn stale_ref_does_not_resolve() {
        let mut world = World::new();
        let slot = world.spawn(&prop_def()).unwrap();
        assert!(world.resolve(slot).is_some());
        world.despawn(slot.id);
        world.spawn(&prop_def()).unwrap();
        assert!(world.resolve(slot).is_none());
    }

    #[test]
    fn net_add_pins_slot_and_revision() {
        let mut world = World::new();
        let slot = world.net_add(17, 3, &prop_def()).unwrap();
        assert_eq!(slot.id, 17);
        assert_eq!(world.revision(17), Some(3));
        assert!(world.get(17).is_some());
        // The forced slot must no longer be handed out by spawn.
        for _ in 0..MAX_ENTITIES - 1 {
            if world.spawn(&prop_def()).is_none() {
                break;
            }
        }
        assert_eq!(world.len(), MAX_ENTITIES);
    }

    #[test]
    fn def_codec_roundtrip_every_category() {
        let defs = [
            prop_def(),
            EntityDef::Walker {
                position: Vec3::new(-4.0, 0.0, 9.5),
                heading: 1.25,
            },
            EntityDef::Agent {
                position: Vec3::new(0.5, 1.5, -2.5),
                rotation: Quat::from_rotation_y(0.7),
                cooldown: 3.0,
                owner: SlotRef { id: 5, revision: 2 },
            },
            EntityDef::Avatar {
                player: 3,
                uuid: 0xfeed_beef_dead_cafe,
                position: Vec3::new(10.0, 0.0, 10.0),
                rotation: Quat::from_rotation_y(-0.3),
            },
        ];
        for def in &defs {
            let mut w = BitWriter::new();
            write_entity_def(&mut w, def);
            let bytes = w.finish();
            let mut r = BitReader::new(&bytes);
            let decoded = read_entity_def(&mut r).unwrap();
            assert_eq!(decoded.kind(), def.kind());
            match (def, &decoded) {
                (
                    EntityDef::Walker { heading, .. },
                    EntityDef::Walker {
                        heading: decoded_heading,
                        ..
                    },
                ) => {
                    assert!((heading - decoded_heading).abs() < 0.02);
                }
                (
                    EntityDef::Avatar { uuid, player, .. },
                    EntityDef::Avatar {
                        uuid: d_uuid,
                        player: d_player,
                        ..
                    },
                ) => {
                    assert_eq!(uuid, d_uuid);
                    assert_eq!(player, d_player);
                }
                _ => {}
            }
        }
    }

    #[test]
    fn remote_input_roundtrip() {
        let input = RemoteInput {
            movement: Vec3::new(1.0, 0.0, -0.5),
            buttons: Buttons::PRIMARY | Buttons::DASH,
            parent: SlotRef { id: 9, revision: 1 },
            position: Vec3::new(3.0, 4.0, 5.0),
            rotation: Quat::from_rotation_y(0.5),
        };
        let mut w = BitWriter::new();
        write_remote_input(&mut w, &input);
        let bytes = w.finish();
        let mut r = BitReader::new(&bytes);
        let decoded = read_remote_input(&mut r).unwrap();
        assert_eq!(decoded.buttons, input.buttons);
        assert_eq!(decoded.parent, input.parent);
        assert!((decoded.movement - input.movement).length() < 0.001);
        assert!((decoded.position - input.position).length() < 0.01);
    }
}
