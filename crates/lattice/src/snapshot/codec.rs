//! Delta encoding of state frames against an acknowledged baseline.
//!
//! Field groups use equality-with-tolerance predicates to decide whether a
//! value is worth transmitting; unsent fields are implicitly equal to the
//! baseline on decode. Encoding with no baseline fully reconstructs the
//! frame standalone (a joining peer's first frame). Writing and reading are
//! explicit symmetric functions per field group, kept adjacent so drift is
//! caught by the round-trip tests.

use std::f32::consts::PI;

use crate::net::wire::{
    BitReader, BitWriter, Resolution, WireError, read_f32_range, read_int, read_position,
    read_rotation, read_sequence, write_f32_range, write_int, write_position, write_rotation,
    write_sequence,
};
use crate::world::{COOLDOWN_MAX, MAX_ENTITIES, RESPAWN_DELAY, read_slot_ref, write_slot_ref};

use super::state::{
    ActiveSet, AgentState, PlayerState, StateFrame, TransformState, WalkerState,
};

/// Gait animation clock ceiling, for quantization.
pub const GAIT_TIME_MAX: f32 = 20.0;

/// The tighter of two slots' precision tiers decides the comparison
/// tolerance, so a resolution upgrade is itself a visible change.
fn tighter(a: Resolution, b: Resolution) -> Resolution {
    if a == Resolution::High || b == Resolution::High {
        Resolution::High
    } else if a == Resolution::Medium || b == Resolution::Medium {
        Resolution::Medium
    } else {
        Resolution::Low
    }
}

/// Shortest-arc rotation comparison under the pair's tolerance.
pub fn rotations_equal(a: &TransformState, b: &TransformState) -> bool {
    let tolerance = tighter(a.resolution, b.resolution).rotation_tolerance();
    a.rotation.angle_between(b.rotation) < tolerance
}

/// Full transform comparison: identity fields exactly, spatial fields
/// within tolerance buckets.
pub fn transforms_equal(a: &TransformState, b: &TransformState) -> bool {
    if a.revision != b.revision || a.resolution != b.resolution || a.parent != b.parent {
        return false;
    }
    if !rotations_equal(a, b) {
        return false;
    }
    let tolerance = tighter(a.resolution, b.resolution).position_tolerance();
    (0..3).all(|axis| {
        (a.position[axis] / tolerance) as i32 == (b.position[axis] / tolerance) as i32
    })
}

fn transform_slot_equal(frame: &StateFrame, base: Option<&StateFrame>, index: usize) -> bool {
    let Some(base) = base else {
        return false;
    };
    let a = frame.transforms_active.get(index);
    let b = base.transforms_active.get(index);
    if a != b {
        return false;
    }
    if !a {
        return true;
    }
    transforms_equal(&frame.transforms[index], &base.transforms[index])
}

/// Active walkers always retransmit (their animation clock never stands
/// still); only slots inactive on both sides are skippable.
fn walker_slot_equal(frame: &StateFrame, base: Option<&StateFrame>, index: usize) -> bool {
    let Some(base) = base else {
        return false;
    };
    !frame.walkers_active.get(index) && !base.walkers_active.get(index)
}

fn agent_slot_equal(frame: &StateFrame, base: Option<&StateFrame>, index: usize) -> bool {
    let Some(base) = base else {
        return false;
    };
    !frame.agents_active.get(index) && !base.agents_active.get(index)
}

fn players_equal(a: &PlayerState, b: &PlayerState) -> bool {
    a.active == b.active && a.respawn_timer == b.respawn_timer && a.energy == b.energy
}

fn write_transform_body(
    w: &mut BitWriter,
    transform: &TransformState,
    rotation_base: Option<&TransformState>,
) {
    write_int(w, transform.resolution as i64, 0, Resolution::COUNT - 1);
    write_position(w, transform.position, transform.resolution);
    let rotation_changed = match rotation_base {
        Some(base) => !rotations_equal(transform, base),
        None => true,
    };
    w.write_bool(rotation_changed);
    if rotation_changed {
        write_rotation(w, transform.rotation, transform.resolution);
    }
}

fn read_transform_body(
    r: &mut BitReader,
    transform: &mut TransformState,
) -> Result<(), WireError> {
    transform.resolution = Resolution::from_index(read_int(r, 0, Resolution::COUNT - 1)?)
        .ok_or(WireError::ValueOutOfRange)?;
    transform.position = read_position(r, transform.resolution)?;
    if r.read_bool()? {
        transform.rotation = read_rotation(r, transform.resolution)?;
    }
    Ok(())
}

fn write_transforms(w: &mut BitWriter, frame: &StateFrame, base: Option<&StateFrame>) {
    let bounds = ActiveSet::union_bounds(
        &frame.transforms_active,
        base.map(|b| &b.transforms_active),
    );

    let changed_count = bounds
        .clone()
        .filter(|&i| !transform_slot_equal(frame, base, i))
        .count();
    write_int(w, changed_count as i64, 0, MAX_ENTITIES as i64);

    let mut index = bounds.start;
    for _ in 0..changed_count {
        while transform_slot_equal(frame, base, index) {
            index += 1;
        }
        write_int(w, index as i64, 0, MAX_ENTITIES as i64 - 1);

        let active = frame.transforms_active.get(index);
        w.write_bool(active);
        if active {
            let transform = &frame.transforms[index];
            let base_slot = base.map(|b| &b.transforms[index]);

            let revision_changed = base_slot.is_none_or(|b| b.revision != transform.revision);
            w.write_bool(revision_changed);
            if revision_changed {
                w.write_bits(u32::from(transform.revision), 16);
            }

            let parent_changed =
                revision_changed || base_slot.is_none_or(|b| b.parent != transform.parent);
            w.write_bool(parent_changed);
            if parent_changed {
                write_slot_ref(w, transform.parent);
            }

            // A revision change invalidates the baseline for this slot:
            // the remote may hold a different object's state there.
            let rotation_base = if revision_changed { None } else { base_slot };
            write_transform_body(w, transform, rotation_base);
        }
        index += 1;
    }
}

fn read_transforms(
    r: &mut BitReader,
    frame: &mut StateFrame,
) -> Result<(), WireError> {
    let changed_count = read_int(r, 0, MAX_ENTITIES as i64)?;
    for _ in 0..changed_count {
        let index = read_int(r, 0, MAX_ENTITIES as i64 - 1)? as usize;
        let active = r.read_bool()?;
        frame.transforms_active.set(index, active);
        if !active {
            continue;
        }
        let transform = &mut frame.transforms[index];
        if r.read_bool()? {
            transform.revision = r.read_bits(16)? as u16;
        }
        if r.read_bool()? {
            transform.parent = read_slot_ref(r)?;
        }
        read_transform_body(r, transform)?;
    }
    Ok(())
}

fn write_player(w: &mut BitWriter, player: &PlayerState, base: Option<&PlayerState>) {
    let timer_changed = base.is_none_or(|b| b.respawn_timer != player.respawn_timer);
    w.write_bool(timer_changed);
    if timer_changed {
        write_f32_range(w, player.respawn_timer, 0.0, RESPAWN_DELAY, 8);
    }
    let energy_changed = base.is_none_or(|b| b.energy != player.energy);
    w.write_bool(energy_changed);
    if energy_changed {
        w.write_bits(u32::from(player.energy as u16), 16);
    }
}

fn read_player(r: &mut BitReader, player: &mut PlayerState) -> Result<(), WireError> {
    player.active = true;
    if r.read_bool()? {
        player.respawn_timer = read_f32_range(r, 0.0, RESPAWN_DELAY, 8)?;
    }
    if r.read_bool()? {
        player.energy = r.read_bits(16)? as u16 as i16;
    }
    Ok(())
}

fn write_players(w: &mut BitWriter, frame: &StateFrame, base: Option<&StateFrame>) {
    for (index, player) in frame.players.iter().enumerate() {
        let base_player = base.map(|b| &b.players[index]);
        let serialize =
            player.active && base_player.is_none_or(|b| !players_equal(player, b));
        w.write_bool(serialize);
        if serialize {
            write_player(w, player, base_player);
        }
    }
}

fn read_players(r: &mut BitReader, frame: &mut StateFrame) -> Result<(), WireError> {
    for index in 0..frame.players.len() {
        if r.read_bool()? {
            read_player(r, &mut frame.players[index])?;
        }
    }
    Ok(())
}

fn write_walker(w: &mut BitWriter, walker: &WalkerState, base: Option<&WalkerState>) {
    let revision_changed = base.is_none_or(|b| b.revision != walker.revision);
    w.write_bool(revision_changed);
    if revision_changed {
        w.write_bits(u32::from(walker.revision), 16);
    }
    let heading_changed = base.is_none_or(|b| b.heading != walker.heading);
    w.write_bool(heading_changed);
    if heading_changed {
        write_f32_range(w, walker.heading, -PI, PI, 8);
    }
    let gait_changed = base.is_none_or(|b| b.gait != walker.gait);
    w.write_bool(gait_changed);
    if gait_changed {
        w.write_bits(u32::from(walker.gait), 8);
    }
    write_f32_range(w, walker.gait_time, 0.0, GAIT_TIME_MAX, 11);
}

fn read_walker(r: &mut BitReader, walker: &mut WalkerState) -> Result<(), WireError> {
    if r.read_bool()? {
        walker.revision = r.read_bits(16)? as u16;
    }
    if r.read_bool()? {
        walker.heading = read_f32_range(r, -PI, PI, 8)?;
    }
    if r.read_bool()? {
        walker.gait = r.read_bits(8)? as u8;
    }
    walker.gait_time = read_f32_range(r, 0.0, GAIT_TIME_MAX, 11)?;
    Ok(())
}

fn write_walkers(w: &mut BitWriter, frame: &StateFrame, base: Option<&StateFrame>) {
    let bounds =
        ActiveSet::union_bounds(&frame.walkers_active, base.map(|b| &b.walkers_active));
    let changed_count = bounds
        .clone()
        .filter(|&i| !walker_slot_equal(frame, base, i))
        .count();
    write_int(w, changed_count as i64, 0, MAX_ENTITIES as i64);

    let mut index = bounds.start;
    for _ in 0..changed_count {
        while walker_slot_equal(frame, base, index) {
            index += 1;
        }
        write_int(w, index as i64, 0, MAX_ENTITIES as i64 - 1);
        let active = frame.walkers_active.get(index);
        w.write_bool(active);
        if active {
            write_walker(w, &frame.walkers[index], base.map(|b| &b.walkers[index]));
        }
        index += 1;
    }
}

fn read_walkers(r: &mut BitReader, frame: &mut StateFrame) -> Result<(), WireError> {
    let changed_count = read_int(r, 0, MAX_ENTITIES as i64)?;
    for _ in 0..changed_count {
        let index = read_int(r, 0, MAX_ENTITIES as i64 - 1)? as usize;
        let active = r.read_bool()?;
        frame.walkers_active.set(index, active);
        if active {
            read_walker(r, &mut frame.walkers[index])?;
        }
    }
    Ok(())
}

fn write_agents(w: &mut BitWriter, frame: &StateFrame, base: Option<&StateFrame>) {
    let bounds = ActiveSet::union_bounds(&frame.agents_active, base.map(|b| &b.agents_active));
    let changed_count = bounds
        .clone()
        .filter(|&i| !agent_slot_equal(frame, base, i))
        .count();
    write_int(w, changed_count as i64, 0, MAX_ENTITIES as i64);

    let mut index = bounds.start;
    for _ in 0..changed_count {
        while agent_slot_equal(frame, base, index) {
            index += 1;
        }
        write_int(w, index as i64, 0, MAX_ENTITIES as i64 - 1);
        let active = frame.agents_active.get(index);
        w.write_bool(active);
        if active {
            let agent = &frame.agents[index];
            let base_agent = base.map(|b| &b.agents[index]);
            let revision_changed = base_agent.is_none_or(|b| b.revision != agent.revision);
            w.write_bool(revision_changed);
            if revision_changed {
                w.write_bits(u32::from(agent.revision), 16);
            }
            write_f32_range(w, agent.cooldown, 0.0, COOLDOWN_MAX, 8);
        }
        index += 1;
    }
}

fn read_agents(r: &mut BitReader, frame: &mut StateFrame) -> Result<(), WireError> {
    let changed_count = read_int(r, 0, MAX_ENTITIES as i64)?;
    for _ in 0..changed_count {
        let index = read_int(r, 0, MAX_ENTITIES as i64 - 1)? as usize;
        let active = r.read_bool()?;
        frame.agents_active.set(index, active);
        if active {
            let agent = &mut frame.agents[index];
            if r.read_bool()? {
                agent.revision = r.read_bits(16)? as u16;
            }
            agent.cooldown = read_f32_range(r, 0.0, COOLDOWN_MAX, 8)?;
        }
    }
    Ok(())
}

/// Encode `frame` relative to `base` (or standalone when `base` is
/// `None`). Only fields differing beyond their tolerance are emitted.
pub fn encode(w: &mut BitWriter, frame: &StateFrame, base: Option<&StateFrame>) {
    write_sequence(w, frame.sequence_id);
    write_transforms(w, frame, base);
    write_players(w, frame, base);
    write_walkers(w, frame, base);
    write_agents(w, frame, base);
}

/// Decode a frame; unsent fields come from the baseline, which must be the
/// exact frame the sender encoded against.
pub fn decode(
    r: &mut BitReader,
    base: Option<&StateFrame>,
    timestamp: f64,
) -> Result<StateFrame, WireError> {
    let mut frame = match base {
        Some(base) => base.clone(),
        None => StateFrame::new(timestamp),
    };
    frame.timestamp = timestamp;
    frame.sequence_id = read_sequence(r)?;
    read_transforms(r, &mut frame)?;
    read_players(r, &mut frame)?;
    read_walkers(r, &mut frame)?;
    read_agents(r, &mut frame)?;
    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world::SlotRef;
    use glam::{Quat, Vec3};

    fn sample_frame() -> StateFrame {
        let mut frame = StateFrame::new(1.0);
        frame.sequence_id = 42;

        frame.transforms_active.set(3, true);
        frame.transforms[3] = TransformState {
            revision: 1,
            resolution: Resolution::High,
            position: Vec3::new(10.0, 2.5, -7.25),
            rotation: Quat::from_rotation_y(0.8),
            parent: SlotRef::NULL,
        };
        frame.transforms_active.set(20, true);
        frame.transforms[20] = TransformState {
            revision: 4,
            resolution: Resolution::Low,
            position: Vec3::new(-100.0, 0.0, 55.5),
            rotation: Quat::IDENTITY,
            parent: SlotRef { id: 3, revision: 1 },
        };

        frame.players[0] = PlayerState {
            active: true,
            respawn_timer: 2.5,
            energy: 150,
        };

        frame.walkers_active.set(20, true);
        frame.walkers[20] = WalkerState {
            revision: 4,
            heading: super::super::state::quantize_heading(1.0),
            gait: 2,
            gait_time: 3.25,
        };

        frame.agents_active.set(3, true);
        frame.agents[3] = AgentState {
            revision: 1,
            cooldown: 4.5,
        };

        frame
    }

    fn roundtrip(frame: &StateFrame, base: Option<&StateFrame>) -> StateFrame {
        let mut w = BitWriter::new();
        encode(&mut w, frame, base);
        let bytes = w.finish();
        let mut r = BitReader::new(&bytes);
        decode(&mut r, base, frame.timestamp).unwrap()
    }

    /// Round-trip closeness: identity fields exact, spatial fields within
    /// the declared tolerance (quantization may land one bucket over, so
    /// the encoder's bucket-equality predicate is too strict here).
    fn transforms_close(a: &TransformState, b: &TransformState) -> bool {
        let tier = tighter(a.resolution, b.resolution);
        a.revision == b.revision
            && a.resolution == b.resolution
            && a.parent == b.parent
            && a.rotation.angle_between(b.rotation) <= tier.rotation_tolerance() + 1e-4
            && (0..3)
                .all(|axis| (a.position[axis] - b.position[axis]).abs() <= tier.position_tolerance() + 1e-5)
    }

    fn assert_frames_equivalent(a: &StateFrame, b: &StateFrame) {
        assert_eq!(a.sequence_id, b.sequence_id);
        for index in 0..MAX_ENTITIES {
            assert_eq!(
                a.transforms_active.get(index),
                b.transforms_active.get(index),
                "active bit {index}"
            );
            if a.transforms_active.get(index) {
                assert!(
                    transforms_close(&a.transforms[index], &b.transforms[index]),
                    "transform {index} out of tolerance"
                );
            }
            assert_eq!(a.walkers_active.get(index), b.walkers_active.get(index));
            if a.walkers_active.get(index) {
                let (wa, wb) = (&a.walkers[index], &b.walkers[index]);
                assert_eq!(wa.revision, wb.revision);
                assert_eq!(wa.gait, wb.gait);
                assert!((wa.heading - wb.heading).abs() < 0.03);
                assert!((wa.gait_time - wb.gait_time).abs() < 0.02);
            }
            assert_eq!(a.agents_active.get(index), b.agents_active.get(index));
            if a.agents_active.get(index) {
                assert_eq!(a.agents[index].revision, b.agents[index].revision);
                assert!((a.agents[index].cooldown - b.agents[index].cooldown).abs() < 0.05);
            }
        }
        for (pa, pb) in a.players.iter().zip(b.players.iter()) {
            assert_eq!(pa.active, pb.active);
            if pa.active {
                assert!((pa.respawn_timer - pb.respawn_timer).abs() < 0.05);
                assert_eq!(pa.energy, pb.energy);
            }
        }
    }

    #[test]
    fn standalone_roundtrip() {
        let frame = sample_frame();
        let decoded = roundtrip(&frame, None);
        assert_frames_equivalent(&frame, &decoded);
    }

    #[test]
    fn self_baseline_roundtrip_is_tiny() {
        let mut frame = sample_frame();
        // Transform-only content for the size assertion: active walkers
        // and agents always retransmit.
        frame.walkers_active.set(20, false);
        frame.agents_active.set(3, false);

        let baseline = roundtrip(&frame, None);

        let mut w = BitWriter::new();
        encode(&mut w, &baseline, Some(&baseline));
        let bytes = w.finish();
        assert!(bytes.len() <= 8, "self-delta was {} bytes", bytes.len());

        let mut r = BitReader::new(&bytes);
        let decoded = decode(&mut r, Some(&baseline), 2.0).unwrap();
        assert_frames_equivalent(&baseline, &decoded);
    }

    #[test]
    fn delta_against_baseline_roundtrip() {
        let frame_a = sample_frame();
        // The receiver's baseline is what a peer decoded, not the raw
        // server frame.
        let baseline = roundtrip(&frame_a, None);

        let mut frame_b = baseline.clone();
        frame_b.sequence_id = 43;
        frame_b.timestamp = 1.016;
        frame_b.transforms[3].position += Vec3::new(0.5, 0.0, 0.25);
        frame_b.players[0].energy = 145;
        frame_b.walkers[20].gait_time = 3.3;

        let decoded = roundtrip(&frame_b, Some(&baseline));
        assert_frames_equivalent(&frame_b, &decoded);
    }

    #[test]
    fn unchanged_slots_cost_nothing() {
        let frame = sample_frame();
        let baseline = roundtrip(&frame, None);

        let mut moved = baseline.clone();
        moved.transforms[3].position.x += 1.0;

        let mut w_delta = BitWriter::new();
        encode(&mut w_delta, &moved, Some(&baseline));
        let mut w_full = BitWriter::new();
        encode(&mut w_full, &moved, None);
        assert!(w_delta.bytes_written() < w_full.bytes_written() / 2);
    }

    #[test]
    fn sub_tolerance_movement_is_not_transmitted() {
        // Positions pinned to bucket midpoints so the jitter stays inside
        // one tolerance bucket on every axis.
        let mut baseline = sample_frame();
        baseline.transforms[20].position = Vec3::splat(0.004);
        baseline.transforms[3].position = Vec3::splat(0.0005);

        let mut jittered = baseline.clone();
        jittered.transforms[20].position.x += 0.0001; // Low tier, 8mm tolerance

        let mut w_delta = BitWriter::new();
        write_transforms(&mut w_delta, &jittered, Some(&baseline));
        let mut w_same = BitWriter::new();
        write_transforms(&mut w_same, &baseline, Some(&baseline));
        assert_eq!(w_delta.bytes_written(), w_same.bytes_written());
    }

    #[test]
    fn revision_change_forces_full_slot_resend() {
        let frame = sample_frame();
        let baseline = roundtrip(&frame, None);

        let mut reincarnated = baseline.clone();
        reincarnated.transforms[3].revision = 2;
        reincarnated.transforms[3].position = Vec3::new(-50.0, 1.0, 3.0);
        reincarnated.transforms[3].rotation = Quat::from_rotation_x(1.2);

        let decoded = roundtrip(&reincarnated, Some(&baseline));
        assert_eq!(decoded.transforms[3].revision, 2);
        assert!(transforms_close(
            &decoded.transforms[3],
            &reincarnated.transforms[3]
        ));
    }

    #[test]
    fn slot_despawn_is_replicated() {
        let frame = sample_frame();
        let baseline = roundtrip(&frame, None);

        let mut emptied = baseline.clone();
        emptied.transforms_active.set(20, false);
        emptied.walkers_active.set(20, false);

        let decoded = roundtrip(&emptied, Some(&baseline));
        assert!(!decoded.transforms_active.get(20));
        assert!(!decoded.walkers_active.get(20));
        assert!(decoded.transforms_active.get(3));
    }

    #[test]
    fn each_field_group_roundtrips_independently() {
        // Transform body group.
        let transform = TransformState {
            revision: 9,
            resolution: Resolution::Medium,
            position: Vec3::new(1.5, -2.0, 3.75),
            rotation: Quat::from_rotation_z(0.33),
            parent: SlotRef::NULL,
        };
        let mut w = BitWriter::new();
        write_transform_body(&mut w, &transform, None);
        let bytes = w.finish();
        let mut r = BitReader::new(&bytes);
        let mut decoded = TransformState {
            revision: 9,
            ..TransformState::default()
        };
        read_transform_body(&mut r, &mut decoded).unwrap();
        assert!(transforms_close(&transform, &decoded));

        // Player group.
        let player = PlayerState {
            active: true,
            respawn_timer: 1.25,
            energy: -12,
        };
        let mut w = BitWriter::new();
        write_player(&mut w, &player, None);
        let bytes = w.finish();
        let mut r = BitReader::new(&bytes);
        let mut decoded = PlayerState::default();
        read_player(&mut r, &mut decoded).unwrap();
        assert!(decoded.active);
        assert_eq!(decoded.energy, -12);
        assert!((decoded.respawn_timer - 1.25).abs() < 0.05);

        // Walker group.
        let walker = WalkerState {
            revision: 3,
            heading: super::super::state::quantize_heading(-2.5),
            gait: 5,
            gait_time: 11.0,
        };
        let mut w = BitWriter::new();
        write_walker(&mut w, &walker, None);
        let bytes = w.finish();
        let mut r = BitReader::new(&bytes);
        let mut decoded = WalkerState::default();
        read_walker(&mut r, &mut decoded).unwrap();
        assert_eq!(decoded.revision, 3);
        assert_eq!(decoded.gait, 5);
        assert!((decoded.heading - walker.heading).abs() < 0.03);
        assert!((decoded.gait_time - 11.0).abs() < 0.02);
    }
}
