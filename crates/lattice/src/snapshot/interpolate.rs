//! Blending between two state frames at an intermediate timestamp, and
//! application of the blended result onto the live world.
//!
//! Identity changes never blend: a slot whose revision or parent differs
//! between samples hard-cuts to the newer value, because interpolating
//! between two unrelated objects (or two coordinate spaces) produces
//! garbage that looks like motion.

use glam::{Quat, Vec3};

use crate::world::{EntityKind, World};

use super::state::{StateFrame, closest_angle, wrap_angle};

/// Parent chains deeper than this are treated as broken.
const MAX_PARENT_DEPTH: usize = 32;

/// Timing context for applying a frame to the world.
#[derive(Debug, Clone, Copy)]
pub struct ApplyContext {
    pub now: f64,
    pub rtt: f32,
    pub interpolation_delay: f32,
    pub tick_dt: f32,
}

/// World-space pose of a slot, resolving the parent chain through the
/// frame where tracked and falling back to the live world for slots the
/// frame doesn't carry.
pub fn transform_absolute(
    frame: &StateFrame,
    index: usize,
    world: Option<&World>,
) -> (Vec3, Quat) {
    let mut abs_pos = Vec3::ZERO;
    let mut abs_rot = Quat::IDENTITY;
    let mut current = index;
    for _ in 0..MAX_PARENT_DEPTH {
        let (pos, rot, parent) = if frame.transforms_active.get(current) {
            let t = &frame.transforms[current];
            (t.position, t.rotation, t.parent)
        } else if let Some(entity) = world.and_then(|w| w.get(current as u16)) {
            (entity.position, entity.rotation, entity.parent)
        } else {
            break;
        };
        abs_rot = rot * abs_rot;
        abs_pos = rot * abs_pos + pos;
        if parent.is_null() {
            break;
        }
        current = usize::from(parent.id);
    }
    (abs_pos, abs_rot)
}

/// Express a world-space pose in the local space of `parent_index` as seen
/// by `frame`.
fn absolute_to_relative(
    frame: &StateFrame,
    parent_index: usize,
    world: Option<&World>,
    pos: &mut Vec3,
    rot: &mut Quat,
) {
    let (parent_pos, parent_rot) = transform_absolute(frame, parent_index, world);
    let inverse = parent_rot.inverse();
    *rot = inverse * *rot;
    *pos = inverse * (*pos - parent_pos);
}

/// Produce the blended frame at `timestamp` between samples `a` (older)
/// and `b` (newer).
pub fn interpolate(
    a: &StateFrame,
    b: &StateFrame,
    timestamp: f64,
    tick_dt: f32,
    world: Option<&World>,
) -> StateFrame {
    debug_assert!(timestamp >= a.timestamp);
    let span = b.timestamp - a.timestamp;
    let blend = if span > 0.0 {
        (((timestamp - a.timestamp) / span) as f32).min(1.0)
    } else {
        1.0
    };

    let mut result = StateFrame::new(timestamp);
    result.sequence_id = b.sequence_id;

    // Transforms.
    result.transforms_active = b.transforms_active.clone();
    for index in b.transforms_active.iter() {
        let last = &a.transforms[index];
        let next = &b.transforms[index];
        let out = &mut result.transforms[index];
        out.parent = next.parent;
        out.revision = next.revision;
        out.resolution = next.resolution;

        if last.revision == next.revision && a.transforms_active.get(index) {
            if last.parent.id == next.parent.id {
                out.position = last.position.lerp(next.position, blend);
                out.rotation = last.rotation.slerp(next.rotation, blend);
            } else {
                // Reparented between samples: blend through world space,
                // expressed in the new parent's frame.
                let (mut last_pos, mut last_rot) = transform_absolute(a, index, world);
                if !next.parent.is_null() {
                    absolute_to_relative(
                        b,
                        usize::from(next.parent.id),
                        world,
                        &mut last_pos,
                        &mut last_rot,
                    );
                }
                out.position = last_pos.lerp(next.position, blend);
                out.rotation = last_rot.slerp(next.rotation, blend);
            }
        } else {
            out.position = next.position;
            out.rotation = next.rotation;
        }
    }

    // Players: continuous timers blend unless the samples are too far
    // apart in time to be the same countdown.
    for index in 0..result.players.len() {
        let last = &a.players[index];
        let next = &b.players[index];
        result.players[index] = *last;
        if last.active {
            if (last.respawn_timer - next.respawn_timer).abs() > tick_dt * 5.0 {
                result.players[index].respawn_timer = next.respawn_timer;
            } else {
                result.players[index].respawn_timer =
                    last.respawn_timer + (next.respawn_timer - last.respawn_timer) * blend;
            }
        }
    }

    // Walkers.
    result.walkers_active = b.walkers_active.clone();
    for index in b.walkers_active.iter() {
        let last = &a.walkers[index];
        let next = &b.walkers[index];
        let out = &mut result.walkers[index];
        out.revision = next.revision;
        if last.revision == next.revision && a.walkers_active.get(index) {
            let target = closest_angle(next.heading, last.heading);
            out.heading = wrap_angle(last.heading + (target - last.heading) * blend);
            if last.gait == next.gait
                && (next.gait_time - last.gait_time).abs() < tick_dt * 10.0
            {
                out.gait = last.gait;
                out.gait_time = last.gait_time + (next.gait_time - last.gait_time) * blend;
            } else {
                out.gait = next.gait;
                out.gait_time = next.gait_time;
            }
        } else {
            out.heading = next.heading;
            out.gait = next.gait;
            out.gait_time = next.gait_time;
        }
    }

    // Agents.
    result.agents_active = b.agents_active.clone();
    for index in b.agents_active.iter() {
        let last = &a.agents[index];
        let next = &b.agents[index];
        let out = &mut result.agents[index];
        out.revision = next.revision;
        if last.revision == next.revision && a.agents_active.get(index) {
            out.cooldown = last.cooldown + (next.cooldown - last.cooldown) * blend;
        } else {
            out.cooldown = next.cooldown;
        }
    }

    result
}

/// Write a (typically interpolated) frame onto the live world.
///
/// Slots under local control are never overwritten here; their
/// authoritative corrections bypass the interpolation delay entirely and
/// are surfaced by the session the moment the exact state arrives.
pub fn apply(
    frame: &StateFrame,
    frame_last: &StateFrame,
    frame_next: Option<&StateFrame>,
    world: &mut World,
    ctx: &ApplyContext,
) {
    // Transforms.
    for index in frame.transforms_active.iter() {
        let id = index as u16;
        let state = &frame.transforms[index];
        let Some(revision) = world.revision(id) else {
            continue;
        };
        let Some(entity) = world.get(id) else {
            continue;
        };
        if revision != state.revision || entity.locally_controlled {
            continue;
        }

        // Derived client-side velocity for projectile-like objects, from
        // the bracketing samples.
        let velocity = if entity.kind == EntityKind::Agent && ctx.tick_dt > 0.0 {
            frame_next.map(|next| {
                let (last_pos, _) = transform_absolute(frame_last, index, Some(world));
                let (next_pos, _) = transform_absolute(next, index, Some(world));
                (next_pos - last_pos) / ctx.tick_dt
            })
        } else {
            None
        };

        if let Some(entity) = world.get_mut(id) {
            entity.position = state.position;
            entity.rotation = state.rotation;
            entity.parent = state.parent;
            if let Some(velocity) = velocity {
                entity.velocity = velocity;
            }
        }
    }

    // Players.
    for (index, state) in frame.players.iter().enumerate() {
        if state.active {
            let player = &mut world.players[index];
            player.active = true;
            player.respawn_timer = state.respawn_timer;
            player.energy = state.energy;
        }
    }

    // Walkers.
    for index in frame.walkers_active.iter() {
        let id = index as u16;
        let state = frame.walkers[index];
        let revision = world.revision(id);
        if let Some(entity) = world.get_mut(id) {
            if revision == Some(state.revision) && !entity.locally_controlled {
                entity.heading = state.heading;
                entity.gait = state.gait;
                entity.gait_time = state.gait_time;
            }
        }
    }

    // Agents. A locally-predicted cooldown holds until the replicated
    // value can no longer be an echo of a change we just made ourselves.
    let prediction_hold = f64::from(ctx.rtt + ctx.interpolation_delay + ctx.tick_dt * 2.0);
    for index in frame.agents_active.iter() {
        let id = index as u16;
        let state = frame.agents[index];
        let revision = world.revision(id);
        let now = ctx.now;
        if let Some(entity) = world.get_mut(id) {
            if revision != Some(state.revision) {
                continue;
            }
            if entity.locally_controlled && now - entity.cooldown_changed_at < prediction_hold {
                continue;
            }
            entity.cooldown = state.cooldown;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::wire::Resolution;
    use crate::snapshot::state::{TransformState, WalkerState};
    use crate::world::{EntityDef, SlotRef};
    use std::f32::consts::PI;

    fn frame_with_transform(
        sequence_id: u16,
        timestamp: f64,
        index: usize,
        position: Vec3,
        rotation: Quat,
    ) -> StateFrame {
        let mut frame = StateFrame::new(timestamp);
        frame.sequence_id = sequence_id;
        frame.transforms_active.set(index, true);
        frame.transforms[index] = TransformState {
            revision: 1,
            resolution: Resolution::Medium,
            position,
            rotation,
            parent: SlotRef::NULL,
        };
        frame
    }

    #[test]
    fn endpoints_reproduce_samples() {
        let a = frame_with_transform(1, 1.0, 4, Vec3::new(0.0, 0.0, 0.0), Quat::IDENTITY);
        let b = frame_with_transform(
            2,
            1.1,
            4,
            Vec3::new(10.0, 0.0, 0.0),
            Quat::from_rotation_y(0.5),
        );

        let at_a = interpolate(&a, &b, 1.0, 1.0 / 60.0, None);
        assert!((at_a.transforms[4].position - a.transforms[4].position).length() < 1e-5);
        assert!(at_a.transforms[4]
            .rotation
            .angle_between(a.transforms[4].rotation)
            < 1e-4);

        let at_b = interpolate(&a, &b, 1.1, 1.0 / 60.0, None);
        assert!((at_b.transforms[4].position - b.transforms[4].position).length() < 1e-5);
        assert!(at_b.transforms[4]
            .rotation
            .angle_between(b.transforms[4].rotation)
            < 1e-4);
    }

    #[test]
    fn midpoint_lies_on_segment() {
        let a = frame_with_transform(1, 0.0, 4, Vec3::new(2.0, -4.0, 8.0), Quat::IDENTITY);
        let b = frame_with_transform(2, 1.0, 4, Vec3::new(6.0, 4.0, -8.0), Quat::IDENTITY);
        for t in [0.25, 0.5, 0.75] {
            let result = interpolate(&a, &b, t, 1.0 / 60.0, None);
            let expected = a.transforms[4]
                .position
                .lerp(b.transforms[4].position, t as f32);
            assert!((result.transforms[4].position - expected).length() < 1e-4);
        }
    }

    #[test]
    fn revision_change_hard_cuts() {
        let a = frame_with_transform(1, 0.0, 4, Vec3::new(0.0, 0.0, 0.0), Quat::IDENTITY);
        let mut b = frame_with_transform(2, 1.0, 4, Vec3::new(100.0, 0.0, 0.0), Quat::IDENTITY);
        b.transforms[4].revision = 2; // reincarnated slot

        let mid = interpolate(&a, &b, 0.5, 1.0 / 60.0, None);
        // No half-way ghost between two unrelated objects.
        assert!((mid.transforms[4].position - b.transforms[4].position).length() < 1e-5);
    }

    #[test]
    fn reparent_blends_through_world_space() {
        // Parent slot 2 sits at x=10. Child 4 is free in `a`, parented in
        // `b` at local origin (world x=10).
        let mut a = frame_with_transform(1, 0.0, 4, Vec3::new(8.0, 0.0, 0.0), Quat::IDENTITY);
        a.transforms_active.set(2, true);
        a.transforms[2] = TransformState {
            revision: 7,
            resolution: Resolution::Medium,
            position: Vec3::new(10.0, 0.0, 0.0),
            rotation: Quat::IDENTITY,
            parent: SlotRef::NULL,
        };

        let mut b = frame_with_transform(2, 1.0, 4, Vec3::ZERO, Quat::IDENTITY);
        b.transforms_active.set(2, true);
        b.transforms[2] = a.transforms[2];
        b.transforms[4].parent = SlotRef { id: 2, revision: 7 };

        let mid = interpolate(&a, &b, 0.5, 1.0 / 60.0, None);
        // Halfway between local x=-2 (was world 8) and local x=0.
        assert!((mid.transforms[4].position.x - -1.0).abs() < 1e-4);
        let (abs, _) = transform_absolute(&mid, 4, None);
        assert!((abs.x - 9.0).abs() < 1e-4);
    }

    #[test]
    fn player_timer_blends_then_snaps_on_gap() {
        let tick_dt = 1.0 / 60.0;
        let mut a = StateFrame::new(0.0);
        a.sequence_id = 1;
        a.players[0].active = true;
        a.players[0].respawn_timer = 1.0;
        let mut b = StateFrame::new(1.0);
        b.sequence_id = 2;
        b.players[0].active = true;
        b.players[0].respawn_timer = 0.95;

        let mid = interpolate(&a, &b, 0.5, tick_dt, None);
        assert!((mid.players[0].respawn_timer - 0.975).abs() < 1e-4);

        // A respawn reset mid-gap must not play backwards.
        b.players[0].respawn_timer = 4.5;
        let mid = interpolate(&a, &b, 0.5, tick_dt, None);
        assert!((mid.players[0].respawn_timer - 4.5).abs() < 1e-4);
    }

    #[test]
    fn walker_heading_takes_shortest_arc() {
        let mut a = StateFrame::new(0.0);
        a.sequence_id = 1;
        a.walkers_active.set(3, true);
        a.walkers[3] = WalkerState {
            revision: 1,
            heading: PI - 0.1,
            gait: 0,
            gait_time: 0.0,
        };
        let mut b = StateFrame::new(1.0);
        b.sequence_id = 2;
        b.walkers_active.set(3, true);
        b.walkers[3] = WalkerState {
            revision: 1,
            heading: -PI + 0.1,
            gait: 0,
            gait_time: 0.016,
        };

        let mid = interpolate(&a, &b, 0.5, 1.0 / 60.0, None);
        // Crosses the PI seam, not zero.
        assert!(mid.walkers[3].heading.abs() > PI - 0.2);
    }

    #[test]
    fn apply_respects_local_control_and_revision() {
        let mut world = World::new();
        let local = world
            .spawn(&EntityDef::Avatar {
                player: 0,
                uuid: 1,
                position: Vec3::new(5.0, 0.0, 0.0),
                rotation: Quat::IDENTITY,
            })
            .unwrap();
        let remote = world
            .spawn(&EntityDef::Prop {
                resolution: Resolution::Medium,
                position: Vec3::ZERO,
                rotation: Quat::IDENTITY,
                parent: SlotRef::NULL,
            })
            .unwrap();
        world.get_mut(local.id).unwrap().locally_controlled = true;

        let mut frame = StateFrame::new(1.0);
        frame.sequence_id = 3;
        for slot in [local, remote] {
            let index = usize::from(slot.id);
            frame.transforms_active.set(index, true);
            frame.transforms[index] = TransformState {
                revision: slot.revision,
                resolution: Resolution::Medium,
                position: Vec3::new(50.0, 0.0, 0.0),
                rotation: Quat::IDENTITY,
                parent: SlotRef::NULL,
            };
        }

        let ctx = ApplyContext {
            now: 1.0,
            rtt: 0.05,
            interpolation_delay: 0.1,
            tick_dt: 1.0 / 60.0,
        };
        apply(&frame.clone(), &frame, None, &mut world, &ctx);

        // The remote prop took the replicated position.
        assert!((world.get(remote.id).unwrap().position.x - 50.0).abs() < 1e-5);
        // The locally-driven avatar kept its own.
        assert!((world.get(local.id).unwrap().position.x - 5.0).abs() < 1e-5);
    }

    #[test]
    fn stale_revision_is_not_applied() {
        let mut world = World::new();
        let slot = world
            .spawn(&EntityDef::Prop {
                resolution: Resolution::Medium,
                position: Vec3::ZERO,
                rotation: Quat::IDENTITY,
                parent: SlotRef::NULL,
            })
            .unwrap();

        let mut frame = StateFrame::new(1.0);
        frame.sequence_id = 3;
        let index = usize::from(slot.id);
        frame.transforms_active.set(index, true);
        frame.transforms[index] = TransformState {
            revision: slot.revision.wrapping_add(1), // a different incarnation
            resolution: Resolution::Medium,
            position: Vec3::new(9.0, 9.0, 9.0),
            rotation: Quat::IDENTITY,
            parent: SlotRef::NULL,
        };

        let ctx = ApplyContext {
            now: 1.0,
            rtt: 0.05,
            interpolation_delay: 0.1,
            tick_dt: 1.0 / 60.0,
        };
        apply(&frame.clone(), &frame, None, &mut world, &ctx);
        assert!((world.get(slot.id).unwrap().position).length() < 1e-5);
    }
}
