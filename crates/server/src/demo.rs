//! A small scripted world so the replication path carries real traffic:
//! an orbiting prop, a patrolling walker, a cycling agent, plus avatar
//! movement driven by client input.

use glam::{Quat, Vec3};

use lattice::net::Transport;
use lattice::world::COOLDOWN_MAX;
use lattice::{EntityDef, EntityKind, Resolution, Server, SlotRef};

const AVATAR_SPEED: f32 = 6.0;
const ORBIT_RADIUS: f32 = 12.0;
const PATROL_RADIUS: f32 = 8.0;

pub struct DemoWorld {
    orbiter: SlotRef,
    walker: SlotRef,
    agent: SlotRef,
    elapsed: f64,
}

impl DemoWorld {
    pub fn populate<T: Transport>(server: &mut Server<T>) -> Self {
        // Static scenery anchor other objects can parent to.
        let anchor = server
            .spawn_entity(&EntityDef::Prop {
                resolution: Resolution::Low,
                position: Vec3::new(0.0, 0.0, 0.0),
                rotation: Quat::IDENTITY,
                parent: SlotRef::NULL,
            })
            .expect("arena has room at startup");

        let orbiter = server
            .spawn_entity(&EntityDef::Prop {
                resolution: Resolution::Medium,
                position: Vec3::new(ORBIT_RADIUS, 2.0, 0.0),
                rotation: Quat::IDENTITY,
                parent: anchor,
            })
            .expect("arena has room at startup");

        let walker = server
            .spawn_entity(&EntityDef::Walker {
                position: Vec3::new(PATROL_RADIUS, 0.0, 0.0),
                heading: 0.0,
            })
            .expect("arena has room at startup");

        let agent = server
            .spawn_entity(&EntityDef::Agent {
                position: Vec3::new(0.0, 5.0, 0.0),
                rotation: Quat::IDENTITY,
                cooldown: 0.0,
                owner: SlotRef::NULL,
            })
            .expect("arena has room at startup");

        Self {
            orbiter,
            walker,
            agent,
            elapsed: 0.0,
        }
    }

    /// Advance the scripted motion one tick and steer avatars by their
    /// owners' latest input.
    pub fn advance<T: Transport>(&mut self, server: &mut Server<T>, dt: f64) {
        self.elapsed += dt;
        let t = self.elapsed as f32;
        let world = server.world_mut();

        if let Some(entity) = world.get_mut(self.orbiter.id) {
            entity.position = Vec3::new(
                ORBIT_RADIUS * (0.4 * t).cos(),
                2.0,
                ORBIT_RADIUS * (0.4 * t).sin(),
            );
            entity.rotation = Quat::from_rotation_y(0.4 * t);
        }

        if let Some(entity) = world.get_mut(self.walker.id) {
            let angle = 0.25 * t;
            entity.position = Vec3::new(
                PATROL_RADIUS * angle.cos(),
                0.0,
                PATROL_RADIUS * angle.sin(),
            );
            entity.heading = lattice::snapshot::wrap_angle(angle + std::f32::consts::FRAC_PI_2);
            entity.gait = 1;
            entity.gait_time = (entity.gait_time + dt as f32) % lattice::snapshot::codec::GAIT_TIME_MAX;
        }

        if let Some(entity) = world.get_mut(self.agent.id) {
            entity.position = Vec3::new(0.0, 5.0 + (0.8 * t).sin(), 0.0);
            entity.cooldown = (entity.cooldown + dt as f32) % COOLDOWN_MAX;
        }

        // Avatars move under their owners' input, clamped to walk speed.
        let step = AVATAR_SPEED * dt as f32;
        for (_, entity) in world.iter_mut() {
            if entity.kind == EntityKind::Avatar {
                let movement = entity.input.movement;
                if movement.length_squared() > 0.0 {
                    entity.position += movement.clamp_length_max(1.0) * step;
                }
            }
        }
    }
}
