use std::net::SocketAddr;
use std::time::{Duration, Instant};

use anyhow::Result;
use clap::Parser;
use glam::Vec3;
use log::info;

use lattice::{Client, ClientEvent, ClientMode, EntityKind, NetConfig, Transport, UdpTransport};

#[derive(Parser)]
#[command(name = "lattice-client")]
#[command(about = "Headless replication client")]
struct Args {
    #[arg(short, long, default_value = "127.0.0.1:27900")]
    server: SocketAddr,

    #[arg(short, long, default_value = "observer")]
    name: String,

    #[arg(long, help = "Reconnect automatically after a server disconnect")]
    reconnect: bool,

    #[arg(long, default_value_t = 30.0, help = "Exit after this many seconds")]
    run_for: f32,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let transport = UdpTransport::bind("0.0.0.0:0")?;
    let config = NetConfig::default();
    let tick_dt = f64::from(config.tick_dt());
    let mut client = Client::connect(transport, args.server, config, &args.name);
    client.reconnect = args.reconnect;

    let started = Instant::now();
    let mut last = started;
    let mut accumulator = 0.0f64;
    let mut report_at = 0.0f64;

    while started.elapsed().as_secs_f32() < args.run_for {
        let now = Instant::now();
        let frame_dt = (now - last).as_secs_f64().min(0.25);
        last = now;

        client.update(frame_dt);

        accumulator += frame_dt;
        while accumulator >= tick_dt {
            accumulator -= tick_dt;
            steer_avatar(&mut client, tick_dt as f32);
            client.tick(tick_dt);
        }

        for event in client.drain_events() {
            match event {
                ClientEvent::Connected => info!("connected"),
                ClientEvent::Disconnected { reason } => {
                    info!("disconnected: {reason:?}");
                    if !args.reconnect {
                        return Ok(());
                    }
                }
                ClientEvent::AvatarAssigned { slot } => info!("controlling slot {}", slot.id),
                ClientEvent::Correction { id, position, .. } => {
                    log::debug!("correction for {id}: {position}")
                }
                ClientEvent::TimeSync { match_time } => {
                    log::debug!("match time {match_time:.1}s")
                }
                _ => {}
            }
        }

        // Once a second, show where the delayed view thinks the world is.
        if client.timestamp() > report_at {
            report_at = client.timestamp() + 1.0;
            if client.mode() == ClientMode::Connected {
                for (id, entity) in client.world().iter() {
                    if entity.kind == EntityKind::Prop && !entity.parent.is_null() {
                        info!(
                            "prop {id} at ({:.2}, {:.2}, {:.2}) rtt {:.0}ms",
                            entity.position.x,
                            entity.position.y,
                            entity.position.z,
                            client.rtt() * 1000.0
                        );
                    }
                }
            }
        }

        std::thread::sleep(Duration::from_millis(1));
    }

    client.disconnect();
    Ok(())
}

/// Walk the avatar in a slow circle so the server sees live input, and
/// predict our own motion locally rather than waiting on replication.
fn steer_avatar<T: Transport>(client: &mut Client<T>, dt: f32) {
    let Some(slot) = client.avatar() else {
        return;
    };
    let t = client.timestamp() as f32;
    let direction = Vec3::new((0.3 * t).cos(), 0.0, (0.3 * t).sin());
    if let Some(entity) = client.world_mut().get_mut(slot.id) {
        entity.input.movement = direction;
        entity.position += direction * 6.0 * dt;
    }
}
