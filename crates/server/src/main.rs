mod demo;

use std::time::{Duration, Instant};

use anyhow::Result;
use clap::Parser;
use log::info;

use lattice::{NetConfig, Server, ServerEvent, UdpTransport};

#[derive(Parser)]
#[command(name = "lattice-server")]
#[command(about = "Authoritative replication server with a demo world")]
struct Args {
    #[arg(short, long, default_value = "0.0.0.0")]
    bind: String,

    #[arg(short, long, default_value_t = 27900)]
    port: u16,

    #[arg(short, long, default_value_t = 60)]
    tick_rate: u32,

    #[arg(short, long, default_value_t = 32)]
    max_clients: usize,

    #[arg(long, default_value_t = 10.0, help = "Connection timeout in seconds")]
    timeout: f32,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let config = NetConfig {
        tick_rate: args.tick_rate,
        max_clients: args.max_clients,
        timeout: args.timeout,
        ..NetConfig::default()
    };
    let tick_dt = f64::from(config.tick_dt());

    let transport = UdpTransport::bind(format!("{}:{}", args.bind, args.port))?;
    let mut server = Server::new(transport, config);
    info!("listening on {}", server.local_addr());

    let mut world = demo::DemoWorld::populate(&mut server);

    let mut last = Instant::now();
    let mut accumulator = 0.0f64;
    loop {
        let now = Instant::now();
        let frame_dt = (now - last).as_secs_f64().min(0.25);
        last = now;

        server.update(frame_dt);

        accumulator += frame_dt;
        while accumulator >= tick_dt {
            accumulator -= tick_dt;
            world.advance(&mut server, tick_dt);
            server.tick(tick_dt);
        }

        for event in server.drain_events() {
            match event {
                ServerEvent::PeerConnected { addr } => info!("peer connected: {addr}"),
                ServerEvent::PeerLoaded { addr, player } => {
                    info!("peer {addr} loaded as player {player}")
                }
                ServerEvent::PeerDisconnected { addr, reason } => {
                    info!("peer {addr} left: {reason:?}")
                }
                ServerEvent::Command { player, command } => {
                    info!("player {player} command: {command}")
                }
                ServerEvent::Broadcast(_) => {}
            }
        }

        std::thread::sleep(Duration::from_millis(1));
    }
}
