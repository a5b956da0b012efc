//! Two agents volleying a counter back and forth.
//!
//! Run with: cargo run --example ping_pong

use runtime::prelude::*;

const PING: Kind = 1;
const PONG: Kind = 2;
const RALLY_TARGET: u32 = 10;

fn on_ping(state: &mut [u8], signal: &Signal) -> i32 {
    let rally: u32 = signal.payload_as().unwrap_or(0);
    state[..4].copy_from_slice(&rally.to_le_bytes());
    println!("pong agent saw rally {rally}");

    if rally >= RALLY_TARGET {
        context::request_shutdown();
        return 0;
    }
    match context::emit(PONG, 2, &(rally + 1).to_le_bytes()) {
        Ok(_) => 0,
        Err(_) => 1,
    }
}

fn on_pong(state: &mut [u8], signal: &Signal) -> i32 {
    let rally: u32 = signal.payload_as().unwrap_or(0);
    state[..4].copy_from_slice(&rally.to_le_bytes());
    println!("ping agent saw rally {rally}");

    match context::emit(PING, 1, &(rally + 1).to_le_bytes()) {
        Ok(_) => 0,
        Err(_) => 1,
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let network = topology::init(&NetworkTopology {
        name: "ping-pong".into(),
        agents: vec![
            AgentSpec::named(1, "ping").with_state(4),
            AgentSpec::named(2, "pong").with_state(4),
        ],
        sockets: vec![SocketDef::new(1, PING, 2), SocketDef::new(2, PONG, 1)],
    })
    .expect("topology init");

    let registry = network.registry();
    registry.get(1).unwrap().dispatch().register(PONG, on_pong, None).unwrap();
    registry.get(2).unwrap().dispatch().register(PING, on_ping, None).unwrap();

    // Serve the first ball.
    network.emit(PING, 1, &0u32.to_le_bytes()).expect("serve");

    let scheduler = Scheduler::new(&network);
    scheduler.run();

    println!("{}", scheduler.stats());
    println!("{}", network.registry());
    network.shutdown();
}
