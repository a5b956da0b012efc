//! One sensor broadcasting readings to a bank of collectors.
//!
//! Run with: cargo run --example fan_out

use runtime::prelude::*;

const READING: Kind = 1;
const SENSOR: AgentId = 1;
const COLLECTORS: u16 = 4;

fn collect(state: &mut [u8], signal: &Signal) -> i32 {
    let reading: u32 = signal.payload_as().unwrap_or(0);
    let sum = u32::from_le_bytes(state[..4].try_into().unwrap());
    state[..4].copy_from_slice(&(sum + reading).to_le_bytes());
    0
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let mut agents = vec![AgentSpec::named(SENSOR, "sensor")];
    let mut sockets = Vec::new();
    for id in 2..=COLLECTORS + 1 {
        agents.push(AgentSpec::new(id).with_state(4));
        sockets.push(SocketDef::new(SENSOR, READING, id));
    }

    let network = topology::init(&NetworkTopology {
        name: "fan-out".into(),
        agents,
        sockets,
    })
    .expect("topology init");

    for id in 2..=COLLECTORS + 1 {
        network
            .registry()
            .get(id)
            .unwrap()
            .dispatch()
            .register(READING, collect, None)
            .unwrap();
    }

    for reading in [3u32, 5, 7, 11] {
        let delivered = network.emit(READING, SENSOR, &reading.to_le_bytes()).unwrap();
        println!("reading {reading} delivered to {delivered} collectors");
    }

    let scheduler = Scheduler::new(&network);
    scheduler.run();

    for id in 2..=COLLECTORS + 1 {
        let agent = network.registry().get(id).unwrap();
        let sum = agent.state().unwrap().read::<u32>().unwrap();
        println!("collector {id}: sum = {sum}");
    }
    println!("{}", scheduler.stats());
    network.shutdown();
}
