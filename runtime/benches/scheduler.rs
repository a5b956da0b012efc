//! Tidal-cycle scheduler benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use runtime::prelude::*;

fn count_up(state: &mut [u8], _signal: &Signal) -> i32 {
    let value = u32::from_le_bytes(state[..4].try_into().unwrap());
    state[..4].copy_from_slice(&(value + 1).to_le_bytes());
    0
}

fn fan_network(agent_count: u16, queue_depth: u32) -> Network {
    let mut agents = vec![AgentSpec::new(1)];
    let mut sockets = Vec::new();
    for id in 2..=agent_count {
        agents.push(
            AgentSpec::new(id)
                .with_state(4)
                .with_mailbox_capacity(queue_depth.next_power_of_two()),
        );
        sockets.push(SocketDef::new(1, id, id));
    }

    let network = topology::init(&NetworkTopology {
        name: "bench-fan".into(),
        agents,
        sockets,
    })
    .unwrap();

    for id in 2..=agent_count {
        network
            .registry()
            .get(id)
            .unwrap()
            .dispatch()
            .register(id, count_up, None)
            .unwrap();
    }
    network
}

fn benchmark_cycle_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("cycle_throughput");

    for agent_count in [4u16, 16, 64].iter() {
        group.bench_with_input(
            BenchmarkId::from_parameter(agent_count),
            agent_count,
            |b, &agent_count| {
                let queue_depth = 64;
                let network = fan_network(agent_count, queue_depth);

                b.iter(|| {
                    for id in 2..=agent_count {
                        for _ in 0..queue_depth {
                            network.emit(id, 1, &0u32.to_le_bytes()).unwrap();
                        }
                    }
                    let scheduler = Scheduler::new(&network);
                    black_box(scheduler.run_cycles(u64::from(queue_depth)))
                })
            },
        );
    }

    group.finish();
}

fn benchmark_empty_cycles(c: &mut Criterion) {
    let network = fan_network(16, 64);

    c.bench_function("empty_cycle", |b| {
        let scheduler = Scheduler::new(&network);
        b.iter(|| black_box(scheduler.run_cycles(1)))
    });
}

criterion_group!(benches, benchmark_cycle_throughput, benchmark_empty_cycles);
criterion_main!(benches);
