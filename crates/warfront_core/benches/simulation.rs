//! Simulation benchmarks for warfront_core.
//!
//! Run with: `cargo bench -p warfront_core`

// Benchmark binaries don't need docs on macro-generated functions
#![allow(missing_docs)]

use criterion::{black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion};
use warfront_core::catalog::Catalog;
use warfront_core::components::TeamId;
use warfront_core::config::SimConfig;
use warfront_core::events::NullSink;
use warfront_core::replication::Replicator;
use warfront_core::simulation::Simulation;
use warfront_test_utils::fixtures::{pos, standard};

/// Two armies of `per_team` soldiers in facing blocks, close enough to
/// engage within a few ticks.
fn armies(per_team: u32) -> Simulation {
    let config = SimConfig {
        map_width: 256,
        map_height: 256,
        population_cap: per_team + 1,
        ..SimConfig::default()
    };
    let mut sim = Simulation::new(config, Catalog::standard().unwrap());
    for (team, base_x) in [(0u8, 100), (1u8, 140)] {
        let connection = sim.add_connection(TeamId(team)).unwrap();
        sim.set_view_extent(connection, pos(128, 128), pos(40, 40)).unwrap();
        for i in 0..per_team as i32 {
            let x = base_x + (i % 10) * 2 * if team == 0 { -1 } else { 1 };
            let y = 100 + (i / 10) * 2;
            sim.spawn_unit(TeamId(team), standard::SOLDIER, pos(x, y))
                .unwrap();
        }
    }
    sim
}

fn bench_tick(c: &mut Criterion) {
    let mut group = c.benchmark_group("tick");

    for size in [50u32, 200, 500] {
        group.bench_with_input(BenchmarkId::new("armies", size), &size, |b, &size| {
            b.iter_batched(
                || {
                    let mut sim = armies(size);
                    // Let the armies close in so combat is running.
                    for _ in 0..20 {
                        sim.tick(&mut NullSink);
                    }
                    sim
                },
                |mut sim| {
                    sim.tick(&mut NullSink);
                    sim
                },
                BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

fn bench_replication(c: &mut Criterion) {
    let mut group = c.benchmark_group("replication");

    for size in [50u32, 500] {
        let mut sim = armies(size);
        sim.tick(&mut NullSink);
        group.bench_with_input(BenchmarkId::new("encode", size), &sim, |b, sim| {
            b.iter_batched(
                Replicator::default,
                |mut replicator| black_box(replicator.encode(sim, 1).unwrap()),
                BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

fn bench_state_hash(c: &mut Criterion) {
    let sim = armies(500);
    c.bench_function("state_hash/500", |b| b.iter(|| black_box(sim.state_hash())));
}

criterion_group!(benches, bench_tick, bench_replication, bench_state_hash);
criterion_main!(benches);
