use criterion::{BatchSize, Criterion, criterion_group, criterion_main};
use hearsay_core::{
    CommsConfig, CommsWorld, InterruptKind, OutboxEntry, Position, ReceiverConfig, Tick, Transport,
    TransportMask,
};
use std::time::Duration;

fn bench_comms_steps(c: &mut Criterion) {
    let mut group = c.benchmark_group("comms_step");
    let samples: usize = std::env::var("HS_BENCH_SAMPLES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(30);
    let steps: usize = std::env::var("HS_BENCH_STEPS")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(64);
    group.sample_size(samples);
    group.warm_up_time(Duration::from_secs(2));
    group.measurement_time(Duration::from_secs(8));

    for &pairs in &[50_usize, 200, 500] {
        group.bench_function(format!("steps{steps}_pairs{pairs}"), |b| {
            b.iter_batched(
                || {
                    let config = CommsConfig {
                        world_width: 2_000,
                        world_height: 2_000,
                        cell_size: 40,
                        max_messages_per_tick: 256,
                        max_stream: 1_024,
                        history_capacity: 8,
                        ..CommsConfig::default()
                    };
                    let mut world = CommsWorld::new(config).expect("world");
                    let hearing = TransportMask::of(&[Transport::Hearing]);
                    for i in 0..pairs {
                        let x = (i % 50) as f32 * 40.0 + 10.0;
                        let y = (i / 50) as f32 * 40.0 + 10.0;
                        let sender = world.spawn_actor(Position::new(x, y));
                        let receiver = world.spawn_actor(Position::new(x + 4.0, y));
                        world.enable_sender(sender, hearing);
                        world.enable_receiver(receiver, ReceiverConfig::default());
                        let mut entry =
                            OutboxEntry::new(InterruptKind::Report, format!("report/{i}"))
                                .addressed_to(receiver);
                        entry.flags.requests_ack = true;
                        entry.max_attempts = 8;
                        entry.cadence_ticks = 4;
                        entry.next_emit = Tick((i % 4) as u64);
                        world.queue_intent(sender, entry);
                    }
                    world
                },
                |mut world| {
                    for _ in 0..steps {
                        world.refresh_ambient_from_field();
                        world.step();
                    }
                },
                BatchSize::LargeInput,
            );
        });
    }
    group.finish();
}

criterion_group!(benches, bench_comms_steps);
criterion_main!(benches);
