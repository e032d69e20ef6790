use anyhow::Result;
use hearsay_core::{
    ActorId, ActorStats, AmbientSampler, CommsConfig, CommsWorld, InterruptKind, MediumKind,
    MessageFlags, OutboxEntry, PerceivedContact, Position, ReceiverConfig, SensedSignal,
    SignalChannel, Tick, Transport, TransportMask,
};
use rand::{Rng, SeedableRng, rngs::SmallRng};
use tracing::{info, warn};

fn main() -> Result<()> {
    init_tracing();
    info!("Starting Hearsay communication shell");
    let mut shell = bootstrap_harbor()?;
    run(&mut shell, 160);
    report(&shell);
    Ok(())
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

struct HarborShell {
    world: CommsWorld,
    commander: ActorId,
    villagers: Vec<ActorId>,
    vessel: ActorId,
    square_cell_origin: Position,
}

/// A harbor village: a commander and a handful of villagers around the
/// market square, plus a vessel submerged offshore that can only be reached
/// by signal lamp.
fn bootstrap_harbor() -> Result<HarborShell> {
    let config = CommsConfig {
        world_width: 1_600,
        world_height: 1_600,
        cell_size: 40,
        max_messages_per_tick: 48,
        max_message_age_ticks: 80,
        max_stream: 128,
        ..CommsConfig::default()
    };
    let mut world = CommsWorld::new(config)?;
    let mut rng = SmallRng::seed_from_u64(0x5EA5_1DE5);
    let hearing = TransportMask::of(&[Transport::Hearing]);

    let square = Position::new(420.0, 420.0);
    let commander = world.spawn_actor(square);
    // Spoken orders by default; the signal lamp overrides per intent.
    world.enable_sender(commander, hearing);
    world.enable_receiver(commander, ReceiverConfig::default());
    world.set_stats(
        commander,
        ActorStats {
            intellect: 0.85,
            conviction: 0.5,
            ..ActorStats::default()
        },
    );

    let mut villagers = Vec::new();
    for _ in 0..6 {
        let jitter_x: f32 = rng.random_range(-18.0..18.0);
        let jitter_y: f32 = rng.random_range(-18.0..18.0);
        let id = world.spawn_actor(Position::new(square.x + jitter_x, square.y + jitter_y));
        world.enable_sender(id, hearing);
        world.enable_receiver(id, ReceiverConfig::default());
        world.set_stats(
            id,
            ActorStats {
                intellect: rng.random_range(0.3..0.9),
                conviction: rng.random_range(0.2..0.8),
                ..ActorStats::default()
            },
        );
        villagers.push(id);
    }

    // The vessel sits in a water column: no hearing from shore, no EM.
    let vessel_pos = Position::new(1_100.0, 1_100.0);
    let vessel = world.spawn_actor(vessel_pos);
    let vessel_cell = world.field().cell_at(vessel_pos.x, vessel_pos.y);
    world.medium_mut().set(vessel_cell, MediumKind::Underwater);
    world.enable_receiver(vessel, ReceiverConfig::default());

    queue_morning_orders(&mut world, commander, &villagers, vessel);

    Ok(HarborShell {
        world,
        commander,
        villagers,
        vessel,
        square_cell_origin: square,
    })
}

fn queue_morning_orders(
    world: &mut CommsWorld,
    commander: ActorId,
    villagers: &[ActorId],
    vessel: ActorId,
) {
    let mut hold = OutboxEntry::new(InterruptKind::Order, "orders/hold-the-quay")
        .addressed_to(villagers[0]);
    hold.flags.requests_ack = true;
    hold.max_attempts = 8;
    hold.cadence_ticks = 4;
    world.queue_intent(commander, hold);

    for (index, villager) in villagers.iter().enumerate().skip(1) {
        world.queue_intent(
            commander,
            OutboxEntry::new(InterruptKind::Order, format!("orders/stack-crates/{index}"))
                .addressed_to(*villager),
        );
    }

    let mut alarm = OutboxEntry::new(InterruptKind::Warning, "warnings/storm-glass-falling");
    alarm.flags = MessageFlags {
        broadcast: true,
        ..MessageFlags::default()
    };
    alarm.strength = 1.0;
    world.queue_intent(commander, alarm);

    // Lamp signal to the submerged vessel rides the vision channel.
    let mut lamp = OutboxEntry::new(InterruptKind::Order, "orders/vessel-stand-off")
        .addressed_to(vessel);
    lamp.preferred = Some(TransportMask::of(&[Transport::Vision]));
    world.queue_intent(commander, lamp);
}

fn run(shell: &mut HarborShell, ticks: u32) {
    for _ in 0..ticks {
        shell.world.refresh_ambient_from_field();
        surface_detection_crossings(shell);
        watch_the_lamp(shell);

        let report = shell.world.step();
        if report.emitted > 0 || report.delivered > 0 {
            info!(
                tick = report.tick.0,
                emitted = report.emitted,
                delivered = report.delivered,
                dropped = report.dropped,
                receipts = report.receipts,
                "tick processed",
            );
        }

        for receipt in shell.world.drain_receipts() {
            info!(
                token = %receipt.token,
                transport = ?receipt.transport,
                interrupt = ?receipt.interrupt,
                integrity = receipt.integrity,
                intent = receipt.intent.as_deref().unwrap_or("<unregistered>"),
                "receipt",
            );
        }
        let commander_interrupts = shell.world.take_interrupts(shell.commander);
        for interrupt in commander_interrupts {
            if interrupt.kind == InterruptKind::AckReceived {
                info!(token = %interrupt.token, "order acknowledged");
            }
        }
        for id in shell.villagers.clone() {
            shell.world.take_interrupts(id);
        }
        shell.world.take_interrupts(shell.vessel);
    }
}

/// Stand-in for the villagers' low-level senses: anyone on the square whose
/// ambient sound level crosses the detection threshold raises a raw crossing
/// for the broadcast path.
fn surface_detection_crossings(shell: &mut HarborShell) {
    let now = shell.world.tick();
    let cell = shell
        .world
        .field()
        .cell_at(shell.square_cell_origin.x, shell.square_cell_origin.y);
    let level = shell
        .world
        .field()
        .ambient(cell, SignalChannel::Sound, now.0);
    if level <= 0.25 {
        return;
    }
    for id in shell.villagers.clone() {
        shell.world.push_sensed(
            id,
            SensedSignal {
                cell,
                transport: Transport::Hearing,
                strength: level,
                noticed: Tick(now.0),
            },
        );
    }
}

/// Stand-in for the vessel's lookout: line of sight to the commander's lamp
/// holds for a stretch of the morning watch.
fn watch_the_lamp(shell: &mut HarborShell) {
    let tick = shell.world.tick().0;
    let contacts = if (4..40).contains(&tick) {
        vec![PerceivedContact {
            target: shell.commander,
            transport: Transport::Vision,
            confidence: 0.9,
            distance: 960.0,
        }]
    } else {
        Vec::new()
    };
    shell.world.set_perception(shell.vessel, contacts);
}

fn report(shell: &HarborShell) {
    let counters = shell.world.counters();
    if let Some(last) = shell.world.history().last() {
        info!(
            tick = last.tick.0,
            emitted = counters.messages_emitted,
            delivered = counters.deliveries,
            dropped = counters.messages_dropped,
            lost = counters.messages_lost,
            misreads = counters.misreads,
            acks = counters.acks_confirmed,
            receipts = counters.receipts_processed,
            stream = last.stream_len,
            "harbor morning complete",
        );
    } else {
        warn!("no ticks were processed");
    }
}
