use anyhow::{Context, Result};
use reefbots_core::{FishId, Mass, Phase, ReefConfig, ReefState, SpeciesId};
use std::fs;
use tracing::{info, warn};

const JUVENILE_COHORT: usize = 12;
const LARVAL_COHORT: usize = 8;
const RUN_TICKS: u64 = 600;
const FORAGE_RATION: f32 = 0.6;
const SUMMARY_INTERVAL: u64 = 50;

fn main() -> Result<()> {
    init_tracing();
    let config = load_config()?;
    info!("Starting ReefBots simulation shell");
    run(config)
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn load_config() -> Result<ReefConfig> {
    match std::env::args().nth(1) {
        Some(path) => {
            let raw = fs::read_to_string(&path)
                .with_context(|| format!("reading config file {path}"))?;
            let config: ReefConfig =
                serde_json::from_str(&raw).with_context(|| format!("parsing config {path}"))?;
            info!(path = %path, "Loaded reef configuration");
            Ok(config)
        }
        None => Ok(ReefConfig {
            rng_seed: Some(0xFACA_DEAF_0123_4567),
            ..ReefConfig::default()
        }),
    }
}

fn run(config: ReefConfig) -> Result<()> {
    let mut world = ReefState::new(config).context("constructing reef world")?;
    seed_cohort(&mut world)?;

    for _ in 0..RUN_TICKS {
        feed_cohort(&mut world);
        let events = world.step();

        for death in &events.deaths {
            info!(
                tick = events.tick.0,
                fish = ?death.id,
                cause = ?death.cause,
                "Fish retired",
            );
        }
        if events.tick.0.is_multiple_of(SUMMARY_INTERVAL) {
            log_summary(&world);
        }
    }

    if let Some(summary) = world.history().last() {
        info!(
            tick = summary.tick.0,
            fish = summary.fish_count,
            total_reserves = summary.total_reserves,
            discarded = summary.discarded_energy,
            "Run complete",
        );
    } else {
        warn!("Run completed without telemetry summaries");
    }
    Ok(())
}

fn seed_cohort(world: &mut ReefState) -> Result<()> {
    for _ in 0..JUVENILE_COHORT {
        world
            .spawn_juvenile(SpeciesId(0))
            .context("spawning juvenile")?;
    }
    for _ in 0..LARVAL_COHORT {
        world.spawn_larva(SpeciesId(0)).context("spawning larva")?;
    }
    info!(
        juveniles = JUVENILE_COHORT,
        larvae = LARVAL_COHORT,
        "Seeded starting cohort",
    );
    Ok(())
}

fn feed_cohort(world: &mut ReefState) {
    let handles: Vec<FishId> = world.fish().iter_handles().collect();
    for id in handles {
        // Reproductive investment follows the phase the fish has reached.
        let reproductive = world
            .fish_runtime(id)
            .and_then(|runtime| runtime.life_cycle.as_ref())
            .is_some_and(|cycle| cycle.is_reproductive());
        world.set_reproductive(id, reproductive);
        let _ = world.ingest(id, Mass::new(FORAGE_RATION));
    }
}

fn log_summary(world: &ReefState) {
    let Some(summary) = world.history().last() else {
        return;
    };
    let terminal_count = world
        .fish()
        .iter_handles()
        .filter_map(|id| world.fish_runtime(id))
        .filter_map(|runtime| runtime.life_cycle.as_ref())
        .filter(|cycle| cycle.phase() == Phase::Terminal)
        .count();
    info!(
        tick = summary.tick.0,
        fish = summary.fish_count,
        settlements = summary.settlements,
        deaths = summary.deaths,
        digesta = summary.digesta_energy,
        discarded = summary.discarded_energy,
        avg_reserves = summary.average_reserves,
        terminal = terminal_count,
        "Reef summary",
    );
}
