// SPDX-License-Identifier: MIT OR Apache-2.0
//! Cadence sequence player.
//!
//! Loads a RON sequence manifest (or the bundled intro sequence), builds one
//! unit per entry on the reference clock host, then plays and rewinds it.

use cadence_sequencer::{
    ClockHost, ClockProbe, ConfigurationError, Direction, EffectGenerator, Phase, Scheduler,
    SequenceManifest, SequencerError, StructuralError, Unit,
};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const BUNDLED_SEQUENCE: &str = include_str!("../sequences/intro.ron");

#[derive(Debug, Error)]
enum PlayerError {
    #[error("Could not read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Invalid manifest: {0}")]
    Manifest(#[from] ConfigurationError),
    #[error(transparent)]
    Structure(#[from] StructuralError),
    #[error("Playback failed: {0}")]
    Playback(#[from] SequencerError),
}

fn load_manifest(path: Option<&Path>) -> Result<SequenceManifest, PlayerError> {
    match path {
        Some(path) => SequenceManifest::load(path).map_err(|source| PlayerError::Io {
            path: path.to_path_buf(),
            source,
        }),
        None => Ok(SequenceManifest::from_ron(BUNDLED_SEQUENCE)?),
    }
}

/// Build the scheduler and one probed unit per manifest entry
fn assemble(manifest: &SequenceManifest) -> Result<(Scheduler, Vec<(Unit, ClockProbe)>), PlayerError> {
    let scheduler = Scheduler::new(manifest.scheduler.clone())?;
    let mut units = Vec::with_capacity(manifest.units.len());

    for spec in &manifest.units {
        let host = ClockHost::new();
        let probe = host.probe();
        let unit = Unit::builder(spec.kind, EffectGenerator::keyframes(spec.keyframes.clone()))
            .target(spec.target.clone())
            .config(spec.config.clone())
            .build(host)?;

        for direction in [Direction::Forward, Direction::Backward] {
            let target = spec.target.clone();
            unit.on_phase_finish(direction, Phase::Active, move |event| {
                tracing::info!(
                    unit = %event.unit,
                    target = %target,
                    direction = ?event.direction,
                    "Active phase finished"
                );
                Ok(())
            });
        }
        units.push((unit, probe));
    }

    scheduler.add_units(units.iter().map(|(unit, _)| unit.clone()))?;
    Ok((scheduler, units))
}

async fn run(path: Option<PathBuf>) -> Result<(), PlayerError> {
    let manifest = load_manifest(path.as_deref())?;
    let (scheduler, units) = assemble(&manifest)?;
    let timing = scheduler.timing();
    tracing::info!(
        sequence = %manifest.scheduler.description,
        units = units.len(),
        duration_ms = timing.duration,
        "Sequence loaded"
    );

    scheduler.play()?.await?;
    for (unit, probe) in &units {
        tracing::info!(
            unit = %unit.id(),
            target = %unit.target(),
            kind = unit.kind().name(),
            visible = ?probe.presence(),
            value = ?probe.sampled_value(),
            "Played"
        );
    }

    scheduler.rewind()?.await?;
    tracing::info!(status = ?scheduler.status(), "Rewound");
    Ok(())
}

fn main() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("cadence_sequencer=debug,cadence_player=info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Cadence player v{}", env!("CARGO_PKG_VERSION"));

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_time().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!("Could not start runtime: {e}");
            std::process::exit(1);
        }
    };

    let path = std::env::args_os().nth(1).map(PathBuf::from);
    if let Err(e) = runtime.block_on(run(path)) {
        tracing::error!("Player failed: {e}");
        std::process::exit(1);
    }
}
