use anyhow::Context;
use common::TelemetryGuard;
use ingest::{
    AppConfig, Envelope, Frame, SourceExit, SourceId,
    logging::{SERVICE_NAME, setup_logging},
};
use signal_hook::{
    consts::{SIGINT, SIGTERM},
    flag,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Per-source frame totals across every batch taken so far.
#[derive(Default)]
struct Tally {
    frames: BTreeMap<SourceId, u64>,
}

impl Tally {
    fn record(&mut self, batch: Vec<Envelope<Frame>>) {
        if batch.is_empty() {
            return;
        }

        let mut counts: BTreeMap<SourceId, u64> = BTreeMap::new();
        let mut bytes = 0;
        for envelope in batch {
            bytes += envelope.payload.data().len();
            *counts.entry(envelope.source_id).or_default() += 1;
        }

        for (id, count) in &counts {
            tracing::debug!(source_id = %id, frames = count, "Batch received");
            *self.frames.entry(id.clone()).or_default() += count;
        }
        tracing::info!(
            frames = counts.values().sum::<u64>(),
            sources = counts.len(),
            bytes,
            "Batch taken"
        );
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load().context("Failed to load configuration")?;

    let _telemetry = config
        .otel_endpoint
        .as_ref()
        .map(|endpoint| TelemetryGuard::init(SERVICE_NAME, endpoint))
        .transpose()?;

    setup_logging(&config);

    tracing::info!(config = ?config, "Loaded configuration");

    let shutdown = Arc::new(AtomicBool::new(false));
    flag::register(SIGTERM, Arc::clone(&shutdown))?;
    flag::register(SIGINT, Arc::clone(&shutdown))?;

    tracing::info!("Signal handlers registered (SIGTERM, SIGINT)");

    let controller = Arc::new(
        config
            .factory()
            .build()
            .context("Invalid pipeline configuration")?,
    );
    controller.start_sources();

    let drainer = {
        let controller = Arc::clone(&controller);
        let timeout = config.drain_timeout();
        tokio::task::spawn_blocking(move || controller.run_loop(timeout))
    };

    let mut tally = Tally::default();
    loop {
        tokio::time::sleep(config.poll_interval()).await;
        tally.record(controller.take_buffered());

        if shutdown.load(Ordering::Relaxed) {
            tracing::info!("Shutdown signal received, stopping sources");
            break;
        }
        if !controller.has_alive_sources() {
            tracing::info!("All sources stopped");
            break;
        }
    }

    let exits = {
        let controller = Arc::clone(&controller);
        tokio::task::spawn_blocking(move || controller.stop_sources())
            .await
            .context("Stopping sources panicked")?
    };
    let moved = drainer.await.context("Drain loop panicked")?;
    tally.record(controller.take_buffered());

    let stats: BTreeMap<_, _> = controller.stats().into_iter().collect();
    let mut failures = 0;
    for (id, exit) in &exits {
        let stats = stats.get(id).copied().unwrap_or_default();
        let delivered = tally.frames.get(id).copied().unwrap_or_default();
        tracing::info!(
            source_id = %id,
            exit = ?exit,
            captured = stats.captured,
            published = stats.published,
            dropped = stats.dropped,
            retries = stats.retries,
            delivered,
            "Source summary"
        );
        if matches!(exit, SourceExit::Failed(_)) {
            failures += 1;
        }
    }

    tracing::info!(moved, sources = exits.len(), failures, "Pipeline stopped");
    Ok(())
}
