use anyhow::{Context, Result};
use pocketscope::bus::EventBus;
use pocketscope::clock::{RealClock, TimeSource};
use pocketscope::codec;
use pocketscope::config::PipelineConfig;
use pocketscope::models::{Track, TracksUpdate};
use pocketscope::tracks::{TrackService, TrackStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// How many tracks the periodic summary lists by name
const SUMMARY_TRACKS: usize = 5;

/// Upper bound on waiting for subscriber queues to empty at shutdown
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Clock, bus and track service wired together on the real clock.
pub(crate) struct Pipeline {
    pub clock: Arc<dyn TimeSource>,
    pub bus: EventBus,
    pub tracks: TrackService,
    reporters_cancel: CancellationToken,
    reporters: Vec<JoinHandle<()>>,
}

impl Pipeline {
    pub fn start(config: &PipelineConfig, summary_interval_s: f64) -> Result<Self> {
        let clock: Arc<dyn TimeSource> = Arc::new(RealClock::new());
        let bus = EventBus::new(clock.clone(), config.bus.queue_capacity);
        let tracks = TrackService::new(bus.clone(), clock.clone(), config.tracks.clone());

        let reporters_cancel = CancellationToken::new();
        let mut reporters = Vec::new();
        // Subscribe before anything can expire so no update is missed.
        let updates = bus
            .subscribe(&config.tracks.topic_out)
            .context("Failed to subscribe to track updates")?;
        reporters.push(spawn_expiry_logger(updates, reporters_cancel.clone()));
        if summary_interval_s > 0.0 {
            reporters.push(spawn_summary_reporter(
                tracks.store(),
                bus.clone(),
                config.tracks.topic_in.clone(),
                Duration::from_secs_f64(summary_interval_s),
                reporters_cancel.clone(),
            ));
        }

        tracks.run().context("Failed to start track service")?;

        Ok(Self {
            clock,
            bus,
            tracks,
            reporters_cancel,
            reporters,
        })
    }

    /// Wait (bounded) for subscribers to consume what is already queued, then
    /// stop every task and close the bus.
    pub async fn shutdown(self) {
        let started = tokio::time::Instant::now();
        loop {
            let backlog: usize = self
                .bus
                .metrics()
                .topics
                .values()
                .map(|stats| stats.queue_len)
                .sum();
            if backlog == 0 {
                break;
            }
            if started.elapsed() >= DRAIN_TIMEOUT {
                warn!(backlog, "Giving up waiting for queues to drain");
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        self.tracks.stop().await;
        self.reporters_cancel.cancel();
        for handle in self.reporters {
            let _ = handle.await;
        }

        for (topic, stats) in self.bus.metrics().topics {
            info!(
                topic = %topic,
                publishes = stats.publishes,
                deliveries = stats.deliveries,
                drops = stats.drops,
                "Bus topic totals"
            );
        }
        info!(
            active_tracks = self.tracks.active_count(),
            "Pipeline shut down"
        );
        self.bus.close();
    }
}

/// Resolves on SIGINT or SIGTERM (Ctrl+C only on non-unix).
pub(crate) async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let (mut sigterm, mut sigint) =
            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
                (Err(e), _) | (_, Err(e)) => {
                    error!("Failed to register signal handlers: {}", e);
                    return std::future::pending().await;
                }
            };

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
            _ = sigint.recv() => info!("Received SIGINT (Ctrl+C), shutting down"),
        }
    }

    #[cfg(not(unix))]
    {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received SIGINT (Ctrl+C), shutting down"),
            Err(e) => {
                error!("Failed to listen for SIGINT signal: {}", e);
                std::future::pending::<()>().await;
            }
        }
    }
}

fn describe(track: &Track) -> String {
    let mut parts = vec![track.identity.to_string()];
    if let Some(callsign) = &track.callsign {
        parts.push(callsign.clone());
    }
    if let Some(alt) = track.state.baro_alt.or(track.state.geo_alt) {
        parts.push(format!("{:.0}ft", alt));
    }
    if let Some(gs) = track.state.ground_speed {
        parts.push(format!("{:.0}kt", gs));
    }
    let secs = track.last_update_ts.floor();
    let nanos = ((track.last_update_ts - secs) * 1e9) as u32;
    if let Some(seen) = chrono::DateTime::from_timestamp(secs as i64, nanos) {
        parts.push(format!("seen {}", seen.format("%H:%M:%S")));
    }
    parts.join(" ")
}

/// Log every batch of expired tracks.
fn spawn_expiry_logger(
    mut updates: pocketscope::bus::Subscription,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let envelope = tokio::select! {
                _ = cancel.cancelled() => break,
                envelope = updates.recv() => match envelope {
                    Some(envelope) => envelope,
                    None => break,
                },
            };
            match codec::unpack::<TracksUpdate>(&envelope.payload) {
                Ok(update) => {
                    let expired: Vec<&str> = update.expired.iter().map(|id| id.as_str()).collect();
                    info!(
                        active = update.active,
                        "Tracks expired: {}",
                        expired.join(", ")
                    );
                }
                Err(e) => warn!("Unreadable tracks update: {}", e),
            }
        }
    })
}

/// Periodically log the active track count, a few tracks and bus health.
fn spawn_summary_reporter(
    store: Arc<TrackStore>,
    bus: EventBus,
    topic_in: String,
    every: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.tick().await; // First tick completes immediately

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            let tracks = store.list_active();
            let input = bus.metrics().topics.get(&topic_in).copied().unwrap_or_default();
            info!(
                active = tracks.len(),
                received = input.publishes,
                dropped = input.drops,
                backlog = input.queue_len,
                "Track summary"
            );
            for track in tracks.iter().take(SUMMARY_TRACKS) {
                info!("  {}", describe(track));
            }
        }
    })
}
