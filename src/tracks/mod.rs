//! Track aggregation service.
//!
//! [`TrackService`] consumes position reports from the bus, folds them into a
//! [`TrackStore`] and periodically expires tracks that stopped reporting,
//! announcing each batch of expirations on the output topic.

mod store;

pub use store::{IngestOutcome, RetentionWindows, TrackStore};

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bus::{EventBus, Subscription};
use crate::clock::TimeSource;
use crate::codec;
use crate::config::TrackServiceConfig;
use crate::error::{BusError, TrackServiceError};
use crate::models::{Identity, PositionReport, Track, TracksUpdate};

/// Tasks owned by a running service.
struct RunningTasks {
    cancel: CancellationToken,
    consume: JoinHandle<()>,
    sweep: Option<JoinHandle<()>>,
}

pub struct TrackService {
    bus: EventBus,
    clock: Arc<dyn TimeSource>,
    config: TrackServiceConfig,
    store: Arc<TrackStore>,
    running: Mutex<Option<RunningTasks>>,
}

impl TrackService {
    pub fn new(bus: EventBus, clock: Arc<dyn TimeSource>, config: TrackServiceConfig) -> Self {
        let store = Arc::new(TrackStore::new(config.retention(), config.sample_spacing_s));
        Self {
            bus,
            clock,
            config,
            store,
            running: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &TrackServiceConfig {
        &self.config
    }

    /// Shared handle to the underlying store, for readers that outlive a borrow
    /// of the service.
    pub fn store(&self) -> Arc<TrackStore> {
        self.store.clone()
    }

    fn running(&self) -> MutexGuard<'_, Option<RunningTasks>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_running(&self) -> bool {
        self.running().is_some()
    }

    /// Subscribe to the input topic and start the consume and sweep tasks.
    ///
    /// Calling `run` on a running service does nothing. Reports published
    /// before `run` returns successfully are not seen.
    pub fn run(&self) -> Result<(), TrackServiceError> {
        let mut running = self.running();
        if running.is_some() {
            debug!("Track service already running");
            return Ok(());
        }

        let subscription = self.bus.subscribe(&self.config.topic_in)?;
        let cancel = CancellationToken::new();

        let consume = tokio::spawn(consume_reports(
            subscription,
            self.store.clone(),
            cancel.clone(),
        ));

        let sweep = if self.config.sweep_enabled() {
            let sweeper = ExpirySweep {
                store: self.store.clone(),
                bus: self.bus.clone(),
                clock: self.clock.clone(),
                interval_s: self.config.effective_sweep_interval(),
                expiry_s: self.config.expiry_s,
                topic_out: self.config.topic_out.clone(),
            };
            Some(tokio::spawn(sweeper.run(cancel.clone())))
        } else {
            info!(
                expiry_s = self.config.expiry_s,
                "Track expiry disabled, not starting sweep"
            );
            None
        };

        info!(
            topic_in = %self.config.topic_in,
            topic_out = %self.config.topic_out,
            expiry_s = self.config.expiry_s,
            sweep_interval_s = self.config.effective_sweep_interval(),
            "Track service started"
        );

        *running = Some(RunningTasks {
            cancel,
            consume,
            sweep,
        });
        Ok(())
    }

    /// Cancel both tasks and wait for them to finish. Idempotent.
    pub async fn stop(&self) {
        let Some(tasks) = self.running().take() else {
            return;
        };
        tasks.cancel.cancel();
        if let Err(e) = tasks.consume.await {
            error!("Track consume task failed: {}", e);
        }
        if let Some(sweep) = tasks.sweep
            && let Err(e) = sweep.await
        {
            error!("Track expiry task failed: {}", e);
        }
        info!("Track service stopped");
    }

    pub fn get(&self, identity: &Identity) -> Option<Track> {
        self.store.get(identity)
    }

    pub fn list_active(&self) -> Vec<Track> {
        self.store.list_active()
    }

    pub fn active_count(&self) -> usize {
        self.store.active_count()
    }

    pub fn pin(&self, identity: &Identity) {
        self.store.set_pinned(identity, true);
    }

    pub fn unpin(&self, identity: &Identity) {
        self.store.set_pinned(identity, false);
    }

    pub fn is_pinned(&self, identity: &Identity) -> bool {
        self.store.is_pinned(identity)
    }

    /// Change both retention windows and re-trim every track right away.
    pub fn set_retention(&self, trail_window_s: f64, pinned_trail_window_s: f64) {
        self.store.set_retention(RetentionWindows {
            default_s: trail_window_s,
            pinned_s: pinned_trail_window_s,
        });
    }

    pub fn retrim_all(&self) {
        let removed = self.store.retrim_all();
        debug!(removed, "Re-trimmed all trails");
    }

    /// Forget every track and pin, e.g. when switching between live and replay.
    pub fn clear(&self) {
        self.store.clear();
        metrics::gauge!("tracks.active").set(0.0);
        info!("Cleared all tracks");
    }
}

async fn consume_reports(
    mut subscription: Subscription,
    store: Arc<TrackStore>,
    cancel: CancellationToken,
) {
    loop {
        let envelope = tokio::select! {
            _ = cancel.cancelled() => break,
            envelope = subscription.recv() => match envelope {
                Some(envelope) => envelope,
                None => {
                    info!(topic = %subscription.topic(), "Input topic closed, track consumer exiting");
                    break;
                }
            },
        };

        let report: PositionReport = match codec::unpack(&envelope.payload) {
            Ok(report) => report,
            Err(e) => {
                warn!(topic = %envelope.topic, "Skipping malformed position report: {}", e);
                metrics::counter!("tracks.payload_errors_total").increment(1);
                continue;
            }
        };

        match store.ingest(&report) {
            IngestOutcome::Created | IngestOutcome::Updated => {
                metrics::counter!("tracks.reports_accepted_total").increment(1);
            }
            IngestOutcome::OutOfOrder => {
                metrics::counter!("tracks.reports_out_of_order_total").increment(1);
            }
            IngestOutcome::Invalid => {
                warn!(identity = %report.identity, "Skipping report with non-finite timestamp");
                metrics::counter!("tracks.payload_errors_total").increment(1);
            }
        }
    }
    subscription.close();
}

struct ExpirySweep {
    store: Arc<TrackStore>,
    bus: EventBus,
    clock: Arc<dyn TimeSource>,
    interval_s: f64,
    expiry_s: f64,
    topic_out: String,
}

impl ExpirySweep {
    async fn run(self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                slept = self.clock.sleep(self.interval_s) => {
                    if let Err(e) = slept {
                        error!("Track expiry sweep cannot sleep: {}", e);
                        break;
                    }
                }
            }

            if let Err(BusError::Closed) = self.sweep_once() {
                debug!("Bus closed, track expiry sweep exiting");
                break;
            }
        }
    }

    fn sweep_once(&self) -> Result<(), BusError> {
        let now = self.clock.report_time();
        let expired = self.store.expire(now, self.expiry_s);
        let active = self.store.active_count();
        metrics::gauge!("tracks.active").set(active as f64);

        if expired.is_empty() {
            return Ok(());
        }

        metrics::counter!("tracks.expired_total").increment(expired.len() as u64);
        info!(count = expired.len(), active, as_of = now, "Expired stale tracks");

        let update = TracksUpdate {
            as_of: now,
            active,
            expired,
        };
        match codec::pack(&update) {
            Ok(payload) => self.bus.publish(&self.topic_out, payload),
            Err(e) => {
                error!("Failed to encode tracks update: {}", e);
                Ok(())
            }
        }
    }
}
