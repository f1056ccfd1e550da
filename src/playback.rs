//! Deterministic replay of recorded position reports.
//!
//! A trace is a JSONL file, one record per line:
//!
//! ```text
//! {"t_mono": 0.0, "msg": {"icao24": "abc123", "lat": 40.0, "lon": -74.0, "src": "PLAYBACK"}}
//! {"t_mono": 0.4, "msg": {"icao24": "abc123", "ground_speed": 450}}
//! ```
//!
//! `t_mono` is the recorded relative time in seconds. `msg` follows the
//! position report schema; any `ts` it carries (number, string or null) is
//! ignored and replaced by the clock's report time when the report is
//! published.

use serde::Deserialize;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bus::EventBus;
use crate::clock::TimeSource;
use crate::codec;
use crate::config::PlaybackConfig;
use crate::error::SourceError;
use crate::lifecycle::SourceControl;
use crate::models::PositionReport;

/// One replayable record.
#[derive(Debug, Clone, PartialEq)]
pub struct TraceEvent {
    /// Recorded relative time, seconds
    pub t_mono: f64,
    pub report: PositionReport,
}

#[derive(Debug, Deserialize)]
struct TraceRecord {
    t_mono: f64,
    msg: serde_json::Map<String, serde_json::Value>,
}

fn parse_line(line: &str) -> Result<TraceEvent, String> {
    let record: TraceRecord = serde_json::from_str(line).map_err(|e| e.to_string())?;
    if !record.t_mono.is_finite() {
        return Err(format!("t_mono is not finite: {}", record.t_mono));
    }
    let mut msg = record.msg;
    // Replaced at publish time; only present so the report validates.
    msg.insert("ts".to_string(), serde_json::Value::from(0.0));
    let report: PositionReport =
        serde_json::from_value(serde_json::Value::Object(msg)).map_err(|e| e.to_string())?;
    Ok(TraceEvent {
        t_mono: record.t_mono,
        report,
    })
}

/// Parse trace text, sorted by recorded time (stable for equal times).
///
/// Blank lines are ignored. Invalid lines are logged and skipped; the number of
/// skipped lines is returned alongside the events.
pub fn parse_trace(text: &str, origin: &Path) -> (Vec<TraceEvent>, usize) {
    let mut events = Vec::new();
    let mut skipped = 0;
    for (index, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match parse_line(line) {
            Ok(event) => events.push(event),
            Err(e) => {
                warn!(
                    path = %origin.display(),
                    line = index + 1,
                    "Skipping invalid trace line: {}",
                    e
                );
                skipped += 1;
            }
        }
    }
    events.sort_by(|a, b| a.t_mono.total_cmp(&b.t_mono));
    (events, skipped)
}

/// Map recorded times onto the clock: intervals are divided by `speed` and the
/// first event lands on `start`.
pub fn build_schedule(times: &[f64], speed: f64, start: f64) -> Vec<f64> {
    let Some(&first) = times.first() else {
        return Vec::new();
    };
    times
        .iter()
        .map(|&t| {
            let compressed = first + (t - first) / speed;
            compressed + (start - first)
        })
        .collect()
}

/// Clock times still to be reached by a running replay, earliest first.
#[derive(Debug, Default)]
pub(crate) struct PendingSchedule(Mutex<VecDeque<f64>>);

impl PendingSchedule {
    fn lock(&self) -> MutexGuard<'_, VecDeque<f64>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn next_due(&self) -> Option<f64> {
        self.lock().front().copied()
    }

    fn replace(&self, due: impl IntoIterator<Item = f64>) {
        *self.lock() = due.into_iter().collect();
    }

    fn advance(&self) {
        self.lock().pop_front();
    }

    pub(crate) fn clear(&self) {
        self.lock().clear();
    }
}

/// Publishes recorded events at their scheduled clock times, restarting after
/// a delay when looping.
pub(crate) struct TimedReplay<'a> {
    pub clock: &'a dyn TimeSource,
    pub config: &'a PlaybackConfig,
    pub pending: &'a PendingSchedule,
    pub origin: &'a Path,
}

impl TimedReplay<'_> {
    /// First pass starts at `config.start_at` when set, otherwise at the
    /// current clock time. Later passes start when the restart delay ends.
    pub(crate) async fn run<E: Sync>(
        &self,
        cancel: &CancellationToken,
        events: &[E],
        recorded_at: impl Fn(&E) -> f64,
        mut publish: impl FnMut(&E) -> Result<(), SourceError>,
    ) -> Result<u64, SourceError> {
        if events.is_empty() {
            warn!(path = %self.origin.display(), "No valid events to replay");
            return Ok(0);
        }

        let times: Vec<f64> = events.iter().map(&recorded_at).collect();
        let speed = self.config.effective_speed();
        let mut start = self
            .config
            .start_at
            .filter(|t| t.is_finite())
            .unwrap_or_else(|| self.clock.monotonic());
        let mut published = 0;
        loop {
            let schedule = build_schedule(&times, speed, start);
            self.pending.replace(schedule.iter().copied());

            for (due, event) in schedule.iter().copied().zip(events) {
                if cancel.is_cancelled() {
                    return Ok(published);
                }
                if due > self.clock.monotonic() {
                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(published),
                        slept = self.clock.sleep_until(due) => slept?,
                    }
                }
                self.pending.advance();
                publish(event)?;
                published += 1;
            }

            if !self.config.looping {
                break;
            }

            let delay = self.config.loop_restart_delay_s.max(0.0);
            self.pending.replace([self.clock.monotonic() + delay]);
            tokio::select! {
                _ = cancel.cancelled() => break,
                slept = self.clock.sleep(delay) => slept?,
            }
            start = self.clock.monotonic();
            debug!(path = %self.origin.display(), "Restarting replay");
        }
        Ok(published)
    }
}

/// Read a replay file, logging and returning `None` when it cannot be read.
pub(crate) async fn read_replay_file(path: &Path) -> Option<String> {
    match tokio::fs::read_to_string(path).await {
        Ok(text) => Some(text),
        Err(e) => {
            error!(path = %path.display(), "Failed to read replay file: {}", e);
            None
        }
    }
}

/// Replays a JSONL trace onto the bus at clock-relative times.
///
/// With a [`VirtualClock`](crate::clock::VirtualClock), driving the clock to
/// each [`next_due_monotonic`](Self::next_due_monotonic) in turn reproduces the
/// trace timing exactly.
pub struct FilePlaybackSource {
    path: PathBuf,
    bus: EventBus,
    clock: Arc<dyn TimeSource>,
    config: PlaybackConfig,
    events: OnceCell<Vec<TraceEvent>>,
    pending: PendingSchedule,
    control: SourceControl,
}

impl FilePlaybackSource {
    pub fn new(
        path: impl Into<PathBuf>,
        bus: EventBus,
        clock: Arc<dyn TimeSource>,
        config: PlaybackConfig,
    ) -> Self {
        Self {
            path: path.into(),
            bus,
            clock,
            config,
            events: OnceCell::new(),
            pending: PendingSchedule::default(),
            control: SourceControl::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_running(&self) -> bool {
        self.control.is_running()
    }

    /// Due time of the next event still to be published, if any.
    ///
    /// An event whose time has come but which the replay task has not yet
    /// published keeps being reported, so the result can equal the current
    /// clock time. Stepping the clock to it is a no-op that lets the task
    /// catch up without skipping past the event.
    pub fn next_due_monotonic(&self) -> Option<f64> {
        self.pending.next_due()
    }

    /// Replay the trace, returning once it is exhausted (or, when looping,
    /// once [`stop`](Self::stop) is called).
    ///
    /// Fails with [`SourceError::AlreadyRunning`] if a replay is in progress.
    pub async fn run(&self) -> Result<(), SourceError> {
        let (cancel, _guard) = self.control.begin()?;

        info!(
            path = %self.path.display(),
            speed = self.config.effective_speed(),
            looping = self.config.looping,
            "Starting trace replay"
        );
        let result = self.replay(&cancel).await;
        self.pending.clear();
        let published = result?;
        info!(path = %self.path.display(), published, "Trace replay finished");
        Ok(())
    }

    /// Ask a running replay to finish and wait until it has. No-op when idle.
    pub async fn stop(&self) {
        if self.control.stop().await {
            debug!(path = %self.path.display(), "Trace replay stopped");
        }
    }

    async fn load(&self) -> &[TraceEvent] {
        self.events
            .get_or_init(|| async {
                let Some(text) = read_replay_file(&self.path).await else {
                    return Vec::new();
                };
                let (events, skipped) = parse_trace(&text, &self.path);
                if skipped > 0 {
                    metrics::counter!("playback.lines_skipped_total").increment(skipped as u64);
                }
                info!(
                    path = %self.path.display(),
                    events = events.len(),
                    skipped,
                    "Loaded trace"
                );
                events
            })
            .await
    }

    async fn replay(&self, cancel: &CancellationToken) -> Result<u64, SourceError> {
        let events = self.load().await;
        TimedReplay {
            clock: self.clock.as_ref(),
            config: &self.config,
            pending: &self.pending,
            origin: &self.path,
        }
        .run(
            cancel,
            events,
            |e: &TraceEvent| e.t_mono,
            |e: &TraceEvent| self.publish(&e.report),
        )
        .await
    }

    fn publish(&self, report: &PositionReport) -> Result<(), SourceError> {
        let mut report = report.clone();
        report.timestamp = self.clock.report_time();
        match codec::pack(&report) {
            Ok(payload) => {
                self.bus.publish(&self.config.topic, payload)?;
                metrics::counter!("playback.events_published_total").increment(1);
            }
            Err(e) => warn!(identity = %report.identity, "Failed to encode report: {}", e),
        }
        Ok(())
    }
}
