//! Capturing bus traffic to JSONL and playing it back.
//!
//! Each line of a recording holds one envelope:
//!
//! ```text
//! {"topic": "adsb.msg", "t_mono": 12.345, "t_wall": 1714564800.123, "payload_hex": "7b226963..."}
//! ```
//!
//! `t_mono` is the clock's monotonic time at publish, `t_wall` the matching
//! wall time. Payloads are stored hex-encoded and replayed byte for byte to
//! the topic they were recorded from.

use bytes::Bytes;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::io::AsyncWriteExt;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::{Envelope, EventBus, Subscription};
use crate::clock::TimeSource;
use crate::config::PlaybackConfig;
use crate::error::{BusError, SourceError};
use crate::lifecycle::SourceControl;
use crate::playback::{PendingSchedule, TimedReplay, read_replay_file};

/// One line of a recording.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusRecord {
    pub topic: String,
    pub t_mono: f64,
    pub t_wall: f64,
    pub payload_hex: String,
}

impl BusRecord {
    /// `wall_offset` is the clock's wall time minus its monotonic time.
    pub fn from_envelope(envelope: &Envelope, wall_offset: f64) -> Self {
        Self {
            topic: envelope.topic.clone(),
            t_mono: envelope.timestamp,
            t_wall: envelope.timestamp + wall_offset,
            payload_hex: hex::encode(&envelope.payload),
        }
    }
}

/// A decoded recording line, ready to be published again.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedEnvelope {
    pub t_mono: f64,
    pub topic: String,
    pub payload: Bytes,
}

fn parse_record(line: &str) -> Result<RecordedEnvelope, String> {
    let record: BusRecord = serde_json::from_str(line).map_err(|e| e.to_string())?;
    if !record.t_mono.is_finite() {
        return Err(format!("t_mono is not finite: {}", record.t_mono));
    }
    if record.topic.is_empty() {
        return Err("empty topic".to_string());
    }
    let payload = hex::decode(&record.payload_hex).map_err(|e| format!("payload_hex: {e}"))?;
    Ok(RecordedEnvelope {
        t_mono: record.t_mono,
        topic: record.topic,
        payload: Bytes::from(payload),
    })
}

/// Parse recording text, sorted by `t_mono` (stable for equal times).
///
/// Blank lines are ignored; invalid lines are logged, skipped and counted.
pub fn parse_recording(text: &str, origin: &Path) -> (Vec<RecordedEnvelope>, usize) {
    let mut envelopes = Vec::new();
    let mut skipped = 0;
    for (index, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match parse_record(line) {
            Ok(envelope) => envelopes.push(envelope),
            Err(e) => {
                warn!(
                    path = %origin.display(),
                    line = index + 1,
                    "Skipping invalid recording line: {}",
                    e
                );
                skipped += 1;
            }
        }
    }
    envelopes.sort_by(|a, b| a.t_mono.total_cmp(&b.t_mono));
    (envelopes, skipped)
}

/// Appends every envelope published on a set of topics to a JSONL file.
///
/// Subscriptions are taken when the recorder is created, so nothing published
/// after [`new`](Self::new) returns is missed even if [`run`](Self::run)
/// starts later.
pub struct BusRecorder {
    path: PathBuf,
    bus: EventBus,
    clock: Arc<dyn TimeSource>,
    topics: Vec<String>,
    subscriptions: Mutex<Vec<Subscription>>,
    control: SourceControl,
}

impl BusRecorder {
    pub fn new(
        path: impl Into<PathBuf>,
        bus: EventBus,
        clock: Arc<dyn TimeSource>,
        topics: impl IntoIterator<Item = impl Into<String>>,
    ) -> Result<Self, BusError> {
        let topics: Vec<String> = topics.into_iter().map(Into::into).collect();
        let subscriptions = Self::subscribe_all(&bus, &topics)?;
        Ok(Self {
            path: path.into(),
            bus,
            clock,
            topics,
            subscriptions: Mutex::new(subscriptions),
            control: SourceControl::new(),
        })
    }

    fn subscribe_all(bus: &EventBus, topics: &[String]) -> Result<Vec<Subscription>, BusError> {
        topics.iter().map(|topic| bus.subscribe(topic)).collect()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn topics(&self) -> &[String] {
        &self.topics
    }

    pub fn is_running(&self) -> bool {
        self.control.is_running()
    }

    /// Record until stopped or until every topic is closed, truncating the
    /// output file first. Returns the number of envelopes written.
    ///
    /// Envelopes already queued when [`stop`](Self::stop) is called are still
    /// written before the run ends.
    pub async fn run(&self) -> Result<u64, SourceError> {
        let (cancel, _guard) = self.control.begin()?;

        let taken = std::mem::take(
            &mut *self
                .subscriptions
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        let subscriptions = if taken.is_empty() {
            Self::subscribe_all(&self.bus, &self.topics)?
        } else {
            taken
        };

        let file = tokio::fs::File::create(&self.path)
            .await
            .map_err(|source| self.write_error(source))?;
        let mut out = tokio::io::BufWriter::new(file);

        info!(path = %self.path.display(), topics = ?self.topics, "Starting bus recording");
        let written = self.record(&cancel, subscriptions, &mut out).await;
        let flushed = out.flush().await.map_err(|source| self.write_error(source));
        let written = written?;
        flushed?;
        info!(path = %self.path.display(), written, "Bus recording finished");
        Ok(written)
    }

    pub async fn stop(&self) {
        if self.control.stop().await {
            debug!(path = %self.path.display(), "Bus recording stopped");
        }
    }

    async fn record(
        &self,
        cancel: &CancellationToken,
        subscriptions: Vec<Subscription>,
        out: &mut tokio::io::BufWriter<tokio::fs::File>,
    ) -> Result<u64, SourceError> {
        let mut envelopes = futures_util::stream::select_all(
            subscriptions
                .into_iter()
                .map(|sub| Box::pin(sub.into_stream())),
        );

        let mut written = 0;
        loop {
            let envelope = tokio::select! {
                biased;
                next = envelopes.next() => match next {
                    Some(envelope) => envelope,
                    None => {
                        debug!(path = %self.path.display(), "Recorded topics closed");
                        break;
                    }
                },
                _ = cancel.cancelled() => break,
            };

            let wall_offset = self.clock.wall_time() - self.clock.monotonic();
            let record = BusRecord::from_envelope(&envelope, wall_offset);
            let mut line = match serde_json::to_vec(&record) {
                Ok(line) => line,
                Err(e) => {
                    warn!(topic = %record.topic, "Failed to encode recording line: {}", e);
                    continue;
                }
            };
            line.push(b'\n');
            out.write_all(&line)
                .await
                .map_err(|source| self.write_error(source))?;
            out.flush()
                .await
                .map_err(|source| self.write_error(source))?;
            written += 1;
            metrics::counter!("recording.envelopes_written_total").increment(1);
        }
        Ok(written)
    }

    fn write_error(&self, source: std::io::Error) -> SourceError {
        SourceError::Write {
            path: self.path.clone(),
            source,
        }
    }
}

/// Publishes a recording back onto the bus, each envelope to its own topic.
///
/// Timing follows the same rules as trace replay: speed, looping, restart
/// delay and `start_at` come from [`PlaybackConfig`]; its `topic` is unused.
pub struct BusReplayer {
    path: PathBuf,
    bus: EventBus,
    clock: Arc<dyn TimeSource>,
    config: PlaybackConfig,
    envelopes: OnceCell<Vec<RecordedEnvelope>>,
    pending: PendingSchedule,
    control: SourceControl,
}

impl BusReplayer {
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
            envelopes: OnceCell::new(),
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

    /// Due time of the next envelope still to be published. Equal to the
    /// current clock time while a due envelope waits for the replay task.
    pub fn next_due_monotonic(&self) -> Option<f64> {
        self.pending.next_due()
    }

    /// Replay the recording. Returns the number of envelopes published.
    pub async fn run(&self) -> Result<u64, SourceError> {
        let (cancel, _guard) = self.control.begin()?;

        info!(
            path = %self.path.display(),
            speed = self.config.effective_speed(),
            looping = self.config.looping,
            "Starting recording replay"
        );
        let envelopes = self.load().await;
        let result = TimedReplay {
            clock: self.clock.as_ref(),
            config: &self.config,
            pending: &self.pending,
            origin: &self.path,
        }
        .run(
            &cancel,
            envelopes,
            |e: &RecordedEnvelope| e.t_mono,
            |e: &RecordedEnvelope| self.publish(e),
        )
        .await;
        self.pending.clear();
        let published = result?;
        info!(path = %self.path.display(), published, "Recording replay finished");
        Ok(published)
    }

    pub async fn stop(&self) {
        if self.control.stop().await {
            debug!(path = %self.path.display(), "Recording replay stopped");
        }
    }

    async fn load(&self) -> &[RecordedEnvelope] {
        self.envelopes
            .get_or_init(|| async {
                let Some(text) = read_replay_file(&self.path).await else {
                    return Vec::new();
                };
                let (envelopes, skipped) = parse_recording(&text, &self.path);
                info!(
                    path = %self.path.display(),
                    envelopes = envelopes.len(),
                    skipped,
                    "Loaded recording"
                );
                envelopes
            })
            .await
    }

    fn publish(&self, envelope: &RecordedEnvelope) -> Result<(), SourceError> {
        self.bus.publish(&envelope.topic, envelope.payload.clone())?;
        metrics::counter!("recording.envelopes_replayed_total").increment(1);
        Ok(())
    }
}
