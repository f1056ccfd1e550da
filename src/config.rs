//! Pipeline configuration and its defaults.
//!
//! Every component takes its config struct by value in its constructor. The
//! structs deserialize from a TOML file where every section and field is
//! optional:
//!
//! ```toml
//! [bus]
//! queue_capacity = 512
//!
//! [tracks]
//! expiry_s = 120.0
//! pinned_trail_window_s = 300.0
//!
//! [playback]
//! speed = 4.0
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::tracks::RetentionWindows;

// ============================================================================
// Topics
// ============================================================================

/// Normalized position reports from any ingest source
pub const ADSB_TOPIC: &str = "adsb.msg";

/// Batched track expiry notifications
pub const TRACKS_UPDATED_TOPIC: &str = "tracks.updated";

// ============================================================================
// Bus
// ============================================================================

/// Per-subscriber queue depth
/// At a busy site (~300 aircraft, a few reports per second each) this is a few
/// seconds of backlog before drop-oldest kicks in
pub const BUS_QUEUE_CAPACITY: usize = 1024;

// ============================================================================
// Tracks
// ============================================================================

/// Trail retention for ordinary tracks, seconds
pub const TRAIL_WINDOW_S: f64 = 60.0;

/// Trail retention for pinned tracks, seconds
pub const PINNED_TRAIL_WINDOW_S: f64 = 180.0;

/// A track with no report for this long is removed, seconds
pub const TRACK_EXPIRY_S: f64 = 300.0;

/// How often the expiry sweep runs, seconds
pub const SWEEP_INTERVAL_S: f64 = 1.0;

/// Minimum spacing between trail samples (roughly 1 Hz), seconds
pub const TRAIL_SAMPLE_SPACING_S: f64 = 0.9;

/// Floor for the automatically shortened sweep interval, seconds
pub const MIN_AUTO_SWEEP_INTERVAL_S: f64 = 0.5;

// ============================================================================
// Sources
// ============================================================================

/// Slowest allowed replay speed multiplier
pub const MIN_PLAYBACK_SPEED: f64 = 0.1;

/// Pause between the end of a looping replay and its restart, seconds
pub const LOOP_RESTART_DELAY_S: f64 = 0.001;

/// aircraft.json polling rate
pub const AIRCRAFT_JSON_POLL_HZ: f64 = 1.0;

/// Aircraft not heard from for longer than this are skipped, seconds
pub const AIRCRAFT_STALE_AFTER_S: f64 = 60.0;

/// Backoff after a failed aircraft.json read, seconds (doubles up to the max)
pub const AIRCRAFT_JSON_BACKOFF_INITIAL_S: f64 = 0.2;
pub const AIRCRAFT_JSON_BACKOFF_MAX_S: f64 = 2.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub queue_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            queue_capacity: BUS_QUEUE_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackServiceConfig {
    pub trail_window_s: f64,
    pub pinned_trail_window_s: f64,
    pub expiry_s: f64,
    pub sweep_interval_s: f64,
    pub sample_spacing_s: f64,
    pub topic_in: String,
    pub topic_out: String,
}

impl Default for TrackServiceConfig {
    fn default() -> Self {
        Self {
            trail_window_s: TRAIL_WINDOW_S,
            pinned_trail_window_s: PINNED_TRAIL_WINDOW_S,
            expiry_s: TRACK_EXPIRY_S,
            sweep_interval_s: SWEEP_INTERVAL_S,
            sample_spacing_s: TRAIL_SAMPLE_SPACING_S,
            topic_in: ADSB_TOPIC.to_string(),
            topic_out: TRACKS_UPDATED_TOPIC.to_string(),
        }
    }
}

impl TrackServiceConfig {
    pub fn retention(&self) -> RetentionWindows {
        RetentionWindows {
            default_s: self.trail_window_s,
            pinned_s: self.pinned_trail_window_s,
        }
    }

    /// The sweep only runs for a positive, finite expiry.
    pub fn sweep_enabled(&self) -> bool {
        self.expiry_s.is_finite() && self.expiry_s > 0.0
    }

    /// Sweep interval, shortened when it exceeds the expiry window so short
    /// expiries are still noticed promptly.
    pub fn effective_sweep_interval(&self) -> f64 {
        if self.expiry_s > 0.0 && self.sweep_interval_s > self.expiry_s {
            self.sweep_interval_s
                .min(MIN_AUTO_SWEEP_INTERVAL_S.max(self.expiry_s / 2.0))
        } else {
            self.sweep_interval_s
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    pub speed: f64,
    #[serde(rename = "loop")]
    pub looping: bool,
    pub loop_restart_delay_s: f64,
    pub topic: String,
    /// Clock time of the first replayed event; the current time when unset.
    pub start_at: Option<f64>,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            speed: 1.0,
            looping: false,
            loop_restart_delay_s: LOOP_RESTART_DELAY_S,
            topic: ADSB_TOPIC.to_string(),
            start_at: None,
        }
    }
}

impl PlaybackConfig {
    pub fn effective_speed(&self) -> f64 {
        if self.speed.is_finite() {
            self.speed.max(MIN_PLAYBACK_SPEED)
        } else {
            1.0
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AircraftJsonConfig {
    pub poll_hz: f64,
    pub stale_after_s: f64,
    pub backoff_initial_s: f64,
    pub backoff_max_s: f64,
    pub topic: String,
}

impl Default for AircraftJsonConfig {
    fn default() -> Self {
        Self {
            poll_hz: AIRCRAFT_JSON_POLL_HZ,
            stale_after_s: AIRCRAFT_STALE_AFTER_S,
            backoff_initial_s: AIRCRAFT_JSON_BACKOFF_INITIAL_S,
            backoff_max_s: AIRCRAFT_JSON_BACKOFF_MAX_S,
            topic: ADSB_TOPIC.to_string(),
        }
    }
}

impl AircraftJsonConfig {
    pub fn poll_interval_s(&self) -> f64 {
        if self.poll_hz.is_finite() && self.poll_hz > 0.0 {
            1.0 / self.poll_hz
        } else {
            1.0 / AIRCRAFT_JSON_POLL_HZ
        }
    }
}

/// Top-level configuration file structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub bus: BusConfig,
    pub tracks: TrackServiceConfig,
    pub playback: PlaybackConfig,
    pub aircraft_json: AircraftJsonConfig,
}

impl PipelineConfig {
    /// Load config from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let contents =
            std::fs::read_to_string(path).with_context(|| format!("Failed to read {:?}", path))?;
        let config: PipelineConfig =
            toml::from_str(&contents).with_context(|| format!("Failed to parse {:?}", path))?;
        Ok(config)
    }

    /// Load config from `path` if it exists, otherwise use defaults
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save config to a TOML file (atomic: write to .tmp then rename)
    pub fn save(&self, path: &Path) -> Result<()> {
        let contents =
            toml::to_string_pretty(self).context("Failed to serialize config to TOML")?;
        let tmp_path = path.with_extension("toml.tmp");
        std::fs::write(&tmp_path, &contents)
            .with_context(|| format!("Failed to write {:?}", tmp_path))?;
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("Failed to rename {:?} to {:?}", tmp_path, path))?;
        Ok(())
    }
}

/// Resolve the config file path.
///
/// Priority:
/// 1. `POCKETSCOPE_CONFIG` env var
/// 2. `./pocketscope.toml`
pub fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var("POCKETSCOPE_CONFIG") {
        return PathBuf::from(path);
    }
    PathBuf::from("./pocketscope.toml")
}
