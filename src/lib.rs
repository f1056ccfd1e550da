//! Pocketscope - ADS-B track pipeline.
//!
//! Position reports flow from a source ([`playback::FilePlaybackSource`] or
//! [`aircraft_json::AircraftJsonSource`]) over the in-process [`bus::EventBus`]
//! into the [`tracks::TrackService`], which keeps per-aircraft trails and
//! publishes expiry updates. Every component takes its time from a
//! [`clock::TimeSource`], so a [`clock::VirtualClock`] drives the whole
//! pipeline deterministically in tests. [`recording::BusRecorder`] captures
//! bus traffic to JSONL for [`recording::BusReplayer`] to publish again.

pub mod aircraft_json;
pub mod bus;
pub mod clock;
pub mod codec;
pub mod config;
pub mod error;
mod lifecycle;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod playback;
pub mod recording;
pub mod tracks;

pub use aircraft_json::AircraftJsonSource;
pub use bus::{Envelope, EventBus, Subscription};
pub use clock::{RealClock, TimeSource, VirtualClock};
pub use config::PipelineConfig;
pub use models::{Identity, PositionReport, Track, TracksUpdate};
pub use playback::FilePlaybackSource;
pub use recording::{BusRecorder, BusReplayer};
pub use tracks::TrackService;
