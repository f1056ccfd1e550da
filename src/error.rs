//! Error types for the in-process pipeline.
//!
//! Only contract misuse surfaces here (closed bus, backwards time, double start).
//! Data-quality problems such as malformed payloads are logged and skipped at the
//! point of ingestion and never reach the caller.

use std::path::PathBuf;
use thiserror::Error;

/// Failures raised by the [`EventBus`](crate::bus::EventBus).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    /// The bus has been closed; no further publish or subscribe is possible.
    #[error("event bus is closed")]
    Closed,
}

/// Misuse of a [`TimeSource`](crate::clock::TimeSource).
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ClockError {
    #[error("sleep duration must be non-negative: {0}")]
    NegativeDuration(f64),

    #[error("cannot advance time backwards: dt={0}")]
    NegativeAdvance(f64),

    #[error("cannot set time backwards: {requested} < {current}")]
    Backwards { requested: f64, current: f64 },

    #[error("time value must be finite: {0}")]
    NonFinite(f64),
}

/// Payload encoding failures.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to encode payload: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("failed to decode payload: {0}")]
    Decode(#[source] serde_json::Error),
}

/// Invalid aircraft identity (ICAO 24-bit address).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentityError {
    #[error("identity must be 6 hex characters, got {0:?}")]
    InvalidLength(String),

    #[error("identity contains non-hex characters: {0:?}")]
    NotHex(String),
}

/// Failures raised by the track service lifecycle.
#[derive(Debug, Error)]
pub enum TrackServiceError {
    #[error(transparent)]
    Bus(#[from] BusError),
}

/// Failures raised by a replay or polling source.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("source is already running")]
    AlreadyRunning,

    #[error("failed to read {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to write {path:?}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Clock(#[from] ClockError),

    #[error(transparent)]
    Bus(#[from] BusError),
}
