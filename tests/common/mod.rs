//! Shared helpers for the pipeline integration tests.
//!
//! Everything runs on a [`VirtualClock`](pocketscope::VirtualClock), so the
//! only real waiting is for tokio to schedule spawned tasks (and for
//! `tokio::fs` to finish its blocking reads).

#![allow(dead_code)]

use pocketscope::codec;
use pocketscope::models::{Identity, PositionReport};
use std::path::PathBuf;
use std::time::Duration;
use tempfile::TempDir;

/// Let spawned tasks run until they block again.
pub async fn settle() {
    for _ in 0..32 {
        tokio::task::yield_now().await;
    }
}

/// Poll `condition` until it holds, giving up after about two seconds of real
/// time.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..2000 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    condition()
}

pub fn identity(raw: &str) -> Identity {
    Identity::parse(raw).expect("valid test identity")
}

/// Report with a position at `ts`.
pub fn report_at(raw: &str, ts: f64, lat: f64, lon: f64) -> PositionReport {
    let mut report = PositionReport::new(identity(raw), ts);
    report.lat = Some(lat);
    report.lon = Some(lon);
    report
}

pub fn packed(report: &PositionReport) -> bytes::Bytes {
    codec::pack(report).expect("report encodes")
}

pub fn assert_close(actual: f64, expected: f64) {
    assert!(
        (actual - expected).abs() < 1e-9,
        "expected {expected}, got {actual}"
    );
}

/// Write `lines` to a fresh temp file; keep the returned dir alive for the
/// duration of the test.
pub fn write_temp(name: &str, lines: &[&str]) -> (TempDir, PathBuf) {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join(name);
    std::fs::write(&path, lines.join("\n")).expect("write temp file");
    (dir, path)
}

/// Three events for one aircraft at recorded times 0.0, 0.4 and 1.0.
pub const THREE_EVENT_TRACE: [&str; 3] = [
    r#"{"t_mono": 0.0, "msg": {"icao24": "abc123", "lat": 40.0, "lon": -74.0, "src": "PLAYBACK"}}"#,
    r#"{"t_mono": 0.4, "msg": {"icao24": "abc123", "lat": 40.01, "lon": -74.0, "src": "PLAYBACK"}}"#,
    r#"{"t_mono": 1.0, "msg": {"icao24": "abc123", "lat": 40.02, "lon": -74.0, "src": "PLAYBACK"}}"#,
];
