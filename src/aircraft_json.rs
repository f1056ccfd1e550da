//! Live ingest from a dump1090/readsb `aircraft.json` file.
//!
//! The decoder rewrites the file about once a second. Each poll turns every
//! fresh aircraft entry into a [`PositionReport`] and publishes it on the input
//! topic.

use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bus::EventBus;
use crate::clock::TimeSource;
use crate::codec;
use crate::config::AircraftJsonConfig;
use crate::error::SourceError;
use crate::lifecycle::SourceControl;
use crate::models::{Identity, PositionReport, ReportSource};

/// Numeric field, accepting numbers or numeric strings. `"ground"` and other
/// non-numeric markers read as unknown.
fn number(value: Option<&Value>) -> Option<f64> {
    let parsed = match value? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed.filter(|v| v.is_finite())
}

fn category(value: Option<&Value>) -> Option<u8> {
    number(value)
        .filter(|v| (0.0..=255.0).contains(v))
        .map(|v| v as u8)
}

fn text(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Convert one aircraft entry, or `None` if it has no valid hex address or
/// has not been heard from within `stale_after_s`.
fn report_from_aircraft(entry: &Value, ts: f64, stale_after_s: f64) -> Option<PositionReport> {
    let entry = entry.as_object()?;
    let identity = Identity::parse(entry.get("hex")?.as_str()?).ok()?;

    let seen = number(entry.get("seen")).unwrap_or(0.0);
    let seen_pos = number(entry.get("seen_pos")).unwrap_or(0.0);
    if seen > stale_after_s || seen_pos > stale_after_s {
        return None;
    }

    Some(PositionReport {
        timestamp: ts,
        identity,
        callsign: text(entry.get("flight")),
        lat: number(entry.get("lat")),
        lon: number(entry.get("lon")),
        baro_alt: number(entry.get("alt_baro")),
        geo_alt: number(entry.get("alt_geom")),
        ground_speed: number(entry.get("gs")),
        track_deg: number(entry.get("track")),
        vertical_rate: number(entry.get("baro_rate")),
        squawk: text(entry.get("squawk")),
        nic: category(entry.get("nic")),
        nacp: category(entry.get("nac_p")),
        src: ReportSource::Json,
    })
}

/// Reports for every fresh aircraft in an `aircraft.json` document.
///
/// Reports are stamped with the document's `now` field, or `fallback_ts` when
/// it is missing.
pub fn reports_from_aircraft_json(
    doc: &Value,
    fallback_ts: f64,
    stale_after_s: f64,
) -> Vec<PositionReport> {
    let ts = number(doc.get("now")).unwrap_or(fallback_ts);
    let Some(aircraft) = doc.get("aircraft").and_then(Value::as_array) else {
        return Vec::new();
    };
    aircraft
        .iter()
        .filter_map(|entry| report_from_aircraft(entry, ts, stale_after_s))
        .collect()
}

/// Polls an `aircraft.json` file and publishes its aircraft onto the bus.
pub struct AircraftJsonSource {
    path: PathBuf,
    bus: EventBus,
    clock: Arc<dyn TimeSource>,
    config: AircraftJsonConfig,
    control: SourceControl,
}

impl AircraftJsonSource {
    pub fn new(
        path: impl Into<PathBuf>,
        bus: EventBus,
        clock: Arc<dyn TimeSource>,
        config: AircraftJsonConfig,
    ) -> Self {
        Self {
            path: path.into(),
            bus,
            clock,
            config,
            control: SourceControl::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_running(&self) -> bool {
        self.control.is_running()
    }

    /// Read the file once and publish every fresh aircraft, returning how many
    /// reports were published.
    pub async fn poll_once(&self) -> Result<usize, SourceError> {
        let bytes = tokio::fs::read(&self.path)
            .await
            .map_err(|source| SourceError::Read {
                path: self.path.clone(),
                source,
            })?;
        let doc: Value = serde_json::from_slice(&bytes).map_err(|source| SourceError::Parse {
            path: self.path.clone(),
            source,
        })?;

        let reports = reports_from_aircraft_json(
            &doc,
            self.clock.report_time(),
            self.config.stale_after_s,
        );
        for report in &reports {
            match codec::pack(report) {
                Ok(payload) => self.bus.publish(&self.config.topic, payload)?,
                Err(e) => warn!(identity = %report.identity, "Failed to encode report: {}", e),
            }
        }
        metrics::counter!("aircraft_json.reports_total").increment(reports.len() as u64);
        debug!(path = %self.path.display(), reports = reports.len(), "Polled aircraft.json");
        Ok(reports.len())
    }

    /// Poll until [`stop`](Self::stop) is called or the bus closes.
    ///
    /// Read and parse failures are retried with exponential backoff.
    pub async fn run(&self) -> Result<(), SourceError> {
        let (cancel, _guard) = self.control.begin()?;
        info!(
            path = %self.path.display(),
            poll_hz = self.config.poll_hz,
            "Starting aircraft.json polling"
        );
        let result = self.poll_loop(&cancel).await;
        info!(path = %self.path.display(), "Stopped aircraft.json polling");
        result
    }

    pub async fn stop(&self) {
        self.control.stop().await;
    }

    async fn poll_loop(&self, cancel: &CancellationToken) -> Result<(), SourceError> {
        let interval = self.config.poll_interval_s();
        let mut backoff = self.config.backoff_initial_s;
        let mut consecutive_errors: u32 = 0;

        while !cancel.is_cancelled() {
            match self.poll_once().await {
                Ok(_) => {
                    if consecutive_errors > 0 {
                        info!(
                            consecutive_errors,
                            "aircraft.json polling recovered"
                        );
                    }
                    consecutive_errors = 0;
                    backoff = self.config.backoff_initial_s;
                }
                Err(SourceError::Bus(e)) => return Err(e.into()),
                Err(e) => {
                    consecutive_errors += 1;
                    if matches!(consecutive_errors, 10 | 30 | 60) {
                        error!(consecutive_errors, "aircraft.json still failing: {}", e);
                    } else {
                        warn!(consecutive_errors, "aircraft.json poll failed: {}", e);
                    }
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        slept = self.clock.sleep(backoff) => slept?,
                    }
                    backoff = (backoff * 2.0).min(self.config.backoff_max_s);
                    // The backoff replaces the poll interval.
                    continue;
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                slept = self.clock.sleep(interval) => slept?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_reports_from_aircraft_json() {
        let doc = json!({
            "now": 1700000000.5,
            "aircraft": [
                {
                    "hex": "A1B2C3",
                    "flight": "DAL42   ",
                    "lat": 40.5,
                    "lon": -73.9,
                    "alt_baro": 12000,
                    "alt_geom": 12150,
                    "gs": 310.2,
                    "track": 87.0,
                    "baro_rate": -640,
                    "squawk": "3012",
                    "nic": 8,
                    "nac_p": 9,
                    "seen": 0.4,
                    "seen_pos": 1.2
                },
                {"hex": "ffffff", "alt_baro": "ground", "seen": 2.0},
                {"hex": "~1234", "lat": 1.0, "lon": 1.0},
                {"hex": "c0ffee", "seen": 75.0},
                {"hex": "beefed", "seen_pos": 61.0},
                "not an object"
            ]
        });

        let reports = reports_from_aircraft_json(&doc, 0.0, 60.0);
        assert_eq!(reports.len(), 2);

        let first = &reports[0];
        assert_eq!(first.identity.as_str(), "a1b2c3");
        assert_eq!(first.timestamp, 1700000000.5);
        assert_eq!(first.callsign.as_deref(), Some("DAL42"));
        assert_eq!(first.position(), Some((40.5, -73.9)));
        assert_eq!(first.baro_alt, Some(12000.0));
        assert_eq!(first.geo_alt, Some(12150.0));
        assert_eq!(first.vertical_rate, Some(-640.0));
        assert_eq!(first.squawk.as_deref(), Some("3012"));
        assert_eq!(first.nic, Some(8));
        assert_eq!(first.nacp, Some(9));
        assert_eq!(first.src, ReportSource::Json);

        let on_ground = &reports[1];
        assert_eq!(on_ground.identity.as_str(), "ffffff");
        assert_eq!(on_ground.baro_alt, None);
        assert_eq!(on_ground.position(), None);
    }

    #[test]
    fn test_missing_now_uses_fallback() {
        let doc = json!({"aircraft": [{"hex": "abc123"}]});
        let reports = reports_from_aircraft_json(&doc, 42.0, 60.0);
        assert_eq!(reports[0].timestamp, 42.0);

        assert!(reports_from_aircraft_json(&json!({"now": 1.0}), 0.0, 60.0).is_empty());
    }
}
