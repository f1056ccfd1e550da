//! Domain types: aircraft identity, normalized position reports and tracks.
//!
//! Optional fields model "unknown", never zero: a report without `ground_speed`
//! says nothing about speed, and a track keeps its last known value.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;

use crate::error::IdentityError;

/// ICAO 24-bit address as six lowercase hex digits (e.g. "abc123").
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Identity(String);

impl Identity {
    /// Normalize (trim, lowercase) and validate an identity string.
    pub fn parse(raw: &str) -> Result<Self, IdentityError> {
        let normalized = raw.trim().to_ascii_lowercase();
        if normalized.len() != 6 {
            return Err(IdentityError::InvalidLength(raw.to_string()));
        }
        match hex::decode(&normalized) {
            Ok(bytes) if bytes.len() == 3 => Ok(Self(normalized)),
            _ => Err(IdentityError::NotHex(raw.to_string())),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The 24-bit address as an integer.
    pub fn address(&self) -> u32 {
        u32::from_str_radix(&self.0, 16).unwrap_or_default()
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Identity {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Identity {
    type Error = IdentityError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Identity> for String {
    fn from(identity: Identity) -> Self {
        identity.0
    }
}

/// Where a report came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ReportSource {
    Sbs,
    Beast,
    #[default]
    Json,
    Playback,
}

impl fmt::Display for ReportSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReportSource::Sbs => write!(f, "SBS"),
            ReportSource::Beast => write!(f, "BEAST"),
            ReportSource::Json => write!(f, "JSON"),
            ReportSource::Playback => write!(f, "PLAYBACK"),
        }
    }
}

/// Normalized position report as carried on the input topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionReport {
    /// Report time in seconds (see [`TimeSource::report_time`](crate::clock::TimeSource::report_time)).
    #[serde(rename = "ts")]
    pub timestamp: f64,
    #[serde(rename = "icao24")]
    pub identity: Identity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callsign: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lat: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lon: Option<f64>,
    /// Barometric altitude, feet
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baro_alt: Option<f64>,
    /// Geometric altitude, feet
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geo_alt: Option<f64>,
    /// Ground speed, knots
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ground_speed: Option<f64>,
    /// Course over ground, degrees true
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub track_deg: Option<f64>,
    /// Vertical rate, ft/min
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vertical_rate: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub squawk: Option<String>,
    /// Navigation integrity category
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nic: Option<u8>,
    /// Navigation accuracy category for position
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nacp: Option<u8>,
    #[serde(default)]
    pub src: ReportSource,
}

impl PositionReport {
    /// A report carrying nothing but identity and time.
    pub fn new(identity: Identity, timestamp: f64) -> Self {
        Self {
            timestamp,
            identity,
            callsign: None,
            lat: None,
            lon: None,
            baro_alt: None,
            geo_alt: None,
            ground_speed: None,
            track_deg: None,
            vertical_rate: None,
            squawk: None,
            nic: None,
            nacp: None,
            src: ReportSource::default(),
        }
    }

    /// Both coordinates, when the report has a position.
    pub fn position(&self) -> Option<(f64, f64)> {
        match (self.lat, self.lon) {
            (Some(lat), Some(lon)) => Some((lat, lon)),
            _ => None,
        }
    }
}

/// Which altitude a consumer prefers when both are known.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AltitudePreference {
    #[default]
    Barometric,
    Geometric,
}

/// One sample of a track's trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrailPoint {
    pub timestamp: f64,
    pub lat: f64,
    pub lon: f64,
    pub baro_alt: Option<f64>,
    pub geo_alt: Option<f64>,
}

impl TrailPoint {
    /// Altitude for display, falling back to the other source when the
    /// preferred one is unknown.
    pub fn altitude(&self, preference: AltitudePreference) -> Option<f64> {
        match preference {
            AltitudePreference::Barometric => self.baro_alt.or(self.geo_alt),
            AltitudePreference::Geometric => self.geo_alt.or(self.baro_alt),
        }
    }
}

/// Scalar fields tracked with last-known-value semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateField {
    BaroAltitude,
    GeoAltitude,
    GroundSpeed,
    TrackDeg,
    VerticalRate,
    Squawk,
    Nic,
    NacP,
}

impl StateField {
    pub const ALL: [StateField; 8] = [
        StateField::BaroAltitude,
        StateField::GeoAltitude,
        StateField::GroundSpeed,
        StateField::TrackDeg,
        StateField::VerticalRate,
        StateField::Squawk,
        StateField::Nic,
        StateField::NacP,
    ];
}

#[derive(Debug, Clone, PartialEq)]
pub enum StateValue {
    Number(f64),
    Code(String),
    Category(u8),
}

/// Last known kinematic and integrity state of an aircraft.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KinematicState {
    pub baro_alt: Option<f64>,
    pub geo_alt: Option<f64>,
    pub ground_speed: Option<f64>,
    pub track_deg: Option<f64>,
    pub vertical_rate: Option<f64>,
    pub squawk: Option<String>,
    pub nic: Option<u8>,
    pub nacp: Option<u8>,
}

impl KinematicState {
    /// Overwrite every field present in `report`; absent fields keep their value.
    pub fn merge(&mut self, report: &PositionReport) {
        fn keep<T: Clone>(slot: &mut Option<T>, incoming: &Option<T>) {
            if let Some(value) = incoming {
                *slot = Some(value.clone());
            }
        }

        keep(&mut self.baro_alt, &report.baro_alt);
        keep(&mut self.geo_alt, &report.geo_alt);
        keep(&mut self.ground_speed, &report.ground_speed);
        keep(&mut self.track_deg, &report.track_deg);
        keep(&mut self.vertical_rate, &report.vertical_rate);
        keep(&mut self.squawk, &report.squawk);
        keep(&mut self.nic, &report.nic);
        keep(&mut self.nacp, &report.nacp);
    }

    pub fn get(&self, field: StateField) -> Option<StateValue> {
        match field {
            StateField::BaroAltitude => self.baro_alt.map(StateValue::Number),
            StateField::GeoAltitude => self.geo_alt.map(StateValue::Number),
            StateField::GroundSpeed => self.ground_speed.map(StateValue::Number),
            StateField::TrackDeg => self.track_deg.map(StateValue::Number),
            StateField::VerticalRate => self.vertical_rate.map(StateValue::Number),
            StateField::Squawk => self.squawk.clone().map(StateValue::Code),
            StateField::Nic => self.nic.map(StateValue::Category),
            StateField::NacP => self.nacp.map(StateValue::Category),
        }
    }

    /// Fields with a known value.
    pub fn known_fields(&self) -> Vec<StateField> {
        StateField::ALL
            .into_iter()
            .filter(|field| self.get(*field).is_some())
            .collect()
    }
}

/// Aggregated, time-evolving state for one aircraft.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Track {
    pub identity: Identity,
    pub callsign: Option<String>,
    pub last_update_ts: f64,
    /// Oldest first, always sorted by timestamp.
    pub trail: VecDeque<TrailPoint>,
    pub state: KinematicState,
    /// Timestamp of the most recent trail sample (drives 1 Hz sampling).
    #[serde(skip)]
    pub(crate) last_sample_ts: Option<f64>,
}

impl Track {
    pub fn new(identity: Identity, timestamp: f64) -> Self {
        Self {
            identity,
            callsign: None,
            last_update_ts: timestamp,
            trail: VecDeque::new(),
            state: KinematicState::default(),
            last_sample_ts: None,
        }
    }

    pub fn last_point(&self) -> Option<&TrailPoint> {
        self.trail.back()
    }

    /// Drop trail points strictly older than `reference - window`.
    pub(crate) fn trim_trail(&mut self, reference: f64, window: f64) -> usize {
        let cutoff = reference - window;
        let mut removed = 0;
        while self.trail.front().is_some_and(|p| p.timestamp < cutoff) {
            self.trail.pop_front();
            removed += 1;
        }
        removed
    }
}

/// Batched expiry notification published on the output topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TracksUpdate {
    pub as_of: f64,
    pub active: usize,
    pub expired: Vec<Identity>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(raw: &str) -> Identity {
        Identity::parse(raw).unwrap()
    }

    #[test]
    fn test_identity_normalization() {
        assert_eq!(identity(" ABC123 ").as_str(), "abc123");
        assert_eq!(identity("a1b2c3").address(), 0xa1b2c3);
        assert!(matches!(
            Identity::parse("abc12"),
            Err(IdentityError::InvalidLength(_))
        ));
        assert!(matches!(
            Identity::parse("abcxyz"),
            Err(IdentityError::NotHex(_))
        ));
    }

    #[test]
    fn test_report_optional_fields_survive_json() {
        let mut report = PositionReport::new(identity("abc123"), 12.5);
        report.ground_speed = Some(0.0);
        report.squawk = Some("7000".to_string());

        let json = serde_json::to_value(&report).unwrap();
        let object = json.as_object().unwrap();
        assert_eq!(object["icao24"], "abc123");
        assert_eq!(object["ground_speed"], 0.0);
        assert!(!object.contains_key("lat"));
        assert!(!object.contains_key("baro_alt"));

        let back: PositionReport = serde_json::from_value(json).unwrap();
        assert_eq!(back.ground_speed, Some(0.0));
        assert_eq!(back.lat, None);
        assert_eq!(back, report);
    }

    #[test]
    fn test_report_rejects_bad_identity() {
        let raw = r#"{"ts": 1.0, "icao24": "not-hex"}"#;
        assert!(serde_json::from_str::<PositionReport>(raw).is_err());

        let raw = r#"{"ts": 1.0, "icao24": "ABCDEF", "src": "PLAYBACK"}"#;
        let report: PositionReport = serde_json::from_str(raw).unwrap();
        assert_eq!(report.identity.as_str(), "abcdef");
        assert_eq!(report.src, ReportSource::Playback);
    }

    #[test]
    fn test_merge_keeps_last_known_values() {
        let mut state = KinematicState::default();

        let mut first = PositionReport::new(identity("abc123"), 0.0);
        first.ground_speed = Some(250.0);
        first.squawk = Some("1200".to_string());
        state.merge(&first);

        let mut second = PositionReport::new(identity("abc123"), 1.0);
        second.track_deg = Some(90.0);
        state.merge(&second);

        assert_eq!(state.ground_speed, Some(250.0));
        assert_eq!(state.track_deg, Some(90.0));
        assert_eq!(
            state.get(StateField::Squawk),
            Some(StateValue::Code("1200".to_string()))
        );
        assert_eq!(state.get(StateField::VerticalRate), None);
        assert_eq!(
            state.known_fields(),
            vec![StateField::GroundSpeed, StateField::TrackDeg, StateField::Squawk]
        );
    }

    #[test]
    fn test_trail_point_altitude_preference() {
        let point = TrailPoint {
            timestamp: 0.0,
            lat: 40.0,
            lon: -74.0,
            baro_alt: None,
            geo_alt: Some(1200.0),
        };
        assert_eq!(point.altitude(AltitudePreference::Barometric), Some(1200.0));

        let both = TrailPoint {
            baro_alt: Some(1000.0),
            ..point
        };
        assert_eq!(both.altitude(AltitudePreference::Barometric), Some(1000.0));
        assert_eq!(both.altitude(AltitudePreference::Geometric), Some(1200.0));
    }

    #[test]
    fn test_trim_trail_keeps_cutoff_boundary() {
        let mut track = Track::new(identity("abc123"), 0.0);
        for ts in [0.0, 1.0, 2.0, 3.0] {
            track.trail.push_back(TrailPoint {
                timestamp: ts,
                lat: 0.0,
                lon: 0.0,
                baro_alt: None,
                geo_alt: None,
            });
        }
        let removed = track.trim_trail(3.0, 2.0);
        assert_eq!(removed, 1);
        let kept: Vec<f64> = track.trail.iter().map(|p| p.timestamp).collect();
        assert_eq!(kept, vec![1.0, 2.0, 3.0]);
    }
}
