use dashmap::{DashMap, DashSet};
use std::sync::{PoisonError, RwLock};
use tracing::trace;

use crate::models::{Identity, PositionReport, Track, TrailPoint};

/// Trail retention windows in seconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetentionWindows {
    pub default_s: f64,
    pub pinned_s: f64,
}

/// What [`TrackStore::ingest`] did with a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Created,
    Updated,
    /// Older than the track's last update; nothing changed.
    OutOfOrder,
    /// Timestamp is NaN or infinite; nothing changed.
    Invalid,
}

/// Per-aircraft track state.
///
/// Tracks live in a `DashMap` keyed by identity so the consume loop, the expiry
/// sweep and readers (display, CLI summary) can work on it concurrently without
/// a global lock.
#[derive(Debug)]
pub struct TrackStore {
    tracks: DashMap<Identity, Track>,
    pinned: DashSet<Identity>,
    windows: RwLock<RetentionWindows>,
    sample_spacing_s: f64,
}

impl TrackStore {
    pub fn new(windows: RetentionWindows, sample_spacing_s: f64) -> Self {
        Self {
            tracks: DashMap::new(),
            pinned: DashSet::new(),
            windows: RwLock::new(windows),
            sample_spacing_s,
        }
    }

    pub fn windows(&self) -> RetentionWindows {
        *self.windows.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn window_for(&self, identity: &Identity) -> f64 {
        let windows = self.windows();
        if self.pinned.contains(identity) {
            windows.pinned_s
        } else {
            windows.default_s
        }
    }

    /// Apply one position report.
    ///
    /// The track is created on first sight. A report older than the track's
    /// last update leaves it untouched. Positions are sampled into the trail at
    /// most once per `sample_spacing_s`, and the trail is trimmed relative to the
    /// report's own timestamp.
    pub fn ingest(&self, report: &PositionReport) -> IngestOutcome {
        let ts = report.timestamp;
        if !ts.is_finite() {
            return IngestOutcome::Invalid;
        }
        let window = self.window_for(&report.identity);

        let mut created = false;
        let mut track = self
            .tracks
            .entry(report.identity.clone())
            .or_insert_with(|| {
                created = true;
                Track::new(report.identity.clone(), ts)
            });

        if ts < track.last_update_ts {
            trace!(
                identity = %report.identity,
                ts,
                last = track.last_update_ts,
                "Out-of-order report ignored"
            );
            return IngestOutcome::OutOfOrder;
        }

        track.last_update_ts = ts;
        if let Some(callsign) = report.callsign.as_deref().map(str::trim)
            && !callsign.is_empty()
        {
            track.callsign = Some(callsign.to_string());
        }
        track.state.merge(report);

        if let Some((lat, lon)) = report.position() {
            let sample_due = track
                .last_sample_ts
                .is_none_or(|last| ts - last >= self.sample_spacing_s);
            if sample_due {
                track.trail.push_back(TrailPoint {
                    timestamp: ts,
                    lat,
                    lon,
                    baro_alt: report.baro_alt,
                    geo_alt: report.geo_alt,
                });
                track.last_sample_ts = Some(ts);
                track.trim_trail(ts, window);
            }
        }

        if created {
            IngestOutcome::Created
        } else {
            IngestOutcome::Updated
        }
    }

    pub fn get(&self, identity: &Identity) -> Option<Track> {
        self.tracks.get(identity).map(|t| t.value().clone())
    }

    /// Snapshot of every active track, ordered by identity.
    pub fn list_active(&self) -> Vec<Track> {
        let mut tracks: Vec<Track> = self.tracks.iter().map(|t| t.value().clone()).collect();
        tracks.sort_by(|a, b| a.identity.cmp(&b.identity));
        tracks
    }

    pub fn active_count(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_pinned(&self, identity: &Identity) -> bool {
        self.pinned.contains(identity)
    }

    /// Pin or unpin `identity` and re-trim its trail against its own last
    /// update. Pinning an identity with no track yet takes effect when it
    /// appears.
    pub fn set_pinned(&self, identity: &Identity, pinned: bool) {
        if pinned {
            self.pinned.insert(identity.clone());
        } else {
            self.pinned.remove(identity);
        }
        let window = self.window_for(identity);
        if let Some(mut track) = self.tracks.get_mut(identity) {
            let reference = track.last_update_ts;
            track.trim_trail(reference, window);
        }
    }

    /// Replace the retention windows and re-trim every track.
    pub fn set_retention(&self, windows: RetentionWindows) {
        *self.windows.write().unwrap_or_else(PoisonError::into_inner) = windows;
        self.retrim_all();
    }

    /// Re-trim every track against its own last update timestamp.
    pub fn retrim_all(&self) -> usize {
        let windows = self.windows();
        let mut removed = 0;
        for mut track in self.tracks.iter_mut() {
            let window = if self.pinned.contains(&track.identity) {
                windows.pinned_s
            } else {
                windows.default_s
            };
            let reference = track.last_update_ts;
            removed += track.trim_trail(reference, window);
        }
        removed
    }

    /// Remove every track whose age at `now` exceeds `expiry_s`, returning the
    /// removed identities in sorted order. Pins of removed tracks are dropped.
    pub fn expire(&self, now: f64, expiry_s: f64) -> Vec<Identity> {
        let stale: Vec<Identity> = self
            .tracks
            .iter()
            .filter(|t| now - t.last_update_ts > expiry_s)
            .map(|t| t.identity.clone())
            .collect();

        let mut expired = Vec::with_capacity(stale.len());
        for identity in stale {
            // A report may have refreshed the track since the scan.
            if self
                .tracks
                .remove_if(&identity, |_, t| now - t.last_update_ts > expiry_s)
                .is_some()
            {
                self.pinned.remove(&identity);
                expired.push(identity);
            }
        }
        expired.sort();
        expired
    }

    /// Drop every track and pin.
    pub fn clear(&self) {
        self.tracks.clear();
        self.pinned.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOWS: RetentionWindows = RetentionWindows {
        default_s: 60.0,
        pinned_s: 180.0,
    };

    fn abc() -> Identity {
        Identity::parse("abc123").unwrap()
    }

    fn positioned(ts: f64, lat: f64, lon: f64) -> PositionReport {
        let mut report = PositionReport::new(abc(), ts);
        report.lat = Some(lat);
        report.lon = Some(lon);
        report
    }

    fn trail_times(store: &TrackStore) -> Vec<f64> {
        store
            .get(&abc())
            .unwrap()
            .trail
            .iter()
            .map(|p| p.timestamp)
            .collect()
    }

    #[test]
    fn test_create_then_update() {
        let store = TrackStore::new(WINDOWS, 0.9);
        let mut first = positioned(0.0, 40.0, -74.0);
        first.callsign = Some("UAL123  ".to_string());
        first.baro_alt = Some(35000.0);
        assert_eq!(store.ingest(&first), IngestOutcome::Created);

        let mut second = positioned(1.0, 40.01, -74.01);
        second.ground_speed = Some(450.0);
        assert_eq!(store.ingest(&second), IngestOutcome::Updated);

        let track = store.get(&abc()).unwrap();
        assert_eq!(track.callsign.as_deref(), Some("UAL123"));
        assert_eq!(track.last_update_ts, 1.0);
        assert_eq!(track.state.baro_alt, Some(35000.0));
        assert_eq!(track.state.ground_speed, Some(450.0));
        assert_eq!(track.trail.len(), 2);
        assert_eq!(track.trail[0].baro_alt, Some(35000.0));
        assert_eq!(track.trail[1].baro_alt, None);
    }

    #[test]
    fn test_out_of_order_report_changes_nothing() {
        let store = TrackStore::new(WINDOWS, 0.9);
        let mut first = positioned(5.0, 40.0, -74.0);
        first.ground_speed = Some(100.0);
        store.ingest(&first);
        let before = store.get(&abc()).unwrap();

        let mut late = positioned(4.0, 41.0, -75.0);
        late.ground_speed = Some(200.0);
        late.callsign = Some("LATE".to_string());
        assert_eq!(store.ingest(&late), IngestOutcome::OutOfOrder);

        assert_eq!(store.get(&abc()).unwrap(), before);
    }

    #[test]
    fn test_equal_timestamp_is_accepted() {
        let store = TrackStore::new(WINDOWS, 0.9);
        store.ingest(&positioned(5.0, 40.0, -74.0));
        let mut same = PositionReport::new(abc(), 5.0);
        same.squawk = Some("7700".to_string());
        assert_eq!(store.ingest(&same), IngestOutcome::Updated);
        assert_eq!(
            store.get(&abc()).unwrap().state.squawk.as_deref(),
            Some("7700")
        );
    }

    #[test]
    fn test_non_finite_timestamp_is_rejected() {
        let store = TrackStore::new(WINDOWS, 0.9);
        assert_eq!(
            store.ingest(&positioned(f64::NAN, 40.0, -74.0)),
            IngestOutcome::Invalid
        );
        assert_eq!(store.active_count(), 0);
    }

    #[test]
    fn test_trail_sampling_spacing() {
        let store = TrackStore::new(WINDOWS, 0.9);
        for ts in [0.0, 0.3, 0.6, 1.0, 1.2, 2.0] {
            store.ingest(&positioned(ts, 40.0, -74.0));
        }
        assert_eq!(trail_times(&store), vec![0.0, 1.0, 2.0]);
        assert_eq!(store.get(&abc()).unwrap().last_update_ts, 2.0);
    }

    #[test]
    fn test_report_without_position_does_not_sample() {
        let store = TrackStore::new(WINDOWS, 0.9);
        store.ingest(&PositionReport::new(abc(), 0.0));
        let mut lat_only = PositionReport::new(abc(), 1.0);
        lat_only.lat = Some(40.0);
        store.ingest(&lat_only);
        assert!(store.get(&abc()).unwrap().trail.is_empty());
    }

    #[test]
    fn test_trim_uses_report_timestamp() {
        let windows = RetentionWindows {
            default_s: 2.0,
            pinned_s: 5.0,
        };
        let store = TrackStore::new(windows, 0.9);
        for ts in [0.0, 1.0, 2.0, 3.0, 4.0] {
            store.ingest(&positioned(ts, 40.0, -74.0));
        }
        assert_eq!(trail_times(&store), vec![2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_pin_before_track_exists() {
        let windows = RetentionWindows {
            default_s: 2.0,
            pinned_s: 5.0,
        };
        let store = TrackStore::new(windows, 0.9);
        store.set_pinned(&abc(), true);
        assert!(store.is_pinned(&abc()));

        for ts in [0.0, 1.0, 2.0, 3.0, 4.0] {
            store.ingest(&positioned(ts, 40.0, -74.0));
        }
        assert_eq!(trail_times(&store), vec![0.0, 1.0, 2.0, 3.0, 4.0]);

        store.set_pinned(&abc(), false);
        assert_eq!(trail_times(&store), vec![2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_set_retention_retrims_every_track() {
        let store = TrackStore::new(WINDOWS, 0.9);
        let other = Identity::parse("def456").unwrap();
        for ts in 0..10 {
            let ts = ts as f64;
            store.ingest(&positioned(ts, 40.0, -74.0));
            let mut report = positioned(ts, 41.0, -73.0);
            report.identity = other.clone();
            store.ingest(&report);
        }

        store.set_retention(RetentionWindows {
            default_s: 3.0,
            pinned_s: 180.0,
        });
        assert_eq!(trail_times(&store), vec![6.0, 7.0, 8.0, 9.0]);
        assert_eq!(store.get(&other).unwrap().trail.len(), 4);
        assert_eq!(store.windows().default_s, 3.0);
    }

    #[test]
    fn test_expire_removes_stale_tracks_and_pins() {
        let store = TrackStore::new(WINDOWS, 0.9);
        let fresh = Identity::parse("def456").unwrap();
        store.ingest(&positioned(0.0, 40.0, -74.0));
        let mut report = positioned(2.0, 41.0, -73.0);
        report.identity = fresh.clone();
        store.ingest(&report);
        store.set_pinned(&abc(), true);

        assert!(store.expire(2.0, 2.0).is_empty());
        assert_eq!(store.expire(2.1, 2.0), vec![abc()]);
        assert!(!store.is_pinned(&abc()));
        assert!(store.get(&abc()).is_none());
        assert_eq!(store.active_count(), 1);

        // A re-appearing aircraft starts a fresh trail.
        store.ingest(&positioned(2.5, 40.0, -74.0));
        assert_eq!(trail_times(&store), vec![2.5]);
    }

    #[test]
    fn test_clear_drops_tracks_and_pins() {
        let store = TrackStore::new(WINDOWS, 0.9);
        store.ingest(&positioned(0.0, 40.0, -74.0));
        store.set_pinned(&abc(), true);
        store.clear();
        assert_eq!(store.active_count(), 0);
        assert!(!store.is_pinned(&abc()));
        assert!(store.list_active().is_empty());
    }
}
