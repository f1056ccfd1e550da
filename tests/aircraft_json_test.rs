// Integration tests for aircraft.json polling against files on disk.

mod common;

#[cfg(test)]
mod aircraft_json_tests {
    use super::common::{assert_close, eventually, identity, write_temp};
    use pocketscope::aircraft_json::AircraftJsonSource;
    use pocketscope::bus::{EventBus, Subscription};
    use pocketscope::clock::{TimeSource, VirtualClock};
    use pocketscope::codec;
    use pocketscope::config::AircraftJsonConfig;
    use pocketscope::error::SourceError;
    use pocketscope::models::{PositionReport, ReportSource};
    use std::path::Path;
    use std::sync::Arc;

    const TWO_AIRCRAFT: &str = r#"{
        "now": 1700000000.0,
        "aircraft": [
            {"hex": "abc123", "flight": "SWA101 ", "lat": 33.9, "lon": -118.4, "alt_baro": 8000, "seen": 0.1},
            {"hex": "def456", "alt_baro": 35000, "gs": 480.5, "seen": 3.2},
            {"hex": "0a0b0c", "lat": 34.0, "lon": -118.0, "seen": 120.0}
        ]
    }"#;

    fn source(path: &Path) -> (Arc<VirtualClock>, EventBus, Arc<AircraftJsonSource>) {
        let clock = Arc::new(VirtualClock::new(0.0));
        let bus = EventBus::new(clock.clone(), 64);
        let source = Arc::new(AircraftJsonSource::new(
            path,
            bus.clone(),
            clock.clone(),
            AircraftJsonConfig::default(),
        ));
        (clock, bus, source)
    }

    fn reports(sub: &mut Subscription) -> Vec<PositionReport> {
        std::iter::from_fn(|| sub.try_recv())
            .map(|envelope| codec::unpack(&envelope.payload).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_poll_once_publishes_fresh_aircraft() {
        let (_dir, path) = write_temp("aircraft.json", &[TWO_AIRCRAFT]);
        let (_, bus, source) = source(&path);
        let mut sub = bus.subscribe("adsb.msg").unwrap();

        assert_eq!(source.poll_once().await.unwrap(), 2);

        let reports = reports(&mut sub);
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].identity, identity("abc123"));
        assert_eq!(reports[0].callsign.as_deref(), Some("SWA101"));
        assert_eq!(reports[0].timestamp, 1700000000.0);
        assert_eq!(reports[0].src, ReportSource::Json);
        assert_eq!(reports[1].ground_speed, Some(480.5));
        assert_eq!(reports[1].position(), None);
    }

    #[tokio::test]
    async fn test_poll_once_reports_read_and_parse_errors() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("aircraft.json");
        let (_, _, source) = source(&missing);
        assert!(matches!(
            source.poll_once().await,
            Err(SourceError::Read { .. })
        ));

        std::fs::write(&missing, "{ truncated").unwrap();
        assert!(matches!(
            source.poll_once().await,
            Err(SourceError::Parse { .. })
        ));
    }

    #[tokio::test]
    async fn test_run_retries_after_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("aircraft.json");
        let (clock, bus, source) = source(&path);
        let mut sub = bus.subscribe("adsb.msg").unwrap();

        let runner = source.clone();
        let task = tokio::spawn(async move { runner.run().await });

        // First poll fails and backs off on the clock.
        assert!(eventually(|| clock.next_due_monotonic() == Some(0.2)).await);

        std::fs::write(&path, r#"{"aircraft": [{"hex": "abc123", "lat": 1.0, "lon": 2.0}]}"#)
            .unwrap();
        // The retry polls as soon as the backoff ends, then waits one interval.
        clock.set_time(0.2).unwrap();
        assert!(eventually(|| sub.pending() == 1).await);
        assert!(
            eventually(|| clock
                .next_due_monotonic()
                .is_some_and(|due| (due - 1.2).abs() < 1e-9))
            .await
        );

        // Without a "now" field the report is stamped with the clock.
        let reports = reports(&mut sub);
        assert_close(reports[0].timestamp, 0.2);
        assert_eq!(reports[0].position(), Some((1.0, 2.0)));

        source.stop().await;
        assert!(!source.is_running());
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_run_polls_on_interval_until_stopped() {
        let (_dir, path) = write_temp("aircraft.json", &[TWO_AIRCRAFT]);
        let (clock, bus, source) = source(&path);
        let mut sub = bus.subscribe("adsb.msg").unwrap();

        let runner = source.clone();
        let task = tokio::spawn(async move { runner.run().await });
        assert!(eventually(|| sub.pending() == 2).await);
        assert!(matches!(source.run().await, Err(SourceError::AlreadyRunning)));

        assert!(eventually(|| clock.next_due_monotonic() == Some(1.0)).await);
        clock.advance(1.0).unwrap();
        assert!(eventually(|| sub.pending() == 4).await);
        assert_eq!(reports(&mut sub).len(), 4);

        source.stop().await;
        task.await.unwrap().unwrap();
        assert_eq!(clock.pending_sleepers(), 0);
    }

    #[tokio::test]
    async fn test_run_ends_when_bus_closes() {
        let (_dir, path) = write_temp("aircraft.json", &[TWO_AIRCRAFT]);
        let (_, bus, source) = source(&path);
        bus.close();

        let result = source.run().await;
        assert!(matches!(result, Err(SourceError::Bus(_))));
        assert!(!source.is_running());
    }
}
