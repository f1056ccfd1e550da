use anyhow::{Context, Result};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::config::{ADSB_TOPIC, TRACKS_UPDATED_TOPIC};

/// Install the Prometheus recorder.
/// Returns a handle that can be used to render the current metrics.
pub fn init_metrics_recorder() -> Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .context("Failed to install Prometheus recorder")
}

/// Initialize pipeline metrics to zero so they appear in output before the
/// first event.
pub fn initialize_pipeline_metrics() {
    // Bus metrics, labelled by topic
    for topic in [ADSB_TOPIC, TRACKS_UPDATED_TOPIC] {
        metrics::counter!("bus.publishes_total", "topic" => topic).absolute(0);
        metrics::counter!("bus.deliveries_total", "topic" => topic).absolute(0);
        metrics::counter!("bus.drops_total", "topic" => topic).absolute(0);
    }

    // Track service metrics
    metrics::counter!("tracks.reports_accepted_total").absolute(0);
    metrics::counter!("tracks.reports_out_of_order_total").absolute(0);
    metrics::counter!("tracks.payload_errors_total").absolute(0);
    metrics::counter!("tracks.expired_total").absolute(0);
    metrics::gauge!("tracks.active").set(0.0);

    // Source metrics
    metrics::counter!("playback.events_published_total").absolute(0);
    metrics::counter!("playback.lines_skipped_total").absolute(0);
    metrics::counter!("aircraft_json.reports_total").absolute(0);
    metrics::counter!("recording.envelopes_written_total").absolute(0);
    metrics::counter!("recording.envelopes_replayed_total").absolute(0);
}
