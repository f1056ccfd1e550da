use anyhow::{Context, Result};
use pocketscope::aircraft_json::AircraftJsonSource;
use pocketscope::config::PipelineConfig;
use pocketscope::recording::BusRecorder;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use super::pipeline::{Pipeline, shutdown_signal};

pub async fn handle_watch(
    mut config: PipelineConfig,
    aircraft_json: PathBuf,
    poll_hz: Option<f64>,
    record: Option<PathBuf>,
    summary_interval_s: f64,
) -> Result<()> {
    if let Some(poll_hz) = poll_hz {
        config.aircraft_json.poll_hz = poll_hz;
    }

    info!(
        "Watching {} every {:.2}s",
        aircraft_json.display(),
        config.aircraft_json.poll_interval_s()
    );

    let pipeline = Pipeline::start(&config, summary_interval_s)?;

    let recording = match record {
        Some(path) => {
            info!("Recording {} to {}", config.aircraft_json.topic, path.display());
            let recorder = Arc::new(
                BusRecorder::new(
                    path,
                    pipeline.bus.clone(),
                    pipeline.clock.clone(),
                    [config.aircraft_json.topic.clone()],
                )
                .context("Failed to subscribe recorder")?,
            );
            let runner = recorder.clone();
            Some((recorder, tokio::spawn(async move { runner.run().await })))
        }
        None => None,
    };

    let source = Arc::new(AircraftJsonSource::new(
        aircraft_json,
        pipeline.bus.clone(),
        pipeline.clock.clone(),
        config.aircraft_json.clone(),
    ));

    let runner = source.clone();
    let mut polling = tokio::spawn(async move { runner.run().await });

    // Polling only ends by itself when the bus goes away.
    let joined = tokio::select! {
        joined = &mut polling => joined,
        _ = shutdown_signal() => {
            source.stop().await;
            polling.await
        }
    };

    if let Some((recorder, task)) = recording {
        recorder.stop().await;
        let written = task
            .await
            .context("Recording task panicked")?
            .context("Recording failed")?;
        info!("Recorded {} envelopes to {}", written, recorder.path().display());
    }

    pipeline.shutdown().await;

    joined
        .context("Polling task panicked")?
        .context("Polling aircraft.json failed")?;
    Ok(())
}
