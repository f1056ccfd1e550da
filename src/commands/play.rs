use anyhow::{Context, Result};
use pocketscope::config::PipelineConfig;
use pocketscope::recording::BusReplayer;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use super::pipeline::{Pipeline, shutdown_signal};

/// Publish a bus recording through a fresh pipeline. Payloads are replayed
/// verbatim, so reports keep their recorded timestamps.
pub async fn handle_play(
    mut config: PipelineConfig,
    recording: PathBuf,
    speed: Option<f64>,
    looping: bool,
    summary_interval_s: f64,
) -> Result<()> {
    if let Some(speed) = speed {
        config.playback.speed = speed;
    }
    if looping {
        config.playback.looping = true;
    }

    info!(
        "Playing recording {} at {}x{}",
        recording.display(),
        config.playback.effective_speed(),
        if config.playback.looping { " (looping)" } else { "" }
    );

    let pipeline = Pipeline::start(&config, summary_interval_s)?;
    let replayer = Arc::new(BusReplayer::new(
        recording,
        pipeline.bus.clone(),
        pipeline.clock.clone(),
        config.playback.clone(),
    ));

    let runner = replayer.clone();
    let mut playing = tokio::spawn(async move { runner.run().await });

    let joined = tokio::select! {
        joined = &mut playing => joined,
        _ = shutdown_signal() => {
            replayer.stop().await;
            playing.await
        }
    };

    pipeline.shutdown().await;

    let published = joined
        .context("Playback task panicked")?
        .context("Playback failed")?;
    info!("Played {} recorded envelopes", published);
    Ok(())
}
