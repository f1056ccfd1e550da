use anyhow::{Context, Result};
use pocketscope::config::PipelineConfig;
use pocketscope::playback::FilePlaybackSource;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use super::pipeline::{Pipeline, shutdown_signal};

pub async fn handle_replay(
    mut config: PipelineConfig,
    trace: PathBuf,
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
        "Starting replay of {} at {}x{}",
        trace.display(),
        config.playback.effective_speed(),
        if config.playback.looping { " (looping)" } else { "" }
    );

    let pipeline = Pipeline::start(&config, summary_interval_s)?;
    let source = Arc::new(FilePlaybackSource::new(
        trace,
        pipeline.bus.clone(),
        pipeline.clock.clone(),
        config.playback.clone(),
    ));

    let runner = source.clone();
    let mut replay = tokio::spawn(async move { runner.run().await });

    let joined = tokio::select! {
        joined = &mut replay => joined,
        _ = shutdown_signal() => {
            source.stop().await;
            replay.await
        }
    };

    pipeline.shutdown().await;

    joined
        .context("Replay task panicked")?
        .context("Replay failed")?;
    info!("Replay finished");
    Ok(())
}
