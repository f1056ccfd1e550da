use anyhow::Result;
use clap::{Parser, Subcommand};
use pocketscope::config::{PipelineConfig, config_path};
use std::path::PathBuf;
use tracing::info;

mod commands;

use commands::{handle_play, handle_replay, handle_watch};

#[derive(Parser)]
#[command(name = "pocketscope")]
#[command(about = "Track aircraft from recorded ADS-B traces or a live aircraft.json feed")]
#[command(version)]
struct Cli {
    /// Config file (defaults to $POCKETSCOPE_CONFIG, then ./pocketscope.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Seconds between active-track summaries, 0 to disable
    #[arg(long, global = true, default_value_t = 10.0)]
    summary_interval: f64,

    /// Print Prometheus metrics on exit
    #[arg(long, global = true)]
    print_metrics: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay a recorded JSONL trace through the track service
    Replay {
        /// Trace file, one `{"t_mono": .., "msg": {..}}` object per line
        trace: PathBuf,

        /// Playback speed multiplier (overrides config)
        #[arg(long)]
        speed: Option<f64>,

        /// Restart from the beginning when the trace ends
        #[arg(long = "loop")]
        looping: bool,
    },
    /// Follow a dump1090/readsb aircraft.json file
    Watch {
        /// Path to aircraft.json
        aircraft_json: PathBuf,

        /// Polls per second (overrides config)
        #[arg(long)]
        poll_hz: Option<f64>,

        /// Also record the report topic to this JSONL file
        #[arg(long)]
        record: Option<PathBuf>,
    },
    /// Publish a bus recording made with `watch --record`
    Play {
        /// Recording file, one `{"topic": .., "t_mono": .., "payload_hex": ..}` object per line
        recording: PathBuf,

        /// Playback speed multiplier (overrides config)
        #[arg(long)]
        speed: Option<f64>,

        /// Restart from the beginning when the recording ends
        #[arg(long = "loop")]
        looping: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    pocketscope::logging::init_tracing(&cli.log_level)?;

    let path = cli.config.unwrap_or_else(config_path);
    let config = PipelineConfig::load_or_default(&path)?;
    info!("Using config {}", path.display());

    let metrics_handle = if cli.print_metrics {
        let handle = pocketscope::metrics::init_metrics_recorder()?;
        pocketscope::metrics::initialize_pipeline_metrics();
        Some(handle)
    } else {
        None
    };

    match cli.command {
        Commands::Replay {
            trace,
            speed,
            looping,
        } => handle_replay(config, trace, speed, looping, cli.summary_interval).await?,
        Commands::Watch {
            aircraft_json,
            poll_hz,
            record,
        } => {
            handle_watch(config, aircraft_json, poll_hz, record, cli.summary_interval).await?
        }
        Commands::Play {
            recording,
            speed,
            looping,
        } => handle_play(config, recording, speed, looping, cli.summary_interval).await?,
    }

    if let Some(handle) = metrics_handle {
        println!("{}", handle.render());
    }
    Ok(())
}
