use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use varispeed::config::EngineParametersBuilder;
use varispeed::engine::{Backends, VariableSpeedPlayer};
use varispeed::EngineParameters;

/// Play an audio file at a different speed without changing its pitch
#[derive(Parser, Debug)]
#[command(name = "varispeed")]
#[command(version)]
struct Args {
    /// Audio file to play
    file: PathBuf,

    /// Playback speed (1.0 = normal)
    #[arg(short, long, env = "VARISPEED_SPEED")]
    speed: Option<f32>,

    /// Position to start from, in milliseconds
    #[arg(long, default_value_t = 0)]
    start_ms: u64,

    /// TOML file with engine parameters
    #[arg(short, long, env = "VARISPEED_CONFIG")]
    config: Option<PathBuf>,
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "varispeed=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let base = match &args.config {
        Some(path) => EngineParameters::from_toml_file(path)
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => EngineParameters::default(),
    };
    let mut builder = EngineParametersBuilder::from_params(base);
    if let Some(speed) = args.speed {
        builder = builder.initial_rate(speed);
    }
    let params = builder.build().context("Invalid engine parameters")?;

    let mut player = VariableSpeedPlayer::new(params, Backends::system())
        .context("Failed to create player")?;

    let completed = Arc::new(AtomicBool::new(false));
    let completed_flag = completed.clone();
    player.set_on_completion(move || completed_flag.store(true, Ordering::SeqCst));

    player
        .set_data_source(&args.file)
        .context("Failed to set data source")?;
    player
        .prepare()
        .with_context(|| format!("Failed to open {}", args.file.display()))?;
    if args.start_ms > 0 {
        player.seek_to(args.start_ms)?;
    }
    player.start().context("Failed to start playback")?;

    info!(
        "Playing {} ({} ms)",
        args.file.display(),
        player.duration_millis()
    );

    while player.is_playing() {
        print!(
            "\rPosition: {:>8} / {} ms",
            player.current_position_millis(),
            player.duration_millis()
        );
        let _ = std::io::stdout().flush();
        thread::sleep(Duration::from_secs(1));
    }
    println!();

    if completed.load(Ordering::SeqCst) {
        info!("Playback complete");
    } else {
        info!("Playback ended early at {} ms", player.current_position_millis());
    }
    player.release();
    Ok(())
}
