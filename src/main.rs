use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use orientation_recorder::compass::half_wind;
use orientation_recorder::config::AppConfig;
use orientation_recorder::feed::SimulatedFeed;
use orientation_recorder::{
    LogStore, OrientationListener, OrientationSample, RecordingSource, ReplayingSource, SourceError, Switchboard,
};

/// Record device orientation to disk and replay it with the original timing.
#[derive(Debug, Parser)]
#[command(name = "orientation-recorder", version)]
struct Cli {
    /// TOML configuration file; the built-in defaults are used when omitted
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Record the simulated feed until Ctrl-C or the time limit
    Record {
        /// Log id; generated from the current time when omitted
        #[arg(long)]
        id: Option<String>,

        #[arg(long)]
        seconds: Option<u64>,
    },

    /// Replay a stored log in place of live data
    Replay { id: String },

    /// List stored logs with their SHA-256 checksum
    List,

    /// Print the samples of one log
    Inspect {
        id: String,

        #[arg(long)]
        json: bool,
    },
}

/// Prints what a compass display would render
struct ConsoleRenderer {
    echo: bool,
    finished: mpsc::UnboundedSender<()>,
}

impl OrientationListener for ConsoleRenderer {
    fn on_orientation_changed(&self, s: &OrientationSample) {
        if self.echo {
            println!(
                "{:>8} ms  {:6.1}° {:<3}  pitch {:6.1}  roll {:6.1}",
                s.offset_millis,
                s.heading,
                half_wind(s.heading),
                s.pitch,
                s.roll
            );
        } else {
            tracing::trace!("heading {:.1} ({})", s.heading, half_wind(s.heading));
        }
    }

    fn on_replay_finished(&self) {
        let _ = self.finished.send(());
    }

    fn on_source_error(&self, error: &SourceError) {
        tracing::warn!("orientation source error: {}", error);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => AppConfig::load_from(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => AppConfig::load_default()?,
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.log_filter()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let store = LogStore::new(&config.storage);
    match cli.command {
        Command::Record { id, seconds } => record(&config, store, id, seconds).await,
        Command::Replay { id } => replay(&config, store, &id).await,
        Command::List => list(&store).await,
        Command::Inspect { id, json } => inspect(&store, &id, json),
    }
}

type Board = Switchboard<RecordingSource, ReplayingSource>;

fn build_board(store: LogStore, feed: &Arc<SimulatedFeed>) -> Board {
    let recording = Arc::new(RecordingSource::new(feed.clone(), store.clone()));
    let replaying = Arc::new(ReplayingSource::new(Handle::current()));
    Switchboard::new(recording, replaying, store, &Handle::current())
}

async fn record(config: &AppConfig, store: LogStore, id: Option<String>, seconds: Option<u64>) -> Result<()> {
    let id = id.unwrap_or_else(|| store.generate_id());
    let feed = Arc::new(SimulatedFeed::new());
    let generator = feed.spawn_generator(&config.feed);

    let board = build_board(store, &feed);
    let (tx, _rx) = mpsc::unbounded_channel();
    let renderer: Arc<dyn OrientationListener> = Arc::new(ConsoleRenderer { echo: false, finished: tx });
    board.attach_renderer(renderer.clone());
    board.start().context("starting live orientation")?;
    board.start_recording(&id).with_context(|| format!("starting recording {}", id))?;
    info!("recording {} (Ctrl-C to stop)", id);

    match seconds {
        Some(secs) => {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(secs)) => {}
                _ = tokio::signal::ctrl_c() => {}
            }
        }
        None => tokio::signal::ctrl_c().await?,
    }

    let summary = board.stop_recording()?;
    let forwarded = board.recording().samples_forwarded();
    board.shutdown();
    generator.abort();
    info!("{} live samples forwarded", forwarded);

    if let Some(summary) = summary {
        println!("{}  {} samples  {}", summary.id, summary.samples, summary.path.display());
    }
    Ok(())
}

async fn replay(config: &AppConfig, store: LogStore, id: &str) -> Result<()> {
    let feed = Arc::new(SimulatedFeed::new());
    let generator = feed.spawn_generator(&config.feed);

    let board = build_board(store, &feed);
    let (tx, mut finished) = mpsc::unbounded_channel();
    let renderer: Arc<dyn OrientationListener> = Arc::new(ConsoleRenderer { echo: true, finished: tx });
    board.attach_renderer(renderer.clone());
    board.start().context("starting live orientation")?;
    board.start_replaying(id).with_context(|| format!("replaying {}", id))?;

    tokio::select! {
        _ = finished.recv() => info!("replay of {} finished after {} samples", id, board.replaying().delivered()),
        _ = tokio::signal::ctrl_c() => {
            info!("replay interrupted");
            board.stop_replaying()?;
        }
    }

    board.detach_renderer(&renderer);
    board.shutdown();
    generator.abort();
    Ok(())
}

async fn list(store: &LogStore) -> Result<()> {
    let logs = store.list_logs().await.context("listing logs")?;
    if logs.is_empty() {
        println!("no logs in {}", store.root.display());
    }
    for log in logs {
        let checksum = LogStore::log_checksum(&log.path).await?;
        println!(
            "{:<32} {:>8} samples {:>9} ms {:>10} bytes  sha256:{}",
            log.id, log.sample_count, log.duration_ms, log.size_bytes, checksum
        );
    }
    Ok(())
}

fn inspect(store: &LogStore, id: &str, json: bool) -> Result<()> {
    let path = store.resolve(id)?;
    let contents = LogStore::read_log(&path)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&contents.samples)?);
    } else {
        println!("{}: {} samples over {} ms", id, contents.samples.len(), contents.duration_ms());
        for s in &contents.samples {
            let location = match (s.latitude, s.longitude) {
                (Some(lat), Some(lon)) => format!("  @ {:.5},{:.5}", lat, lon),
                _ => String::new(),
            };
            println!(
                "{:>8} ms  {:6.1}° {:<3}  pitch {:6.1}  roll {:6.1}{}",
                s.offset_millis,
                s.heading,
                half_wind(s.heading),
                s.pitch,
                s.roll,
                location
            );
        }
    }
    if let Some(e) = contents.truncated {
        eprintln!("warning: log ends early: {}", e);
    }
    Ok(())
}
