//! DataFeed - Main Entry Point
//!
//! Loads stored telemetry batches into named time series, or streams live
//! variables from a (simulated) black box over the in-process bus.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use datafeed_rs::{
    batch::{BatchLoader, BatchSource, JsonLinesSource, LoadProgress},
    bus::{LocalBus, MockBlackBox},
    config::{ensure_config_dir, AppConfig, LoggingConfig, StreamMode, CONFIG_FILE},
    store::SeriesStore,
    stream::Synchronizer,
};
use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "datafeed", version, about)]
struct Cli {
    /// Config file (defaults to the platform config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List the groupings of a directory of .jsonl files
    Groups {
        /// Directory holding one .jsonl file per grouping
        dir: PathBuf,
    },
    /// Load groupings into the series store
    Load {
        /// Directory holding one .jsonl file per grouping
        dir: PathBuf,
        /// Grouping to load (repeatable; all groupings when omitted)
        #[arg(short, long = "group")]
        groups: Vec<String>,
        /// Write the loaded series to a CSV file
        #[arg(long)]
        csv: Option<PathBuf>,
    },
    /// Stream variables from a simulated black box
    Demo {
        /// Variables to stream, comma separated (first three when omitted)
        #[arg(long, value_delimiter = ',')]
        vars: Vec<String>,
        /// How long to stream
        #[arg(long, default_value_t = 5)]
        seconds: u64,
        /// Use one combined producer instead of one per variable
        #[arg(long)]
        combined: bool,
    },
    /// Print the effective configuration
    Config {
        /// Write it to the default config file
        #[arg(long)]
        save: bool,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config.clone().or_else(AppConfig::default_path);
    let config = AppConfig::load_or_default(config_path.as_ref());

    let _log_guard = init_logging(&config.logging)?;
    tracing::info!("Starting DataFeed");

    match cli.command {
        Command::Groups { dir } => list_groups(dir),
        Command::Load { dir, groups, csv } => load(&config, dir, groups, csv),
        Command::Demo {
            vars,
            seconds,
            combined,
        } => demo(config, vars, seconds, combined),
        Command::Config { save } => show_config(&config, save),
    }
}

/// Console logging plus an optional daily rolling file
fn init_logging(logging: &LoggingConfig) -> anyhow::Result<Option<WorkerGuard>> {
    let (file_layer, guard) = match &logging.file_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, "datafeed.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&logging.filter)),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();

    Ok(guard)
}

fn list_groups(dir: PathBuf) -> anyhow::Result<()> {
    let source = JsonLinesSource::open(&dir)?;
    for grouping in source.groupings()? {
        match source.record_count(&grouping)? {
            Some(count) => println!("{grouping}\t{count} records"),
            None => println!("{grouping}"),
        }
    }
    Ok(())
}

fn load(
    config: &AppConfig,
    dir: PathBuf,
    groups: Vec<String>,
    csv: Option<PathBuf>,
) -> anyhow::Result<()> {
    let source = JsonLinesSource::open(&dir)?;
    let selection = if groups.is_empty() {
        source.groupings()?
    } else {
        groups
    };
    if selection.is_empty() {
        bail!("No groupings found in {}", dir.display());
    }

    let loader = BatchLoader::new(&config.batch);
    let store = SeriesStore::new();
    let started = Instant::now();
    let mut log_progress = |progress: &LoadProgress| {
        match progress.fraction() {
            Some(fraction) => tracing::info!(
                "{}: {:.0}% ({} records)",
                progress.grouping,
                fraction * 100.0,
                progress.records_done
            ),
            None => tracing::info!("{}: {} records", progress.grouping, progress.records_done),
        }
        true
    };
    let on_progress: &mut dyn FnMut(&LoadProgress) -> bool = &mut log_progress;
    let report = loader.load(&source, &selection, &store, Some(on_progress))?;

    println!(
        "Loaded {} records ({} skipped) into {} series, {} points in {:.2?}",
        report.records_loaded,
        report.records_skipped,
        store.len(),
        report.points_emitted,
        started.elapsed()
    );
    for name in store.series_names() {
        if let Some((min, max, avg)) = store.stats(&name) {
            let count = store.point_count(&name).unwrap_or_default();
            println!("  {name}: {count} points, min {min:.3}, max {max:.3}, avg {avg:.3}");
        }
    }

    if let Some(path) = csv {
        let file = File::create(&path)
            .with_context(|| format!("Failed to create {}", path.display()))?;
        let rows = store.write_csv(BufWriter::new(file))?;
        println!("Wrote {} rows to {}", rows, path.display());
    }
    Ok(())
}

fn demo(
    mut config: AppConfig,
    vars: Vec<String>,
    seconds: u64,
    combined: bool,
) -> anyhow::Result<()> {
    if combined {
        config.streaming.mode = StreamMode::Combined;
    }

    let bus = LocalBus::new(config.bus.node_name.clone());
    let black_box = MockBlackBox::new(&config.bus.source_id, &config.bus.group)
        .with_demo_variables()
        .spawn(bus.join("black-box"));

    let mut sync = Synchronizer::new(config, bus);
    let catalog = sync.discover()?;
    let selection: Vec<String> = if vars.is_empty() {
        catalog.iter().take(3).map(|e| e.name.clone()).collect()
    } else {
        vars
    };
    println!("Streaming {} of {} variables for {}s", selection.len(), catalog.len(), seconds);

    sync.start(&selection)?;
    let deadline = Instant::now() + Duration::from_secs(seconds);
    while Instant::now() < deadline {
        std::thread::sleep(Duration::from_secs(1));
        let health = sync.health();
        for stalled in health.stalled() {
            tracing::warn!("'{}' is stalled", stalled);
        }
        println!("{} points", sync.store().total_points());
    }
    sync.shutdown();
    black_box.stop();

    for name in sync.store().series_names() {
        let count = sync.store().point_count(&name).unwrap_or_default();
        if let Some((min, max, avg)) = sync.store().stats(&name) {
            println!("  {name}: {count} points, min {min:.3}, max {max:.3}, avg {avg:.3}");
        }
    }
    Ok(())
}

fn show_config(config: &AppConfig, save: bool) -> anyhow::Result<()> {
    print!("{}", config.to_toml()?);
    if save {
        let path = ensure_config_dir()?.join(CONFIG_FILE);
        config.save(&path)?;
        println!("Saved to {}", path.display());
    }
    Ok(())
}
