//! Gold scalper - main entry point
//!
//! This binary provides one subcommand:
//! - run: Drive the strategy loop against a venue (paper or live)

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use gold_scalper::types::Bar;
use gold_scalper::{Config, Engine, SimVenue, Tick, TracingSink, Venue};

#[derive(Parser, Debug)]
#[command(name = "gold-scalper")]
#[command(about = "Single-instrument tick-bar scalping engine", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the strategy loop
    Run {
        /// Path to configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Paper trading mode against the built-in simulator
        #[arg(long)]
        paper: bool,

        /// Live trading mode (CAUTION - REAL MONEY!)
        #[arg(long)]
        live: bool,

        /// Cycle interval in milliseconds
        #[arg(long, default_value = "1000")]
        interval_ms: u64,
    },
}

fn setup_logging(verbose: bool) -> Result<()> {
    std::fs::create_dir_all("logs")?;

    let log_filename = format!(
        "run_{}.log",
        chrono::Local::now().format("%Y-%m-%d_%H-%M-%S")
    );
    let log_path = PathBuf::from("logs").join(&log_filename);

    let level = if verbose { "debug" } else { "info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let file_appender = tracing_appender::rolling::never("logs", &log_filename);

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_line_number(true)
        .with_file(true)
        .with_ansi(true);

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(file_appender)
        .with_target(true)
        .with_line_number(true)
        .with_file(true)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    info!("Logging initialized");
    info!("Log file: {}", log_path.display());

    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose)?;

    match cli.command {
        Commands::Run {
            config,
            paper,
            live,
            interval_ms,
        } => run(config, paper, live, interval_ms),
    }
}

fn run(config_path: Option<PathBuf>, paper: bool, live: bool, interval_ms: u64) -> Result<()> {
    let config = match &config_path {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => Config::default(),
    };

    if live {
        bail!("live trading requires a broker adapter; none is configured in this build");
    }
    if !paper {
        bail!("pass --paper to trade against the built-in simulator, or --live with a broker");
    }

    run_paper(config, config_path, interval_ms)
}

/// Drive the engine against the simulator on a synthetic market
fn run_paper(config: Config, config_path: Option<PathBuf>, interval_ms: u64) -> Result<()> {
    info!(symbol = %config.symbol, "starting paper session");

    let start = Utc::now();
    let mut venue = SimVenue::new(SimVenue::gold_defaults(), 10_000.0);

    let trend_count = config.trend_ma_period + config.ma_slope_lookback + 2;
    venue.set_trend_bars(synthetic_trend_bars(start, trend_count));

    let mut feed = SyntheticFeed::new(start - ChronoDuration::minutes(config.history_minutes() as i64));
    venue.push_ticks(&feed.ticks_until(start));

    let mut engine = Engine::new(venue, TracingSink, config, config_path)?;

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        let mut ticker = tokio::time::interval(std::time::Duration::from_millis(interval_ms.max(100)));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let ticks = feed.ticks_until(Utc::now());
                    engine.venue_mut().push_ticks(&ticks);
                    if let Err(err) = engine.cycle() {
                        warn!(error = %err, "cycle failed");
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("shutdown requested");
                    break;
                }
            }
        }
    });

    info!(
        equity = engine.venue().account_equity().unwrap_or(0.0),
        open_positions = engine.open_position_count(),
        "paper session finished"
    );
    Ok(())
}

/// Deterministic synthetic mid price: slow drift plus two overlapping waves
fn synthetic_mid(at: DateTime<Utc>) -> f64 {
    let t = at.timestamp() as f64 + at.timestamp_subsec_millis() as f64 / 1000.0;
    2000.0 + 4.0 * (t / 900.0).sin() + 0.9 * (t / 53.0).sin() + 0.25 * (t / 7.0).sin()
}

/// Tick generator sampling the synthetic mid every 250ms
struct SyntheticFeed {
    cursor: DateTime<Utc>,
}

impl SyntheticFeed {
    fn new(start: DateTime<Utc>) -> Self {
        Self { cursor: start }
    }

    fn ticks_until(&mut self, until: DateTime<Utc>) -> Vec<Tick> {
        let mut ticks = Vec::new();
        while self.cursor < until {
            let mid = synthetic_mid(self.cursor);
            ticks.push(Tick {
                time: self.cursor,
                bid: mid - 0.12,
                ask: mid + 0.12,
                volume: 1.0,
            });
            self.cursor += ChronoDuration::milliseconds(250);
        }
        ticks
    }
}

/// Slow-timeframe history for the trend filter, sampled at 5 minutes
fn synthetic_trend_bars(end: DateTime<Utc>, count: usize) -> Vec<Bar> {
    (0..count)
        .map(|i| {
            let start = end - ChronoDuration::seconds(300 * (count - i) as i64);
            let open = synthetic_mid(start);
            let close = synthetic_mid(start + ChronoDuration::seconds(300));
            Bar {
                start,
                open,
                high: open.max(close) + 0.3,
                low: open.min(close) - 0.3,
                close,
                volume: 1.0,
            }
        })
        .collect()
}
