use std::{path::PathBuf, process::ExitCode, sync::Arc};

use chrono::Utc;
use clap::{Parser, Subcommand};
use sierra_bridge_api::{config::Config,
                        error::Error,
                        feed::MarketDataService,
                        store::US_PER_DAY};
use tracing_bunyan_formatter::{BunyanFormattingLayer, JsonStorageLayer};
use tracing_log::LogTracer;
use tracing_subscriber::{layer::SubscriberExt, registry::Registry, EnvFilter};

const EXIT_OK: u8 = 0;
const EXIT_CONFIG: u8 = 1;
const EXIT_RUNTIME: u8 = 2;
const EXIT_INTERRUPTED: u8 = 130;

#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
struct Opt {
    /// Configuration document
    #[arg(short, long, default_value = "sierra-bridge.toml")]
    config: PathBuf,

    /// Verbose logging mode (-v, -vv, -vvv)
    #[arg(short, long)]
    verbose: Option<usize>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run every component until interrupted
    Start,
    /// Print component health and a coverage summary
    Status,
    /// Report coverage gaps for one symbol root
    Gaps {
        #[arg(short, long)]
        symbol: String,
        /// Lookback window in days
        #[arg(short, long)]
        days:   Option<u32>,
    },
    /// Trigger gap repair for one symbol root
    Backfill {
        #[arg(short, long)]
        symbol: String,
        #[arg(short, long)]
        days:   Option<u32>,
    },
    /// Bridge connectivity check
    Test,
}

fn main() -> ExitCode {
    let opt = Opt::parse();

    let config = match Config::load(&opt.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e}");
            return ExitCode::from(EXIT_CONFIG);
        },
    };
    init_logging(&opt, &config);

    // worker pool sized to the host, capped at eight
    let workers = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .min(8);
    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(workers)
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("runtime error: {e}");
            return ExitCode::from(EXIT_RUNTIME);
        },
    };

    match runtime.block_on(execute(opt, config)) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            // a configuration failure surfacing late is still exit 1
            let code = if matches!(
                e.downcast_ref::<Error>(),
                Some(Error::Configuration(_) | Error::UnknownRoot(_))
            ) {
                EXIT_CONFIG
            } else {
                EXIT_RUNTIME
            };
            eprintln!("error: {e}");
            ExitCode::from(code)
        },
    }
}

async fn execute(opt: Opt, config: Config) -> anyhow::Result<u8> {
    let service = Arc::new(MarketDataService::new(config, Utc::now())?);
    match opt.command {
        Command::Start => {
            let scheduler = service.start().await?;
            tracing::info!("market data service running");
            tokio::signal::ctrl_c().await?;
            tracing::info!("interrupt received, shutting down");
            service.cancel_subscribers();
            scheduler.shutdown().await;
            Ok(EXIT_INTERRUPTED)
        },
        Command::Status => {
            match service.transport().health().await {
                Ok(health) => println!(
                    "bridge: {} (last data update {})",
                    health.status,
                    health
                        .last_data_update
                        .map_or_else(|| "unknown".to_string(), |t| t.to_rfc3339())
                ),
                Err(e) => println!("bridge: unreachable ({e})"),
            }
            let status = service.status()?;
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(EXIT_OK)
        },
        Command::Gaps { symbol, days } => {
            let days = days.unwrap_or(30);
            let gaps = service.report_gaps(&symbol, days, Utc::now())?;
            if gaps.is_empty() {
                println!("{symbol}: no gaps in the last {days} days");
            }
            for gap in gaps {
                let span_days =
                    (gap.interval.end - gap.interval.start) as f64 / US_PER_DAY as f64;
                println!(
                    "{} {:?} [{} .. {}) ~{:.1}d",
                    gap.symbol, gap.timeframe, gap.interval.start, gap.interval.end, span_days
                );
            }
            Ok(EXIT_OK)
        },
        Command::Backfill { symbol, days } => {
            let days = days.unwrap_or(30);
            let rows = service.backfill(&symbol, days, Utc::now()).await?;
            println!("{symbol}: inserted {rows} rows");
            Ok(EXIT_OK)
        },
        Command::Test => {
            let health = service.transport().health().await?;
            println!("bridge reachable: {}", health.status);
            Ok(EXIT_OK)
        },
    }
}

fn init_logging(opt: &Opt, config: &Config) {
    match opt.command {
        Command::Start => {
            // the daemon logs structured JSON
            LogTracer::init().expect("log tracer");
            let env_filter = EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone()));
            let app_name =
                concat!(env!("CARGO_PKG_NAME"), "-", env!("CARGO_PKG_VERSION")).to_string();
            let formatting_layer = BunyanFormattingLayer::new(app_name, std::io::stdout);
            let subscriber = Registry::default()
                .with(env_filter)
                .with(JsonStorageLayer)
                .with(formatting_layer);
            tracing::subscriber::set_global_default(subscriber).expect("tracing subscriber");
        },
        _ => {
            tracing_subscriber::fmt()
                .with_max_level(match opt.verbose {
                    Some(0) | None => tracing::Level::WARN,
                    Some(1) => tracing::Level::INFO,
                    Some(2) => tracing::Level::DEBUG,
                    _ => tracing::Level::TRACE,
                })
                .init();
        },
    }
}
