//! Ingest numerically indexed records from an HTTP API into a JSON file.
//!
//! Records are requested one index at a time (starting after the highest index already stored in
//! the output) and appended to the output a block at a time. Interrupt with `ctrl-c` to stop:
//! completed blocks are persisted before exiting, blocks that are still filling are discarded and
//! fetched again by the next run.
//!
//! # Usage
//!
//! ```sh
//! BLOCKFETCH_API_KEY=<token> cargo run --release --bin blockfetch -- --output movies.json
//! ```

use blockfetch_http::{Client, DEFAULT_BASE_URL};
use blockfetch_ingest::{
    dispatcher,
    engine::{self, Engine},
    output::Json,
    signal::Signaler,
    writer, NZUsize,
};
use clap::{value_parser, Arg, ArgAction, Command};
use prometheus_client::{encoding::text::encode, registry::Registry};
use serde_json::Value;
use std::{
    num::{NonZeroU32, NonZeroU64, NonZeroUsize},
    path::PathBuf,
    process::ExitCode,
    time::Duration,
};
use tracing::{error, info, Level};
use tracing_subscriber::EnvFilter;

/// Returns the version of the crate.
pub const fn crate_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

const OUTPUT: &str = "output";
const BASE_URL: &str = "base-url";
const API_KEY: &str = "api-key";
const BLOCK_SIZE: &str = "block-size";
const REQUESTS_PER_SECOND: &str = "requests-per-second";
const CONCURRENCY: &str = "concurrency";
const START: &str = "start";
const LIMIT: &str = "limit";
const WORKERS: &str = "workers";
const TIMEOUT_MS: &str = "timeout-ms";
const LOG_LEVEL: &str = "log-level";
const METRICS: &str = "metrics";

/// Entrypoint for the blockfetch CLI
#[tokio::main]
async fn main() -> ExitCode {
    // Parse arguments
    let matches = Command::new("blockfetch")
        .version(crate_version())
        .about("Ingest numerically indexed records from an HTTP API into a JSON file.")
        .arg(
            Arg::new(OUTPUT)
                .long(OUTPUT)
                .required(true)
                .help("JSON file records are appended to")
                .value_parser(value_parser!(PathBuf)),
        )
        .arg(
            Arg::new(BASE_URL)
                .long(BASE_URL)
                .default_value(DEFAULT_BASE_URL)
                .help("URL that indices are appended to"),
        )
        .arg(
            Arg::new(API_KEY)
                .long(API_KEY)
                .env("BLOCKFETCH_API_KEY")
                .required(true)
                .hide_env_values(true)
                .help("Bearer token sent with every request"),
        )
        .arg(
            Arg::new(BLOCK_SIZE)
                .long(BLOCK_SIZE)
                .default_value("4000")
                .help("Number of consecutive indices persisted together")
                .value_parser(value_parser!(NonZeroU64)),
        )
        .arg(
            Arg::new(REQUESTS_PER_SECOND)
                .long(REQUESTS_PER_SECOND)
                .default_value("20")
                .help("Target ceiling on requests per second (above 40 risks rate limiting)")
                .value_parser(value_parser!(NonZeroU32)),
        )
        .arg(
            Arg::new(CONCURRENCY)
                .long(CONCURRENCY)
                .help("Maximum requests in flight (defaults to the requests per second)")
                .value_parser(value_parser!(NonZeroUsize)),
        )
        .arg(
            Arg::new(START)
                .long(START)
                .help("Index to start from (defaults to one past the highest stored index)")
                .value_parser(value_parser!(u64)),
        )
        .arg(
            Arg::new(LIMIT)
                .long(LIMIT)
                .help("Number of indices to request before stopping")
                .value_parser(value_parser!(u64)),
        )
        .arg(
            Arg::new(WORKERS)
                .long(WORKERS)
                .default_value("5")
                .help("Maximum blocks written at once")
                .value_parser(value_parser!(NonZeroUsize)),
        )
        .arg(
            Arg::new(TIMEOUT_MS)
                .long(TIMEOUT_MS)
                .default_value("3000")
                .help("Maximum duration of a request in milliseconds")
                .value_parser(value_parser!(u64)),
        )
        .arg(
            Arg::new(LOG_LEVEL)
                .long(LOG_LEVEL)
                .default_value("info")
                .help("Minimum level of logs to print")
                .value_parser(value_parser!(Level)),
        )
        .arg(
            Arg::new(METRICS)
                .long(METRICS)
                .action(ArgAction::SetTrue)
                .help("Print metrics before exiting"),
        )
        .get_matches();

    // Create logger
    let level = *matches.get_one::<Level>(LOG_LEVEL).unwrap();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(level.to_string()))
        .init();

    // Configure fetcher
    let mut http = blockfetch_http::Config::new(matches.get_one::<String>(API_KEY).unwrap());
    http.base_url = matches.get_one::<String>(BASE_URL).unwrap().clone();
    http.timeout = Duration::from_millis(*matches.get_one::<u64>(TIMEOUT_MS).unwrap());
    let fetcher = match Client::new(http) {
        Ok(fetcher) => fetcher,
        Err(err) => {
            error!(?err, "failed to create client");
            return ExitCode::FAILURE;
        }
    };

    // Configure engine
    let requests_per_second = *matches.get_one::<NonZeroU32>(REQUESTS_PER_SECOND).unwrap();
    let concurrency = matches
        .get_one::<NonZeroUsize>(CONCURRENCY)
        .copied()
        .unwrap_or_else(|| NZUsize!(requests_per_second.get() as usize));
    let cfg = engine::Config {
        block_size: *matches.get_one::<NonZeroU64>(BLOCK_SIZE).unwrap(),
        start: matches.get_one::<u64>(START).copied(),
        dispatcher: dispatcher::Config {
            concurrency,
            requests_per_second,
            limit: matches.get_one::<u64>(LIMIT).copied(),
        },
        writer: writer::Config {
            workers: *matches.get_one::<NonZeroUsize>(WORKERS).unwrap(),
            ..Default::default()
        },
    };
    let output = Json::<Value>::new(matches.get_one::<PathBuf>(OUTPUT).unwrap());
    let mut registry = Registry::default();
    let engine = match Engine::new(cfg, fetcher, output, &mut registry).await {
        Ok(engine) => engine,
        Err(err) => {
            error!(?err, "failed to load output");
            return ExitCode::FAILURE;
        }
    };

    // Stop on interrupt
    let (signaler, signal) = Signaler::new();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("interrupted, persisting completed blocks");
                signaler.signal();
            }
            Err(err) => {
                error!(?err, "unable to listen for interrupts");
                futures::future::pending::<()>().await;
            }
        }
    });

    // Run until stopped
    let result = engine.run(signal).await;
    if matches.get_flag(METRICS) {
        let mut buffer = String::new();
        if encode(&mut buffer, &registry).is_ok() {
            print!("{buffer}");
        }
    }
    match result {
        Ok(summary) => {
            println!(
                "next index {}: {} requested, {} found, {} absent, {} blocks persisted, {} discarded",
                summary.dispatch.next,
                summary.dispatch.dispatched,
                summary.dispatch.found,
                summary.dispatch.absent,
                summary.flushed,
                summary.discarded.len(),
            );
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!(?err, "ingestion failed");
            ExitCode::FAILURE
        }
    }
}
