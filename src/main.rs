use std::process;

use clap::Parser;
use pricetree::cli::args::Cli;
use pricetree::cli::commands::execute_command;
use pricetree::cli::output;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::filter::filter_fn;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, Layer};

/// Dependency targets kept quiet even at `-ddd`.
const QUIET_TARGETS: [&str; 2] = ["config", "serde_json"];

fn main() {
    let cli = Cli::parse();

    setup_logging(cli.debug);
    tracing::debug!("pricetree {}: {:?}", env!("CARGO_PKG_VERSION"), cli.command);

    if let Err(e) = execute_command(&cli) {
        output::error(&e);
        process::exit(e.exit_code());
    }
}

/// `-d` count to log level; logging stays at warnings without the flag.
fn level_for(verbosity: u8) -> LevelFilter {
    match verbosity {
        0 => LevelFilter::WARN,
        1 => LevelFilter::INFO,
        2 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    }
}

fn setup_logging(verbosity: u8) {
    if verbosity > 3 {
        eprintln!("Don't be crazy, max is -d -d -d");
    }
    let level = level_for(verbosity);

    let target_filter = filter_fn(|metadata| {
        !QUIET_TARGETS
            .iter()
            .any(|name| metadata.target().starts_with(name))
    });

    // spans close with timing so slow pricing runs show up at -dd
    let fmt_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(verbosity >= 2)
        .with_span_events(FmtSpan::CLOSE)
        .with_filter(level)
        .with_filter(target_filter);

    tracing_subscriber::registry().with(fmt_layer).init();
    tracing::info!("log level: {}", level);
}
