//! CLI entrypoint for the review harvester.

use std::io::{self, Write};
use std::process::ExitCode;

use chrono::Utc;
use clap::Parser;
use lichen::config::{self, Cli};
use lichen::error::HarvestError;
use lichen::review::wip;
use lichen::{aggregate, output};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            if writeln!(io::stderr().lock(), "{error}").is_err() {
                return ExitCode::FAILURE;
            }
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<(), HarvestError> {
    let cli = Cli::parse();
    let file = config::load_file(&cli.config_path())?;
    let settings = config::merge(&cli, file);
    init_tracing(settings.debug);
    settings.validate()?;
    let tls = settings.tls_policy()?;

    let now = Utc::now();
    let context = settings.fetch_context(now)?;
    let targets = aggregate::build_targets(&settings.git_services, &tls)?;
    let mut reviews = aggregate::harvest_all(&targets, &context).await?;
    if settings.ignore_wip {
        wip::remove_wip(&mut reviews);
    }
    aggregate::sort_reviews(&mut reviews, settings.sort, settings.reverse);
    output::deliver(&settings, &reviews, now).await
}

/// Route log events to stderr, raising the filter when `--debug` is set.
fn init_tracing(debug: bool) {
    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(filter)
        .init();
}
