//! Entrypoint of the rowbatch load generator
//!
//! Drives a write engine against a simulated server and prints a JSON summary of the run.

use rowbatch_clap_blocks::{logging::LoggingConfig, tokio::TokioRuntimeConfig, writer::WriterConfig};

mod generator;
mod load;
mod report;
mod simulated;

enum ReturnCode {
    Failure = 1,
}

#[derive(Debug, clap::Parser)]
#[clap(
    name = "rowbatch_load_generator",
    about = "Write engine load generator",
    long_about = r#"Write engine load generator

Submits randomly generated rows to a write engine backed by a simulated server, then
drains the engine and prints a JSON summary of the run to stdout.

Examples:
    # Write one million relational rows in groups of 100
    rowbatch_load_generator --rows 1000000 --group-size 100

    # Write time-series points with 10% transient failures and 5ms of server latency
    rowbatch_load_generator --time-series --failure-rate 0.1 --latency 5ms

    # Use parallel buckets and debug logging
    rowbatch_load_generator --write-mode parallel -vv
"#
)]
struct Config {
    #[clap(flatten)]
    runtime_config: TokioRuntimeConfig,

    #[clap(flatten)]
    logging_config: LoggingConfig,

    #[clap(flatten)]
    writer_config: WriterConfig,

    #[clap(flatten)]
    load_config: load::LoadConfig,
}

fn main() -> Result<(), std::io::Error> {
    let config: Config = clap::Parser::parse();

    let tokio_runtime = config.runtime_config.builder()?.build()?;
    tokio_runtime.block_on(async move {
        if let Err(e) = config.logging_config.install_global_subscriber("info") {
            eprintln!("Initializing logs failed: {e}");
            std::process::exit(ReturnCode::Failure as _);
        }

        if let Err(e) = load::command(config.load_config, config.writer_config).await {
            eprintln!("Load generation failed: {e:#}");
            std::process::exit(ReturnCode::Failure as _);
        }
    });

    Ok(())
}
