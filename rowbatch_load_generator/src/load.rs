//! Drive a write engine with generated rows.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use anyhow::Context;
use rowbatch_clap_blocks::writer::WriterConfig;
use rowbatch_shutdown::wait_for_signal;
use rowbatch_write::{Transport, WriteEngine, mock::MockCodec};
use tokio::{task::JoinSet, time::Instant};
use tracing::{debug, info, warn};

use crate::{
    generator::{RowGenerator, RowShape},
    report::{GroupReporter, Summary},
    simulated::SimulatedTransport,
};

#[derive(Debug, Clone, clap::Parser)]
pub(crate) struct LoadConfig {
    /// Total number of rows to write.
    #[clap(long = "rows", env = "ROWBATCH_LOAD_ROWS", default_value = "100000")]
    pub(crate) rows: u64,

    /// Number of rows submitted together as one group.
    #[clap(
        long = "group-size",
        env = "ROWBATCH_LOAD_GROUP_SIZE",
        default_value = "50"
    )]
    pub(crate) group_size: u64,

    /// Number of distinct rows, or series with `--time-series`, the generated rows address.
    #[clap(long = "keys", env = "ROWBATCH_LOAD_KEYS", default_value = "10000")]
    pub(crate) keys: u64,

    /// Generate time-series points instead of relational rows.
    #[clap(long = "time-series", env = "ROWBATCH_LOAD_TIME_SERIES")]
    pub(crate) time_series: bool,

    /// Number of concurrent submitters, each waiting for its group before submitting the next.
    #[clap(
        long = "concurrency",
        env = "ROWBATCH_LOAD_CONCURRENCY",
        default_value = "16"
    )]
    pub(crate) concurrency: usize,

    /// Share of row attempts the simulated server fails with a transient error, in [0, 1].
    #[clap(
        long = "failure-rate",
        env = "ROWBATCH_LOAD_FAILURE_RATE",
        default_value = "0.0",
        value_parser = parse_probability
    )]
    pub(crate) failure_rate: f64,

    /// Simulated latency of every batch sent.
    #[clap(
        long = "latency",
        env = "ROWBATCH_LOAD_LATENCY",
        value_parser = humantime::parse_duration
    )]
    pub(crate) latency: Option<Duration>,

    /// Seed of the row generators and the simulated server. Random when not set.
    #[clap(long = "seed", env = "ROWBATCH_LOAD_SEED")]
    pub(crate) seed: Option<u64>,
}

fn parse_probability(s: &str) -> Result<f64, String> {
    let p = s.parse::<f64>().map_err(|e| e.to_string())?;
    if (0.0..=1.0).contains(&p) {
        Ok(p)
    } else {
        Err(format!("{p} is not within [0, 1]"))
    }
}

impl LoadConfig {
    fn shape(&self) -> RowShape {
        if self.time_series {
            RowShape::TimeSeries
        } else {
            RowShape::Relational
        }
    }
}

pub(crate) async fn command(config: LoadConfig, writer: WriterConfig) -> anyhow::Result<()> {
    let summary = run(config, writer, wait_for_signal()).await?;
    println!(
        "{}",
        serde_json::to_string_pretty(&summary).context("serializing summary")?
    );
    Ok(())
}

/// Write `config.rows` rows, stopping early once `interrupt` completes, then drain the engine.
pub(crate) async fn run(
    config: LoadConfig,
    writer: WriterConfig,
    interrupt: impl Future<Output = ()> + Send,
) -> anyhow::Result<Summary> {
    let engine_config = writer.engine_config().context("invalid writer config")?;
    let seed = config.seed.unwrap_or_else(rand::random);
    let transport = Arc::new(SimulatedTransport::new(
        config.failure_rate,
        config.latency,
        seed,
    ));
    let engine = Arc::new(
        WriteEngine::new(
            engine_config,
            Arc::new(MockCodec::default()),
            Arc::clone(&transport) as Arc<dyn Transport>,
        )
        .context("starting write engine")?,
    );
    let reporter = Arc::new(GroupReporter::default());
    let remaining = Arc::new(AtomicU64::new(config.rows));

    info!(
        rows = config.rows,
        group_size = config.group_size,
        keys = config.keys,
        time_series = config.time_series,
        concurrency = config.concurrency,
        seed,
        "starting load"
    );

    let started = Instant::now();
    let mut submitters = JoinSet::new();
    for n in 0..config.concurrency.max(1) {
        submitters.spawn(submit_groups(
            Arc::clone(&engine),
            Arc::clone(&reporter),
            Arc::clone(&remaining),
            RowGenerator::new(config.shape(), config.keys, seed.wrapping_add(n as u64 + 1)),
            config.group_size.max(1),
        ));
    }

    let all_submitted = async {
        while let Some(res) = submitters.join_next().await {
            res.context("submitter panicked")?;
        }
        anyhow::Ok(())
    };
    tokio::select! {
        res = all_submitted => res?,
        _ = interrupt => {
            warn!("interrupted, draining queued rows");
            remaining.store(0, Ordering::SeqCst);
        }
    }

    engine.shutdown(true).await;
    // Submitters still waiting on groups are released by the drain.
    while let Some(res) = submitters.join_next().await {
        res.context("submitter panicked")?;
    }

    let elapsed = started.elapsed();
    info!(elapsed = ?elapsed, "load finished");
    Ok(reporter.summary(elapsed, engine.stats(), transport.stats()))
}

async fn submit_groups(
    engine: Arc<WriteEngine>,
    reporter: Arc<GroupReporter>,
    remaining: Arc<AtomicU64>,
    mut generator: RowGenerator,
    group_size: u64,
) {
    loop {
        let Ok(prev) = remaining.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |r| {
            (r > 0).then(|| r.saturating_sub(group_size))
        }) else {
            return;
        };
        let rows = prev.min(group_size) as usize;

        let submitted = Instant::now();
        match engine.submit(generator.next_group(rows)).await {
            Ok(result) => reporter.record(&result, submitted.elapsed()),
            Err(e) => {
                debug!(error = %e, "group abandoned");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    fn configs() -> (LoadConfig, WriterConfig) {
        (
            LoadConfig::parse_from(["rowbatch"]),
            WriterConfig::parse_from(["rowbatch"]),
        )
    }

    #[test]
    fn test_probability() {
        assert_eq!(parse_probability("0.25"), Ok(0.25));
        assert!(parse_probability("1.5").is_err());
        assert!(parse_probability("-0.1").is_err());
        assert!(parse_probability("often").is_err());
    }

    #[tokio::test]
    async fn test_run_writes_every_row() {
        let (mut load, writer) = configs();
        load.rows = 1_000;
        load.group_size = 30;
        load.keys = 100;
        load.concurrency = 4;
        load.seed = Some(3);

        let summary = run(load, writer, std::future::pending()).await.unwrap();

        assert_eq!(summary.rows, 1_000);
        assert_eq!(summary.rows_succeeded, 1_000);
        // 33 full groups and one of 10 rows
        assert_eq!(summary.groups, 34);
        assert_eq!(summary.engine.rows_succeeded(), 1_000);
        assert_eq!(summary.transport.rows, 1_000);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let (mut load, writer) = configs();
        load.rows = 500;
        load.time_series = true;
        load.failure_rate = 0.2;
        load.seed = Some(11);

        let summary = run(load, writer, std::future::pending()).await.unwrap();

        assert_eq!(summary.rows, 500);
        assert_eq!(summary.rows_succeeded + summary.rows_failed, 500);
        assert!(summary.transport.injected_failures > 0);
        assert!(summary.engine.rows_retried() > 0);
        assert!(summary.transport.rows > 500);
    }

    #[tokio::test]
    async fn test_interrupt_stops_submitting() {
        let (mut load, writer) = configs();
        load.rows = u64::MAX;
        load.concurrency = 2;

        let summary = run(
            load,
            writer,
            tokio::time::sleep(Duration::from_millis(200)),
        )
        .await
        .unwrap();

        assert!(summary.rows > 0);
        assert_eq!(summary.rows, summary.rows_succeeded + summary.rows_failed);
    }

    #[tokio::test]
    async fn test_invalid_writer_config() {
        let (load, writer) = configs();
        let writer = WriterConfig {
            bucket_count: 0,
            ..writer
        };
        let err = run(load, writer, std::future::pending()).await.unwrap_err();
        assert!(err.to_string().contains("invalid writer config"), "{err}");
    }
}
