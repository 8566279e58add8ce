use std::path::PathBuf;

use clap::{ArgGroup, Parser};
use metric_consolidator::{
    MetricConsolidator, MetricMap,
    config::{self, Config},
    consolidator, generator,
};
use tokio::{
    runtime::{Builder, Runtime},
    signal,
    sync::mpsc,
    task::{JoinError, JoinSet},
    time::{Duration, sleep},
};
use tracing::{Instrument, debug, error, info, info_span};
use tracing_subscriber::{EnvFilter, util::SubscriberInitExt};

#[derive(thiserror::Error, Debug)]
enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("Failed to load configuration: {0}")]
    Config(#[from] config::Error),
    #[error("Consolidator returned an error: {0}")]
    Consolidator(#[from] consolidator::Error),
    #[error("Generator returned an error: {0}")]
    Generator(#[from] generator::Error),
    #[error("Could not join a spawned task: {0}")]
    Join(#[from] JoinError),
}

fn default_config_path() -> PathBuf {
    PathBuf::from("/etc/consolidator/consolidator.yaml")
}

#[derive(Parser)]
#[clap(version, about, long_about = None)]
#[clap(group(
     ArgGroup::new("experiment-duration")
           .required(false)
           .args(&["experiment_duration_seconds", "experiment_duration_infinite"]),
))]
struct Args {
    /// path on disk to the configuration file
    #[clap(long, default_value_os_t = default_config_path())]
    config_path: PathBuf,
    /// the time, in seconds, to run before shutting down
    #[clap(long, default_value_t = 120)]
    experiment_duration_seconds: u32,
    /// flag to allow infinite experiment duration
    #[clap(long)]
    experiment_duration_infinite: bool,
    /// the maximum time to wait, in seconds, for controlled shutdown
    #[clap(long, default_value_t = 30)]
    max_shutdown_delay: u16,
}

/// Receive flushed batches until every sender is gone, logging a summary of
/// each.
async fn consume(mut sink: mpsc::Receiver<Vec<MetricMap>>) {
    while let Some(batch) = sink.recv().await {
        let spots = batch.len();
        let mm = MetricMap::consolidate(batch);
        info!(
            spots,
            counters = mm.counters().count(),
            gauges = mm.gauges().count(),
            timers = mm.timers().count(),
            sets = mm.sets().count(),
            "batch received"
        );
        for (key, total) in mm.counters() {
            debug!("{key}: {total}");
        }
    }
    debug!("sink closed");
}

async fn inner_main(experiment_duration: Duration, config: Config) -> Result<(), Error> {
    let (shutdown_watcher, shutdown_broadcast) = consolidator_signal::signal();

    let (sink_snd, sink_rcv) = mpsc::channel(config.sink_capacity.get());
    let consumer = tokio::spawn(consume(sink_rcv).instrument(info_span!("sink")));

    let mc = MetricConsolidator::new(config.spots, config.flush_interval(), sink_snd);
    let handle = mc.handle();

    let mut tasks: JoinSet<Result<(), Error>> = JoinSet::new();
    let watcher = shutdown_watcher.clone();
    tasks.spawn(
        async move { mc.run(watcher).await.map_err(Error::from) }
            .instrument(info_span!("flush_loop")),
    );
    if let Some(generator_config) = config.generator {
        let generator =
            generator::Generator::new(&generator_config, &handle, shutdown_watcher.clone());
        tasks.spawn(
            async move { generator.spin().await.map_err(Error::from) }
                .instrument(info_span!("generator")),
        );
    }
    drop(handle);

    // Any watcher left alive here would hold `signal_and_wait` open forever.
    drop(shutdown_watcher);
    let res = tokio::select! {
        () = sleep(experiment_duration) => {
            info!("experiment duration exceeded, signaling for shutdown");
            Ok(())
        }
        _ = signal::ctrl_c() => {
            info!("received ctrl-c");
            Ok(())
        }
        Some(res) = tasks.join_next() => {
            match res {
                Ok(Ok(())) => {
                    debug!("task finished before shutdown");
                    Ok(())
                }
                Ok(Err(err)) => {
                    error!("task shut down unexpectedly: {err}");
                    Err(err)
                }
                Err(err) => Err(Error::Join(err)),
            }
        }
    };
    shutdown_broadcast.signal_and_wait().await;

    while let Some(joined) = tasks.join_next().await {
        joined??;
    }
    consumer.await?;
    res
}

/// The runtime `inner_main` runs on. The ctrl-c handler needs the IO driver.
fn runtime() -> Result<Runtime, std::io::Error> {
    Builder::new_multi_thread()
        .enable_io()
        .enable_time()
        .build()
}

fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_ansi(false)
        .finish()
        .init();

    let version = env!("CARGO_PKG_VERSION");
    info!("Starting consolidator {version} run.");

    let args = Args::parse();
    let config = Config::from_path(&args.config_path)?;
    debug!("loaded configuration: {config:?}");

    let experiment_duration = if args.experiment_duration_infinite {
        Duration::MAX
    } else {
        Duration::from_secs(args.experiment_duration_seconds.into())
    };
    let max_shutdown_delay = Duration::from_secs(args.max_shutdown_delay.into());

    let runtime = runtime()?;
    let res = runtime.block_on(inner_main(experiment_duration, config));
    info!(
        "Shutting down runtime with a {} second delay.",
        max_shutdown_delay.as_secs(),
    );
    runtime.shutdown_timeout(max_shutdown_delay);
    info!("Bye. :)");
    res
}
