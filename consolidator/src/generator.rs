//! Synthetic metric load for the consolidator.
//!
//! The generator spawns `producers` workers, each pushing randomly built
//! batches of [`Metric`] into a [`Handle`] at a fixed rate until shutdown.
//! Every worker derives its own RNG from the configured seed so a run is
//! reproducible with respect to what is sent, if not to which accumulator it
//! lands in.
//!
//! ## Metrics
//!
//! `generated_batches`: Batches handed to the consolidator
//!

use std::{
    num::{NonZeroU32, NonZeroUsize},
    time::Duration,
};

use consolidator_signal::Watcher;
use metrics::counter;
use rand::{Rng, SeedableRng, rngs::StdRng};
use serde::Deserialize;
use tokio::{
    task::{JoinError, JoinSet},
    time::{self, MissedTickBehavior},
};
use tracing::{debug, info};

use crate::{Handle, Metric, MetricMap, consolidator};

const ENVIRONMENTS: [&str; 3] = ["env:prod", "env:staging", "env:dev"];

#[derive(Debug, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(deny_unknown_fields)]
/// Configuration of the generator.
pub struct Config {
    /// The seed for random operations
    pub seed: [u8; 32],
    /// The number of concurrent producers
    pub producers: NonZeroUsize,
    /// The number of metrics in every batch
    pub batch_size: NonZeroUsize,
    /// The number of distinct metric names to draw from
    pub metric_names: NonZeroU32,
    /// The rate at which each producer submits batches
    pub batches_per_second: NonZeroU32,
}

#[derive(thiserror::Error, Debug)]
/// Errors produced by [`Generator`].
pub enum Error {
    /// The consolidator refused a batch.
    #[error("Consolidator error: {0}")]
    Consolidator(#[from] consolidator::Error),
    /// Child sub-task error.
    #[error("Child join error: {0}")]
    Child(JoinError),
}

/// Build one batch of random metrics.
pub(crate) fn batch<R>(rng: &mut R, config: &Config) -> Vec<Metric>
where
    R: Rng,
{
    let names = config.metric_names.get();
    (0..config.batch_size.get())
        .map(|_| {
            let name = format!("consolidator.synthetic.{}", rng.random_range(0..names));
            let tags = [ENVIRONMENTS[rng.random_range(0..ENVIRONMENTS.len())]];
            let value = f64::from(rng.random_range(0..100u32));
            match rng.random_range(0..4u8) {
                0 => Metric::counter(name, &tags, value),
                1 => Metric::gauge(name, &tags, value),
                2 => Metric::timer(name, &tags, value),
                _ => Metric::set(name, &tags, format!("member-{value}")),
            }
        })
        .collect()
}

#[derive(Debug)]
/// The synthetic load generator.
pub struct Generator {
    handles: JoinSet<Result<(), Error>>,
    shutdown: Watcher,
}

impl Generator {
    /// Create a new [`Generator`] instance, spawning its producers.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn new(config: &Config, handle: &Handle<MetricMap>, shutdown: Watcher) -> Self {
        let mut rng = StdRng::from_seed(config.seed);
        let period = (Duration::from_secs(1) / config.batches_per_second.get())
            .max(Duration::from_micros(1));

        let mut handles = JoinSet::new();
        for id in 0..config.producers.get() {
            let worker = Producer {
                id,
                rng: StdRng::from_seed(rng.random()),
                config: *config,
                period,
                handle: handle.clone(),
                shutdown: shutdown.clone(),
            };
            handles.spawn(worker.spin());
        }

        Self { handles, shutdown }
    }

    /// Run [`Generator`] until a shutdown signal is received.
    ///
    /// # Errors
    ///
    /// Function will return an error if any producer fails.
    pub async fn spin(mut self) -> Result<(), Error> {
        self.shutdown.recv().await;
        info!("shutdown signal received");

        while let Some(res) = self.handles.join_next().await {
            match res {
                Ok(Ok(())) => {}
                Ok(Err(err)) => return Err(err),
                Err(err) => return Err(Error::Child(err)),
            }
        }
        Ok(())
    }
}

struct Producer {
    id: usize,
    rng: StdRng,
    config: Config,
    period: Duration,
    handle: Handle<MetricMap>,
    shutdown: Watcher,
}

impl Producer {
    async fn spin(mut self) -> Result<(), Error> {
        let mut ticker = time::interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let shutdown_wait = self.shutdown.recv();
        tokio::pin!(shutdown_wait);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let metrics = batch(&mut self.rng, &self.config);
                    self.handle.receive_metrics(metrics).await?;
                    counter!("generated_batches").increment(1);
                }
                () = &mut shutdown_wait => {
                    debug!("producer {id} shutting down", id = self.id);
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;
    use crate::MetricConsolidator;

    fn config(producers: usize) -> Config {
        Config {
            seed: [7; 32],
            producers: NonZeroUsize::new(producers).unwrap(),
            batch_size: NonZeroUsize::new(8).unwrap(),
            metric_names: NonZeroU32::new(4).unwrap(),
            batches_per_second: NonZeroU32::new(10).unwrap(),
        }
    }

    #[test]
    fn batch_is_deterministic() {
        let config = config(1);
        let a = batch(&mut StdRng::from_seed(config.seed), &config);
        let b = batch(&mut StdRng::from_seed(config.seed), &config);
        assert_eq!(a, b);
        assert_eq!(a.len(), 8);
    }

    #[test]
    fn batch_respects_name_space() {
        let config = config(1);
        let mut rng = StdRng::from_seed(config.seed);
        for _ in 0..16 {
            for metric in batch(&mut rng, &config) {
                let suffix = metric
                    .key
                    .name()
                    .strip_prefix("consolidator.synthetic.")
                    .unwrap();
                assert!(suffix.parse::<u32>().unwrap() < 4);
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn producers_feed_the_pool_until_shutdown() {
        let (tx, mut rx) = mpsc::channel(1);
        let mut mc =
            MetricConsolidator::new(NonZeroUsize::new(2).unwrap(), Duration::from_secs(60), tx);
        let (watcher, broadcaster) = consolidator_signal::signal();

        let generator = Generator::new(&config(3), &mc.handle(), watcher);
        let spin = tokio::spawn(generator.spin());

        time::sleep(Duration::from_millis(950)).await;
        broadcaster.signal_and_wait().await;
        spin.await.unwrap().unwrap();

        mc.flush().await.unwrap();
        let consolidated = MetricMap::consolidate(rx.recv().await.unwrap());
        assert!(!consolidated.is_empty());
    }
}
