//! Consolidate metrics from many producers into a fixed set of accumulators.
//!
//! [`MetricConsolidator`] owns a pool of `spots` accumulators. Producers borrow
//! one accumulator at a time through a [`Handle`], fold their metrics into it
//! and hand it back, so up to `spots` producers proceed in parallel and no two
//! ever mutate the same accumulator. Which producer lands in which accumulator
//! is up to queue order. Consolidates metrics such as:
//!
//! ```text
//! counter[name=x, value=1]
//! counter[name=x, value=1]
//! counter[name=x, value=1]
//! ```
//!
//! into `counter[name=x, value=3]`, spread across at most `spots` maps.
//!
//! Periodically, or when asked, the consolidator drains every accumulator,
//! sends the batch to the sink and refills the pool with fresh accumulators.
//! The sink send happens between the drain and the refill: a sink that cannot
//! keep up holds the pool empty and producers wait. That is the backpressure
//! path, there is no other buffering.
//!
//! Drain, fill and flush require `&mut self` and [`MetricConsolidator::run`]
//! consumes the consolidator, so only one flush cycle is ever in flight.
//!
//! ## Metrics
//!
//! `batches_flushed`: Batches accepted by the sink
//! `drains_cancelled`: Cancelled drains, each one rolled back
//! `metrics_received`: Events folded in through `receive_metrics`
//! `metric_maps_merged`: Accumulators folded in through `receive_metric_map`
//!

use std::{future, num::NonZeroUsize, sync::Arc, time::Duration};

use consolidator_signal::Watcher;
use metrics::counter;
use tokio::{
    sync::mpsc,
    time::{self, Instant, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use crate::{accumulator::Accumulator, pool};

/// Errors produced by [`MetricConsolidator`] and [`Handle`].
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The pool's channel closed. Cannot happen while the consolidator lives.
    #[error("accumulator pool closed")]
    Closed,
    /// An accumulator was returned to a pool with no free slot.
    #[error("accumulator pool is already at capacity")]
    Overfull,
    /// Fill was called on a pool that still holds its accumulators.
    #[error("fill called without a preceding drain")]
    NotDrained,
    /// Drain was called on a pool that has already been drained.
    #[error("drain called on an already drained pool")]
    Drained,
    /// The sink's receiver has been dropped.
    #[error("sink closed, batch discarded")]
    SinkClosed,
    /// The flush loop cannot tick with a zero period.
    #[error("flush interval must be greater than zero")]
    ZeroFlushInterval,
}

impl From<pool::Error> for Error {
    fn from(err: pool::Error) -> Self {
        match err {
            pool::Error::Closed => Error::Closed,
            pool::Error::Overfull => Error::Overfull,
        }
    }
}

/// Producer-side access to a [`MetricConsolidator`].
///
/// Cheap to clone. A `Handle` can only receive, never drain or flush.
#[derive(Debug)]
pub struct Handle<M> {
    pool: Arc<pool::Pool<M>>,
}

impl<M> Clone for Handle<M> {
    fn clone(&self) -> Self {
        Self {
            pool: Arc::clone(&self.pool),
        }
    }
}

impl<M> Handle<M>
where
    M: Accumulator,
{
    /// Fold `events` into one of the pooled accumulators.
    ///
    /// Waits while every accumulator is checked out or while the pool is
    /// drained and not yet refilled.
    ///
    /// # Errors
    ///
    /// Returns an error only if the pool itself is broken, see [`Error`].
    pub async fn receive_metrics<I>(&self, events: I) -> Result<(), Error>
    where
        I: IntoIterator<Item = M::Event>,
    {
        let mut mm = self.pool.take().await?;
        let mut total = 0;
        for event in events {
            mm.receive(event);
            total += 1;
        }
        self.pool.put(mm)?;

        counter!("metrics_received").increment(total);
        Ok(())
    }

    /// Merge `other` into one of the pooled accumulators.
    ///
    /// Waits under the same conditions as [`Handle::receive_metrics`].
    ///
    /// # Errors
    ///
    /// Returns an error only if the pool itself is broken, see [`Error`].
    pub async fn receive_metric_map(&self, other: M) -> Result<(), Error> {
        let mut mm = self.pool.take().await?;
        mm.merge(other);
        self.pool.put(mm)?;

        counter!("metric_maps_merged").increment(1);
        Ok(())
    }
}

#[derive(Debug)]
/// A fixed-capacity pool of accumulators with a drain/fill/flush protocol.
pub struct MetricConsolidator<M> {
    handle: Handle<M>,
    sink: mpsc::Sender<Vec<M>>,
    flush_interval: Duration,
    /// `true` between a successful drain and the next fill.
    drained: bool,
}

impl<M> MetricConsolidator<M>
where
    M: Accumulator,
{
    /// Create a new [`MetricConsolidator`] holding `spots` fresh accumulators.
    ///
    /// Batches of exactly `spots` accumulators are sent to `sink` every
    /// `flush_interval` once [`MetricConsolidator::run`] is called, or on every
    /// call to [`MetricConsolidator::flush`].
    #[must_use]
    pub fn new(spots: NonZeroUsize, flush_interval: Duration, sink: mpsc::Sender<Vec<M>>) -> Self {
        let mut mc = Self {
            handle: Handle {
                pool: Arc::new(pool::Pool::new(spots)),
            },
            sink,
            flush_interval,
            drained: true,
        };
        let filled = mc.fill();
        debug_assert!(filled.is_ok(), "a new pool has room for every spot");
        mc
    }

    /// A producer handle onto this consolidator's pool.
    #[must_use]
    pub fn handle(&self) -> Handle<M> {
        self.handle.clone()
    }

    /// The fixed number of accumulators in every batch.
    #[must_use]
    pub fn spots(&self) -> NonZeroUsize {
        self.handle.pool.spots()
    }

    /// The period of [`MetricConsolidator::run`].
    #[must_use]
    pub fn flush_interval(&self) -> Duration {
        self.flush_interval
    }

    /// See [`Handle::receive_metrics`].
    ///
    /// # Errors
    ///
    /// Returns an error only if the pool itself is broken, see [`Error`].
    pub async fn receive_metrics<I>(&self, events: I) -> Result<(), Error>
    where
        I: IntoIterator<Item = M::Event>,
    {
        self.handle.receive_metrics(events).await
    }

    /// See [`Handle::receive_metric_map`].
    ///
    /// # Errors
    ///
    /// Returns an error only if the pool itself is broken, see [`Error`].
    pub async fn receive_metric_map(&self, other: M) -> Result<(), Error> {
        self.handle.receive_metric_map(other).await
    }

    /// Flush on every `flush_interval` until `shutdown` fires, then flush one
    /// last time and return. `shutdown` is held until that final flush is
    /// done, so [`consolidator_signal::Broadcaster::signal_and_wait`] returns
    /// only after it.
    ///
    /// Ticks missed while a flush is stalled on the sink are skipped, not
    /// replayed.
    ///
    /// If the sink closes the loop stops with [`Error::SinkClosed`] and
    /// nothing flushes again. Producers can still receive into the refilled
    /// pool but that data is never delivered.
    ///
    /// # Errors
    ///
    /// Returns the first error produced by [`MetricConsolidator::flush`], or
    /// [`Error::ZeroFlushInterval`] if the period is zero.
    pub async fn run(mut self, mut shutdown: Watcher) -> Result<(), Error> {
        let period = self.flush_interval;
        if period.is_zero() {
            return Err(Error::ZeroFlushInterval);
        }

        let mut ticker = time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let shutdown_wait = shutdown.recv();
        tokio::pin!(shutdown_wait);
        loop {
            tokio::select! {
                biased;

                () = &mut shutdown_wait => {
                    info!("shutdown signal received");
                    self.flush().await?;
                    return Ok(());
                }
                _ = ticker.tick() => {
                    self.flush().await?;
                }
            }
        }
    }

    /// Drain every accumulator, send them to the sink as one batch, then
    /// refill the pool.
    ///
    /// The send waits while the sink is full, and the pool stays empty until
    /// it completes.
    ///
    /// # Cancel safety
    ///
    /// Cancel safe. If the future is dropped before the sink accepts the
    /// batch, every accumulator goes back to the pool with its data and the
    /// consolidator is as it was before the call.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Drained`] if the pool is already drained, or
    /// [`Error::SinkClosed`] if the sink's receiver is gone. In the latter case
    /// the batch is discarded but the pool is still refilled.
    pub async fn flush(&mut self) -> Result<(), Error> {
        if self.drained {
            return Err(Error::Drained);
        }

        let Some(checkout) = self.handle.pool.take_all(future::pending()).await? else {
            unreachable!("a pending future never resolves");
        };
        let total = checkout.len();

        // The pool stays empty while we wait for room in the sink. Dropped
        // here, the checkout puts every accumulator back.
        let permit = self.sink.reserve().await;
        let batch = checkout.into_inner();
        self.drained = true;

        let sent = permit.map(|permit| permit.send(batch)).is_ok();
        self.fill()?;

        if !sent {
            warn!("sink closed, discarding batch of {total} metric maps");
            return Err(Error::SinkClosed);
        }
        counter!("batches_flushed").increment(1);
        debug!("flushed batch of {total} metric maps");
        Ok(())
    }

    /// Take every accumulator out of the pool, waiting for checked-out ones to
    /// be returned.
    ///
    /// The pool is left empty and producers wait until
    /// [`MetricConsolidator::fill`] is called.
    ///
    /// # Cancel safety
    ///
    /// Cancel safe. Dropping the future puts back every accumulator taken so
    /// far and the pool stays undrained.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Drained`] if the pool is already drained.
    pub async fn drain(&mut self) -> Result<Vec<M>, Error> {
        match self.drain_with_cancel(future::pending()).await? {
            Some(batch) => Ok(batch),
            None => unreachable!("a pending future never resolves"),
        }
    }

    /// As [`MetricConsolidator::drain`] but gives up when `cancel` resolves.
    ///
    /// On cancellation every accumulator collected so far is put back, the
    /// pool is exactly as it was before the call and `None` is returned. An
    /// already resolved `cancel` always yields `None`. `cancel` is honoured
    /// while waiting behind a producer for access to the pool as well as while
    /// waiting for checked-out accumulators.
    ///
    /// # Cancel safety
    ///
    /// Cancel safe, dropping the future has the same effect as `cancel`
    /// resolving.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Drained`] if the pool is already drained.
    pub async fn drain_with_cancel<F>(&mut self, cancel: F) -> Result<Option<Vec<M>>, Error>
    where
        F: future::Future<Output = ()>,
    {
        if self.drained {
            return Err(Error::Drained);
        }

        let batch = self
            .handle
            .pool
            .take_all(cancel)
            .await?
            .map(pool::Checkout::into_inner);
        if batch.is_some() {
            self.drained = true;
        } else {
            counter!("drains_cancelled").increment(1);
            debug!("drain cancelled, accumulators returned to pool");
        }
        Ok(batch)
    }

    /// Refill a drained pool with fresh accumulators.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotDrained`] if the pool has not been drained since
    /// the last fill. The pool is untouched in that case.
    pub fn fill(&mut self) -> Result<(), Error> {
        if !self.drained {
            return Err(Error::NotDrained);
        }

        for _ in 0..self.spots().get() {
            self.handle.pool.put(M::default())?;
        }
        self.drained = false;
        Ok(())
    }
}
