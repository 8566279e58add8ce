//! The accumulator contract consumed by the consolidator.
//!
//! The consolidator does not know what an accumulator stores. It needs to make
//! fresh ones, fold single events into them and fold whole accumulators into
//! them. [`crate::MetricMap`] is the implementation shipped with this crate.

/// A mutable per-interval aggregation of events.
///
/// `Default` must produce an empty accumulator; the consolidator uses it to
/// refill its pool after every drain.
pub trait Accumulator: Default + Send + 'static {
    /// The single event folded in by [`Accumulator::receive`].
    type Event: Send;

    /// Fold one event into this accumulator.
    fn receive(&mut self, event: Self::Event);

    /// Fold all of `other`'s state into this accumulator.
    fn merge(&mut self, other: Self);
}
