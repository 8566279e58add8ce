//! The [`MetricMap`] accumulator.
//!
//! A `MetricMap` aggregates [`Metric`] events by [`Key`] for one flush
//! interval. Four kinds are supported and each has its own rule for
//! `receive` and for `merge`.
//!
//! ## Counters
//!
//! A counter event `Counter(k, v, r)` with sample rate `r` adds `v / r` to
//! `k`. Merging two maps sums counters key by key. Both operations are
//! associative and commutative up to floating point rounding.
//!
//! ## Gauges
//!
//! A gauge event sets `k`, the last write wins. When merging, the incoming
//! map's gauge wins. Since the consolidator assigns producers to maps in no
//! particular order the surviving gauge after consolidation is one of the
//! values written in the interval, not necessarily the latest.
//!
//! ## Timers
//!
//! A timer event appends its sample to `k` and increases the sampled count by
//! `1 / r`. Merging concatenates samples and sums counts.
//!
//! ## Sets
//!
//! A set event inserts its member into `k`. Merging is set union.

use rustc_hash::{FxHashMap, FxHashSet};

use crate::{
    accumulator::Accumulator,
    metric::{Key, Metric, MetricValue},
};

/// Aggregated timer samples for a single [`Key`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Timer {
    /// Every sample received, in arrival order per map
    pub values: Vec<f64>,
    /// Number of events this timer represents once sample rates are applied
    pub count: f64,
}

impl Timer {
    fn merge(&mut self, other: Timer) {
        self.values.extend(other.values);
        self.count += other.count;
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
/// Mutable per-interval aggregation of [`Metric`] events.
pub struct MetricMap {
    counters: FxHashMap<Key, f64>,
    gauges: FxHashMap<Key, f64>,
    timers: FxHashMap<Key, Timer>,
    sets: FxHashMap<Key, FxHashSet<String>>,
}

impl MetricMap {
    /// Create a new, empty [`MetricMap`]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge every map in `batch` into a single map.
    #[must_use]
    pub fn consolidate<I>(batch: I) -> Self
    where
        I: IntoIterator<Item = MetricMap>,
    {
        let mut consolidated = Self::new();
        for mm in batch {
            consolidated.merge(mm);
        }
        consolidated
    }

    /// Fold one metric event into the map
    pub fn receive(&mut self, metric: Metric) {
        let rate = metric.effective_sample_rate();
        let Metric { key, value, .. } = metric;

        match value {
            MetricValue::Counter(v) => {
                *self.counters.entry(key).or_default() += v / rate;
            }
            MetricValue::Gauge(v) => {
                self.gauges.insert(key, v);
            }
            MetricValue::Timer(v) => {
                let timer = self.timers.entry(key).or_default();
                timer.values.push(v);
                timer.count += 1.0 / rate;
            }
            MetricValue::Set(member) => {
                self.sets.entry(key).or_default().insert(member);
            }
        }
    }

    /// Fold all of `other` into this map
    pub fn merge(&mut self, other: MetricMap) {
        let MetricMap {
            counters,
            gauges,
            timers,
            sets,
        } = other;

        for (key, v) in counters {
            *self.counters.entry(key).or_default() += v;
        }
        self.gauges.extend(gauges);
        for (key, timer) in timers {
            self.timers.entry(key).or_default().merge(timer);
        }
        for (key, members) in sets {
            self.sets.entry(key).or_default().extend(members);
        }
    }

    /// The counter total for `key`, if any
    #[must_use]
    pub fn counter(&self, key: &Key) -> Option<f64> {
        self.counters.get(key).copied()
    }

    /// The gauge value for `key`, if any
    #[must_use]
    pub fn gauge(&self, key: &Key) -> Option<f64> {
        self.gauges.get(key).copied()
    }

    /// The timer samples for `key`, if any
    #[must_use]
    pub fn timer(&self, key: &Key) -> Option<&Timer> {
        self.timers.get(key)
    }

    /// The set members for `key`, if any
    #[must_use]
    pub fn set(&self, key: &Key) -> Option<&FxHashSet<String>> {
        self.sets.get(key)
    }

    /// Iterate every counter
    pub fn counters(&self) -> impl Iterator<Item = (&Key, f64)> {
        self.counters.iter().map(|(k, v)| (k, *v))
    }

    /// Iterate every gauge
    pub fn gauges(&self) -> impl Iterator<Item = (&Key, f64)> {
        self.gauges.iter().map(|(k, v)| (k, *v))
    }

    /// Iterate every timer
    pub fn timers(&self) -> impl Iterator<Item = (&Key, &Timer)> {
        self.timers.iter()
    }

    /// Iterate every set
    pub fn sets(&self) -> impl Iterator<Item = (&Key, &FxHashSet<String>)> {
        self.sets.iter()
    }

    /// Total number of distinct metrics held, across all kinds
    #[must_use]
    pub fn len(&self) -> usize {
        self.counters.len() + self.gauges.len() + self.timers.len() + self.sets.len()
    }

    /// Whether the map holds no metrics at all
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Accumulator for MetricMap {
    type Event = Metric;

    fn receive(&mut self, event: Metric) {
        MetricMap::receive(self, event);
    }

    fn merge(&mut self, other: Self) {
        MetricMap::merge(self, other);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn key(name: &str) -> Key {
        Key::new(name, &[])
    }

    #[test]
    fn counter_applies_sample_rate() {
        let mut mm = MetricMap::new();
        mm.receive(Metric::counter("x", &[], 1.0).with_sample_rate(0.5));
        mm.receive(Metric::counter("x", &[], 3.0));
        assert_eq!(mm.counter(&key("x")), Some(5.0));
        assert_eq!(mm.len(), 1);
    }

    #[test]
    fn gauge_last_write_wins() {
        let mut mm = MetricMap::new();
        mm.receive(Metric::gauge("g", &["a"], 1.0));
        mm.receive(Metric::gauge("g", &["a"], 7.0));
        assert_eq!(mm.gauge(&Key::new("g", &["a"])), Some(7.0));

        let mut other = MetricMap::new();
        other.receive(Metric::gauge("g", &["a"], 2.0));
        mm.merge(other);
        assert_eq!(mm.gauge(&Key::new("g", &["a"])), Some(2.0));
    }

    #[test]
    fn timer_collects_samples() {
        let mut mm = MetricMap::new();
        mm.receive(Metric::timer("t", &[], 10.0));
        mm.receive(Metric::timer("t", &[], 20.0).with_sample_rate(0.1));

        let timer = mm.timer(&key("t")).unwrap();
        assert_eq!(timer.values, vec![10.0, 20.0]);
        assert!((timer.count - 11.0).abs() < 1e-9);
    }

    #[test]
    fn set_is_union() {
        let mut a = MetricMap::new();
        a.receive(Metric::set("users", &[], "alice"));
        a.receive(Metric::set("users", &[], "bob"));
        let mut b = MetricMap::new();
        b.receive(Metric::set("users", &[], "bob"));
        b.receive(Metric::set("users", &[], "carol"));

        a.merge(b);
        assert_eq!(a.set(&key("users")).map(FxHashSet::len), Some(3));
    }

    #[test]
    fn tag_order_is_one_identity() {
        let mut mm = MetricMap::new();
        mm.receive(Metric::counter("x", &["a", "b"], 1.0));
        mm.receive(Metric::counter("x", &["b", "a"], 1.0));
        assert_eq!(mm.len(), 1);
        assert_eq!(mm.counter(&Key::new("x", &["a", "b"])), Some(2.0));
    }

    #[test]
    fn consolidate_empty_batch() {
        let mm = MetricMap::consolidate(vec![MetricMap::new(), MetricMap::new()]);
        assert!(mm.is_empty());
    }

    fn counter_events() -> impl Strategy<Value = Vec<(u8, u16)>> {
        prop::collection::vec((0u8..8, 0u16..1000), 0..200)
    }

    proptest! {
        // However events are split across maps the consolidated counters are
        // the same as receiving every event into a single map. Integral values
        // keep the f64 sums exact.
        #[test]
        fn split_then_merge_matches_single_map(
            events in counter_events(),
            splits in prop::collection::vec(0usize..4, 0..200),
        ) {
            let mut single = MetricMap::new();
            let mut parts: Vec<MetricMap> = (0..4).map(|_| MetricMap::new()).collect();

            for (i, (name, value)) in events.iter().enumerate() {
                let metric = Metric::counter(format!("c{name}"), &[], f64::from(*value));
                single.receive(metric.clone());
                let idx = splits.get(i).copied().unwrap_or(0);
                parts[idx].receive(metric);
            }

            let merged = MetricMap::consolidate(parts);
            prop_assert_eq!(merged.len(), single.len());
            for (k, v) in single.counters() {
                prop_assert_eq!(merged.counter(k), Some(v));
            }
        }

        #[test]
        fn merge_order_does_not_change_sets(
            a in prop::collection::vec(0u8..16, 0..32),
            b in prop::collection::vec(0u8..16, 0..32),
        ) {
            let build = |members: &[u8]| {
                let mut mm = MetricMap::new();
                for m in members {
                    mm.receive(Metric::set("s", &[], m.to_string()));
                }
                mm
            };

            let mut ab = build(&a);
            ab.merge(build(&b));
            let mut ba = build(&b);
            ba.merge(build(&a));

            prop_assert_eq!(ab.set(&key("s")), ba.set(&key("s")));
        }
    }
}
