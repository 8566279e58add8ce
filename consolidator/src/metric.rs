//! Metric events received by [`crate::MetricMap`].

use std::fmt;

/// Identity of a metric: its name plus a normalized tag set.
///
/// Tags are sorted and de-duplicated on construction so that `a,b` and `b,a`
/// name the same metric.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Key {
    name: String,
    tags: Vec<String>,
}

impl Key {
    /// Create a new [`Key`]
    #[must_use]
    pub fn new(name: impl Into<String>, tags: &[&str]) -> Self {
        let mut tags: Vec<String> = tags.iter().map(|t| (*t).to_string()).collect();
        tags.sort_unstable();
        tags.dedup();
        Self {
            name: name.into(),
            tags,
        }
    }

    /// The metric name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The sorted, de-duplicated tags
    #[must_use]
    pub fn tags(&self) -> &[String] {
        &self.tags
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        write!(f, "{}", self.name)?;
        if !self.tags.is_empty() {
            write!(f, "|#{}", self.tags.join(","))?;
        }
        Ok(())
    }
}

/// The value carried by a single [`Metric`] event.
#[derive(Debug, Clone, PartialEq)]
pub enum MetricValue {
    /// Counter increment
    Counter(f64),
    /// Gauge set
    Gauge(f64),
    /// Timer sample
    Timer(f64),
    /// Set member
    Set(String),
}

/// A single metric event.
#[derive(Debug, Clone, PartialEq)]
pub struct Metric {
    /// Identity of the metric
    pub key: Key,
    /// The event payload
    pub value: MetricValue,
    /// Fraction of events the producer actually sent, in `(0, 1]`.
    pub sample_rate: f64,
}

impl Metric {
    fn new(name: impl Into<String>, tags: &[&str], value: MetricValue) -> Self {
        Self {
            key: Key::new(name, tags),
            value,
            sample_rate: 1.0,
        }
    }

    /// Create a counter increment
    #[must_use]
    pub fn counter(name: impl Into<String>, tags: &[&str], value: f64) -> Self {
        Self::new(name, tags, MetricValue::Counter(value))
    }

    /// Create a gauge set
    #[must_use]
    pub fn gauge(name: impl Into<String>, tags: &[&str], value: f64) -> Self {
        Self::new(name, tags, MetricValue::Gauge(value))
    }

    /// Create a timer sample
    #[must_use]
    pub fn timer(name: impl Into<String>, tags: &[&str], value: f64) -> Self {
        Self::new(name, tags, MetricValue::Timer(value))
    }

    /// Create a set membership event
    #[must_use]
    pub fn set(name: impl Into<String>, tags: &[&str], member: impl Into<String>) -> Self {
        Self::new(name, tags, MetricValue::Set(member.into()))
    }

    /// Mark this event as sampled at `sample_rate`
    #[must_use]
    pub fn with_sample_rate(mut self, sample_rate: f64) -> Self {
        self.sample_rate = sample_rate;
        self
    }

    /// The sample rate used for aggregation. Anything outside of `(0, 1]`,
    /// including NaN, is treated as unsampled.
    pub(crate) fn effective_sample_rate(&self) -> f64 {
        if self.sample_rate > 0.0 && self.sample_rate <= 1.0 {
            self.sample_rate
        } else {
            1.0
        }
    }
}
